//! 外部事件信封

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StepWeaveError};

/// 事件信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// 事件名称 (如 `test/hello-world`)
    pub name: String,
    /// 事件载荷 (JSON 对象)
    pub data: Value,
    /// 接收时间
    pub received_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// 创建新的事件信封
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            received_at: Utc::now(),
        }
    }

    /// 设置接收时间
    pub fn received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    /// 从原始 JSON 请求体解析
    ///
    /// `name` 必须是非空字符串；`data` 缺省或为 `null` 时视为 `{}`，
    /// 其它非对象值视为非法事件。
    pub fn from_json(body: &Value, received_at: DateTime<Utc>) -> Result<Self> {
        let obj = body
            .as_object()
            .ok_or_else(|| StepWeaveError::InvalidEvent("event body must be a JSON object".into()))?;

        let name = match obj.get("name") {
            Some(Value::String(name)) => name.clone(),
            Some(_) => {
                return Err(StepWeaveError::InvalidEvent("`name` must be a string".into()));
            }
            None => return Err(StepWeaveError::InvalidEvent("missing `name`".into())),
        };

        let data = match obj.get("data") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(Value::Object(data)) => Value::Object(data.clone()),
            Some(_) => {
                return Err(StepWeaveError::InvalidEvent("`data` must be a JSON object".into()));
            }
        };

        let envelope = Self {
            name,
            data,
            received_at,
        };
        envelope.validate()?;
        Ok(envelope)
    }

    /// 校验信封
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(StepWeaveError::InvalidEvent("`name` must not be empty".into()));
        }
        Ok(())
    }
}
