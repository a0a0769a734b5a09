//! 执行实例定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::event::EventEnvelope;

/// 执行实例 ID 类型别名
pub type ExecutionId = Uuid;

/// 执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// 正在运行 (或等待工作池调度)
    Running,
    /// 在睡眠步骤处挂起
    Sleeping,
    /// 已完成
    Completed,
    /// 已失败 (含取消)
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Sleeping => "sleeping",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "sleeping" => Ok(ExecutionStatus::Sleeping),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// 执行实例: 一次事件触发的一次函数运行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInstance {
    /// 实例 ID
    pub id: ExecutionId,
    /// 函数 ID (非拥有引用)
    pub function_id: String,
    /// 触发事件
    pub event: EventEnvelope,
    /// 当前状态
    pub status: ExecutionStatus,
    /// 最终结果 (仅 Completed)
    pub output: Option<serde_json::Value>,
    /// 失败原因 (仅 Failed)
    pub error: Option<ExecutionError>,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 更新时间
    pub updated_at: DateTime<Utc>,
}

impl ExecutionInstance {
    /// 创建新的执行实例
    pub fn new(function_id: impl Into<String>, event: EventEnvelope, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            function_id: function_id.into(),
            event,
            status: ExecutionStatus::Running,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 转换状态
    pub fn transition(&mut self, status: ExecutionStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }

    /// 标记完成
    pub fn complete(&mut self, output: serde_json::Value, now: DateTime<Utc>) {
        self.output = Some(output);
        self.error = None;
        self.transition(ExecutionStatus::Completed, now);
    }

    /// 标记失败
    pub fn fail(&mut self, error: ExecutionError, now: DateTime<Utc>) {
        self.error = Some(error);
        self.transition(ExecutionStatus::Failed, now);
    }
}
