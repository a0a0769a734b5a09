//! 步骤记录与睡眠票据

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::ExecutionId;

/// 终结步骤名: 函数体返回值作为最后一条步骤记录
pub const OUTPUT_STEP: &str = "$output";

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// 等待中 (睡眠步骤尚未到期)
    Pending,
    /// 已完成
    Completed,
    /// 已失败 (步骤超时)
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

/// 步骤记录，以 (execution_id, step_name) 为键
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub execution_id: ExecutionId,
    pub step_name: String,
    pub status: StepStatus,
    /// 步骤结果 (失败时为错误信息)
    pub result: serde_json::Value,
    /// 睡眠步骤的唤醒时间
    pub wake_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// 已完成的步骤
    pub fn completed(
        execution_id: ExecutionId,
        step_name: impl Into<String>,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id,
            step_name: step_name.into(),
            status: StepStatus::Completed,
            result,
            wake_at: None,
            completed_at: Some(now),
        }
    }

    /// 等待唤醒的睡眠步骤
    pub fn sleeping(execution_id: ExecutionId, step_name: impl Into<String>, wake_at: DateTime<Utc>) -> Self {
        Self {
            execution_id,
            step_name: step_name.into(),
            status: StepStatus::Pending,
            result: serde_json::Value::Null,
            wake_at: Some(wake_at),
            completed_at: None,
        }
    }

    /// 失败的步骤
    pub fn failed(
        execution_id: ExecutionId,
        step_name: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id,
            step_name: step_name.into(),
            status: StepStatus::Failed,
            result: serde_json::Value::String(message.into()),
            wake_at: None,
            completed_at: Some(now),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

/// 睡眠票据: 每个执行最多一张
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepTicket {
    pub execution_id: ExecutionId,
    pub wake_at: DateTime<Utc>,
    /// 签发令牌，用于条件删除
    pub resume_token: Uuid,
}

impl SleepTicket {
    pub fn new(execution_id: ExecutionId, wake_at: DateTime<Utc>) -> Self {
        Self {
            execution_id,
            wake_at,
            resume_token: Uuid::new_v4(),
        }
    }

    /// 是否已到期
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.wake_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_due_at_deadline() {
        let now = Utc::now();
        let ticket = SleepTicket::new(Uuid::new_v4(), now + chrono::Duration::seconds(5));

        assert!(!ticket.is_due(now));
        assert!(ticket.is_due(now + chrono::Duration::seconds(5)));
        assert!(ticket.is_due(now + chrono::Duration::seconds(6)));
    }
}
