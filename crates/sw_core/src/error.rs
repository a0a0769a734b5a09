//! 全局错误处理机制

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// StepWeave 统一错误类型
#[derive(Error, Debug)]
pub enum StepWeaveError {
    #[error("Function already registered: {0}")]
    DuplicateId(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Step conflict in execution {execution_id}: step '{step}' already completed with a different result")]
    StepConflict { execution_id: Uuid, step: String },

    #[error("Step '{step}' failed: {message}")]
    StepExecution { step: String, message: String },

    #[error("Execution cancelled: {0}")]
    Cancelled(Uuid),

    /// 执行在睡眠步骤处挂起 (内部控制信号，不是失败)
    #[error("Execution suspended until {wake_at}")]
    Suspended { wake_at: DateTime<Utc> },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StepWeaveError {
    /// 错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepWeaveError::DuplicateId(_) => ErrorKind::DuplicateId,
            StepWeaveError::InvalidEvent(_) => ErrorKind::InvalidEvent,
            StepWeaveError::StepConflict { .. } => ErrorKind::StepConflict,
            StepWeaveError::StepExecution { .. } => ErrorKind::StepExecution,
            StepWeaveError::Cancelled(_) => ErrorKind::Cancelled,
            StepWeaveError::Suspended { .. } => ErrorKind::Suspended,
            StepWeaveError::NotFound(_) => ErrorKind::NotFound,
            StepWeaveError::Validation(_) => ErrorKind::Validation,
            StepWeaveError::Storage(_) | StepWeaveError::Io(_) => ErrorKind::Storage,
            StepWeaveError::Config(_) => ErrorKind::Config,
            StepWeaveError::Unavailable(_) => ErrorKind::Unavailable,
            StepWeaveError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// 是否为可重试的瞬时错误 (存储层不可用)
    pub fn is_transient(&self) -> bool {
        matches!(self, StepWeaveError::Storage(_) | StepWeaveError::Io(_))
    }

    /// 便捷构造: 存储错误
    pub fn storage(err: impl std::fmt::Display) -> Self {
        StepWeaveError::Storage(err.to_string())
    }

    /// 便捷构造: 步骤执行错误
    pub fn step(step: impl Into<String>, message: impl std::fmt::Display) -> Self {
        StepWeaveError::StepExecution {
            step: step.into(),
            message: message.to_string(),
        }
    }
}

/// 可序列化的错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DuplicateId,
    InvalidEvent,
    StepConflict,
    StepExecution,
    Cancelled,
    Suspended,
    NotFound,
    Validation,
    Storage,
    Config,
    Unavailable,
    Serialization,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::DuplicateId => "duplicate_id",
            ErrorKind::InvalidEvent => "invalid_event",
            ErrorKind::StepConflict => "step_conflict",
            ErrorKind::StepExecution => "step_execution",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Suspended => "suspended",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Storage => "storage",
            ErrorKind::Config => "config",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Serialization => "serialization",
        }
    }
}

/// 失败执行上记录的错误 (种类 + 消息)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&StepWeaveError> for ExecutionError {
    fn from(err: &StepWeaveError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// 统一 Result 类型别名
pub type Result<T> = std::result::Result<T, StepWeaveError>;
