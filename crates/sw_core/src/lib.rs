//! # sw_core - StepWeave Core Primitives
//!
//! 核心原语层，定义错误分类、事件信封、执行实例、步骤记录与时钟抽象。
//! 此 crate 是整个项目的基础依赖，不依赖其他业务 crate。

pub mod clock;
pub mod duration;
pub mod error;
pub mod event;
pub mod execution;
pub mod step;

pub use clock::{ceil_millis, Clock, ManualClock, SystemClock};
pub use duration::parse_duration;
pub use error::{ErrorKind, ExecutionError, Result, StepWeaveError};
pub use event::EventEnvelope;
pub use execution::{ExecutionId, ExecutionInstance, ExecutionStatus};
pub use step::{SleepTicket, StepRecord, StepStatus, OUTPUT_STEP};
