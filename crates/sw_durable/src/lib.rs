//! # sw_durable - StepWeave Durable Execution
//!
//! 持久化执行底座：步骤账本、重放引擎 (replay-and-skip)、睡眠调度、工作池与事件派发。

pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod locks;
pub mod memory;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod sqlite;
pub mod store;
pub mod worker;

pub use context::StepContext;
pub use dispatcher::Dispatcher;
pub use engine::{EngineConfig, ExecutionEngine};
pub use locks::ExecutionLocks;
pub use memory::MemoryStore;
pub use registry::{FunctionDefinition, FunctionHandler, FunctionRegistry};
pub use retry::RetryPolicy;
pub use scheduler::{SchedulerConfig, SleepScheduler};
pub use sqlite::{SqliteStore, StoreConfig};
pub use store::{DurableStore, ExecutionStore, StepLedger, TicketStore};
pub use worker::{Job, JobQueue, JobReason, WorkerPool, WorkerPoolConfig};
