//! 持久化存储接口
//!
//! 三个接口分别对应步骤账本、睡眠票据与执行实例。具体后端 ([`crate::MemoryStore`]、
//! [`crate::SqliteStore`]) 同时实现三者，通过 [`DurableStore`] 一并传递。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use sw_core::{
    ExecutionId, ExecutionInstance, Result, SleepTicket, StepRecord, StepStatus, StepWeaveError,
};

/// 步骤账本
#[async_trait]
pub trait StepLedger: Send + Sync + 'static {
    /// 查询步骤记录，不存在返回 `None`
    async fn get_step(&self, execution_id: ExecutionId, step_name: &str) -> Result<Option<StepRecord>>;

    /// 写入步骤记录 (返回生效的记录)
    ///
    /// 已完成的记录不可被不同内容覆盖，见 [`resolve_step_write`]。
    async fn write_step(&self, record: StepRecord) -> Result<StepRecord>;

    /// 按写入顺序列出执行的所有步骤
    async fn list_steps(&self, execution_id: ExecutionId) -> Result<Vec<StepRecord>>;

    /// 删除执行的所有步骤
    async fn delete_steps(&self, execution_id: ExecutionId) -> Result<()>;

    /// 记录步骤完成 (幂等)
    async fn record_step(
        &self,
        execution_id: ExecutionId,
        step_name: &str,
        result: Value,
        completed_at: DateTime<Utc>,
    ) -> Result<StepRecord> {
        self.write_step(StepRecord::completed(execution_id, step_name, result, completed_at))
            .await
    }

    /// 将睡眠步骤标记为等待唤醒
    async fn mark_sleeping(
        &self,
        execution_id: ExecutionId,
        step_name: &str,
        wake_at: DateTime<Utc>,
    ) -> Result<StepRecord> {
        self.write_step(StepRecord::sleeping(execution_id, step_name, wake_at))
            .await
    }

    /// 记录步骤失败 (步骤超时)
    async fn record_failure(
        &self,
        execution_id: ExecutionId,
        step_name: &str,
        message: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<StepRecord> {
        self.write_step(StepRecord::failed(execution_id, step_name, message, failed_at))
            .await
    }
}

/// 睡眠票据存储 (每个执行最多一张票据)
#[async_trait]
pub trait TicketStore: Send + Sync + 'static {
    /// 写入票据，覆盖同一执行的旧票据
    async fn put_ticket(&self, ticket: &SleepTicket) -> Result<()>;

    async fn get_ticket(&self, execution_id: ExecutionId) -> Result<Option<SleepTicket>>;

    /// 到期票据，按唤醒时间升序
    async fn due_tickets(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SleepTicket>>;

    /// 仅当令牌匹配时删除票据
    async fn consume_ticket(&self, execution_id: ExecutionId, resume_token: uuid::Uuid) -> Result<bool>;

    /// 无条件删除票据
    async fn delete_ticket(&self, execution_id: ExecutionId) -> Result<bool>;
}

/// 执行实例存储
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    async fn insert_execution(&self, instance: &ExecutionInstance) -> Result<()>;

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<ExecutionInstance>>;

    /// 更新已存在的实例，不存在时返回 `NotFound`
    async fn update_execution(&self, instance: &ExecutionInstance) -> Result<()>;

    /// 所有实例，按创建时间升序
    async fn list_executions(&self) -> Result<Vec<ExecutionInstance>>;

    /// 非终态实例 (Running / Sleeping)
    async fn list_unfinished(&self) -> Result<Vec<ExecutionInstance>>;

    /// 在 `cutoff` 之前进入终态的实例
    async fn list_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExecutionId>>;

    async fn delete_execution(&self, id: ExecutionId) -> Result<()>;
}

/// 完整的持久化后端
pub trait DurableStore: StepLedger + TicketStore + ExecutionStore {}

impl<T> DurableStore for T where T: StepLedger + TicketStore + ExecutionStore {}

/// 步骤写入决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepWrite {
    /// 写入 (新记录或覆盖未完成记录)
    Write,
    /// 与已完成记录相同，无需写入
    Unchanged,
}

/// 判断一条步骤记录能否写入
///
/// 已完成的记录只接受内容完全相同的重复写入，其它情况返回 `StepConflict`。
pub fn resolve_step_write(existing: Option<&StepRecord>, incoming: &StepRecord) -> Result<StepWrite> {
    match existing {
        None => Ok(StepWrite::Write),
        Some(current) if current.status == StepStatus::Completed => {
            if incoming.status == StepStatus::Completed && incoming.result == current.result {
                Ok(StepWrite::Unchanged)
            } else {
                Err(StepWeaveError::StepConflict {
                    execution_id: current.execution_id,
                    step: current.step_name.clone(),
                })
            }
        }
        Some(_) => Ok(StepWrite::Write),
    }
}
