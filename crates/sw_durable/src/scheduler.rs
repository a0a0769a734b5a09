//! 睡眠调度器
//!
//! 保存每个执行的唤醒票据，后台轮询到期票据并投递 `Resume` 任务。
//! 票据先投递后消费，消费以 resume_token 为条件，避免删除恢复后的重放新登记的票据。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use sw_core::{Clock, ExecutionId, Result, SleepTicket};

use crate::store::{DurableStore, TicketStore};
use crate::worker::{Job, JobQueue};

/// 调度器配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// 轮询间隔
    pub poll_interval: Duration,
    /// 每轮最多处理的票据数
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
        }
    }
}

/// 睡眠调度器
pub struct SleepScheduler {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl SleepScheduler {
    pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>, config: SchedulerConfig) -> Self {
        Self { store, clock, config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// 登记唤醒时间 (覆盖该执行已有的票据)
    pub async fn register_wake(&self, execution_id: ExecutionId, wake_at: DateTime<Utc>) -> Result<SleepTicket> {
        let ticket = SleepTicket::new(execution_id, wake_at);
        self.store.put_ticket(&ticket).await?;
        tracing::debug!(execution_id = %execution_id, %wake_at, "Wake registered");
        Ok(ticket)
    }

    /// 确保存在指向 `wake_at` 的票据 (崩溃恢复后补登记)
    pub async fn ensure_wake(&self, execution_id: ExecutionId, wake_at: DateTime<Utc>) -> Result<SleepTicket> {
        match self.store.get_ticket(execution_id).await? {
            Some(ticket) if ticket.wake_at == wake_at => Ok(ticket),
            _ => self.register_wake(execution_id, wake_at).await,
        }
    }

    /// 睡眠步骤完成后移除对应票据
    pub async fn clear_wake(&self, execution_id: ExecutionId, wake_at: DateTime<Utc>) -> Result<()> {
        if let Some(ticket) = self.store.get_ticket(execution_id).await? {
            if ticket.wake_at == wake_at {
                self.store.consume_ticket(execution_id, ticket.resume_token).await?;
            }
        }
        Ok(())
    }

    /// 无条件释放票据 (取消或清理)
    pub async fn release(&self, execution_id: ExecutionId) -> Result<bool> {
        let released = self.store.delete_ticket(execution_id).await?;
        if released {
            tracing::debug!(execution_id = %execution_id, "Wake ticket released");
        }
        Ok(released)
    }

    /// 当前到期的票据
    pub async fn due(&self) -> Result<Vec<SleepTicket>> {
        self.store
            .due_tickets(self.clock.now(), self.config.batch_size)
            .await
    }

    /// 投递所有到期票据，返回投递数量
    pub async fn fire_due(&self, queue: &JobQueue) -> Result<usize> {
        let due = self.due().await?;
        let mut fired = 0;
        for ticket in due {
            queue.submit(Job::resume(ticket.execution_id)).await?;
            self.store
                .consume_ticket(ticket.execution_id, ticket.resume_token)
                .await?;
            tracing::info!(execution_id = %ticket.execution_id, wake_at = %ticket.wake_at, "Sleeping execution resumed");
            fired += 1;
        }
        Ok(fired)
    }

    /// 后台轮询循环，收到关闭信号后退出
    pub async fn run(self: Arc<Self>, queue: JobQueue, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(poll_interval = ?self.config.poll_interval, "Sleep scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.fire_due(&queue).await {
                        tracing::warn!(error = %err, "Scheduler poll failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Sleep scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use sw_core::ManualClock;
    use uuid::Uuid;

    fn scheduler() -> (Arc<SleepScheduler>, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let scheduler = Arc::new(SleepScheduler::new(store.clone(), clock.clone(), SchedulerConfig::default()));
        (scheduler, store, clock)
    }

    #[tokio::test]
    async fn test_one_ticket_per_execution() {
        let (scheduler, store, clock) = scheduler();
        let id = Uuid::new_v4();

        scheduler.register_wake(id, clock.now()).await.unwrap();
        let later = clock.now() + chrono::Duration::seconds(10);
        scheduler.register_wake(id, later).await.unwrap();

        let ticket = store.get_ticket(id).await.unwrap().unwrap();
        assert_eq!(ticket.wake_at, later);
        assert!(scheduler.due().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fire_due_submits_resume_and_deletes_ticket() {
        let (scheduler, store, clock) = scheduler();
        let id = Uuid::new_v4();
        scheduler
            .register_wake(id, clock.now() + chrono::Duration::seconds(5))
            .await
            .unwrap();

        let (queue, rx) = JobQueue::bounded(8);
        assert_eq!(scheduler.fire_due(&queue).await.unwrap(), 0);

        clock.advance(Duration::from_secs(5));
        assert_eq!(scheduler.fire_due(&queue).await.unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), Job::resume(id));
        assert_eq!(store.get_ticket(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ensure_wake_keeps_matching_ticket() {
        let (scheduler, _store, clock) = scheduler();
        let id = Uuid::new_v4();
        let wake_at = clock.now() + chrono::Duration::seconds(5);

        let first = scheduler.register_wake(id, wake_at).await.unwrap();
        let again = scheduler.ensure_wake(id, wake_at).await.unwrap();
        assert_eq!(first.resume_token, again.resume_token);

        scheduler.release(id).await.unwrap();
        let restored = scheduler.ensure_wake(id, wake_at).await.unwrap();
        assert_ne!(first.resume_token, restored.resume_token);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (scheduler, _store, _clock) = scheduler();
        let (queue, _rx) = JobQueue::bounded(1);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(scheduler.run(queue, rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler should stop")
            .unwrap();
    }
}
