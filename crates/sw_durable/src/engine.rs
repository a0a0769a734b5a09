//! 执行引擎 (replay-and-skip)
//!
//! 每次调用都从头重放函数体，已完成的步骤从账本取结果。
//! 函数体在睡眠步骤处挂起后实例进入 Sleeping，由调度器到期后重新投递。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use sw_core::{
    ceil_millis, Clock, EventEnvelope, ExecutionError, ExecutionId, ExecutionInstance, ExecutionStatus,
    Result, SleepTicket, StepRecord, StepWeaveError, OUTPUT_STEP,
};

use crate::context::StepContext;
use crate::locks::ExecutionLocks;
use crate::registry::FunctionRegistry;
use crate::retry::RetryPolicy;
use crate::scheduler::SleepScheduler;
use crate::store::{DurableStore, StepLedger, TicketStore};

/// 引擎配置
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// 单步超时 (None 表示不限)
    pub step_timeout: Option<Duration>,
    /// 终态实例的保留时长
    pub retention: Duration,
    /// 存储瞬时错误的重试策略
    pub storage_retry: RetryPolicy,
    /// 重放因存储错误中止后，再次投递前的等待时间
    pub retry_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout: None,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            storage_retry: RetryPolicy::default(),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// 执行引擎
pub struct ExecutionEngine {
    registry: Arc<FunctionRegistry>,
    store: Arc<dyn DurableStore>,
    scheduler: Arc<SleepScheduler>,
    clock: Arc<dyn Clock>,
    locks: ExecutionLocks,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<FunctionRegistry>,
        store: Arc<dyn DurableStore>,
        scheduler: Arc<SleepScheduler>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            store,
            scheduler,
            clock,
            locks: ExecutionLocks::new(),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 创建执行实例 (Running)，不调用函数体
    pub async fn create_execution(&self, function_id: &str, event: EventEnvelope) -> Result<ExecutionInstance> {
        let instance = ExecutionInstance::new(function_id, event, self.clock.now());
        self.config
            .storage_retry
            .run("insert_execution", || self.store.insert_execution(&instance))
            .await?;
        tracing::info!(execution_id = %instance.id, function_id, "Execution created");
        Ok(instance)
    }

    /// 执行一次重放，返回重放后的状态
    ///
    /// 终态实例直接返回其状态。存储瞬时错误在重试耗尽后返回 `Err`，实例保持原状等待恢复。
    pub async fn invoke(&self, id: ExecutionId) -> Result<ExecutionStatus> {
        let _guard = self.locks.acquire(id).await;
        let mut instance = self.load(id).await?;

        if instance.is_terminal() {
            tracing::debug!(execution_id = %id, status = instance.status.as_str(), "Execution already finished");
            return Ok(instance.status);
        }

        let Some(function) = self.registry.get(&instance.function_id).cloned() else {
            let err = StepWeaveError::NotFound(format!("function {}", instance.function_id));
            tracing::error!(execution_id = %id, function_id = %instance.function_id, "Function not registered");
            instance.fail(ExecutionError::from(&err), self.clock.now());
            self.save(&instance).await?;
            return Ok(instance.status);
        };

        if instance.status == ExecutionStatus::Sleeping {
            instance.transition(ExecutionStatus::Running, self.clock.now());
            self.save(&instance).await?;
        }

        let step = StepContext::new(
            id,
            self.store.clone(),
            self.scheduler.clone(),
            self.clock.clone(),
            self.config.step_timeout,
            self.config.storage_retry.clone(),
        );
        tracing::debug!(execution_id = %id, function_id = %instance.function_id, "Replaying function body");
        let outcome = function.handler().call(instance.event.clone(), step.clone()).await;

        if let Some(wake_at) = step.suspended_at().await {
            instance.transition(ExecutionStatus::Sleeping, self.clock.now());
            self.save(&instance).await?;
            tracing::info!(execution_id = %id, %wake_at, "Execution suspended");
            return Ok(instance.status);
        }

        match outcome {
            Ok(output) => {
                let now = self.clock.now();
                self.config
                    .storage_retry
                    .run("record_step", || self.store.record_step(id, OUTPUT_STEP, output.clone(), now))
                    .await?;
                instance.complete(output, now);
                self.save(&instance).await?;
                tracing::info!(execution_id = %id, function_id = %instance.function_id, "Execution completed");
            }
            Err(err) if err.is_transient() => {
                tracing::error!(execution_id = %id, error = %err, "Replay aborted by storage error");
                return Err(err);
            }
            Err(err) => {
                instance.fail(ExecutionError::from(&err), self.clock.now());
                self.save(&instance).await?;
                tracing::warn!(execution_id = %id, error = %err, "Execution failed");
            }
        }

        Ok(instance.status)
    }

    /// 取消执行: 标记 Failed(Cancelled) 并释放票据，已完成的步骤保留
    pub async fn cancel(&self, id: ExecutionId) -> Result<ExecutionInstance> {
        let _guard = self.locks.acquire(id).await;
        let mut instance = self.load(id).await?;
        if instance.is_terminal() {
            return Ok(instance);
        }

        instance.fail(ExecutionError::from(&StepWeaveError::Cancelled(id)), self.clock.now());
        self.save(&instance).await?;
        self.config
            .storage_retry
            .run("release_wake", || self.scheduler.release(id))
            .await?;
        tracing::info!(execution_id = %id, "Execution cancelled");
        Ok(instance)
    }

    /// 重放因存储瞬时错误中止后登记重试票据，由调度器在退避后重新投递
    ///
    /// 总是写入新令牌，调度器按旧令牌消费票据时不会删除它。
    pub async fn schedule_retry(&self, id: ExecutionId) -> Result<SleepTicket> {
        let backoff = chrono::Duration::from_std(self.config.retry_backoff)
            .map_err(|e| StepWeaveError::Config(format!("retry_backoff out of range: {e}")))?;
        let wake_at = ceil_millis(self.clock.now() + backoff);
        let ticket = self
            .config
            .storage_retry
            .run("register_wake", || self.scheduler.register_wake(id, wake_at))
            .await?;
        tracing::warn!(execution_id = %id, %wake_at, "Replay retry scheduled");
        Ok(ticket)
    }

    /// 将未结束的执行标记为失败 (函数体 panic 等)
    pub async fn mark_failed(&self, id: ExecutionId, err: StepWeaveError) -> Result<()> {
        let _guard = self.locks.acquire(id).await;
        let mut instance = self.load(id).await?;
        if instance.is_terminal() {
            return Ok(());
        }
        instance.fail(ExecutionError::from(&err), self.clock.now());
        self.save(&instance).await?;
        self.scheduler.release(id).await?;
        Ok(())
    }

    /// 查询执行实例
    pub async fn get(&self, id: ExecutionId) -> Result<ExecutionInstance> {
        self.load(id).await
    }

    /// 执行的步骤记录 (含终结步骤)
    pub async fn steps(&self, id: ExecutionId) -> Result<Vec<StepRecord>> {
        self.load(id).await?;
        self.store.list_steps(id).await
    }

    /// 所有执行实例
    pub async fn list(&self) -> Result<Vec<ExecutionInstance>> {
        self.store.list_executions().await
    }

    /// 删除超过保留期的终态实例及其步骤，返回删除数量
    pub async fn prune_expired(&self) -> Result<usize> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .map_err(|e| StepWeaveError::Config(format!("retention out of range: {e}")))?;
        let cutoff = self.clock.now() - retention;
        let expired = self.store.list_terminal_before(cutoff).await?;

        for id in &expired {
            let guard = self.locks.acquire(*id).await;
            self.store.delete_steps(*id).await?;
            self.store.delete_ticket(*id).await?;
            self.store.delete_execution(*id).await?;
            drop(guard);
            self.locks.remove(id).await;
        }

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), %cutoff, "Expired executions pruned");
        }
        Ok(expired.len())
    }

    /// 需要恢复的执行 (Running / Sleeping)
    pub async fn recover(&self) -> Result<Vec<ExecutionId>> {
        let unfinished = self.store.list_unfinished().await?;
        Ok(unfinished.into_iter().map(|instance| instance.id).collect())
    }

    /// 终结步骤记录的返回值
    pub async fn output(&self, id: ExecutionId) -> Result<Option<Value>> {
        Ok(self
            .store
            .get_step(id, OUTPUT_STEP)
            .await?
            .filter(StepRecord::is_completed)
            .map(|record| record.result))
    }

    async fn load(&self, id: ExecutionId) -> Result<ExecutionInstance> {
        self.config
            .storage_retry
            .run("get_execution", || self.store.get_execution(id))
            .await?
            .ok_or_else(|| StepWeaveError::NotFound(format!("execution {id}")))
    }

    async fn save(&self, instance: &ExecutionInstance) -> Result<()> {
        self.config
            .storage_retry
            .run("update_execution", || self.store.update_execution(instance))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FunctionDefinition;
    use crate::scheduler::SchedulerConfig;
    use crate::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use sw_core::{ErrorKind, ManualClock, StepStatus};

    struct Fixture {
        engine: ExecutionEngine,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture(registry: FunctionRegistry, config: EngineConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(sw_core::ceil_millis(chrono::Utc::now())));
        let scheduler = Arc::new(SleepScheduler::new(store.clone(), clock.clone(), SchedulerConfig::default()));
        let engine = ExecutionEngine::new(Arc::new(registry), store.clone(), scheduler, clock.clone(), config);
        Fixture { engine, store, clock }
    }

    fn hello_world() -> FunctionDefinition {
        FunctionDefinition::new(
            "hello-world",
            "test/hello-world",
            |event: EventEnvelope, _step: StepContext| async move {
                let name = event.data["name"].as_str().unwrap_or("Hello World").to_string();
                Ok(json!({ "message": format!("hello {name}") }))
            },
        )
    }

    /// [A, sleep(5s), B]，记录每个步骤的执行次数
    fn sleepy(a_calls: Arc<AtomicU32>, b_calls: Arc<AtomicU32>) -> FunctionDefinition {
        FunctionDefinition::new("sleepy", "demo/sleepy", move |_event: EventEnvelope, step: StepContext| {
            let a_calls = a_calls.clone();
            let b_calls = b_calls.clone();
            async move {
                let a: String = step
                    .run("A", || async move {
                        a_calls.fetch_add(1, Ordering::SeqCst);
                        Ok("a".to_string())
                    })
                    .await?;
                step.sleep_for("nap", "5s").await?;
                let b: String = step
                    .run("B", || async move {
                        b_calls.fetch_add(1, Ordering::SeqCst);
                        Ok(format!("{a}b"))
                    })
                    .await?;
                Ok(json!({ "result": b }))
            }
        })
    }

    #[tokio::test]
    async fn test_hello_world() {
        let mut registry = FunctionRegistry::new();
        registry.register(hello_world()).unwrap();
        let f = fixture(registry, EngineConfig::default());

        let instance = f
            .engine
            .create_execution("hello-world", EventEnvelope::new("test/hello-world", json!({ "name": "Ada" })))
            .await
            .unwrap();
        let status = f.engine.invoke(instance.id).await.unwrap();

        assert_eq!(status, ExecutionStatus::Completed);
        let done = f.engine.get(instance.id).await.unwrap();
        assert_eq!(done.output, Some(json!({ "message": "hello Ada" })));
        assert_eq!(
            f.engine.output(instance.id).await.unwrap(),
            Some(json!({ "message": "hello Ada" }))
        );
    }

    #[tokio::test]
    async fn test_sleep_then_resume() {
        let a_calls = Arc::new(AtomicU32::new(0));
        let b_calls = Arc::new(AtomicU32::new(0));
        let mut registry = FunctionRegistry::new();
        registry.register(sleepy(a_calls.clone(), b_calls.clone())).unwrap();
        let f = fixture(registry, EngineConfig::default());

        let id = f
            .engine
            .create_execution("sleepy", EventEnvelope::new("demo/sleepy", json!({})))
            .await
            .unwrap()
            .id;

        // 第一次: 运行 A，登记 5 秒票据，挂起
        assert_eq!(f.engine.invoke(id).await.unwrap(), ExecutionStatus::Sleeping);
        let ticket = f.store.get_ticket(id).await.unwrap().unwrap();
        assert_eq!(ticket.wake_at, sw_core::ceil_millis(f.clock.now() + chrono::Duration::seconds(5)));
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);

        // 提前恢复: 跳过 A，仍然睡眠
        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.engine.invoke(id).await.unwrap(), ExecutionStatus::Sleeping);
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);

        // 到期后恢复: 运行 B，完成
        f.clock.advance(Duration::from_secs(4));
        assert_eq!(f.engine.invoke(id).await.unwrap(), ExecutionStatus::Completed);
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);

        let done = f.engine.get(id).await.unwrap();
        assert_eq!(done.output, Some(json!({ "result": "ab" })));
        assert_eq!(f.store.get_ticket(id).await.unwrap(), None);

        let names: Vec<String> = f.engine.steps(id).await.unwrap().into_iter().map(|s| s.step_name).collect();
        assert_eq!(names, vec!["A", "nap", "B", OUTPUT_STEP]);

        // 终态后再次调用不重放
        assert_eq!(f.engine.invoke(id).await.unwrap(), ExecutionStatus::Completed);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_replay_runs_each_step_once() {
        let counters: Vec<Arc<AtomicU32>> = (0..3).map(|_| Arc::new(AtomicU32::new(0))).collect();
        let body_counters = counters.clone();
        let mut registry = FunctionRegistry::new();
        registry
            .register(FunctionDefinition::new(
                "three-steps",
                "demo/three",
                move |_event: EventEnvelope, step: StepContext| {
                    let counters = body_counters.clone();
                    async move {
                        let mut total = 0u32;
                        for (i, counter) in counters.iter().enumerate() {
                            let counter = counter.clone();
                            total += step
                                .run(&format!("step-{i}"), || async move {
                                    counter.fetch_add(1, Ordering::SeqCst);
                                    Ok(i as u32)
                                })
                                .await?;
                        }
                        Ok(json!(total))
                    }
                },
            ))
            .unwrap();
        let f = fixture(registry, EngineConfig::default());

        let id = f
            .engine
            .create_execution("three-steps", EventEnvelope::new("demo/three", json!({})))
            .await
            .unwrap()
            .id;
        // 预先记录前两步，模拟崩溃前的进度
        let now = f.clock.now();
        f.store.record_step(id, "step-0", json!(0), now).await.unwrap();
        f.store.record_step(id, "step-1", json!(1), now).await.unwrap();

        assert_eq!(f.engine.invoke(id).await.unwrap(), ExecutionStatus::Completed);
        let calls: Vec<u32> = counters.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        assert_eq!(calls, vec![0, 0, 1]);
        assert_eq!(f.engine.get(id).await.unwrap().output, Some(json!(3)));
    }

    #[tokio::test]
    async fn test_step_failure_marks_execution_failed() {
        let mut registry = FunctionRegistry::new();
        registry
            .register(FunctionDefinition::new(
                "flaky",
                "demo/flaky",
                |_event: EventEnvelope, step: StepContext| async move {
                    let value: Value = step
                        .run("charge", || async { Err(anyhow::anyhow!("card declined")) })
                        .await?;
                    Ok(value)
                },
            ))
            .unwrap();
        let f = fixture(registry, EngineConfig::default());
        let id = f
            .engine
            .create_execution("flaky", EventEnvelope::new("demo/flaky", json!({})))
            .await
            .unwrap()
            .id;

        assert_eq!(f.engine.invoke(id).await.unwrap(), ExecutionStatus::Failed);
        let failed = f.engine.get(id).await.unwrap();
        let error = failed.error.unwrap();
        assert_eq!(error.kind, ErrorKind::StepExecution);
        assert!(error.message.contains("card declined"));
        assert!(f.engine.steps(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_body_can_handle_step_errors() {
        let mut registry = FunctionRegistry::new();
        registry
            .register(FunctionDefinition::new(
                "fallback",
                "demo/fallback",
                |_event: EventEnvelope, step: StepContext| async move {
                    let primary = step
                        .run::<String, _, _>("primary", || async { Err(anyhow::anyhow!("down")) })
                        .await;
                    let value = match primary {
                        Ok(value) => value,
                        Err(_) => step.run("secondary", || async { Ok("backup".to_string()) }).await?,
                    };
                    Ok(json!(value))
                },
            ))
            .unwrap();
        let f = fixture(registry, EngineConfig::default());
        let id = f
            .engine
            .create_execution("fallback", EventEnvelope::new("demo/fallback", json!({})))
            .await
            .unwrap()
            .id;

        assert_eq!(f.engine.invoke(id).await.unwrap(), ExecutionStatus::Completed);
        assert_eq!(f.engine.get(id).await.unwrap().output, Some(json!("backup")));
    }

    #[tokio::test]
    async fn test_cancel_releases_ticket_and_keeps_steps() {
        let mut registry = FunctionRegistry::new();
        registry
            .register(sleepy(Arc::new(AtomicU32::new(0)), Arc::new(AtomicU32::new(0))))
            .unwrap();
        let f = fixture(registry, EngineConfig::default());
        let id = f
            .engine
            .create_execution("sleepy", EventEnvelope::new("demo/sleepy", json!({})))
            .await
            .unwrap()
            .id;
        f.engine.invoke(id).await.unwrap();

        let cancelled = f.engine.cancel(id).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Failed);
        assert_eq!(cancelled.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
        assert_eq!(f.store.get_ticket(id).await.unwrap(), None);
        assert_eq!(f.store.get_step(id, "A").await.unwrap().unwrap().status, StepStatus::Completed);

        // 取消后到期也不会继续
        f.clock.advance(Duration::from_secs(10));
        assert_eq!(f.engine.invoke(id).await.unwrap(), ExecutionStatus::Failed);
        assert_eq!(f.engine.cancel(id).await.unwrap(), cancelled);
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let f = fixture(FunctionRegistry::new(), EngineConfig::default());
        let id = uuid::Uuid::new_v4();
        assert!(matches!(f.engine.invoke(id).await, Err(StepWeaveError::NotFound(_))));
        assert!(matches!(f.engine.cancel(id).await, Err(StepWeaveError::NotFound(_))));
        assert!(matches!(f.engine.steps(id).await, Err(StepWeaveError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_missing_function_fails_execution() {
        let f = fixture(FunctionRegistry::new(), EngineConfig::default());
        let id = f
            .engine
            .create_execution("ghost", EventEnvelope::new("demo/ghost", json!({})))
            .await
            .unwrap()
            .id;

        assert_eq!(f.engine.invoke(id).await.unwrap(), ExecutionStatus::Failed);
        assert_eq!(f.engine.get(id).await.unwrap().error.unwrap().kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_prune_expired_and_recover() {
        let mut registry = FunctionRegistry::new();
        registry.register(hello_world()).unwrap();
        registry
            .register(sleepy(Arc::new(AtomicU32::new(0)), Arc::new(AtomicU32::new(0))))
            .unwrap();
        let config = EngineConfig {
            retention: Duration::from_secs(60),
            ..EngineConfig::default()
        };
        let f = fixture(registry, config);

        let done = f
            .engine
            .create_execution("hello-world", EventEnvelope::new("test/hello-world", json!({})))
            .await
            .unwrap()
            .id;
        f.engine.invoke(done).await.unwrap();
        let sleeping = f
            .engine
            .create_execution("sleepy", EventEnvelope::new("demo/sleepy", json!({})))
            .await
            .unwrap()
            .id;
        f.engine.invoke(sleeping).await.unwrap();

        assert_eq!(f.engine.recover().await.unwrap(), vec![sleeping]);
        assert_eq!(f.engine.prune_expired().await.unwrap(), 0);

        f.clock.advance(Duration::from_secs(61));
        assert_eq!(f.engine.prune_expired().await.unwrap(), 1);
        assert!(matches!(f.engine.get(done).await, Err(StepWeaveError::NotFound(_))));
        assert!(f.store.list_steps(done).await.unwrap().is_empty());
        assert!(f.engine.get(sleeping).await.is_ok());
    }
}
