//! 步骤上下文
//!
//! 函数体通过 [`StepContext`] 声明步骤。每次调用先查询步骤账本：
//! 已完成的步骤直接返回记录的结果，只有未见过的步骤才真正执行。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use sw_core::{
    ceil_millis, parse_duration, Clock, ExecutionId, Result, StepRecord, StepStatus, StepWeaveError, OUTPUT_STEP,
};

use crate::retry::RetryPolicy;
use crate::scheduler::SleepScheduler;
use crate::store::DurableStore;

/// 单次重放的可变状态
#[derive(Debug, Default)]
struct PassState {
    /// 步骤名 → 本次重放中出现的次数
    seen: HashMap<String, usize>,
    /// 挂起时的唤醒时间
    suspended: Option<DateTime<Utc>>,
}

struct ContextInner {
    execution_id: ExecutionId,
    store: Arc<dyn DurableStore>,
    scheduler: Arc<SleepScheduler>,
    clock: Arc<dyn Clock>,
    step_timeout: Option<Duration>,
    retry: RetryPolicy,
    state: Mutex<PassState>,
}

/// 步骤上下文 (每次重放新建一个)
#[derive(Clone)]
pub struct StepContext {
    inner: Arc<ContextInner>,
}

impl StepContext {
    pub fn new(
        execution_id: ExecutionId,
        store: Arc<dyn DurableStore>,
        scheduler: Arc<SleepScheduler>,
        clock: Arc<dyn Clock>,
        step_timeout: Option<Duration>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                execution_id,
                store,
                scheduler,
                clock,
                step_timeout,
                retry,
                state: Mutex::new(PassState::default()),
            }),
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.inner.execution_id
    }

    /// 本次重放是否已在睡眠步骤处挂起
    pub async fn suspended_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().await.suspended
    }

    /// 执行一个步骤
    ///
    /// 已完成的步骤返回记录的结果而不执行 `f`。
    /// 成功的结果先落盘再返回；`f` 返回的错误不记录，以 `StepExecution` 交给函数体处理。
    pub async fn run<T, F, Fut>(&self, name: &str, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        let key = self.next_key(name).await?;
        let id = self.inner.execution_id;

        if let Some(record) = self.load(&key).await? {
            match record.status {
                StepStatus::Completed => {
                    tracing::debug!(execution_id = %id, step = %key, "Step replayed from ledger");
                    return Ok(serde_json::from_value(record.result)?);
                }
                StepStatus::Failed => {
                    return Err(StepWeaveError::step(key, failure_message(&record)));
                }
                StepStatus::Pending => {
                    return Err(StepWeaveError::Validation(format!(
                        "step '{key}' is recorded as a pending sleep"
                    )));
                }
            }
        }

        tracing::debug!(execution_id = %id, step = %key, "Running step");
        let outcome = match self.inner.step_timeout {
            Some(limit) => match tokio::time::timeout(limit, f()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let message = format!("step timed out after {limit:?}");
                    let now = self.inner.clock.now();
                    self.inner
                        .retry
                        .run("record_failure", || {
                            self.inner.store.record_failure(id, &key, &message, now)
                        })
                        .await?;
                    tracing::warn!(execution_id = %id, step = %key, ?limit, "Step timed out");
                    return Err(StepWeaveError::step(key, message));
                }
            },
            None => f().await,
        };

        match outcome {
            Ok(value) => {
                let result = serde_json::to_value(&value)?;
                let now = self.inner.clock.now();
                self.inner
                    .retry
                    .run("record_step", || {
                        self.inner.store.record_step(id, &key, result.clone(), now)
                    })
                    .await?;
                tracing::info!(execution_id = %id, step = %key, "Step completed");
                Ok(value)
            }
            Err(err) => {
                tracing::warn!(execution_id = %id, step = %key, error = %err, "Step failed");
                Err(StepWeaveError::step(key, format!("{err:#}")))
            }
        }
    }

    /// 睡眠步骤
    ///
    /// 首次到达时登记唤醒时间并挂起 (返回 `Suspended`，函数体应直接传播)；
    /// 到期后的重放把步骤标记为完成并继续。
    pub async fn sleep(&self, name: &str, duration: Duration) -> Result<()> {
        let key = self.next_key(name).await?;
        let id = self.inner.execution_id;
        let now = self.inner.clock.now();

        let wake_at = match self.load(&key).await? {
            Some(record) if record.status == StepStatus::Completed => {
                tracing::debug!(execution_id = %id, step = %key, "Sleep already elapsed");
                return Ok(());
            }
            Some(StepRecord {
                status: StepStatus::Pending,
                wake_at: Some(wake_at),
                ..
            }) => {
                if wake_at <= now {
                    self.inner
                        .retry
                        .run("record_step", || {
                            self.inner.store.record_step(id, &key, Value::Null, now)
                        })
                        .await?;
                    self.inner
                        .retry
                        .run("clear_wake", || self.inner.scheduler.clear_wake(id, wake_at))
                        .await?;
                    tracing::info!(execution_id = %id, step = %key, "Sleep elapsed");
                    return Ok(());
                }
                self.inner
                    .retry
                    .run("register_wake", || self.inner.scheduler.ensure_wake(id, wake_at))
                    .await?;
                wake_at
            }
            _ => {
                let wake_at = ceil_millis(now + chrono::Duration::from_std(duration).map_err(|e| {
                    StepWeaveError::Validation(format!("sleep duration out of range: {e}"))
                })?);
                self.inner
                    .retry
                    .run("mark_sleeping", || self.inner.store.mark_sleeping(id, &key, wake_at))
                    .await?;
                self.inner
                    .retry
                    .run("register_wake", || self.inner.scheduler.register_wake(id, wake_at))
                    .await?;
                tracing::info!(execution_id = %id, step = %key, %wake_at, "Execution sleeping");
                wake_at
            }
        };

        self.inner.state.lock().await.suspended = Some(wake_at);
        Err(StepWeaveError::Suspended { wake_at })
    }

    /// 以时长字符串睡眠，如 `"5s"`、`"1m30s"`
    pub async fn sleep_for(&self, name: &str, duration: &str) -> Result<()> {
        self.sleep(name, parse_duration(duration)?).await
    }

    /// 计算本次调用的步骤键，同名步骤依次追加 `:1`、`:2`
    async fn next_key(&self, name: &str) -> Result<String> {
        if name.trim().is_empty() {
            return Err(StepWeaveError::Validation("step name must not be empty".into()));
        }
        if name == OUTPUT_STEP {
            return Err(StepWeaveError::Validation(format!("step name '{OUTPUT_STEP}' is reserved")));
        }

        let mut state = self.inner.state.lock().await;
        if let Some(wake_at) = state.suspended {
            return Err(StepWeaveError::Suspended { wake_at });
        }

        let seen = state.seen.entry(name.to_string()).or_insert(0);
        let key = match *seen {
            0 => name.to_string(),
            n => format!("{name}:{n}"),
        };
        *seen += 1;
        Ok(key)
    }

    async fn load(&self, key: &str) -> Result<Option<StepRecord>> {
        let id = self.inner.execution_id;
        self.inner
            .retry
            .run("get_step", || self.inner.store.get_step(id, key))
            .await
    }
}

fn failure_message(record: &StepRecord) -> String {
    match &record.result {
        Value::String(message) => message.clone(),
        other => other.to_string(),
    }
}
