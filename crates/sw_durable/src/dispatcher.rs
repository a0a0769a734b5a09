//! 事件派发
//!
//! 事件 → 注册表解析订阅函数 → 每个函数创建一个执行实例 → 投递到工作池。
//! 实例 ID 在函数体运行之前返回。

use std::sync::Arc;

use sw_core::{EventEnvelope, ExecutionId, Result, StepWeaveError};

use crate::engine::ExecutionEngine;
use crate::registry::FunctionRegistry;
use crate::worker::{Job, JobQueue};

/// 事件派发器
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<FunctionRegistry>,
    engine: Arc<ExecutionEngine>,
    queue: JobQueue,
}

impl Dispatcher {
    pub fn new(registry: Arc<FunctionRegistry>, engine: Arc<ExecutionEngine>, queue: JobQueue) -> Self {
        Self { registry, engine, queue }
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// 处理事件，返回新建的执行 ID (按注册顺序)
    ///
    /// 事件名缺失时返回 `InvalidEvent`，不创建任何实例。
    pub async fn handle_event(&self, envelope: EventEnvelope) -> Result<Vec<ExecutionId>> {
        envelope.validate()?;

        let functions = self.registry.resolve(&envelope.name);
        if functions.is_empty() {
            tracing::debug!(event = %envelope.name, "No function subscribed to event");
            return Ok(Vec::new());
        }

        let mut ids = Vec::with_capacity(functions.len());
        for function in &functions {
            let instance = self
                .engine
                .create_execution(function.id(), envelope.clone())
                .await?;
            if let Err(err) = self.queue.submit(Job::start(instance.id)).await {
                // 无法投递的实例不会再被调用
                tracing::error!(execution_id = %instance.id, error = %err, "Failed to enqueue execution");
                let reason = StepWeaveError::Unavailable("job queue is closed".into());
                if let Err(mark_err) = self.engine.mark_failed(instance.id, reason).await {
                    tracing::error!(execution_id = %instance.id, error = %mark_err, "Failed to mark execution failed");
                }
                return Err(err);
            }
            ids.push(instance.id);
        }

        tracing::info!(event = %envelope.name, executions = ids.len(), "Event dispatched");
        Ok(ids)
    }

    /// 重新投递所有未完成的执行，返回数量
    pub async fn recover(&self) -> Result<usize> {
        let ids = self.engine.recover().await?;
        for id in &ids {
            self.queue.submit(Job::recover(*id)).await?;
        }
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "Unfinished executions re-enqueued");
        }
        Ok(ids.len())
    }
}
