//! 工作池
//!
//! N 个 tokio 任务共享一个有界 flume 队列。队列满时 `submit` 等待 (背压)；
//! 所有 [`JobQueue`] 被丢弃后工作者处理完剩余任务并退出。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use sw_core::{ExecutionId, Result, StepWeaveError};

use crate::engine::ExecutionEngine;

/// 工作池配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// 工作者数量
    pub workers: usize,
    /// 队列容量
    pub queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

/// 任务来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobReason {
    /// 事件触发的首次调用
    Start,
    /// 睡眠到期
    Resume,
    /// 启动时恢复未完成的执行
    Recover,
}

/// 一次重放请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Job {
    pub execution_id: ExecutionId,
    pub reason: JobReason,
}

impl Job {
    pub fn start(execution_id: ExecutionId) -> Self {
        Self { execution_id, reason: JobReason::Start }
    }

    pub fn resume(execution_id: ExecutionId) -> Self {
        Self { execution_id, reason: JobReason::Resume }
    }

    pub fn recover(execution_id: ExecutionId) -> Self {
        Self { execution_id, reason: JobReason::Recover }
    }
}

/// 任务队列发送端
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: flume::Sender<Job>,
}

impl JobQueue {
    /// 创建有界队列，返回发送端与交给 [`WorkerPool`] 的接收端
    pub fn bounded(capacity: usize) -> (Self, flume::Receiver<Job>) {
        let (tx, rx) = flume::bounded(capacity.max(1));
        (Self { tx }, rx)
    }

    /// 提交任务，队列满时等待
    pub async fn submit(&self, job: Job) -> Result<()> {
        self.tx
            .send_async(job)
            .await
            .map_err(|_| StepWeaveError::Unavailable("job queue is closed".into()))
    }

    /// 排队中的任务数
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// 工作池
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// 启动工作者
    pub fn spawn(engine: Arc<ExecutionEngine>, rx: flume::Receiver<Job>, config: &WorkerPoolConfig) -> Self {
        let workers = config.workers.max(1);
        let handles = (0..workers)
            .map(|worker| {
                let engine = engine.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    while let Ok(job) = rx.recv_async().await {
                        run_job(worker, &engine, job).await;
                    }
                    tracing::debug!(worker, "Worker stopped");
                })
            })
            .collect();

        tracing::info!(workers, capacity = config.queue_capacity, "Worker pool started");
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// 等待所有工作者退出 (队列关闭后)
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "Worker task aborted");
            }
        }
    }
}

async fn run_job(worker: usize, engine: &Arc<ExecutionEngine>, job: Job) {
    let id = job.execution_id;
    tracing::debug!(worker, execution_id = %id, reason = ?job.reason, "Job received");

    // 单独的任务隔离函数体 panic
    let pass = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.invoke(id).await })
    };

    match pass.await {
        Ok(Ok(status)) => {
            tracing::debug!(worker, execution_id = %id, status = status.as_str(), "Replay pass finished");
        }
        Ok(Err(err)) if err.is_transient() => {
            tracing::warn!(worker, execution_id = %id, error = %err, "Replay pass aborted by storage error");
            if let Err(retry_err) = engine.schedule_retry(id).await {
                tracing::error!(execution_id = %id, error = %retry_err, "Failed to schedule retry, waiting for recovery");
            }
        }
        Ok(Err(err)) => {
            tracing::error!(worker, execution_id = %id, error = %err, "Replay pass aborted");
        }
        Err(join_err) => {
            tracing::error!(worker, execution_id = %id, error = %join_err, "Function body panicked");
            let err = StepWeaveError::StepExecution {
                step: "<body>".into(),
                message: format!("function panicked: {join_err}"),
            };
            if let Err(mark_err) = engine.mark_failed(id, err).await {
                tracing::error!(execution_id = %id, error = %mark_err, "Failed to mark execution failed");
            }
        }
    }
}
