//! StepWeave Daemon - 持久化步骤函数守护进程

mod config;
mod functions;

use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sw_core::SystemClock;
use sw_durable::{
    Dispatcher, ExecutionEngine, FunctionRegistry, JobQueue, SleepScheduler, SqliteStore, WorkerPool,
};
use sw_ingress::{AppState, IngressServer};

use crate::config::DaemonConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stepweave_daemon=debug,sw_durable=debug,sw_ingress=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("StepWeave Daemon starting...");

    let config = DaemonConfig::load()?;
    tracing::debug!(?config, "Configuration loaded");

    // 初始化存储
    let store = Arc::new(SqliteStore::connect(&config.store()).await?);
    tracing::info!(database = %config.database_url, "Durable store initialized");

    // 注册函数
    let mut registry = FunctionRegistry::new();
    functions::register_all(&mut registry)?;
    let registry = Arc::new(registry);
    tracing::info!("Function registry initialized with {} functions", registry.len());

    // 初始化引擎与调度器
    let clock = Arc::new(SystemClock);
    let scheduler = Arc::new(SleepScheduler::new(store.clone(), clock.clone(), config.scheduler()));
    let engine = Arc::new(ExecutionEngine::new(
        registry.clone(),
        store,
        scheduler.clone(),
        clock,
        config.engine(),
    ));

    // 启动工作池
    let pool_config = config.worker_pool();
    let (queue, rx) = JobQueue::bounded(pool_config.queue_capacity);
    let pool = WorkerPool::spawn(engine.clone(), rx, &pool_config);

    let dispatcher = Dispatcher::new(registry, engine.clone(), queue.clone());
    let recovered = dispatcher.recover().await?;
    tracing::info!("Recovered {} unfinished executions", recovered);

    // 启动调度器与清理任务
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.run(queue, shutdown_rx.clone()));
    let janitor_task = tokio::spawn(run_janitor(engine.clone(), config.prune_interval(), shutdown_rx));

    // 启动 HTTP 入口
    let server = IngressServer::new(config.server()?, AppState::new(dispatcher, engine));
    tracing::info!("StepWeave Daemon is ready on {}", server.config().addr);
    tracing::info!("Press Ctrl+C to shutdown...");

    server
        .start(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("Shutting down...");
    let _ = shutdown_tx.send(true);
    scheduler_task.await?;
    janitor_task.await?;

    // 释放最后一个队列发送端，等待工作者处理完剩余任务
    drop(server);
    pool.join().await;
    tracing::info!("StepWeave Daemon stopped");

    Ok(())
}

/// 定期清理超过保留期的执行
async fn run_janitor(engine: Arc<ExecutionEngine>, interval: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.prune_expired().await {
                    Ok(0) => {}
                    Ok(pruned) => tracing::info!(pruned, "Janitor pass finished"),
                    Err(err) => tracing::warn!(error = %err, "Janitor pass failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
