//! 守护进程配置
//!
//! 来源优先级 (后者覆盖前者): 默认值 → `stepweave.toml` (可选) → `STEPWEAVE_*` 环境变量。

use std::net::SocketAddr;
use std::time::Duration;

use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use sw_core::{Result, StepWeaveError};
use sw_durable::{EngineConfig, RetryPolicy, SchedulerConfig, StoreConfig, WorkerPoolConfig};
use sw_ingress::ServerConfig;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "STEPWEAVE";

/// 配置文件名 (不含扩展名)
pub const CONFIG_FILE: &str = "stepweave";

/// 守护进程配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// HTTP 监听地址
    pub listen_addr: String,
    /// 请求体上限 (字节)
    pub body_limit: usize,
    /// SQLite 数据库 URL
    pub database_url: String,
    pub enable_wal: bool,
    pub max_connections: u32,
    /// 工作者数量
    pub workers: usize,
    pub queue_capacity: usize,
    /// 调度器轮询间隔 (毫秒)
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    /// 单步超时 (毫秒，0 表示不限)
    pub step_timeout_ms: u64,
    /// 终态实例保留时长 (秒)
    pub retention_secs: u64,
    /// 清理间隔 (秒)
    pub prune_interval_secs: u64,
    /// 存储瞬时错误的最大尝试次数
    pub storage_retry_attempts: u32,
    /// 重放因存储错误中止后的重试等待 (毫秒)
    pub retry_backoff_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let store = StoreConfig::default();
        let server = ServerConfig::default();
        let workers = WorkerPoolConfig::default();
        let scheduler = SchedulerConfig::default();
        let engine = EngineConfig::default();

        Self {
            listen_addr: server.addr.to_string(),
            body_limit: server.body_limit,
            database_url: store.database_url,
            enable_wal: store.enable_wal,
            max_connections: store.max_connections,
            workers: workers.workers,
            queue_capacity: workers.queue_capacity,
            poll_interval_ms: scheduler.poll_interval.as_millis() as u64,
            batch_size: scheduler.batch_size,
            step_timeout_ms: 0,
            retention_secs: engine.retention.as_secs(),
            prune_interval_secs: 60 * 60,
            storage_retry_attempts: engine.storage_retry.max_attempts,
            retry_backoff_ms: engine.retry_backoff.as_millis() as u64,
        }
    }
}

impl DaemonConfig {
    /// 从配置文件与环境变量加载
    pub fn load() -> Result<Self> {
        Self::build(
            config::Config::builder()
                .add_source(File::with_name(CONFIG_FILE).required(false))
                .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true)),
        )
    }

    /// 从 TOML 文本加载
    pub fn from_toml(text: &str) -> Result<Self> {
        Self::build(config::Config::builder().add_source(File::from_str(text, FileFormat::Toml)))
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| StepWeaveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(StepWeaveError::Config("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(StepWeaveError::Config("queue_capacity must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(StepWeaveError::Config("poll_interval_ms must be positive".into()));
        }
        if self.storage_retry_attempts == 0 {
            return Err(StepWeaveError::Config("storage_retry_attempts must be at least 1".into()));
        }
        if self.retry_backoff_ms == 0 {
            return Err(StepWeaveError::Config("retry_backoff_ms must be positive".into()));
        }
        if self.prune_interval_secs == 0 {
            return Err(StepWeaveError::Config("prune_interval_secs must be positive".into()));
        }
        self.listen_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .map_err(|e| StepWeaveError::Config(format!("invalid listen_addr '{}': {e}", self.listen_addr)))
    }

    pub fn server(&self) -> Result<ServerConfig> {
        Ok(ServerConfig {
            addr: self.listen_addr()?,
            body_limit: self.body_limit,
        })
    }

    pub fn store(&self) -> StoreConfig {
        StoreConfig {
            database_url: self.database_url.clone(),
            enable_wal: self.enable_wal,
            max_connections: self.max_connections,
        }
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            step_timeout: (self.step_timeout_ms > 0).then(|| Duration::from_millis(self.step_timeout_ms)),
            retention: Duration::from_secs(self.retention_secs),
            storage_retry: RetryPolicy {
                max_attempts: self.storage_retry_attempts,
                ..RetryPolicy::default()
            },
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            batch_size: self.batch_size,
        }
    }

    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
        }
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults_are_valid() {
        let config = DaemonConfig::default();
        assert_ok!(config.validate());
        assert_eq!(config.server().unwrap().addr.port(), 3000);
        assert_eq!(config.engine().step_timeout, None);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = DaemonConfig::from_toml(
            r#"
            listen_addr = "127.0.0.1:8080"
            workers = 8
            step_timeout_ms = 1500
            retry_backoff_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_addr().unwrap().port(), 8080);
        assert_eq!(config.worker_pool().workers, 8);
        assert_eq!(config.engine().step_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.engine().retry_backoff, Duration::from_millis(250));
        assert_eq!(config.database_url, DaemonConfig::default().database_url);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert_err!(DaemonConfig::from_toml("workers = 0"));
        assert_err!(DaemonConfig::from_toml("poll_interval_ms = 0"));
        assert_err!(DaemonConfig::from_toml("retry_backoff_ms = 0"));
        assert_err!(DaemonConfig::from_toml(r#"listen_addr = "nowhere""#));
    }
}
