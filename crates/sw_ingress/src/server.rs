//! 入口服务器

use std::future::Future;

use axum::Router;

use sw_core::{Result, StepWeaveError};

use crate::config::ServerConfig;
use crate::routes::{build_router, AppState};

/// HTTP 入口服务器
pub struct IngressServer {
    config: ServerConfig,
    state: AppState,
}

impl IngressServer {
    /// 创建新服务器
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// 构建 Axum 路由
    pub fn build_router(&self) -> Router {
        build_router(self.state.clone(), &self.config)
    }

    /// 启动服务器，`shutdown` 完成后优雅退出
    pub async fn start<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.build_router();
        let listener = tokio::net::TcpListener::bind(&self.config.addr).await?;
        tracing::info!(addr = %self.config.addr, "Ingress listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| StepWeaveError::Unavailable(format!("ingress server error: {e}")))?;

        tracing::info!("Ingress stopped");
        Ok(())
    }

    /// 获取配置
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
