//! 路由定义

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use sw_durable::{Dispatcher, ExecutionEngine};

use crate::config::ServerConfig;
use crate::handlers;

/// 处理函数共享状态
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub engine: Arc<ExecutionEngine>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, engine: Arc<ExecutionEngine>) -> Self {
        Self { dispatcher, engine }
    }
}

/// 构建 Axum 路由
pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route("/", get(handlers::health))
        .route("/events", post(handlers::send_event))
        .route("/functions", get(handlers::list_functions))
        .route("/executions/:id", get(handlers::get_execution))
        .route("/executions/:id/steps", get(handlers::get_steps))
        .route("/executions/:id/cancel", post(handlers::cancel_execution))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
