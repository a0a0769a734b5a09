//! # sw_ingress - StepWeave HTTP Ingress
//!
//! 外部事件投递与执行状态查询：
//! - `POST /events`: 事件 → 派发器，立即返回创建的执行 ID
//! - `GET /executions/{id}`: 执行状态与最终结果

pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod server;

pub use config::ServerConfig;
pub use error::{ApiError, ErrorResponse};
pub use routes::{build_router, AppState};
pub use server::IngressServer;
