//! 请求处理函数

use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use sw_core::{
    EventEnvelope, ExecutionError, ExecutionId, ExecutionInstance, ExecutionStatus, StepRecord,
    StepStatus, StepWeaveError,
};

use crate::error::ApiError;
use crate::routes::AppState;

type ApiResult<T> = Result<Json<T>, ApiError>;

/// `POST /events` 响应
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAccepted {
    pub execution_ids: Vec<ExecutionId>,
}

/// 执行状态视图
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionView {
    pub id: ExecutionId,
    pub function_id: String,
    pub event: String,
    pub status: ExecutionStatus,
    /// 仅 Completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// 仅 Failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ExecutionInstance> for ExecutionView {
    fn from(instance: ExecutionInstance) -> Self {
        let result = match instance.status {
            ExecutionStatus::Completed => instance.output,
            _ => None,
        };
        Self {
            id: instance.id,
            function_id: instance.function_id,
            event: instance.event.name,
            status: instance.status,
            result,
            error: instance.error,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }
}

/// 步骤视图
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepView {
    pub name: String,
    pub status: StepStatus,
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wake_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<StepRecord> for StepView {
    fn from(record: StepRecord) -> Self {
        Self {
            name: record.step_name,
            status: record.status,
            result: record.result,
            wake_at: record.wake_at,
            completed_at: record.completed_at,
        }
    }
}

/// 函数视图
#[derive(Debug, Serialize, Deserialize)]
pub struct FunctionView {
    pub id: String,
    pub trigger: String,
}

/// 健康检查
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "message": "StepWeave ingress is running",
        "endpoints": {
            "events": "POST /events",
            "execution": "GET /executions/{id}",
            "steps": "GET /executions/{id}/steps",
            "cancel": "POST /executions/{id}/cancel",
            "functions": "GET /functions",
        },
    }))
}

/// 接收事件
///
/// 请求体手动解析，保证非法 JSON 与缺失字段都以 `InvalidEvent` 返回 400。
pub async fn send_event(State(state): State<AppState>, body: Bytes) -> ApiResult<EventAccepted> {
    let value: Value = serde_json::from_slice(&body)
        .map_err(|e| StepWeaveError::InvalidEvent(format!("malformed JSON body: {e}")))?;
    let envelope = EventEnvelope::from_json(&value, Utc::now())?;

    let execution_ids = state.dispatcher.handle_event(envelope).await?;
    Ok(Json(EventAccepted { execution_ids }))
}

/// 查询执行状态
pub async fn get_execution(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ExecutionView> {
    let id = parse_id(&id)?;
    let instance = state.engine.get(id).await?;
    Ok(Json(instance.into()))
}

/// 查询执行的步骤记录
pub async fn get_steps(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Vec<StepView>> {
    let id = parse_id(&id)?;
    let steps = state.engine.steps(id).await?;
    Ok(Json(steps.into_iter().map(StepView::from).collect()))
}

/// 取消执行
pub async fn cancel_execution(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ExecutionView> {
    let id = parse_id(&id)?;
    let instance = state.engine.cancel(id).await?;
    Ok(Json(instance.into()))
}

/// 已注册的函数
pub async fn list_functions(State(state): State<AppState>) -> Json<Vec<FunctionView>> {
    let functions = state
        .dispatcher
        .registry()
        .functions()
        .iter()
        .map(|f| FunctionView {
            id: f.id().to_string(),
            trigger: f.trigger().to_string(),
        })
        .collect();
    Json(functions)
}

/// 非法 ID 与未知 ID 一样视为不存在
fn parse_id(raw: &str) -> Result<ExecutionId, StepWeaveError> {
    Uuid::parse_str(raw).map_err(|_| StepWeaveError::NotFound(format!("execution {raw}")))
}
