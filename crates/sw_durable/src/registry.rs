//! 函数注册表

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use sw_core::{EventEnvelope, Result, StepWeaveError};

use crate::context::StepContext;

/// 函数体
///
/// 每次重放都会从头调用；除 `step.run` / `step.sleep` 外必须是确定性的。
#[async_trait]
pub trait FunctionHandler: Send + Sync + 'static {
    async fn call(&self, event: EventEnvelope, step: StepContext) -> Result<Value>;
}

#[async_trait]
impl<F, Fut> FunctionHandler for F
where
    F: Fn(EventEnvelope, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn call(&self, event: EventEnvelope, step: StepContext) -> Result<Value> {
        (self)(event, step).await
    }
}

/// 函数定义: ID + 触发事件 + 函数体
#[derive(Clone)]
pub struct FunctionDefinition {
    id: String,
    trigger: String,
    handler: Arc<dyn FunctionHandler>,
}

impl FunctionDefinition {
    /// 以闭包创建函数
    pub fn new<F, Fut>(id: impl Into<String>, trigger: impl Into<String>, handler: F) -> Self
    where
        F: Fn(EventEnvelope, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::from_handler(id, trigger, Arc::new(handler))
    }

    /// 以实现了 [`FunctionHandler`] 的类型创建函数
    pub fn from_handler(
        id: impl Into<String>,
        trigger: impl Into<String>,
        handler: Arc<dyn FunctionHandler>,
    ) -> Self {
        Self {
            id: id.into(),
            trigger: trigger.into(),
            handler,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    pub fn handler(&self) -> &Arc<dyn FunctionHandler> {
        &self.handler
    }
}

impl fmt::Debug for FunctionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDefinition")
            .field("id", &self.id)
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

/// 函数注册表
///
/// 注册完成后以 `Arc` 共享，之后只读。
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    /// 按注册顺序保存
    functions: Vec<FunctionDefinition>,
    /// ID → 下标
    by_id: HashMap<String, usize>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册函数，ID 重复时返回 `DuplicateId`
    pub fn register(&mut self, definition: FunctionDefinition) -> Result<()> {
        if definition.id.trim().is_empty() {
            return Err(StepWeaveError::Validation("function id must not be empty".into()));
        }
        if definition.trigger.trim().is_empty() {
            return Err(StepWeaveError::Validation(format!(
                "function {} has an empty trigger",
                definition.id
            )));
        }
        if self.by_id.contains_key(&definition.id) {
            return Err(StepWeaveError::DuplicateId(definition.id));
        }

        tracing::info!(function_id = %definition.id, trigger = %definition.trigger, "Function registered");
        self.by_id.insert(definition.id.clone(), self.functions.len());
        self.functions.push(definition);
        Ok(())
    }

    /// 订阅该事件的函数，按注册顺序
    pub fn resolve(&self, event_name: &str) -> Vec<FunctionDefinition> {
        self.functions
            .iter()
            .filter(|f| f.trigger == event_name)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&FunctionDefinition> {
        self.by_id.get(id).map(|&i| &self.functions[i])
    }

    pub fn functions(&self) -> &[FunctionDefinition] {
        &self.functions
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
