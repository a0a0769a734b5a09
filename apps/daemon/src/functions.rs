//! 内置示例函数

use serde_json::{json, Value};

use sw_core::{EventEnvelope, Result};
use sw_durable::{FunctionDefinition, FunctionRegistry, StepContext};

/// 注册全部内置函数
pub fn register_all(registry: &mut FunctionRegistry) -> Result<()> {
    registry.register(hello_world())?;
    registry.register(multi_step())?;
    Ok(())
}

/// `test/hello-world` → `{message: "hello <name>"}`
pub fn hello_world() -> FunctionDefinition {
    FunctionDefinition::new(
        "hello-world-function",
        "test/hello-world",
        |event: EventEnvelope, _step: StepContext| async move {
            let name = event
                .data
                .get("name")
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())
                .unwrap_or("Hello World");
            tracing::info!(event = %event.name, "hello from stepweave");
            Ok(json!({ "message": format!("hello {name}") }))
        },
    )
}

/// `demo/multi-step`: step-1 → 睡眠 5 秒 → step-2
pub fn multi_step() -> FunctionDefinition {
    FunctionDefinition::new(
        "multi-step-function",
        "demo/multi-step",
        |_event: EventEnvelope, step: StepContext| async move {
            let result1: Value = step
                .run("step-1", || async {
                    tracing::info!("executing step-1");
                    Ok(json!({ "data": "result from step 1" }))
                })
                .await?;

            step.sleep_for("await-sleep", "5s").await?;

            let previous = result1.clone();
            let result2: Value = step
                .run("step-2", || async move {
                    tracing::info!("executing step-2");
                    Ok(json!({ "data": "result from step 2", "previous": previous }))
                })
                .await?;

            Ok(json!({
                "message": "multi step workflow completed",
                "results": [result1, result2],
            }))
        },
    )
}
