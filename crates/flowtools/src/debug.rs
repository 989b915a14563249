use async_trait::async_trait;
use flowcore::{require_input, Tool, ToolContext, ToolError, ToolOutput, Value};
use std::collections::BTreeMap;

/// Logs its input and passes it through unchanged.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "debug.echo"
    }

    async fn call(
        &self,
        ctx: ToolContext,
        inputs: BTreeMap<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let value = require_input(&inputs, "value")?;
        tracing::info!(node = %ctx.node_name, value = %value, "echo");
        Ok(ToolOutput::Value(value.clone()))
    }
}
