use async_trait::async_trait;
use flowcore::{require_input, Tool, ToolContext, ToolError, ToolOutput, Value};
use std::collections::BTreeMap;

/// Parse a JSON string into a value.
pub struct JsonParseTool;

#[async_trait]
impl Tool for JsonParseTool {
    fn name(&self) -> &str {
        "transform.json_parse"
    }

    async fn call(
        &self,
        _ctx: ToolContext,
        inputs: BTreeMap<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let input = require_input(&inputs, "json")?
            .as_str()
            .ok_or_else(|| ToolError::InvalidInput {
                field: "json".to_string(),
                expected: "string".to_string(),
            })?;
        let parsed: serde_json::Value = serde_json::from_str(input)
            .map_err(|e| ToolError::Execution(format!("JSON parse error: {e}")))?;
        Ok(ToolOutput::Value(Value::from(parsed)))
    }
}

/// Serialize a value to a JSON string.
pub struct JsonStringifyTool;

#[async_trait]
impl Tool for JsonStringifyTool {
    fn name(&self) -> &str {
        "transform.json_stringify"
    }

    async fn call(
        &self,
        _ctx: ToolContext,
        inputs: BTreeMap<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let value = require_input(&inputs, "value")?;
        let json = serde_json::to_string_pretty(&value.to_json())
            .map_err(|e| ToolError::Execution(format!("JSON stringify error: {e}")))?;
        Ok(ToolOutput::value(json))
    }
}
