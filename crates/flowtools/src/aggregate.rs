use async_trait::async_trait;
use flowcore::{require_input, Tool, ToolContext, ToolError, ToolOutput, Value};
use std::collections::BTreeMap;

/// Batch-scoped summary over an across-row list: count, and mean when
/// the values are numeric. Logs both as run metrics.
pub struct SummarizeTool;

#[async_trait]
impl Tool for SummarizeTool {
    fn name(&self) -> &str {
        "aggregate.summarize"
    }

    async fn call(
        &self,
        ctx: ToolContext,
        inputs: BTreeMap<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let values = require_input(&inputs, "values")?
            .as_array()
            .ok_or_else(|| ToolError::InvalidInput {
                field: "values".to_string(),
                expected: "list".to_string(),
            })?;

        let count = values.len();
        ctx.metrics.log_metric("count", count as f64);

        let mut output = BTreeMap::new();
        output.insert("count".to_string(), Value::from(count as f64));

        let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
        if !numbers.is_empty() && numbers.len() == count {
            let mean = numbers.iter().sum::<f64>() / count as f64;
            ctx.metrics.log_metric("mean", mean);
            output.insert("mean".to_string(), Value::from(mean));
        }
        Ok(ToolOutput::Value(Value::Object(output)))
    }
}
