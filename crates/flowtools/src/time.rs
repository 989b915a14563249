use async_trait::async_trait;
use flowcore::{require_input, Tool, ToolContext, ToolError, ToolOutput, Value};
use std::collections::BTreeMap;
use std::time::Duration;

fn delay_ms(inputs: &BTreeMap<String, Value>) -> Result<u64, ToolError> {
    require_input(inputs, "ms")?
        .as_f64()
        .filter(|ms| *ms >= 0.0)
        .map(|ms| ms as u64)
        .ok_or_else(|| ToolError::InvalidInput {
            field: "ms".to_string(),
            expected: "non-negative number".to_string(),
        })
}

/// Suspends for the given number of milliseconds, honoring cancellation.
pub struct DelayTool;

#[async_trait]
impl Tool for DelayTool {
    fn name(&self) -> &str {
        "time.delay"
    }

    async fn call(
        &self,
        ctx: ToolContext,
        inputs: BTreeMap<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let ms = delay_ms(&inputs)?;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                Ok(ToolOutput::value(ms as f64))
            }
            _ = ctx.cancellation.cancelled() => {
                Err(ToolError::Execution("delay canceled".to_string()))
            }
        }
    }
}

/// Same delay, but by blocking the thread. Flows containing this tool
/// run on the blocking pool.
pub struct BlockingDelayTool;

#[async_trait]
impl Tool for BlockingDelayTool {
    fn name(&self) -> &str {
        "time.block"
    }

    fn is_suspending(&self) -> bool {
        false
    }

    async fn call(
        &self,
        _ctx: ToolContext,
        inputs: BTreeMap<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let ms = delay_ms(&inputs)?;
        std::thread::sleep(Duration::from_millis(ms));
        Ok(ToolOutput::value(ms as f64))
    }
}

/// Current UTC time as an RFC 3339 string.
pub struct NowTool;

#[async_trait]
impl Tool for NowTool {
    fn name(&self) -> &str {
        "time.now"
    }

    async fn call(
        &self,
        _ctx: ToolContext,
        _inputs: BTreeMap<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::value(
            chrono::Utc::now().to_rfc3339(),
        ))
    }
}
