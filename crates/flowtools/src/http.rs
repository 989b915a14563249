use async_trait::async_trait;
use chrono::Utc;
use flowcore::{require_input, ApiCall, Tool, ToolContext, ToolError, ToolOutput, Value};
use std::collections::BTreeMap;

/// HTTP request tool. Each call is recorded as an api trace on the node
/// run.
pub struct HttpRequestTool {
    client: reqwest::Client,
}

impl HttpRequestTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequestTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpRequestTool {
    fn name(&self) -> &str {
        "http.request"
    }

    async fn call(
        &self,
        ctx: ToolContext,
        inputs: BTreeMap<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let url = require_input(&inputs, "url")?
            .as_str()
            .ok_or_else(|| ToolError::InvalidInput {
                field: "url".to_string(),
                expected: "string".to_string(),
            })?
            .to_string();
        let method = inputs
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();

        tracing::info!(node = %ctx.node_name, %method, %url, "http request");
        let mut trace = ApiCall::new("http.request");
        trace.node = Some(ctx.node_name.clone());
        trace.start_time = Some(Utc::now());

        let request = match method.as_str() {
            "GET" => self.client.get(&url),
            "POST" => {
                let mut req = self.client.post(&url);
                if let Some(body) = inputs.get("body") {
                    req = req.json(&body.to_json());
                }
                req
            }
            "PUT" => {
                let mut req = self.client.put(&url);
                if let Some(body) = inputs.get("body") {
                    req = req.json(&body.to_json());
                }
                req
            }
            "DELETE" => self.client.delete(&url),
            other => {
                return Err(ToolError::Execution(format!(
                    "unsupported method: {other}"
                )));
            }
        };

        let outcome = tokio::select! {
            outcome = request.send() => outcome,
            _ = ctx.cancellation.cancelled() => {
                return Err(ToolError::Execution("request canceled".to_string()));
            }
        };
        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                trace.end_time = Some(Utc::now());
                trace.error = Some(e.to_string());
                ctx.traces.record(trace);
                return Err(ToolError::Execution(format!("request failed: {e}")));
            }
        };

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::Execution(format!("failed to read response: {e}")))?;
        trace.end_time = Some(Utc::now());
        ctx.traces.record(trace);

        let mut output = BTreeMap::new();
        output.insert("status".to_string(), Value::from(status as f64));
        output.insert("body".to_string(), Value::from(body));
        Ok(ToolOutput::Value(Value::Object(output)))
    }
}
