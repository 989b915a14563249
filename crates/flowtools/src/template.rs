use async_trait::async_trait;
use flowcore::{require_input, Tool, ToolContext, ToolError, ToolOutput, Value};
use std::collections::BTreeMap;

/// Renders a `{{name}}` template against the remaining inputs.
pub struct TemplateTool;

#[async_trait]
impl Tool for TemplateTool {
    fn name(&self) -> &str {
        "template.render"
    }

    async fn call(
        &self,
        _ctx: ToolContext,
        inputs: BTreeMap<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let template = require_input(&inputs, "template")?
            .as_str()
            .ok_or_else(|| ToolError::InvalidInput {
                field: "template".to_string(),
                expected: "string".to_string(),
            })?
            .to_string();

        let mut rendered = template;
        for (name, value) in &inputs {
            if name == "template" {
                continue;
            }
            let placeholder = format!("{{{{{name}}}}}");
            if rendered.contains(&placeholder) {
                rendered = rendered.replace(&placeholder, &value.to_string());
            }
        }
        Ok(ToolOutput::value(rendered))
    }
}
