use flowcore::{Node, Tool, ToolContext, ToolOutput, ToolResolver, Value};
use flowtools::{JsonParseTool, SummarizeTool, TemplateTool, ToolRegistry};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

fn test_context() -> ToolContext {
    ToolContext::new("line", "line:node", "node", CancellationToken::new())
}

fn inputs(entries: &[(&str, Value)]) -> BTreeMap<String, Value> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn unwrap_value(output: ToolOutput) -> Value {
    match output {
        ToolOutput::Value(v) => v,
        ToolOutput::Stream(stream) => stream.drain_flatten(),
    }
}

#[tokio::test]
async fn test_registry_resolves_builtins() {
    let registry = ToolRegistry::builtins();
    let node = Node::new("n", "debug.echo");
    let tool = registry.resolve(&node).expect("echo should resolve");
    assert_eq!(tool.name(), "debug.echo");
}

#[tokio::test]
async fn test_registry_rejects_unknown_tool() {
    let registry = ToolRegistry::builtins();
    let node = Node::new("n", "no.such.tool");
    let err = registry.resolve(&node).expect_err("should not resolve");
    assert_eq!(err.node, "n");
    assert_eq!(err.tool, "no.such.tool");
}

#[tokio::test]
async fn test_template_renders_placeholders() {
    let output = TemplateTool
        .call(
            test_context(),
            inputs(&[
                ("template", Value::from("Hello {{name}}, you are {{age}}")),
                ("name", Value::from("Ada")),
                ("age", Value::from(36.0)),
            ]),
        )
        .await
        .expect("render should succeed");
    assert_eq!(
        unwrap_value(output),
        Value::String("Hello Ada, you are 36".to_string())
    );
}

#[tokio::test]
async fn test_template_requires_string_template() {
    let err = TemplateTool
        .call(test_context(), inputs(&[("template", Value::from(1.0))]))
        .await
        .expect_err("non-string template should fail");
    assert!(err.to_string().contains("template"));
}

#[tokio::test]
async fn test_json_parse_round_trip() {
    let output = JsonParseTool
        .call(
            test_context(),
            inputs(&[("json", Value::from(r#"{"a": [1, 2]}"#))]),
        )
        .await
        .expect("parse should succeed");
    let parsed = unwrap_value(output);
    let a = parsed.get_property("a").unwrap().as_array().unwrap().to_vec();
    assert_eq!(a, vec![Value::Number(1.0), Value::Number(2.0)]);
}

#[tokio::test]
async fn test_json_parse_rejects_garbage() {
    let result = JsonParseTool
        .call(test_context(), inputs(&[("json", Value::from("{nope"))]))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_summarize_counts_and_averages() {
    let ctx = test_context();
    let metrics = ctx.metrics.clone();
    let output = SummarizeTool
        .call(
            ctx,
            inputs(&[(
                "values",
                Value::Array(vec![Value::from(2.0), Value::from(4.0)]),
            )]),
        )
        .await
        .expect("summarize should succeed");
    let summary = unwrap_value(output);
    assert_eq!(summary.get_property("count"), Some(&Value::Number(2.0)));
    assert_eq!(summary.get_property("mean"), Some(&Value::Number(3.0)));
    assert_eq!(metrics.snapshot()["count"], 2.0);
    assert_eq!(metrics.snapshot()["mean"], 3.0);
}

#[tokio::test]
async fn test_summarize_skips_mean_for_mixed_values() {
    let output = SummarizeTool
        .call(
            test_context(),
            inputs(&[(
                "values",
                Value::Array(vec![Value::from("a"), Value::from(1.0)]),
            )]),
        )
        .await
        .expect("summarize should succeed");
    let summary = unwrap_value(output);
    assert_eq!(summary.get_property("count"), Some(&Value::Number(2.0)));
    assert_eq!(summary.get_property("mean"), None);
}

#[tokio::test]
async fn test_delay_observes_cancellation() {
    let ctx = test_context();
    let token = ctx.cancellation.clone();
    let call = flowtools::DelayTool.call(ctx, inputs(&[("ms", Value::from(60_000.0))]));
    tokio::pin!(call);

    tokio::select! {
        _ = &mut call => panic!("delay should not finish"),
        _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => token.cancel(),
    }
    let result = call.await;
    assert!(result.is_err(), "canceled delay should error");
}
