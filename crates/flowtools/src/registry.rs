use flowcore::{Node, ResolveError, Tool, ToolResolver};
use std::collections::HashMap;
use std::sync::Arc;

/// Name-keyed tool lookup. Nodes bind to tools by the `tool` field of
/// the flow document.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All built-in tools registered.
    pub fn builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::aggregate::SummarizeTool));
        registry.register(Arc::new(crate::debug::EchoTool));
        registry.register(Arc::new(crate::http::HttpRequestTool::new()));
        registry.register(Arc::new(crate::template::TemplateTool));
        registry.register(Arc::new(crate::time::BlockingDelayTool));
        registry.register(Arc::new(crate::time::DelayTool));
        registry.register(Arc::new(crate::time::NowTool));
        registry.register(Arc::new(crate::transform::JsonParseTool));
        registry.register(Arc::new(crate::transform::JsonStringifyTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl ToolResolver for ToolRegistry {
    fn resolve(&self, node: &Node) -> Result<Arc<dyn Tool>, ResolveError> {
        self.tools
            .get(&node.tool)
            .cloned()
            .ok_or_else(|| ResolveError {
                node: node.name.clone(),
                tool: node.tool.clone(),
                message: "no such tool registered".to_string(),
            })
    }
}
