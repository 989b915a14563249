//! Standard tool library
//!
//! Built-in tools for common operations, plus the registry that binds
//! flow nodes to them.

mod aggregate;
mod debug;
mod http;
mod registry;
mod template;
mod time;
mod transform;

pub use aggregate::SummarizeTool;
pub use debug::EchoTool;
pub use http::HttpRequestTool;
pub use registry::ToolRegistry;
pub use template::TemplateTool;
pub use time::{BlockingDelayTool, DelayTool, NowTool};
pub use transform::{JsonParseTool, JsonStringifyTool};
