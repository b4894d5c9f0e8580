pub mod assigner;
pub mod control_flow;
pub mod executor;
pub mod flow;
pub mod human_input;
pub mod runtime;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use executor::*;
pub use runtime::{
    LlmNodeExecutor, ModelRequest, ModelResponse, ModelRuntime, ToolKind, ToolNodeExecutor,
    ToolRequest, ToolResponse, ToolRuntime,
};
