//! Container node executors: Loop and Iteration.
//!
//! Both run an embedded body through a
//! [`SubGraphRunner`](crate::core::sub_graph_runner::SubGraphRunner) on a copy
//! of the parent pool, so body outputs never leak into the parent run except
//! through the container's own outputs.

pub mod iteration;
pub mod loop_node;

pub use iteration::IterationNodeExecutor;
pub use loop_node::LoopNodeExecutor;

use std::sync::Arc;

use crate::core::sub_graph_runner::{DefaultSubGraphRunner, SubGraphRunner};
use crate::error::NodeError;
use crate::graph::{build_sub_graph, Graph};
use crate::dsl::schema::SubGraphSchema;

pub(crate) fn default_sub_graph_runner() -> Arc<dyn SubGraphRunner> {
    Arc::new(DefaultSubGraphRunner)
}

pub(crate) fn build_body(schema: &SubGraphSchema) -> Result<Arc<Graph>, NodeError> {
    build_sub_graph(schema)
        .map(Arc::new)
        .map_err(|e| NodeError::ConfigError(format!("invalid body: {}", e)))
}
