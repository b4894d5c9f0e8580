//! Graph construction and representation.
//!
//! The [`Graph`] is built from a parsed [`WorkflowSchema`](crate::dsl::WorkflowSchema)
//! by [`build_graph`]. Per-run edge resolution lives in [`EdgeStates`]; per-run
//! node state lives in [`RuntimeNode`].

pub mod builder;
pub mod traversal;
pub mod types;

pub use builder::{build_graph, build_sub_graph};
pub use traversal::{EdgeResolution, EdgeStates};
pub use types::*;
