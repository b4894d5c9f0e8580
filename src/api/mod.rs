//! Public API layer: stable entry points for external consumers.

mod handle;
mod runner;

pub use handle::{ExecutionStatus, WorkflowHandle};
pub use runner::{RunRequest, WorkflowRunner, WorkflowRunnerBuilder};
