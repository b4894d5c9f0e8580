//! Workflow-level error types.

use super::NodeError;
use thiserror::Error;

/// Errors reported by repositories and stores.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Record already consumed: {0}")]
    AlreadyConsumed(String),
    #[error("Invalid record state: {0}")]
    InvalidState(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(e: serde_json::Error) -> Self {
        RepositoryError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for RepositoryError {
    fn from(e: std::io::Error) -> Self {
        RepositoryError::Storage(e.to_string())
    }
}

/// Workflow-level errors
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("DSL parse error: {0}")]
    DslParseError(String),
    #[error("Unsupported DSL version: {found}, supported versions: {supported}")]
    UnsupportedVersion { found: String, supported: String },
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Graph build error: {0}")]
    GraphBuildError(String),
    #[error("Graph validation error: {0}")]
    GraphValidationError(String),
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    #[error("Node executor not found for type: {0}")]
    ExecutorNotFound(String),
    #[error("Execution timeout")]
    ExecutionTimeout,
    #[error("Max steps exceeded: {0}")]
    MaxStepsExceeded(i32),
    #[error("No start node found")]
    NoStartNode,
    #[error("Multiple start nodes found")]
    MultipleStartNodes,
    #[error("Cycle detected in graph")]
    CycleDetected,
    #[error("Workflow aborted: {0}")]
    Aborted(String),
    /// The queue was stopped; used for cooperative unwinding only.
    #[error("Generation stopped")]
    GenerationStopped,
    #[error("Node execution error: node={node_id}, error={error}")]
    NodeExecutionError {
        node_id: String,
        error: String,
        error_detail: Option<serde_json::Value>,
    },
    #[error("Variable already written: {0}")]
    VariableConflict(String),
    #[error("Invalid state transition for {entity}: {from} -> {to}")]
    InvalidStateTransition {
        entity: String,
        from: String,
        to: String,
    },
    #[error("Persistence error: {0}")]
    Persistence(#[from] RepositoryError),
    #[error("Pause not found or already resumed: {0}")]
    PauseNotFound(String),
    #[error("Resume conflict for pause {pause_id}: {reason}")]
    ResumeConflict { pause_id: String, reason: String },
    #[error("Node error: {0}")]
    NodeError(Box<NodeError>),
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<NodeError> for WorkflowError {
    fn from(value: NodeError) -> Self {
        if value.is_generation_stopped() {
            return WorkflowError::GenerationStopped;
        }
        WorkflowError::NodeError(Box::new(value))
    }
}

impl WorkflowError {
    /// Map a pause store failure onto the resume error taxonomy.
    pub fn from_resume_failure(pause_id: &str, err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(_) => WorkflowError::PauseNotFound(pause_id.to_string()),
            RepositoryError::AlreadyConsumed(_) => WorkflowError::ResumeConflict {
                pause_id: pause_id.to_string(),
                reason: "pause already resumed".to_string(),
            },
            RepositoryError::InvalidState(reason) => WorkflowError::ResumeConflict {
                pause_id: pause_id.to_string(),
                reason,
            },
            other => WorkflowError::Persistence(other),
        }
    }

    pub fn is_generation_stopped(&self) -> bool {
        matches!(self, WorkflowError::GenerationStopped)
    }
}
