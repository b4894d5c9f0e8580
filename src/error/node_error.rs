use thiserror::Error;

use super::error_context::{ErrorCode, ErrorContext, ErrorRetryability};

/// Node-level errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Variable not found: {0}")]
    VariableNotFound(String),
    #[error("Execution error: {0}")]
    ExecutionError(String),
    #[error("Type error: {0}")]
    TypeError(String),
    #[error("Template error: {0}")]
    TemplateError(String),
    #[error("Input validation error: {0}")]
    InputValidationError(String),
    #[error("Timeout: node execution exceeded time limit")]
    Timeout,
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Model runtime error: {0}")]
    ModelRuntimeError(String),
    #[error("Tool runtime error: {0}")]
    ToolRuntimeError(String),
    /// The run was stopped while this node was still publishing events.
    #[error("Generation stopped")]
    GenerationStopped,
    #[error("Pause is not supported here: {0}")]
    PauseNotSupported(String),
    #[error("{source}")]
    WithContext {
        #[source]
        source: Box<NodeError>,
        context: ErrorContext,
    },
}

impl NodeError {
    /// Attach structured metadata (code, retryability) to this error.
    pub fn with_context(self, context: ErrorContext) -> Self {
        match self {
            NodeError::WithContext { source, .. } => NodeError::WithContext { source, context },
            other => NodeError::WithContext {
                source: Box::new(other),
                context,
            },
        }
    }

    pub fn error_context(&self) -> Option<&ErrorContext> {
        match self {
            NodeError::WithContext { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Unwraps context layers down to the underlying variant.
    pub fn root(&self) -> &NodeError {
        match self {
            NodeError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_generation_stopped(&self) -> bool {
        matches!(self.root(), NodeError::GenerationStopped)
    }

    pub fn is_retryable(&self) -> bool {
        if let Some(ctx) = self.error_context() {
            return ctx.retryability == ErrorRetryability::Retryable;
        }
        matches!(
            self.root(),
            NodeError::Timeout | NodeError::ModelRuntimeError(_) | NodeError::ToolRuntimeError(_)
        )
    }

    pub fn error_code(&self) -> ErrorCode {
        if let Some(ctx) = self.error_context() {
            return ctx.code.clone();
        }
        match self.root() {
            NodeError::ConfigError(_) => ErrorCode::ConfigError,
            NodeError::VariableNotFound(_) => ErrorCode::VariableNotFound,
            NodeError::TypeError(_) => ErrorCode::TypeError,
            NodeError::TemplateError(_) => ErrorCode::TemplateError,
            NodeError::InputValidationError(_) => ErrorCode::InputValidationError,
            NodeError::Timeout => ErrorCode::Timeout,
            NodeError::SerializationError(_) => ErrorCode::SerializationError,
            NodeError::ModelRuntimeError(_) => ErrorCode::ModelRuntimeError,
            NodeError::ToolRuntimeError(_) => ErrorCode::ToolRuntimeError,
            NodeError::GenerationStopped => ErrorCode::GenerationStopped,
            NodeError::ExecutionError(_)
            | NodeError::PauseNotSupported(_)
            | NodeError::WithContext { .. } => ErrorCode::InternalError,
        }
    }

    pub fn to_structured_json(&self) -> serde_json::Value {
        match self.error_context() {
            Some(ctx) => serde_json::to_value(ctx).unwrap_or(serde_json::Value::Null),
            None => serde_json::json!({
                "code": self.error_code(),
                "message": self.to_string(),
            }),
        }
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        NodeError::SerializationError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_context_keeps_root() {
        let err = NodeError::Timeout.with_context(ErrorContext::non_retryable(
            ErrorCode::Timeout,
            "slow",
        ));
        assert!(matches!(err.root(), NodeError::Timeout));
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Timeout: node execution exceeded time limit");
    }

    #[test]
    fn test_default_retryability() {
        assert!(NodeError::ModelRuntimeError("429".into()).is_retryable());
        assert!(!NodeError::ConfigError("bad".into()).is_retryable());
    }

    #[test]
    fn test_generation_stopped_detected_through_context() {
        let err = NodeError::GenerationStopped
            .with_context(ErrorContext::non_retryable(ErrorCode::GenerationStopped, "stop"));
        assert!(err.is_generation_stopped());
        assert_eq!(err.error_code(), ErrorCode::GenerationStopped);
    }
}
