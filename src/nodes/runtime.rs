//! Nodes backed by the external model and tool runtimes.
//!
//! The engine does not interpret what these runtimes compute. It renders the
//! node's inputs, hands them over, and maps the reply onto a [`NodeRunResult`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::variable_pool::VariablePool;
use crate::dsl::schema::{LlmNodeData, LlmUsage, NodeRunResult, PromptMessage, RuntimeNodeData};
use crate::error::NodeError;
use crate::template::resolve_variables;

use super::executor::{NodeEventSink, NodeExecutionContext, NodeExecutor, NodeRunOutcome};
use super::utils::{parse_config, resolve_mappings};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub provider: String,
    pub model: String,
    pub messages: Vec<PromptMessage>,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    /// The runtime should publish chunks through the sink as they arrive.
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    #[serde(default)]
    pub usage: LlmUsage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Opaque language model invocation.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    async fn invoke(
        &self,
        request: ModelRequest,
        sink: &NodeEventSink,
    ) -> Result<ModelResponse, NodeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolKind {
    Tool,
    Code,
    HttpRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub node_id: String,
    pub inputs: HashMap<String, Value>,
    /// The node's full config, for runtime-specific fields.
    pub config: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub outputs: HashMap<String, Value>,
}

/// Opaque tool / code sandbox / HTTP invocation.
#[async_trait]
pub trait ToolRuntime: Send + Sync {
    async fn invoke(
        &self,
        kind: ToolKind,
        request: ToolRequest,
        sink: &NodeEventSink,
    ) -> Result<ToolResponse, NodeError>;
}

pub struct LlmNodeExecutor {
    runtime: Arc<dyn ModelRuntime>,
}

impl LlmNodeExecutor {
    pub fn new(runtime: Arc<dyn ModelRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl NodeExecutor for LlmNodeExecutor {
    async fn execute(
        &self,
        node_id: &str,
        config: &Value,
        variable_pool: &VariablePool,
        context: &NodeExecutionContext,
    ) -> Result<NodeRunOutcome, NodeError> {
        let data: LlmNodeData = parse_config(config)?;
        let messages = data
            .prompt_template
            .iter()
            .map(|m| {
                Ok(PromptMessage {
                    role: m.role.clone(),
                    text: resolve_variables(&m.text, variable_pool)?,
                })
            })
            .collect::<Result<Vec<_>, NodeError>>()?;

        let request = ModelRequest {
            provider: data.model.provider.clone(),
            model: data.model.name.clone(),
            messages: messages.clone(),
            parameters: data.model.completion_params.clone(),
            stream: data.stream,
        };

        let response = tokio::select! {
            response = self.runtime.invoke(request, &context.events) => response?,
            _ = context.cancel.cancelled() => return Err(NodeError::GenerationStopped),
        };

        let selector = vec![node_id.to_string(), "text".to_string()];
        if data.stream {
            context.events.stream_chunk(selector, "", true).await?;
        } else {
            context
                .events
                .stream_chunk(selector, response.text.clone(), true)
                .await?;
        }

        let mut outputs = HashMap::new();
        outputs.insert("text".to_string(), Value::String(response.text));
        outputs.insert("usage".to_string(), serde_json::to_value(&response.usage)?);
        if let Some(reason) = &response.finish_reason {
            outputs.insert("finish_reason".to_string(), Value::String(reason.clone()));
        }

        Ok(NodeRunResult {
            process_data: HashMap::from([(
                "prompts".to_string(),
                serde_json::to_value(&messages)?,
            )]),
            outputs,
            llm_usage: Some(response.usage),
            ..Default::default()
        }
        .into())
    }
}

/// Shared executor for tool, code and http-request nodes.
pub struct ToolNodeExecutor {
    kind: ToolKind,
    runtime: Arc<dyn ToolRuntime>,
}

impl ToolNodeExecutor {
    pub fn new(kind: ToolKind, runtime: Arc<dyn ToolRuntime>) -> Self {
        Self { kind, runtime }
    }
}

#[async_trait]
impl NodeExecutor for ToolNodeExecutor {
    async fn execute(
        &self,
        node_id: &str,
        config: &Value,
        variable_pool: &VariablePool,
        context: &NodeExecutionContext,
    ) -> Result<NodeRunOutcome, NodeError> {
        let data: RuntimeNodeData = parse_config(config)?;
        let inputs = resolve_mappings(&data.variables, variable_pool);
        let request = ToolRequest {
            node_id: node_id.to_string(),
            inputs: inputs.clone(),
            config: config.clone(),
        };

        let response = tokio::select! {
            response = self.runtime.invoke(self.kind, request, &context.events) => response?,
            _ = context.cancel.cancelled() => return Err(NodeError::GenerationStopped),
        };

        Ok(NodeRunResult {
            inputs,
            outputs: response.outputs,
            ..Default::default()
        }
        .into())
    }
}
