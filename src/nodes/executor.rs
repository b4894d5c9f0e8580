use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::core::event_bus::{EventEmitter, GraphEngineEvent};
use crate::core::pause::PauseReason;
use crate::core::runtime_context::RuntimeContext;
use crate::core::variable_pool::VariablePool;
use crate::dsl::schema::{NodeRunResult, NodeType};
use crate::error::NodeError;

use super::runtime::{ModelRuntime, ToolKind, ToolRuntime};

/// What a node execution produced: a result, or a request to suspend the run.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeRunOutcome {
    Completed(NodeRunResult),
    Paused(PauseReason),
}

impl From<NodeRunResult> for NodeRunOutcome {
    fn from(result: NodeRunResult) -> Self {
        NodeRunOutcome::Completed(result)
    }
}

/// Trait for node execution. Each node type implements this.
///
/// Executors receive a read-only snapshot of the pool and report outputs in the
/// returned result; the dispatcher owns all pool writes.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(
        &self,
        node_id: &str,
        config: &Value,
        variable_pool: &VariablePool,
        context: &NodeExecutionContext,
    ) -> Result<NodeRunOutcome, NodeError>;
}

/// Event publisher bound to one node execution.
#[derive(Clone)]
pub struct NodeEventSink {
    emitter: EventEmitter,
    exec_id: String,
    node_id: String,
}

impl NodeEventSink {
    pub fn new(emitter: EventEmitter, exec_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        NodeEventSink {
            emitter,
            exec_id: exec_id.into(),
            node_id: node_id.into(),
        }
    }

    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Fails with [`NodeError::GenerationStopped`] once the run's queue is stopped.
    pub async fn publish(&self, event: GraphEngineEvent) -> Result<(), NodeError> {
        self.emitter.emit(event).await.map_err(|e| {
            if e.is_generation_stopped() {
                NodeError::GenerationStopped
            } else {
                NodeError::ExecutionError(e.to_string())
            }
        })
    }

    pub async fn stream_chunk(
        &self,
        selector: Vec<String>,
        chunk: impl Into<String>,
        is_final: bool,
    ) -> Result<(), NodeError> {
        self.publish(GraphEngineEvent::NodeRunStreamChunk {
            id: self.exec_id.clone(),
            node_id: self.node_id.clone(),
            selector,
            chunk: chunk.into(),
            is_final,
        })
        .await
    }

    pub async fn message(&self, text: impl Into<String>) -> Result<(), NodeError> {
        self.publish(GraphEngineEvent::NodeRunMessage {
            id: self.exec_id.clone(),
            node_id: self.node_id.clone(),
            text: text.into(),
        })
        .await
    }

    pub async fn agent_log(&self, label: impl Into<String>, data: Value) -> Result<(), NodeError> {
        self.publish(GraphEngineEvent::AgentLog {
            id: self.exec_id.clone(),
            node_id: self.node_id.clone(),
            label: label.into(),
            data,
        })
        .await
    }
}

/// Everything an executor may use besides its config and the pool snapshot.
#[derive(Clone)]
pub struct NodeExecutionContext {
    pub runtime: Arc<RuntimeContext>,
    pub registry: Arc<NodeExecutorRegistry>,
    pub config: Arc<EngineConfig>,
    pub events: NodeEventSink,
    /// Cancelled when the run is aborted.
    pub cancel: CancellationToken,
    pub exec_id: String,
    pub node_title: String,
    pub node_type: NodeType,
}

impl NodeExecutionContext {
    pub fn now(&self) -> i64 {
        self.runtime.time_provider.now_timestamp()
    }
}

/// Registry of node executors by node type.
pub struct NodeExecutorRegistry {
    executors: HashMap<NodeType, Arc<dyn NodeExecutor>>,
}

impl NodeExecutorRegistry {
    /// Registry with every node type that needs no external collaborator.
    pub fn new() -> Self {
        let mut registry = NodeExecutorRegistry {
            executors: HashMap::new(),
        };
        registry.register(NodeType::Start, Arc::new(super::control_flow::StartNodeExecutor));
        registry.register(NodeType::End, Arc::new(super::control_flow::EndNodeExecutor));
        registry.register(NodeType::Answer, Arc::new(super::control_flow::AnswerNodeExecutor));
        registry.register(NodeType::IfElse, Arc::new(super::control_flow::IfElseNodeExecutor));
        registry.register(
            NodeType::VariableAssigner,
            Arc::new(super::assigner::VariableAssignerExecutor),
        );
        registry.register(NodeType::HumanInput, Arc::new(super::human_input::HumanInputExecutor));
        registry.register(NodeType::Loop, Arc::new(super::flow::LoopNodeExecutor::default()));
        registry.register(NodeType::Iteration, Arc::new(super::flow::IterationNodeExecutor::default()));
        registry
    }

    pub fn with_model_runtime(mut self, runtime: Arc<dyn ModelRuntime>) -> Self {
        self.register(
            NodeType::Llm,
            Arc::new(super::runtime::LlmNodeExecutor::new(runtime)),
        );
        self
    }

    /// Route tool, code and http-request nodes through `runtime`.
    pub fn with_tool_runtime(mut self, runtime: Arc<dyn ToolRuntime>) -> Self {
        for (node_type, kind) in [
            (NodeType::Tool, ToolKind::Tool),
            (NodeType::Code, ToolKind::Code),
            (NodeType::HttpRequest, ToolKind::HttpRequest),
        ] {
            self.register(
                node_type,
                Arc::new(super::runtime::ToolNodeExecutor::new(kind, runtime.clone())),
            );
        }
        self
    }

    pub fn register(&mut self, node_type: NodeType, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(node_type, executor);
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(&node_type).cloned()
    }

    pub fn contains(&self, node_type: NodeType) -> bool {
        self.executors.contains_key(&node_type)
    }
}

impl Default for NodeExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registrations() {
        let registry = NodeExecutorRegistry::new();
        for node_type in [
            NodeType::Start,
            NodeType::End,
            NodeType::Answer,
            NodeType::IfElse,
            NodeType::VariableAssigner,
            NodeType::HumanInput,
            NodeType::Loop,
            NodeType::Iteration,
        ] {
            assert!(registry.contains(node_type), "{} missing", node_type);
        }
        // runtime-backed nodes need a collaborator
        assert!(!registry.contains(NodeType::Llm));
        assert!(!registry.contains(NodeType::Code));
    }

    #[tokio::test]
    async fn test_detached_sink_accepts_events() {
        let sink = NodeEventSink::new(EventEmitter::detached(), "x1", "n1");
        sink.stream_chunk(vec!["n1".into(), "text".into()], "hi", true)
            .await
            .unwrap();
        assert_eq!(sink.exec_id(), "x1");
    }
}
