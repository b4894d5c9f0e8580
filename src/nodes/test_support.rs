use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::core::event_bus::EventEmitter;
use crate::core::runtime_context::RuntimeContext;
use crate::dsl::schema::NodeType;

use super::executor::{NodeEventSink, NodeExecutionContext, NodeExecutorRegistry};

pub(crate) fn context(node_id: &str, node_type: NodeType) -> NodeExecutionContext {
    context_with(node_id, node_type, EventEmitter::detached(), NodeExecutorRegistry::new())
}

pub(crate) fn context_with(
    node_id: &str,
    node_type: NodeType,
    emitter: EventEmitter,
    registry: NodeExecutorRegistry,
) -> NodeExecutionContext {
    NodeExecutionContext {
        runtime: Arc::new(RuntimeContext::default()),
        registry: Arc::new(registry),
        config: Arc::new(EngineConfig::default()),
        events: NodeEventSink::new(emitter, "exec-1", node_id),
        cancel: CancellationToken::new(),
        exec_id: "exec-1".to_string(),
        node_title: node_id.to_string(),
        node_type,
    }
}
