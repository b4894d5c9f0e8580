//! Engine-internal event vocabulary and the emitter the dispatcher uses.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::core::pause::PauseReason;
use crate::core::queue_manager::{map_engine_event, PublishFrom, QueueManager};
use crate::dsl::schema::{NodeRunResult, NodeType};
use crate::error::WorkflowError;

/// Events produced while a graph runs. Mapped onto the external
/// [`QueueEvent`](crate::core::queue_manager::QueueEvent) vocabulary by
/// [`map_engine_event`].
#[derive(Debug, Clone, Serialize)]
pub enum GraphEngineEvent {
    // === Graph-level events ===
    GraphRunStarted {
        execution_id: String,
        workflow_id: String,
        inputs: HashMap<String, Value>,
    },
    GraphRunSucceeded {
        outputs: HashMap<String, Value>,
    },
    GraphRunPartialSucceeded {
        exceptions_count: usize,
        outputs: HashMap<String, Value>,
    },
    GraphRunFailed {
        error: String,
        exceptions_count: usize,
    },
    GraphRunAborted {
        reason: Option<String>,
        outputs: HashMap<String, Value>,
    },
    GraphRunPaused {
        pause_id: String,
        reasons: Vec<PauseReason>,
        outputs: HashMap<String, Value>,
    },

    // === Node-level events ===
    NodeRunStarted {
        id: String,
        node_id: String,
        node_type: NodeType,
        node_title: String,
        predecessor_node_id: Option<String>,
    },
    NodeRunSucceeded {
        id: String,
        node_id: String,
        node_type: NodeType,
        node_title: String,
        result: NodeRunResult,
    },
    NodeRunException {
        id: String,
        node_id: String,
        node_type: NodeType,
        node_title: String,
        result: NodeRunResult,
        error: String,
    },
    NodeRunFailed {
        id: String,
        node_id: String,
        node_type: NodeType,
        node_title: String,
        error: String,
    },
    NodeRunRetry {
        id: String,
        node_id: String,
        node_type: NodeType,
        node_title: String,
        error: String,
        retry_index: i32,
    },
    NodeRunPaused {
        id: String,
        node_id: String,
        node_type: NodeType,
        node_title: String,
        reason: PauseReason,
    },
    NodeRunStreamChunk {
        id: String,
        node_id: String,
        selector: Vec<String>,
        chunk: String,
        is_final: bool,
    },
    NodeRunTtsChunk {
        id: String,
        node_id: String,
        audio: String,
    },
    NodeRunMessage {
        id: String,
        node_id: String,
        text: String,
    },

    // === Container events ===
    IterationStarted {
        id: String,
        node_id: String,
        node_title: String,
        length: usize,
    },
    IterationNext {
        id: String,
        node_id: String,
        index: usize,
    },
    IterationCompleted {
        id: String,
        node_id: String,
        outputs: HashMap<String, Value>,
        steps: usize,
        error: Option<String>,
    },
    LoopStarted {
        id: String,
        node_id: String,
        node_title: String,
        inputs: HashMap<String, Value>,
    },
    LoopNext {
        id: String,
        node_id: String,
        index: usize,
    },
    LoopCompleted {
        id: String,
        node_id: String,
        outputs: HashMap<String, Value>,
        steps: usize,
        error: Option<String>,
    },

    AgentLog {
        id: String,
        node_id: String,
        label: String,
        data: Value,
    },
    Ping,
}

/// Publishes engine events into a run's queue. A detached emitter (used for
/// loop and iteration bodies) drops every event.
#[derive(Clone, Default)]
pub struct EventEmitter {
    queue: Option<QueueManager>,
}

impl EventEmitter {
    pub fn new(queue: QueueManager) -> Self {
        Self { queue: Some(queue) }
    }

    pub fn detached() -> Self {
        Self { queue: None }
    }

    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.queue.is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.queue.as_ref().is_some_and(|q| q.is_stopped())
    }

    pub(crate) fn queue(&self) -> Option<&QueueManager> {
        self.queue.as_ref()
    }

    /// Fails with [`WorkflowError::GenerationStopped`] once the queue is stopped.
    pub async fn emit(&self, event: GraphEngineEvent) -> Result<(), WorkflowError> {
        match &self.queue {
            Some(queue) => {
                queue
                    .publish(map_engine_event(event), PublishFrom::ApplicationManager)
                    .await
            }
            None => Ok(()),
        }
    }

    /// Resolves when the queue is stopped; never resolves when detached.
    pub async fn stopped(&self) {
        match &self.queue {
            Some(queue) => queue.stopped().await,
            None => std::future::pending().await,
        }
    }
}
