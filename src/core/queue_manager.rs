//! Publish/subscribe boundary between the engine and the external event stream.
//!
//! The engine publishes through a [`QueueManager`]; the API layer drains the
//! paired [`QueueListener`]. Publishing a terminal event stops the queue, and
//! once stopped, publishes from the application side fail with
//! [`WorkflowError::GenerationStopped`]. That failure is how running branches
//! learn that the run was cancelled.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::core::event_bus::GraphEngineEvent;
use crate::core::pause::PauseReason;
use crate::dsl::schema::{LlmUsage, NodeType};
use crate::error::WorkflowError;

/// Which side of the run is publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishFrom {
    /// The engine and its node executors.
    ApplicationManager,
    /// The consumer side (API layer, listener housekeeping).
    TaskPipeline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AppMode {
    #[default]
    Workflow,
    AdvancedChat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    UserManual,
    ListenTimeout,
    Aborted,
}

/// Externally visible events, rendered by the API layer as server-sent events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    WorkflowStarted {
        execution_id: String,
        workflow_id: String,
        inputs: HashMap<String, Value>,
    },
    NodeStarted {
        id: String,
        node_id: String,
        node_type: NodeType,
        node_title: String,
        predecessor_node_id: Option<String>,
    },
    NodeSucceeded {
        id: String,
        node_id: String,
        node_type: NodeType,
        node_title: String,
        inputs: HashMap<String, Value>,
        outputs: HashMap<String, Value>,
        llm_usage: Option<LlmUsage>,
        edge_source_handle: String,
    },
    NodeException {
        id: String,
        node_id: String,
        node_type: NodeType,
        node_title: String,
        outputs: HashMap<String, Value>,
        error: String,
        edge_source_handle: String,
    },
    NodeFailed {
        id: String,
        node_id: String,
        node_type: NodeType,
        node_title: String,
        error: String,
    },
    NodeRetry {
        id: String,
        node_id: String,
        node_type: NodeType,
        node_title: String,
        error: String,
        retry_index: i32,
    },
    NodePaused {
        id: String,
        node_id: String,
        node_type: NodeType,
        node_title: String,
        reason: PauseReason,
    },
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
    TextChunk {
        node_id: String,
        text: String,
        from_variable_selector: Vec<String>,
        is_final: bool,
    },
    TtsChunk {
        node_id: String,
        audio: String,
    },
    Message {
        node_id: String,
        text: String,
    },
    MessageEnd {
        outputs: HashMap<String, Value>,
    },
    WorkflowPaused {
        pause_id: String,
        reasons: Vec<PauseReason>,
        outputs: HashMap<String, Value>,
    },
    WorkflowSucceeded {
        outputs: HashMap<String, Value>,
    },
    WorkflowPartialSucceeded {
        exceptions_count: usize,
        outputs: HashMap<String, Value>,
    },
    WorkflowFailed {
        error: String,
        exceptions_count: usize,
    },
    Error {
        message: String,
    },
    Stop {
        reason: StopReason,
        message: Option<String>,
    },
    Ping,
    AgentLog {
        node_id: String,
        label: String,
        data: Value,
    },
}

impl QueueEvent {
    /// Events after which the listener ends.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueEvent::Stop { .. }
                | QueueEvent::Error { .. }
                | QueueEvent::MessageEnd { .. }
                | QueueEvent::WorkflowSucceeded { .. }
                | QueueEvent::WorkflowPartialSucceeded { .. }
                | QueueEvent::WorkflowFailed { .. }
        )
    }
}

/// Translate an internal engine event into the external vocabulary.
pub fn map_engine_event(event: GraphEngineEvent) -> QueueEvent {
    match event {
        GraphEngineEvent::GraphRunStarted {
            execution_id,
            workflow_id,
            inputs,
        } => QueueEvent::WorkflowStarted {
            execution_id,
            workflow_id,
            inputs,
        },
        GraphEngineEvent::GraphRunSucceeded { outputs } => QueueEvent::WorkflowSucceeded { outputs },
        GraphEngineEvent::GraphRunPartialSucceeded {
            exceptions_count,
            outputs,
        } => QueueEvent::WorkflowPartialSucceeded {
            exceptions_count,
            outputs,
        },
        GraphEngineEvent::GraphRunFailed {
            error,
            exceptions_count,
        } => QueueEvent::WorkflowFailed {
            error,
            exceptions_count,
        },
        GraphEngineEvent::GraphRunAborted { reason, .. } => QueueEvent::Stop {
            reason: StopReason::Aborted,
            message: reason,
        },
        GraphEngineEvent::GraphRunPaused {
            pause_id,
            reasons,
            outputs,
        } => QueueEvent::WorkflowPaused {
            pause_id,
            reasons,
            outputs,
        },
        GraphEngineEvent::NodeRunStarted {
            id,
            node_id,
            node_type,
            node_title,
            predecessor_node_id,
        } => QueueEvent::NodeStarted {
            id,
            node_id,
            node_type,
            node_title,
            predecessor_node_id,
        },
        GraphEngineEvent::NodeRunSucceeded {
            id,
            node_id,
            node_type,
            node_title,
            result,
        } => QueueEvent::NodeSucceeded {
            id,
            node_id,
            node_type,
            node_title,
            inputs: result.inputs,
            outputs: result.outputs,
            llm_usage: result.llm_usage,
            edge_source_handle: result.edge_source_handle,
        },
        GraphEngineEvent::NodeRunException {
            id,
            node_id,
            node_type,
            node_title,
            result,
            error,
        } => QueueEvent::NodeException {
            id,
            node_id,
            node_type,
            node_title,
            outputs: result.outputs,
            error,
            edge_source_handle: result.edge_source_handle,
        },
        GraphEngineEvent::NodeRunFailed {
            id,
            node_id,
            node_type,
            node_title,
            error,
        } => QueueEvent::NodeFailed {
            id,
            node_id,
            node_type,
            node_title,
            error,
        },
        GraphEngineEvent::NodeRunRetry {
            id,
            node_id,
            node_type,
            node_title,
            error,
            retry_index,
        } => QueueEvent::NodeRetry {
            id,
            node_id,
            node_type,
            node_title,
            error,
            retry_index,
        },
        GraphEngineEvent::NodeRunPaused {
            id,
            node_id,
            node_type,
            node_title,
            reason,
        } => QueueEvent::NodePaused {
            id,
            node_id,
            node_type,
            node_title,
            reason,
        },
        GraphEngineEvent::NodeRunStreamChunk {
            node_id,
            selector,
            chunk,
            is_final,
            ..
        } => QueueEvent::TextChunk {
            node_id,
            text: chunk,
            from_variable_selector: selector,
            is_final,
        },
        GraphEngineEvent::NodeRunTtsChunk { node_id, audio, .. } => {
            QueueEvent::TtsChunk { node_id, audio }
        }
        GraphEngineEvent::NodeRunMessage { node_id, text, .. } => {
            QueueEvent::Message { node_id, text }
        }
        GraphEngineEvent::IterationStarted {
            id,
            node_id,
            node_title,
            length,
        } => QueueEvent::IterationStarted {
            id,
            node_id,
            node_title,
            length,
        },
        GraphEngineEvent::IterationNext { id, node_id, index } => {
            QueueEvent::IterationNext { id, node_id, index }
        }
        GraphEngineEvent::IterationCompleted {
            id,
            node_id,
            outputs,
            steps,
            error,
        } => QueueEvent::IterationCompleted {
            id,
            node_id,
            outputs,
            steps,
            error,
        },
        GraphEngineEvent::LoopStarted {
            id,
            node_id,
            node_title,
            inputs,
        } => QueueEvent::LoopStarted {
            id,
            node_id,
            node_title,
            inputs,
        },
        GraphEngineEvent::LoopNext { id, node_id, index } => {
            QueueEvent::LoopNext { id, node_id, index }
        }
        GraphEngineEvent::LoopCompleted {
            id,
            node_id,
            outputs,
            steps,
            error,
        } => QueueEvent::LoopCompleted {
            id,
            node_id,
            outputs,
            steps,
            error,
        },
        GraphEngineEvent::AgentLog {
            node_id,
            label,
            data,
            ..
        } => QueueEvent::AgentLog {
            node_id,
            label,
            data,
        },
        GraphEngineEvent::Ping => QueueEvent::Ping,
    }
}

/// Envelope put on the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueMessage {
    pub task_id: String,
    pub app_mode: AppMode,
    pub event: QueueEvent,
}

struct QueueInner {
    task_id: String,
    app_mode: AppMode,
    tx: mpsc::Sender<QueueMessage>,
    stopped: AtomicBool,
    stop_token: CancellationToken,
}

/// Producer side of a run's event queue. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<QueueInner>,
}

impl QueueManager {
    pub fn new(
        task_id: impl Into<String>,
        app_mode: AppMode,
        capacity: usize,
        ping_interval: Duration,
        listen_timeout: Duration,
    ) -> (QueueManager, QueueListener) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let manager = QueueManager {
            inner: Arc::new(QueueInner {
                task_id: task_id.into(),
                app_mode,
                tx,
                stopped: AtomicBool::new(false),
                stop_token: CancellationToken::new(),
            }),
        };
        let listener = QueueListener {
            rx,
            queue: manager.clone(),
            ping_interval,
            deadline: Instant::now() + listen_timeout,
            finished: false,
        };
        (manager, listener)
    }

    pub fn from_config(
        task_id: impl Into<String>,
        app_mode: AppMode,
        config: &EngineConfig,
    ) -> (QueueManager, QueueListener) {
        Self::new(
            task_id,
            app_mode,
            config.queue_capacity,
            Duration::from_secs(config.ping_interval_secs.max(1)),
            Duration::from_secs(config.listen_timeout_secs),
        )
    }

    pub fn task_id(&self) -> &str {
        &self.inner.task_id
    }

    pub fn app_mode(&self) -> AppMode {
        self.inner.app_mode
    }

    /// Put an event on the queue.
    ///
    /// After the queue is stopped, application-side publishes fail with
    /// [`WorkflowError::GenerationStopped`]; task-pipeline publishes are accepted
    /// and dropped if the listener is gone.
    pub async fn publish(&self, event: QueueEvent, from: PublishFrom) -> Result<(), WorkflowError> {
        if from == PublishFrom::ApplicationManager && self.is_stopped() {
            return Err(WorkflowError::GenerationStopped);
        }
        let terminal = event.is_terminal();
        let message = QueueMessage {
            task_id: self.inner.task_id.clone(),
            app_mode: self.inner.app_mode,
            event,
        };
        if self.is_stopped() {
            // the listener may have ended already; never wait on it
            if self.inner.tx.try_send(message).is_err() {
                tracing::debug!(task_id = %self.inner.task_id, "queue stopped, event dropped");
            }
        } else if self.inner.tx.send(message).await.is_err() {
            tracing::debug!(task_id = %self.inner.task_id, "queue listener gone, event dropped");
        }
        if terminal {
            self.stop_listen();
        }
        Ok(())
    }

    /// Mark the queue stopped. Returns true only for the call that performed
    /// the transition.
    pub fn stop_listen(&self) -> bool {
        let first = !self.inner.stopped.swap(true, Ordering::SeqCst);
        if first {
            self.inner.stop_token.cancel();
            tracing::debug!(task_id = %self.inner.task_id, "queue stopped");
        }
        first
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once the queue is stopped.
    pub async fn stopped(&self) {
        self.inner.stop_token.cancelled().await
    }
}

/// Consumer side of a run's event queue.
pub struct QueueListener {
    rx: mpsc::Receiver<QueueMessage>,
    queue: QueueManager,
    ping_interval: Duration,
    deadline: Instant,
    finished: bool,
}

impl QueueListener {
    /// Next message in publish order; `None` once the stream has ended.
    ///
    /// Emits `Ping` after `ping_interval` of silence. When the listen timeout
    /// elapses the listener stops the queue itself and yields a final `Stop`.
    pub async fn next_message(&mut self) -> Option<QueueMessage> {
        if self.finished {
            return None;
        }
        tokio::select! {
            biased;
            message = self.rx.recv() => match message {
                Some(message) => {
                    if message.event.is_terminal() {
                        self.finished = true;
                    }
                    Some(message)
                }
                None => {
                    self.finished = true;
                    None
                }
            },
            _ = self.queue.stopped() => {
                // Everything published before the stop has been drained.
                self.finished = true;
                None
            }
            _ = tokio::time::sleep_until(self.deadline) => {
                self.finished = true;
                self.queue.stop_listen();
                tracing::warn!(task_id = %self.queue.task_id(), "listen timeout reached");
                Some(self.envelope(QueueEvent::Stop {
                    reason: StopReason::ListenTimeout,
                    message: None,
                }))
            }
            _ = tokio::time::sleep(self.ping_interval) => Some(self.envelope(QueueEvent::Ping)),
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = QueueMessage> + Send {
        futures::stream::unfold(self, |mut listener| async move {
            listener.next_message().await.map(|m| (m, listener))
        })
    }

    /// Drain the stream into a vector. Convenient for tests and batch callers.
    pub async fn collect_all(mut self) -> Vec<QueueMessage> {
        let mut messages = Vec::new();
        while let Some(message) = self.next_message().await {
            messages.push(message);
        }
        messages
    }

    fn envelope(&self, event: QueueEvent) -> QueueMessage {
        QueueMessage {
            task_id: self.queue.task_id().to_string(),
            app_mode: self.queue.app_mode(),
            event,
        }
    }
}
