//! Handle to a run started or resumed by [`WorkflowRunner`](super::WorkflowRunner).

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use crate::core::graph_engine::RunOutcome;
use crate::core::pause::PauseReason;
use crate::core::queue_manager::{QueueListener, QueueMessage};
use crate::core::stop_signal::StopSignal;
use crate::error::WorkflowResult;

/// Externally visible state of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionStatus {
    Running,
    Succeeded(HashMap<String, Value>),
    PartialSucceeded {
        outputs: HashMap<String, Value>,
        exceptions_count: usize,
    },
    Paused {
        pause_id: String,
        reasons: Vec<PauseReason>,
    },
    Stopped,
    Failed(String),
}

impl ExecutionStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ExecutionStatus::Running)
    }
}

impl From<WorkflowResult<RunOutcome>> for ExecutionStatus {
    fn from(result: WorkflowResult<RunOutcome>) -> Self {
        match result {
            Ok(RunOutcome::Succeeded { outputs }) => ExecutionStatus::Succeeded(outputs),
            Ok(RunOutcome::PartialSucceeded {
                outputs,
                exceptions_count,
            }) => ExecutionStatus::PartialSucceeded {
                outputs,
                exceptions_count,
            },
            Ok(RunOutcome::Paused { pause_id, reasons }) => ExecutionStatus::Paused { pause_id, reasons },
            Ok(RunOutcome::Stopped) => ExecutionStatus::Stopped,
            Err(e) => ExecutionStatus::Failed(e.to_string()),
        }
    }
}

/// Allows polling [`status()`](Self::status), blocking on the end of the run
/// via [`wait()`](Self::wait), reading the event stream and stopping the run.
pub struct WorkflowHandle {
    execution_id: String,
    status_rx: watch::Receiver<ExecutionStatus>,
    events: Option<Arc<Mutex<Vec<QueueMessage>>>>,
    drained_rx: watch::Receiver<bool>,
    listener: std::sync::Mutex<Option<QueueListener>>,
    stop: StopSignal,
}

impl WorkflowHandle {
    /// With `collect_events`, the listener is drained into a buffer readable
    /// through [`events()`](Self::events); otherwise it is left for
    /// [`take_listener()`](Self::take_listener).
    pub(crate) fn new(
        execution_id: String,
        status_rx: watch::Receiver<ExecutionStatus>,
        listener: QueueListener,
        collect_events: bool,
        stop: StopSignal,
    ) -> Self {
        let (drained_tx, drained_rx) = watch::channel(!collect_events);
        let (events, listener) = if collect_events {
            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = events.clone();
            let mut listener = listener;
            tokio::spawn(async move {
                while let Some(message) = listener.next_message().await {
                    sink.lock().await.push(message);
                }
                let _ = drained_tx.send(true);
            });
            (Some(events), None)
        } else {
            (None, Some(listener))
        };
        Self {
            execution_id,
            status_rx,
            events,
            drained_rx,
            listener: std::sync::Mutex::new(listener),
            stop,
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Current status (non-blocking).
    pub fn status(&self) -> ExecutionStatus {
        self.status_rx.borrow().clone()
    }

    /// Snapshot of the events collected so far.
    pub async fn events(&self) -> Vec<QueueMessage> {
        match &self.events {
            Some(events) => events.lock().await.clone(),
            None => Vec::new(),
        }
    }

    /// Whether the event stream is still open.
    pub fn events_active(&self) -> bool {
        !*self.drained_rx.borrow()
    }

    /// The raw event stream, when events are not being collected.
    pub fn take_listener(&self) -> Option<QueueListener> {
        self.listener.lock().ok().and_then(|mut l| l.take())
    }

    /// Block until the run leaves `Running`.
    pub async fn wait(&self) -> ExecutionStatus {
        let mut rx = self.status_rx.clone();
        loop {
            let status = rx.borrow().clone();
            if !status.is_running() {
                return status;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    /// Wait for the run to end and for the event stream to drain.
    pub async fn wait_with_events(&self) -> (ExecutionStatus, Vec<QueueMessage>) {
        let status = self.wait().await;
        let mut drained = self.drained_rx.clone();
        while !*drained.borrow_and_update() {
            if drained.changed().await.is_err() {
                break;
            }
        }
        (status, self.events().await)
    }

    /// Abort the run. In-flight nodes are cancelled and the run ends `Stopped`.
    pub fn stop(&self, reason: Option<String>) {
        self.stop.trigger(reason);
    }
}
