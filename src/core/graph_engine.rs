//! Run-level driver on top of [`WorkflowDispatcher`].
//!
//! The dispatcher walks nodes; the engine owns the [`WorkflowExecution`]
//! record around that walk: status transitions, terminal events, pause
//! persistence and conversation variable flushing.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::core::dispatcher::{DispatchOutcome, WorkflowDispatcher};
use crate::core::event_bus::{EventEmitter, GraphEngineEvent};
use crate::core::pause::{PauseReason, RunCheckpoint, WorkflowPause, WorkflowPauseReason};
use crate::core::queue_manager::{PublishFrom, QueueEvent, QueueManager};
use crate::core::runtime_context::RuntimeContext;
use crate::core::runtime_state::GraphRuntimeState;
use crate::core::stop_signal::StopSignal;
use crate::core::variable_pool::VariablePool;
use crate::error::{RepositoryError, WorkflowError, WorkflowResult};
use crate::graph::Graph;
use crate::nodes::executor::NodeExecutorRegistry;
use crate::repository::{
    ConversationVariableUpdater, WorkflowExecution, WorkflowExecutionRepository,
    WorkflowExecutionStatus, WorkflowPauseRepository,
};
use crate::scheduler::PreemptionProbe;

/// How a run ended, short of failing.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Succeeded {
        outputs: HashMap<String, Value>,
    },
    /// Completed, but at least one node took its fail branch or default value.
    PartialSucceeded {
        outputs: HashMap<String, Value>,
        exceptions_count: usize,
    },
    Paused {
        pause_id: String,
        reasons: Vec<PauseReason>,
    },
    Stopped,
}

/// The paused node a resume completes, and with what.
#[derive(Debug, Clone, Default)]
pub struct ResumeTarget {
    pub node_id: String,
    pub outputs: HashMap<String, Value>,
    /// Edge handle the node completes with; `None` means the default handle.
    pub handle: Option<String>,
}

pub struct GraphEngine {
    graph: Arc<Graph>,
    registry: Arc<NodeExecutorRegistry>,
    context: Arc<RuntimeContext>,
    config: Arc<EngineConfig>,
    queue: QueueManager,
    executions: Arc<dyn WorkflowExecutionRepository>,
    pauses: Arc<dyn WorkflowPauseRepository>,
    conversation: Option<Arc<dyn ConversationVariableUpdater>>,
    stop: StopSignal,
    preemption: Option<Arc<dyn PreemptionProbe>>,
}

impl GraphEngine {
    pub fn new(
        graph: Arc<Graph>,
        registry: Arc<NodeExecutorRegistry>,
        context: Arc<RuntimeContext>,
        config: Arc<EngineConfig>,
        queue: QueueManager,
        executions: Arc<dyn WorkflowExecutionRepository>,
        pauses: Arc<dyn WorkflowPauseRepository>,
    ) -> Self {
        Self {
            graph,
            registry,
            context,
            config,
            queue,
            executions,
            pauses,
            conversation: None,
            stop: StopSignal::new(),
            preemption: None,
        }
    }

    pub fn with_conversation_updater(mut self, updater: Arc<dyn ConversationVariableUpdater>) -> Self {
        self.conversation = Some(updater);
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_preemption_probe(mut self, probe: Arc<dyn PreemptionProbe>) -> Self {
        self.preemption = Some(probe);
        self
    }

    fn emitter(&self) -> EventEmitter {
        EventEmitter::new(self.queue.clone())
    }

    fn now(&self) -> i64 {
        self.context.time_provider.now_timestamp()
    }

    fn prepare(&self, dispatcher: WorkflowDispatcher) -> WorkflowDispatcher {
        let dispatcher = dispatcher.with_stop_signal(self.stop.clone());
        match &self.preemption {
            Some(probe) => dispatcher.with_preemption_probe(probe.clone()),
            None => dispatcher,
        }
    }

    /// Run a fresh execution from the graph's root node.
    #[tracing::instrument(
        name = "workflow_run",
        skip_all,
        fields(execution_id = %execution.id, trace_id = %self.context.trace_id())
    )]
    pub async fn run(
        &self,
        mut execution: WorkflowExecution,
        pool: VariablePool,
    ) -> WorkflowResult<RunOutcome> {
        self.commit_status(&mut execution, WorkflowExecutionStatus::Running).await?;
        tracing::info!(workflow_id = %execution.workflow_id, "workflow run started");

        self.emit(GraphEngineEvent::GraphRunStarted {
            execution_id: execution.id.clone(),
            workflow_id: execution.workflow_id.clone(),
            inputs: execution.inputs.clone(),
        })
        .await;

        let dispatcher = self.prepare(WorkflowDispatcher::new(
            self.graph.clone(),
            self.registry.clone(),
            self.context.clone(),
            self.config.clone(),
            self.emitter(),
            pool,
        ));
        self.drive(execution, dispatcher).await
    }

    /// Continue a paused execution from its checkpoint.
    ///
    /// The `target` node completes with the submitted values; any other node
    /// paused in the same checkpoint is queued to run again.
    #[tracing::instrument(
        name = "workflow_resume",
        skip_all,
        fields(execution_id = %execution.id, trace_id = %self.context.trace_id())
    )]
    pub async fn resume(
        &self,
        mut execution: WorkflowExecution,
        checkpoint: RunCheckpoint,
        target: Option<ResumeTarget>,
    ) -> WorkflowResult<RunOutcome> {
        if execution.status != WorkflowExecutionStatus::Paused {
            return Err(WorkflowError::InvalidStateTransition {
                entity: format!("workflow execution {}", execution.id),
                from: execution.status.as_str().to_string(),
                to: WorkflowExecutionStatus::Running.as_str().to_string(),
            });
        }
        self.commit_status(&mut execution, WorkflowExecutionStatus::Running).await?;
        tracing::info!(resumed_node = ?target.as_ref().map(|t| &t.node_id), "workflow run resumed");

        self.emit(GraphEngineEvent::GraphRunStarted {
            execution_id: execution.id.clone(),
            workflow_id: execution.workflow_id.clone(),
            inputs: execution.inputs.clone(),
        })
        .await;

        let mut dispatcher = self.prepare(WorkflowDispatcher::from_checkpoint(
            self.graph.clone(),
            self.registry.clone(),
            self.context.clone(),
            self.config.clone(),
            self.emitter(),
            checkpoint,
        ));
        if let Some(target) = target {
            if let Err(e) = dispatcher
                .complete_paused_node(&target.node_id, target.outputs, target.handle)
                .await
            {
                return self.fail(execution, dispatcher.state(), 0, e).await;
            }
        }
        dispatcher.requeue_paused_nodes();
        self.drive(execution, dispatcher).await
    }

    async fn drive(
        &self,
        mut execution: WorkflowExecution,
        mut dispatcher: WorkflowDispatcher,
    ) -> WorkflowResult<RunOutcome> {
        let result = dispatcher.run().await;
        let state = dispatcher.state().clone();
        let elapsed = dispatcher.elapsed_secs();

        match result {
            Ok(DispatchOutcome::Completed { outputs }) => {
                if let Err(e) = self.flush_conversation(&state).await {
                    return self.fail(execution, &state, elapsed, e.into()).await;
                }
                record_stats(&mut execution, &state, elapsed);
                execution.outputs = outputs.clone();
                let exceptions_count = state.exceptions_count();
                let (status, event, outcome) = if exceptions_count > 0 {
                    (
                        WorkflowExecutionStatus::PartialSucceeded,
                        GraphEngineEvent::GraphRunPartialSucceeded {
                            exceptions_count,
                            outputs: outputs.clone(),
                        },
                        RunOutcome::PartialSucceeded {
                            outputs,
                            exceptions_count,
                        },
                    )
                } else {
                    (
                        WorkflowExecutionStatus::Succeeded,
                        GraphEngineEvent::GraphRunSucceeded {
                            outputs: outputs.clone(),
                        },
                        RunOutcome::Succeeded { outputs },
                    )
                };
                self.commit_status(&mut execution, status).await?;
                tracing::info!(status = status.as_str(), exceptions_count, "workflow run finished");
                self.emit(event).await;
                Ok(outcome)
            }
            Ok(DispatchOutcome::Paused { checkpoint, reasons }) => {
                if let Err(e) = self.flush_conversation(&state).await {
                    return self.fail(execution, &state, elapsed, e.into()).await;
                }
                record_stats(&mut execution, &state, elapsed);
                self.persist_pause(execution, &state, checkpoint, reasons).await
            }
            Ok(DispatchOutcome::Aborted { reason }) => {
                record_stats(&mut execution, &state, elapsed);
                execution.error = reason.clone();
                self.commit_status(&mut execution, WorkflowExecutionStatus::Stopped).await?;
                tracing::info!(reason = ?reason, "workflow run aborted");
                self.emit(GraphEngineEvent::GraphRunAborted {
                    reason,
                    outputs: state.outputs(),
                })
                .await;
                Ok(RunOutcome::Stopped)
            }
            Ok(DispatchOutcome::Stopped) | Err(WorkflowError::GenerationStopped) => {
                tracing::debug!("event queue stopped, run unwinding");
                record_stats(&mut execution, &state, elapsed);
                self.commit_status(&mut execution, WorkflowExecutionStatus::Stopped).await?;
                Ok(RunOutcome::Stopped)
            }
            Err(e) => self.fail(execution, &state, elapsed, e).await,
        }
    }

    async fn persist_pause(
        &self,
        mut execution: WorkflowExecution,
        state: &GraphRuntimeState,
        checkpoint: RunCheckpoint,
        reasons: Vec<PauseReason>,
    ) -> WorkflowResult<RunOutcome> {
        if execution.status != WorkflowExecutionStatus::Running {
            return Err(WorkflowError::InvalidStateTransition {
                entity: format!("workflow execution {}", execution.id),
                from: execution.status.as_str().to_string(),
                to: WorkflowExecutionStatus::Paused.as_str().to_string(),
            });
        }

        let pause_id = self.context.id_generator.next_id();
        let rows: Vec<WorkflowPauseReason> = reasons
            .iter()
            .map(|reason| {
                WorkflowPauseReason::from_reason(self.context.id_generator.next_id(), &pause_id, reason)
            })
            .collect();
        let pause = WorkflowPause {
            pause_id: pause_id.clone(),
            execution_id: execution.id.clone(),
            workflow_id: execution.workflow_id.clone(),
            tenant_id: execution.tenant_id.clone(),
            checkpoint,
            created_at: self.now(),
            resumed_at: None,
        };

        if let Err(e) = self.pauses.create_pause(&pause, &rows).await {
            return Err(self.publish_error(WorkflowError::Persistence(e)).await);
        }
        // a pause row must never outlive a failed status save
        if let Err(e) = self.commit_status(&mut execution, WorkflowExecutionStatus::Paused).await {
            if let Err(cleanup) = self.pauses.delete_pause(&pause_id).await {
                tracing::error!(pause_id = %pause_id, error = %cleanup, "orphan pause left behind");
            }
            return Err(e);
        }

        tracing::info!(pause_id = %pause_id, reasons = reasons.len(), "workflow run paused");
        self.emit(GraphEngineEvent::GraphRunPaused {
            pause_id: pause_id.clone(),
            reasons: reasons.clone(),
            outputs: state.outputs(),
        })
        .await;
        self.queue.stop_listen();
        Ok(RunOutcome::Paused { pause_id, reasons })
    }

    /// Move the execution to `status` and save it. A failure reaches the
    /// event stream as an `Error` before it is returned.
    async fn commit_status(
        &self,
        execution: &mut WorkflowExecution,
        status: WorkflowExecutionStatus,
    ) -> WorkflowResult<()> {
        let result = match execution.transition(status, self.now()) {
            Ok(()) => self.executions.save(execution).await.map_err(WorkflowError::from),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.publish_error(e).await),
        }
    }

    /// Publish an error as the stream's terminal event before handing it back.
    async fn publish_error(&self, err: WorkflowError) -> WorkflowError {
        tracing::error!(error = %err, "workflow run state not persisted");
        let event = QueueEvent::Error {
            message: err.to_string(),
        };
        if let Err(e) = self.queue.publish(event, PublishFrom::ApplicationManager).await {
            tracing::debug!(error = %e, "error event not published");
        }
        err
    }

    async fn fail(
        &self,
        mut execution: WorkflowExecution,
        state: &GraphRuntimeState,
        elapsed: u64,
        error: WorkflowError,
    ) -> WorkflowResult<RunOutcome> {
        record_stats(&mut execution, state, elapsed);
        execution.error = Some(error.to_string());
        if let Err(e) = execution.transition(WorkflowExecutionStatus::Failed, self.now()) {
            tracing::warn!(error = %e, "execution not marked failed");
        } else if let Err(e) = self.executions.save(&execution).await {
            tracing::error!(error = %e, "failed to save failed execution");
        }
        tracing::error!(error = %error, "workflow run failed");
        self.emit(GraphEngineEvent::GraphRunFailed {
            error: error.to_string(),
            exceptions_count: state.exceptions_count(),
        })
        .await;
        Err(error)
    }

    async fn flush_conversation(&self, state: &GraphRuntimeState) -> Result<(), RepositoryError> {
        let changes = state.conversation_changes();
        let (Some(updater), Some(conversation_id)) =
            (&self.conversation, &self.context.execution.conversation_id)
        else {
            return Ok(());
        };
        if changes.is_empty() {
            return Ok(());
        }
        for (name, value) in &changes {
            updater.update(conversation_id, name, value).await?;
        }
        updater.flush().await
    }

    async fn emit(&self, event: GraphEngineEvent) {
        if let Err(e) = self.emitter().emit(event).await {
            tracing::debug!(error = %e, "event not published");
        }
    }
}

fn record_stats(execution: &mut WorkflowExecution, state: &GraphRuntimeState, elapsed: u64) {
    let accumulators = state.accumulators();
    execution.total_steps = accumulators.total_steps;
    execution.total_tokens = accumulators.llm_usage.total_tokens;
    execution.exceptions_count = accumulators.exceptions_count;
    execution.elapsed_time = elapsed;
}
