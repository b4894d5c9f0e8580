//! Sub-graph runner for container nodes (Iteration, Loop).
//!
//! A sub-graph is a self-contained mini-workflow embedded inside a container
//! node. The [`SubGraphRunner`] trait abstracts how it is executed so tests can
//! substitute their own.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::dispatcher::{DispatchOutcome, WorkflowDispatcher};
use crate::core::event_bus::EventEmitter;
use crate::core::stop_signal::StopSignal;
use crate::core::variable_pool::VariablePool;
use crate::dsl::schema::LlmUsage;
use crate::error::{NodeError, WorkflowError};
use crate::graph::Graph;
use crate::nodes::executor::NodeExecutionContext;

/// Result of running a body once.
#[derive(Debug, Clone)]
pub struct SubGraphOutput {
    /// Outputs of the body's end nodes.
    pub outputs: HashMap<String, Value>,
    /// The body's pool after it finished.
    pub pool: VariablePool,
    pub llm_usage: LlmUsage,
    /// Steps the body took, nested bodies included.
    pub steps: i32,
    pub exceptions_count: usize,
}

#[async_trait]
pub trait SubGraphRunner: Send + Sync {
    async fn run_sub_graph(
        &self,
        graph: Arc<Graph>,
        pool: VariablePool,
        context: &NodeExecutionContext,
    ) -> Result<SubGraphOutput, NodeError>;
}

/// Runs the body on a fresh [`WorkflowDispatcher`] with a detached emitter.
/// Aborting the parent run cancels the body.
pub struct DefaultSubGraphRunner;

#[async_trait]
impl SubGraphRunner for DefaultSubGraphRunner {
    async fn run_sub_graph(
        &self,
        graph: Arc<Graph>,
        pool: VariablePool,
        context: &NodeExecutionContext,
    ) -> Result<SubGraphOutput, NodeError> {
        let mut dispatcher = WorkflowDispatcher::new(
            graph,
            context.registry.clone(),
            context.runtime.clone(),
            context.config.clone(),
            EventEmitter::detached(),
            pool,
        )
        .with_stop_signal(StopSignal::linked(&context.cancel));

        match dispatcher.run().await {
            Ok(DispatchOutcome::Completed { outputs }) => {
                let state = dispatcher.state();
                let accumulators = state.accumulators();
                Ok(SubGraphOutput {
                    outputs,
                    pool: state.pool_snapshot(),
                    llm_usage: accumulators.llm_usage,
                    steps: accumulators.total_steps,
                    exceptions_count: accumulators.exceptions_count,
                })
            }
            Ok(DispatchOutcome::Paused { .. }) => Err(NodeError::PauseNotSupported(
                "nodes inside a loop or iteration body cannot pause".to_string(),
            )),
            Ok(DispatchOutcome::Stopped) | Ok(DispatchOutcome::Aborted { .. }) => {
                Err(NodeError::GenerationStopped)
            }
            Err(WorkflowError::GenerationStopped) => Err(NodeError::GenerationStopped),
            Err(e) => Err(NodeError::ExecutionError(e.to_string())),
        }
    }
}
