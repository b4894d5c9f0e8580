//! Node-level graph walker.
//!
//! The dispatcher owns edge and node state for one run. Ready nodes are spawned
//! into a [`JoinSet`] with an owned snapshot of the pool; their results are
//! written back here, so the pool has a single writer. Run-level bookkeeping
//! (execution status, persistence, terminal events) lives in
//! [`GraphEngine`](crate::core::graph_engine::GraphEngine).

use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::core::event_bus::{EventEmitter, GraphEngineEvent};
use crate::core::executing_nodes::ExecutingNodesManager;
use crate::core::pause::{PauseReason, PausedNode, RunCheckpoint};
use crate::core::runtime_context::RuntimeContext;
use crate::core::runtime_state::GraphRuntimeState;
use crate::core::stop_signal::StopSignal;
use crate::core::variable_pool::VariablePool;
use crate::dsl::schema::{
    BackoffStrategy, ErrorStrategy, NodeErrorInfo, NodeRunResult, NodeType, RetryConfig,
    WorkflowNodeExecutionStatus, DEFAULT_SOURCE_HANDLE, FAIL_BRANCH_SOURCE_HANDLE,
};
use crate::error::{ErrorCode, ErrorContext, NodeError, WorkflowError, WorkflowResult};
use crate::graph::{EdgeStates, Graph, GraphNode, NodeState, RuntimeNode};
use crate::nodes::executor::{
    NodeEventSink, NodeExecutionContext, NodeExecutorRegistry, NodeRunOutcome,
};
use crate::scheduler::PreemptionProbe;

/// How a dispatch ended without a fatal error.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// No node left to run.
    Completed { outputs: HashMap<String, Value> },
    /// One or more nodes paused, or the run yielded its time slice.
    Paused {
        checkpoint: RunCheckpoint,
        reasons: Vec<PauseReason>,
    },
    /// The event queue was stopped by the consumer.
    Stopped,
    /// The run was aborted through its [`StopSignal`].
    Aborted { reason: Option<String> },
}

struct NodeExecOutcome {
    exec_id: String,
    node_id: String,
    result: Result<NodeRunOutcome, NodeError>,
}

pub struct WorkflowDispatcher {
    graph: Arc<Graph>,
    registry: Arc<NodeExecutorRegistry>,
    context: Arc<RuntimeContext>,
    config: Arc<EngineConfig>,
    emitter: EventEmitter,
    state: Arc<GraphRuntimeState>,
    edge_states: EdgeStates,
    runtime_nodes: BTreeMap<String, RuntimeNode>,
    executing: ExecutingNodesManager,
    ready: VecDeque<String>,
    ready_predecessors: BTreeMap<String, String>,
    paused: Vec<PausedNode>,
    stop: StopSignal,
    preemption: Option<Arc<dyn PreemptionProbe>>,
    start_time: i64,
    elapsed_before: u64,
}

impl WorkflowDispatcher {
    /// Dispatcher for a fresh run, starting at the graph's root node.
    pub fn new(
        graph: Arc<Graph>,
        registry: Arc<NodeExecutorRegistry>,
        context: Arc<RuntimeContext>,
        config: Arc<EngineConfig>,
        emitter: EventEmitter,
        pool: VariablePool,
    ) -> Self {
        let edge_states = EdgeStates::new(&graph);
        let root = graph.root_node_id().to_string();
        let start_time = context.time_provider.now_timestamp();
        WorkflowDispatcher {
            graph,
            registry,
            context,
            config,
            emitter,
            state: Arc::new(GraphRuntimeState::new(pool)),
            edge_states,
            runtime_nodes: BTreeMap::new(),
            executing: ExecutingNodesManager::new(),
            ready: VecDeque::from([root]),
            ready_predecessors: BTreeMap::new(),
            paused: Vec::new(),
            stop: StopSignal::new(),
            preemption: None,
            start_time,
            elapsed_before: 0,
        }
    }

    /// Dispatcher re-entering a run from a pause checkpoint.
    ///
    /// Nodes paused in the checkpoint stay paused until
    /// [`complete_paused_node`](Self::complete_paused_node) or
    /// [`requeue_paused_nodes`](Self::requeue_paused_nodes) is called.
    pub fn from_checkpoint(
        graph: Arc<Graph>,
        registry: Arc<NodeExecutorRegistry>,
        context: Arc<RuntimeContext>,
        config: Arc<EngineConfig>,
        emitter: EventEmitter,
        checkpoint: RunCheckpoint,
    ) -> Self {
        let start_time = context.time_provider.now_timestamp();
        let pool = VariablePool::restore(&checkpoint.pool);
        WorkflowDispatcher {
            graph,
            registry,
            context,
            config,
            emitter,
            state: Arc::new(GraphRuntimeState::restore(pool, checkpoint.accumulators)),
            edge_states: checkpoint.edge_states,
            runtime_nodes: checkpoint.runtime_nodes,
            executing: ExecutingNodesManager::new(),
            ready: checkpoint.ready_queue.into(),
            ready_predecessors: checkpoint.ready_predecessors,
            paused: checkpoint.paused_nodes,
            stop: StopSignal::new(),
            preemption: None,
            start_time,
            elapsed_before: checkpoint.elapsed_secs,
        }
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_preemption_probe(mut self, probe: Arc<dyn PreemptionProbe>) -> Self {
        self.preemption = Some(probe);
        self
    }

    pub fn state(&self) -> &Arc<GraphRuntimeState> {
        &self.state
    }

    pub fn paused_nodes(&self) -> &[PausedNode] {
        &self.paused
    }

    /// Nodes whose tasks are in flight, sorted.
    pub fn executing_nodes(&self) -> Vec<String> {
        self.executing.snapshot()
    }

    pub fn runtime_node(&self, node_id: &str) -> Option<&RuntimeNode> {
        self.runtime_nodes.get(node_id)
    }

    fn now(&self) -> i64 {
        self.context.time_provider.now_timestamp()
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed_before + self.context.time_provider.elapsed_secs(self.start_time)
    }

    /// Emit, treating a stopped queue as something the loop notices on its own.
    async fn emit(&self, event: GraphEngineEvent) {
        if let Err(e) = self.emitter.emit(event).await {
            tracing::debug!(error = %e, "event not published");
        }
    }

    fn check_limits(&self) -> WorkflowResult<()> {
        let steps = self.state.increment_steps();
        if steps > self.config.max_steps {
            return Err(WorkflowError::MaxStepsExceeded(self.config.max_steps));
        }
        if self.elapsed_secs() > self.config.max_execution_time_secs {
            return Err(WorkflowError::ExecutionTimeout);
        }
        Ok(())
    }

    /// Complete a node that was paused, using the values submitted on resume.
    pub async fn complete_paused_node(
        &mut self,
        node_id: &str,
        outputs: HashMap<String, Value>,
        handle: Option<String>,
    ) -> WorkflowResult<()> {
        let Some(index) = self.paused.iter().position(|p| p.node_id == node_id) else {
            return Err(WorkflowError::NodeNotFound(node_id.to_string()));
        };
        self.paused.remove(index);
        let node = self.graph.node(node_id)?.clone();
        let now = self.now();

        let result = NodeRunResult {
            inputs: outputs.clone(),
            outputs,
            edge_source_handle: handle.unwrap_or_else(|| DEFAULT_SOURCE_HANDLE.to_string()),
            ..Default::default()
        };

        let exec_id = {
            let runtime_node = self
                .runtime_nodes
                .get_mut(node_id)
                .ok_or_else(|| WorkflowError::NodeNotFound(node_id.to_string()))?;
            runtime_node.transition(NodeState::Running, now)?;
            runtime_node.id.clone()
        };
        self.finish_node(&exec_id, &node, result).await
    }

    /// Put every still-paused node back on the ready queue.
    pub fn requeue_paused_nodes(&mut self) {
        for paused in self.paused.drain(..) {
            self.ready.push_back(paused.node_id);
        }
    }

    fn checkpoint(&self, paused: Vec<PausedNode>) -> RunCheckpoint {
        RunCheckpoint {
            pool: self.state.pool().snapshot(),
            accumulators: self.state.accumulators(),
            edge_states: self.edge_states.clone(),
            runtime_nodes: self.runtime_nodes.clone(),
            paused_nodes: paused,
            ready_queue: self.ready.iter().cloned().collect(),
            ready_predecessors: self.ready_predecessors.clone(),
            elapsed_secs: self.elapsed_secs(),
        }
    }

    pub async fn run(&mut self) -> WorkflowResult<DispatchOutcome> {
        let cancel = self.stop.child_token();
        let mut join_set: JoinSet<NodeExecOutcome> = JoinSet::new();
        let outcome = self.run_loop(&mut join_set, &cancel).await;

        if !join_set.is_empty() {
            cancel.cancel();
            while let Some(joined) = join_set.join_next().await {
                if let Ok(outcome) = joined {
                    self.executing.remove(&outcome.node_id);
                }
            }
        }
        outcome
    }

    async fn run_loop(
        &mut self,
        join_set: &mut JoinSet<NodeExecOutcome>,
        cancel: &CancellationToken,
    ) -> WorkflowResult<DispatchOutcome> {
        let max_concurrency = self.config.max_concurrency;
        let mut pausing = false;
        let mut yield_to: Option<String> = None;

        loop {
            if self.stop.is_triggered() {
                return Ok(DispatchOutcome::Aborted {
                    reason: self.stop.reason(),
                });
            }
            if self.emitter.is_stopped() {
                return Ok(DispatchOutcome::Stopped);
            }

            while !pausing
                && yield_to.is_none()
                && (max_concurrency == 0 || self.executing.len() < max_concurrency)
            {
                let Some(node_id) = self.ready.pop_front() else {
                    break;
                };
                if self.executing.contains(&node_id) {
                    continue;
                }
                self.check_limits()?;
                self.spawn_node(join_set, cancel, node_id).await?;
            }

            if self.executing.is_empty() {
                if !self.paused.is_empty() {
                    let paused = std::mem::take(&mut self.paused);
                    let reasons = paused.iter().map(|p| p.reason.clone()).collect();
                    return Ok(DispatchOutcome::Paused {
                        checkpoint: self.checkpoint(paused),
                        reasons,
                    });
                }
                if let Some(node_id) = yield_to.take() {
                    tracing::debug!(node_id = %node_id, "yielding time slice");
                    let reason = PauseReason::ScheduledPause {
                        message: "time slice exhausted".to_string(),
                        node_id,
                        resume_at: self.now(),
                    };
                    return Ok(DispatchOutcome::Paused {
                        checkpoint: self.checkpoint(Vec::new()),
                        reasons: vec![reason],
                    });
                }
                if self.ready.is_empty() {
                    return Ok(DispatchOutcome::Completed {
                        outputs: self.state.outputs(),
                    });
                }
                continue;
            }

            let joined = tokio::select! {
                joined = join_set.join_next() => joined,
                _ = self.stop.cancelled() => continue,
                _ = self.emitter.stopped() => continue,
            };
            let Some(joined) = joined else {
                continue;
            };
            let outcome = joined.map_err(|e| {
                WorkflowError::InternalError(format!("node task join error: {}", e))
            })?;
            self.executing.remove(&outcome.node_id);

            match outcome.result {
                Ok(NodeRunOutcome::Completed(result)) => {
                    let node = self.graph.node(&outcome.node_id)?.clone();
                    self.finish_node(&outcome.exec_id, &node, result).await?;
                    if yield_to.is_none() && !pausing {
                        if let Some(probe) = &self.preemption {
                            if !self.ready.is_empty() && probe.should_yield() {
                                yield_to = self.ready.front().cloned();
                            }
                        }
                    }
                }
                Ok(NodeRunOutcome::Paused(reason)) => {
                    self.pause_node(&outcome.exec_id, &outcome.node_id, reason)
                        .await?;
                    pausing = true;
                }
                Err(e) if e.is_generation_stopped() => {
                    if self.stop.is_triggered() {
                        return Ok(DispatchOutcome::Aborted {
                            reason: self.stop.reason(),
                        });
                    }
                    tracing::debug!(node_id = %outcome.node_id, "node unwound after stop");
                    return Ok(DispatchOutcome::Stopped);
                }
                Err(e) => {
                    return Err(self.fail_node(&outcome.exec_id, &outcome.node_id, e).await);
                }
            }
        }
    }

    async fn spawn_node(
        &mut self,
        join_set: &mut JoinSet<NodeExecOutcome>,
        cancel: &CancellationToken,
        node_id: String,
    ) -> WorkflowResult<()> {
        let node = self.graph.node(&node_id)?.clone();
        let predecessor_node_id = self.ready_predecessors.remove(&node_id);
        let now = self.now();

        let exec_id = match self.runtime_nodes.get_mut(&node_id) {
            Some(existing) => {
                existing.transition(NodeState::Running, now)?;
                existing.id.clone()
            }
            None => {
                let predecessor_runtime_id = predecessor_node_id
                    .as_ref()
                    .and_then(|p| self.runtime_nodes.get(p))
                    .map(|r| r.id.clone());
                let mut runtime_node = RuntimeNode::new(
                    self.context.id_generator.next_id(),
                    node_id.clone(),
                    predecessor_runtime_id,
                );
                runtime_node.transition(NodeState::Running, now)?;
                let id = runtime_node.id.clone();
                self.runtime_nodes.insert(node_id.clone(), runtime_node);
                id
            }
        };

        self.executing.add(&node_id);
        tracing::debug!(node_id = %node_id, node_type = %node.node_type, "node started");
        self.emit(GraphEngineEvent::NodeRunStarted {
            id: exec_id.clone(),
            node_id: node_id.clone(),
            node_type: node.node_type,
            node_title: node.title.clone(),
            predecessor_node_id,
        })
        .await;

        let ctx = NodeExecutionContext {
            runtime: self.context.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            events: NodeEventSink::new(self.emitter.clone(), exec_id.clone(), node_id.clone()),
            cancel: cancel.child_token(),
            exec_id: exec_id.clone(),
            node_title: node.title.clone(),
            node_type: node.node_type,
        };
        let pool = self.state.pool_snapshot();
        let default_timeout = self.config.default_node_timeout_secs;

        join_set.spawn(async move {
            let result = execute_node_with_retry_inner(&node, &pool, &ctx, default_timeout).await;
            NodeExecOutcome {
                exec_id,
                node_id: node.id.clone(),
                result,
            }
        });
        Ok(())
    }

    /// Record a completed node: write outputs, merge accumulators, emit and
    /// resolve outgoing edges.
    async fn finish_node(
        &mut self,
        exec_id: &str,
        node: &GraphNode,
        result: NodeRunResult,
    ) -> WorkflowResult<()> {
        self.state.write_outputs(&node.id, &result.outputs)?;
        self.state
            .apply_conversation_updates(&result.conversation_updates);
        self.state.record_completion(&result);
        if self.state.total_steps() > self.config.max_steps {
            return Err(WorkflowError::MaxStepsExceeded(self.config.max_steps));
        }
        match node.node_type {
            NodeType::End => self.state.extend_outputs(&result.outputs),
            NodeType::Answer => {
                if let Some(Value::String(answer)) = result.outputs.get("answer") {
                    self.state.append_answer(answer);
                }
            }
            _ => {}
        }

        let now = self.now();
        if let Some(runtime_node) = self.runtime_nodes.get_mut(&node.id) {
            runtime_node.succeed(result.clone(), now)?;
        }

        let event = if result.status == WorkflowNodeExecutionStatus::Exception {
            let error = result
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            tracing::info!(node_id = %node.id, error = %error, "node failed, continuing via error strategy");
            GraphEngineEvent::NodeRunException {
                id: exec_id.to_string(),
                node_id: node.id.clone(),
                node_type: node.node_type,
                node_title: node.title.clone(),
                result: result.clone(),
                error,
            }
        } else {
            GraphEngineEvent::NodeRunSucceeded {
                id: exec_id.to_string(),
                node_id: node.id.clone(),
                node_type: node.node_type,
                node_title: node.title.clone(),
                result: result.clone(),
            }
        };
        self.emit(event).await;

        let resolution = {
            let pool = self.state.pool();
            self.edge_states
                .resolve_outgoing(&self.graph, &node.id, &result, &pool)
        };
        for skipped in &resolution.skipped {
            tracing::debug!(node_id = %skipped, "node skipped");
        }
        for ready in resolution.ready {
            self.ready_predecessors
                .insert(ready.clone(), node.id.clone());
            self.ready.push_back(ready);
        }
        Ok(())
    }

    async fn pause_node(
        &mut self,
        exec_id: &str,
        node_id: &str,
        reason: PauseReason,
    ) -> WorkflowResult<()> {
        let node = self.graph.node(node_id)?.clone();
        let now = self.now();
        if let Some(runtime_node) = self.runtime_nodes.get_mut(node_id) {
            runtime_node.transition(NodeState::Paused, now)?;
        }
        tracing::info!(node_id = %node_id, reason = ?reason.kind(), "node paused");
        self.paused.push(PausedNode {
            node_id: node_id.to_string(),
            reason: reason.clone(),
        });
        self.emit(GraphEngineEvent::NodeRunPaused {
            id: exec_id.to_string(),
            node_id: node_id.to_string(),
            node_type: node.node_type,
            node_title: node.title,
            reason,
        })
        .await;
        Ok(())
    }

    async fn fail_node(&mut self, exec_id: &str, node_id: &str, error: NodeError) -> WorkflowError {
        let now = self.now();
        let message = error.to_string();
        if let Some(runtime_node) = self.runtime_nodes.get_mut(node_id) {
            if let Err(e) = runtime_node.fail(message.clone(), now) {
                tracing::warn!(node_id = %node_id, error = %e, "could not mark node failed");
            }
        }
        tracing::warn!(node_id = %node_id, error = %message, "node failed");

        if let Ok(node) = self.graph.node(node_id) {
            self.emit(GraphEngineEvent::NodeRunFailed {
                id: exec_id.to_string(),
                node_id: node_id.to_string(),
                node_type: node.node_type,
                node_title: node.title.clone(),
                error: message.clone(),
            })
            .await;
        }

        WorkflowError::NodeExecutionError {
            node_id: node_id.to_string(),
            error: message,
            error_detail: Some(error.to_structured_json()),
        }
    }
}

/// Run one node: retries, per-attempt timeout, then the node's error strategy.
async fn execute_node_with_retry_inner(
    node: &GraphNode,
    pool: &VariablePool,
    ctx: &NodeExecutionContext,
    default_timeout: Option<u64>,
) -> Result<NodeRunOutcome, NodeError> {
    let Some(executor) = ctx.registry.get(node.node_type) else {
        return apply_error_strategy(
            node,
            NodeError::ConfigError(format!("No executor for node type: {}", node.node_type)),
        );
    };

    let retry_config = node.retry_config.as_ref().filter(|rc| rc.retry_enabled);
    let max_retries = retry_config.map(|rc| rc.max_retries).unwrap_or(0).max(0);
    let retry_on_retryable_only = retry_config
        .map(|rc| rc.retry_on_retryable_only)
        .unwrap_or(true);
    let timeout_secs = node.timeout_secs.or(default_timeout);

    let mut attempt = 0;
    loop {
        let exec_future = executor.execute(&node.id, &node.config, pool, ctx);
        let exec_result = match timeout_secs {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), exec_future).await {
                Ok(r) => r,
                Err(_) => Err(NodeError::Timeout.with_context(ErrorContext::retryable(
                    ErrorCode::Timeout,
                    format!("Node execution timed out after {}s", secs),
                ))),
            },
            None => exec_future.await,
        };

        let error = match exec_result {
            Ok(NodeRunOutcome::Completed(mut result)) => {
                result.retry_index = attempt;
                return Ok(NodeRunOutcome::Completed(result));
            }
            Ok(paused @ NodeRunOutcome::Paused(_)) => return Ok(paused),
            Err(e) if e.is_generation_stopped() => return Err(e),
            Err(e) => e,
        };

        let should_retry = attempt < max_retries
            && !ctx.cancel.is_cancelled()
            && (!retry_on_retryable_only || error.is_retryable());
        if !should_retry {
            return apply_error_strategy(node, error);
        }

        let interval = calculate_retry_interval(retry_config, attempt, &error);
        tracing::debug!(node_id = %node.id, attempt = attempt + 1, error = %error, "retrying node");
        ctx.events
            .publish(GraphEngineEvent::NodeRunRetry {
                id: ctx.exec_id.clone(),
                node_id: node.id.clone(),
                node_type: node.node_type,
                node_title: node.title.clone(),
                error: error.to_string(),
                retry_index: attempt + 1,
            })
            .await?;
        if interval > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(interval)) => {}
                _ = ctx.cancel.cancelled() => return Err(NodeError::GenerationStopped),
            }
        }
        attempt += 1;
    }
}

/// Turn a final failure into an exception result when the node type and its
/// configuration allow it; otherwise return the error.
fn apply_error_strategy(node: &GraphNode, error: NodeError) -> Result<NodeRunOutcome, NodeError> {
    let Some(strategy) = node.effective_error_strategy() else {
        return Err(error);
    };
    let error_info = NodeErrorInfo {
        message: error.to_string(),
        error_type: Some(format!("{:?}", error.error_code())),
        detail: Some(error.to_structured_json()),
    };
    let result = match strategy {
        ErrorStrategy::FailBranch => NodeRunResult {
            status: WorkflowNodeExecutionStatus::Exception,
            error: Some(error_info),
            edge_source_handle: FAIL_BRANCH_SOURCE_HANDLE.to_string(),
            ..Default::default()
        },
        ErrorStrategy::DefaultValue => NodeRunResult {
            status: WorkflowNodeExecutionStatus::Exception,
            outputs: node.default_outputs(),
            error: Some(error_info),
            edge_source_handle: DEFAULT_SOURCE_HANDLE.to_string(),
            ..Default::default()
        },
    };
    Ok(NodeRunOutcome::Completed(result))
}

fn calculate_retry_interval(
    retry_config: Option<&RetryConfig>,
    attempt: i32,
    error: &NodeError,
) -> u64 {
    let Some(rc) = retry_config else {
        return 0;
    };

    if let Some(retry_after) = error.error_context().and_then(|ctx| ctx.retry_after_secs) {
        return retry_after
            .saturating_mul(1000)
            .min(rc.max_retry_interval.max(0) as u64);
    }

    let base = rc.retry_interval.max(0) as u64;
    let interval = match rc.backoff_strategy {
        BackoffStrategy::Fixed => base,
        BackoffStrategy::Exponential => (base as f64 * rc.backoff_multiplier.powi(attempt)) as u64,
        BackoffStrategy::ExponentialWithJitter => {
            let multiplied = base as f64 * rc.backoff_multiplier.powi(attempt);
            let jitter = rand::random::<f64>() * multiplied * 0.1;
            (multiplied + jitter) as u64
        }
    };

    interval.min(rc.max_retry_interval.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::queue_manager::{AppMode, QueueEvent, QueueManager};
    use crate::dsl::{parse_dsl, DslFormat};
    use crate::graph::build_graph;
    use crate::nodes::executor::NodeExecutor;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dispatcher(yaml: &str, registry: NodeExecutorRegistry) -> WorkflowDispatcher {
        dispatcher_with(yaml, registry, EngineConfig::default(), EventEmitter::detached())
    }

    fn dispatcher_with(
        yaml: &str,
        registry: NodeExecutorRegistry,
        config: EngineConfig,
        emitter: EventEmitter,
    ) -> WorkflowDispatcher {
        let graph = build_graph(&parse_dsl(yaml, DslFormat::Yaml).unwrap()).unwrap();
        let mut pool = VariablePool::new();
        pool.set_user_inputs(HashMap::from([("query".to_string(), json!("hi"))]));
        WorkflowDispatcher::new(
            Arc::new(graph),
            Arc::new(registry),
            Arc::new(RuntimeContext::default()),
            Arc::new(config),
            emitter,
            pool,
        )
    }

    /// Fails `failures` times with a retryable error, then succeeds.
    struct Flaky {
        failures: usize,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NodeExecutor for Flaky {
        async fn execute(
            &self,
            _node_id: &str,
            _config: &Value,
            _pool: &VariablePool,
            _ctx: &NodeExecutionContext,
        ) -> Result<NodeRunOutcome, NodeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(NodeError::ToolRuntimeError("503".into()));
            }
            Ok(NodeRunResult::succeeded(HashMap::from([("result".to_string(), json!("ok"))])).into())
        }
    }

    struct Concurrency {
        current: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NodeExecutor for Concurrency {
        async fn execute(
            &self,
            _node_id: &str,
            _config: &Value,
            _pool: &VariablePool,
            _ctx: &NodeExecutionContext,
        ) -> Result<NodeRunOutcome, NodeError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(NodeRunResult::default().into())
        }
    }

    const LINEAR: &str = r#"
nodes:
  - id: start
    data: { type: start, variables: [{ variable: query }] }
  - id: end
    data:
      type: end
      outputs: [{ variable: echo, value_selector: [start, query] }]
edges:
  - { source: start, target: end }
"#;

    const FAN_OUT: &str = r#"
nodes:
  - id: start
    data: { type: start }
  - id: t1
    data: { type: tool }
  - id: t2
    data: { type: tool }
  - id: t3
    data: { type: tool }
  - id: end
    data: { type: end }
edges:
  - { source: start, target: t1 }
  - { source: start, target: t2 }
  - { source: start, target: t3 }
  - { source: t1, target: end }
  - { source: t2, target: end }
  - { source: t3, target: end }
"#;

    #[tokio::test]
    async fn test_simple_start_end() {
        let mut d = dispatcher(LINEAR, NodeExecutorRegistry::new());
        let outcome = d.run().await.unwrap();
        let DispatchOutcome::Completed { outputs } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(outputs["echo"], json!("hi"));
        assert_eq!(d.runtime_node("end").unwrap().state, NodeState::Success);
        assert_eq!(d.state().accumulators().total_steps, 2);
    }

    #[tokio::test]
    async fn test_max_steps() {
        let config = EngineConfig {
            max_steps: 1,
            ..Default::default()
        };
        let mut d = dispatcher_with(LINEAR, NodeExecutorRegistry::new(), config, EventEmitter::detached());
        let err = d.run().await.unwrap_err();
        assert!(matches!(err, WorkflowError::MaxStepsExceeded(1)));
    }

    #[tokio::test]
    async fn test_parallel_execution_respects_max_concurrency() {
        for (limit, expected_max) in [(1usize, 1usize), (0, 3)] {
            let current = Arc::new(AtomicUsize::new(0));
            let max_seen = Arc::new(AtomicUsize::new(0));
            let mut registry = NodeExecutorRegistry::new();
            registry.register(
                NodeType::Tool,
                Arc::new(Concurrency {
                    current: current.clone(),
                    max_seen: max_seen.clone(),
                }),
            );
            let config = EngineConfig {
                max_concurrency: limit,
                ..Default::default()
            };
            let mut d = dispatcher_with(FAN_OUT, registry, config, EventEmitter::detached());
            assert!(matches!(d.run().await.unwrap(), DispatchOutcome::Completed { .. }));
            assert_eq!(max_seen.load(Ordering::SeqCst), expected_max);
        }
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = NodeExecutorRegistry::new();
        registry.register(
            NodeType::Tool,
            Arc::new(Flaky {
                failures: 2,
                calls: calls.clone(),
            }),
        );
        let yaml = r#"
nodes:
  - id: start
    data: { type: start }
  - id: tool
    data:
      type: tool
      retry_config: { max_retries: 2, retry_interval: 1 }
  - id: end
    data:
      type: end
      outputs: [{ variable: r, value_selector: [tool, result] }]
edges:
  - { source: start, target: tool }
  - { source: tool, target: end }
"#;
        let (queue, listener) = QueueManager::new(
            "t",
            AppMode::Workflow,
            64,
            Duration::from_secs(10),
            Duration::from_secs(60),
        );
        let mut d = dispatcher_with(yaml, registry, EngineConfig::default(), EventEmitter::new(queue.clone()));
        let DispatchOutcome::Completed { outputs } = d.run().await.unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(outputs["r"], json!("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            d.runtime_node("tool").unwrap().result.as_ref().unwrap().retry_index,
            2
        );

        queue.stop_listen();
        let retries = listener
            .collect_all()
            .await
            .into_iter()
            .filter(|m| matches!(m.event, QueueEvent::NodeRetry { .. }))
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_missing_executor_fails_run() {
        let mut d = dispatcher(FAN_OUT, NodeExecutorRegistry::new());
        let err = d.run().await.unwrap_err();
        assert!(matches!(err, WorkflowError::NodeExecutionError { .. }));
    }

    #[tokio::test]
    async fn test_abort_signal() {
        let stop = StopSignal::new();
        stop.trigger(Some("operator".into()));
        let mut d = dispatcher(LINEAR, NodeExecutorRegistry::new()).with_stop_signal(stop);
        let DispatchOutcome::Aborted { reason } = d.run().await.unwrap() else {
            panic!("expected abort");
        };
        assert_eq!(reason.as_deref(), Some("operator"));
    }

    #[test]
    fn test_calculate_retry_interval() {
        let err = NodeError::Timeout;
        assert_eq!(calculate_retry_interval(None, 0, &err), 0);

        let mut rc: RetryConfig = serde_json::from_value(json!({
            "max_retries": 3,
            "retry_interval": 100,
            "backoff_strategy": "exponential",
            "backoff_multiplier": 2.0,
            "max_retry_interval": 300
        }))
        .unwrap();
        assert_eq!(calculate_retry_interval(Some(&rc), 0, &err), 100);
        assert_eq!(calculate_retry_interval(Some(&rc), 1, &err), 200);
        assert_eq!(calculate_retry_interval(Some(&rc), 2, &err), 300);

        rc.backoff_strategy = BackoffStrategy::Fixed;
        let throttled = NodeError::ModelRuntimeError("429".into())
            .with_context(ErrorContext::retryable(ErrorCode::ModelRateLimit, "slow down").with_retry_after(2));
        assert_eq!(calculate_retry_interval(Some(&rc), 0, &throttled), 300);

        rc.max_retry_interval = 5000;
        assert_eq!(calculate_retry_interval(Some(&rc), 0, &throttled), 2000);
        let huge = NodeError::ModelRuntimeError("429".into())
            .with_context(ErrorContext::retryable(ErrorCode::ModelRateLimit, "later").with_retry_after(u64::MAX));
        assert_eq!(calculate_retry_interval(Some(&rc), 0, &huge), 5000);
    }

    const FORM: &str = r#"
nodes:
  - id: start
    data: { type: start }
  - id: review
    data:
      type: human-input
      inputs: [{ output_variable_name: verdict, required: true }]
  - id: end
    data:
      type: end
      outputs: [{ variable: verdict, value_selector: [review, verdict] }]
edges:
  - { source: start, target: review }
  - { source: review, target: end }
"#;

    #[tokio::test]
    async fn test_resume_pool_is_pause_pool_plus_submitted_values() {
        let mut d = dispatcher(FORM, NodeExecutorRegistry::new());
        let DispatchOutcome::Paused { checkpoint, .. } = d.run().await.unwrap() else {
            panic!("expected pause");
        };
        assert!(d.executing_nodes().is_empty());
        let at_pause = checkpoint.pool.clone();
        assert_eq!(at_pause.user_inputs["query"], json!("hi"));

        let graph = build_graph(&parse_dsl(FORM, DslFormat::Yaml).unwrap()).unwrap();
        let mut resumed = WorkflowDispatcher::from_checkpoint(
            Arc::new(graph),
            Arc::new(NodeExecutorRegistry::new()),
            Arc::new(RuntimeContext::default()),
            Arc::new(EngineConfig::default()),
            EventEmitter::detached(),
            checkpoint,
        );
        let submitted = HashMap::from([("verdict".to_string(), json!("ok"))]);
        resumed
            .complete_paused_node("review", submitted.clone(), None)
            .await
            .unwrap();

        let mut expected = VariablePool::restore(&at_pause);
        expected.add_node_outputs("review", &submitted).unwrap();
        assert_eq!(resumed.state().pool().snapshot(), expected.snapshot());

        let DispatchOutcome::Completed { outputs } = resumed.run().await.unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(outputs["verdict"], json!("ok"));
        assert!(resumed.executing_nodes().is_empty());
    }

    #[tokio::test]
    async fn test_loop_body_steps_count_toward_run_limit() {
        let yaml = r#"
nodes:
  - id: start
    data: { type: start }
  - id: loop1
    data:
      type: loop
      loop_count: 3
      loop_variables: [{ label: num, var_type: number, value: 1 }]
      sub_graph:
        nodes:
          - id: body_start
            data: { type: start }
          - id: bump
            data:
              type: assigner
              items: [{ variable_selector: [loop1, num], operation: "+=", value: 1 }]
          - id: body_end
            data:
              type: end
              outputs: [{ variable: num, value_selector: [bump, num] }]
        edges:
          - { source: body_start, target: bump }
          - { source: bump, target: body_end }
  - id: end
    data: { type: end }
edges:
  - { source: start, target: loop1 }
  - { source: loop1, target: end }
"#;
        let mut d = dispatcher(yaml, NodeExecutorRegistry::new());
        assert!(matches!(d.run().await.unwrap(), DispatchOutcome::Completed { .. }));
        assert_eq!(d.state().accumulators().total_steps, 12);

        let config = EngineConfig {
            max_steps: 5,
            ..Default::default()
        };
        let mut d = dispatcher_with(yaml, NodeExecutorRegistry::new(), config, EventEmitter::detached());
        let err = d.run().await.unwrap_err();
        assert!(matches!(err, WorkflowError::MaxStepsExceeded(5)));
    }
}
