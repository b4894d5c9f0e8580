//! High-level workflow runner and builder.
//!
//! [`WorkflowRunner`] (constructed via [`WorkflowRunnerBuilder`]) is the main
//! entry point for executing a parsed workflow schema. It wires together the
//! graph, variable pool, node executors, repositories and event queue, and
//! hands back a [`WorkflowHandle`].

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::EngineConfig;
use crate::core::execution_context::ExecutionContext;
use crate::core::graph_engine::{GraphEngine, ResumeTarget};
use crate::core::pause::{PauseReason, ResumeRequest, WorkflowPause, WorkflowPauseReason};
use crate::core::queue_manager::{AppMode, QueueManager};
use crate::core::runtime_context::{IdGenerator, RealIdGenerator, RealTimeProvider, RuntimeContext, TimeProvider};
use crate::core::stop_signal::StopSignal;
use crate::core::variable_pool::VariablePool;
use crate::dsl::schema::WorkflowSchema;
use crate::error::{RepositoryError, WorkflowError, WorkflowResult};
use crate::graph::{build_graph, Graph};
use crate::nodes::executor::NodeExecutorRegistry;
use crate::nodes::human_input::validate_submission;
use crate::nodes::runtime::{ModelRuntime, ToolRuntime};
use crate::repository::{
    ConversationVariableUpdater, InMemoryExecutionRepository, InMemoryPauseStore, WorkflowExecution,
    WorkflowExecutionRepository, WorkflowPauseRepository,
};
use crate::scheduler::PreemptionProbe;

use super::handle::{ExecutionStatus, WorkflowHandle};

/// A validated workflow plus everything needed to run or resume it.
///
/// Use [`WorkflowRunner::builder(schema)`](Self::builder) to obtain a
/// [`WorkflowRunnerBuilder`].
pub struct WorkflowRunner {
    schema: WorkflowSchema,
    graph: Arc<Graph>,
    registry: Arc<NodeExecutorRegistry>,
    config: Arc<EngineConfig>,
    execution: ExecutionContext,
    time_provider: Arc<dyn TimeProvider>,
    id_generator: Arc<dyn IdGenerator>,
    executions: Arc<dyn WorkflowExecutionRepository>,
    pauses: Arc<dyn WorkflowPauseRepository>,
    conversation: Option<Arc<dyn ConversationVariableUpdater>>,
    preemption: Option<Arc<dyn PreemptionProbe>>,
    app_mode: AppMode,
    collect_events: bool,
}

impl WorkflowRunner {
    /// Create a new builder from a parsed workflow schema.
    pub fn builder(schema: WorkflowSchema) -> WorkflowRunnerBuilder {
        WorkflowRunnerBuilder {
            schema,
            config: EngineConfig::default(),
            execution: ExecutionContext::default(),
            registry: None,
            model_runtime: None,
            tool_runtime: None,
            time_provider: Arc::new(RealTimeProvider),
            id_generator: Arc::new(RealIdGenerator),
            executions: Arc::new(InMemoryExecutionRepository::new()),
            pauses: Arc::new(InMemoryPauseStore::new()),
            conversation: None,
            preemption: None,
            app_mode: AppMode::Workflow,
            collect_events: true,
        }
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn pause_repository(&self) -> &Arc<dyn WorkflowPauseRepository> {
        &self.pauses
    }

    pub fn execution_repository(&self) -> &Arc<dyn WorkflowExecutionRepository> {
        &self.executions
    }

    fn runtime_context(&self, execution_id: &str) -> Arc<RuntimeContext> {
        let mut execution = self.execution.clone();
        execution.workflow_execution_id = execution_id.to_string();
        if execution.trace_id.is_empty() {
            execution.trace_id = execution_id.to_string();
        }
        Arc::new(
            RuntimeContext::default()
                .with_execution(execution)
                .with_time_provider(self.time_provider.clone())
                .with_id_generator(self.id_generator.clone()),
        )
    }

    fn engine(&self, context: Arc<RuntimeContext>, queue: QueueManager, stop: StopSignal) -> GraphEngine {
        let mut engine = GraphEngine::new(
            self.graph.clone(),
            self.registry.clone(),
            context,
            self.config.clone(),
            queue,
            self.executions.clone(),
            self.pauses.clone(),
        )
        .with_stop_signal(stop);
        if let Some(updater) = &self.conversation {
            engine = engine.with_conversation_updater(updater.clone());
        }
        if let Some(probe) = &self.preemption {
            engine = engine.with_preemption_probe(probe.clone());
        }
        engine
    }

    fn initial_pool(&self, context: &ExecutionContext, request: &RunRequest) -> VariablePool {
        let mut pool = VariablePool::new();

        let mut system = HashMap::from([
            ("workflow_id".to_string(), Value::from(context.workflow_id.clone())),
            ("workflow_run_id".to_string(), Value::from(context.workflow_execution_id.clone())),
            ("app_id".to_string(), Value::from(context.app_id.clone())),
            ("user_id".to_string(), Value::from(context.user_id.clone())),
        ]);
        if let Some(conversation_id) = &context.conversation_id {
            system.insert("conversation_id".to_string(), Value::from(conversation_id.clone()));
        }
        system.extend(request.system_vars.clone());
        pool.seed_system_variables(&system);

        let mut environment: HashMap<String, Value> = self
            .schema
            .environment_variables
            .iter()
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect();
        environment.extend(request.environment_vars.clone());
        pool.seed_environment_variables(&environment);

        let mut conversation: HashMap<String, Value> = self
            .schema
            .conversation_variables
            .iter()
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect();
        conversation.extend(request.conversation_vars.clone());
        pool.seed_conversation_variables(&conversation);

        pool.set_user_inputs(request.user_inputs.clone());
        pool
    }

    /// Start a new run.
    pub async fn run(&self, request: RunRequest) -> WorkflowResult<WorkflowHandle> {
        let execution_id = self.id_generator.next_id();
        let context = self.runtime_context(&execution_id);
        let pool = self.initial_pool(&context.execution, &request);
        let execution = WorkflowExecution::new(
            execution_id.clone(),
            context.execution.workflow_id.clone(),
            context.execution.tenant_id.clone(),
            request.user_inputs,
            self.time_provider.now_timestamp(),
        );
        tracing::debug!(execution_id = %execution_id, "launching workflow run");

        let (queue, listener) = QueueManager::from_config(execution_id.clone(), self.app_mode, &self.config);
        let stop = StopSignal::new();
        let engine = self.engine(context, queue.clone(), stop.clone());

        let (status_tx, status_rx) = watch::channel(ExecutionStatus::Running);
        tokio::spawn(async move {
            let result = engine.run(execution, pool).await;
            queue.stop_listen();
            let _ = status_tx.send(ExecutionStatus::from(result));
        });
        Ok(WorkflowHandle::new(execution_id, status_rx, listener, self.collect_events, stop))
    }

    /// Resume a paused run.
    ///
    /// The submission is validated against the paused node's form before the
    /// pause is consumed, so a rejected submission leaves the pause resumable.
    /// Consuming an already-resumed pause fails with
    /// [`WorkflowError::ResumeConflict`].
    pub async fn resume(&self, request: ResumeRequest) -> WorkflowResult<WorkflowHandle> {
        let tenant_id = self.execution.tenant_id.clone();
        let pause = self
            .pauses
            .get_pause(&tenant_id, &request.pause_id)
            .await?
            .ok_or_else(|| WorkflowError::PauseNotFound(request.pause_id.clone()))?;
        if pause.is_resumed() {
            return Err(WorkflowError::ResumeConflict {
                pause_id: request.pause_id.clone(),
                reason: "pause already resumed".to_string(),
            });
        }
        let target = resume_target(&pause, &request)?;

        let now = self.time_provider.now_timestamp();
        let pause = self
            .pauses
            .consume_pause(&tenant_id, &request.pause_id, now)
            .await
            .map_err(|e| WorkflowError::from_resume_failure(&request.pause_id, e))?;
        let execution = self
            .executions
            .get(&pause.execution_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(pause.execution_id.clone()))?;
        tracing::info!(
            pause_id = %pause.pause_id,
            execution_id = %execution.id,
            resumed_by = ?request.resumed_by_user_id,
            reason = ?request.resume_reason,
            "resuming workflow run"
        );

        let execution_id = execution.id.clone();
        let context = self.runtime_context(&execution_id);
        let (queue, listener) = QueueManager::from_config(execution_id.clone(), self.app_mode, &self.config);
        let stop = StopSignal::new();
        let engine = self.engine(context, queue.clone(), stop.clone());

        let (status_tx, status_rx) = watch::channel(ExecutionStatus::Running);
        let checkpoint = pause.checkpoint;
        tokio::spawn(async move {
            let result = engine.resume(execution, checkpoint, target).await;
            queue.stop_listen();
            let _ = status_tx.send(ExecutionStatus::from(result));
        });
        Ok(WorkflowHandle::new(execution_id, status_rx, listener, self.collect_events, stop))
    }

    /// Scheduled pauses whose resume time has passed, for an external sweeper.
    pub async fn due_scheduled_pauses(&self, now: i64) -> WorkflowResult<Vec<WorkflowPauseReason>> {
        Ok(self.pauses.due_scheduled_pauses(now).await?)
    }
}

/// Pick and validate the node a resume request completes.
fn resume_target(pause: &WorkflowPause, request: &ResumeRequest) -> WorkflowResult<Option<ResumeTarget>> {
    let conflict = |reason: String| WorkflowError::ResumeConflict {
        pause_id: pause.pause_id.clone(),
        reason,
    };
    let paused = &pause.checkpoint.paused_nodes;
    if paused.is_empty() {
        return Ok(None);
    }

    let node = match &request.node_id {
        Some(node_id) => paused
            .iter()
            .find(|p| &p.node_id == node_id)
            .ok_or_else(|| conflict(format!("node '{}' is not paused", node_id)))?,
        None if paused.len() == 1 => &paused[0],
        None => return Err(conflict("several nodes are paused; node_id is required".to_string())),
    };

    let outputs = match &node.reason {
        PauseReason::HumanInputRequired { inputs, actions, .. } => {
            if let Some(action) = &request.action {
                if !actions.is_empty() && !actions.iter().any(|a| &a.id == action) {
                    return Err(conflict(format!("unknown action '{}'", action)));
                }
            }
            validate_submission(inputs, &request.inputs).map_err(conflict)?
        }
        PauseReason::ScheduledPause { .. } => request.inputs.clone(),
    };
    Ok(Some(ResumeTarget {
        node_id: node.node_id.clone(),
        outputs,
        handle: request.action.clone(),
    }))
}

/// Inputs of one run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub user_inputs: HashMap<String, Value>,
    pub system_vars: HashMap<String, Value>,
    pub environment_vars: HashMap<String, Value>,
    pub conversation_vars: HashMap<String, Value>,
}

impl RunRequest {
    pub fn new(user_inputs: HashMap<String, Value>) -> Self {
        Self {
            user_inputs,
            ..Default::default()
        }
    }

    pub fn system_vars(mut self, vars: HashMap<String, Value>) -> Self {
        self.system_vars = vars;
        self
    }

    pub fn environment_vars(mut self, vars: HashMap<String, Value>) -> Self {
        self.environment_vars = vars;
        self
    }

    pub fn conversation_vars(mut self, vars: HashMap<String, Value>) -> Self {
        self.conversation_vars = vars;
        self
    }
}

/// Builder for configuring a [`WorkflowRunner`].
pub struct WorkflowRunnerBuilder {
    schema: WorkflowSchema,
    config: EngineConfig,
    execution: ExecutionContext,
    registry: Option<NodeExecutorRegistry>,
    model_runtime: Option<Arc<dyn ModelRuntime>>,
    tool_runtime: Option<Arc<dyn ToolRuntime>>,
    time_provider: Arc<dyn TimeProvider>,
    id_generator: Arc<dyn IdGenerator>,
    executions: Arc<dyn WorkflowExecutionRepository>,
    pauses: Arc<dyn WorkflowPauseRepository>,
    conversation: Option<Arc<dyn ConversationVariableUpdater>>,
    preemption: Option<Arc<dyn PreemptionProbe>>,
    app_mode: AppMode,
    collect_events: bool,
}

impl WorkflowRunnerBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn execution_context(mut self, execution: ExecutionContext) -> Self {
        self.execution = execution;
        self
    }

    /// Replace the default executor registry. Runtimes set through
    /// [`model_runtime`](Self::model_runtime) and
    /// [`tool_runtime`](Self::tool_runtime) are still registered on top.
    pub fn registry(mut self, registry: NodeExecutorRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn model_runtime(mut self, runtime: Arc<dyn ModelRuntime>) -> Self {
        self.model_runtime = Some(runtime);
        self
    }

    pub fn tool_runtime(mut self, runtime: Arc<dyn ToolRuntime>) -> Self {
        self.tool_runtime = Some(runtime);
        self
    }

    pub fn time_provider(mut self, time_provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = time_provider;
        self
    }

    pub fn id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    pub fn execution_repository(mut self, repository: Arc<dyn WorkflowExecutionRepository>) -> Self {
        self.executions = repository;
        self
    }

    pub fn pause_repository(mut self, repository: Arc<dyn WorkflowPauseRepository>) -> Self {
        self.pauses = repository;
        self
    }

    pub fn conversation_updater(mut self, updater: Arc<dyn ConversationVariableUpdater>) -> Self {
        self.conversation = Some(updater);
        self
    }

    pub fn preemption_probe(mut self, probe: Arc<dyn PreemptionProbe>) -> Self {
        self.preemption = Some(probe);
        self
    }

    pub fn app_mode(mut self, app_mode: AppMode) -> Self {
        self.app_mode = app_mode;
        self
    }

    pub fn collect_events(mut self, collect: bool) -> Self {
        self.collect_events = collect;
        self
    }

    /// Build and validate the graph.
    pub fn build(self) -> WorkflowResult<WorkflowRunner> {
        let graph = build_graph(&self.schema)?;

        let mut registry = self.registry.unwrap_or_default();
        if let Some(runtime) = self.model_runtime {
            registry = registry.with_model_runtime(runtime);
        }
        if let Some(runtime) = self.tool_runtime {
            registry = registry.with_tool_runtime(runtime);
        }

        Ok(WorkflowRunner {
            schema: self.schema,
            graph: Arc::new(graph),
            registry: Arc::new(registry),
            config: Arc::new(self.config),
            execution: self.execution,
            time_provider: self.time_provider,
            id_generator: self.id_generator,
            executions: self.executions,
            pauses: self.pauses,
            conversation: self.conversation,
            preemption: self.preemption,
            app_mode: self.app_mode,
            collect_events: self.collect_events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pause::PausedNode;
    use crate::dsl::schema::{FormInput, UserAction};
    use serde_json::json;

    fn form_pause() -> WorkflowPause {
        let reason = PauseReason::HumanInputRequired {
            form_id: "f".into(),
            form_content: String::new(),
            inputs: vec![FormInput {
                output_variable_name: "verdict".into(),
                input_type: "text".into(),
                label: String::new(),
                required: true,
                default: None,
            }],
            actions: vec![UserAction {
                id: "approve".into(),
                title: String::new(),
            }],
            node_id: "review".into(),
            node_title: "Review".into(),
        };
        WorkflowPause {
            pause_id: "p1".into(),
            execution_id: "e1".into(),
            workflow_id: "wf".into(),
            tenant_id: "t1".into(),
            checkpoint: crate::core::pause::RunCheckpoint {
                paused_nodes: vec![PausedNode {
                    node_id: "review".into(),
                    reason,
                }],
                ..Default::default()
            },
            created_at: 0,
            resumed_at: None,
        }
    }

    #[test]
    fn test_resume_target_validation() {
        let pause = form_pause();

        let missing = ResumeRequest::new("p1");
        assert!(matches!(
            resume_target(&pause, &missing),
            Err(WorkflowError::ResumeConflict { .. })
        ));

        let wrong_node = ResumeRequest::new("p1").with_node_id("other").with_input("verdict", json!("ok"));
        assert!(resume_target(&pause, &wrong_node).is_err());

        let bad_action = ResumeRequest::new("p1").with_input("verdict", json!("ok")).with_action("reject");
        assert!(resume_target(&pause, &bad_action).is_err());

        let ok = ResumeRequest::new("p1").with_input("verdict", json!("ok")).with_action("approve");
        let target = resume_target(&pause, &ok).unwrap().unwrap();
        assert_eq!(target.node_id, "review");
        assert_eq!(target.handle.as_deref(), Some("approve"));
        assert_eq!(target.outputs["verdict"], json!("ok"));
    }

    #[test]
    fn test_scheduled_pause_without_paused_nodes() {
        let mut pause = form_pause();
        pause.checkpoint.paused_nodes.clear();
        assert!(resume_target(&pause, &ResumeRequest::new("p1")).unwrap().is_none());
    }
}
