use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use xworkflow_engine::config::FairnessConfig;
use xworkflow_engine::core::{PauseReasonType, QueueEvent, StopReason};
use xworkflow_engine::dsl::{NodeRunResult, NodeType};
use xworkflow_engine::nodes::{NodeExecutionContext, NodeExecutor, NodeRunOutcome};
use xworkflow_engine::repository::WorkflowExecutionRepository;
use xworkflow_engine::scheduler::{DeploymentEdition, PreemptionProbe, ScheduleStrategy};
use xworkflow_engine::{
    parse_dsl, DslFormat, ExecutionContext, ExecutionStatus, FairnessScheduler, FakeTimeProvider,
    InMemoryConversationVariableUpdater, InMemoryExecutionRepository, InMemoryPauseStore,
    NodeError, NodeExecutorRegistry, QueueTier, ResumeRequest, RunQueue, RunRequest, RunTicket,
    TimeProvider, VariablePool, WorkflowExecutionStatus, WorkflowRunner,
};

const LINEAR: &str = include_str!("cases/linear_answer/workflow.yaml");
const CONVERSATION: &str = include_str!("cases/conversation_assign/workflow.yaml");

const SLOW: &str = r#"
nodes:
  - id: start
    data: { type: start }
  - id: crawl
    data: { type: tool }
  - id: end
    data: { type: end }
edges:
  - { source: start, target: crawl }
  - { source: crawl, target: end }
"#;

/// Tool that only finishes when cancelled.
struct Hang;

#[async_trait]
impl NodeExecutor for Hang {
    async fn execute(
        &self,
        _node_id: &str,
        _config: &Value,
        _pool: &VariablePool,
        ctx: &NodeExecutionContext,
    ) -> Result<NodeRunOutcome, NodeError> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(NodeRunResult::default().into()),
            _ = ctx.cancel.cancelled() => Err(NodeError::GenerationStopped),
        }
    }
}

/// Asks the dispatcher to yield exactly once.
#[derive(Default)]
struct YieldOnce {
    used: AtomicBool,
}

impl PreemptionProbe for YieldOnce {
    fn should_yield(&self) -> bool {
        !self.used.swap(true, Ordering::SeqCst)
    }
}

fn inputs(name: &str) -> HashMap<String, Value> {
    HashMap::from([("name".to_string(), json!(name))])
}

#[tokio::test]
async fn test_stop_aborts_running_workflow() {
    let mut registry = NodeExecutorRegistry::new();
    registry.register(NodeType::Tool, Arc::new(Hang));
    let executions = Arc::new(InMemoryExecutionRepository::new());
    let runner = WorkflowRunner::builder(parse_dsl(SLOW, DslFormat::Yaml).unwrap())
        .registry(registry)
        .execution_repository(executions.clone())
        .build()
        .unwrap();

    let handle = runner.run(RunRequest::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.stop(Some("operator".to_string()));

    let (status, events) = tokio::time::timeout(Duration::from_secs(5), handle.wait_with_events())
        .await
        .expect("run unwinds after stop");
    assert_eq!(status, ExecutionStatus::Stopped);
    assert!(events.iter().any(|m| matches!(
        &m.event,
        QueueEvent::Stop { reason: StopReason::Aborted, message: Some(msg) } if msg == "operator"
    )));
    assert!(!events.iter().any(|m| matches!(m.event, QueueEvent::WorkflowSucceeded { .. })));

    let saved = executions.get(handle.execution_id()).await.unwrap().unwrap();
    assert_eq!(saved.status, WorkflowExecutionStatus::Stopped);
}

#[tokio::test]
async fn test_conversation_updates_flushed_on_success() {
    let updater = Arc::new(InMemoryConversationVariableUpdater::new());
    let mut execution = ExecutionContext::new("tenant-1", "chat");
    execution.conversation_id = Some("conv-9".to_string());
    let runner = WorkflowRunner::builder(parse_dsl(CONVERSATION, DslFormat::Yaml).unwrap())
        .execution_context(execution)
        .conversation_updater(updater.clone())
        .build()
        .unwrap();

    let handle = runner.run(RunRequest::default()).await.unwrap();
    assert_eq!(
        handle.wait().await,
        ExecutionStatus::Succeeded(HashMap::from([("turns".to_string(), json!(3))]))
    );
    assert_eq!(updater.get("conv-9", "turns"), Some(json!(3)));
    assert_eq!(updater.pending_len(), 0);
}

#[tokio::test]
async fn test_time_slice_yield_then_resume() {
    let pauses = Arc::new(InMemoryPauseStore::new());
    let executions = Arc::new(InMemoryExecutionRepository::new());
    let clock = Arc::new(FakeTimeProvider::new(1_700_000_000));
    let runner = WorkflowRunner::builder(parse_dsl(LINEAR, DslFormat::Yaml).unwrap())
        .time_provider(clock.clone())
        .pause_repository(pauses.clone())
        .execution_repository(executions.clone())
        .preemption_probe(Arc::new(YieldOnce::default()))
        .build()
        .unwrap();

    let handle = runner.run(RunRequest::new(inputs("Lin"))).await.unwrap();
    let ExecutionStatus::Paused { pause_id, reasons } = handle.wait().await else {
        panic!("expected the run to yield");
    };
    assert_eq!(reasons[0].kind(), PauseReasonType::ScheduledPause);

    let due = runner.due_scheduled_pauses(clock.now_timestamp()).await.unwrap();
    assert!(due.iter().any(|r| r.pause_id == pause_id));

    let resumed = runner.resume(ResumeRequest::new(&pause_id)).await.unwrap();
    let ExecutionStatus::Succeeded(outputs) = resumed.wait().await else {
        panic!("resumed run should succeed");
    };
    assert_eq!(outputs.get("text"), Some(&json!("Hello, Lin!")));
    assert!(runner.due_scheduled_pauses(clock.now_timestamp()).await.unwrap().is_empty());

    // the same inputs without the yield produce the same outputs
    let straight = WorkflowRunner::builder(parse_dsl(LINEAR, DslFormat::Yaml).unwrap())
        .time_provider(clock.clone())
        .build()
        .unwrap();
    let handle = straight.run(RunRequest::new(inputs("Lin"))).await.unwrap();
    assert_eq!(handle.wait().await, ExecutionStatus::Succeeded(outputs));
}

#[tokio::test]
async fn test_sandbox_slice_probe_preempts_run() {
    let clock = Arc::new(FakeTimeProvider::new(1_000));
    let config = FairnessConfig {
        edition: DeploymentEdition::Cloud,
        granularity_secs: 30,
        sandbox_concurrency: 1,
        ..Default::default()
    };
    let scheduler = Arc::new(FairnessScheduler::with_time_provider(config, clock.clone()));
    assert_eq!(scheduler.strategy(), ScheduleStrategy::TimeSlice);
    let queue = RunQueue::new(scheduler.clone());
    queue.enqueue(RunTicket::new("a", "t1", QueueTier::Sandbox, clock.now_timestamp()));
    queue.enqueue(RunTicket::new("b", "t2", QueueTier::Sandbox, clock.now_timestamp()));

    let (ticket, permit) = queue.try_dequeue().unwrap();
    assert_eq!(ticket.id, "a");
    assert!(queue.try_dequeue().is_none(), "second sandbox run waits for the slot");

    clock.advance(31);
    let pauses = Arc::new(InMemoryPauseStore::new());
    let executions = Arc::new(InMemoryExecutionRepository::new());
    let schema = parse_dsl(LINEAR, DslFormat::Yaml).unwrap();
    let runner = WorkflowRunner::builder(schema.clone())
        .time_provider(clock.clone())
        .pause_repository(pauses.clone())
        .execution_repository(executions.clone())
        .preemption_probe(permit.probe())
        .build()
        .unwrap();
    let handle = runner.run(RunRequest::new(inputs("Sam"))).await.unwrap();
    let ExecutionStatus::Paused { pause_id, .. } = handle.wait().await else {
        panic!("sandbox run should yield its slice");
    };

    // the yielding run goes to the back; the waiting one takes the slot
    drop(permit);
    queue.requeue(ticket);
    let (next, _permit) = queue.try_dequeue().unwrap();
    assert_eq!(next.id, "b");

    let later = WorkflowRunner::builder(schema)
        .time_provider(clock.clone())
        .pause_repository(pauses)
        .execution_repository(executions)
        .build()
        .unwrap();
    let resumed = later.resume(ResumeRequest::new(&pause_id)).await.unwrap();
    assert!(matches!(resumed.wait().await, ExecutionStatus::Succeeded(_)));
}

#[tokio::test]
async fn test_self_hosted_edition_never_defers() {
    let scheduler = Arc::new(FairnessScheduler::new(FairnessConfig {
        sandbox_concurrency: 1,
        ..Default::default()
    }));
    assert_eq!(scheduler.strategy(), ScheduleStrategy::Nop);
    let queue = RunQueue::new(scheduler);
    for id in ["a", "b", "c"] {
        queue.enqueue(RunTicket::new(id, "t", QueueTier::Sandbox, 0));
    }
    let permits: Vec<_> = std::iter::from_fn(|| queue.try_dequeue()).collect();
    assert_eq!(permits.len(), 3);
    assert!(queue.is_empty());
}
