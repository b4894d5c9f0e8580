use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use xworkflow_engine::repository::{
    WorkflowExecutionRepository, WorkflowPauseRepository,
};
use xworkflow_engine::{
    parse_dsl, DslFormat, ExecutionContext, ExecutionStatus, FakeIdGenerator, FakeTimeProvider,
    FilePauseStore, InMemoryExecutionRepository, InMemoryPauseStore, PauseReason, ResumeRequest,
    RunRequest, WorkflowError, WorkflowExecutionStatus, WorkflowRunner,
};

const REVIEW: &str = include_str!("cases/human_input_pause/workflow.yaml");

struct Stores {
    pauses: Arc<dyn WorkflowPauseRepository>,
    executions: Arc<dyn WorkflowExecutionRepository>,
}

impl Stores {
    fn in_memory() -> Self {
        Stores {
            pauses: Arc::new(InMemoryPauseStore::new()),
            executions: Arc::new(InMemoryExecutionRepository::new()),
        }
    }

    fn runner(&self, tenant: &str) -> WorkflowRunner {
        WorkflowRunner::builder(parse_dsl(REVIEW, DslFormat::Yaml).unwrap())
            .execution_context(ExecutionContext::new(tenant, "review-flow"))
            .time_provider(Arc::new(FakeTimeProvider::new(1_700_000_000)))
            .id_generator(Arc::new(FakeIdGenerator::new(tenant)))
            .pause_repository(self.pauses.clone())
            .execution_repository(self.executions.clone())
            .build()
            .unwrap()
    }
}

async fn pause(runner: &WorkflowRunner) -> (String, String, Vec<PauseReason>) {
    let handle = runner
        .run(RunRequest::new(HashMap::from([("doc".to_string(), json!("report.pdf"))])))
        .await
        .unwrap();
    match handle.wait().await {
        ExecutionStatus::Paused { pause_id, reasons } => (handle.execution_id().to_string(), pause_id, reasons),
        other => panic!("expected pause, got {:?}", other),
    }
}

#[tokio::test]
async fn test_pause_then_resume_with_action() {
    let stores = Stores::in_memory();
    let runner = stores.runner("tenant-1");
    let (execution_id, pause_id, reasons) = pause(&runner).await;

    let PauseReason::HumanInputRequired { form_content, actions, .. } = &reasons[0] else {
        panic!("expected a form, got {:?}", reasons[0]);
    };
    assert_eq!(form_content, "Approve report.pdf?");
    assert_eq!(actions.len(), 2);

    let saved = stores.executions.get(&execution_id).await.unwrap().unwrap();
    assert_eq!(saved.status, WorkflowExecutionStatus::Paused);
    assert_eq!(stores.pauses.pause_reasons(&pause_id).await.unwrap().len(), 1);

    let handle = runner
        .resume(
            ResumeRequest::new(&pause_id)
                .with_input("verdict", json!("ship it"))
                .with_action("approve"),
        )
        .await
        .unwrap();
    assert_eq!(handle.execution_id(), execution_id);
    let (status, events) = handle.wait_with_events().await;
    assert_eq!(
        status,
        ExecutionStatus::Succeeded(HashMap::from([("verdict".to_string(), json!("ship it"))]))
    );
    assert!(!events.is_empty());

    let done = stores.executions.get(&execution_id).await.unwrap().unwrap();
    assert_eq!(done.status, WorkflowExecutionStatus::Succeeded);
    assert!(done.finished_at.is_some());
}

#[tokio::test]
async fn test_second_resume_conflicts() {
    let stores = Stores::in_memory();
    let runner = stores.runner("tenant-1");
    let (_, pause_id, _) = pause(&runner).await;

    let request = ResumeRequest::new(&pause_id)
        .with_input("verdict", json!("ok"))
        .with_action("approve");
    let first = runner.resume(request.clone()).await.unwrap();
    assert!(matches!(first.wait().await, ExecutionStatus::Succeeded(_)));

    let err = runner.resume(request).await.err().unwrap();
    assert!(matches!(err, WorkflowError::ResumeConflict { .. }), "got {:?}", err);
}

#[tokio::test]
async fn test_rejected_submission_keeps_pause_resumable() {
    let stores = Stores::in_memory();
    let runner = stores.runner("tenant-1");
    let (_, pause_id, _) = pause(&runner).await;

    let err = runner
        .resume(ResumeRequest::new(&pause_id).with_action("approve"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, WorkflowError::ResumeConflict { .. }));

    let pause = stores.pauses.get_pause("tenant-1", &pause_id).await.unwrap().unwrap();
    assert!(!pause.is_resumed());

    let handle = runner
        .resume(ResumeRequest::new(&pause_id).with_input("verdict", json!("fine")).with_action("approve"))
        .await
        .unwrap();
    assert!(matches!(handle.wait().await, ExecutionStatus::Succeeded(_)));
}

#[tokio::test]
async fn test_reject_action_routes_away_from_end() {
    let stores = Stores::in_memory();
    let runner = stores.runner("tenant-1");
    let (_, pause_id, _) = pause(&runner).await;

    let handle = runner
        .resume(ResumeRequest::new(&pause_id).with_input("verdict", json!("no")).with_action("reject"))
        .await
        .unwrap();
    // the only edge out of the form listens on "approve", so the end node is skipped
    assert_eq!(handle.wait().await, ExecutionStatus::Succeeded(HashMap::new()));
}

#[tokio::test]
async fn test_unknown_or_foreign_pause_not_found() {
    let stores = Stores::in_memory();
    let runner = stores.runner("tenant-1");
    let (_, pause_id, _) = pause(&runner).await;

    let err = runner.resume(ResumeRequest::new("no-such-pause")).await.err().unwrap();
    assert!(matches!(err, WorkflowError::PauseNotFound(_)));

    let intruder = stores.runner("tenant-2");
    let err = intruder
        .resume(ResumeRequest::new(&pause_id).with_input("verdict", json!("x")))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, WorkflowError::PauseNotFound(_)));
}

#[tokio::test]
async fn test_file_store_pause_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let stores = Stores {
        pauses: Arc::new(FilePauseStore::new(dir.path()).unwrap()),
        executions: Arc::new(InMemoryExecutionRepository::new()),
    };
    let runner = stores.runner("tenant-1");
    let (_, pause_id, _) = pause(&runner).await;

    // a fresh store over the same directory sees the pause
    let reopened = FilePauseStore::new(dir.path()).unwrap();
    assert!(reopened.get_pause("tenant-1", &pause_id).await.unwrap().is_some());

    let request = ResumeRequest::new(&pause_id)
        .with_input("verdict", json!("ok"))
        .with_action("approve");
    let handle = runner.resume(request.clone()).await.unwrap();
    assert!(matches!(handle.wait().await, ExecutionStatus::Succeeded(_)));
    assert!(runner.resume(request).await.is_err());
}
