use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use xworkflow_engine::{
    parse_dsl, DslFormat, EngineConfig, ExecutionContext, ExecutionStatus, FakeIdGenerator,
    FakeTimeProvider, QueueMessage, RunRequest, WorkflowRunner,
};

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct CaseFile {
    inputs: HashMap<String, Value>,
    conversation_vars: HashMap<String, Value>,
    conversation_id: Option<String>,
    config: Option<EngineConfig>,
    expect: Expectation,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct Expectation {
    status: String,
    outputs: Option<HashMap<String, Value>>,
    exceptions_count: Option<usize>,
    error_contains: Option<String>,
    /// Event names that must appear in this relative order.
    events: Vec<String>,
    /// Event names that must not appear at all.
    absent_events: Vec<String>,
}

fn event_name(message: &QueueMessage) -> String {
    serde_json::to_value(&message.event)
        .ok()
        .and_then(|v| v.get("event").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default()
}

fn assert_subsequence(case: &str, expected: &[String], actual: &[String]) {
    let mut remaining = actual.iter();
    for name in expected {
        assert!(
            remaining.any(|a| a == name),
            "[{}] event '{}' missing or out of order in {:?}",
            case,
            name,
            actual
        );
    }
}

pub async fn run_case(case_dir: &Path) {
    let case = case_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let workflow = fs::read_to_string(case_dir.join("workflow.yaml")).expect("workflow.yaml");
    let state: CaseFile =
        serde_saphyr::from_str_with_options(
            &fs::read_to_string(case_dir.join("case.yaml")).expect("case.yaml"),
            serde_saphyr::Options {
                strict_booleans: true,
                ..Default::default()
            },
        )
        .expect("valid case.yaml");

    let schema = parse_dsl(&workflow, DslFormat::Yaml).expect("valid workflow");
    let mut execution = ExecutionContext::new("tenant-1", case.clone());
    execution.conversation_id = state.conversation_id.clone();

    let runner = WorkflowRunner::builder(schema)
        .config(state.config.unwrap_or_default())
        .execution_context(execution)
        .time_provider(Arc::new(FakeTimeProvider::new(1_700_000_000)))
        .id_generator(Arc::new(FakeIdGenerator::new(case.clone())))
        .build()
        .expect("runner builds");

    let handle = runner
        .run(RunRequest::new(state.inputs).conversation_vars(state.conversation_vars))
        .await
        .expect("run starts");
    let (status, events) = handle.wait_with_events().await;
    let names: Vec<String> = events.iter().map(event_name).collect();

    let expect = &state.expect;
    let outputs = match (&status, expect.status.as_str()) {
        (ExecutionStatus::Succeeded(outputs), "succeeded") => Some(outputs.clone()),
        (
            ExecutionStatus::PartialSucceeded {
                outputs,
                exceptions_count,
            },
            "partial-succeeded",
        ) => {
            if let Some(expected) = expect.exceptions_count {
                assert_eq!(*exceptions_count, expected, "[{}] exceptions_count", case);
            }
            Some(outputs.clone())
        }
        (ExecutionStatus::Failed(error), "failed") => {
            if let Some(needle) = &expect.error_contains {
                assert!(error.contains(needle), "[{}] error '{}' lacks '{}'", case, error, needle);
            }
            None
        }
        (ExecutionStatus::Paused { .. }, "paused") => None,
        (ExecutionStatus::Stopped, "stopped") => None,
        (other, expected) => panic!("[{}] expected {}, got {:?}", case, expected, other),
    };

    if let (Some(expected), Some(actual)) = (&expect.outputs, outputs) {
        for (key, value) in expected {
            assert_eq!(actual.get(key), Some(value), "[{}] output '{}'", case, key);
        }
    }
    assert_subsequence(&case, &expect.events, &names);
    for name in &expect.absent_events {
        assert!(!names.contains(name), "[{}] unexpected event '{}'", case, name);
    }
}
