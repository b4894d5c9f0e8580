//! The persisted record of one workflow run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::WorkflowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowExecutionStatus {
    Scheduled,
    Running,
    Paused,
    Succeeded,
    Failed,
    PartialSucceeded,
    Stopped,
}

impl WorkflowExecutionStatus {
    pub fn is_ended(self) -> bool {
        matches!(
            self,
            WorkflowExecutionStatus::Succeeded
                | WorkflowExecutionStatus::Failed
                | WorkflowExecutionStatus::PartialSucceeded
                | WorkflowExecutionStatus::Stopped
        )
    }

    pub fn can_transition_to(self, to: WorkflowExecutionStatus) -> bool {
        use WorkflowExecutionStatus::*;
        match self {
            Scheduled => matches!(to, Running | Failed | Stopped),
            Running => matches!(to, Paused | Succeeded | Failed | PartialSucceeded | Stopped),
            Paused => matches!(to, Running | Failed | Stopped),
            Succeeded | Failed | PartialSucceeded | Stopped => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowExecutionStatus::Scheduled => "scheduled",
            WorkflowExecutionStatus::Running => "running",
            WorkflowExecutionStatus::Paused => "paused",
            WorkflowExecutionStatus::Succeeded => "succeeded",
            WorkflowExecutionStatus::Failed => "failed",
            WorkflowExecutionStatus::PartialSucceeded => "partial-succeeded",
            WorkflowExecutionStatus::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub tenant_id: String,
    pub status: WorkflowExecutionStatus,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Seconds spent running, excluding time spent paused.
    #[serde(default)]
    pub elapsed_time: u64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default)]
    pub total_steps: i32,
    #[serde(default)]
    pub exceptions_count: usize,
    pub created_at: i64,
    #[serde(default)]
    pub finished_at: Option<i64>,
}

impl WorkflowExecution {
    pub fn new(
        id: impl Into<String>,
        workflow_id: impl Into<String>,
        tenant_id: impl Into<String>,
        inputs: HashMap<String, Value>,
        created_at: i64,
    ) -> Self {
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            tenant_id: tenant_id.into(),
            status: WorkflowExecutionStatus::Scheduled,
            inputs,
            outputs: HashMap::new(),
            error: None,
            elapsed_time: 0,
            total_tokens: 0,
            total_steps: 0,
            exceptions_count: 0,
            created_at,
            finished_at: None,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.status.is_ended()
    }

    /// Move to `to`, stamping `finished_at` on terminal statuses.
    pub fn transition(&mut self, to: WorkflowExecutionStatus, now: i64) -> Result<(), WorkflowError> {
        if !self.status.can_transition_to(to) {
            return Err(WorkflowError::InvalidStateTransition {
                entity: format!("workflow execution {}", self.id),
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        self.status = to;
        if to.is_ended() {
            self.finished_at = Some(now);
        }
        Ok(())
    }
}
