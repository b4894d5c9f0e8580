//! Pause reasons, durable pause records and resume requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::core::variable_pool::PoolSnapshot;
use crate::dsl::schema::{FormInput, LlmUsage, UserAction};
use crate::graph::{EdgeStates, RuntimeNode};

/// Why a node (or the engine) suspended the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PauseReason {
    HumanInputRequired {
        form_id: String,
        #[serde(default)]
        form_content: String,
        #[serde(default)]
        inputs: Vec<FormInput>,
        #[serde(default)]
        actions: Vec<UserAction>,
        node_id: String,
        node_title: String,
    },
    ScheduledPause {
        message: String,
        node_id: String,
        /// Unix seconds after which an external sweeper may resume the run.
        resume_at: i64,
    },
}

impl PauseReason {
    pub fn node_id(&self) -> &str {
        match self {
            PauseReason::HumanInputRequired { node_id, .. } => node_id,
            PauseReason::ScheduledPause { node_id, .. } => node_id,
        }
    }

    pub fn kind(&self) -> PauseReasonType {
        match self {
            PauseReason::HumanInputRequired { .. } => PauseReasonType::HumanInputRequired,
            PauseReason::ScheduledPause { .. } => PauseReasonType::ScheduledPause,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReasonType {
    HumanInputRequired,
    ScheduledPause,
}

/// Persisted row describing one reason of a pause.
///
/// This is also the record an external scheduler or UI uses to resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPauseReason {
    pub id: String,
    pub pause_id: String,
    pub type_: PauseReasonType,
    #[serde(default)]
    pub form_id: Option<String>,
    pub node_id: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub resume_at: Option<i64>,
}

impl WorkflowPauseReason {
    pub fn from_reason(id: impl Into<String>, pause_id: impl Into<String>, reason: &PauseReason) -> Self {
        let (form_id, message, resume_at) = match reason {
            PauseReason::HumanInputRequired { form_id, .. } => (Some(form_id.clone()), None, None),
            PauseReason::ScheduledPause {
                message, resume_at, ..
            } => (None, Some(message.clone()), Some(*resume_at)),
        };
        WorkflowPauseReason {
            id: id.into(),
            pause_id: pause_id.into(),
            type_: reason.kind(),
            form_id,
            node_id: reason.node_id().to_string(),
            message,
            resume_at,
        }
    }
}

/// A node suspended inside a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PausedNode {
    pub node_id: String,
    pub reason: PauseReason,
}

/// Accumulators merged across node completions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunAccumulators {
    #[serde(default)]
    pub llm_usage: LlmUsage,
    #[serde(default)]
    pub total_steps: i32,
    #[serde(default)]
    pub exceptions_count: usize,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
}

/// Everything needed to re-enter the graph after a pause.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub pool: PoolSnapshot,
    pub accumulators: RunAccumulators,
    pub edge_states: EdgeStates,
    pub runtime_nodes: BTreeMap<String, RuntimeNode>,
    #[serde(default)]
    pub paused_nodes: Vec<PausedNode>,
    #[serde(default)]
    pub ready_queue: Vec<String>,
    #[serde(default)]
    pub ready_predecessors: BTreeMap<String, String>,
    /// Seconds of wall time already spent before the pause.
    #[serde(default)]
    pub elapsed_secs: u64,
}

/// Durable pause checkpoint for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPause {
    pub pause_id: String,
    pub execution_id: String,
    pub workflow_id: String,
    pub tenant_id: String,
    pub checkpoint: RunCheckpoint,
    pub created_at: i64,
    #[serde(default)]
    pub resumed_at: Option<i64>,
}

impl WorkflowPause {
    pub fn is_resumed(&self) -> bool {
        self.resumed_at.is_some()
    }

    pub fn reasons(&self) -> Vec<PauseReason> {
        self.checkpoint
            .paused_nodes
            .iter()
            .map(|p| p.reason.clone())
            .collect()
    }
}

/// External request to continue a paused run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub pause_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    /// Handle to leave the resumed node by; defaults to `source`.
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub resume_reason: Option<String>,
    #[serde(default)]
    pub resumed_by_user_id: Option<String>,
}

impl ResumeRequest {
    pub fn new(pause_id: impl Into<String>) -> Self {
        ResumeRequest {
            pause_id: pause_id.into(),
            ..Default::default()
        }
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_inputs(mut self, inputs: HashMap<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_resume_reason(mut self, reason: impl Into<String>) -> Self {
        self.resume_reason = Some(reason.into());
        self
    }

    pub fn with_resumed_by(mut self, user_id: impl Into<String>) -> Self {
        self.resumed_by_user_id = Some(user_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pause_reason_tagging() {
        let reason = PauseReason::ScheduledPause {
            message: "wake later".into(),
            node_id: "wait".into(),
            resume_at: 100,
        };
        let value = serde_json::to_value(&reason).unwrap();
        assert_eq!(value["type"], json!("scheduled_pause"));
        let back: PauseReason = serde_json::from_value(value).unwrap();
        assert_eq!(back, reason);
    }

    #[test]
    fn test_reason_row() {
        let reason = PauseReason::HumanInputRequired {
            form_id: "f1".into(),
            form_content: String::new(),
            inputs: vec![],
            actions: vec![],
            node_id: "review".into(),
            node_title: "Review".into(),
        };
        let row = WorkflowPauseReason::from_reason("r1", "p1", &reason);
        assert_eq!(row.type_, PauseReasonType::HumanInputRequired);
        assert_eq!(row.form_id.as_deref(), Some("f1"));
        assert_eq!(row.node_id, "review");
        assert!(row.message.is_none());
    }
}
