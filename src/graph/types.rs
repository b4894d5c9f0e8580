use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::core::variable_pool::VariablePool;
use crate::dsl::schema::{
    DefaultValue, ErrorStrategy, NodeRunResult, NodeSchema, NodeType, RetryConfig, RunCondition,
    DEFAULT_SOURCE_HANDLE, FAIL_BRANCH_SOURCE_HANDLE,
};
use crate::error::WorkflowError;
use crate::evaluator::evaluate_run_condition;

/// Graph node built from the DSL. Immutable during a run.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: String,
    pub node_type: NodeType,
    pub title: String,
    /// Node-specific configuration (the DSL `data` fields not modelled here).
    pub config: Value,
    pub error_strategy: Option<ErrorStrategy>,
    pub default_value: Vec<DefaultValue>,
    pub retry_config: Option<RetryConfig>,
    pub timeout_secs: Option<u64>,
}

impl GraphNode {
    pub fn from_schema(schema: &NodeSchema) -> Self {
        let data = &schema.data;
        GraphNode {
            id: schema.id.clone(),
            node_type: data.node_type,
            title: if data.title.is_empty() {
                schema.id.clone()
            } else {
                data.title.clone()
            },
            config: data.config(),
            error_strategy: data.error_strategy,
            default_value: data.default_value.clone(),
            retry_config: data.retry_config.clone(),
            timeout_secs: data.timeout_secs,
        }
    }

    /// Error strategy that actually applies: only node types that support
    /// continue-on-error honour the configured one.
    pub fn effective_error_strategy(&self) -> Option<ErrorStrategy> {
        if self.node_type.supports_continue_on_error() {
            self.error_strategy
        } else {
            None
        }
    }

    pub fn default_outputs(&self) -> HashMap<String, Value> {
        self.default_value
            .iter()
            .map(|d| (d.key.clone(), d.value.clone()))
            .collect()
    }
}

/// Directed edge between two graph nodes.
#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub source_handle: Option<String>,
    pub run_condition: Option<RunCondition>,
}

impl GraphEdge {
    /// Handle this edge listens on, for display and generated ids.
    pub fn handle(&self) -> &str {
        self.source_handle.as_deref().unwrap_or(DEFAULT_SOURCE_HANDLE)
    }

    /// Whether the edge may be traversed after its source reported `result`.
    pub fn is_traversable(&self, result: &NodeRunResult, pool: &VariablePool) -> bool {
        match &self.run_condition {
            Some(condition @ RunCondition::BranchIdentify { .. }) => {
                evaluate_run_condition(condition, &result.edge_source_handle, pool)
            }
            Some(condition @ RunCondition::Conditions { .. }) => {
                self.follows(result) && evaluate_run_condition(condition, &result.edge_source_handle, pool)
            }
            None => self.follows(result),
        }
    }

    /// An edge with a handle matches it exactly. An edge without one follows
    /// any outcome except a failure routed to the fail branch.
    fn follows(&self, result: &NodeRunResult) -> bool {
        match &self.source_handle {
            Some(handle) => *handle == result.edge_source_handle,
            None => result.edge_source_handle != FAIL_BRANCH_SOURCE_HANDLE,
        }
    }
}

/// Resolution state of an edge within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EdgeState {
    #[default]
    Unknown,
    Taken,
    Skipped,
}

/// Node-level state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Paused,
}

impl NodeState {
    pub fn can_transition_to(self, to: NodeState) -> bool {
        matches!(
            (self, to),
            (NodeState::Pending, NodeState::Running)
                | (NodeState::Paused, NodeState::Running)
                | (NodeState::Running, NodeState::Success)
                | (NodeState::Running, NodeState::Failed)
                | (NodeState::Running, NodeState::Paused)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Running => "running",
            NodeState::Success => "success",
            NodeState::Failed => "failed",
            NodeState::Paused => "paused",
        }
    }
}

/// Per-run instantiation of a [`GraphNode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeNode {
    pub id: String,
    pub node_id: String,
    pub state: NodeState,
    #[serde(default)]
    pub result: Option<NodeRunResult>,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub paused_at: Option<i64>,
    #[serde(default)]
    pub finished_at: Option<i64>,
    #[serde(default)]
    pub failed_reason: Option<String>,
    #[serde(default)]
    pub predecessor_runtime_node_id: Option<String>,
}

impl RuntimeNode {
    pub fn new(
        id: impl Into<String>,
        node_id: impl Into<String>,
        predecessor_runtime_node_id: Option<String>,
    ) -> Self {
        RuntimeNode {
            id: id.into(),
            node_id: node_id.into(),
            state: NodeState::Pending,
            result: None,
            started_at: None,
            paused_at: None,
            finished_at: None,
            failed_reason: None,
            predecessor_runtime_node_id,
        }
    }

    /// Move to `to`, stamping the matching timestamp. Illegal moves are rejected.
    pub fn transition(&mut self, to: NodeState, now: i64) -> Result<(), WorkflowError> {
        if !self.state.can_transition_to(to) {
            return Err(WorkflowError::InvalidStateTransition {
                entity: format!("node {}", self.node_id),
                from: self.state.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        match to {
            NodeState::Running => {
                self.started_at = Some(now);
                self.paused_at = None;
            }
            NodeState::Paused => self.paused_at = Some(now),
            NodeState::Success | NodeState::Failed => self.finished_at = Some(now),
            NodeState::Pending => {}
        }
        self.state = to;
        Ok(())
    }

    pub fn succeed(&mut self, result: NodeRunResult, now: i64) -> Result<(), WorkflowError> {
        self.transition(NodeState::Success, now)?;
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: i64) -> Result<(), WorkflowError> {
        self.transition(NodeState::Failed, now)?;
        self.failed_reason = Some(reason.into());
        Ok(())
    }
}

/// Immutable workflow graph shared by every branch of a run.
#[derive(Debug, Clone)]
pub struct Graph {
    pub(crate) nodes: HashMap<String, GraphNode>,
    pub(crate) edges: Vec<GraphEdge>,
    pub(crate) in_edges: HashMap<String, Vec<usize>>,
    pub(crate) out_edges: HashMap<String, Vec<usize>>,
    pub(crate) root_node_id: String,
}

impl Graph {
    pub fn root_node_id(&self) -> &str {
        &self.root_node_id
    }

    pub fn node(&self, node_id: &str) -> Result<&GraphNode, WorkflowError> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| WorkflowError::NodeNotFound(node_id.to_string()))
    }

    pub fn contains_node(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn incoming(&self, node_id: &str) -> impl Iterator<Item = &GraphEdge> {
        self.in_edges
            .get(node_id)
            .into_iter()
            .flatten()
            .map(|&i| &self.edges[i])
    }

    pub fn outgoing(&self, node_id: &str) -> impl Iterator<Item = &GraphEdge> {
        self.out_edges
            .get(node_id)
            .into_iter()
            .flatten()
            .map(|&i| &self.edges[i])
    }

    /// Node ids of the given type.
    pub fn nodes_of_type(&self, node_type: NodeType) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .nodes
            .values()
            .filter(|n| n.node_type == node_type)
            .map(|n| n.id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::schema::WorkflowNodeExecutionStatus;

    fn edge(handle: Option<&str>, condition: Option<RunCondition>) -> GraphEdge {
        GraphEdge {
            id: "e".into(),
            source: "a".into(),
            target: "b".into(),
            source_handle: handle.map(str::to_string),
            run_condition: condition,
        }
    }

    fn result(handle: &str) -> NodeRunResult {
        NodeRunResult {
            status: WorkflowNodeExecutionStatus::Succeeded,
            ..Default::default()
        }
        .with_edge_source_handle(handle)
    }

    #[test]
    fn test_handle_matching() {
        let pool = VariablePool::new();
        assert!(edge(None, None).is_traversable(&result("source"), &pool));
        assert!(!edge(None, None).is_traversable(&result("fail-branch"), &pool));
        assert!(edge(None, None).is_traversable(&result("false"), &pool));
        assert!(edge(None, None).is_traversable(&result("approve"), &pool));
        assert!(edge(Some("source"), None).is_traversable(&result("source"), &pool));
        assert!(!edge(Some("source"), None).is_traversable(&result("false"), &pool));
        assert!(edge(Some("case1"), None).is_traversable(&result("case1"), &pool));
        assert!(!edge(Some("case1"), None).is_traversable(&result("false"), &pool));
    }

    #[test]
    fn test_branch_identify_condition() {
        let pool = VariablePool::new();
        let cond = RunCondition::BranchIdentify {
            branch_identify: "approve".into(),
        };
        let e = edge(None, Some(cond));
        assert!(e.is_traversable(&result("approve"), &pool));
        assert!(!e.is_traversable(&result("reject"), &pool));
    }

    #[test]
    fn test_runtime_node_transitions() {
        let mut node = RuntimeNode::new("r1", "n1", None);
        assert!(node.transition(NodeState::Success, 1).is_err());
        node.transition(NodeState::Running, 1).unwrap();
        node.transition(NodeState::Paused, 2).unwrap();
        assert_eq!(node.paused_at, Some(2));
        node.transition(NodeState::Running, 3).unwrap();
        assert_eq!(node.paused_at, None);
        node.succeed(result("source"), 4).unwrap();
        assert_eq!(node.finished_at, Some(4));
        assert!(node.transition(NodeState::Running, 5).is_err());
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut node = RuntimeNode::new("r1", "n1", None);
        node.transition(NodeState::Running, 1).unwrap();
        node.fail("boom", 2).unwrap();
        assert_eq!(node.failed_reason.as_deref(), Some("boom"));
        assert!(node.transition(NodeState::Paused, 3).is_err());
    }
}
