use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ================================
// Variable Selector (Dify-compatible)
// ================================

/// Variable selector: e.g. ["node_id", "output_name"] or ["sys", "query"]
pub type VariableSelector = Vec<String>;

/// Handle reported by nodes that do not branch.
pub const DEFAULT_SOURCE_HANDLE: &str = "source";
/// Handle routed to when a node fails under the fail-branch strategy.
pub const FAIL_BRANCH_SOURCE_HANDLE: &str = "fail-branch";

// ================================
// Workflow DSL Schema
// ================================

/// Current supported DSL version
pub const CURRENT_DSL_VERSION: &str = "0.1.0";

/// All supported DSL versions
pub const SUPPORTED_DSL_VERSIONS: &[&str] = &["0.1.0"];

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct WorkflowSchema {
    /// DSL version string, e.g. "0.1.0"
    #[serde(default = "default_version")]
    pub version: String,
    pub nodes: Vec<NodeSchema>,
    #[serde(default)]
    pub edges: Vec<EdgeSchema>,
    #[serde(default)]
    pub environment_variables: Vec<EnvironmentVariable>,
    #[serde(default)]
    pub conversation_variables: Vec<ConversationVariable>,
}

fn default_version() -> String {
    CURRENT_DSL_VERSION.to_string()
}

/// Node definition in the DSL.
/// The `data` object embeds the type tag and all node-specific config.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NodeSchema {
    pub id: String,
    pub data: NodeData,
}

/// Common node data.  The `type` field determines the concrete config.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NodeData {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub error_strategy: Option<ErrorStrategy>,
    #[serde(default)]
    pub default_value: Vec<DefaultValue>,
    #[serde(default)]
    pub retry_config: Option<RetryConfig>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// All remaining fields are captured here as a JSON map.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl NodeData {
    /// Node-specific config as a JSON object (the `extra` fields).
    pub fn config(&self) -> Value {
        Value::Object(
            self.extra
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EdgeSchema {
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, alias = "sourceHandle")]
    pub source_handle: Option<String>,
    #[serde(default)]
    pub run_condition: Option<RunCondition>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: Value,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ConversationVariable {
    pub name: String,
    #[serde(rename = "type", default = "default_var_type")]
    pub var_type: String,
    #[serde(default)]
    pub value: Value,
}

/// Nodes and edges of a loop or iteration body.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct SubGraphSchema {
    pub nodes: Vec<NodeSchema>,
    #[serde(default)]
    pub edges: Vec<EdgeSchema>,
}

// ================================
// Run conditions
// ================================

/// Rule deciding whether an edge is traversable.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunCondition {
    /// Exact match against the predecessor's `edge_source_handle`.
    BranchIdentify { branch_identify: String },
    /// Comparisons against the variable pool.
    #[serde(rename = "condition")]
    Conditions {
        conditions: Vec<Condition>,
        #[serde(default)]
        logical_operator: LogicalOperator,
    },
}

// ================================
// Error Strategy
// ================================

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorStrategy {
    FailBranch,
    DefaultValue,
}

/// One substitute output used by the default-value strategy.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DefaultValue {
    pub key: String,
    #[serde(rename = "type", default = "default_var_type")]
    pub value_type: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_retry_enabled")]
    pub retry_enabled: bool,
    #[serde(default)]
    pub max_retries: i32,
    /// Milliseconds between attempts.
    #[serde(default)]
    pub retry_interval: i32,
    #[serde(default = "default_backoff_strategy")]
    pub backoff_strategy: BackoffStrategy,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_retry_interval")]
    pub max_retry_interval: i32,
    #[serde(default = "default_retry_on_retryable_only")]
    pub retry_on_retryable_only: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
    ExponentialWithJitter,
}

fn default_retry_enabled() -> bool { true }
fn default_backoff_strategy() -> BackoffStrategy { BackoffStrategy::Fixed }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_max_retry_interval() -> i32 { 60000 }
fn default_retry_on_retryable_only() -> bool { true }

// ================================
// Node Type Enum (Dify-compatible)
// ================================

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    Start,
    End,
    Answer,
    Llm,
    IfElse,
    Code,
    Tool,
    HttpRequest,
    #[serde(rename = "assigner")]
    VariableAssigner,
    HumanInput,
    Loop,
    Iteration,
}

impl NodeType {
    pub const ALL: [NodeType; 12] = [
        NodeType::Start,
        NodeType::End,
        NodeType::Answer,
        NodeType::Llm,
        NodeType::IfElse,
        NodeType::Code,
        NodeType::Tool,
        NodeType::HttpRequest,
        NodeType::VariableAssigner,
        NodeType::HumanInput,
        NodeType::Loop,
        NodeType::Iteration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Start => "start",
            NodeType::End => "end",
            NodeType::Answer => "answer",
            NodeType::Llm => "llm",
            NodeType::IfElse => "if-else",
            NodeType::Code => "code",
            NodeType::Tool => "tool",
            NodeType::HttpRequest => "http-request",
            NodeType::VariableAssigner => "assigner",
            NodeType::HumanInput => "human-input",
            NodeType::Loop => "loop",
            NodeType::Iteration => "iteration",
        }
    }

    /// Node types whose failures may be absorbed by an error strategy.
    pub fn supports_continue_on_error(&self) -> bool {
        matches!(
            self,
            NodeType::Llm | NodeType::Code | NodeType::Tool | NodeType::HttpRequest
        )
    }

    pub fn execution_type(&self) -> NodeExecutionType {
        match self {
            NodeType::Start => NodeExecutionType::Root,
            NodeType::End | NodeType::Answer => NodeExecutionType::Response,
            NodeType::IfElse => NodeExecutionType::Branch,
            NodeType::Iteration | NodeType::Loop => NodeExecutionType::Container,
            NodeType::Llm
            | NodeType::Code
            | NodeType::Tool
            | NodeType::HttpRequest
            | NodeType::VariableAssigner
            | NodeType::HumanInput => NodeExecutionType::Executable,
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeExecutionType {
    Executable,
    Response,
    Branch,
    Container,
    Root,
}

// ================================
// Start / End / Answer
// ================================

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct StartNodeData {
    #[serde(default)]
    pub variables: Vec<StartVariable>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StartVariable {
    pub variable: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type", default = "default_var_type")]
    pub var_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

fn default_var_type() -> String {
    "string".to_string()
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct EndNodeData {
    #[serde(default)]
    pub outputs: Vec<OutputVariable>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OutputVariable {
    pub variable: String,
    pub value_selector: VariableSelector,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AnswerNodeData {
    pub answer: String,
}

// ================================
// IfElse Node Config (Dify-compatible: multi-case branches)
// ================================

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct IfElseNodeData {
    pub cases: Vec<Case>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Case {
    pub case_id: String,
    #[serde(default)]
    pub logical_operator: LogicalOperator,
    pub conditions: Vec<Condition>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Condition {
    pub variable_selector: VariableSelector,
    pub comparison_operator: ComparisonOperator,
    #[serde(default)]
    pub value: Value,
}

/// Comparison operators used by condition evaluation.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    Contains,
    #[serde(alias = "not contains")]
    NotContains,
    #[serde(alias = "start with")]
    StartWith,
    #[serde(alias = "end with")]
    EndWith,
    Is,
    #[serde(alias = "is not")]
    IsNot,
    Empty,
    #[serde(alias = "not empty")]
    NotEmpty,
    In,
    #[serde(alias = "not in")]
    NotIn,
    #[serde(alias = "all of")]
    AllOf,
    #[serde(alias = "=")]
    Equal,
    #[serde(alias = "≠")]
    NotEqual,
    #[serde(alias = ">")]
    GreaterThan,
    #[serde(alias = "<")]
    LessThan,
    #[serde(alias = "≥", alias = ">=", alias = "greater_than_or_equal")]
    GreaterOrEqual,
    #[serde(alias = "≤", alias = "<=", alias = "less_than_or_equal")]
    LessOrEqual,
    Null,
    #[serde(alias = "not null")]
    NotNull,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

// ================================
// Model / tool backed nodes
// ================================

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct VariableMapping {
    pub variable: String,
    pub value_selector: VariableSelector,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LlmNodeData {
    pub model: ModelConfig,
    #[serde(default)]
    pub prompt_template: Vec<PromptMessage>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ModelConfig {
    pub provider: String,
    pub name: String,
    #[serde(default)]
    pub completion_params: HashMap<String, Value>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub role: String,
    pub text: String,
}

/// Shared shape of code / tool / http-request nodes: resolved inputs plus
/// whatever the runtime needs from the rest of the config.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct RuntimeNodeData {
    #[serde(default)]
    pub variables: Vec<VariableMapping>,
}

// ================================
// Human input
// ================================

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct HumanInputNodeData {
    #[serde(default)]
    pub form_id: Option<String>,
    #[serde(default)]
    pub form_content: String,
    #[serde(default)]
    pub inputs: Vec<FormInput>,
    #[serde(default)]
    pub user_actions: Vec<UserAction>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct FormInput {
    pub output_variable_name: String,
    #[serde(rename = "type", default = "default_var_type")]
    pub input_type: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct UserAction {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

// ================================
// Variable assigner
// ================================

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AssignerNodeData {
    pub items: Vec<AssignerItem>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AssignerItem {
    pub variable_selector: VariableSelector,
    pub operation: AssignerOperation,
    #[serde(default)]
    pub input_type: AssignerInputType,
    #[serde(default)]
    pub value: Value,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignerOperation {
    #[serde(rename = "over-write")]
    OverWrite,
    #[serde(rename = "clear")]
    Clear,
    #[serde(rename = "set")]
    Set,
    #[serde(rename = "append")]
    Append,
    #[serde(rename = "extend")]
    Extend,
    #[serde(rename = "+=")]
    Add,
    #[serde(rename = "-=")]
    Subtract,
    #[serde(rename = "*=")]
    Multiply,
    #[serde(rename = "/=")]
    Divide,
    #[serde(rename = "remove-first")]
    RemoveFirst,
    #[serde(rename = "remove-last")]
    RemoveLast,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssignerInputType {
    #[default]
    Constant,
    Variable,
}

// ================================
// Loop / Iteration
// ================================

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LoopNodeData {
    #[serde(default)]
    pub loop_count: Option<usize>,
    #[serde(default)]
    pub break_conditions: Vec<Condition>,
    #[serde(default)]
    pub logical_operator: LogicalOperator,
    #[serde(default)]
    pub loop_variables: Vec<LoopVariable>,
    pub sub_graph: SubGraphSchema,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LoopVariable {
    pub label: String,
    #[serde(default = "default_var_type")]
    pub var_type: String,
    #[serde(default)]
    pub value_type: AssignerInputType,
    #[serde(default)]
    pub value: Value,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct IterationNodeData {
    pub iterator_selector: VariableSelector,
    pub output_selector: VariableSelector,
    pub sub_graph: SubGraphSchema,
    #[serde(default)]
    pub error_handle_mode: IterationErrorMode,
    #[serde(default)]
    pub is_parallel: bool,
    #[serde(default = "default_parallel_nums")]
    pub parallel_nums: usize,
}

fn default_parallel_nums() -> usize {
    10
}

/// Error handling mode for iteration failures.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IterationErrorMode {
    #[default]
    Terminated,
    ContinueOnError,
    RemoveAbnormalOutput,
}

// ================================
// Node Run Result (Dify-compatible)
// ================================

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowNodeExecutionStatus {
    Succeeded,
    Failed,
    /// Failed, but the error strategy let the run continue.
    Exception,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct NodeErrorInfo {
    pub message: String,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub detail: Option<Value>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct NodeRunResult {
    pub status: WorkflowNodeExecutionStatus,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub process_data: HashMap<String, Value>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub llm_usage: Option<LlmUsage>,
    pub edge_source_handle: String,
    #[serde(default)]
    pub error: Option<NodeErrorInfo>,
    #[serde(default)]
    pub retry_index: i32,
    /// Writes into the conversation namespace requested by this node.
    #[serde(default)]
    pub conversation_updates: HashMap<String, Value>,
    /// Steps taken inside loop or iteration bodies run by this node.
    #[serde(default)]
    pub body_steps: i32,
    /// Exception results inside those bodies.
    #[serde(default)]
    pub body_exceptions: usize,
}

impl Default for NodeRunResult {
    fn default() -> Self {
        NodeRunResult {
            status: WorkflowNodeExecutionStatus::Succeeded,
            inputs: HashMap::new(),
            process_data: HashMap::new(),
            outputs: HashMap::new(),
            metadata: HashMap::new(),
            llm_usage: None,
            edge_source_handle: DEFAULT_SOURCE_HANDLE.to_string(),
            error: None,
            retry_index: 0,
            conversation_updates: HashMap::new(),
            body_steps: 0,
            body_exceptions: 0,
        }
    }
}

impl NodeRunResult {
    pub fn succeeded(outputs: HashMap<String, Value>) -> Self {
        NodeRunResult {
            outputs,
            ..Default::default()
        }
    }

    pub fn with_edge_source_handle(mut self, handle: impl Into<String>) -> Self {
        self.edge_source_handle = handle.into();
        self
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct LlmUsage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default)]
    pub total_price: f64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub latency: f64,
}

impl LlmUsage {
    /// Monotonic merge of another node's usage into this total.
    pub fn merge(&mut self, other: &LlmUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.total_price += other.total_price;
        self.latency += other.latency;
        if self.currency.is_empty() {
            self.currency = other.currency.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_type_round_trip() {
        for node_type in NodeType::ALL {
            let value = serde_json::to_value(node_type).unwrap();
            assert_eq!(value, json!(node_type.as_str()));
        }
    }

    #[test]
    fn test_continue_on_error_support() {
        let supported: Vec<NodeType> = NodeType::ALL
            .into_iter()
            .filter(|t| t.supports_continue_on_error())
            .collect();
        assert_eq!(
            supported,
            vec![NodeType::Llm, NodeType::Code, NodeType::Tool, NodeType::HttpRequest]
        );
    }

    #[test]
    fn test_run_condition_tags() {
        let branch: RunCondition =
            serde_json::from_value(json!({"type": "branch_identify", "branch_identify": "true"}))
                .unwrap();
        assert_eq!(
            branch,
            RunCondition::BranchIdentify {
                branch_identify: "true".into()
            }
        );

        let cond: RunCondition = serde_json::from_value(json!({
            "type": "condition",
            "conditions": [{
                "variable_selector": ["a", "x"],
                "comparison_operator": "≥",
                "value": 3
            }]
        }))
        .unwrap();
        match cond {
            RunCondition::Conditions {
                conditions,
                logical_operator,
            } => {
                assert_eq!(logical_operator, LogicalOperator::And);
                assert_eq!(conditions[0].comparison_operator, ComparisonOperator::GreaterOrEqual);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_node_type_rejected() {
        let result: Result<NodeData, _> =
            serde_json::from_value(json!({"type": "knowledge-retrieval"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_usage_merge() {
        let mut total = LlmUsage::default();
        total.merge(&LlmUsage {
            prompt_tokens: 3,
            completion_tokens: 4,
            total_tokens: 7,
            currency: "USD".into(),
            ..Default::default()
        });
        total.merge(&LlmUsage {
            total_tokens: 5,
            ..Default::default()
        });
        assert_eq!(total.total_tokens, 12);
        assert_eq!(total.currency, "USD");
    }
}
