use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::core::variable_pool::VariablePool;
use crate::dsl::schema::{AnswerNodeData, EndNodeData, IfElseNodeData, NodeRunResult, StartNodeData};
use crate::error::NodeError;
use crate::evaluator::evaluate_cases;
use crate::nodes::executor::{NodeExecutionContext, NodeExecutor, NodeRunOutcome};
use crate::nodes::utils::parse_config;
use crate::template::resolve_variables;

// ================================
// Start Node
// ================================

/// Validates the run's user inputs against the declared variables and
/// publishes them under the start node's namespace.
pub struct StartNodeExecutor;

#[async_trait]
impl NodeExecutor for StartNodeExecutor {
    async fn execute(
        &self,
        _node_id: &str,
        config: &Value,
        variable_pool: &VariablePool,
        _context: &NodeExecutionContext,
    ) -> Result<NodeRunOutcome, NodeError> {
        let data: StartNodeData = parse_config(config)?;
        let user_inputs = variable_pool.user_inputs();

        let mut outputs = HashMap::new();
        for var in &data.variables {
            let value = match user_inputs.get(&var.variable) {
                Some(v) if !v.is_null() => v.clone(),
                _ => match &var.default {
                    Some(default) => default.clone(),
                    None if var.required => {
                        return Err(NodeError::InputValidationError(format!(
                            "missing required input '{}'",
                            var.variable
                        )))
                    }
                    None => Value::Null,
                },
            };
            outputs.insert(var.variable.clone(), value);
        }

        Ok(NodeRunResult {
            inputs: user_inputs.clone(),
            outputs,
            ..Default::default()
        }
        .into())
    }
}

// ================================
// End Node
// ================================

pub struct EndNodeExecutor;

#[async_trait]
impl NodeExecutor for EndNodeExecutor {
    async fn execute(
        &self,
        _node_id: &str,
        config: &Value,
        variable_pool: &VariablePool,
        _context: &NodeExecutionContext,
    ) -> Result<NodeRunOutcome, NodeError> {
        let data: EndNodeData = parse_config(config)?;
        let outputs: HashMap<String, Value> = data
            .outputs
            .iter()
            .map(|ov| (ov.variable.clone(), variable_pool.get(&ov.value_selector).to_value()))
            .collect();

        Ok(NodeRunResult {
            inputs: outputs.clone(),
            outputs,
            ..Default::default()
        }
        .into())
    }
}

// ================================
// Answer Node
// ================================

pub struct AnswerNodeExecutor;

#[async_trait]
impl NodeExecutor for AnswerNodeExecutor {
    async fn execute(
        &self,
        node_id: &str,
        config: &Value,
        variable_pool: &VariablePool,
        context: &NodeExecutionContext,
    ) -> Result<NodeRunOutcome, NodeError> {
        let data: AnswerNodeData = parse_config(config)?;
        let rendered = resolve_variables(&data.answer, variable_pool)?;

        context
            .events
            .stream_chunk(
                vec![node_id.to_string(), "answer".to_string()],
                rendered.clone(),
                true,
            )
            .await?;

        Ok(NodeRunResult::succeeded(HashMap::from([(
            "answer".to_string(),
            Value::String(rendered),
        )]))
        .into())
    }
}

// ================================
// IfElse Node (multi-case)
// ================================

/// Leaves through the handle of the first matching case, or `"false"`.
pub struct IfElseNodeExecutor;

#[async_trait]
impl NodeExecutor for IfElseNodeExecutor {
    async fn execute(
        &self,
        _node_id: &str,
        config: &Value,
        variable_pool: &VariablePool,
        _context: &NodeExecutionContext,
    ) -> Result<NodeRunOutcome, NodeError> {
        let data: IfElseNodeData = parse_config(config)?;
        let selected = evaluate_cases(&data.cases, variable_pool);

        let mut outputs = HashMap::new();
        outputs.insert("selected_case".to_string(), Value::String(selected.clone()));

        Ok(NodeRunResult::succeeded(outputs)
            .with_edge_source_handle(selected)
            .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::variable_pool::{Segment, Selector};
    use crate::dsl::schema::NodeType;
    use crate::nodes::test_support::context;
    use serde_json::json;

    fn completed(outcome: NodeRunOutcome) -> NodeRunResult {
        match outcome {
            NodeRunOutcome::Completed(result) => result,
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_node_reads_inputs_and_defaults() {
        let mut pool = VariablePool::new();
        pool.set_user_inputs(HashMap::from([("query".to_string(), json!("hello"))]));
        let config = json!({
            "variables": [
                {"variable": "query", "required": true},
                {"variable": "lang", "default": "en"},
                {"variable": "extra"}
            ]
        });

        let ctx = context("start", NodeType::Start);
        let result = completed(
            StartNodeExecutor
                .execute("start", &config, &pool, &ctx)
                .await
                .unwrap(),
        );
        assert_eq!(result.outputs["query"], json!("hello"));
        assert_eq!(result.outputs["lang"], json!("en"));
        assert_eq!(result.outputs["extra"], Value::Null);
    }

    #[tokio::test]
    async fn test_start_node_missing_required() {
        let pool = VariablePool::new();
        let config = json!({"variables": [{"variable": "query", "required": true}]});
        let ctx = context("start", NodeType::Start);
        let err = StartNodeExecutor
            .execute("start", &config, &pool, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::InputValidationError(_)));
    }

    #[tokio::test]
    async fn test_end_node_collects_selectors() {
        let mut pool = VariablePool::new();
        pool.add_node_outputs("llm", &HashMap::from([("text".to_string(), json!("hi"))]))
            .unwrap();
        let config = json!({
            "outputs": [{"variable": "result", "value_selector": ["llm", "text"]}]
        });
        let ctx = context("end", NodeType::End);
        let result = completed(EndNodeExecutor.execute("end", &config, &pool, &ctx).await.unwrap());
        assert_eq!(result.outputs["result"], json!("hi"));
    }

    #[tokio::test]
    async fn test_answer_renders_template() {
        let mut pool = VariablePool::new();
        pool.seed(&Selector::new("sys", "query"), Segment::String("rust".into()));
        let config = json!({"answer": "You asked about {{#sys.query#}}."});
        let ctx = context("answer", NodeType::Answer);
        let result = completed(
            AnswerNodeExecutor
                .execute("answer", &config, &pool, &ctx)
                .await
                .unwrap(),
        );
        assert_eq!(result.outputs["answer"], json!("You asked about rust."));
    }

    #[tokio::test]
    async fn test_if_else_handles() {
        let mut pool = VariablePool::new();
        pool.add_node_outputs("start", &HashMap::from([("n".to_string(), json!(7))]))
            .unwrap();
        let config = json!({
            "cases": [
                {"case_id": "small", "conditions": [
                    {"variable_selector": ["start", "n"], "comparison_operator": "<", "value": 5}
                ]},
                {"case_id": "big", "conditions": [
                    {"variable_selector": ["start", "n"], "comparison_operator": ">=", "value": 5}
                ]}
            ]
        });
        let ctx = context("if1", NodeType::IfElse);
        let result = completed(
            IfElseNodeExecutor
                .execute("if1", &config, &pool, &ctx)
                .await
                .unwrap(),
        );
        assert_eq!(result.edge_source_handle, "big");

        let empty = json!({"cases": []});
        let result = completed(
            IfElseNodeExecutor
                .execute("if1", &empty, &pool, &ctx)
                .await
                .unwrap(),
        );
        assert_eq!(result.edge_source_handle, "false");
    }
}
