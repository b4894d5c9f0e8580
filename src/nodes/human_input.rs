use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::core::pause::PauseReason;
use crate::core::variable_pool::VariablePool;
use crate::dsl::schema::{FormInput, HumanInputNodeData};
use crate::error::NodeError;
use crate::nodes::executor::{NodeExecutionContext, NodeExecutor, NodeRunOutcome};
use crate::nodes::utils::parse_config;
use crate::template::resolve_variables;

/// Suspends the run until a person submits the node's form.
///
/// The submitted values become this node's outputs when the run is resumed.
pub struct HumanInputExecutor;

#[async_trait]
impl NodeExecutor for HumanInputExecutor {
    async fn execute(
        &self,
        node_id: &str,
        config: &Value,
        variable_pool: &VariablePool,
        context: &NodeExecutionContext,
    ) -> Result<NodeRunOutcome, NodeError> {
        let data: HumanInputNodeData = parse_config(config)?;
        let form_content = resolve_variables(&data.form_content, variable_pool)?;

        Ok(NodeRunOutcome::Paused(PauseReason::HumanInputRequired {
            form_id: data.form_id.unwrap_or_else(|| node_id.to_string()),
            form_content,
            inputs: data.inputs,
            actions: data.user_actions,
            node_id: node_id.to_string(),
            node_title: context.node_title.clone(),
        }))
    }
}

/// Check a submission against the form: every required field must be present,
/// missing optional fields take their default. Unknown keys are kept.
pub fn validate_submission(
    inputs: &[FormInput],
    submitted: &HashMap<String, Value>,
) -> Result<HashMap<String, Value>, String> {
    let mut values = submitted.clone();
    for input in inputs {
        let present = submitted
            .get(&input.output_variable_name)
            .is_some_and(|v| !v.is_null());
        if present {
            continue;
        }
        match &input.default {
            Some(default) => {
                values.insert(input.output_variable_name.clone(), default.clone());
            }
            None if input.required => {
                return Err(format!(
                    "missing required input '{}'",
                    input.output_variable_name
                ))
            }
            None => {}
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::variable_pool::{Segment, Selector};
    use crate::dsl::schema::NodeType;
    use crate::nodes::test_support::context;
    use serde_json::json;

    #[tokio::test]
    async fn test_human_input_pauses_with_rendered_form() {
        let mut pool = VariablePool::new();
        pool.seed(&Selector::new("sys", "user_id"), Segment::String("alice".into()));
        let config = json!({
            "form_content": "Approve request from {{#sys.user_id#}}?",
            "inputs": [{"output_variable_name": "comment", "type": "paragraph", "required": true}],
            "user_actions": [{"id": "approve", "title": "Approve"}, {"id": "reject"}]
        });
        let ctx = context("review", NodeType::HumanInput);

        let outcome = HumanInputExecutor
            .execute("review", &config, &pool, &ctx)
            .await
            .unwrap();
        let NodeRunOutcome::Paused(PauseReason::HumanInputRequired {
            form_id,
            form_content,
            inputs,
            actions,
            node_id,
            ..
        }) = outcome
        else {
            panic!("expected a human input pause");
        };
        assert_eq!(form_id, "review");
        assert_eq!(form_content, "Approve request from alice?");
        assert_eq!(inputs.len(), 1);
        assert_eq!(actions[1].id, "reject");
        assert_eq!(node_id, "review");
    }

    #[test]
    fn test_validate_submission() {
        let inputs = vec![
            FormInput {
                output_variable_name: "comment".into(),
                input_type: "paragraph".into(),
                label: String::new(),
                required: true,
                default: None,
            },
            FormInput {
                output_variable_name: "score".into(),
                input_type: "number".into(),
                label: String::new(),
                required: false,
                default: Some(json!(3)),
            },
        ];

        let err = validate_submission(&inputs, &HashMap::new()).unwrap_err();
        assert!(err.contains("comment"));

        let values =
            validate_submission(&inputs, &HashMap::from([("comment".to_string(), json!("ok"))]))
                .unwrap();
        assert_eq!(values["comment"], json!("ok"));
        assert_eq!(values["score"], json!(3));
    }
}
