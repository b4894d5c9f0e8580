//! Loop Node executor.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::event_bus::GraphEngineEvent;
use crate::core::sub_graph_runner::SubGraphRunner;
use crate::core::variable_pool::{Segment, Selector, VariablePool};
use crate::dsl::schema::{AssignerInputType, LlmUsage, LoopNodeData, NodeRunResult};
use crate::error::NodeError;
use crate::evaluator::evaluate_conditions;
use crate::nodes::executor::{NodeExecutionContext, NodeExecutor, NodeRunOutcome};
use crate::nodes::utils::parse_config;

use super::{build_body, default_sub_graph_runner};

/// Repeats a body until its break condition holds.
///
/// Loop variables live under `[loop_node_id, name]`. After each pass, body end
/// outputs named like a loop variable replace its value; the break condition is
/// then evaluated against the updated values. Without break conditions the
/// loop simply runs `loop_count` times.
pub struct LoopNodeExecutor {
    runner: Arc<dyn SubGraphRunner>,
}

impl Default for LoopNodeExecutor {
    fn default() -> Self {
        Self::new(default_sub_graph_runner())
    }
}

impl LoopNodeExecutor {
    pub fn new(runner: Arc<dyn SubGraphRunner>) -> Self {
        Self { runner }
    }
}

fn seed_loop_variables(pool: &mut VariablePool, node_id: &str, vars: &[(String, Value)]) {
    for (name, value) in vars {
        pool.seed(&Selector::new(node_id, name.as_str()), Segment::from_value(value));
    }
}

#[async_trait]
impl NodeExecutor for LoopNodeExecutor {
    async fn execute(
        &self,
        node_id: &str,
        config: &Value,
        pool: &VariablePool,
        context: &NodeExecutionContext,
    ) -> Result<NodeRunOutcome, NodeError> {
        let data: LoopNodeData = parse_config(config)?;
        let body = build_body(&data.sub_graph)?;
        let guard = context.config.max_loop_iterations;
        let max_iterations = data.loop_count.unwrap_or(guard).min(guard);

        let mut loop_vars: Vec<(String, Value)> = Vec::with_capacity(data.loop_variables.len());
        for var in &data.loop_variables {
            let value = match var.value_type {
                AssignerInputType::Constant => var.value.clone(),
                AssignerInputType::Variable => {
                    let selector: Vec<String> = serde_json::from_value(var.value.clone())
                        .map_err(|_| {
                            NodeError::ConfigError(format!(
                                "loop variable '{}' has an invalid selector",
                                var.label
                            ))
                        })?;
                    pool.get(&selector).to_value()
                }
            };
            loop_vars.push((var.label.clone(), value));
        }
        let inputs: HashMap<String, Value> = loop_vars.iter().cloned().collect();

        context
            .events
            .publish(GraphEngineEvent::LoopStarted {
                id: context.exec_id.clone(),
                node_id: node_id.to_string(),
                node_title: context.node_title.clone(),
                inputs: inputs.clone(),
            })
            .await?;

        let mut usage = LlmUsage::default();
        let mut body_steps = 0;
        let mut body_exceptions = 0;
        let mut steps = 0;
        let mut broke_out = false;

        while steps < max_iterations {
            if context.cancel.is_cancelled() {
                return Err(NodeError::GenerationStopped);
            }
            context
                .events
                .publish(GraphEngineEvent::LoopNext {
                    id: context.exec_id.clone(),
                    node_id: node_id.to_string(),
                    index: steps,
                })
                .await?;

            let mut child = pool.clone();
            seed_loop_variables(&mut child, node_id, &loop_vars);
            child.seed(&Selector::new(node_id, "index"), Segment::Integer(steps as i64));

            let output = self.runner.run_sub_graph(body.clone(), child, context).await?;
            usage.merge(&output.llm_usage);
            body_steps += output.steps;
            body_exceptions += output.exceptions_count;
            for (name, value) in loop_vars.iter_mut() {
                if let Some(updated) = output.outputs.get(name.as_str()) {
                    *value = updated.clone();
                }
            }
            steps += 1;

            if !data.break_conditions.is_empty() {
                let mut check = pool.clone();
                seed_loop_variables(&mut check, node_id, &loop_vars);
                if evaluate_conditions(&data.break_conditions, data.logical_operator, &check) {
                    broke_out = true;
                    break;
                }
            }
        }

        let outputs: HashMap<String, Value> = loop_vars.into_iter().collect();
        let error = (!data.break_conditions.is_empty() && !broke_out).then(|| {
            format!(
                "loop reached {} iterations without meeting its break condition",
                max_iterations
            )
        });

        context
            .events
            .publish(GraphEngineEvent::LoopCompleted {
                id: context.exec_id.clone(),
                node_id: node_id.to_string(),
                outputs: outputs.clone(),
                steps,
                error: error.clone(),
            })
            .await?;

        if let Some(error) = error {
            return Err(NodeError::ExecutionError(error));
        }

        Ok(NodeRunResult {
            inputs,
            outputs,
            llm_usage: (usage != LlmUsage::default()).then_some(usage),
            metadata: HashMap::from([("loop_steps".to_string(), Value::from(steps))]),
            body_steps,
            body_exceptions,
            ..Default::default()
        }
        .into())
    }
}
