//! Iteration Node executor.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::event_bus::GraphEngineEvent;
use crate::core::sub_graph_runner::{SubGraphOutput, SubGraphRunner};
use crate::core::variable_pool::{Segment, Selector, VariablePool};
use crate::dsl::schema::{IterationErrorMode, IterationNodeData, LlmUsage, NodeRunResult};
use crate::error::NodeError;
use crate::graph::Graph;
use crate::nodes::executor::{NodeExecutionContext, NodeExecutor, NodeRunOutcome};
use crate::nodes::utils::parse_config;

use super::{build_body, default_sub_graph_runner};

/// Runs a body once per element of an array variable and collects the value
/// at `output_selector` from each pass, in input order.
pub struct IterationNodeExecutor {
    runner: Arc<dyn SubGraphRunner>,
}

impl Default for IterationNodeExecutor {
    fn default() -> Self {
        Self::new(default_sub_graph_runner())
    }
}

impl IterationNodeExecutor {
    pub fn new(runner: Arc<dyn SubGraphRunner>) -> Self {
        Self { runner }
    }

    async fn run_item(
        &self,
        body: Arc<Graph>,
        pool: &VariablePool,
        node_id: &str,
        index: usize,
        item: Value,
        context: &NodeExecutionContext,
    ) -> Result<SubGraphOutput, NodeError> {
        if context.cancel.is_cancelled() {
            return Err(NodeError::GenerationStopped);
        }
        context
            .events
            .publish(GraphEngineEvent::IterationNext {
                id: context.exec_id.clone(),
                node_id: node_id.to_string(),
                index,
            })
            .await?;

        let mut child = pool.clone();
        child.seed(&Selector::new(node_id, "item"), Segment::from_value(&item));
        child.seed(&Selector::new(node_id, "index"), Segment::Integer(index as i64));
        self.runner.run_sub_graph(body, child, context).await
    }
}

#[async_trait]
impl NodeExecutor for IterationNodeExecutor {
    async fn execute(
        &self,
        node_id: &str,
        config: &Value,
        pool: &VariablePool,
        context: &NodeExecutionContext,
    ) -> Result<NodeRunOutcome, NodeError> {
        let data: IterationNodeData = parse_config(config)?;
        let body = build_body(&data.sub_graph)?;

        let items = match pool.get(&data.iterator_selector).to_value() {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(NodeError::TypeError(format!(
                    "iteration input {:?} must be an array, got {}",
                    data.iterator_selector, other
                )))
            }
        };

        context
            .events
            .publish(GraphEngineEvent::IterationStarted {
                id: context.exec_id.clone(),
                node_id: node_id.to_string(),
                node_title: context.node_title.clone(),
                length: items.len(),
            })
            .await?;

        let results: Vec<Result<SubGraphOutput, NodeError>> = if data.is_parallel {
            stream::iter(items.iter().cloned().enumerate())
                .map(|(index, item)| self.run_item(body.clone(), pool, node_id, index, item, context))
                .buffered(data.parallel_nums.max(1))
                .collect()
                .await
        } else {
            let mut results = Vec::with_capacity(items.len());
            for (index, item) in items.iter().cloned().enumerate() {
                let result = self.run_item(body.clone(), pool, node_id, index, item, context).await;
                let stop = result.is_err() && data.error_handle_mode == IterationErrorMode::Terminated;
                results.push(result);
                if stop {
                    break;
                }
            }
            results
        };

        let mut collected = Vec::with_capacity(results.len());
        let mut usage = LlmUsage::default();
        let mut body_steps = 0;
        let mut body_exceptions = 0;
        let mut failure = None;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(output) => {
                    usage.merge(&output.llm_usage);
                    body_steps += output.steps;
                    body_exceptions += output.exceptions_count;
                    collected.push(output.pool.get(&data.output_selector).to_value());
                }
                Err(e) if e.is_generation_stopped() => return Err(e),
                Err(e) => match data.error_handle_mode {
                    IterationErrorMode::Terminated => {
                        failure = Some(format!("iteration {} failed: {}", index, e));
                        break;
                    }
                    IterationErrorMode::ContinueOnError => collected.push(Value::Null),
                    IterationErrorMode::RemoveAbnormalOutput => {}
                },
            }
        }

        let outputs = HashMap::from([("output".to_string(), Value::Array(collected))]);
        context
            .events
            .publish(GraphEngineEvent::IterationCompleted {
                id: context.exec_id.clone(),
                node_id: node_id.to_string(),
                outputs: outputs.clone(),
                steps: items.len(),
                error: failure.clone(),
            })
            .await?;

        if let Some(error) = failure {
            return Err(NodeError::ExecutionError(error));
        }

        Ok(NodeRunResult {
            inputs: HashMap::from([("iterator".to_string(), Value::Array(items))]),
            outputs,
            llm_usage: (usage != LlmUsage::default()).then_some(usage),
            body_steps,
            body_exceptions,
            ..Default::default()
        }
        .into())
    }
}
