//! Variable assigner node.
//!
//! Each item computes a new value from the current value at its selector and
//! an operand. A target in the `conversation` namespace becomes a conversation
//! update; any other target is written as this node's own output under the
//! selector's variable name, since node namespaces are write-once.

use async_trait::async_trait;
use serde_json::{Number, Value};
use std::collections::HashMap;

use crate::core::variable_pool::{VariablePool, CONVERSATION_VARIABLE_NODE_ID};
use crate::dsl::schema::{AssignerInputType, AssignerItem, AssignerNodeData, AssignerOperation, NodeRunResult};
use crate::error::NodeError;
use crate::evaluator::operators::value_to_f64;
use crate::nodes::executor::{NodeExecutionContext, NodeExecutor, NodeRunOutcome};
use crate::nodes::utils::parse_config;

pub struct VariableAssignerExecutor;

#[async_trait]
impl NodeExecutor for VariableAssignerExecutor {
    async fn execute(
        &self,
        _node_id: &str,
        config: &Value,
        variable_pool: &VariablePool,
        _context: &NodeExecutionContext,
    ) -> Result<NodeRunOutcome, NodeError> {
        let data: AssignerNodeData = parse_config(config)?;

        // Later items see the values written by earlier ones.
        let mut written: HashMap<Vec<String>, Value> = HashMap::new();
        let mut result = NodeRunResult::default();

        for item in &data.items {
            let [namespace, name, ..] = item.variable_selector.as_slice() else {
                return Err(NodeError::ConfigError(format!(
                    "invalid assigner selector {:?}",
                    item.variable_selector
                )));
            };
            let current = written
                .get(&item.variable_selector)
                .cloned()
                .unwrap_or_else(|| variable_pool.get(&item.variable_selector).to_value());
            let operand = resolve_operand(item, variable_pool)?;
            let updated = apply_operation(item.operation, current, operand)?;

            written.insert(item.variable_selector.clone(), updated.clone());
            result
                .inputs
                .insert(item.variable_selector.join("."), item.value.clone());
            if namespace == CONVERSATION_VARIABLE_NODE_ID {
                result.conversation_updates.insert(name.clone(), updated);
            } else {
                result.outputs.insert(name.clone(), updated);
            }
        }

        Ok(result.into())
    }
}

fn resolve_operand(item: &AssignerItem, pool: &VariablePool) -> Result<Value, NodeError> {
    match item.input_type {
        AssignerInputType::Constant => Ok(item.value.clone()),
        AssignerInputType::Variable => {
            let selector: Vec<String> = serde_json::from_value(item.value.clone()).map_err(|_| {
                NodeError::ConfigError(format!("operand is not a selector: {}", item.value))
            })?;
            Ok(pool.get(&selector).to_value())
        }
    }
}

pub(crate) fn apply_operation(
    operation: AssignerOperation,
    current: Value,
    operand: Value,
) -> Result<Value, NodeError> {
    match operation {
        AssignerOperation::OverWrite | AssignerOperation::Set => Ok(operand),
        AssignerOperation::Clear => Ok(match current {
            Value::Array(_) => Value::Array(Vec::new()),
            Value::Object(_) => Value::Object(Default::default()),
            Value::String(_) => Value::String(String::new()),
            Value::Number(_) => Value::from(0),
            Value::Bool(_) => Value::Bool(false),
            Value::Null => Value::Null,
        }),
        AssignerOperation::Append => {
            let mut items = as_array(current)?;
            items.push(operand);
            Ok(Value::Array(items))
        }
        AssignerOperation::Extend => {
            let mut items = as_array(current)?;
            items.extend(as_array(operand)?);
            Ok(Value::Array(items))
        }
        AssignerOperation::RemoveFirst => {
            let mut items = as_array(current)?;
            if !items.is_empty() {
                items.remove(0);
            }
            Ok(Value::Array(items))
        }
        AssignerOperation::RemoveLast => {
            let mut items = as_array(current)?;
            items.pop();
            Ok(Value::Array(items))
        }
        AssignerOperation::Add
        | AssignerOperation::Subtract
        | AssignerOperation::Multiply
        | AssignerOperation::Divide => arithmetic(operation, &current, &operand),
    }
}

fn as_array(value: Value) -> Result<Vec<Value>, NodeError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(NodeError::TypeError(format!("expected an array, got {}", other))),
    }
}

fn arithmetic(operation: AssignerOperation, current: &Value, operand: &Value) -> Result<Value, NodeError> {
    if let (Some(a), Some(b)) = (current.as_i64(), operand.as_i64()) {
        let exact = match operation {
            AssignerOperation::Add => a.checked_add(b),
            AssignerOperation::Subtract => a.checked_sub(b),
            AssignerOperation::Multiply => a.checked_mul(b),
            _ => None,
        };
        if let Some(v) = exact {
            return Ok(Value::from(v));
        }
    }

    let (Some(a), Some(b)) = (value_to_f64(current), value_to_f64(operand)) else {
        return Err(NodeError::TypeError(format!(
            "arithmetic needs numbers, got {} and {}",
            current, operand
        )));
    };
    let v = match operation {
        AssignerOperation::Add => a + b,
        AssignerOperation::Subtract => a - b,
        AssignerOperation::Multiply => a * b,
        AssignerOperation::Divide => {
            if b == 0.0 {
                return Err(NodeError::ExecutionError("division by zero".to_string()));
            }
            a / b
        }
        other => {
            return Err(NodeError::ConfigError(format!(
                "{:?} is not an arithmetic operation",
                other
            )))
        }
    };
    if v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
        return Ok(Value::from(v as i64));
    }
    Number::from_f64(v)
        .map(Value::Number)
        .ok_or_else(|| NodeError::TypeError(format!("result is not a finite number: {}", v)))
}
