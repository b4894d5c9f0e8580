use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::core::pause::RunAccumulators;
use crate::core::variable_pool::{Segment, VariablePool};
use crate::dsl::schema::{NodeRunResult, WorkflowNodeExecutionStatus};
use crate::error::WorkflowError;

/// Mutable state of one run: the variable pool plus accumulators merged across
/// node completions. Owned by a single run and never shared between runs.
#[derive(Debug, Default)]
pub struct GraphRuntimeState {
    pool: RwLock<VariablePool>,
    accumulators: Mutex<RunAccumulators>,
    /// Conversation variables changed during this run, in name order.
    conversation_changes: Mutex<BTreeMap<String, Value>>,
}

impl GraphRuntimeState {
    pub fn new(pool: VariablePool) -> Self {
        Self::restore(pool, RunAccumulators::default())
    }

    pub fn restore(pool: VariablePool, accumulators: RunAccumulators) -> Self {
        GraphRuntimeState {
            pool: RwLock::new(pool),
            accumulators: Mutex::new(accumulators),
            conversation_changes: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn pool(&self) -> RwLockReadGuard<'_, VariablePool> {
        self.pool.read()
    }

    /// Owned copy handed to node tasks.
    pub fn pool_snapshot(&self) -> VariablePool {
        self.pool.read().clone()
    }

    pub fn write_outputs(
        &self,
        node_id: &str,
        outputs: &HashMap<String, Value>,
    ) -> Result<(), WorkflowError> {
        if outputs.is_empty() {
            return Ok(());
        }
        self.pool.write().add_node_outputs(node_id, outputs)
    }

    pub fn apply_conversation_updates(&self, updates: &HashMap<String, Value>) {
        if updates.is_empty() {
            return;
        }
        let mut pool = self.pool.write();
        let mut changes = self.conversation_changes.lock();
        for (name, value) in updates {
            pool.set_conversation_variable(name, Segment::from_value(value));
            changes.insert(name.clone(), value.clone());
        }
    }

    /// Returns the new step count.
    pub fn increment_steps(&self) -> i32 {
        let mut acc = self.accumulators.lock();
        acc.total_steps += 1;
        acc.total_steps
    }

    pub fn record_completion(&self, result: &NodeRunResult) {
        let mut acc = self.accumulators.lock();
        if let Some(usage) = &result.llm_usage {
            acc.llm_usage.merge(usage);
        }
        if result.status == WorkflowNodeExecutionStatus::Exception {
            acc.exceptions_count += 1;
        }
        acc.total_steps += result.body_steps;
        acc.exceptions_count += result.body_exceptions;
    }

    pub fn extend_outputs(&self, outputs: &HashMap<String, Value>) {
        let mut acc = self.accumulators.lock();
        for (k, v) in outputs {
            acc.outputs.insert(k.clone(), v.clone());
        }
    }

    /// Answer nodes accumulate into a single `answer` output.
    pub fn append_answer(&self, text: &str) {
        let mut acc = self.accumulators.lock();
        let entry = acc
            .outputs
            .entry("answer".to_string())
            .or_insert_with(|| Value::String(String::new()));
        match entry {
            Value::String(existing) => existing.push_str(text),
            other => *other = Value::String(text.to_string()),
        }
    }

    pub fn accumulators(&self) -> RunAccumulators {
        self.accumulators.lock().clone()
    }

    pub fn total_steps(&self) -> i32 {
        self.accumulators.lock().total_steps
    }

    pub fn outputs(&self) -> HashMap<String, Value> {
        self.accumulators.lock().outputs.clone()
    }

    pub fn exceptions_count(&self) -> usize {
        self.accumulators.lock().exceptions_count
    }

    pub fn conversation_changes(&self) -> Vec<(String, Value)> {
        self.conversation_changes
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
