use parking_lot::Mutex;
use std::collections::HashSet;

/// Set of node ids currently executing in a run.
///
/// The dispatcher treats the run as quiescent only when this set is empty.
/// `remove` is idempotent since failure cleanup can race normal completion.
#[derive(Debug, Default)]
pub struct ExecutingNodesManager {
    executing: Mutex<HashSet<String>>,
}

impl ExecutingNodesManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the node was already tracked.
    pub fn add(&self, node_id: &str) -> bool {
        self.executing.lock().insert(node_id.to_string())
    }

    /// Returns whether the node was tracked. Removing an absent id is a no-op.
    pub fn remove(&self, node_id: &str) -> bool {
        self.executing.lock().remove(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.executing.lock().contains(node_id)
    }

    pub fn is_empty(&self) -> bool {
        self.executing.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.executing.lock().len()
    }

    pub fn snapshot(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.executing.lock().iter().cloned().collect();
        ids.sort();
        ids
    }
}
