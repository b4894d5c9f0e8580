use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::variable_pool::VariablePool;
use crate::dsl::schema::NodeRunResult;

use super::types::{EdgeState, Graph};

/// Nodes affected by resolving one node's outgoing edges.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EdgeResolution {
    /// Nodes whose incoming edges are all resolved with at least one taken.
    pub ready: Vec<String>,
    /// Nodes that can never run in this execution.
    pub skipped: Vec<String>,
}

/// Per-run state of every edge, keyed by edge id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeStates {
    states: BTreeMap<String, EdgeState>,
}

impl EdgeStates {
    pub fn new(graph: &Graph) -> Self {
        EdgeStates {
            states: graph
                .edges()
                .iter()
                .map(|e| (e.id.clone(), EdgeState::Unknown))
                .collect(),
        }
    }

    pub fn get(&self, edge_id: &str) -> EdgeState {
        self.states.get(edge_id).copied().unwrap_or_default()
    }

    /// Mark every outgoing edge of `node_id` taken or skipped according to
    /// its result, then report which downstream nodes became ready or skipped.
    pub fn resolve_outgoing(
        &mut self,
        graph: &Graph,
        node_id: &str,
        result: &NodeRunResult,
        pool: &VariablePool,
    ) -> EdgeResolution {
        let mut targets: Vec<String> = Vec::new();
        for edge in graph.outgoing(node_id) {
            let state = if edge.is_traversable(result, pool) {
                EdgeState::Taken
            } else {
                EdgeState::Skipped
            };
            self.states.insert(edge.id.clone(), state);
            if !targets.contains(&edge.target) {
                targets.push(edge.target.clone());
            }
        }

        let mut resolution = EdgeResolution::default();
        for target in targets {
            self.check_target(graph, &target, &mut resolution);
        }
        resolution
    }

    fn check_target(&mut self, graph: &Graph, target: &str, resolution: &mut EdgeResolution) {
        let mut any_taken = false;
        for edge in graph.incoming(target) {
            match self.get(&edge.id) {
                EdgeState::Unknown => return,
                EdgeState::Taken => any_taken = true,
                EdgeState::Skipped => {}
            }
        }
        if any_taken {
            resolution.ready.push(target.to_string());
        } else {
            self.skip_node(graph, target, resolution);
        }
    }

    fn skip_node(&mut self, graph: &Graph, node_id: &str, resolution: &mut EdgeResolution) {
        resolution.skipped.push(node_id.to_string());
        let mut targets: Vec<String> = Vec::new();
        for edge in graph.outgoing(node_id) {
            self.states.insert(edge.id.clone(), EdgeState::Skipped);
            if !targets.contains(&edge.target) {
                targets.push(edge.target.clone());
            }
        }
        for target in targets {
            self.check_target(graph, &target, resolution);
        }
    }
}
