use std::collections::{HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};

use crate::dsl::schema::{EdgeSchema, NodeSchema, NodeType, SubGraphSchema, WorkflowSchema};
use crate::error::WorkflowError;
use serde_json::Value;

use super::types::{Graph, GraphEdge, GraphNode};

/// Build and validate the workflow graph from a parsed DSL schema.
pub fn build_graph(dsl: &WorkflowSchema) -> Result<Graph, WorkflowError> {
    let graph = build_from_parts(&dsl.nodes, &dsl.edges)?;
    let mut seen: HashSet<&str> = dsl.nodes.iter().map(|n| n.id.as_str()).collect();
    for node in &dsl.nodes {
        ensure_body_ids_unique(node, &mut seen)?;
    }
    Ok(graph)
}

/// Build the body of a loop or iteration node.
pub fn build_sub_graph(sub_graph: &SubGraphSchema) -> Result<Graph, WorkflowError> {
    build_from_parts(&sub_graph.nodes, &sub_graph.edges)
}

/// Body node ids must not repeat a parent node id or another body's id.
fn ensure_body_ids_unique<'a>(
    node: &'a NodeSchema,
    seen: &mut HashSet<&'a str>,
) -> Result<(), WorkflowError> {
    if !matches!(node.data.node_type, NodeType::Loop | NodeType::Iteration) {
        return Ok(());
    }
    let body_ids = node
        .data
        .extra
        .get("sub_graph")
        .and_then(|body| body.get("nodes"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|n| n.get("id").and_then(Value::as_str));
    for id in body_ids {
        if !seen.insert(id) {
            return Err(WorkflowError::GraphValidationError(format!(
                "Node id '{}' in the body of '{}' is already used",
                id, node.id
            )));
        }
    }
    Ok(())
}

fn build_from_parts(nodes: &[NodeSchema], edges: &[EdgeSchema]) -> Result<Graph, WorkflowError> {
    let mut node_map: HashMap<String, GraphNode> = HashMap::with_capacity(nodes.len());
    for node_schema in nodes {
        if node_map.contains_key(&node_schema.id) {
            return Err(WorkflowError::GraphValidationError(format!(
                "Duplicate node id: {}",
                node_schema.id
            )));
        }
        node_map.insert(node_schema.id.clone(), GraphNode::from_schema(node_schema));
    }

    let mut graph_edges = Vec::with_capacity(edges.len());
    let mut in_edges: HashMap<String, Vec<usize>> = HashMap::new();
    let mut out_edges: HashMap<String, Vec<usize>> = HashMap::new();
    for (index, edge_schema) in edges.iter().enumerate() {
        for endpoint in [&edge_schema.source, &edge_schema.target] {
            if !node_map.contains_key(endpoint) {
                return Err(WorkflowError::GraphBuildError(format!(
                    "Edge references unknown node: {}",
                    endpoint
                )));
            }
        }
        let mut edge = GraphEdge {
            id: edge_schema.id.clone(),
            source: edge_schema.source.clone(),
            target: edge_schema.target.clone(),
            source_handle: edge_schema.source_handle.clone(),
            run_condition: edge_schema.run_condition.clone(),
        };
        if edge.id.is_empty() {
            edge.id = format!("{}-{}-{}", edge.source, edge.handle(), edge.target);
        }
        out_edges.entry(edge.source.clone()).or_default().push(index);
        in_edges.entry(edge.target.clone()).or_default().push(index);
        graph_edges.push(edge);
    }

    let mut start_nodes: Vec<&GraphNode> = node_map
        .values()
        .filter(|n| n.node_type == NodeType::Start)
        .collect();
    let root_node_id = match start_nodes.len() {
        0 => return Err(WorkflowError::NoStartNode),
        1 => start_nodes.remove(0).id.clone(),
        _ => return Err(WorkflowError::MultipleStartNodes),
    };
    if in_edges.contains_key(&root_node_id) {
        return Err(WorkflowError::GraphValidationError(format!(
            "Start node '{}' must not have incoming edges",
            root_node_id
        )));
    }

    let graph = Graph {
        nodes: node_map,
        edges: graph_edges,
        in_edges,
        out_edges,
        root_node_id,
    };
    ensure_acyclic(&graph)?;
    Ok(graph)
}

fn ensure_acyclic(graph: &Graph) -> Result<(), WorkflowError> {
    let mut topology: DiGraph<&str, ()> = DiGraph::new();
    let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
    for node in graph.nodes() {
        indices.insert(node.id.as_str(), topology.add_node(node.id.as_str()));
    }
    for edge in graph.edges() {
        if let (Some(&s), Some(&t)) = (
            indices.get(edge.source.as_str()),
            indices.get(edge.target.as_str()),
        ) {
            topology.add_edge(s, t, ());
        }
    }
    if petgraph::algo::is_cyclic_directed(&topology) {
        return Err(WorkflowError::CycleDetected);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::{parse_dsl, DslFormat};

    fn parse(yaml: &str) -> WorkflowSchema {
        parse_dsl(yaml, DslFormat::Yaml).unwrap()
    }

    const BRANCHING: &str = r#"
nodes:
  - id: start
    data: { type: start }
  - id: if1
    data:
      type: if-else
      cases: []
  - id: a
    data: { type: answer, answer: "a" }
  - id: b
    data: { type: answer, answer: "b" }
edges:
  - { source: start, target: if1 }
  - { source: if1, target: a, sourceHandle: "true" }
  - { source: if1, target: b, sourceHandle: "false" }
"#;

    #[test]
    fn test_build_branching_graph() {
        let graph = build_graph(&parse(BRANCHING)).unwrap();
        assert_eq!(graph.root_node_id(), "start");
        assert_eq!(graph.node_count(), 4);
        let handles: Vec<&str> = graph.outgoing("if1").map(|e| e.handle()).collect();
        assert_eq!(handles, vec!["true", "false"]);
        assert_eq!(graph.incoming("a").count(), 1);
        assert_eq!(graph.edges()[0].id, "start-source-if1");
        assert_eq!(graph.node("if1").unwrap().node_type, NodeType::IfElse);
    }

    #[test]
    fn test_rejects_missing_start() {
        let yaml = r#"
nodes:
  - id: end
    data: { type: end }
"#;
        assert!(matches!(
            build_graph(&parse(yaml)),
            Err(WorkflowError::NoStartNode)
        ));
    }

    #[test]
    fn test_rejects_multiple_starts() {
        let yaml = r#"
nodes:
  - id: s1
    data: { type: start }
  - id: s2
    data: { type: start }
"#;
        assert!(matches!(
            build_graph(&parse(yaml)),
            Err(WorkflowError::MultipleStartNodes)
        ));
    }

    #[test]
    fn test_rejects_dangling_edge() {
        let yaml = r#"
nodes:
  - id: start
    data: { type: start }
edges:
  - { source: start, target: ghost }
"#;
        assert!(matches!(
            build_graph(&parse(yaml)),
            Err(WorkflowError::GraphBuildError(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let yaml = r#"
nodes:
  - id: start
    data: { type: start }
  - id: start
    data: { type: end }
"#;
        assert!(matches!(
            build_graph(&parse(yaml)),
            Err(WorkflowError::GraphValidationError(_))
        ));
    }

    #[test]
    fn test_rejects_cycle() {
        let yaml = r#"
nodes:
  - id: start
    data: { type: start }
  - id: a
    data: { type: end }
  - id: b
    data: { type: end }
edges:
  - { source: start, target: a }
  - { source: a, target: b }
  - { source: b, target: a }
"#;
        assert!(matches!(
            build_graph(&parse(yaml)),
            Err(WorkflowError::CycleDetected)
        ));
    }

    #[test]
    fn test_rejects_body_id_reused_from_parent() {
        let yaml = r#"
nodes:
  - id: start
    data: { type: start }
  - id: loop1
    data:
      type: loop
      sub_graph:
        nodes:
          - id: start
            data: { type: start }
edges:
  - { source: start, target: loop1 }
"#;
        let err = build_graph(&parse(yaml)).unwrap_err();
        assert!(matches!(err, WorkflowError::GraphValidationError(msg) if msg.contains("loop1")));
    }
}
