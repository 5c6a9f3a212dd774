//! Graph validation: run this when a workflow version is activated.
//!
//! Rules enforced, in order:
//! 1. Node IDs must be unique within the workflow.
//! 2. The entry node must exist.
//! 3. Every edge must reference valid node IDs (both `from` and `to`).
//! 4. Outgoing edges of a node must be distinguishable: at most one default
//!    edge, no two edges with the same condition.
//! 5. Every node must be reachable from the entry node.
//! 6. Every cycle must pass through a delay node.
//! 7. Literal delay bodies must parse as durations.
//!
//! Never run per trigger: definitions are immutable once activated.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::delay::parse_delay;
use crate::models::{Edge, NodeTemplate, NodeType, Workflow, WorkflowDefinition};
use crate::render::has_placeholders;
use crate::GraphError;

/// Summary of an accepted graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedGraph {
    /// Node IDs in breadth-first order from the entry node.
    pub visit_order: Vec<String>,
    /// Nodes with no outgoing edges.
    pub terminal_nodes: Vec<String>,
}

/// Validate a workflow version's graph.
///
/// # Errors
/// The first [`GraphError`] found, checked in the order listed in the module
/// documentation.
pub fn validate(
    workflow: &Workflow,
    nodes: &[NodeTemplate],
    edges: &[Edge],
) -> Result<ValidatedGraph, GraphError> {
    // -----------------------------------------------------------------------
    // 1. Ensure node IDs are unique
    // -----------------------------------------------------------------------
    let mut node_types: HashMap<&str, NodeType> = HashMap::with_capacity(nodes.len());
    for node in nodes {
        if node_types.insert(node.id.as_str(), node.node_type).is_some() {
            return Err(GraphError::DuplicateNodeId(node.id.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 2. Entry node
    // -----------------------------------------------------------------------
    let entry = workflow.entry_node_id.as_str();
    if !node_types.contains_key(entry) {
        return Err(GraphError::MissingEntryNode(workflow.entry_node_id.clone()));
    }

    // -----------------------------------------------------------------------
    // 3. Validate edge endpoints
    // -----------------------------------------------------------------------
    for edge in edges {
        if !node_types.contains_key(edge.from_node_id.as_str()) {
            return Err(GraphError::UnknownNodeReference {
                node_id: edge.from_node_id.clone(),
                side: "from",
            });
        }
        if !node_types.contains_key(edge.to_node_id.as_str()) {
            return Err(GraphError::UnknownNodeReference {
                node_id: edge.to_node_id.clone(),
                side: "to",
            });
        }
    }

    // Adjacency in declaration order.
    let mut outgoing: HashMap<&str, Vec<&Edge>> = HashMap::new();
    for edge in edges {
        outgoing.entry(edge.from_node_id.as_str()).or_default().push(edge);
    }

    // -----------------------------------------------------------------------
    // 4. Branch ambiguity
    // -----------------------------------------------------------------------
    for node in nodes {
        let Some(out) = outgoing.get(node.id.as_str()) else {
            continue;
        };
        let defaults = out.iter().filter(|e| e.condition.is_none()).count();
        if defaults > 1 {
            return Err(GraphError::AmbiguousBranch {
                node_id: node.id.clone(),
                reason: format!("{defaults} default edges"),
            });
        }
        for (i, a) in out.iter().enumerate() {
            let duplicate = out[i + 1..]
                .iter()
                .any(|b| a.condition.is_some() && a.condition == b.condition);
            if duplicate {
                return Err(GraphError::AmbiguousBranch {
                    node_id: node.id.clone(),
                    reason: "two edges share the same condition".into(),
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // 5. Reachability (BFS from the entry node)
    // -----------------------------------------------------------------------
    let mut visited: HashSet<&str> = HashSet::from([entry]);
    let mut queue: VecDeque<&str> = VecDeque::from([entry]);
    let mut visit_order: Vec<String> = Vec::with_capacity(nodes.len());

    while let Some(node_id) = queue.pop_front() {
        visit_order.push(node_id.to_owned());
        for edge in outgoing.get(node_id).into_iter().flatten() {
            if visited.insert(edge.to_node_id.as_str()) {
                queue.push_back(edge.to_node_id.as_str());
            }
        }
    }

    if let Some(unreached) = nodes.iter().find(|n| !visited.contains(n.id.as_str())) {
        return Err(GraphError::UnreachableNode(unreached.id.clone()));
    }

    // -----------------------------------------------------------------------
    // 6. Cycles must pass through a delay (Kahn's algorithm on the graph
    //    with every delay node removed)
    // -----------------------------------------------------------------------
    let is_instant = |id: &str| node_types.get(id).is_some_and(|t| *t != NodeType::Delay);

    let mut in_degree: HashMap<&str, usize> = nodes
        .iter()
        .filter(|n| n.node_type != NodeType::Delay)
        .map(|n| (n.id.as_str(), 0))
        .collect();
    for edge in edges {
        if is_instant(edge.from_node_id.as_str()) && is_instant(edge.to_node_id.as_str()) {
            *in_degree.entry(edge.to_node_id.as_str()).or_insert(0) += 1;
        }
    }

    // Seed in declaration order so error reports are stable.
    let mut ready: VecDeque<&str> = nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();
    let mut sorted = 0usize;

    while let Some(node_id) = ready.pop_front() {
        sorted += 1;
        for edge in outgoing.get(node_id).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(edge.to_node_id.as_str()) {
                *deg -= 1;
                if *deg == 0 {
                    ready.push_back(edge.to_node_id.as_str());
                }
            }
        }
    }

    // Whatever Kahn's algorithm could not drain sits on (or behind) a cycle.
    if sorted != in_degree.len() {
        let stuck = nodes
            .iter()
            .filter(|n| in_degree.get(n.id.as_str()).is_some_and(|d| *d > 0))
            .map(|n| n.id.clone())
            .collect();
        return Err(GraphError::CycleWithoutDelay { nodes: stuck });
    }

    // -----------------------------------------------------------------------
    // 7. Literal delay bodies
    // -----------------------------------------------------------------------
    for node in nodes.iter().filter(|n| n.node_type == NodeType::Delay) {
        if !has_placeholders(&node.template_body) {
            parse_delay(&node.template_body).map_err(|e| GraphError::InvalidDelay {
                node_id: node.id.clone(),
                message: e.reason,
            })?;
        }
    }

    let terminal_nodes = nodes
        .iter()
        .filter(|n| !outgoing.contains_key(n.id.as_str()))
        .map(|n| n.id.clone())
        .collect();

    Ok(ValidatedGraph {
        visit_order,
        terminal_nodes,
    })
}

/// [`validate`] over a loaded definition.
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<ValidatedGraph, GraphError> {
    validate(&definition.workflow, &definition.nodes, &definition.edges)
}
