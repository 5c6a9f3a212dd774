//! Edge condition evaluation and next-node selection.
//!
//! Missing paths never raise errors: they simply fail `Equals`/`OneOf`
//! and satisfy `NotEquals`/`Missing`, so conditional edges can coexist with a
//! default edge. Numbers compare by value (`1` equals `1.0`).

use serde_json::Value;

use crate::models::{Edge, EdgeCondition};
use crate::render::lookup;

impl EdgeCondition {
    pub fn matches(&self, context: &Value) -> bool {
        match self {
            Self::Equals { path, value } => {
                lookup(context, path).is_some_and(|actual| values_equal(actual, value))
            }
            Self::NotEquals { path, value } => {
                !lookup(context, path).is_some_and(|actual| values_equal(actual, value))
            }
            Self::Exists { path } => lookup(context, path).is_some_and(|v| !v.is_null()),
            Self::Missing { path } => lookup(context, path).map_or(true, Value::is_null),
            Self::OneOf { path, values } => lookup(context, path)
                .is_some_and(|actual| values.iter().any(|v| values_equal(actual, v))),
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

/// Where an instance goes after finishing a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextNode<'a> {
    /// The node has no outgoing edges.
    Terminal,
    Next(&'a str),
    /// The node has outgoing edges but none applies.
    NoMatch,
}

/// Pick the next node: conditional edges in declaration order, first match
/// wins; the default edge is the fallback.
pub fn select_next<'a>(edges: &'a [Edge], from: &str, context: &Value) -> NextNode<'a> {
    let mut outgoing = edges.iter().filter(|e| e.from_node_id == from).peekable();
    if outgoing.peek().is_none() {
        return NextNode::Terminal;
    }

    let mut fallback = None;
    for edge in outgoing {
        match &edge.condition {
            Some(condition) if condition.matches(context) => {
                return NextNode::Next(&edge.to_node_id);
            }
            Some(_) => {}
            None => fallback = fallback.or(Some(edge.to_node_id.as_str())),
        }
    }

    fallback.map_or(NextNode::NoMatch, NextNode::Next)
}
