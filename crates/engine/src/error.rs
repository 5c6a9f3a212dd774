//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

use crate::models::{InstanceStatus, NodeType};

/// Structural problems in a workflow graph.
///
/// Raised by the validator when a workflow version is activated, except for
/// `NoMatchingEdge`, which can only be discovered against a live context.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// The workflow's entry node is not part of its node set.
    #[error("entry node '{0}' is not defined")]
    MissingEntryNode(String),

    /// An edge references a node ID that doesn't exist in the workflow.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        node_id: String,
        side: &'static str,
    },

    /// Two outgoing edges of one node cannot be told apart.
    #[error("node '{node_id}' has ambiguous outgoing edges: {reason}")]
    AmbiguousBranch { node_id: String, reason: String },

    /// A node cannot be reached from the entry node.
    #[error("node '{0}' is unreachable from the entry node")]
    UnreachableNode(String),

    /// A cycle exists that does not pass through any delay node.
    #[error("cycle without a delay node through {nodes:?}")]
    CycleWithoutDelay { nodes: Vec<String> },

    /// A delay node's body is not a duration expression.
    #[error("delay node '{node_id}' has an invalid duration: {message}")]
    InvalidDelay { node_id: String, message: String },

    /// No outgoing edge of a non-terminal node matched the context.
    #[error("no outgoing edge of node '{node_id}' matches the trigger context")]
    NoMatchingEdge { node_id: String },
}

/// Template expansion failures. Never retried: the same template and context
/// always fail the same way.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("template references missing variable '{name}'")]
    MissingVariable { name: String },

    #[error("malformed template: {message}")]
    Malformed { message: String },
}

/// Persistence failures surfaced by a store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    /// A stored row could not be mapped back onto a domain type.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// The workflow is still referenced by trigger instances.
    #[error("still referenced by {instances} trigger instance(s)")]
    InUse { instances: u64 },

    #[error("database error: {0}")]
    Database(db::DbError),
}

impl From<db::DbError> for StoreError {
    fn from(err: db::DbError) -> Self {
        match err {
            db::DbError::NotFound | db::DbError::MissingReference(_) => Self::NotFound,
            db::DbError::InUse(instances) => Self::InUse {
                instances: instances.max(0) as u64,
            },
            other => Self::Database(other),
        }
    }
}

/// Errors produced by the workflow engine (validation + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// No such workflow, active workflow version or trigger instance.
    #[error("{0} not found")]
    NotFound(String),

    /// The caller's input cannot be used to start an execution.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The requested status change is not allowed by the state machine.
    #[error("cannot move trigger instance from {from} to {to}")]
    InvalidTransition {
        from: InstanceStatus,
        to: InstanceStatus,
    },

    /// Deleting the workflow would orphan trigger instances.
    #[error("workflow {workflow_id} is still referenced by {instances} trigger instance(s)")]
    WorkflowInUse { workflow_id: Uuid, instances: u64 },

    /// A node type has no channel adapter registered.
    #[error("no channel adapter registered for {0} nodes")]
    NoChannelAdapter(NodeType),
}
