//! Core domain models for the notification engine.
//!
//! Workflow definitions (`Workflow`, `NodeTemplate`, `Edge`) are owned by the
//! definition store and only read here. `TriggerInstance` and
//! `NodeExecutionRecord` are the engine's own state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use channels::Channel;

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// One version of a notification workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    /// Human-readable code, unique across workflows.
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub is_active: bool,
    pub entry_node_id: String,
    pub version: u32,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    /// Active and not soft-deleted.
    pub fn is_usable(&self) -> bool {
        self.is_active && self.deleted_at.is_none()
    }
}

// ---------------------------------------------------------------------------
// NodeTemplate
// ---------------------------------------------------------------------------

/// What a node does when the instance reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Email,
    Sms,
    Delay,
}

impl NodeType {
    /// The delivery channel for dispatching nodes; `None` for delays.
    pub fn channel(self) -> Option<Channel> {
        match self {
            Self::Email => Some(Channel::Email),
            Self::Sms => Some(Channel::Sms),
            Self::Delay => None,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Sms => write!(f, "sms"),
            Self::Delay => write!(f, "delay"),
        }
    }
}

impl FromStr for NodeType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Self::Email),
            "sms"   => Ok(Self::Sms),
            "delay" => Ok(Self::Delay),
            other   => Err(format!("unknown node type: {other}")),
        }
    }
}

/// A single step of the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTemplate {
    /// Identifier referenced by edges and by `Workflow::entry_node_id`.
    pub id: String,
    pub code: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Message template for email/sms nodes; a duration expression
    /// (e.g. `"1h30m"`) for delay nodes.
    pub template_body: String,
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// Guard on an outgoing edge, evaluated against the trigger context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// The value at `path` equals `value`.
    Equals { path: String, value: Value },
    /// The value at `path` is absent or differs from `value`.
    NotEquals { path: String, value: Value },
    /// `path` is present and not null.
    Exists { path: String },
    /// `path` is absent or null.
    Missing { path: String },
    /// The value at `path` equals one of `values`.
    OneOf { path: String, values: Vec<Value> },
}

/// Directed edge between two nodes of the same workflow version.
///
/// Edges are kept in declaration order; that order decides which condition
/// is tried first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from_node_id: String,
    pub to_node_id: String,
    /// `None` marks the default edge.
    #[serde(default)]
    pub condition: Option<EdgeCondition>,
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// A workflow version together with its graph, as loaded from the
/// definition store or read from a definition file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow: Workflow,
    pub nodes: Vec<NodeTemplate>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl WorkflowDefinition {
    pub fn node(&self, id: &str) -> Option<&NodeTemplate> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn entry_node(&self) -> Option<&NodeTemplate> {
        self.node(&self.workflow.entry_node_id)
    }
}

// ---------------------------------------------------------------------------
// TriggerInstance
// ---------------------------------------------------------------------------

/// Lifecycle of a trigger instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    WaitingDelay,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the instance still has work ahead of it. This is the predicate
    /// behind the workflow delete guard.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// The state machine. `Running -> Pending` is the reaper returning an
    /// instance whose lease expired; `Running -> Running` is advancing to the
    /// next node under the same claim.
    pub fn can_transition_to(self, next: Self) -> bool {
        use InstanceStatus::*;
        match (self, next) {
            (Pending, Running | Cancelled) => true,
            (Running, Running | WaitingDelay | Completed | Failed | Cancelled | Pending) => true,
            (WaitingDelay, Running | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending      => write!(f, "pending"),
            Self::Running      => write!(f, "running"),
            Self::WaitingDelay => write!(f, "waiting_delay"),
            Self::Completed    => write!(f, "completed"),
            Self::Failed       => write!(f, "failed"),
            Self::Cancelled    => write!(f, "cancelled"),
        }
    }
}

impl FromStr for InstanceStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending"       => Ok(Self::Pending),
            "running"       => Ok(Self::Running),
            "waiting_delay" => Ok(Self::WaitingDelay),
            "completed"     => Ok(Self::Completed),
            "failed"        => Ok(Self::Failed),
            "cancelled"     => Ok(Self::Cancelled),
            other           => Err(format!("unknown instance status: {other}")),
        }
    }
}

/// Exclusive, time-bounded ownership of an instance by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub owner: String,
    /// Fresh for every claim, so a worker can tell its own claim from a
    /// later one held by the same owner name.
    pub token: Uuid,
    pub lease_expires_at: DateTime<Utc>,
}

/// One execution of a workflow version for one triggering event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerInstance {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Pinned at creation; later versions never affect this instance.
    pub workflow_version: u32,
    /// Data available to templates and edge conditions. Always an object.
    pub context: Value,
    pub current_node_id: String,
    pub status: InstanceStatus,
    /// Attempt number for the current node, starting at 1.
    pub attempt: u32,
    /// When a `waiting_delay` instance becomes due. Also kept while the
    /// woken instance is running so the step knows the delay has elapsed.
    pub wake_at: Option<DateTime<Utc>>,
    pub claim: Option<Claim>,
    pub last_error: Option<String>,
    /// Bumped by every write; the basis of every compare-and-set.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TriggerInstance {
    /// A new `pending` instance positioned at the workflow's entry node.
    pub fn new(workflow: &Workflow, context: Value, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            workflow_version: workflow.version,
            context,
            current_node_id: workflow.entry_node_id.clone(),
            status: InstanceStatus::Pending,
            attempt: 1,
            wake_at: None,
            claim: None,
            last_error: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `token` is the live claim on this instance.
    pub fn is_claimed_by(&self, token: Uuid) -> bool {
        self.status == InstanceStatus::Running
            && self.claim.as_ref().is_some_and(|c| c.token == token)
    }
}

// ---------------------------------------------------------------------------
// NodeExecutionRecord
// ---------------------------------------------------------------------------

/// What happened during one attempt at one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Dispatched,
    Delayed,
    Retried,
    Failed,
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatched => write!(f, "dispatched"),
            Self::Delayed    => write!(f, "delayed"),
            Self::Retried    => write!(f, "retried"),
            Self::Failed     => write!(f, "failed"),
        }
    }
}

impl FromStr for ExecutionOutcome {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dispatched" => Ok(Self::Dispatched),
            "delayed"    => Ok(Self::Delayed),
            "retried"    => Ok(Self::Retried),
            "failed"     => Ok(Self::Failed),
            other        => Err(format!("unknown execution outcome: {other}")),
        }
    }
}

/// Append-only audit row, one per attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub id: Uuid,
    pub trigger_instance_id: Uuid,
    pub node_id: String,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: ExecutionOutcome,
    /// SHA-256 of the rendered payload, when one was produced.
    pub rendered_payload_ref: Option<String>,
    pub error: Option<String>,
}
