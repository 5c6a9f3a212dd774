//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models: they carry no domain behaviour.
//! Domain types live in the `engine` crate, which converts to and from these
//! rows. Statuses and node types are stored as their lowercase text form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

/// One version of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub version: i32,
    pub code: String,
    pub name: String,
    pub is_active: bool,
    pub entry_node_id: String,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// node_templates / workflow_nodes
// ---------------------------------------------------------------------------

/// A node template joined onto the workflow version that uses it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NodeTemplateRow {
    pub id: String,
    pub code: String,
    pub name: String,
    pub node_type: String,
    pub template_body: String,
}

// ---------------------------------------------------------------------------
// workflow_edges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EdgeRow {
    pub workflow_id: Uuid,
    pub version: i32,
    pub position: i32,
    pub from_node_id: String,
    pub to_node_id: String,
    /// Serialised edge condition; `NULL` for the default edge.
    pub condition: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// trigger_instances
// ---------------------------------------------------------------------------

/// A persisted trigger instance row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TriggerInstanceRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: i32,
    pub context: serde_json::Value,
    pub current_node_id: String,
    pub status: String,
    pub attempt: i32,
    pub wake_at: Option<DateTime<Utc>>,
    pub owner: Option<String>,
    pub claim_token: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Optimistic-concurrency counter; every update bumps it by one.
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// node_executions
// ---------------------------------------------------------------------------

/// A persisted node execution row (append-only).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NodeExecutionRow {
    pub id: Uuid,
    pub trigger_instance_id: Uuid,
    pub node_id: String,
    pub attempt_number: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: String,
    pub rendered_payload_ref: Option<String>,
    pub error: Option<String>,
}
