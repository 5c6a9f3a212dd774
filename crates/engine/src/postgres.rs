//! Postgres-backed stores: domain types on one side, `db` rows on the other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use db::models::{EdgeRow, NodeExecutionRow, NodeTemplateRow, TriggerInstanceRow, WorkflowRow};
use db::repository::{executions as exec_repo, instances as instance_repo, workflows as wf_repo};
use db::DbPool;

use crate::models::{
    Claim, Edge, NodeExecutionRecord, NodeTemplate, TriggerInstance, Workflow,
};
use crate::store::{DefinitionStore, InstanceStore, WorkflowRemover};
use crate::StoreError;

/// Both store traits over one connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

fn corrupt(what: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{what}: {err}"))
}

fn to_u32(value: i32, what: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|e| corrupt(what, e))
}

fn to_i32(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|e| corrupt("value exceeds column range", e))
}

// ---------------------------------------------------------------------------
// Row conversions
// ---------------------------------------------------------------------------

fn workflow_from_row(row: WorkflowRow) -> Result<Workflow, StoreError> {
    Ok(Workflow {
        id: row.id,
        code: row.code,
        name: row.name,
        is_active: row.is_active,
        entry_node_id: row.entry_node_id,
        version: to_u32(row.version, "workflow version")?,
        deleted_at: row.deleted_at,
        created_at: row.created_at,
    })
}

fn node_from_row(row: NodeTemplateRow) -> Result<NodeTemplate, StoreError> {
    Ok(NodeTemplate {
        node_type: row.node_type.parse().map_err(|e: String| corrupt("node_type", e))?,
        id: row.id,
        code: row.code,
        name: row.name,
        template_body: row.template_body,
    })
}

fn edge_from_row(row: EdgeRow) -> Result<Edge, StoreError> {
    let condition = row
        .condition
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| corrupt("edge condition", e))?;
    Ok(Edge {
        from_node_id: row.from_node_id,
        to_node_id: row.to_node_id,
        condition,
    })
}

fn instance_from_row(row: TriggerInstanceRow) -> Result<TriggerInstance, StoreError> {
    let claim = match (row.owner, row.claim_token, row.lease_expires_at) {
        (Some(owner), Some(token), Some(lease_expires_at)) => Some(Claim {
            owner,
            token,
            lease_expires_at,
        }),
        (None, None, None) => None,
        _ => return Err(StoreError::Corrupt(format!("instance {} has a partial claim", row.id))),
    };

    Ok(TriggerInstance {
        id: row.id,
        workflow_id: row.workflow_id,
        workflow_version: to_u32(row.workflow_version, "workflow_version")?,
        context: row.context,
        current_node_id: row.current_node_id,
        status: row.status.parse().map_err(|e: String| corrupt("status", e))?,
        attempt: to_u32(row.attempt, "attempt")?,
        wake_at: row.wake_at,
        claim,
        last_error: row.last_error,
        revision: u64::try_from(row.revision).map_err(|e| corrupt("revision", e))?,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

fn instance_to_row(instance: &TriggerInstance) -> Result<TriggerInstanceRow, StoreError> {
    Ok(TriggerInstanceRow {
        id: instance.id,
        workflow_id: instance.workflow_id,
        workflow_version: to_i32(instance.workflow_version)?,
        context: instance.context.clone(),
        current_node_id: instance.current_node_id.clone(),
        status: instance.status.to_string(),
        attempt: to_i32(instance.attempt)?,
        wake_at: instance.wake_at,
        owner: instance.claim.as_ref().map(|c| c.owner.clone()),
        claim_token: instance.claim.as_ref().map(|c| c.token),
        lease_expires_at: instance.claim.as_ref().map(|c| c.lease_expires_at),
        last_error: instance.last_error.clone(),
        revision: i64::try_from(instance.revision).map_err(|e| corrupt("revision", e))?,
        created_at: instance.created_at,
        updated_at: instance.updated_at,
    })
}

fn record_from_row(row: NodeExecutionRow) -> Result<NodeExecutionRecord, StoreError> {
    Ok(NodeExecutionRecord {
        id: row.id,
        trigger_instance_id: row.trigger_instance_id,
        node_id: row.node_id,
        attempt_number: to_u32(row.attempt_number, "attempt_number")?,
        started_at: row.started_at,
        finished_at: row.finished_at,
        outcome: row.outcome.parse().map_err(|e: String| corrupt("outcome", e))?,
        rendered_payload_ref: row.rendered_payload_ref,
        error: row.error,
    })
}

fn record_to_row(record: &NodeExecutionRecord) -> Result<NodeExecutionRow, StoreError> {
    Ok(NodeExecutionRow {
        id: record.id,
        trigger_instance_id: record.trigger_instance_id,
        node_id: record.node_id.clone(),
        attempt_number: to_i32(record.attempt_number)?,
        started_at: record.started_at,
        finished_at: record.finished_at,
        outcome: record.outcome.to_string(),
        rendered_payload_ref: record.rendered_payload_ref.clone(),
        error: record.error.clone(),
    })
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// Trait impls
// ---------------------------------------------------------------------------

#[async_trait]
impl DefinitionStore for PgStore {
    async fn get_workflow(&self, id: Uuid, version: u32) -> Result<Workflow, StoreError> {
        let row = wf_repo::get_workflow(&self.pool, id, to_i32(version)?).await?;
        workflow_from_row(row)
    }

    async fn active_version(&self, id: Uuid) -> Result<Option<u32>, StoreError> {
        wf_repo::active_version(&self.pool, id)
            .await?
            .map(|v| to_u32(v, "workflow version"))
            .transpose()
    }

    async fn list_nodes(&self, id: Uuid, version: u32) -> Result<Vec<NodeTemplate>, StoreError> {
        wf_repo::list_nodes(&self.pool, id, to_i32(version)?)
            .await?
            .into_iter()
            .map(node_from_row)
            .collect()
    }

    async fn list_edges(&self, id: Uuid, version: u32) -> Result<Vec<Edge>, StoreError> {
        wf_repo::list_edges(&self.pool, id, to_i32(version)?)
            .await?
            .into_iter()
            .map(edge_from_row)
            .collect()
    }
}

#[async_trait]
impl WorkflowRemover for PgStore {
    async fn remove_workflow(&self, id: Uuid) -> Result<(), StoreError> {
        wf_repo::delete_workflow(&self.pool, id).await?;
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for PgStore {
    async fn insert_instance(&self, instance: &TriggerInstance) -> Result<(), StoreError> {
        instance_repo::insert_instance(&self.pool, &instance_to_row(instance)?).await?;
        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> Result<TriggerInstance, StoreError> {
        instance_from_row(instance_repo::get_instance(&self.pool, id).await?)
    }

    async fn find_claimable(
        &self,
        now: DateTime<Utc>,
        n: usize,
    ) -> Result<Vec<TriggerInstance>, StoreError> {
        instance_repo::find_claimable(&self.pool, now, limit(n))
            .await?
            .into_iter()
            .map(instance_from_row)
            .collect()
    }

    async fn find_expired_leases(
        &self,
        now: DateTime<Utc>,
        n: usize,
    ) -> Result<Vec<TriggerInstance>, StoreError> {
        instance_repo::find_expired_leases(&self.pool, now, limit(n))
            .await?
            .into_iter()
            .map(instance_from_row)
            .collect()
    }

    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        next: &TriggerInstance,
        record: Option<&NodeExecutionRecord>,
    ) -> Result<bool, StoreError> {
        let expected = i64::try_from(expected_revision).map_err(|e| corrupt("revision", e))?;
        let row = instance_to_row(next)?;
        let record_row = record.map(record_to_row).transpose()?;
        let swapped =
            instance_repo::compare_and_swap(&self.pool, expected, &row, record_row.as_ref()).await?;
        Ok(swapped)
    }

    async fn count_instances(&self, workflow_id: Uuid, active_only: bool) -> Result<u64, StoreError> {
        let count = instance_repo::count_instances(&self.pool, workflow_id, active_only).await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn list_records(&self, instance_id: Uuid) -> Result<Vec<NodeExecutionRecord>, StoreError> {
        exec_repo::list_node_executions(&self.pool, instance_id)
            .await?
            .into_iter()
            .map(record_from_row)
            .collect()
    }
}
