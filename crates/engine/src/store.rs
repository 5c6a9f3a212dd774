//! Storage seams.
//!
//! [`DefinitionStore`] is the engine's read-only view of workflow
//! definitions. [`InstanceStore`] holds trigger instances and their
//! execution records; its only write primitive for existing rows is
//! [`InstanceStore::compare_and_swap`], which every claim, step commit,
//! cancellation and reap goes through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Edge, NodeExecutionRecord, NodeTemplate, TriggerInstance, Workflow, WorkflowDefinition};
use crate::StoreError;

#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// One version of a workflow.
    async fn get_workflow(&self, id: Uuid, version: u32) -> Result<Workflow, StoreError>;

    /// The version new trigger instances should pin, if any is active.
    async fn active_version(&self, id: Uuid) -> Result<Option<u32>, StoreError>;

    /// Nodes of a workflow version in declaration order.
    async fn list_nodes(&self, id: Uuid, version: u32) -> Result<Vec<NodeTemplate>, StoreError>;

    /// Edges of a workflow version in declaration order.
    async fn list_edges(&self, id: Uuid, version: u32) -> Result<Vec<Edge>, StoreError>;
}

/// The removal half of the definition store.
#[async_trait]
pub trait WorkflowRemover: Send + Sync {
    /// Remove every version of a workflow.
    ///
    /// The reference check and the removal are one atomic operation: an
    /// instance created concurrently either makes this fail with
    /// [`StoreError::InUse`] or is itself refused.
    async fn remove_workflow(&self, id: Uuid) -> Result<(), StoreError>;
}

/// Fetch a workflow version with its whole graph.
pub async fn load_definition(
    store: &dyn DefinitionStore,
    id: Uuid,
    version: u32,
) -> Result<WorkflowDefinition, StoreError> {
    let workflow = store.get_workflow(id, version).await?;
    let nodes = store.list_nodes(id, version).await?;
    let edges = store.list_edges(id, version).await?;
    Ok(WorkflowDefinition {
        workflow,
        nodes,
        edges,
    })
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn insert_instance(&self, instance: &TriggerInstance) -> Result<(), StoreError>;

    async fn get_instance(&self, id: Uuid) -> Result<TriggerInstance, StoreError>;

    /// Up to `limit` instances claimable at `now`: `pending`, or
    /// `waiting_delay` with `wake_at <= now`. Oldest first.
    async fn find_claimable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TriggerInstance>, StoreError>;

    /// Up to `limit` `running` instances whose lease expired before `now`.
    async fn find_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TriggerInstance>, StoreError>;

    /// Replace the stored instance with `next` if its revision is still
    /// `expected_revision`, appending `record` atomically with the update.
    ///
    /// Returns `Ok(false)` and writes nothing when the revision moved on.
    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        next: &TriggerInstance,
        record: Option<&NodeExecutionRecord>,
    ) -> Result<bool, StoreError>;

    /// Instances referencing `workflow_id` (any version). With `active_only`,
    /// terminal instances are not counted.
    async fn count_instances(&self, workflow_id: Uuid, active_only: bool) -> Result<u64, StoreError>;

    /// Execution records of an instance, oldest first.
    async fn list_records(&self, instance_id: Uuid) -> Result<Vec<NodeExecutionRecord>, StoreError>;
}
