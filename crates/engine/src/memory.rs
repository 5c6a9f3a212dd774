//! In-memory stores.
//!
//! Used by tests and single-process deployments. Every operation takes the
//! table lock for its whole duration, which makes `compare_and_swap` atomic
//! exactly as the Postgres conditional update is.
//!
//! A [`MemoryInstanceStore`] built with [`MemoryInstanceStore::referencing`]
//! also plays the part of the `trigger_instances` foreign key: inserts need
//! the pinned version to exist, and workflow removal is refused while any
//! instance points at it. Both run under the instance table lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::graph::{validate_definition, ValidatedGraph};
use crate::models::{
    Edge, NodeExecutionRecord, NodeTemplate, TriggerInstance, Workflow, WorkflowDefinition,
};
use crate::store::{DefinitionStore, InstanceStore, WorkflowRemover};
use crate::{EngineError, StoreError};

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Workflow versions keyed by workflow id, then version.
#[derive(Default)]
pub struct MemoryDefinitionStore {
    workflows: RwLock<HashMap<Uuid, BTreeMap<u32, WorkflowDefinition>>>,
}

impl MemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and activate a new workflow version, deactivating any older
    /// version of the same workflow.
    ///
    /// # Errors
    /// - [`EngineError::Graph`] if the graph is not well-formed.
    /// - [`EngineError::Validation`] if this version already exists; published
    ///   graphs are never edited in place.
    pub async fn publish(
        &self,
        mut definition: WorkflowDefinition,
    ) -> Result<ValidatedGraph, EngineError> {
        let graph = validate_definition(&definition)?;

        let mut workflows = self.workflows.write().await;
        let versions = workflows.entry(definition.workflow.id).or_default();
        if versions.contains_key(&definition.workflow.version) {
            return Err(EngineError::Validation(format!(
                "workflow {} version {} is already published; create a new version",
                definition.workflow.id, definition.workflow.version
            )));
        }

        for existing in versions.values_mut() {
            existing.workflow.is_active = false;
        }
        definition.workflow.is_active = true;
        versions.insert(definition.workflow.version, definition);

        Ok(graph)
    }

    /// Store a definition as-is, without validation or activation.
    pub async fn insert(&self, definition: WorkflowDefinition) {
        self.workflows
            .write()
            .await
            .entry(definition.workflow.id)
            .or_default()
            .insert(definition.workflow.version, definition);
    }

    async fn remove(&self, id: Uuid) -> bool {
        self.workflows.write().await.remove(&id).is_some()
    }

    async fn with_version<T>(
        &self,
        id: Uuid,
        version: u32,
        f: impl FnOnce(&WorkflowDefinition) -> T + Send,
    ) -> Result<T, StoreError> {
        let workflows = self.workflows.read().await;
        workflows
            .get(&id)
            .and_then(|versions| versions.get(&version))
            .filter(|d| d.workflow.deleted_at.is_none())
            .map(f)
            .ok_or(StoreError::NotFound)
    }
}

#[async_trait]
impl DefinitionStore for MemoryDefinitionStore {
    async fn get_workflow(&self, id: Uuid, version: u32) -> Result<Workflow, StoreError> {
        self.with_version(id, version, |d| d.workflow.clone()).await
    }

    async fn active_version(&self, id: Uuid) -> Result<Option<u32>, StoreError> {
        let workflows = self.workflows.read().await;
        Ok(workflows.get(&id).and_then(|versions| {
            versions
                .values()
                .rev()
                .find(|d| d.workflow.is_usable())
                .map(|d| d.workflow.version)
        }))
    }

    async fn list_nodes(&self, id: Uuid, version: u32) -> Result<Vec<NodeTemplate>, StoreError> {
        self.with_version(id, version, |d| d.nodes.clone()).await
    }

    async fn list_edges(&self, id: Uuid, version: u32) -> Result<Vec<Edge>, StoreError> {
        self.with_version(id, version, |d| d.edges.clone()).await
    }
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tables {
    instances: HashMap<Uuid, TriggerInstance>,
    records: Vec<NodeExecutionRecord>,
}

#[derive(Default)]
pub struct MemoryInstanceStore {
    tables: RwLock<Tables>,
    definitions: Option<Arc<MemoryDefinitionStore>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// An instance store whose rows reference workflows in `definitions`.
    pub fn referencing(definitions: Arc<MemoryDefinitionStore>) -> Self {
        Self {
            tables: RwLock::default(),
            definitions: Some(definitions),
        }
    }
}

/// Removes a workflow only while no trigger instance references it.
///
/// Lock order is instances, then definitions, as in `insert_instance`.
#[async_trait]
impl WorkflowRemover for MemoryInstanceStore {
    async fn remove_workflow(&self, id: Uuid) -> Result<(), StoreError> {
        let Some(definitions) = &self.definitions else {
            return Err(StoreError::NotFound);
        };

        let tables = self.tables.read().await;
        let instances = tables
            .instances
            .values()
            .filter(|i| i.workflow_id == id)
            .count() as u64;
        if instances > 0 {
            return Err(StoreError::InUse { instances });
        }

        if definitions.remove(id).await {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn insert_instance(&self, instance: &TriggerInstance) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(definitions) = &self.definitions {
            definitions
                .get_workflow(instance.workflow_id, instance.workflow_version)
                .await?;
        }
        if tables.instances.contains_key(&instance.id) {
            return Err(StoreError::Corrupt(format!(
                "trigger instance {} already exists",
                instance.id
            )));
        }
        tables.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> Result<TriggerInstance, StoreError> {
        self.tables
            .read()
            .await
            .instances
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn find_claimable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TriggerInstance>, StoreError> {
        use crate::models::InstanceStatus::{Pending, WaitingDelay};

        let tables = self.tables.read().await;
        let mut due: Vec<&TriggerInstance> = tables
            .instances
            .values()
            .filter(|i| match i.status {
                Pending => true,
                WaitingDelay => i.wake_at.is_some_and(|at| at <= now),
                _ => false,
            })
            .collect();
        due.sort_by_key(|i| (i.wake_at.unwrap_or(i.created_at), i.created_at));
        Ok(due.into_iter().take(limit).cloned().collect())
    }

    async fn find_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TriggerInstance>, StoreError> {
        use crate::models::InstanceStatus::Running;

        let tables = self.tables.read().await;
        let mut expired: Vec<&TriggerInstance> = tables
            .instances
            .values()
            .filter(|i| {
                i.status == Running
                    && i.claim.as_ref().is_some_and(|c| c.lease_expires_at < now)
            })
            .collect();
        expired.sort_by_key(|i| i.claim.as_ref().map(|c| c.lease_expires_at));
        Ok(expired.into_iter().take(limit).cloned().collect())
    }

    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        next: &TriggerInstance,
        record: Option<&NodeExecutionRecord>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let Some(current) = tables.instances.get_mut(&next.id) else {
            return Err(StoreError::NotFound);
        };
        if current.revision != expected_revision {
            return Ok(false);
        }

        *current = next.clone();
        if let Some(record) = record {
            tables.records.push(record.clone());
        }
        Ok(true)
    }

    async fn count_instances(&self, workflow_id: Uuid, active_only: bool) -> Result<u64, StoreError> {
        let tables = self.tables.read().await;
        let count = tables
            .instances
            .values()
            .filter(|i| i.workflow_id == workflow_id)
            .filter(|i| !active_only || i.status.is_active())
            .count();
        Ok(count as u64)
    }

    async fn list_records(&self, instance_id: Uuid) -> Result<Vec<NodeExecutionRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .records
            .iter()
            .filter(|r| r.trigger_instance_id == instance_id)
            .cloned()
            .collect())
    }
}
