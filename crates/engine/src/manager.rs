//! Trigger instance lifecycle outside of execution: creation, cancellation,
//! lookups, the workflow delete guard and lease reaping.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::models::{InstanceStatus, NodeExecutionRecord, TriggerInstance};
use crate::render::{lookup, required_variables};
use crate::store::{load_definition, DefinitionStore, InstanceStore};
use crate::{EngineError, StoreError};

/// Which deletion the caller is about to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionKind {
    /// Deactivate or soft-delete. Finished instances may keep pointing at
    /// the workflow.
    Soft,
    /// Remove the rows. No instance may reference the workflow.
    Hard,
}

pub struct TriggerInstanceManager {
    definitions: Arc<dyn DefinitionStore>,
    instances: Arc<dyn InstanceStore>,
    config: EngineConfig,
}

impl TriggerInstanceManager {
    pub fn new(
        definitions: Arc<dyn DefinitionStore>,
        instances: Arc<dyn InstanceStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            definitions,
            instances,
            config,
        }
    }

    /// Start a new execution of the active version of `workflow_id`.
    ///
    /// # Errors
    /// - [`EngineError::NotFound`] when the workflow has no active version.
    /// - [`EngineError::Validation`] when `context` is not a JSON object or
    ///   lacks a variable the entry node's template requires.
    #[instrument(skip(self, context), fields(workflow_id = %workflow_id))]
    pub async fn create_trigger_instance(
        &self,
        workflow_id: Uuid,
        context: Value,
    ) -> Result<TriggerInstance, EngineError> {
        if !context.is_object() {
            return Err(EngineError::Validation(
                "trigger context must be a JSON object".into(),
            ));
        }

        let not_found = || EngineError::NotFound(format!("active version of workflow {workflow_id}"));
        let version = self
            .definitions
            .active_version(workflow_id)
            .await?
            .ok_or_else(not_found)?;

        let definition = match load_definition(self.definitions.as_ref(), workflow_id, version).await {
            Ok(definition) => definition,
            Err(StoreError::NotFound) => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };
        if !definition.workflow.is_usable() {
            return Err(not_found());
        }

        let entry = definition.entry_node().ok_or_else(|| {
            EngineError::Validation(format!(
                "entry node '{}' of workflow {workflow_id} is not defined",
                definition.workflow.entry_node_id
            ))
        })?;

        let required = required_variables(&entry.template_body)
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        let missing: Vec<String> = required
            .into_iter()
            .filter(|path| lookup(&context, path).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::Validation(format!(
                "context is missing required variable(s): {}",
                missing.join(", ")
            )));
        }

        let instance = TriggerInstance::new(&definition.workflow, context, Utc::now());
        self.instances.insert_instance(&instance).await?;

        info!(
            instance_id = %instance.id,
            version,
            entry = %instance.current_node_id,
            "trigger instance created"
        );
        Ok(instance)
    }

    /// Move an instance to `cancelled`. Cancelling twice is a no-op.
    ///
    /// # Errors
    /// [`EngineError::InvalidTransition`] when the instance already completed
    /// or failed.
    #[instrument(skip(self), fields(instance_id = %id))]
    pub async fn cancel_trigger_instance(&self, id: Uuid) -> Result<TriggerInstance, EngineError> {
        loop {
            let current = self.get_trigger_instance(id).await?;
            if current.status == InstanceStatus::Cancelled {
                return Ok(current);
            }
            if !current.status.can_transition_to(InstanceStatus::Cancelled) {
                return Err(EngineError::InvalidTransition {
                    from: current.status,
                    to: InstanceStatus::Cancelled,
                });
            }

            let now = Utc::now();
            let next = TriggerInstance {
                status: InstanceStatus::Cancelled,
                claim: None,
                wake_at: None,
                revision: current.revision + 1,
                updated_at: now,
                ..current.clone()
            };

            if self
                .instances
                .compare_and_swap(current.revision, &next, None)
                .await?
            {
                info!(from = %current.status, "trigger instance cancelled");
                return Ok(next);
            }
            debug!("instance changed while cancelling; re-reading");
        }
    }

    pub async fn get_trigger_instance(&self, id: Uuid) -> Result<TriggerInstance, EngineError> {
        self.instances.get_instance(id).await.map_err(|e| match e {
            StoreError::NotFound => EngineError::NotFound(format!("trigger instance {id}")),
            other => other.into(),
        })
    }

    /// Audit trail of an instance, oldest first.
    pub async fn list_execution_records(
        &self,
        id: Uuid,
    ) -> Result<Vec<NodeExecutionRecord>, EngineError> {
        // Surfaces NotFound for unknown ids rather than an empty list.
        self.get_trigger_instance(id).await?;
        Ok(self.instances.list_records(id).await?)
    }

    /// Whether any non-terminal instance references the workflow.
    pub async fn has_active_instances(&self, workflow_id: Uuid) -> Result<bool, EngineError> {
        Ok(self.instances.count_instances(workflow_id, true).await? > 0)
    }

    /// The delete guard. Every deletion path calls this before touching the
    /// workflow.
    ///
    /// # Errors
    /// [`EngineError::WorkflowInUse`] when instances still depend on it.
    #[instrument(skip(self), fields(workflow_id = %workflow_id))]
    pub async fn ensure_deletable(
        &self,
        workflow_id: Uuid,
        kind: DeletionKind,
    ) -> Result<(), EngineError> {
        let active_only = kind == DeletionKind::Soft;
        let instances = self
            .instances
            .count_instances(workflow_id, active_only)
            .await?;
        if instances > 0 {
            warn!(instances, ?kind, "workflow deletion refused");
            return Err(EngineError::WorkflowInUse {
                workflow_id,
                instances,
            });
        }
        Ok(())
    }

    /// Return `running` instances whose lease expired before `now` to
    /// `pending`. The attempt number is bumped so a re-dispatch carries a new
    /// dispatch key.
    ///
    /// Returns how many instances were reaped.
    #[instrument(skip(self))]
    pub async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let expired = self
            .instances
            .find_expired_leases(now, self.config.claim_batch)
            .await?;

        let mut reaped = 0;
        for instance in expired {
            if !instance.status.can_transition_to(InstanceStatus::Pending) {
                continue;
            }
            let owner = instance.claim.as_ref().map(|c| c.owner.clone());
            let next = TriggerInstance {
                status: InstanceStatus::Pending,
                claim: None,
                attempt: instance.attempt + 1,
                revision: instance.revision + 1,
                updated_at: now,
                ..instance.clone()
            };

            if self
                .instances
                .compare_and_swap(instance.revision, &next, None)
                .await?
            {
                warn!(
                    instance_id = %instance.id,
                    owner = owner.as_deref().unwrap_or("?"),
                    node = %instance.current_node_id,
                    "lease expired; instance returned to pending"
                );
                reaped += 1;
            } else {
                debug!(instance_id = %instance.id, "instance moved on before it could be reaped");
            }
        }
        Ok(reaped)
    }
}
