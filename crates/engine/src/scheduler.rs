//! Execution scheduler.
//!
//! `ExecutionScheduler` drives claimed trigger instances through their
//! workflow graph one node at a time:
//! 1. `claim_due` takes ownership of a due instance with a conditional update
//!    on its revision and a time-bounded lease.
//! 2. `step` executes the current node (dispatch or delay) and computes the
//!    next instance state plus at most one execution record.
//! 3. `report_step` commits that state and record together, or reports the
//!    step as aborted when the instance changed underneath it.
//!
//! Dispatch is at-least-once; the state commit is exactly-once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use channels::{Channel, ChannelAdapter, DispatchKey, DispatchRequest};

use crate::clock::{Clock, SystemClock};
use crate::condition::{select_next, NextNode};
use crate::config::{to_chrono, EngineConfig};
use crate::delay::parse_delay;
use crate::models::{
    Claim, ExecutionOutcome, InstanceStatus, NodeExecutionRecord, NodeTemplate, TriggerInstance,
    WorkflowDefinition,
};
use crate::render::render;
use crate::store::{load_definition, DefinitionStore, InstanceStore};
use crate::{EngineError, GraphError, StoreError};

// ---------------------------------------------------------------------------
// Channel registry
// ---------------------------------------------------------------------------

/// Maps each delivery channel to the adapter that sends on it.
pub type ChannelRegistry = HashMap<Channel, Arc<dyn ChannelAdapter>>;

/// Build a registry keyed by each adapter's own channel. Later adapters win.
pub fn channel_registry(
    adapters: impl IntoIterator<Item = Arc<dyn ChannelAdapter>>,
) -> ChannelRegistry {
    adapters.into_iter().map(|a| (a.channel(), a)).collect()
}

// ---------------------------------------------------------------------------
// Step types
// ---------------------------------------------------------------------------

/// An instance this worker owns, as it was when the claim committed.
#[derive(Debug, Clone)]
pub struct ClaimedInstance {
    pub instance: TriggerInstance,
    pub token: Uuid,
}

/// The state change one step wants to commit.
#[derive(Debug, Clone)]
pub struct Transition {
    /// Revision the instance had when the step started.
    pub expected_revision: u64,
    pub next: TriggerInstance,
    pub record: Option<NodeExecutionRecord>,
}

/// Result of [`ExecutionScheduler::step`].
#[derive(Debug, Clone)]
pub enum StepReport {
    /// The instance was no longer ours before anything was dispatched.
    Aborted { instance_id: Uuid },
    Commit(Transition),
}

/// Result of [`ExecutionScheduler::report_step`].
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Committed(TriggerInstance),
    /// The revision moved on (cancelled or reaped); nothing was written.
    Aborted,
}

/// What one [`ExecutionScheduler::run_once`] call achieved.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Nothing was due.
    Idle,
    /// The claimed instance suspended or finished; this is its final state.
    Settled(TriggerInstance),
    /// The claimed instance was taken away mid-run.
    Aborted { instance_id: Uuid },
}

// ---------------------------------------------------------------------------
// ExecutionScheduler
// ---------------------------------------------------------------------------

pub struct ExecutionScheduler {
    definitions: Arc<dyn DefinitionStore>,
    instances: Arc<dyn InstanceStore>,
    channels: ChannelRegistry,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    /// Published versions never change, so loaded graphs are kept for the
    /// life of the scheduler.
    cache: RwLock<HashMap<(Uuid, u32), Arc<WorkflowDefinition>>>,
}

impl ExecutionScheduler {
    pub fn new(
        definitions: Arc<dyn DefinitionStore>,
        instances: Arc<dyn InstanceStore>,
        channels: ChannelRegistry,
        config: EngineConfig,
    ) -> Self {
        Self {
            definitions,
            instances,
            channels,
            config,
            clock: Arc::new(SystemClock),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the wall clock used between steps of a run.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Claim one instance that is due at `now`.
    ///
    /// Candidates another worker wins are skipped; `Ok(None)` means nothing
    /// due could be claimed.
    #[instrument(skip(self, lease))]
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<ClaimedInstance>, EngineError> {
        // A batch lost entirely to other workers is re-queried once.
        for _ in 0..2 {
            let candidates = self
                .instances
                .find_claimable(now, self.config.claim_batch)
                .await?;
            if candidates.is_empty() {
                break;
            }
            if let Some(claimed) = self.claim_first(candidates, now, worker_id, lease).await? {
                return Ok(Some(claimed));
            }
        }

        Ok(None)
    }

    async fn claim_first(
        &self,
        candidates: Vec<TriggerInstance>,
        now: DateTime<Utc>,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<ClaimedInstance>, EngineError> {
        for candidate in candidates {
            if !candidate.status.can_transition_to(InstanceStatus::Running) {
                continue;
            }

            let token = Uuid::new_v4();
            let next = TriggerInstance {
                status: InstanceStatus::Running,
                claim: Some(Claim {
                    owner: worker_id.to_owned(),
                    token,
                    lease_expires_at: now + to_chrono(lease),
                }),
                revision: candidate.revision + 1,
                updated_at: now,
                ..candidate.clone()
            };

            if self
                .instances
                .compare_and_swap(candidate.revision, &next, None)
                .await?
            {
                debug!(
                    instance_id = %next.id,
                    node = %next.current_node_id,
                    attempt = next.attempt,
                    "claimed"
                );
                return Ok(Some(ClaimedInstance {
                    instance: next,
                    token,
                }));
            }
            debug!(instance_id = %candidate.id, "claim lost to another worker");
        }

        Ok(None)
    }

    /// [`claim_due`](Self::claim_due) at the current time.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<ClaimedInstance>, EngineError> {
        self.claim_due(self.clock.now(), worker_id, lease).await
    }

    /// Execute the claimed instance's current node.
    ///
    /// Only store failures are returned as errors. Everything that goes wrong
    /// with the node itself ends in a `failed` transition.
    #[instrument(
        skip(self, claimed),
        fields(instance_id = %claimed.instance.id, node = %claimed.instance.current_node_id)
    )]
    pub async fn step(
        &self,
        claimed: &ClaimedInstance,
        now: DateTime<Utc>,
    ) -> Result<StepReport, EngineError> {
        let instance = &claimed.instance;

        let definition = match self
            .definition(instance.workflow_id, instance.workflow_version)
            .await
        {
            Ok(definition) => definition,
            Err(StoreError::NotFound) => {
                let message = format!(
                    "workflow {} version {} no longer exists",
                    instance.workflow_id, instance.workflow_version
                );
                return self.fail(instance, now, None, message);
            }
            Err(e) => return Err(e.into()),
        };

        let Some(node) = definition.node(&instance.current_node_id) else {
            let message = format!("node '{}' is not defined", instance.current_node_id);
            return self.fail(instance, now, None, message);
        };

        match node.node_type.channel() {
            None => self.step_delay(instance, &definition, node, now),
            Some(channel) => {
                self.step_dispatch(claimed, &definition, node, channel, now)
                    .await
            }
        }
    }

    /// Commit a step. The instance update and its record land together or
    /// not at all.
    pub async fn report_step(&self, report: &StepReport) -> Result<StepOutcome, EngineError> {
        let transition = match report {
            StepReport::Aborted { instance_id } => {
                info!(instance_id = %instance_id, "step aborted before dispatch");
                return Ok(StepOutcome::Aborted);
            }
            StepReport::Commit(transition) => transition,
        };

        let committed = self
            .instances
            .compare_and_swap(
                transition.expected_revision,
                &transition.next,
                transition.record.as_ref(),
            )
            .await?;

        if !committed {
            info!(
                instance_id = %transition.next.id,
                "instance changed during the step; result discarded"
            );
            return Ok(StepOutcome::Aborted);
        }

        let next = &transition.next;
        match next.status {
            InstanceStatus::Failed => warn!(
                instance_id = %next.id,
                node = %next.current_node_id,
                error = next.last_error.as_deref().unwrap_or(""),
                "trigger instance failed"
            ),
            InstanceStatus::Completed => info!(instance_id = %next.id, "trigger instance completed"),
            status => debug!(instance_id = %next.id, %status, node = %next.current_node_id, "step committed"),
        }
        Ok(StepOutcome::Committed(transition.next.clone()))
    }

    /// Claim one due instance at `now` and step it until it suspends,
    /// finishes or is taken away.
    ///
    /// `now` is the claim time. Each later step runs at `now` plus the time
    /// the scheduler's clock says has passed since the claim, so the lease is
    /// renewed from the moment each node commits.
    pub async fn run_due(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
    ) -> Result<RunOutcome, EngineError> {
        let Some(mut claimed) = self.claim_due(now, worker_id, self.config.lease).await? else {
            return Ok(RunOutcome::Idle);
        };
        let claimed_at = self.clock.now();

        loop {
            let report = self
                .step(&claimed, now + self.elapsed_since(claimed_at))
                .await?;
            match self.report_step(&report).await? {
                StepOutcome::Aborted => {
                    return Ok(RunOutcome::Aborted {
                        instance_id: claimed.instance.id,
                    })
                }
                StepOutcome::Committed(instance) if instance.is_claimed_by(claimed.token) => {
                    claimed.instance = instance;
                }
                StepOutcome::Committed(instance) => return Ok(RunOutcome::Settled(instance)),
            }
        }
    }

    /// [`run_due`](Self::run_due) at the current time.
    pub async fn run_once(&self, worker_id: &str) -> Result<RunOutcome, EngineError> {
        self.run_due(self.clock.now(), worker_id).await
    }

    // -----------------------------------------------------------------------
    // Internal: node handlers
    // -----------------------------------------------------------------------

    /// A delay node runs twice: once to arm the timer, once after waking.
    fn step_delay(
        &self,
        instance: &TriggerInstance,
        definition: &WorkflowDefinition,
        node: &NodeTemplate,
        now: DateTime<Utc>,
    ) -> Result<StepReport, EngineError> {
        if instance.wake_at.is_some() {
            return self.advance(instance, definition, None, now);
        }

        let duration = render(&node.template_body, &instance.context)
            .map_err(|e| e.to_string())
            .and_then(|payload| {
                parse_delay(&payload.body).map_err(|e| {
                    GraphError::InvalidDelay {
                        node_id: node.id.clone(),
                        message: e.reason,
                    }
                    .to_string()
                })
            });

        let duration = match duration {
            Ok(duration) => duration,
            Err(message) => {
                let record = self.record(instance, now, ExecutionOutcome::Failed, None, Some(message.clone()));
                return self.fail(instance, now, Some(record), message);
            }
        };

        let wake_at = now + duration;
        let record = self.record(instance, now, ExecutionOutcome::Delayed, None, None);
        let next = TriggerInstance {
            wake_at: Some(wake_at),
            claim: None,
            ..transition(instance, InstanceStatus::WaitingDelay, now)?
        };

        debug!(%wake_at, "delay armed");
        Ok(commit(instance, next, Some(record)))
    }

    async fn step_dispatch(
        &self,
        claimed: &ClaimedInstance,
        definition: &WorkflowDefinition,
        node: &NodeTemplate,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<StepReport, EngineError> {
        // A retry wakes with wake_at still set; it has served its purpose.
        let instance = &TriggerInstance {
            wake_at: None,
            ..claimed.instance.clone()
        };
        let max_retries = self.config.max_retries;

        if instance.attempt > max_retries {
            let message = format!("gave up after {max_retries} attempt(s)");
            let record = self.record(instance, now, ExecutionOutcome::Failed, None, Some(message.clone()));
            return self.fail(instance, now, Some(record), message);
        }

        let payload = match render(&node.template_body, &instance.context) {
            Ok(payload) => payload,
            Err(e) => {
                let record = self.record(instance, now, ExecutionOutcome::Failed, None, Some(e.to_string()));
                return self.fail(instance, now, Some(record), e.to_string());
            }
        };

        let Some(adapter) = self.channels.get(&channel) else {
            let message = EngineError::NoChannelAdapter(node.node_type).to_string();
            let record = self.record(
                instance,
                now,
                ExecutionOutcome::Failed,
                Some(payload.digest),
                Some(message.clone()),
            );
            return self.fail(instance, now, Some(record), message);
        };

        // Last chance to notice a cancel or a reap before the side effect.
        let current = self.instances.get_instance(instance.id).await?;
        if current.revision != claimed.instance.revision || !current.is_claimed_by(claimed.token) {
            return Ok(StepReport::Aborted {
                instance_id: instance.id,
            });
        }

        let request = DispatchRequest {
            key: DispatchKey {
                trigger_instance_id: instance.id,
                node_id: node.id.clone(),
                attempt_number: instance.attempt,
            },
            workflow_id: instance.workflow_id,
            channel,
            payload: payload.body,
            context: instance.context.clone(),
        };

        let started_at = now;
        let dispatched_at = self.clock.now();
        let result = adapter.dispatch(&request).await;
        // Transitions after the side effect are stamped with the time it returned.
        let now = now + self.elapsed_since(dispatched_at);

        match result {
            Ok(receipt) => {
                debug!(message_id = %receipt.message_id, duplicate = receipt.duplicate, "dispatched");
                let record = self.record(
                    instance,
                    started_at,
                    ExecutionOutcome::Dispatched,
                    Some(payload.digest),
                    None,
                );
                self.advance(instance, definition, Some(record), now)
            }

            Err(e) if e.is_retryable() && instance.attempt < max_retries => {
                let wake_at = now + self.config.backoff(instance.attempt);
                warn!(
                    attempt = instance.attempt,
                    max_retries,
                    %wake_at,
                    "dispatch failed, retry scheduled: {e}"
                );
                let record = self.record(
                    instance,
                    started_at,
                    ExecutionOutcome::Retried,
                    Some(payload.digest),
                    Some(e.to_string()),
                );
                let next = TriggerInstance {
                    wake_at: Some(wake_at),
                    claim: None,
                    attempt: instance.attempt + 1,
                    last_error: Some(e.to_string()),
                    ..transition(instance, InstanceStatus::WaitingDelay, now)?
                };
                Ok(commit(instance, next, Some(record)))
            }

            Err(e) => {
                error!(attempt = instance.attempt, "dispatch failed permanently: {e}");
                let message = if e.is_retryable() {
                    format!("gave up after {} attempt(s): {e}", instance.attempt)
                } else {
                    e.to_string()
                };
                let record = self.record(
                    instance,
                    started_at,
                    ExecutionOutcome::Failed,
                    Some(payload.digest),
                    Some(message.clone()),
                );
                self.fail(instance, now, Some(record), message)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internal: transitions
    // -----------------------------------------------------------------------

    /// Follow the outgoing edge chosen by the context.
    fn advance(
        &self,
        instance: &TriggerInstance,
        definition: &WorkflowDefinition,
        record: Option<NodeExecutionRecord>,
        now: DateTime<Utc>,
    ) -> Result<StepReport, EngineError> {
        match select_next(&definition.edges, &instance.current_node_id, &instance.context) {
            NextNode::Terminal => {
                let next = TriggerInstance {
                    wake_at: None,
                    claim: None,
                    ..transition(instance, InstanceStatus::Completed, now)?
                };
                Ok(commit(instance, next, record))
            }
            NextNode::Next(node_id) => {
                let lease_expires_at = now + self.config.lease_duration();
                let next = TriggerInstance {
                    current_node_id: node_id.to_owned(),
                    attempt: 1,
                    wake_at: None,
                    claim: instance.claim.clone().map(|claim| Claim {
                        lease_expires_at,
                        ..claim
                    }),
                    ..transition(instance, InstanceStatus::Running, now)?
                };
                Ok(commit(instance, next, record))
            }
            NextNode::NoMatch => {
                let message = GraphError::NoMatchingEdge {
                    node_id: instance.current_node_id.clone(),
                }
                .to_string();
                self.fail(instance, now, record, message)
            }
        }
    }

    fn fail(
        &self,
        instance: &TriggerInstance,
        now: DateTime<Utc>,
        record: Option<NodeExecutionRecord>,
        message: String,
    ) -> Result<StepReport, EngineError> {
        let next = TriggerInstance {
            wake_at: None,
            claim: None,
            last_error: Some(message),
            ..transition(instance, InstanceStatus::Failed, now)?
        };
        Ok(commit(instance, next, record))
    }

    fn elapsed_since(&self, mark: DateTime<Utc>) -> chrono::Duration {
        (self.clock.now() - mark).max(chrono::Duration::zero())
    }

    fn record(
        &self,
        instance: &TriggerInstance,
        started_at: DateTime<Utc>,
        outcome: ExecutionOutcome,
        rendered_payload_ref: Option<String>,
        error: Option<String>,
    ) -> NodeExecutionRecord {
        NodeExecutionRecord {
            id: Uuid::new_v4(),
            trigger_instance_id: instance.id,
            node_id: instance.current_node_id.clone(),
            attempt_number: instance.attempt,
            started_at,
            finished_at: self.clock.now().max(started_at),
            outcome,
            rendered_payload_ref,
            error,
        }
    }

    async fn definition(
        &self,
        id: Uuid,
        version: u32,
    ) -> Result<Arc<WorkflowDefinition>, StoreError> {
        if let Some(hit) = self.cache.read().await.get(&(id, version)) {
            return Ok(Arc::clone(hit));
        }

        let loaded = Arc::new(load_definition(self.definitions.as_ref(), id, version).await?);
        self.cache
            .write()
            .await
            .insert((id, version), Arc::clone(&loaded));
        Ok(loaded)
    }
}

/// `instance` moved to `status`, with the revision bumped.
fn transition(
    instance: &TriggerInstance,
    status: InstanceStatus,
    now: DateTime<Utc>,
) -> Result<TriggerInstance, EngineError> {
    if !instance.status.can_transition_to(status) {
        return Err(EngineError::InvalidTransition {
            from: instance.status,
            to: status,
        });
    }
    Ok(TriggerInstance {
        status,
        revision: instance.revision + 1,
        updated_at: now,
        ..instance.clone()
    })
}

fn commit(
    instance: &TriggerInstance,
    next: TriggerInstance,
    record: Option<NodeExecutionRecord>,
) -> StepReport {
    StepReport::Commit(Transition {
        expected_revision: instance.revision,
        next,
        record,
    })
}
