//! End-to-end scheduler tests.
//!
//! Everything runs against the in-memory stores and `MockChannel`, so no
//! Postgres connection is required. Time is passed in explicitly: each test
//! picks `t0` and moves it forward instead of sleeping. The scheduler's own
//! clock is a `ManualClock`, so steps inside one run only see time pass when
//! a test advances it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use channels::mock::MockChannel;
use channels::{
    Channel, ChannelAdapter, DispatchError, DispatchKey, DispatchReceipt, DispatchRequest,
};

use crate::clock::{Clock, ManualClock};
use crate::config::EngineConfig;
use crate::manager::TriggerInstanceManager;
use crate::memory::{MemoryDefinitionStore, MemoryInstanceStore};
use crate::models::{
    Edge, EdgeCondition, ExecutionOutcome, InstanceStatus, NodeExecutionRecord, NodeTemplate,
    NodeType, TriggerInstance, Workflow, WorkflowDefinition,
};
use crate::scheduler::{channel_registry, ExecutionScheduler, RunOutcome, StepOutcome, StepReport};
use crate::store::InstanceStore;
use crate::StoreError;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn node(id: &str, node_type: NodeType, body: &str) -> NodeTemplate {
    NodeTemplate {
        id: id.into(),
        code: id.into(),
        name: id.into(),
        node_type,
        template_body: body.into(),
    }
}

fn email(id: &str, body: &str) -> NodeTemplate {
    node(id, NodeType::Email, body)
}

fn sms(id: &str, body: &str) -> NodeTemplate {
    node(id, NodeType::Sms, body)
}

fn delay(id: &str, body: &str) -> NodeTemplate {
    node(id, NodeType::Delay, body)
}

fn edge(from: &str, to: &str) -> Edge {
    Edge {
        from_node_id: from.into(),
        to_node_id: to.into(),
        condition: None,
    }
}

fn when(from: &str, to: &str, path: &str, value: Value) -> Edge {
    Edge {
        condition: Some(EdgeCondition::Equals {
            path: path.into(),
            value,
        }),
        ..edge(from, to)
    }
}

fn definition(entry: &str, nodes: Vec<NodeTemplate>, edges: Vec<Edge>) -> WorkflowDefinition {
    WorkflowDefinition {
        workflow: Workflow {
            id: Uuid::new_v4(),
            code: "onboarding".into(),
            name: "Onboarding".into(),
            is_active: false,
            entry_node_id: entry.into(),
            version: 1,
            deleted_at: None,
            created_at: Utc::now(),
        },
        nodes,
        edges,
    }
}

struct Harness {
    definitions: Arc<MemoryDefinitionStore>,
    instances: Arc<MemoryInstanceStore>,
    email: Arc<MockChannel>,
    sms: Arc<MockChannel>,
    scheduler: Arc<ExecutionScheduler>,
    manager: TriggerInstanceManager,
    workflow: Workflow,
}

fn frozen_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc::now()))
}

impl Harness {
    async fn new(def: WorkflowDefinition) -> Self {
        Self::with(
            def,
            MockChannel::delivering(Channel::Email),
            MockChannel::delivering(Channel::Sms),
            EngineConfig::default(),
        )
        .await
    }

    async fn with(
        def: WorkflowDefinition,
        email: MockChannel,
        sms: MockChannel,
        config: EngineConfig,
    ) -> Self {
        let workflow = def.workflow.clone();
        let definitions = Arc::new(MemoryDefinitionStore::new());
        definitions.publish(def).await.expect("fixture graph is valid");

        let instances = Arc::new(MemoryInstanceStore::new());
        let email = Arc::new(email);
        let sms = Arc::new(sms);
        let adapters: Vec<Arc<dyn ChannelAdapter>> = vec![email.clone(), sms.clone()];

        let scheduler = Arc::new(
            ExecutionScheduler::new(
                definitions.clone(),
                instances.clone(),
                channel_registry(adapters),
                config.clone(),
            )
            .with_clock(frozen_clock()),
        );
        let manager = TriggerInstanceManager::new(definitions.clone(), instances.clone(), config);

        Self {
            definitions,
            instances,
            email,
            sms,
            scheduler,
            manager,
            workflow,
        }
    }

    async fn trigger(&self, context: Value) -> TriggerInstance {
        self.manager
            .create_trigger_instance(self.workflow.id, context)
            .await
            .expect("trigger accepted")
    }

    async fn outcomes(&self, id: Uuid) -> Vec<(String, ExecutionOutcome, u32)> {
        self.manager
            .list_execution_records(id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.node_id, r.outcome, r.attempt_number))
            .collect()
    }
}

fn settled(outcome: RunOutcome) -> TriggerInstance {
    match outcome {
        RunOutcome::Settled(instance) => instance,
        other => panic!("expected a settled instance, got {other:?}"),
    }
}

fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

// ============================================================
// Scenarios
// ============================================================

#[tokio::test]
async fn email_delay_sms_runs_to_completion() {
    let h = Harness::new(definition(
        "welcome",
        vec![
            email("welcome", "Hi {{ userName }}"),
            delay("wait", "5s"),
            sms("nudge", "Code {{ code | default: \"none\" }}"),
        ],
        vec![edge("welcome", "wait"), edge("wait", "nudge")],
    ))
    .await;
    let instance = h.trigger(json!({ "userName": "Ada" })).await;
    let t0 = Utc::now();

    let parked = settled(h.scheduler.run_due(t0, "w1").await.unwrap());
    assert_eq!(parked.status, InstanceStatus::WaitingDelay);
    assert_eq!(parked.current_node_id, "wait");
    assert_eq!(parked.wake_at, Some(t0 + secs(5)));
    assert!(parked.claim.is_none());

    assert!(matches!(
        h.scheduler.run_due(t0 + secs(4), "w1").await.unwrap(),
        RunOutcome::Idle
    ));

    let done = settled(h.scheduler.run_due(t0 + secs(6), "w2").await.unwrap());
    assert_eq!(done.status, InstanceStatus::Completed);
    assert_eq!(done.current_node_id, "nudge");

    assert_eq!(
        h.outcomes(instance.id).await,
        vec![
            ("welcome".to_string(), ExecutionOutcome::Dispatched, 1),
            ("wait".to_string(), ExecutionOutcome::Delayed, 1),
            ("nudge".to_string(), ExecutionOutcome::Dispatched, 1),
        ]
    );
    assert_eq!(h.email.requests()[0].payload, "Hi Ada");
    assert_eq!(h.sms.requests()[0].payload, "Code none");
    assert!(!h.manager.has_active_instances(h.workflow.id).await.unwrap());
}

#[tokio::test]
async fn missing_variable_fails_without_dispatch() {
    let def = definition("welcome", vec![email("welcome", "Hi {{ userName }}")], vec![]);
    let h = Harness::new(def.clone()).await;

    // The manager refuses such a context up front, so plant it directly.
    let instance = TriggerInstance::new(&def.workflow, json!({ "email": "a@b.c" }), Utc::now());
    h.instances.insert_instance(&instance).await.unwrap();

    let failed = settled(h.scheduler.run_once("w1").await.unwrap());
    assert_eq!(failed.status, InstanceStatus::Failed);
    assert!(failed.last_error.as_deref().unwrap().contains("userName"));
    assert_eq!(h.email.call_count(), 0);

    let records = h.manager.list_execution_records(instance.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, ExecutionOutcome::Failed);
    assert!(records[0].rendered_payload_ref.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_a_single_winner() {
    let h = Harness::new(definition("welcome", vec![email("welcome", "Hi")], vec![])).await;
    h.trigger(json!({})).await;
    let now = Utc::now();

    let claims: Vec<_> = (0..8)
        .map(|i| {
            let scheduler = h.scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .claim_due(now, &format!("w{i}"), Duration::from_secs(30))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut winners = 0;
    for claim in claims {
        if claim.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn expired_lease_is_reaped_and_reclaimed_with_next_attempt() {
    let h = Harness::new(definition("welcome", vec![email("welcome", "Hi")], vec![])).await;
    let instance = h.trigger(json!({})).await;
    let t0 = Utc::now();
    let lease = Duration::from_secs(30);

    let stale = h.scheduler.claim_due(t0, "w1", lease).await.unwrap().unwrap();
    assert_eq!(stale.instance.attempt, 1);

    assert_eq!(h.manager.reap_expired_leases(t0 + secs(10)).await.unwrap(), 0);
    assert_eq!(h.manager.reap_expired_leases(t0 + secs(31)).await.unwrap(), 1);

    let reaped = h.manager.get_trigger_instance(instance.id).await.unwrap();
    assert_eq!(reaped.status, InstanceStatus::Pending);
    assert!(reaped.claim.is_none());
    assert_eq!(reaped.attempt, 2);

    // The original owner wakes up too late.
    let report = h.scheduler.step(&stale, t0 + secs(32)).await.unwrap();
    assert!(matches!(report, StepReport::Aborted { .. }));
    assert_eq!(h.email.call_count(), 0);

    let fresh = h
        .scheduler
        .claim_due(t0 + secs(32), "w2", lease)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fresh.instance.attempt, 2);

    let report = h.scheduler.step(&fresh, t0 + secs(32)).await.unwrap();
    let outcome = h.scheduler.report_step(&report).await.unwrap();
    assert!(matches!(outcome, StepOutcome::Committed(ref i) if i.status == InstanceStatus::Completed));
    assert_eq!(h.email.requests()[0].key.attempt_number, 2);
}

// ============================================================
// Cancellation
// ============================================================

#[tokio::test]
async fn cancel_before_dispatch_aborts_the_step() {
    let h = Harness::new(definition("welcome", vec![email("welcome", "Hi")], vec![])).await;
    let instance = h.trigger(json!({})).await;
    let now = Utc::now();

    let claimed = h
        .scheduler
        .claim_due(now, "w1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    h.manager.cancel_trigger_instance(instance.id).await.unwrap();

    let report = h.scheduler.step(&claimed, now).await.unwrap();
    assert!(matches!(report, StepReport::Aborted { .. }));
    assert!(matches!(
        h.scheduler.report_step(&report).await.unwrap(),
        StepOutcome::Aborted
    ));
    assert_eq!(h.email.call_count(), 0);
}

#[tokio::test]
async fn cancel_during_step_discards_its_result() {
    let h = Harness::new(definition(
        "wait",
        vec![delay("wait", "1h"), email("after", "Hi")],
        vec![edge("wait", "after")],
    ))
    .await;
    let instance = h.trigger(json!({})).await;
    let now = Utc::now();

    let claimed = h
        .scheduler
        .claim_due(now, "w1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    let report = h.scheduler.step(&claimed, now).await.unwrap();
    h.manager.cancel_trigger_instance(instance.id).await.unwrap();

    assert!(matches!(
        h.scheduler.report_step(&report).await.unwrap(),
        StepOutcome::Aborted
    ));
    let current = h.manager.get_trigger_instance(instance.id).await.unwrap();
    assert_eq!(current.status, InstanceStatus::Cancelled);
    assert!(h.outcomes(instance.id).await.is_empty());
}

#[tokio::test]
async fn completed_instance_cannot_be_cancelled() {
    let h = Harness::new(definition("welcome", vec![email("welcome", "Hi")], vec![])).await;
    let instance = h.trigger(json!({})).await;
    settled(h.scheduler.run_once("w1").await.unwrap());

    let err = h.manager.cancel_trigger_instance(instance.id).await.unwrap_err();
    assert!(matches!(err, crate::EngineError::InvalidTransition { .. }));
}

// ============================================================
// Failures and retries
// ============================================================

#[tokio::test]
async fn transient_failures_back_off_then_succeed() {
    let config = EngineConfig {
        max_retries: 3,
        retry_base_delay: Duration::from_secs(1),
        ..EngineConfig::default()
    };
    let h = Harness::with(
        definition("welcome", vec![email("welcome", "Hi")], vec![]),
        MockChannel::failing_transient(Channel::Email, 2, "smtp timeout"),
        MockChannel::delivering(Channel::Sms),
        config,
    )
    .await;
    let instance = h.trigger(json!({})).await;
    let t0 = Utc::now();

    let first = settled(h.scheduler.run_due(t0, "w1").await.unwrap());
    assert_eq!(first.status, InstanceStatus::WaitingDelay);
    assert_eq!(first.attempt, 2);
    assert_eq!(first.wake_at, Some(t0 + secs(1)));
    assert!(first.last_error.as_deref().unwrap().contains("smtp timeout"));

    let second = settled(h.scheduler.run_due(t0 + secs(1), "w1").await.unwrap());
    assert_eq!(second.attempt, 3);
    assert_eq!(second.wake_at, Some(t0 + secs(3)));

    let done = settled(h.scheduler.run_due(t0 + secs(3), "w1").await.unwrap());
    assert_eq!(done.status, InstanceStatus::Completed);
    assert_eq!(done.wake_at, None);

    assert_eq!(
        h.outcomes(instance.id).await,
        vec![
            ("welcome".to_string(), ExecutionOutcome::Retried, 1),
            ("welcome".to_string(), ExecutionOutcome::Retried, 2),
            ("welcome".to_string(), ExecutionOutcome::Dispatched, 3),
        ]
    );
    assert_eq!(h.email.distinct_keys(), 3);
}

#[tokio::test]
async fn retries_are_bounded() {
    let h = Harness::with(
        definition("welcome", vec![email("welcome", "Hi")], vec![]),
        MockChannel::failing_transient(Channel::Email, usize::MAX, "smtp down"),
        MockChannel::delivering(Channel::Sms),
        EngineConfig::default(),
    )
    .await;
    let instance = h.trigger(json!({})).await;
    let t0 = Utc::now();

    let mut last = None;
    for hour in 0..3 {
        last = Some(settled(h.scheduler.run_due(t0 + secs(3600 * hour), "w1").await.unwrap()));
    }

    let failed = last.unwrap();
    assert_eq!(failed.status, InstanceStatus::Failed);
    assert!(failed.last_error.as_deref().unwrap().contains("gave up after 3"));
    assert_eq!(h.email.call_count(), 3);
    assert_eq!(
        h.outcomes(instance.id).await.last().map(|(_, o, a)| (*o, *a)),
        Some((ExecutionOutcome::Failed, 3))
    );
}

#[tokio::test]
async fn rejected_dispatch_fails_immediately() {
    let h = Harness::with(
        definition("welcome", vec![email("welcome", "Hi")], vec![]),
        MockChannel::rejecting(Channel::Email, "mailbox does not exist"),
        MockChannel::delivering(Channel::Sms),
        EngineConfig::default(),
    )
    .await;
    h.trigger(json!({})).await;

    let failed = settled(h.scheduler.run_once("w1").await.unwrap());
    assert_eq!(failed.status, InstanceStatus::Failed);
    assert_eq!(failed.attempt, 1);
    assert_eq!(h.email.call_count(), 1);
}

#[tokio::test]
async fn unmatched_branch_fails_the_instance() {
    let h = Harness::new(definition(
        "welcome",
        vec![email("welcome", "Hi"), sms("upsell", "Go pro")],
        vec![when("welcome", "upsell", "plan", json!("pro"))],
    ))
    .await;
    let instance = h.trigger(json!({ "plan": "free" })).await;

    let failed = settled(h.scheduler.run_once("w1").await.unwrap());
    assert_eq!(failed.status, InstanceStatus::Failed);
    assert!(failed.last_error.as_deref().unwrap().contains("welcome"));
    assert_eq!(h.sms.call_count(), 0);
    assert_eq!(
        h.outcomes(instance.id).await,
        vec![("welcome".to_string(), ExecutionOutcome::Dispatched, 1)]
    );
}

#[tokio::test]
async fn missing_channel_adapter_fails_the_instance() {
    let def = definition("welcome", vec![email("welcome", "Hi")], vec![]);
    let definitions = Arc::new(MemoryDefinitionStore::new());
    definitions.publish(def.clone()).await.unwrap();
    let instances = Arc::new(MemoryInstanceStore::new());
    let scheduler = ExecutionScheduler::new(
        definitions.clone(),
        instances.clone(),
        channel_registry(Vec::new()),
        EngineConfig::default(),
    );
    let manager = TriggerInstanceManager::new(definitions, instances, EngineConfig::default());
    manager.create_trigger_instance(def.workflow.id, json!({})).await.unwrap();

    let failed = settled(scheduler.run_once("w1").await.unwrap());
    assert_eq!(failed.status, InstanceStatus::Failed);
    assert!(failed.last_error.as_deref().unwrap().contains("email"));
}

// ============================================================
// Routing and versioning
// ============================================================

#[tokio::test]
async fn first_matching_branch_is_taken() {
    let h = Harness::new(definition(
        "welcome",
        vec![
            email("welcome", "Hi"),
            sms("pro", "Thanks for going pro"),
            sms("basic", "Try pro"),
        ],
        vec![
            edge("welcome", "basic"),
            when("welcome", "pro", "plan", json!("pro")),
        ],
    ))
    .await;
    h.trigger(json!({ "plan": "pro" })).await;

    let done = settled(h.scheduler.run_once("w1").await.unwrap());
    assert_eq!(done.status, InstanceStatus::Completed);
    assert_eq!(done.current_node_id, "pro");
    assert_eq!(h.sms.requests()[0].payload, "Thanks for going pro");
}

#[tokio::test]
async fn instances_keep_their_pinned_version() {
    let v1 = definition("welcome", vec![email("welcome", "v1")], vec![]);
    let h = Harness::new(v1.clone()).await;
    let instance = h.trigger(json!({})).await;

    let mut v2 = v1;
    v2.workflow.version = 2;
    v2.nodes[0].template_body = "v2".into();
    h.definitions.publish(v2).await.unwrap();

    settled(h.scheduler.run_once("w1").await.unwrap());
    assert_eq!(h.email.requests()[0].payload, "v1");
    assert_eq!(
        h.manager.get_trigger_instance(instance.id).await.unwrap().workflow_version,
        1
    );
    assert_eq!(h.trigger(json!({})).await.workflow_version, 2);
}

#[tokio::test]
async fn execution_terminates_within_retry_budget() {
    let config = EngineConfig::default();
    let nodes = vec![email("a", "A"), email("b", "B"), email("c", "C")];
    let budget = config.max_retries as usize * nodes.len();
    let h = Harness::with(
        definition("a", nodes, vec![edge("a", "b"), edge("b", "c")]),
        MockChannel::failing_transient(Channel::Email, 2, "flaky"),
        MockChannel::delivering(Channel::Sms),
        config,
    )
    .await;
    let instance = h.trigger(json!({})).await;
    let t0 = Utc::now();

    let mut runs = 0;
    let mut now = t0;
    loop {
        match h.scheduler.run_due(now, "w1").await.unwrap() {
            RunOutcome::Settled(i) if i.status.is_terminal() => break,
            RunOutcome::Idle => panic!("instance stalled"),
            _ => {}
        }
        runs += 1;
        assert!(runs <= budget, "no terminal state after {runs} runs");
        now += secs(3600);
    }

    let finished = h.manager.get_trigger_instance(instance.id).await.unwrap();
    assert_eq!(finished.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn reaped_node_past_its_budget_fails_without_dispatch() {
    let config = EngineConfig {
        max_retries: 2,
        ..EngineConfig::default()
    };
    let h = Harness::with(
        definition("welcome", vec![email("welcome", "Hi")], vec![]),
        MockChannel::delivering(Channel::Email),
        MockChannel::delivering(Channel::Sms),
        config,
    )
    .await;
    let instance = h.trigger(json!({})).await;
    let lease = Duration::from_secs(30);
    let mut now = Utc::now();

    // A worker that keeps dying mid-node: claim, never report, get reaped.
    for _ in 0..2 {
        h.scheduler.claim_due(now, "w1", lease).await.unwrap().unwrap();
        now += secs(31);
        assert_eq!(h.manager.reap_expired_leases(now).await.unwrap(), 1);
    }

    let claimed = h.scheduler.claim_due(now, "w2", lease).await.unwrap().unwrap();
    assert_eq!(claimed.instance.attempt, 3);

    let report = h.scheduler.step(&claimed, now).await.unwrap();
    let failed = match h.scheduler.report_step(&report).await.unwrap() {
        StepOutcome::Committed(instance) => instance,
        StepOutcome::Aborted => panic!("step should commit"),
    };
    assert_eq!(failed.status, InstanceStatus::Failed);
    assert!(failed.last_error.as_deref().unwrap().contains("gave up after 2"));
    assert_eq!(h.email.call_count(), 0);
    assert_eq!(
        h.outcomes(instance.id).await,
        vec![("welcome".to_string(), ExecutionOutcome::Failed, 3)]
    );
}

/// Delivers, but each dispatch takes `per_dispatch` of clock time, and the
/// lease reaper gets to run while it is in flight.
struct SlowChannel {
    clock: Arc<ManualClock>,
    per_dispatch: chrono::Duration,
    manager: Arc<TriggerInstanceManager>,
    reaped: Mutex<usize>,
    keys: Mutex<Vec<DispatchKey>>,
}

#[async_trait]
impl ChannelAdapter for SlowChannel {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReceipt, DispatchError> {
        self.clock.advance(self.per_dispatch);
        let reaped = self
            .manager
            .reap_expired_leases(self.clock.now())
            .await
            .unwrap();
        *self.reaped.lock().unwrap() += reaped;
        self.keys.lock().unwrap().push(request.key.clone());
        Ok(DispatchReceipt {
            message_id: request.key.to_string(),
            duplicate: false,
        })
    }
}

#[tokio::test]
async fn lease_is_renewed_after_every_node() {
    let def = definition(
        "a",
        vec![email("a", "A"), email("b", "B"), email("c", "C")],
        vec![edge("a", "b"), edge("b", "c")],
    );
    let config = EngineConfig {
        lease: Duration::from_secs(30),
        ..EngineConfig::default()
    };
    let definitions = Arc::new(MemoryDefinitionStore::new());
    definitions.publish(def.clone()).await.unwrap();
    let instances = Arc::new(MemoryInstanceStore::new());
    let manager = Arc::new(TriggerInstanceManager::new(
        definitions.clone(),
        instances.clone(),
        config.clone(),
    ));

    // Each node alone fits the lease; the chain as a whole does not.
    let clock = frozen_clock();
    let channel = Arc::new(SlowChannel {
        clock: clock.clone(),
        per_dispatch: secs(20),
        manager: manager.clone(),
        reaped: Mutex::new(0),
        keys: Mutex::new(Vec::new()),
    });
    let adapters: Vec<Arc<dyn ChannelAdapter>> = vec![channel.clone()];
    let scheduler = ExecutionScheduler::new(
        definitions,
        instances,
        channel_registry(adapters),
        config,
    )
    .with_clock(clock.clone());

    let instance = manager.create_trigger_instance(def.workflow.id, json!({})).await.unwrap();
    let done = settled(scheduler.run_due(clock.now(), "w1").await.unwrap());

    assert_eq!(done.status, InstanceStatus::Completed);
    assert_eq!(*channel.reaped.lock().unwrap(), 0);
    let keys: Vec<_> = channel
        .keys
        .lock()
        .unwrap()
        .iter()
        .map(|k| (k.node_id.clone(), k.attempt_number))
        .collect();
    assert_eq!(
        keys,
        vec![("a".to_string(), 1), ("b".to_string(), 1), ("c".to_string(), 1)]
    );

    let started: Vec<_> = manager
        .list_execution_records(instance.id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.started_at)
        .collect();
    assert!(started.windows(2).all(|w| w[0] < w[1]));
}

/// Hands out its first batch of candidates only after touching every one of
/// them, as a faster worker would.
struct FirstBatchLost {
    inner: Arc<MemoryInstanceStore>,
    lost: AtomicBool,
}

#[async_trait]
impl InstanceStore for FirstBatchLost {
    async fn insert_instance(&self, instance: &TriggerInstance) -> Result<(), StoreError> {
        self.inner.insert_instance(instance).await
    }

    async fn get_instance(&self, id: Uuid) -> Result<TriggerInstance, StoreError> {
        self.inner.get_instance(id).await
    }

    async fn find_claimable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TriggerInstance>, StoreError> {
        let batch = self.inner.find_claimable(now, limit).await?;
        if !self.lost.swap(true, Ordering::SeqCst) {
            for candidate in &batch {
                let touched = TriggerInstance {
                    revision: candidate.revision + 1,
                    ..candidate.clone()
                };
                self.inner
                    .compare_and_swap(candidate.revision, &touched, None)
                    .await?;
            }
        }
        Ok(batch)
    }

    async fn find_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TriggerInstance>, StoreError> {
        self.inner.find_expired_leases(now, limit).await
    }

    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        next: &TriggerInstance,
        record: Option<&NodeExecutionRecord>,
    ) -> Result<bool, StoreError> {
        self.inner.compare_and_swap(expected_revision, next, record).await
    }

    async fn count_instances(&self, workflow_id: Uuid, active_only: bool) -> Result<u64, StoreError> {
        self.inner.count_instances(workflow_id, active_only).await
    }

    async fn list_records(&self, instance_id: Uuid) -> Result<Vec<NodeExecutionRecord>, StoreError> {
        self.inner.list_records(instance_id).await
    }
}

#[tokio::test]
async fn lost_batch_is_requeried_before_going_idle() {
    let def = definition("welcome", vec![email("welcome", "Hi")], vec![]);
    let definitions = Arc::new(MemoryDefinitionStore::new());
    definitions.publish(def.clone()).await.unwrap();
    let instances = Arc::new(FirstBatchLost {
        inner: Arc::new(MemoryInstanceStore::new()),
        lost: AtomicBool::new(false),
    });
    let config = EngineConfig {
        claim_batch: 1,
        ..EngineConfig::default()
    };
    let manager = TriggerInstanceManager::new(definitions.clone(), instances.clone(), config.clone());
    let instance = manager.create_trigger_instance(def.workflow.id, json!({})).await.unwrap();

    let scheduler = ExecutionScheduler::new(
        definitions,
        instances,
        channel_registry(Vec::new()),
        config,
    );
    let claimed = scheduler
        .claim_due(Utc::now(), "w1", Duration::from_secs(30))
        .await
        .unwrap()
        .expect("second query finds the instance again");
    assert_eq!(claimed.instance.id, instance.id);
    assert_eq!(claimed.instance.revision, 2);
}
