//! Long-running loops: workers that execute due instances and the reaper that
//! recovers instances from workers that stopped renewing their lease.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info};

use crate::manager::TriggerInstanceManager;
use crate::scheduler::{ExecutionScheduler, RunOutcome};

pub struct Worker {
    id: String,
    scheduler: Arc<ExecutionScheduler>,
}

impl Worker {
    pub fn new(id: impl Into<String>, scheduler: Arc<ExecutionScheduler>) -> Self {
        Self {
            id: id.into(),
            scheduler,
        }
    }

    /// Execute due instances until `shutdown` becomes `true` or its sender
    /// is dropped. Sleeps `poll_interval` whenever nothing is due.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let poll_interval = self.scheduler.config().poll_interval;
        info!(worker = %self.id, "worker started");

        while !*shutdown.borrow() {
            let idle = match self.scheduler.run_once(&self.id).await {
                Ok(RunOutcome::Idle) => true,
                Ok(RunOutcome::Settled(_) | RunOutcome::Aborted { .. }) => false,
                Err(e) => {
                    error!(worker = %self.id, "step failed: {e}");
                    true
                }
            };

            if idle && !wait(&mut shutdown, poll_interval).await {
                break;
            }
        }

        info!(worker = %self.id, "worker stopped");
    }
}

pub struct Reaper {
    manager: Arc<TriggerInstanceManager>,
    interval: Duration,
}

impl Reaper {
    pub fn new(manager: Arc<TriggerInstanceManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Reap expired leases every `interval` until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "reaper started");

        while !*shutdown.borrow() {
            match self.manager.reap_expired_leases(Utc::now()).await {
                Ok(0) => {}
                Ok(n) => info!(reaped = n, "expired leases reaped"),
                Err(e) => error!("lease reaping failed: {e}"),
            }

            if !wait(&mut shutdown, self.interval).await {
                break;
            }
        }

        info!("reaper stopped");
    }
}

/// Sleep for `period` unless shutdown is signalled first. Returns `false`
/// when the loop should stop.
async fn wait(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    let changed = tokio::select! {
        _ = tokio::time::sleep(period) => return true,
        changed = shutdown.changed() => changed,
    };
    changed.is_ok() && !*shutdown.borrow()
}
