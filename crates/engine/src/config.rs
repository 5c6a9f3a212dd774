//! Engine tuning knobs.

use std::time::Duration;

/// Configuration shared by the scheduler, the manager and the worker loops.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Total dispatch attempts allowed per node before the instance fails.
    pub max_retries: u32,
    /// Base delay for exponential back-off between dispatch attempts.
    pub retry_base_delay: Duration,
    /// Upper bound on a single back-off delay.
    pub retry_max_delay: Duration,
    /// How long a claim stays valid without progress before the reaper may
    /// hand the instance to another worker.
    pub lease: Duration,
    /// Idle sleep between polls when no work is due.
    pub poll_interval: Duration,
    /// How often the reaper scans for expired leases.
    pub reap_interval: Duration,
    /// Candidates fetched per claim attempt.
    pub claim_batch: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(300),
            lease: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            reap_interval: Duration::from_secs(5),
            claim_batch: 8,
        }
    }
}

impl EngineConfig {
    /// Back-off before retrying after failed attempt number `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped at `retry_max_delay`.
    pub fn backoff(&self, attempt: u32) -> chrono::Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self
            .retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay);
        to_chrono(delay)
    }

    pub fn lease_duration(&self) -> chrono::Duration {
        to_chrono(self.lease)
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = EngineConfig {
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(10),
            ..EngineConfig::default()
        };

        assert_eq!(config.backoff(1), chrono::Duration::seconds(2));
        assert_eq!(config.backoff(2), chrono::Duration::seconds(4));
        assert_eq!(config.backoff(3), chrono::Duration::seconds(8));
        assert_eq!(config.backoff(4), chrono::Duration::seconds(10));
        assert_eq!(config.backoff(40), chrono::Duration::seconds(10));
    }
}
