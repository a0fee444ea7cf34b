//! Configuration for the migration orchestrator.
//!
//! Settings are constructed once by the host, validated at
//! orchestrator construction, and held immutable for the lifetime of
//! the migration.

use crate::error::{Error, Result};
use std::time::Duration;

/// Retry policy for transient faults: exponential backoff with jitter,
/// capped at `max_backoff`, for at most `max_attempts` attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single backoff.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff for the given retry (0-based), before jitter.
    ///
    /// Doubles each retry, saturating at `max_backoff`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Backoff for the given retry with up to 50% additive jitter.
    pub fn jittered_backoff_for(&self, retry: u32) -> Duration {
        use rand::Rng;
        let base = self.backoff_for(retry);
        let jitter_cap = (base / 2).as_millis() as u64;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        base + Duration::from_millis(jitter)
    }
}

/// Immutable settings for one partition's migration.
#[derive(Debug, Clone)]
pub struct MigrationSettings {
    /// Base URI of the legacy KVS partition controller, including the
    /// controller segment (e.g. `http://host:19081/KvsMigration`).
    pub source_service_uri: String,

    /// Workers fanned out during the Copy phase.
    pub copy_phase_worker_count: u32,

    /// Workers fanned out during each Catchup iteration and during
    /// Downtime (both move small deltas).
    pub catchup_phase_worker_count: u32,

    /// Sequence-number delta below which the remaining work is small
    /// enough to finish while the source rejects writes.
    pub downtime_threshold: i64,

    /// Records applied per destination transaction.
    pub batch_size: usize,

    /// Retry policy for transient source and store faults.
    pub retry: RetryPolicy,

    /// Per-request timeout for source HTTP calls.
    pub request_timeout: Duration,

    /// Per-operation lease on metadata transactions. Exceeding the
    /// lease aborts the operation and the caller retries.
    pub store_lease: Duration,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            source_service_uri: String::new(),
            copy_phase_worker_count: 8,
            catchup_phase_worker_count: 1,
            downtime_threshold: 1024,
            batch_size: 500,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
            store_lease: Duration::from_secs(5),
        }
    }
}

impl MigrationSettings {
    /// Create settings for the given source service URI.
    pub fn new(source_service_uri: impl Into<String>) -> Self {
        Self {
            source_service_uri: source_service_uri.into(),
            ..Default::default()
        }
    }

    /// Set the Copy phase worker count.
    pub fn with_copy_workers(mut self, count: u32) -> Self {
        self.copy_phase_worker_count = count;
        self
    }

    /// Set the Catchup/Downtime worker count.
    pub fn with_catchup_workers(mut self, count: u32) -> Self {
        self.catchup_phase_worker_count = count;
        self
    }

    /// Set the downtime threshold (sequence-number delta).
    pub fn with_downtime_threshold(mut self, threshold: i64) -> Self {
        self.downtime_threshold = threshold;
        self
    }

    /// Set the per-transaction apply batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-request source timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the metadata store lease.
    pub fn with_store_lease(mut self, lease: Duration) -> Self {
        self.store_lease = lease;
        self
    }

    /// Worker count for the given phase.
    pub fn worker_count_for(&self, phase: crate::types::MigrationPhase) -> u32 {
        match phase {
            crate::types::MigrationPhase::Copy => self.copy_phase_worker_count,
            _ => self.catchup_phase_worker_count,
        }
    }

    /// Reject settings a migration cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.source_service_uri.is_empty() {
            return Err(Error::Config("source service URI is required".into()));
        }
        if self.copy_phase_worker_count == 0 || self.catchup_phase_worker_count == 0 {
            return Err(Error::Config("worker count must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be at least 1".into()));
        }
        if self.downtime_threshold < 0 {
            return Err(Error::Config("downtime threshold must be >= 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry policy needs at least one attempt".into()));
        }
        Ok(())
    }
}
