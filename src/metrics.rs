//! In-process counters for migration observability.
//!
//! These are plain atomics a host can scrape; exporting them to a
//! telemetry sink is the host's business.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one partition's migration.
#[derive(Debug, Default)]
pub struct MigrationMetrics {
    phases_completed: AtomicU64,
    catchup_iterations: AtomicU64,
    keys_migrated: AtomicU64,
    batches_applied: AtomicU64,
    migrations_completed: AtomicU64,
    migrations_aborted: AtomicU64,
    calls_forwarded: AtomicU64,
    calls_local: AtomicU64,
}

impl MigrationMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a (phase, iteration) completing.
    pub fn record_phase_completed(&self, keys: u64) {
        self.phases_completed.fetch_add(1, Ordering::Relaxed);
        self.keys_migrated.fetch_add(keys, Ordering::Relaxed);
    }

    /// Record the convergence test scheduling another catchup pass.
    pub fn record_catchup_iteration(&self) {
        self.catchup_iterations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one applied worker batch.
    pub fn record_batch_applied(&self) {
        self.batches_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Record cutover.
    pub fn record_migration_completed(&self) {
        self.migrations_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an external abort.
    pub fn record_migration_aborted(&self) {
        self.migrations_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an actor call forwarded to the source.
    pub fn record_call_forwarded(&self) {
        self.calls_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an actor call served locally.
    pub fn record_call_local(&self) {
        self.calls_local.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> MigrationMetricsSnapshot {
        MigrationMetricsSnapshot {
            phases_completed: self.phases_completed.load(Ordering::Relaxed),
            catchup_iterations: self.catchup_iterations.load(Ordering::Relaxed),
            keys_migrated: self.keys_migrated.load(Ordering::Relaxed),
            batches_applied: self.batches_applied.load(Ordering::Relaxed),
            migrations_completed: self.migrations_completed.load(Ordering::Relaxed),
            migrations_aborted: self.migrations_aborted.load(Ordering::Relaxed),
            calls_forwarded: self.calls_forwarded.load(Ordering::Relaxed),
            calls_local: self.calls_local.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`MigrationMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationMetricsSnapshot {
    /// Completed (phase, iteration) pairs.
    pub phases_completed: u64,
    /// Catchup passes scheduled beyond the first.
    pub catchup_iterations: u64,
    /// Keys migrated across all completed phases.
    pub keys_migrated: u64,
    /// Worker batches committed.
    pub batches_applied: u64,
    /// Migrations that reached cutover.
    pub migrations_completed: u64,
    /// Migrations aborted externally.
    pub migrations_aborted: u64,
    /// Actor calls forwarded to the source.
    pub calls_forwarded: u64,
    /// Actor calls served locally.
    pub calls_local: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = MigrationMetrics::new();

        metrics.record_phase_completed(250);
        metrics.record_phase_completed(750);
        metrics.record_catchup_iteration();
        metrics.record_batch_applied();
        metrics.record_call_forwarded();
        metrics.record_call_forwarded();
        metrics.record_call_local();
        metrics.record_migration_completed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.phases_completed, 2);
        assert_eq!(snapshot.keys_migrated, 1000);
        assert_eq!(snapshot.catchup_iterations, 1);
        assert_eq!(snapshot.batches_applied, 1);
        assert_eq!(snapshot.calls_forwarded, 2);
        assert_eq!(snapshot.calls_local, 1);
        assert_eq!(snapshot.migrations_completed, 1);
        assert_eq!(snapshot.migrations_aborted, 0);
    }
}
