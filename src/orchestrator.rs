//! Top-level migration state machine.
//!
//! One orchestrator runs per partition, on the destination primary.
//! It advances through `Copy -> Catchup* -> Downtime`, iterating
//! Catchup until the remaining sequence-number delta drops below the
//! downtime threshold, then rejects writes on the source, drains the
//! tail, and records cutover. All progress lives in the metadata
//! keyspace, so primary loss at any point resumes exactly where the
//! previous primary stopped.

use crate::config::MigrationSettings;
use crate::error::{Error, Result};
use crate::forwarding::MigrationGate;
use crate::keys::{
    iteration_count_key, MIGRATION_CURRENT_PHASE, MIGRATION_CURRENT_STATUS,
    MIGRATION_END_DATE_TIME_UTC, MIGRATION_END_SEQ_NUM, MIGRATION_LAST_APPLIED_SEQ_NUM,
    MIGRATION_NO_OF_KEYS_MIGRATED, MIGRATION_START_DATE_TIME_UTC, MIGRATION_START_SEQ_NUM,
};
use crate::metadata::MetadataView;
use crate::metrics::MigrationMetrics;
use crate::phase::PhaseWorkload;
use crate::source::SourceService;
use crate::store::{NoOpTransform, RecordTransform, ReplicaStore};
use crate::types::{MigrationPhase, MigrationResult, MigrationState, PhaseResult};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-partition migration orchestrator.
#[derive(Debug)]
pub struct MigrationOrchestrator {
    settings: Arc<MigrationSettings>,
    store: Arc<dyn ReplicaStore>,
    source: Arc<dyn SourceService>,
    transform: Arc<dyn RecordTransform>,
    metrics: Arc<MigrationMetrics>,
    cancel: CancellationToken,
    /// False while the migration is incomplete: incoming actor calls
    /// must be forwarded to the source primary. Flips exactly once,
    /// when cutover is durable.
    actor_calls_allowed: AtomicBool,
}

impl MigrationOrchestrator {
    /// Create an orchestrator. Settings are validated here, before any
    /// metadata is touched.
    pub fn new(
        settings: MigrationSettings,
        store: Arc<dyn ReplicaStore>,
        source: Arc<dyn SourceService>,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings: Arc::new(settings),
            store,
            source,
            transform: Arc::new(NoOpTransform),
            metrics: Arc::new(MigrationMetrics::new()),
            cancel: CancellationToken::new(),
            actor_calls_allowed: AtomicBool::new(false),
        })
    }

    /// Replace the record transform applied before destination writes.
    pub fn with_transform(mut self, transform: Arc<dyn RecordTransform>) -> Self {
        self.transform = transform;
        self
    }

    /// The orchestrator's metrics.
    pub fn metrics(&self) -> &Arc<MigrationMetrics> {
        &self.metrics
    }

    /// The cancellation token threaded through the whole stack.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether incoming actor calls must be forwarded to the source.
    pub fn is_call_forwarding_required(&self) -> bool {
        !self.actor_calls_allowed.load(Ordering::SeqCst)
    }

    /// Drive the migration to cutover, resuming from whatever the
    /// metadata keyspace records. Returns the final report on success;
    /// on error or cancellation the persisted state is left intact for
    /// a later primary to resume.
    pub async fn run(&self) -> Result<MigrationResult> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let status = self.initialize().await?;
        if status == MigrationState::Completed {
            self.actor_calls_allowed.store(true, Ordering::SeqCst);
            tracing::info!("Migration already completed, serving actor calls locally");
            return self.get_result().await;
        }

        let mut runner = Some(self.initial_runner().await?);
        let mut last_result: Option<PhaseResult> = None;
        while let Some(phase) = runner.take() {
            let result = phase.start_or_resume().await?;
            runner = self.next_runner(&result).await?;
            last_result = Some(result);
        }

        let final_result = last_result
            .ok_or_else(|| Error::Internal("driver loop produced no phase result".into()))?;
        self.record_completion(&final_result).await?;

        self.actor_calls_allowed.store(true, Ordering::SeqCst);
        self.metrics.record_migration_completed();
        tracing::info!(
            end_sn = final_result.end_sn,
            "Migration completed, actor calls now served locally"
        );

        self.get_result().await
    }

    /// Abort the migration: persist the `Aborted` status, cancel the
    /// driver, and re-admit writes on the source (best effort).
    /// An aborted migration resumes by re-running [`run`](Self::run).
    pub async fn abort(&self) -> Result<()> {
        let mut tx = self.store.begin().await?;
        {
            let mut view = MetadataView::new(tx.as_mut(), self.settings.store_lease);
            view.set_state(MIGRATION_CURRENT_STATUS, MigrationState::Aborted)
                .await?;
        }
        tx.commit().await?;

        self.cancel.cancel();
        self.metrics.record_migration_aborted();

        if let Err(e) = self.source.resume_writes().await {
            tracing::warn!(error = %e, "Failed to resume writes on source during abort");
        }

        tracing::warn!("Migration aborted");
        Ok(())
    }

    /// Reconstruct the aggregate report from the metadata keyspace.
    /// Always succeeds against the last durable state.
    pub async fn get_result(&self) -> Result<MigrationResult> {
        let mut tx = self.store.begin().await?;
        let mut view = MetadataView::new(tx.as_mut(), self.settings.store_lease);

        let status = view
            .get_or_default_state(MIGRATION_CURRENT_STATUS)
            .await?
            .unwrap_or(MigrationState::None);
        let current_phase = view
            .get_or_default_phase(MIGRATION_CURRENT_PHASE)
            .await?
            .unwrap_or(MigrationPhase::None);

        let mut phase_results = Vec::new();
        for phase in MigrationPhase::RUNNABLE {
            if phase > current_phase {
                break;
            }
            let iterations = if phase.iterates() {
                view.get_or_default_u32(&iteration_count_key(phase))
                    .await?
                    .unwrap_or(1)
                    .max(1)
            } else {
                1
            };
            for iteration in 1..=iterations {
                if let Some(result) =
                    PhaseWorkload::read_result_view(&mut view, phase, iteration).await?
                {
                    phase_results.push(result);
                }
            }
        }

        Ok(MigrationResult {
            status,
            current_phase,
            start_sn: view.get_or_default_long(MIGRATION_START_SEQ_NUM).await?,
            end_sn: view.get_or_default_long(MIGRATION_END_SEQ_NUM).await?,
            last_applied_sn: view
                .get_or_default_long(MIGRATION_LAST_APPLIED_SEQ_NUM)
                .await?,
            keys_migrated: view
                .get_or_default_u64(MIGRATION_NO_OF_KEYS_MIGRATED)
                .await?
                .unwrap_or(0),
            started_at: view
                .get_or_default_datetime(MIGRATION_START_DATE_TIME_UTC)
                .await?,
            ended_at: view
                .get_or_default_datetime(MIGRATION_END_DATE_TIME_UTC)
                .await?,
            phase_results,
        })
    }

    /// First-run initialization, idempotent across resumes.
    async fn initialize(&self) -> Result<MigrationState> {
        let mut tx = self.store.begin().await?;
        let existing = {
            let mut view = MetadataView::new(tx.as_mut(), self.settings.store_lease);
            let existing = view
                .get_or_default_state(MIGRATION_CURRENT_STATUS)
                .await?
                .unwrap_or(MigrationState::None);
            if existing != MigrationState::Completed {
                view.get_or_add_datetime(MIGRATION_START_DATE_TIME_UTC, Utc::now())
                    .await?;
                view.set_state(MIGRATION_CURRENT_STATUS, MigrationState::InProgress)
                    .await?;
            }
            existing
        };
        if existing == MigrationState::Completed {
            return Ok(MigrationState::Completed);
        }
        tx.commit().await?;

        tracing::info!(previous_status = %existing, "Migration initialized");
        Ok(MigrationState::InProgress)
    }

    /// Pick the phase to run first, from the persisted current phase.
    async fn initial_runner(&self) -> Result<PhaseWorkload> {
        let mut tx = self.store.begin().await?;
        let mut view = MetadataView::new(tx.as_mut(), self.settings.store_lease);
        let current = view
            .get_or_default_phase(MIGRATION_CURRENT_PHASE)
            .await?
            .unwrap_or(MigrationPhase::None);
        let (phase, iteration) = match current {
            MigrationPhase::None | MigrationPhase::Copy => (MigrationPhase::Copy, 1),
            MigrationPhase::Catchup => {
                let iteration = view
                    .get_or_default_u32(&iteration_count_key(MigrationPhase::Catchup))
                    .await?
                    .unwrap_or(1)
                    .max(1);
                (MigrationPhase::Catchup, iteration)
            }
            MigrationPhase::Downtime => (MigrationPhase::Downtime, 1),
        };
        Ok(self.phase_workload(phase, iteration))
    }

    /// The state machine's edge function: what to run after `result`.
    async fn next_runner(&self, result: &PhaseResult) -> Result<Option<PhaseWorkload>> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match result.phase {
            MigrationPhase::Copy => Ok(Some(self.phase_workload(MigrationPhase::Catchup, 1))),
            MigrationPhase::Catchup => {
                let source_end = self.source.get_end_sn().await?;
                let delta = source_end - result.end_sn;
                if delta > self.settings.downtime_threshold {
                    self.metrics.record_catchup_iteration();
                    tracing::info!(
                        delta,
                        threshold = self.settings.downtime_threshold,
                        next_iteration = result.iteration + 1,
                        "Catchup delta above threshold, iterating"
                    );
                    Ok(Some(
                        self.phase_workload(MigrationPhase::Catchup, result.iteration + 1),
                    ))
                } else {
                    tracing::info!(
                        delta,
                        threshold = self.settings.downtime_threshold,
                        "Catchup converged, rejecting writes and taking downtime"
                    );
                    // Downtime must plan against an end sequence number
                    // taken after the source stopped admitting writes.
                    self.source.reject_writes().await?;
                    Ok(Some(self.phase_workload(MigrationPhase::Downtime, 1)))
                }
            }
            MigrationPhase::Downtime => Ok(None),
            MigrationPhase::None => {
                Err(Error::Internal("phase result for phase None".into()))
            }
        }
    }

    /// Record cutover. `MigrationEndSeqNum` is written with
    /// `get_or_add`, so it is written at most once across the lifetime
    /// of the migration.
    async fn record_completion(&self, final_result: &PhaseResult) -> Result<()> {
        let mut tx = self.store.begin().await?;
        {
            let mut view = MetadataView::new(tx.as_mut(), self.settings.store_lease);
            view.get_or_add_datetime(MIGRATION_END_DATE_TIME_UTC, Utc::now())
                .await?;
            view.get_or_add_long(MIGRATION_END_SEQ_NUM, final_result.end_sn)
                .await?;
            view.set_state(MIGRATION_CURRENT_STATUS, MigrationState::Completed)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    fn phase_workload(&self, phase: MigrationPhase, iteration: u32) -> PhaseWorkload {
        PhaseWorkload::new(
            phase,
            iteration,
            Arc::clone(&self.store),
            Arc::clone(&self.source),
            Arc::clone(&self.transform),
            Arc::clone(&self.settings),
            Arc::clone(&self.metrics),
            self.cancel.clone(),
        )
    }
}

impl MigrationGate for MigrationOrchestrator {
    fn is_call_forwarding_required(&self) -> bool {
        MigrationOrchestrator::is_call_forwarding_required(self)
    }
}
