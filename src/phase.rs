//! Phase workload: one invocation of one (phase, iteration).
//!
//! A phase computes its `[start_sn, end_sn]` range, shards it across N
//! workers, fans them out in parallel, and atomically records phase
//! completion. Planning is performed once per (phase, iteration) under
//! a single transaction built entirely from `get_or_add`: if a primary
//! crashes after committing the plan, the next primary observes the
//! same plan, never a fresh one. Behavior differences between Copy,
//! Catchup and Downtime are concentrated in the range computation; the
//! workload itself is one struct.

use crate::config::MigrationSettings;
use crate::error::{Error, Result};
use crate::keys::{
    field, iteration_count_key, phase_key, worker_key, MIGRATION_CURRENT_PHASE,
    MIGRATION_LAST_APPLIED_SEQ_NUM, MIGRATION_NO_OF_KEYS_MIGRATED, MIGRATION_START_SEQ_NUM,
};
use crate::metadata::MetadataView;
use crate::metrics::MigrationMetrics;
use crate::source::SourceService;
use crate::store::{RecordTransform, ReplicaStore};
use crate::types::{
    MigrationPhase, MigrationState, PhaseInput, PhaseResult, SeqNum, WorkerInput, WorkerResult,
};
use crate::worker::{read_worker_result, MigrationWorker};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// One (phase, iteration) of the migration.
#[derive(Debug)]
pub struct PhaseWorkload {
    kind: MigrationPhase,
    iteration: u32,
    store: Arc<dyn ReplicaStore>,
    source: Arc<dyn SourceService>,
    transform: Arc<dyn RecordTransform>,
    settings: Arc<MigrationSettings>,
    metrics: Arc<MigrationMetrics>,
    cancel: CancellationToken,
}

impl PhaseWorkload {
    /// Create a workload for a runnable phase.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: MigrationPhase,
        iteration: u32,
        store: Arc<dyn ReplicaStore>,
        source: Arc<dyn SourceService>,
        transform: Arc<dyn RecordTransform>,
        settings: Arc<MigrationSettings>,
        metrics: Arc<MigrationMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        debug_assert!(kind != MigrationPhase::None);
        Self {
            kind,
            iteration,
            store,
            source,
            transform,
            settings,
            metrics,
            cancel,
        }
    }

    /// The phase this workload runs.
    pub fn kind(&self) -> MigrationPhase {
        self.kind
    }

    /// The iteration this workload runs.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    fn pkey(&self, f: &str) -> String {
        phase_key(f, self.kind, self.iteration)
    }

    /// Plan (or re-observe) the phase, run its workers, and record
    /// completion. Re-running after a crash observes the existing plan
    /// and skips already-completed workers.
    pub async fn start_or_resume(&self) -> Result<PhaseResult> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let input = self.plan().await?;

        if input.status == MigrationState::Completed {
            tracing::info!(
                phase = %self.kind,
                iteration = self.iteration,
                "Phase already completed, returning persisted result"
            );
            return self.persisted_result().await;
        }

        tracing::info!(
            phase = %self.kind,
            iteration = self.iteration,
            start_sn = input.start_sn,
            end_sn = input.end_sn,
            worker_count = input.worker_count,
            "Phase started"
        );

        let workers = self.execute(&input).await?;
        self.complete(&input, &workers).await?;
        self.persisted_result().await
    }

    /// Read the persisted result of a (phase, iteration), if it was
    /// ever planned.
    pub async fn get_result(
        store: &dyn ReplicaStore,
        lease: Duration,
        phase: MigrationPhase,
        iteration: u32,
    ) -> Result<Option<PhaseResult>> {
        let mut tx = store.begin().await?;
        let mut view = MetadataView::new(tx.as_mut(), lease);
        Self::read_result_view(&mut view, phase, iteration).await
    }

    pub(crate) async fn read_result_view(
        view: &mut MetadataView<'_>,
        phase: MigrationPhase,
        iteration: u32,
    ) -> Result<Option<PhaseResult>> {
        let key = |f: &str| phase_key(f, phase, iteration);
        let Some(status) = view.get_or_default_state(&key(field::CURRENT_STATUS)).await? else {
            return Ok(None);
        };

        let worker_count = view
            .get_or_default_u32(&key(field::WORKER_COUNT))
            .await?
            .unwrap_or(0);
        let mut worker_results = Vec::with_capacity(worker_count as usize);
        for worker_id in 1..=worker_count {
            worker_results.push(read_worker_result(view, phase, iteration, worker_id).await?);
        }

        Ok(Some(PhaseResult {
            phase,
            iteration,
            status,
            started_at: view
                .get_or_default_datetime(&key(field::START_DATE_TIME_UTC))
                .await?,
            ended_at: view
                .get_or_default_datetime(&key(field::END_DATE_TIME_UTC))
                .await?,
            start_sn: view.get_long(&key(field::START_SEQ_NUM)).await?,
            end_sn: view.get_long(&key(field::END_SEQ_NUM)).await?,
            last_applied_sn: view
                .get_or_default_long(&key(field::LAST_APPLIED_SEQ_NUM))
                .await?,
            keys_migrated: view
                .get_or_default_u64(&key(field::NO_OF_KEYS_MIGRATED))
                .await?
                .unwrap_or(0),
            worker_results,
        }))
    }

    async fn persisted_result(&self) -> Result<PhaseResult> {
        Self::get_result(
            self.store.as_ref(),
            self.settings.store_lease,
            self.kind,
            self.iteration,
        )
        .await?
        .ok_or_else(|| {
            Error::Internal(format!(
                "phase {} iteration {} has no persisted plan",
                self.kind, self.iteration
            ))
        })
    }

    /// Plan the phase under a single transaction. Every row is written
    /// with `get_or_add`; the values returned are the authoritative
    /// plan whether this primary created them or a predecessor did.
    pub(crate) async fn plan(&self) -> Result<PhaseInput> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let mut view = MetadataView::new(tx.as_mut(), self.settings.store_lease);

        view.set_phase(MIGRATION_CURRENT_PHASE, self.kind).await?;

        let started_at = view
            .get_or_add_datetime(&self.pkey(field::START_DATE_TIME_UTC), now)
            .await?;
        let status = view
            .get_or_add_state(&self.pkey(field::CURRENT_STATUS), MigrationState::InProgress)
            .await?;

        let start_sn = match view
            .get_or_default_long(&self.pkey(field::START_SEQ_NUM))
            .await?
        {
            Some(existing) => existing,
            None => {
                let computed = self.compute_start_sn(&mut view).await?;
                view.get_or_add_long(&self.pkey(field::START_SEQ_NUM), computed)
                    .await?
            }
        };

        // Frozen at the first phase's planning; later phases observe it.
        view.get_or_add_long(MIGRATION_START_SEQ_NUM, start_sn)
            .await?;

        let end_sn = match view
            .get_or_default_long(&self.pkey(field::END_SEQ_NUM))
            .await?
        {
            Some(existing) => existing,
            None => {
                let computed = self.source.get_end_sn().await?;
                view.get_or_add_long(&self.pkey(field::END_SEQ_NUM), computed)
                    .await?
            }
        };

        let iteration_count = view
            .get_or_default_u32(&iteration_count_key(self.kind))
            .await?
            .unwrap_or(0);
        if self.iteration > iteration_count {
            view.set_u32(&iteration_count_key(self.kind), self.iteration)
                .await?;
        }

        let worker_count = view
            .get_or_add_u32(
                &self.pkey(field::WORKER_COUNT),
                self.settings.worker_count_for(self.kind),
            )
            .await?;

        let ranges = partition_range(start_sn, end_sn, worker_count);
        let mut worker_inputs = Vec::with_capacity(ranges.len());
        for (index, (range_start, range_end)) in ranges.into_iter().enumerate() {
            let worker_id = index as u32 + 1;
            let wkey = |f: &str| worker_key(f, self.kind, self.iteration, worker_id);
            let worker_start = view
                .get_or_add_long(&wkey(field::START_SEQ_NUM), range_start)
                .await?;
            let worker_end = view
                .get_or_add_long(&wkey(field::END_SEQ_NUM), range_end)
                .await?;
            let worker_started = view
                .get_or_add_datetime(&wkey(field::START_DATE_TIME_UTC), now)
                .await?;
            let worker_status = view
                .get_or_add_state(&wkey(field::CURRENT_STATUS), MigrationState::InProgress)
                .await?;
            worker_inputs.push(WorkerInput {
                worker_id,
                phase: self.kind,
                iteration: self.iteration,
                start_sn: worker_start,
                end_sn: worker_end,
                started_at: worker_started,
                status: worker_status,
            });
        }

        tx.commit().await?;

        Ok(PhaseInput {
            phase: self.kind,
            iteration: self.iteration,
            start_sn,
            end_sn,
            worker_count,
            started_at,
            status,
            worker_inputs,
        })
    }

    /// First sequence number of this phase's range.
    async fn compute_start_sn(&self, view: &mut MetadataView<'_>) -> Result<SeqNum> {
        match self.kind {
            MigrationPhase::Copy => {
                match view
                    .get_or_default_long(MIGRATION_LAST_APPLIED_SEQ_NUM)
                    .await?
                {
                    Some(last_applied) => Ok(last_applied),
                    None => self.source.get_start_sn().await,
                }
            }
            MigrationPhase::Catchup => {
                let previous = if self.iteration == 1 {
                    phase_key(field::END_SEQ_NUM, MigrationPhase::Copy, 1)
                } else {
                    phase_key(field::END_SEQ_NUM, MigrationPhase::Catchup, self.iteration - 1)
                };
                Ok(view.get_long(&previous).await? + 1)
            }
            MigrationPhase::Downtime => {
                let last_catchup = view
                    .get_or_default_u32(&iteration_count_key(MigrationPhase::Catchup))
                    .await?
                    .ok_or_else(|| {
                        Error::Internal("downtime planned before any catchup".into())
                    })?;
                let previous = phase_key(field::END_SEQ_NUM, MigrationPhase::Catchup, last_catchup);
                Ok(view.get_long(&previous).await? + 1)
            }
            MigrationPhase::None => Err(Error::Internal("cannot plan phase None".into())),
        }
    }

    /// Fan the planned slices out across workers and await them all.
    async fn execute(&self, input: &PhaseInput) -> Result<Vec<WorkerResult>> {
        let mut set = JoinSet::new();
        for worker_input in input.worker_inputs.clone() {
            let worker = MigrationWorker::new(
                worker_input,
                Arc::clone(&self.store),
                Arc::clone(&self.source),
                Arc::clone(&self.transform),
                Arc::clone(&self.settings),
                Arc::clone(&self.metrics),
                self.cancel.clone(),
            );
            set.spawn(async move { worker.run().await });
        }

        let mut results = Vec::with_capacity(input.worker_inputs.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(e)) => {
                    tracing::error!(
                        phase = %self.kind,
                        iteration = self.iteration,
                        error = %e,
                        "Worker failed, aborting remaining workers"
                    );
                    set.abort_all();
                    return Err(e);
                }
                Err(join_error) => {
                    set.abort_all();
                    return Err(Error::Internal(format!(
                        "worker task failed: {}",
                        join_error
                    )));
                }
            }
        }
        results.sort_by_key(|r| r.worker_id);
        Ok(results)
    }

    /// Atomically record phase completion and propagate the global
    /// counters. The global last-applied row only ever advances here,
    /// which is what makes it monotonic.
    async fn complete(&self, input: &PhaseInput, workers: &[WorkerResult]) -> Result<()> {
        let keys_migrated: u64 = workers.iter().map(|w| w.keys_migrated).sum();

        let mut tx = self.store.begin().await?;
        {
            let mut view = MetadataView::new(tx.as_mut(), self.settings.store_lease);
            let status = view
                .get_or_default_state(&self.pkey(field::CURRENT_STATUS))
                .await?;
            if status == Some(MigrationState::Completed) {
                return Ok(());
            }
            view.get_or_add_datetime(&self.pkey(field::END_DATE_TIME_UTC), Utc::now())
                .await?;
            view.set_long(&self.pkey(field::LAST_APPLIED_SEQ_NUM), input.end_sn)
                .await?;
            view.set_u64(&self.pkey(field::NO_OF_KEYS_MIGRATED), keys_migrated)
                .await?;
            view.set_state(&self.pkey(field::CURRENT_STATUS), MigrationState::Completed)
                .await?;
            view.advance_long(MIGRATION_LAST_APPLIED_SEQ_NUM, input.end_sn)
                .await?;
            view.add_u64(MIGRATION_NO_OF_KEYS_MIGRATED, keys_migrated)
                .await?;
        }
        tx.commit().await?;

        self.metrics.record_phase_completed(keys_migrated);
        tracing::info!(
            phase = %self.kind,
            iteration = self.iteration,
            start_sn = input.start_sn,
            end_sn = input.end_sn,
            keys_migrated,
            "Phase completed"
        );
        Ok(())
    }
}

/// Partition `[start_sn, end_sn]` evenly across `workers` slices.
///
/// Slices are disjoint, contiguous, and together cover the range
/// exactly; the last slice is clamped to `end_sn`. When the range is
/// smaller than the worker count, trailing slices are empty
/// (`start > end`) and their workers complete immediately.
pub(crate) fn partition_range(
    start_sn: SeqNum,
    end_sn: SeqNum,
    workers: u32,
) -> Vec<(SeqNum, SeqNum)> {
    let n = workers.max(1) as i64;
    if start_sn > end_sn {
        return (0..n).map(|_| (start_sn, start_sn - 1)).collect();
    }
    let per = (end_sn - start_sn) / n;
    (0..n)
        .map(|i| {
            let slice_start = start_sn + i * (per + 1);
            (slice_start, (slice_start + per).min(end_sn))
        })
        .collect()
}
