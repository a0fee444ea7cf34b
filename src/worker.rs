//! Migration worker: streams one sequence-number slice from the source
//! and applies it through the destination store.
//!
//! Each worker owns a contiguous `[start_sn, end_sn]` slice of a
//! phase's range and is the single writer for its own worker-scoped
//! metadata rows. Records are applied in batches, each batch in one
//! destination transaction together with the worker's checkpoint
//! (`LastAppliedSeqNum`, `NoOfKeysMigrated`), so the last committed
//! checkpoint is always a valid resume point.

use crate::config::MigrationSettings;
use crate::error::{Error, Result};
use crate::keys::{field, worker_key};
use crate::metadata::MetadataView;
use crate::metrics::MigrationMetrics;
use crate::source::SourceService;
use crate::store::{RecordTransform, ReplicaStore};
use crate::types::{KeyValueRecord, MigrationState, SeqNum, WorkerInput, WorkerResult};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One worker of one (phase, iteration).
#[derive(Debug)]
pub struct MigrationWorker {
    input: WorkerInput,
    store: Arc<dyn ReplicaStore>,
    source: Arc<dyn SourceService>,
    transform: Arc<dyn RecordTransform>,
    settings: Arc<MigrationSettings>,
    metrics: Arc<MigrationMetrics>,
    cancel: CancellationToken,
}

impl MigrationWorker {
    /// Create a worker for a planned slice.
    pub fn new(
        input: WorkerInput,
        store: Arc<dyn ReplicaStore>,
        source: Arc<dyn SourceService>,
        transform: Arc<dyn RecordTransform>,
        settings: Arc<MigrationSettings>,
        metrics: Arc<MigrationMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            input,
            store,
            source,
            transform,
            settings,
            metrics,
            cancel,
        }
    }

    fn key(&self, f: &str) -> String {
        worker_key(f, self.input.phase, self.input.iteration, self.input.worker_id)
    }

    /// Run the worker to completion, resuming from the last committed
    /// checkpoint. Transient faults retry the current batch from the
    /// resume point; apply failures and cancellation surface promptly
    /// with the persisted state left consistent.
    pub async fn run(self) -> Result<WorkerResult> {
        let (status, last_applied) = self.read_checkpoint().await?;
        if status == MigrationState::Completed {
            tracing::debug!(
                phase = %self.input.phase,
                iteration = self.input.iteration,
                worker_id = self.input.worker_id,
                "Worker already completed, returning persisted result"
            );
            return self.persisted_result().await;
        }

        if self.input.is_empty_range() {
            self.mark_completed().await?;
            return self.persisted_result().await;
        }

        let mut resume_from = match last_applied {
            Some(sn) => sn + 1,
            None => self.input.start_sn,
        };
        let mut consecutive_failures = 0u32;

        while resume_from <= self.input.end_sn {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            tracing::debug!(
                phase = %self.input.phase,
                iteration = self.input.iteration,
                worker_id = self.input.worker_id,
                resume_from,
                end_sn = self.input.end_sn,
                "Worker streaming"
            );

            match self.stream_range(resume_from).await {
                Ok(()) => break,
                Err(e) if e.is_transient() => {
                    consecutive_failures += 1;
                    if consecutive_failures >= self.settings.retry.max_attempts {
                        return Err(e);
                    }
                    let backoff = self.settings.retry.jittered_backoff_for(consecutive_failures - 1);
                    tracing::warn!(
                        phase = %self.input.phase,
                        worker_id = self.input.worker_id,
                        retry = consecutive_failures,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transient worker failure, retrying from last checkpoint"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    let (_, last_applied) = self.read_checkpoint().await?;
                    resume_from = match last_applied {
                        Some(sn) => sn + 1,
                        None => self.input.start_sn,
                    };
                }
                Err(e) => return Err(e),
            }
        }

        self.mark_completed().await?;
        self.persisted_result().await
    }

    /// Stream `[resume_from, end_sn]` and apply it batch by batch.
    async fn stream_range(&self, resume_from: SeqNum) -> Result<()> {
        let mut rx = self.source.enumerate(resume_from, self.input.end_sn).await?;
        let mut batch: Vec<KeyValueRecord> = Vec::with_capacity(self.settings.batch_size);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                item = rx.recv() => match item {
                    Some(Ok(record)) => {
                        batch.push(record);
                        if batch.len() >= self.settings.batch_size {
                            self.apply_batch(&batch).await?;
                            batch.clear();
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        if !batch.is_empty() {
                            self.apply_batch(&batch).await?;
                        }
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Apply one batch and its checkpoint in a single transaction.
    async fn apply_batch(&self, batch: &[KeyValueRecord]) -> Result<()> {
        let highest_sn = batch.last().map(|r| r.seq_num).unwrap_or(self.input.start_sn);

        let mut tx = self.store.begin().await?;
        for record in batch {
            let sn = record.seq_num;
            let transformed =
                self.transform
                    .transform(record.clone())
                    .map_err(|reason| Error::Apply {
                        seq_num: sn,
                        reason,
                    })?;
            tx.put_record(&transformed.key, &transformed.value)
                .await
                .map_err(|e| {
                    if e.is_transient() {
                        e
                    } else {
                        Error::Apply {
                            seq_num: sn,
                            reason: e.to_string(),
                        }
                    }
                })?;
        }

        {
            let mut view = MetadataView::new(tx.as_mut(), self.settings.store_lease);
            view.set_long(&self.key(field::LAST_APPLIED_SEQ_NUM), highest_sn)
                .await?;
            view.add_u64(&self.key(field::NO_OF_KEYS_MIGRATED), batch.len() as u64)
                .await?;
        }
        tx.commit().await?;
        self.metrics.record_batch_applied();

        tracing::trace!(
            phase = %self.input.phase,
            worker_id = self.input.worker_id,
            batch_len = batch.len(),
            last_applied = highest_sn,
            "Worker batch committed"
        );
        Ok(())
    }

    /// Read this worker's status and last committed checkpoint.
    async fn read_checkpoint(&self) -> Result<(MigrationState, Option<SeqNum>)> {
        let mut tx = self.store.begin().await?;
        let mut view = MetadataView::new(tx.as_mut(), self.settings.store_lease);
        let status = view
            .get_or_default_state(&self.key(field::CURRENT_STATUS))
            .await?
            .unwrap_or(MigrationState::None);
        let last_applied = view
            .get_or_default_long(&self.key(field::LAST_APPLIED_SEQ_NUM))
            .await?;
        Ok((status, last_applied))
    }

    /// Record clean completion.
    async fn mark_completed(&self) -> Result<()> {
        let mut tx = self.store.begin().await?;
        {
            let mut view = MetadataView::new(tx.as_mut(), self.settings.store_lease);
            view.set_state(&self.key(field::CURRENT_STATUS), MigrationState::Completed)
                .await?;
            view.get_or_add_datetime(&self.key(field::END_DATE_TIME_UTC), Utc::now())
                .await?;
        }
        tx.commit().await?;

        tracing::info!(
            phase = %self.input.phase,
            iteration = self.input.iteration,
            worker_id = self.input.worker_id,
            start_sn = self.input.start_sn,
            end_sn = self.input.end_sn,
            "Worker completed"
        );
        Ok(())
    }

    async fn persisted_result(&self) -> Result<WorkerResult> {
        let mut tx = self.store.begin().await?;
        let mut view = MetadataView::new(tx.as_mut(), self.settings.store_lease);
        read_worker_result(
            &mut view,
            self.input.phase,
            self.input.iteration,
            self.input.worker_id,
        )
        .await
    }
}

/// Reconstruct one worker's result from its metadata rows.
pub(crate) async fn read_worker_result(
    view: &mut MetadataView<'_>,
    phase: crate::types::MigrationPhase,
    iteration: u32,
    worker_id: u32,
) -> Result<WorkerResult> {
    let key = |f: &str| worker_key(f, phase, iteration, worker_id);
    Ok(WorkerResult {
        worker_id,
        status: view
            .get_or_default_state(&key(field::CURRENT_STATUS))
            .await?
            .unwrap_or(MigrationState::None),
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
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryReplicaStore, NoOpTransform};
    use crate::testing::MockSource;
    use crate::types::MigrationPhase;

    fn worker_input(start_sn: SeqNum, end_sn: SeqNum) -> WorkerInput {
        WorkerInput {
            worker_id: 1,
            phase: MigrationPhase::Copy,
            iteration: 1,
            start_sn,
            end_sn,
            started_at: Utc::now(),
            status: MigrationState::InProgress,
        }
    }

    /// Seed the rows planning would have written for this worker.
    async fn seed_plan(store: &InMemoryReplicaStore, input: &WorkerInput) {
        let mut tx = store.begin().await.unwrap();
        let key = |f: &str| worker_key(f, input.phase, input.iteration, input.worker_id);
        tx.insert(&key(field::START_SEQ_NUM), &input.start_sn.to_string())
            .await
            .unwrap();
        tx.insert(&key(field::END_SEQ_NUM), &input.end_sn.to_string())
            .await
            .unwrap();
        tx.insert(&key(field::CURRENT_STATUS), "InProgress")
            .await
            .unwrap();
        tx.insert(
            &key(field::START_DATE_TIME_UTC),
            &crate::metadata::format_datetime(input.started_at),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    fn worker_for(
        input: WorkerInput,
        store: &Arc<InMemoryReplicaStore>,
        source: &Arc<MockSource>,
        batch_size: usize,
    ) -> MigrationWorker {
        let settings = MigrationSettings::new("http://source/KvsMigration")
            .with_batch_size(batch_size)
            .with_retry(crate::config::RetryPolicy {
                max_attempts: 3,
                initial_backoff: std::time::Duration::from_millis(1),
                max_backoff: std::time::Duration::from_millis(5),
            });
        MigrationWorker::new(
            input,
            Arc::clone(store) as Arc<dyn ReplicaStore>,
            Arc::clone(source) as Arc<dyn SourceService>,
            Arc::new(NoOpTransform),
            Arc::new(settings),
            Arc::new(MigrationMetrics::new()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_worker_streams_and_checkpoints() {
        let store = Arc::new(InMemoryReplicaStore::new());
        let source = Arc::new(MockSource::with_range(1, 10));
        let input = worker_input(1, 10);
        seed_plan(&store, &input).await;

        let result = worker_for(input, &store, &source, 3).run().await.unwrap();

        assert_eq!(result.status, MigrationState::Completed);
        assert_eq!(result.last_applied_sn, Some(10));
        assert_eq!(result.keys_migrated, 10);
        assert!(result.ended_at.is_some());
        assert_eq!(store.record_count(), 10);
        assert_eq!(store.record_put_count(), 10);
    }

    #[tokio::test]
    async fn test_completed_worker_short_circuits() {
        let store = Arc::new(InMemoryReplicaStore::new());
        let source = Arc::new(MockSource::with_range(1, 10));
        let input = worker_input(1, 10);
        seed_plan(&store, &input).await;

        let mut tx = store.begin().await.unwrap();
        tx.insert("Phase_CurrentStatus_Copy_1_1", "Completed")
            .await
            .unwrap();
        tx.insert("Phase_LastAppliedSeqNum_Copy_1_1", "10")
            .await
            .unwrap();
        tx.insert("Phase_NoOfKeysMigrated_Copy_1_1", "10")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let result = worker_for(input, &store, &source, 3).run().await.unwrap();

        assert_eq!(result.status, MigrationState::Completed);
        assert_eq!(result.keys_migrated, 10);
        assert_eq!(store.record_put_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_range_completes_immediately() {
        let store = Arc::new(InMemoryReplicaStore::new());
        let source = Arc::new(MockSource::empty());
        let input = worker_input(1, 0);
        seed_plan(&store, &input).await;

        let result = worker_for(input, &store, &source, 3).run().await.unwrap();

        assert_eq!(result.status, MigrationState::Completed);
        assert_eq!(result.last_applied_sn, None);
        assert_eq!(result.keys_migrated, 0);
        assert_eq!(store.record_put_count(), 0);
    }

    #[tokio::test]
    async fn test_worker_resumes_from_checkpoint() {
        let store = Arc::new(InMemoryReplicaStore::new());
        let source = Arc::new(MockSource::with_range(1, 10));
        let input = worker_input(1, 10);
        seed_plan(&store, &input).await;

        // A previous primary committed through sequence number 5.
        let mut tx = store.begin().await.unwrap();
        tx.insert("Phase_LastAppliedSeqNum_Copy_1_1", "5")
            .await
            .unwrap();
        tx.insert("Phase_NoOfKeysMigrated_Copy_1_1", "5")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let result = worker_for(input, &store, &source, 3).run().await.unwrap();

        assert_eq!(result.status, MigrationState::Completed);
        assert_eq!(result.last_applied_sn, Some(10));
        assert_eq!(result.keys_migrated, 10);
        // Only 6..=10 were streamed and applied.
        assert_eq!(store.record_put_count(), 5);
    }

    #[tokio::test]
    async fn test_failed_commit_retries_from_resume_point() {
        let store = Arc::new(InMemoryReplicaStore::new());
        let source = Arc::new(MockSource::with_range(1, 6));
        let input = worker_input(1, 6);
        seed_plan(&store, &input).await;
        store.fail_next_commits(1);

        let result = worker_for(input, &store, &source, 3).run().await.unwrap();

        assert_eq!(result.status, MigrationState::Completed);
        assert_eq!(result.last_applied_sn, Some(6));
        assert_eq!(result.keys_migrated, 6);
        assert_eq!(store.record_count(), 6);
    }

    #[tokio::test]
    async fn test_poison_record_fails_worker() {
        #[derive(Debug)]
        struct RejectKey(String);
        impl RecordTransform for RejectKey {
            fn transform(
                &self,
                record: KeyValueRecord,
            ) -> std::result::Result<KeyValueRecord, String> {
                if record.key == self.0 {
                    Err("destination rejects this record".into())
                } else {
                    Ok(record)
                }
            }
        }

        let store = Arc::new(InMemoryReplicaStore::new());
        let source = Arc::new(MockSource::with_range(1, 10));
        let input = worker_input(1, 10);
        seed_plan(&store, &input).await;

        let settings = MigrationSettings::new("http://source/KvsMigration").with_batch_size(3);
        let worker = MigrationWorker::new(
            input,
            Arc::clone(&store) as Arc<dyn ReplicaStore>,
            Arc::clone(&source) as Arc<dyn SourceService>,
            Arc::new(RejectKey(MockSource::key_for(7))),
            Arc::new(settings),
            Arc::new(MigrationMetrics::new()),
            CancellationToken::new(),
        );

        let err = worker.run().await.unwrap_err();
        assert!(matches!(err, Error::Apply { seq_num: 7, .. }));
        // The checkpoint still reflects the last committed batch.
        assert_eq!(
            store.meta_get("Phase_LastAppliedSeqNum_Copy_1_1"),
            Some("6".to_string())
        );
    }

    #[tokio::test]
    async fn test_cancellation_surfaces_promptly() {
        let store = Arc::new(InMemoryReplicaStore::new());
        let source = Arc::new(MockSource::with_range(1, 10));
        let input = worker_input(1, 10);
        seed_plan(&store, &input).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let settings = MigrationSettings::new("http://source/KvsMigration");
        let worker = MigrationWorker::new(
            input,
            Arc::clone(&store) as Arc<dyn ReplicaStore>,
            Arc::clone(&source) as Arc<dyn SourceService>,
            Arc::new(NoOpTransform),
            Arc::new(settings),
            Arc::new(MigrationMetrics::new()),
            cancel,
        );

        let err = worker.run().await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(store.record_put_count(), 0);
    }
}
