//! Destination state store seam.
//!
//! The migration core does not persist anything itself: all durable
//! state lives in an external replicated transactional store that
//! provides serializable transactions over ordered dictionaries. The
//! core sees exactly two dictionaries through one transaction: the
//! metadata dictionary (string rows, the migration's bookkeeping) and
//! the data dictionary (the migrated user records). Serializable
//! transactions on this store are the only cross-task synchronization
//! mechanism in the core.

use crate::error::{Result, StoreError};
use crate::types::KeyValueRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Update closure for `add_or_update`: maps the existing value to its
/// replacement.
pub type UpdateFn<'a> = &'a mut (dyn FnMut(&str) -> String + Send);

/// Handle to the external replicated store.
#[async_trait]
pub trait ReplicaStore: Send + Sync + std::fmt::Debug {
    /// Begin a serializable transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
}

/// One serializable transaction over the metadata and data
/// dictionaries. Dropping a transaction without committing discards
/// its writes.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Read a metadata row, observing this transaction's own writes.
    async fn get(&mut self, key: &str) -> Result<Option<String>>;

    /// Write a metadata row unconditionally.
    async fn insert(&mut self, key: &str, value: &str) -> Result<()>;

    /// Atomic "insert if absent, else return existing". The returned
    /// value is authoritative: a resumed primary observes the plan the
    /// previous primary committed, never a fresh one.
    async fn get_or_add(&mut self, key: &str, seed: &str) -> Result<String>;

    /// Atomic "insert `initial` if absent, else replace with
    /// `update(existing)`". Returns the stored value.
    async fn add_or_update(
        &mut self,
        key: &str,
        initial: &str,
        update: UpdateFn<'_>,
    ) -> Result<String>;

    /// Upsert a migrated user record into the data dictionary.
    async fn put_record(&mut self, key: &str, value: &[u8]) -> Result<()>;

    /// Commit the transaction durably.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Pluggable per-record transform applied before the destination
/// write. Schema translation of individual records lives behind this
/// seam.
pub trait RecordTransform: Send + Sync + std::fmt::Debug {
    /// Transform a source record into its destination shape.
    fn transform(&self, record: KeyValueRecord) -> std::result::Result<KeyValueRecord, String>;
}

/// Identity transform.
#[derive(Debug, Default)]
pub struct NoOpTransform;

impl RecordTransform for NoOpTransform {
    fn transform(&self, record: KeyValueRecord) -> std::result::Result<KeyValueRecord, String> {
        Ok(record)
    }
}

/// In-memory replicated store for testing.
///
/// Transactions buffer writes and apply them atomically at commit
/// under one lock, which is serializable under the core's single-writer
/// row discipline. Committed metadata writes are also appended to an
/// audit log so tests can assert write-once and monotonicity
/// properties.
#[derive(Debug, Default)]
pub struct InMemoryReplicaStore {
    inner: Arc<Mutex<StoreInner>>,
    /// Commits to fail with a transient error before succeeding again.
    fail_commits: Arc<AtomicU32>,
    /// Total records ever written to the data dictionary.
    record_puts: Arc<AtomicU64>,
}

#[derive(Debug, Default)]
struct StoreInner {
    meta: HashMap<String, String>,
    data: BTreeMap<String, Vec<u8>>,
    audit: Vec<(String, String)>,
}

impl InMemoryReplicaStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a transient
    /// [`StoreError::CommitFailed`].
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Read a metadata row outside any transaction.
    pub fn meta_get(&self, key: &str) -> Option<String> {
        self.inner.lock().meta.get(key).cloned()
    }

    /// Snapshot of the whole metadata dictionary.
    pub fn meta_snapshot(&self) -> BTreeMap<String, String> {
        self.inner
            .lock()
            .meta
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Committed values of one metadata key, in commit order.
    pub fn meta_audit(&self, key: &str) -> Vec<String> {
        self.inner
            .lock()
            .audit
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Number of records currently in the data dictionary.
    pub fn record_count(&self) -> usize {
        self.inner.lock().data.len()
    }

    /// Read one migrated record.
    pub fn get_record(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().data.get(key).cloned()
    }

    /// Total `put_record` calls that ever committed. Distinguishes
    /// "applied exactly once" from "re-applied and overwritten".
    pub fn record_put_count(&self) -> u64 {
        self.record_puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplicaStore for InMemoryReplicaStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(InMemoryTransaction {
            inner: Arc::clone(&self.inner),
            fail_commits: Arc::clone(&self.fail_commits),
            record_puts: Arc::clone(&self.record_puts),
            meta_writes: Vec::new(),
            data_writes: Vec::new(),
        }))
    }
}

struct InMemoryTransaction {
    inner: Arc<Mutex<StoreInner>>,
    fail_commits: Arc<AtomicU32>,
    record_puts: Arc<AtomicU64>,
    meta_writes: Vec<(String, String)>,
    data_writes: Vec<(String, Vec<u8>)>,
}

impl InMemoryTransaction {
    fn buffered(&self, key: &str) -> Option<&String> {
        self.meta_writes
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn get(&mut self, key: &str) -> Result<Option<String>> {
        if let Some(v) = self.buffered(key) {
            return Ok(Some(v.clone()));
        }
        Ok(self.inner.lock().meta.get(key).cloned())
    }

    async fn insert(&mut self, key: &str, value: &str) -> Result<()> {
        self.meta_writes.push((key.to_string(), value.to_string()));
        Ok(())
    }

    async fn get_or_add(&mut self, key: &str, seed: &str) -> Result<String> {
        if let Some(existing) = self.get(key).await? {
            return Ok(existing);
        }
        self.insert(key, seed).await?;
        Ok(seed.to_string())
    }

    async fn add_or_update(
        &mut self,
        key: &str,
        initial: &str,
        update: UpdateFn<'_>,
    ) -> Result<String> {
        let stored = match self.get(key).await? {
            Some(existing) => update(&existing),
            None => initial.to_string(),
        };
        self.insert(key, &stored).await?;
        Ok(stored)
    }

    async fn put_record(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.data_writes.push((key.to_string(), value.to_vec()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let pending = self.fail_commits.load(Ordering::SeqCst);
        if pending > 0
            && self
                .fail_commits
                .compare_exchange(pending, pending - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(StoreError::CommitFailed("injected commit failure".into()).into());
        }

        let mut inner = self.inner.lock();
        for (k, v) in &self.meta_writes {
            inner.meta.insert(k.clone(), v.clone());
            inner.audit.push((k.clone(), v.clone()));
        }
        let puts = self.data_writes.len() as u64;
        for (k, v) in self.data_writes {
            inner.data.insert(k, v);
        }
        drop(inner);
        self.record_puts.fetch_add(puts, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransaction")
            .field("meta_writes", &self.meta_writes.len())
            .field("data_writes", &self.data_writes.len())
            .finish()
    }
}
