//! Typed facade over the metadata dictionary.
//!
//! All metadata rows are stored as invariant strings; this view parses
//! them into `i64`/`u32`/`u64`/`DateTime<Utc>`/`MigrationState`/
//! `MigrationPhase` on the way out and renders them canonically on the
//! way in. A parse failure is corruption and is fatal for the phase
//! that hit it. Every operation is bounded by the store lease;
//! exceeding the lease aborts the operation and the caller retries
//! under its retry policy.

use crate::error::{Error, Result, StoreError};
use crate::store::StoreTransaction;
use crate::types::{MigrationPhase, MigrationState, SeqNum};
use chrono::{DateTime, SecondsFormat, Utc};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

/// Render a timestamp the way the keyspace stores it.
pub fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Typed, lease-bounded view over one open transaction.
pub struct MetadataView<'a> {
    tx: &'a mut dyn StoreTransaction,
    lease: Duration,
}

impl<'a> MetadataView<'a> {
    /// Wrap a transaction with the given per-operation lease.
    pub fn new(tx: &'a mut dyn StoreTransaction, lease: Duration) -> Self {
        Self { tx, lease }
    }

    async fn bounded<T>(lease: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(lease, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::LeaseExpired.into()),
        }
    }

    fn corruption<E: std::fmt::Display>(key: &str) -> impl FnOnce(E) -> Error + '_ {
        move |e| Error::Corruption {
            key: key.to_string(),
            reason: e.to_string(),
        }
    }

    /// Read a row, failing with `NotFound` if absent.
    pub async fn get(&mut self, key: &str) -> Result<String> {
        self.get_or_default(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()).into())
    }

    /// Read a row; absence is not an error.
    pub async fn get_or_default(&mut self, key: &str) -> Result<Option<String>> {
        Self::bounded(self.lease, self.tx.get(key)).await
    }

    /// Insert-if-absent, returning the authoritative stored value.
    pub async fn get_or_add(&mut self, key: &str, seed: &str) -> Result<String> {
        Self::bounded(self.lease, self.tx.get_or_add(key, seed)).await
    }

    /// Write a row unconditionally.
    pub async fn set(&mut self, key: &str, value: &str) -> Result<()> {
        Self::bounded(self.lease, self.tx.insert(key, value)).await
    }

    // ------------------------------------------------------------------
    // i64 sequence numbers
    // ------------------------------------------------------------------

    pub async fn get_long(&mut self, key: &str) -> Result<SeqNum> {
        let raw = self.get(key).await?;
        raw.parse::<i64>().map_err(Self::corruption(key))
    }

    pub async fn get_or_default_long(&mut self, key: &str) -> Result<Option<SeqNum>> {
        match self.get_or_default(key).await? {
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .map_err(Self::corruption(key)),
            None => Ok(None),
        }
    }

    pub async fn get_or_add_long(&mut self, key: &str, seed: SeqNum) -> Result<SeqNum> {
        let raw = self.get_or_add(key, &seed.to_string()).await?;
        raw.parse::<i64>().map_err(Self::corruption(key))
    }

    pub async fn set_long(&mut self, key: &str, value: SeqNum) -> Result<()> {
        self.set(key, &value.to_string()).await
    }

    /// Advance a sequence-number row to `candidate`, never rewinding.
    pub async fn advance_long(&mut self, key: &str, candidate: SeqNum) -> Result<SeqNum> {
        let stored = match self.get_or_default_long(key).await? {
            Some(existing) => existing.max(candidate),
            None => candidate,
        };
        let initial = candidate.to_string();
        let next = stored.to_string();
        Self::bounded(
            self.lease,
            self.tx.add_or_update(key, &initial, &mut |_| next.clone()),
        )
        .await?;
        Ok(stored)
    }

    // ------------------------------------------------------------------
    // u32 / u64 counters
    // ------------------------------------------------------------------

    pub async fn get_or_default_u32(&mut self, key: &str) -> Result<Option<u32>> {
        match self.get_or_default(key).await? {
            Some(raw) => raw
                .parse::<u32>()
                .map(Some)
                .map_err(Self::corruption(key)),
            None => Ok(None),
        }
    }

    pub async fn get_or_add_u32(&mut self, key: &str, seed: u32) -> Result<u32> {
        let raw = self.get_or_add(key, &seed.to_string()).await?;
        raw.parse::<u32>().map_err(Self::corruption(key))
    }

    pub async fn set_u32(&mut self, key: &str, value: u32) -> Result<()> {
        self.set(key, &value.to_string()).await
    }

    pub async fn get_or_default_u64(&mut self, key: &str) -> Result<Option<u64>> {
        match self.get_or_default(key).await? {
            Some(raw) => raw
                .parse::<u64>()
                .map(Some)
                .map_err(Self::corruption(key)),
            None => Ok(None),
        }
    }

    /// Add `delta` to a counter row, seeding it at `delta` if absent.
    pub async fn add_u64(&mut self, key: &str, delta: u64) -> Result<u64> {
        let stored = self.get_or_default_u64(key).await?.unwrap_or(0) + delta;
        let initial = delta.to_string();
        let next = stored.to_string();
        Self::bounded(
            self.lease,
            self.tx.add_or_update(key, &initial, &mut |_| next.clone()),
        )
        .await?;
        Ok(stored)
    }

    pub async fn set_u64(&mut self, key: &str, value: u64) -> Result<()> {
        self.set(key, &value.to_string()).await
    }

    // ------------------------------------------------------------------
    // timestamps
    // ------------------------------------------------------------------

    pub async fn get_or_default_datetime(&mut self, key: &str) -> Result<Option<DateTime<Utc>>> {
        match self.get_or_default(key).await? {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(Self::corruption(key)),
            None => Ok(None),
        }
    }

    pub async fn get_or_add_datetime(
        &mut self,
        key: &str,
        seed: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let raw = self.get_or_add(key, &format_datetime(seed)).await?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(Self::corruption(key))
    }

    // ------------------------------------------------------------------
    // enums
    // ------------------------------------------------------------------

    pub async fn get_or_default_state(&mut self, key: &str) -> Result<Option<MigrationState>> {
        match self.get_or_default(key).await? {
            Some(raw) => MigrationState::from_str(&raw)
                .map(Some)
                .map_err(Self::corruption(key)),
            None => Ok(None),
        }
    }

    pub async fn get_or_add_state(
        &mut self,
        key: &str,
        seed: MigrationState,
    ) -> Result<MigrationState> {
        let raw = self.get_or_add(key, &seed.to_string()).await?;
        MigrationState::from_str(&raw).map_err(Self::corruption(key))
    }

    pub async fn set_state(&mut self, key: &str, value: MigrationState) -> Result<()> {
        self.set(key, &value.to_string()).await
    }

    pub async fn get_or_default_phase(&mut self, key: &str) -> Result<Option<MigrationPhase>> {
        match self.get_or_default(key).await? {
            Some(raw) => MigrationPhase::from_str(&raw)
                .map(Some)
                .map_err(Self::corruption(key)),
            None => Ok(None),
        }
    }

    pub async fn set_phase(&mut self, key: &str, value: MigrationPhase) -> Result<()> {
        self.set(key, &value.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryReplicaStore, ReplicaStore};

    const LEASE: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_typed_round_trips() {
        let store = InMemoryReplicaStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut view = MetadataView::new(tx.as_mut(), LEASE);

        view.set_long("sn", 42).await.unwrap();
        assert_eq!(view.get_long("sn").await.unwrap(), 42);

        view.set_state("status", MigrationState::InProgress)
            .await
            .unwrap();
        assert_eq!(
            view.get_or_default_state("status").await.unwrap(),
            Some(MigrationState::InProgress)
        );

        view.set_phase("phase", MigrationPhase::Catchup)
            .await
            .unwrap();
        assert_eq!(
            view.get_or_default_phase("phase").await.unwrap(),
            Some(MigrationPhase::Catchup)
        );

        let now = Utc::now();
        let stored = view.get_or_add_datetime("ts", now).await.unwrap();
        assert_eq!(stored, now);
    }

    #[tokio::test]
    async fn test_get_missing_key_is_not_found() {
        let store = InMemoryReplicaStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut view = MetadataView::new(tx.as_mut(), LEASE);

        let err = view.get("missing").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Store(StoreError::NotFound(ref key)) if key == "missing"
        ));
        assert_eq!(view.get_or_default_long("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_parse_failure_is_corruption() {
        let store = InMemoryReplicaStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut view = MetadataView::new(tx.as_mut(), LEASE);

        view.set("sn", "not-a-number").await.unwrap();
        let err = view.get_long("sn").await.unwrap_err();
        assert!(matches!(err, Error::Corruption { .. }));
        assert!(!err.is_transient());

        view.set("status", "Paused").await.unwrap();
        let err = view.get_or_default_state("status").await.unwrap_err();
        assert!(matches!(err, Error::Corruption { .. }));
    }

    #[tokio::test]
    async fn test_advance_long_never_rewinds() {
        let store = InMemoryReplicaStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut view = MetadataView::new(tx.as_mut(), LEASE);

        assert_eq!(view.advance_long("last", 100).await.unwrap(), 100);
        assert_eq!(view.advance_long("last", 50).await.unwrap(), 100);
        assert_eq!(view.advance_long("last", 250).await.unwrap(), 250);
        assert_eq!(view.get_long("last").await.unwrap(), 250);
    }

    #[tokio::test]
    async fn test_add_u64_counter() {
        let store = InMemoryReplicaStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut view = MetadataView::new(tx.as_mut(), LEASE);

        assert_eq!(view.add_u64("keys", 250).await.unwrap(), 250);
        assert_eq!(view.add_u64("keys", 750).await.unwrap(), 1000);
        assert_eq!(view.get_or_default_u64("keys").await.unwrap(), Some(1000));
    }

    #[tokio::test]
    async fn test_get_or_add_observes_existing_plan() {
        let store = InMemoryReplicaStore::new();

        let mut tx = store.begin().await.unwrap();
        let mut view = MetadataView::new(tx.as_mut(), LEASE);
        assert_eq!(view.get_or_add_long("start", 1).await.unwrap(), 1);
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut view = MetadataView::new(tx.as_mut(), LEASE);
        assert_eq!(view.get_or_add_long("start", 99).await.unwrap(), 1);
    }
}
