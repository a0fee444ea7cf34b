//! Test support for the migration core.
//!
//! [`MockSource`] is a scriptable in-process stand-in for the legacy
//! KVS partition controller: it holds one record per sequence number
//! and can grow its sequence space on demand to model a live source
//! that keeps taking writes until `RejectWrites` lands.

use crate::error::Result;
use crate::source::SourceService;
use crate::types::{KeyValueRecord, SeqNum};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;


/// Scriptable source service for tests.
///
/// Each `get_end_sn` call, while writes are admitted, applies the next
/// scripted growth amount (or the default growth), appending that many
/// new records to the keyspace. Once `reject_writes` lands the end
/// sequence number is frozen, exactly like the real source.
#[derive(Debug)]
pub struct MockSource {
    inner: Mutex<MockSourceInner>,
    end_sn_calls: AtomicU32,
    reject_calls: AtomicU32,
    resume_calls: AtomicU32,
}

#[derive(Debug)]
struct MockSourceInner {
    start_sn: SeqNum,
    end_sn: SeqNum,
    records: Vec<KeyValueRecord>,
    growth_script: VecDeque<u64>,
    default_growth: u64,
    rejected: bool,
}

impl MockSource {
    /// Source holding one record per sequence number in `[start_sn, end_sn]`.
    pub fn with_range(start_sn: SeqNum, end_sn: SeqNum) -> Self {
        let records = (start_sn..=end_sn)
            .map(|sn| KeyValueRecord::new(sn, Self::key_for(sn), Self::value_for(sn)))
            .collect();
        Self {
            inner: Mutex::new(MockSourceInner {
                start_sn,
                end_sn,
                records,
                growth_script: VecDeque::new(),
                default_growth: 0,
                rejected: false,
            }),
            end_sn_calls: AtomicU32::new(0),
            reject_calls: AtomicU32::new(0),
            resume_calls: AtomicU32::new(0),
        }
    }

    /// Source with an empty sequence space (`start_sn = 1`, `end_sn = 0`).
    pub fn empty() -> Self {
        Self::with_range(1, 0)
    }

    /// Deterministic key for a sequence number.
    pub fn key_for(sn: SeqNum) -> String {
        format!("actor-{:08}", sn)
    }

    /// Deterministic value for a sequence number.
    pub fn value_for(sn: SeqNum) -> Vec<u8> {
        format!("state-{}", sn).into_bytes()
    }

    /// Script the record growth applied by successive `get_end_sn`
    /// calls. After the script is exhausted the default growth applies.
    pub fn script_growth(&self, growths: impl IntoIterator<Item = u64>) {
        self.inner.lock().growth_script.extend(growths);
    }

    /// Growth applied by `get_end_sn` once the script is exhausted.
    pub fn set_default_growth(&self, growth: u64) {
        self.inner.lock().default_growth = growth;
    }

    /// How many times `get_end_sn` was called.
    pub fn end_sn_calls(&self) -> u32 {
        self.end_sn_calls.load(Ordering::SeqCst)
    }

    /// How many times `reject_writes` was called.
    pub fn reject_calls(&self) -> u32 {
        self.reject_calls.load(Ordering::SeqCst)
    }

    /// How many times `resume_writes` was called.
    pub fn resume_calls(&self) -> u32 {
        self.resume_calls.load(Ordering::SeqCst)
    }

    /// Whether the source is currently rejecting writes.
    pub fn is_rejecting(&self) -> bool {
        self.inner.lock().rejected
    }

    /// Current end sequence number, without growing it.
    pub fn current_end_sn(&self) -> SeqNum {
        self.inner.lock().end_sn
    }

    fn grow(inner: &mut MockSourceInner, by: u64) {
        for _ in 0..by {
            inner.end_sn += 1;
            let sn = inner.end_sn;
            inner
                .records
                .push(KeyValueRecord::new(sn, Self::key_for(sn), Self::value_for(sn)));
        }
    }
}

#[async_trait]
impl SourceService for MockSource {
    async fn get_start_sn(&self) -> Result<SeqNum> {
        Ok(self.inner.lock().start_sn)
    }

    async fn get_end_sn(&self) -> Result<SeqNum> {
        self.end_sn_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        if !inner.rejected {
            let growth = inner
                .growth_script
                .pop_front()
                .unwrap_or(inner.default_growth);
            Self::grow(&mut inner, growth);
        }
        Ok(inner.end_sn)
    }

    async fn enumerate(
        &self,
        from: SeqNum,
        to: SeqNum,
    ) -> Result<mpsc::Receiver<Result<KeyValueRecord>>> {
        let records: Vec<KeyValueRecord> = {
            let inner = self.inner.lock();
            inner
                .records
                .iter()
                .filter(|r| r.seq_num >= from && r.seq_num <= to)
                .cloned()
                .collect()
        };
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            for record in records {
                if tx.send(Ok(record)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn reject_writes(&self) -> Result<()> {
        self.reject_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().rejected = true;
        Ok(())
    }

    async fn resume_writes(&self) -> Result<()> {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().rejected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_source_growth_script() {
        let source = MockSource::with_range(1, 100);
        source.script_growth([10, 0]);

        assert_eq!(source.get_end_sn().await.unwrap(), 110);
        assert_eq!(source.get_end_sn().await.unwrap(), 110);
        // Script exhausted, default growth is zero.
        assert_eq!(source.get_end_sn().await.unwrap(), 110);

        source.reject_writes().await.unwrap();
        source.script_growth([50]);
        // Frozen while rejecting writes.
        assert_eq!(source.get_end_sn().await.unwrap(), 110);
        assert_eq!(source.end_sn_calls(), 4);
    }

    #[tokio::test]
    async fn test_mock_source_enumerate_ascending() {
        let source = MockSource::with_range(1, 20);
        let mut rx = source.enumerate(3, 7).await.unwrap();
        let mut seen = Vec::new();
        while let Some(record) = rx.recv().await {
            seen.push(record.unwrap().seq_num);
        }
        assert_eq!(seen, vec![3, 4, 5, 6, 7]);
    }
}
