//! Live state migration orchestrator with bounded-downtime cutover.
//!
//! This crate migrates the complete keyspace of an actor service from a
//! legacy key/value store (KVS) to a new replicated-collection store
//! while the legacy service keeps accepting writes, then cuts traffic
//! over. It provides:
//!
//! - **Ordered phases** - `Copy -> Catchup* -> Downtime`, with Catchup
//!   iterating until the remaining sequence-number delta drops below
//!   the configured downtime threshold
//! - **Transactional bookkeeping** - every plan and checkpoint lives in
//!   the destination's replicated metadata dictionary, so a replica
//!   failover resumes exactly where the previous primary stopped
//! - **Parallel sharded workers** - each phase's sequence range is
//!   partitioned across N workers streaming from the source in parallel
//! - **Request forwarding** - incoming actor calls are forwarded to the
//!   source primary until cutover is durable
//!
//! # Example
//!
//! ```rust,no_run
//! use cutover::{HttpSourceClient, MigrationOrchestrator, MigrationSettings};
//! use std::sync::Arc;
//!
//! # #[derive(Debug)] struct MyReplicaStore;
//! # #[async_trait::async_trait]
//! # impl cutover::ReplicaStore for MyReplicaStore {
//! #     async fn begin(&self) -> cutover::Result<Box<dyn cutover::StoreTransaction>> {
//! #         unimplemented!()
//! #     }
//! # }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = MigrationSettings::new("http://kvs-host:19081/KvsMigration")
//!         .with_copy_workers(8)
//!         .with_downtime_threshold(1024);
//!
//!     let source = Arc::new(HttpSourceClient::new(&settings)?);
//!     let store = Arc::new(MyReplicaStore);
//!
//!     let orchestrator = MigrationOrchestrator::new(settings, store, source)?;
//!     let result = orchestrator.run().await?;
//!     println!("migrated {} keys", result.keys_migrated);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │           MigrationOrchestrator              │
//! │   Copy ──▶ Catchup(i) ──▶ Downtime ──▶ done  │
//! │              ▲    │ delta > threshold        │
//! │              └────┘                          │
//! └──────────────────────────────────────────────┘
//!          │                        │
//!          ▼                        ▼
//! ┌─────────────────┐      ┌─────────────────┐
//! │  PhaseWorkload  │      │ ForwardingGate  │
//! │  plan + fan-out │      │  per-request    │
//! └─────────────────┘      └─────────────────┘
//!          │ N workers
//!          ▼
//! ┌─────────────────┐      ┌─────────────────┐
//! │ MigrationWorker │─────▶│  ReplicaStore   │
//! │  stream + apply │      │ (transactional) │
//! └─────────────────┘      └─────────────────┘
//!          ▲
//!          │ HTTP: GetStartSN / GetEndSN /
//!          │       EnumerateKeys / RejectWrites
//! ┌─────────────────┐
//! │  SourceService  │
//! └─────────────────┘
//! ```
//!
//! # Consistency model
//!
//! - **Planning**: every phase-planning row is written with
//!   `get_or_add`, so a resumed primary always observes the committed
//!   plan, never a recomputed one
//! - **Progress**: workers checkpoint their own rows with each applied
//!   batch in one transaction; the global last-applied sequence number
//!   only advances at phase completion and is monotonic
//! - **Cutover**: `MigrationEndSeqNum` is written at most once; its
//!   absence is the definition of an incomplete migration

pub mod api;
pub mod config;
pub mod error;
pub mod forwarding;
pub mod keys;
pub mod metadata;
pub mod metrics;
pub mod orchestrator;
pub mod phase;
pub mod source;
pub mod store;
pub mod testing;
pub mod types;
pub mod worker;

// Re-export main types for convenience
pub use config::{MigrationSettings, RetryPolicy};
pub use error::{Error, Result, SourceError, StoreError};
pub use types::{
    KeyValueRecord, MigrationPhase, MigrationResult, MigrationState, PhaseInput, PhaseResult,
    SeqNum, WorkerInput, WorkerResult,
};

// Re-export the component surface
pub use api::migration_router;
pub use forwarding::{ActorCall, ActorCallHandler, ForwardingDispatcher, MigrationGate};
pub use metadata::MetadataView;
pub use metrics::{MigrationMetrics, MigrationMetricsSnapshot};
pub use orchestrator::MigrationOrchestrator;
pub use phase::PhaseWorkload;
pub use source::{HttpSourceClient, SourceService};
pub use store::{
    InMemoryReplicaStore, NoOpTransform, RecordTransform, ReplicaStore, StoreTransaction,
};
pub use worker::MigrationWorker;
