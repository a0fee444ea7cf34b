//! Core types used throughout the migration core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Logical sequence number assigned by the source store to every
/// applied write. The migration's unit of progress.
pub type SeqNum = i64;

/// Global migration mode, also used as the per-phase and per-worker
/// lifecycle status. Rows transition `None -> InProgress -> Completed`
/// (or stay at `InProgress` across a failover and resume).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationState {
    /// Not started.
    None,
    /// Running, resumable after failover.
    InProgress,
    /// Finished; terminal for phases and workers, cutover for the migration.
    Completed,
    /// Externally aborted; resumable by re-running start.
    Aborted,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationState::None => "None",
            MigrationState::InProgress => "InProgress",
            MigrationState::Completed => "Completed",
            MigrationState::Aborted => "Aborted",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for MigrationState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "None" => Ok(MigrationState::None),
            "InProgress" => Ok(MigrationState::InProgress),
            "Completed" => Ok(MigrationState::Completed),
            "Aborted" => Ok(MigrationState::Aborted),
            other => Err(format!("unknown migration state: {}", other)),
        }
    }
}

/// Ordered migration phase. The orchestrator only ever moves forward:
/// `None < Copy < Catchup < Downtime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MigrationPhase {
    /// No phase planned yet.
    None,
    /// Bulk copy of the snapshot sequence range.
    Copy,
    /// Iterated copy of the delta that accumulated during the previous phase.
    Catchup,
    /// Final delta copy while the source rejects writes.
    Downtime,
}

impl MigrationPhase {
    /// Phases that carry worker fan-out, in execution order.
    pub const RUNNABLE: [MigrationPhase; 3] = [
        MigrationPhase::Copy,
        MigrationPhase::Catchup,
        MigrationPhase::Downtime,
    ];

    /// Whether this phase re-runs with increasing iteration numbers.
    pub fn iterates(&self) -> bool {
        matches!(self, MigrationPhase::Catchup)
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationPhase::None => "None",
            MigrationPhase::Copy => "Copy",
            MigrationPhase::Catchup => "Catchup",
            MigrationPhase::Downtime => "Downtime",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for MigrationPhase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "None" => Ok(MigrationPhase::None),
            "Copy" => Ok(MigrationPhase::Copy),
            "Catchup" => Ok(MigrationPhase::Catchup),
            "Downtime" => Ok(MigrationPhase::Downtime),
            other => Err(format!("unknown migration phase: {}", other)),
        }
    }
}

/// A single key/value record streamed from the source, tagged with the
/// sequence number of the write that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueRecord {
    /// Sequence number assigned by the source store.
    pub seq_num: SeqNum,
    /// Record key.
    pub key: String,
    /// Opaque record value.
    pub value: Vec<u8>,
}

impl KeyValueRecord {
    /// Create a new record.
    pub fn new(seq_num: SeqNum, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            seq_num,
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Plan for one worker of one (phase, iteration), as recorded in the
/// metadata keyspace. The values returned by planning's `getOrAdd`
/// calls are authoritative; a resumed primary observes the same plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInput {
    /// 1-based worker id within the phase.
    pub worker_id: u32,
    /// Phase this worker belongs to.
    pub phase: MigrationPhase,
    /// Iteration of the phase.
    pub iteration: u32,
    /// First sequence number of the worker's slice.
    pub start_sn: SeqNum,
    /// Last sequence number of the worker's slice. `end_sn < start_sn`
    /// denotes an empty slice; the worker completes immediately.
    pub end_sn: SeqNum,
    /// When the worker row was planned.
    pub started_at: DateTime<Utc>,
    /// Worker lifecycle status at planning time.
    pub status: MigrationState,
}

impl WorkerInput {
    /// Whether the worker has nothing to stream.
    pub fn is_empty_range(&self) -> bool {
        self.start_sn > self.end_sn
    }
}

/// Plan for one (phase, iteration).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseInput {
    /// Phase being planned.
    pub phase: MigrationPhase,
    /// Iteration of the phase.
    pub iteration: u32,
    /// First sequence number covered by this phase.
    pub start_sn: SeqNum,
    /// Last sequence number covered by this phase.
    pub end_sn: SeqNum,
    /// Number of workers the range is sharded across.
    pub worker_count: u32,
    /// When the phase was planned.
    pub started_at: DateTime<Utc>,
    /// Phase lifecycle status at planning time.
    pub status: MigrationState,
    /// Per-worker plans, disjoint and contiguous over `[start_sn, end_sn]`.
    pub worker_inputs: Vec<WorkerInput>,
}

/// Observed outcome of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResult {
    /// 1-based worker id within the phase.
    pub worker_id: u32,
    /// Worker lifecycle status.
    pub status: MigrationState,
    /// When the worker row was planned.
    pub started_at: Option<DateTime<Utc>>,
    /// When the worker completed, if it has.
    pub ended_at: Option<DateTime<Utc>>,
    /// First sequence number of the worker's slice.
    pub start_sn: SeqNum,
    /// Last sequence number of the worker's slice.
    pub end_sn: SeqNum,
    /// Highest sequence number durably applied, if any batch committed.
    pub last_applied_sn: Option<SeqNum>,
    /// Number of keys this worker applied.
    pub keys_migrated: u64,
}

/// Observed outcome of one (phase, iteration).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseResult {
    /// Phase this result describes.
    pub phase: MigrationPhase,
    /// Iteration of the phase.
    pub iteration: u32,
    /// Phase lifecycle status.
    pub status: MigrationState,
    /// When the phase was planned.
    pub started_at: Option<DateTime<Utc>>,
    /// When the phase completed, if it has.
    pub ended_at: Option<DateTime<Utc>>,
    /// First sequence number covered by this phase.
    pub start_sn: SeqNum,
    /// Last sequence number covered by this phase.
    pub end_sn: SeqNum,
    /// Highest sequence number recorded at phase completion.
    pub last_applied_sn: Option<SeqNum>,
    /// Keys applied across all workers of this (phase, iteration).
    pub keys_migrated: u64,
    /// Per-worker outcomes.
    pub worker_results: Vec<WorkerResult>,
}

/// Aggregate migration report, reconstructed from the metadata
/// keyspace by the reader side. Always reflects the last durable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Global migration status.
    pub status: MigrationState,
    /// Phase the orchestrator most recently planned.
    pub current_phase: MigrationPhase,
    /// Frozen at the first phase's planning; `None` before that.
    pub start_sn: Option<SeqNum>,
    /// Written exactly once, when the final phase completes. Its
    /// absence is the definition of "migration incomplete".
    pub end_sn: Option<SeqNum>,
    /// Highest sequence number durably applied across the migration.
    pub last_applied_sn: Option<SeqNum>,
    /// Total keys migrated across all phases.
    pub keys_migrated: u64,
    /// When the migration started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the migration completed, if it has.
    pub ended_at: Option<DateTime<Utc>>,
    /// One entry per completed or in-flight (phase, iteration).
    pub phase_results: Vec<PhaseResult>,
}
