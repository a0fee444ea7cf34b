//! Metadata keyspace layout.
//!
//! All metadata rows are strings. Global rows are unprefixed; phase and
//! worker rows use composite keys of the shape
//! `Phase_<field>_<phase>_<iter>[_<workerId>]`. Dates are ISO-8601 UTC
//! and enums use their canonical names.

use crate::types::MigrationPhase;

/// When the migration was first started.
pub const MIGRATION_START_DATE_TIME_UTC: &str = "MigrationStartDateTimeUTC";
/// When the migration completed.
pub const MIGRATION_END_DATE_TIME_UTC: &str = "MigrationEndDateTimeUTC";
/// Global migration status.
pub const MIGRATION_CURRENT_STATUS: &str = "MigrationCurrentStatus";
/// Most recently planned phase.
pub const MIGRATION_CURRENT_PHASE: &str = "MigrationCurrentPhase";
/// Frozen at first phase planning.
pub const MIGRATION_START_SEQ_NUM: &str = "MigrationStartSeqNum";
/// Written exactly once, at final phase completion.
pub const MIGRATION_END_SEQ_NUM: &str = "MigrationEndSeqNum";
/// Monotonically non-decreasing; advanced only at phase completion.
pub const MIGRATION_LAST_APPLIED_SEQ_NUM: &str = "MigrationLastAppliedSeqNum";
/// Running total of keys migrated across all phases.
pub const MIGRATION_NO_OF_KEYS_MIGRATED: &str = "MigrationNoOfKeysMigrated";

/// Field names shared by phase-level and worker-level rows.
pub mod field {
    pub const CURRENT_STATUS: &str = "CurrentStatus";
    pub const START_DATE_TIME_UTC: &str = "StartDateTimeUTC";
    pub const END_DATE_TIME_UTC: &str = "EndDateTimeUTC";
    pub const START_SEQ_NUM: &str = "StartSeqNum";
    pub const END_SEQ_NUM: &str = "EndSeqNum";
    pub const LAST_APPLIED_SEQ_NUM: &str = "LastAppliedSeqNum";
    pub const NO_OF_KEYS_MIGRATED: &str = "NoOfKeysMigrated";
    pub const WORKER_COUNT: &str = "WorkerCount";
}

/// Key for a phase-level row of one (phase, iteration).
pub fn phase_key(field: &str, phase: MigrationPhase, iteration: u32) -> String {
    format!("Phase_{}_{}_{}", field, phase, iteration)
}

/// Key for a worker-level row of one (phase, iteration, worker).
pub fn worker_key(field: &str, phase: MigrationPhase, iteration: u32, worker_id: u32) -> String {
    format!("Phase_{}_{}_{}_{}", field, phase, iteration, worker_id)
}

/// Key for the highest iteration planned for a phase. Phase-scoped:
/// the reader walks `1..=iteration_count` for each phase it reports.
pub fn iteration_count_key(phase: MigrationPhase) -> String {
    format!("Phase_IterationCount_{}", phase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_key_shapes() {
        assert_eq!(
            phase_key(field::CURRENT_STATUS, MigrationPhase::Copy, 1),
            "Phase_CurrentStatus_Copy_1"
        );
        assert_eq!(
            phase_key(field::END_SEQ_NUM, MigrationPhase::Catchup, 3),
            "Phase_EndSeqNum_Catchup_3"
        );
        assert_eq!(
            worker_key(field::LAST_APPLIED_SEQ_NUM, MigrationPhase::Copy, 1, 2),
            "Phase_LastAppliedSeqNum_Copy_1_2"
        );
        assert_eq!(
            iteration_count_key(MigrationPhase::Catchup),
            "Phase_IterationCount_Catchup"
        );
    }

    #[test]
    fn test_keys_distinct_across_phases_and_workers() {
        let a = worker_key(field::CURRENT_STATUS, MigrationPhase::Catchup, 1, 2);
        let b = worker_key(field::CURRENT_STATUS, MigrationPhase::Catchup, 2, 1);
        assert_ne!(a, b);
    }
}
