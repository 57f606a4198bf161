//! quotefeed runner: refresh orchestration on top of `quotefeed-core`.
//!
//! - Configuration with built-in defaults
//! - Snapshot writer (atomic replace, unchanged detection, summary, wide tables)
//! - Per-target pipeline on a bounded worker pool
//! - Run outcome model and JSON run log

pub mod config;
pub mod pipeline;
pub mod run;
pub mod snapshot;

pub use config::{ConfigError, IndexSpec, RefreshConfig};
pub use pipeline::{load_targets, refresh_targets, since_date, RefreshPipeline, TargetList};
pub use run::{FailureReason, Outcome, OutputFile, RefreshRun, RunCounts, TargetOutcome};
pub use snapshot::{atomic_write, LoadedSeries, SnapshotWriter, SummaryEntry, WriteError, WriteStatus};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn config_is_send_sync() {
        assert_send::<RefreshConfig>();
        assert_sync::<RefreshConfig>();
    }

    #[test]
    fn snapshot_writer_is_send_sync() {
        assert_send::<SnapshotWriter>();
        assert_sync::<SnapshotWriter>();
    }

    #[test]
    fn refresh_run_is_send_sync() {
        assert_send::<RefreshRun>();
        assert_sync::<RefreshRun>();
    }

    #[test]
    fn pipeline_is_sync() {
        assert_sync::<RefreshPipeline<'static>>();
    }
}
