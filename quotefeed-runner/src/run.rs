//! Outcome model for one refresh invocation, its run log and summary table.

use crate::snapshot::{atomic_write, WriteStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use quotefeed_core::data::{DataSource, MergeStats};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    /// Prices written, capital flow missing.
    Partial,
    Failed,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Partial => "partial",
            Outcome::Failed => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Outcome::Failed)
    }
}

/// Why a target failed, by stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum FailureReason {
    Load { kind: String, message: String },
    Fetch { kind: String, message: String },
    Write { kind: String, message: String },
}

impl FailureReason {
    pub fn short(&self) -> String {
        match self {
            FailureReason::Load { kind, .. } => format!("load: {kind}"),
            FailureReason::Fetch { kind, .. } => format!("fetch: {kind}"),
            FailureReason::Write { kind, .. } => format!("write: {kind}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub target_id: String,
    pub display_name: String,
    pub kind: String,
    pub outcome: Outcome,
    /// Cutoff used for the fetch; `None` means full history.
    pub since: Option<NaiveDate>,
    pub source: Option<DataSource>,
    pub fetched_rows: usize,
    pub merge: MergeStats,
    /// Rows in the series after this run.
    pub total_rows: usize,
    pub write: Option<WriteStatus>,
    pub flow_error: Option<String>,
    pub failure: Option<FailureReason>,
    pub elapsed_ms: u64,
}

/// Status of one aggregate file (`latest.json`, the wide tables).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub file: String,
    /// `None` when the file was skipped (nothing to put in it).
    pub status: Option<WriteStatus>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub ok: usize,
    pub partial: usize,
    pub failed: usize,
}

impl RunCounts {
    pub fn total(&self) -> usize {
        self.ok + self.partial + self.failed
    }
}

/// Everything one invocation attempted and how each target ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshRun {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub as_of: NaiveDate,
    pub full_refresh: bool,
    pub targets: Vec<TargetOutcome>,
    pub outputs: Vec<OutputFile>,
    /// The holdings list could not be read; only indices were refreshed.
    #[serde(default)]
    pub holdings_failure: Option<FailureReason>,
}

impl RefreshRun {
    pub fn counts(&self) -> RunCounts {
        self.targets
            .iter()
            .fold(RunCounts::default(), |mut c, t| {
                match t.outcome {
                    Outcome::Ok => c.ok += 1,
                    Outcome::Partial => c.partial += 1,
                    Outcome::Failed => c.failed += 1,
                }
                c
            })
    }

    /// True when nothing was refreshed: every target failed, or there were none.
    pub fn is_total_failure(&self) -> bool {
        !self.targets.iter().any(|t| t.outcome.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &TargetOutcome> {
        self.targets.iter().filter(|t| t.outcome == Outcome::Failed)
    }

    /// Persist as pretty JSON, replacing any previous log atomically.
    pub fn write_log(&self, path: &Path) -> Result<()> {
        let mut json = serde_json::to_string_pretty(self).context("serialize run log")?;
        json.push('\n');
        atomic_write(path, json.as_bytes())
            .with_context(|| format!("write run log {}", path.display()))?;
        Ok(())
    }

    /// Plain-text table for stdout.
    pub fn summary_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<12} {:<10} {:<8} {:>6} {:>6} {:>7} {:<10} {}",
            "Target", "Name", "Outcome", "Added", "Rev.", "Rows", "File", "Detail"
        );
        let _ = writeln!(out, "{}", "-".repeat(78));
        for t in &self.targets {
            let file = t.write.map_or("-", |w| match w {
                WriteStatus::Written => "written",
                WriteStatus::Unchanged => "unchanged",
            });
            let detail = match (&t.failure, &t.flow_error) {
                (Some(reason), _) => reason.short(),
                (None, Some(_)) => "no capital flow".to_string(),
                (None, None) => t.source.map(|s| s.to_string()).unwrap_or_default(),
            };
            let _ = writeln!(
                out,
                "{:<12} {:<10} {:<8} {:>6} {:>6} {:>7} {:<10} {}",
                t.target_id,
                t.display_name,
                t.outcome.label(),
                t.merge.added,
                t.merge.revised,
                t.total_rows,
                file,
                detail
            );
        }
        let c = self.counts();
        let _ = writeln!(
            out,
            "\n{} targets: {} ok, {} partial, {} failed",
            c.total(),
            c.ok,
            c.partial,
            c.failed
        );
        if let Some(reason) = &self.holdings_failure {
            let _ = writeln!(out, "holdings list: {}", reason.short());
        }
        for o in &self.outputs {
            let status = match (&o.error, o.status) {
                (Some(e), _) => format!("error: {e}"),
                (None, Some(WriteStatus::Written)) => "written".into(),
                (None, Some(WriteStatus::Unchanged)) => "unchanged".into(),
                (None, None) => "skipped".into(),
            };
            let _ = writeln!(out, "{}: {status}", o.file);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(id: &str, outcome: Outcome) -> TargetOutcome {
        TargetOutcome {
            target_id: id.into(),
            display_name: id.into(),
            kind: "holding".into(),
            outcome,
            since: None,
            source: None,
            fetched_rows: 0,
            merge: MergeStats::default(),
            total_rows: 0,
            write: None,
            flow_error: None,
            failure: (outcome == Outcome::Failed).then(|| FailureReason::Fetch {
                kind: "unreachable".into(),
                message: "connection refused".into(),
            }),
            elapsed_ms: 0,
        }
    }

    fn run(targets: Vec<TargetOutcome>) -> RefreshRun {
        let now = Utc::now();
        RefreshRun {
            started_at: now,
            finished_at: now,
            as_of: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            full_refresh: false,
            targets,
            outputs: vec![],
            holdings_failure: None,
        }
    }

    #[test]
    fn one_success_is_enough() {
        let r = run(vec![
            outcome("A.SS", Outcome::Failed),
            outcome("B.SS", Outcome::Partial),
            outcome("C.SS", Outcome::Failed),
        ]);
        assert!(!r.is_total_failure());
        assert_eq!(
            r.counts(),
            RunCounts {
                ok: 0,
                partial: 1,
                failed: 2
            }
        );
        assert_eq!(r.failures().count(), 2);
    }

    #[test]
    fn all_failed_or_empty_is_total_failure() {
        assert!(run(vec![outcome("A.SS", Outcome::Failed)]).is_total_failure());
        assert!(run(vec![]).is_total_failure());
    }

    #[test]
    fn summary_table_lists_every_target() {
        let table = run(vec![outcome("A.SS", Outcome::Ok), outcome("B.SS", Outcome::Failed)])
            .summary_table();
        assert!(table.contains("A.SS"));
        assert!(table.contains("fetch: unreachable"));
        assert!(table.contains("2 targets: 1 ok, 0 partial, 1 failed"));
        assert!(!table.contains("holdings list"));
    }

    #[test]
    fn holdings_failure_is_reported_but_not_fatal() {
        let mut r = run(vec![outcome("000001.SS", Outcome::Ok)]);
        r.holdings_failure = Some(FailureReason::Load {
            kind: "not_found".into(),
            message: "holdings file not found: data/holdings.csv".into(),
        });
        assert!(!r.is_total_failure());
        assert!(r.summary_table().contains("holdings list: load: not_found"));

        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["holdings_failure"]["stage"], "load");
    }

    #[test]
    fn run_log_is_json_with_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("last_run.json");
        run(vec![outcome("A.SS", Outcome::Failed)]).write_log(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["targets"][0]["outcome"], "failed");
        assert_eq!(value["targets"][0]["failure"]["stage"], "fetch");
    }
}
