//! Refresh pipeline: load → resolve → merge → write, per target.
//!
//! Each target is isolated: whatever goes wrong is recorded in its
//! [`TargetOutcome`] and the other targets carry on. Targets run on a bounded
//! rayon pool; results come back in target order, so output does not depend
//! on the worker count. Aggregate files are written once, after every target
//! has finished.

use crate::config::RefreshConfig;
use crate::run::{FailureReason, Outcome, OutputFile, RefreshRun, TargetOutcome};
use crate::snapshot::{
    SnapshotWriter, WriteError, WriteStatus, HOLDING_TABLE_FILE, INDEX_TABLE_FILE, SUMMARY_FILE,
};
use chrono::{Days, NaiveDate, Utc};
use quotefeed_core::data::holdings::{load_holdings, HoldingsError};
use quotefeed_core::data::normalize::attach_capital_flow;
use quotefeed_core::data::series_csv::quantize;
use quotefeed_core::data::{merge_with_stats, FetchError, SourceResolver};
use quotefeed_core::domain::{Series, Target};
use rayon::prelude::*;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{error, info, warn};

/// Configured indices first, then the holdings list, both in file order.
///
/// A holding whose id matches a configured index is dropped: both would
/// report under the same id in `latest.json`.
pub fn load_targets(config: &RefreshConfig) -> Result<Vec<Target>, HoldingsError> {
    let holdings = load_holdings(&config.holdings_csv)?;
    if holdings.skipped > 0 {
        warn!(
            skipped = holdings.skipped,
            path = %config.holdings_csv.display(),
            "holdings rows skipped"
        );
    }
    let mut targets = config.index_targets();
    for holding in holdings.targets {
        if targets.iter().any(|t| t.id.eq_ignore_ascii_case(&holding.id)) {
            warn!(target_id = %holding.id, "holding shadows a configured index, skipped");
            continue;
        }
        targets.push(holding);
    }
    Ok(targets)
}

/// What a refresh works on.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetList {
    pub targets: Vec<Target>,
    /// Set when the holdings list could not be read.
    pub holdings_failure: Option<FailureReason>,
}

/// Like [`load_targets`], but an unreadable holdings list only costs the
/// holdings: the configured indices are still refreshed.
pub fn refresh_targets(config: &RefreshConfig) -> TargetList {
    match load_targets(config) {
        Ok(targets) => TargetList {
            targets,
            holdings_failure: None,
        },
        Err(e) => {
            error!(
                path = %config.holdings_csv.display(),
                error = %e,
                "holdings not loaded, refreshing indices only"
            );
            TargetList {
                targets: config.index_targets(),
                holdings_failure: Some(FailureReason::Load {
                    kind: e.kind().into(),
                    message: e.to_string(),
                }),
            }
        }
    }
}

/// Cutoff for an incremental fetch: last stored date minus the overlap.
pub fn since_date(stored: &Series, overlap_days: u32) -> Option<NaiveDate> {
    stored
        .last_date()
        .map(|last| last.checked_sub_days(Days::new(u64::from(overlap_days))).unwrap_or(last))
}

pub struct RefreshPipeline<'a> {
    config: &'a RefreshConfig,
    resolver: &'a SourceResolver,
    writer: SnapshotWriter,
    full: bool,
    only: Vec<String>,
    holdings_failure: Option<FailureReason>,
}

/// Aggregate key: an index and a holding may share an id.
type SeriesKey<'t> = (&'static str, &'t str);

fn key(target: &Target) -> SeriesKey<'_> {
    (target.kind.label(), target.id.as_str())
}

/// What a target ended with, plus the series to summarise it by.
struct Finished {
    outcome: TargetOutcome,
    series: Series,
}

impl<'a> RefreshPipeline<'a> {
    pub fn new(config: &'a RefreshConfig, resolver: &'a SourceResolver) -> Self {
        Self {
            config,
            resolver,
            writer: SnapshotWriter::new(&config.out_dir, &config.date_format),
            full: false,
            only: Vec::new(),
            holdings_failure: None,
        }
    }

    /// Ignore stored data and fetch full history for every target.
    pub fn full_refresh(mut self, full: bool) -> Self {
        self.full = full;
        self
    }

    /// Refresh only these ids (case-insensitive). Empty means all.
    pub fn only(mut self, ids: Vec<String>) -> Self {
        self.only = ids;
        self
    }

    /// Carry a holdings-list failure into the run record.
    pub fn holdings_failure(mut self, failure: Option<FailureReason>) -> Self {
        self.holdings_failure = failure;
        self
    }

    pub fn writer(&self) -> &SnapshotWriter {
        &self.writer
    }

    fn is_selected(&self, target: &Target) -> bool {
        self.only.is_empty() || self.only.iter().any(|id| id.eq_ignore_ascii_case(&target.id))
    }

    /// Refresh `targets` and rewrite the aggregate files.
    pub fn run(&self, targets: &[Target]) -> RefreshRun {
        let started_at = Utc::now();
        let selected: Vec<&Target> = targets.iter().filter(|t| self.is_selected(t)).collect();
        info!(
            targets = selected.len(),
            configured = targets.len(),
            workers = self.config.max_workers,
            full = self.full,
            "refresh starting"
        );

        let finished = self.refresh_all(&selected);

        let mut final_series: HashMap<SeriesKey<'_>, Series> = HashMap::new();
        let mut outcomes = Vec::with_capacity(finished.len());
        for (target, done) in selected.iter().zip(finished) {
            final_series.insert(key(target), done.series);
            outcomes.push(done.outcome);
        }
        // Unselected targets still appear in the aggregates, from disk.
        for target in targets {
            if !final_series.contains_key(&key(target)) {
                let stored = self
                    .writer
                    .load(target)
                    .map(|l| l.series)
                    .unwrap_or_else(|_| Series::empty(&target.id));
                final_series.insert(key(target), stored);
            }
        }

        let outputs = self.write_aggregates(targets, &final_series);

        let run = RefreshRun {
            started_at,
            finished_at: Utc::now(),
            as_of: self.resolver.as_of(),
            full_refresh: self.full,
            targets: outcomes,
            outputs,
            holdings_failure: self.holdings_failure.clone(),
        };
        let c = run.counts();
        info!(ok = c.ok, partial = c.partial, failed = c.failed, "refresh finished");
        run
    }

    fn refresh_all(&self, selected: &[&Target]) -> Vec<Finished> {
        if self.config.max_workers > 1 && selected.len() > 1 {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.max_workers)
                .build()
            {
                Ok(pool) => {
                    return pool.install(|| {
                        selected
                            .par_iter()
                            .map(|target| self.refresh_target(target))
                            .collect()
                    });
                }
                Err(e) => warn!(error = %e, "worker pool unavailable, running sequentially"),
            }
        }
        selected.iter().map(|target| self.refresh_target(target)).collect()
    }

    /// One target, start to finish. Never panics on provider or disk errors.
    fn refresh_target(&self, target: &Target) -> Finished {
        let started = Instant::now();
        let deadline = started + self.config.target_timeout();
        let mut outcome = TargetOutcome {
            target_id: target.id.clone(),
            display_name: target.display_name.clone(),
            kind: target.kind.label().to_string(),
            outcome: Outcome::Ok,
            since: None,
            source: None,
            fetched_rows: 0,
            merge: Default::default(),
            total_rows: 0,
            write: None,
            flow_error: None,
            failure: None,
            elapsed_ms: 0,
        };
        let finish = |mut outcome: TargetOutcome, series: Series| {
            outcome.total_rows = series.len();
            outcome.elapsed_ms = started.elapsed().as_millis() as u64;
            Finished { outcome, series }
        };

        let stored = match self.writer.load(target) {
            Ok(loaded) => loaded.series,
            Err(e) => {
                error!(target_id = %target.id, error = %e, "cannot load stored series");
                outcome.outcome = Outcome::Failed;
                outcome.failure = Some(FailureReason::Load {
                    kind: e.kind().into(),
                    message: e.to_string(),
                });
                return finish(outcome, Series::empty(&target.id));
            }
        };

        let since = if self.full {
            None
        } else {
            since_date(&stored, self.config.overlap_days)
        };
        outcome.since = since;

        let mut resolved = match self.resolver.fetch_before(target, since, deadline) {
            Ok(resolved) => resolved,
            Err(e) if e.is_empty_response() => {
                info!(target_id = %target.id, ?since, "no new rows");
                return finish(outcome, stored);
            }
            Err(e) => {
                warn!(target_id = %target.id, error = %e, "fetch failed");
                outcome.outcome = Outcome::Failed;
                outcome.failure = Some(fetch_failure(&e));
                return finish(outcome, stored);
            }
        };
        outcome.source = Some(resolved.source);
        outcome.fetched_rows = resolved.rows.len();

        if target.is_holding() && self.config.fetch_capital_flow && self.resolver.has_flow_source() {
            match self.resolver.fetch_capital_flow(target, since, deadline) {
                Ok(flows) => {
                    attach_capital_flow(&mut resolved.rows, &flows);
                }
                Err(e) => {
                    warn!(target_id = %target.id, error = %e, "capital flow unavailable");
                    outcome.outcome = Outcome::Partial;
                    outcome.flow_error = Some(e.to_string());
                }
            }
        }

        resolved.rows.iter_mut().for_each(quantize);
        let (merged, stats) = merge_with_stats(&stored, resolved.rows);
        outcome.merge = stats;

        match self.writer.write(target, &merged) {
            Ok(status) => {
                outcome.write = Some(status);
                info!(
                    target_id = %target.id,
                    outcome = outcome.outcome.label(),
                    source = %resolved.source,
                    added = stats.added,
                    revised = stats.revised,
                    rows = merged.len(),
                    unchanged = status == WriteStatus::Unchanged,
                    "target refreshed"
                );
                finish(outcome, merged)
            }
            Err(e) => {
                error!(target_id = %target.id, error = %e, "write failed");
                outcome.outcome = Outcome::Failed;
                outcome.failure = Some(write_failure(&e));
                finish(outcome, stored)
            }
        }
    }

    fn write_aggregates(
        &self,
        targets: &[Target],
        final_series: &HashMap<SeriesKey<'_>, Series>,
    ) -> Vec<OutputFile> {
        let empty = Series::empty("");
        fn lookup<'m>(
            map: &'m HashMap<SeriesKey<'_>, Series>,
            empty: &'m Series,
            t: &'m Target,
        ) -> &'m Series {
            map.get(&key(t)).unwrap_or(empty)
        }
        let series_of = |t| lookup(final_series, &empty, t);

        let mut ordered: Vec<&Target> = targets.iter().filter(|t| t.is_index()).collect();
        ordered.extend(targets.iter().filter(|t| t.is_holding()));
        let summary: Vec<(&Target, &Series)> =
            ordered.iter().map(|t| (*t, series_of(*t))).collect();

        let indices: Vec<(&str, &Series)> = targets
            .iter()
            .filter(|t| t.is_index())
            .map(|t| (t.display_name.as_str(), series_of(t)))
            .collect();
        let holdings: Vec<(&str, &Series)> = targets
            .iter()
            .filter(|t| t.is_holding())
            .map(|t| (t.id.as_str(), series_of(t)))
            .collect();

        vec![
            output(SUMMARY_FILE, self.writer.write_summary(&summary).map(Some)),
            output(INDEX_TABLE_FILE, self.writer.write_wide_table(INDEX_TABLE_FILE, &indices)),
            output(
                HOLDING_TABLE_FILE,
                self.writer.write_wide_table(HOLDING_TABLE_FILE, &holdings),
            ),
        ]
    }
}

fn output(file: &str, result: Result<Option<WriteStatus>, WriteError>) -> OutputFile {
    match result {
        Ok(status) => OutputFile {
            file: file.to_string(),
            status,
            error: None,
        },
        Err(e) => {
            error!(file, error = %e, "aggregate write failed");
            OutputFile {
                file: file.to_string(),
                status: None,
                error: Some(e.to_string()),
            }
        }
    }
}

fn fetch_failure(e: &FetchError) -> FailureReason {
    FailureReason::Fetch {
        kind: e.kind().into(),
        message: e.to_string(),
    }
}

fn write_failure(e: &WriteError) -> FailureReason {
    FailureReason::Write {
        kind: e.kind().into(),
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotefeed_core::domain::ObservationRow;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn since_is_last_date_minus_overlap() {
        let stored = Series::from_rows(
            "X.SS",
            vec![ObservationRow::empty(d("2024-01-02")), ObservationRow::empty(d("2024-01-10"))],
        );
        assert_eq!(since_date(&stored, 5), Some(d("2024-01-05")));
        assert_eq!(since_date(&stored, 0), Some(d("2024-01-10")));
    }

    #[test]
    fn no_stored_rows_means_full_history() {
        assert_eq!(since_date(&Series::empty("X.SS"), 5), None);
    }
}
