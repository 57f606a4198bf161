//! Incremental merger: fold freshly fetched rows into a stored series.
//!
//! Union by date. When both sides have a date, the incoming row replaces the
//! stored one wholesale (providers revise a day's figures after the fact, and
//! a half-patched row would mix two versions). Nothing is ever removed.

use crate::domain::{ObservationRow, Series};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a merge did, for logs and the run log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    /// Dates that were not in the stored series.
    pub added: usize,
    /// Stored dates whose row was replaced with a different one.
    pub revised: usize,
    /// Stored dates that were re-fetched unchanged.
    pub unchanged: usize,
}

impl MergeStats {
    pub fn changed(&self) -> bool {
        self.added > 0 || self.revised > 0
    }
}

/// Merge `incoming` into `existing`.
///
/// Incoming order does not matter, except that repeated dates inside one
/// batch resolve to the last occurrence.
pub fn merge(existing: &Series, incoming: impl IntoIterator<Item = ObservationRow>) -> Series {
    merge_with_stats(existing, incoming).0
}

pub fn merge_with_stats(
    existing: &Series,
    incoming: impl IntoIterator<Item = ObservationRow>,
) -> (Series, MergeStats) {
    // Collapse the batch first so in-batch duplicates don't skew the stats.
    let batch: BTreeMap<NaiveDate, ObservationRow> =
        incoming.into_iter().map(|r| (r.date, r)).collect();

    let mut by_date: BTreeMap<NaiveDate, ObservationRow> = existing
        .rows()
        .iter()
        .map(|r| (r.date, r.clone()))
        .collect();

    let mut stats = MergeStats::default();
    for (date, row) in batch {
        match by_date.insert(date, row) {
            None => stats.added += 1,
            Some(old) if by_date.get(&date) == Some(&old) => stats.unchanged += 1,
            Some(_) => stats.revised += 1,
        }
    }

    (Series::from_sorted_map(existing.target_id(), by_date), stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn row(date: &str, close: f64) -> ObservationRow {
        ObservationRow {
            open: Some(close - 1.0),
            high: Some(close + 1.0),
            low: Some(close - 2.0),
            close: Some(close),
            volume: Some(1000.0),
            ..ObservationRow::empty(d(date))
        }
    }

    #[test]
    fn revision_scenario() {
        let existing = Series::from_rows(
            "600519.SS",
            vec![
                row("2024-01-02", 1700.0),
                row("2024-01-03", 1710.0),
                row("2024-01-04", 1720.0),
            ],
        );
        let incoming = vec![row("2024-01-05", 1730.0), row("2024-01-03", 1711.5)];

        let (merged, stats) = merge_with_stats(&existing, incoming);

        let dates: Vec<NaiveDate> = merged.rows().iter().map(|r| r.date).collect();
        assert_eq!(
            dates,
            vec![d("2024-01-02"), d("2024-01-03"), d("2024-01-04"), d("2024-01-05")]
        );
        assert_eq!(merged.get(d("2024-01-03")).unwrap().close, Some(1711.5));
        assert_eq!(merged.target_id(), "600519.SS");
        assert_eq!(
            stats,
            MergeStats {
                added: 1,
                revised: 1,
                unchanged: 0
            }
        );
    }

    #[test]
    fn incoming_row_replaces_whole_row() {
        let mut stored = row("2024-01-02", 10.0);
        stored.capital_flow = Some(5.0);
        let existing = Series::from_rows("X.SS", vec![stored]);

        let mut fresh = ObservationRow::empty(d("2024-01-02"));
        fresh.close = Some(11.0);

        let merged = merge(&existing, vec![fresh.clone()]);
        assert_eq!(merged.rows(), &[fresh]);
    }

    #[test]
    fn duplicate_dates_in_batch_keep_last() {
        let existing = Series::empty("X.SS");
        let merged = merge(
            &existing,
            vec![row("2024-01-02", 1.0), row("2024-01-02", 2.0)],
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.rows()[0].close, Some(2.0));
    }

    #[test]
    fn empty_incoming_is_identity() {
        let existing = Series::from_rows("X.SS", vec![row("2024-01-02", 1.0)]);
        let (merged, stats) = merge_with_stats(&existing, Vec::new());
        assert_eq!(merged, existing);
        assert!(!stats.changed());
    }

    #[test]
    fn refetching_same_rows_counts_unchanged() {
        let existing = Series::from_rows("X.SS", vec![row("2024-01-02", 1.0)]);
        let (_, stats) = merge_with_stats(&existing, vec![row("2024-01-02", 1.0)]);
        assert_eq!(stats.unchanged, 1);
        assert!(!stats.changed());
    }
}
