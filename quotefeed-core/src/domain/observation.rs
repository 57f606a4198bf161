//! Daily observation rows and the per-target series built from them.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One trading day for one target.
///
/// Every numeric field is optional: a provider that omits or garbles a cell
/// yields `None` rather than dropping the whole day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRow {
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    /// Signed main-force net inflow. Only set when the flow sub-fetch succeeded.
    pub capital_flow: Option<f64>,
}

impl ObservationRow {
    /// A row with every value missing.
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            open: None,
            high: None,
            low: None,
            close: None,
            volume: None,
            capital_flow: None,
        }
    }

    /// True when none of open/high/low/close/volume is present.
    pub fn has_no_prices(&self) -> bool {
        self.open.is_none()
            && self.high.is_none()
            && self.low.is_none()
            && self.close.is_none()
            && self.volume.is_none()
    }
}

/// Ordered daily history for one target.
///
/// Invariant: rows are strictly ascending by date (no duplicates). The only
/// ways to build a `Series` enforce it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    target_id: String,
    rows: Vec<ObservationRow>,
}

impl Series {
    pub fn empty(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            rows: Vec::new(),
        }
    }

    /// Build a series from rows in any order.
    ///
    /// Rows sharing a date collapse to the last one in iteration order.
    pub fn from_rows(
        target_id: impl Into<String>,
        rows: impl IntoIterator<Item = ObservationRow>,
    ) -> Self {
        let by_date: BTreeMap<NaiveDate, ObservationRow> =
            rows.into_iter().map(|r| (r.date, r)).collect();
        Self::from_sorted_map(target_id, by_date)
    }

    pub(crate) fn from_sorted_map(
        target_id: impl Into<String>,
        by_date: BTreeMap<NaiveDate, ObservationRow>,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            rows: by_date.into_values().collect(),
        }
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn rows(&self) -> &[ObservationRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<ObservationRow> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.rows.first().map(|r| r.date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.rows.last().map(|r| r.date)
    }

    pub fn latest(&self) -> Option<&ObservationRow> {
        self.rows.last()
    }

    /// Row for a given date, if present.
    pub fn get(&self, date: NaiveDate) -> Option<&ObservationRow> {
        self.rows
            .binary_search_by_key(&date, |r| r.date)
            .ok()
            .map(|i| &self.rows[i])
    }

    /// Most recent rows that carry a close, newest first.
    pub fn recent_closes(&self) -> impl Iterator<Item = (NaiveDate, f64)> + '_ {
        self.rows
            .iter()
            .rev()
            .filter_map(|r| r.close.map(|c| (r.date, c)))
    }
}
