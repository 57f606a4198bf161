//! Normalization of provider-native rows into canonical observations.
//!
//! Rules:
//! - a cell that isn't a finite number becomes `None`; the row survives
//! - a row whose date can't be parsed is dropped
//! - a row with no price or volume at all (holiday placeholder) is dropped
//! - volume is converted to shares with the provider's multiplier
//! - rows before the requested cutoff are dropped

use super::provider::{RawCell, RawDate, RawFlowRow, RawRows};
use crate::domain::ObservationRow;
use chrono::{DateTime, NaiveDate};
use std::collections::BTreeMap;
use tracing::debug;

const TEXT_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y%m%d", "%Y/%m/%d"];

/// Coerce a raw cell to a finite number.
pub fn coerce_number(cell: &RawCell) -> Option<f64> {
    let value = match cell {
        RawCell::Number(n) => *n,
        RawCell::Text(s) => {
            let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
            match cleaned.to_ascii_lowercase().as_str() {
                "" | "-" | "--" | "null" | "none" | "nan" => return None,
                _ => cleaned.parse::<f64>().ok()?,
            }
        }
        RawCell::Missing => return None,
    };
    value.is_finite().then_some(value)
}

/// Resolve a raw date to the market-local calendar day.
pub fn parse_date(raw: &RawDate) -> Option<NaiveDate> {
    match raw {
        RawDate::Epoch {
            secs,
            utc_offset_secs,
        } => DateTime::from_timestamp(secs.checked_add(i64::from(*utc_offset_secs))?, 0)
            .map(|dt| dt.date_naive()),
        RawDate::Text(text) => {
            let day = text
                .trim()
                .split(|c: char| c == 'T' || c.is_whitespace())
                .next()
                .unwrap_or_default();
            TEXT_DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(day, fmt).ok())
        }
    }
}

/// Canonical rows plus a count of what was thrown away.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub rows: Vec<ObservationRow>,
    pub dropped: usize,
}

pub fn normalize_rows(raw: &RawRows, since: Option<NaiveDate>) -> Normalized {
    let mut rows = Vec::with_capacity(raw.rows.len());
    let mut dropped = 0;

    for raw_row in &raw.rows {
        let Some(date) = parse_date(&raw_row.date) else {
            debug!(source = %raw.source, date = ?raw_row.date, "dropping row with unparseable date");
            dropped += 1;
            continue;
        };
        if since.is_some_and(|cutoff| date < cutoff) {
            continue;
        }

        let row = ObservationRow {
            date,
            open: coerce_number(&raw_row.open),
            high: coerce_number(&raw_row.high),
            low: coerce_number(&raw_row.low),
            close: coerce_number(&raw_row.close),
            volume: coerce_number(&raw_row.volume).map(|v| v * raw.volume_multiplier),
            capital_flow: None,
        };
        if row.has_no_prices() {
            dropped += 1;
            continue;
        }
        rows.push(row);
    }

    Normalized { rows, dropped }
}

/// Daily net inflow keyed by date. Unparseable entries are skipped.
pub fn normalize_flow(raw: &[RawFlowRow]) -> BTreeMap<NaiveDate, f64> {
    raw.iter()
        .filter_map(|r| Some((parse_date(&r.date)?, coerce_number(&r.net_inflow)?)))
        .collect()
}

/// Fill `capital_flow` on rows whose date has a flow value. Returns how many
/// rows got one.
pub fn attach_capital_flow(rows: &mut [ObservationRow], flows: &BTreeMap<NaiveDate, f64>) -> usize {
    let mut attached = 0;
    for row in rows.iter_mut() {
        if let Some(flow) = flows.get(&row.date) {
            row.capital_flow = Some(*flow);
            attached += 1;
        }
    }
    attached
}
