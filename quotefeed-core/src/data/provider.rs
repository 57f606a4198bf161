//! Data provider traits, raw response shapes, and fetch errors.
//!
//! Providers speak their own dialect: they hand back [`RawRows`] with
//! provider-native dates, untyped cells and units. Turning those into
//! canonical [`ObservationRow`](crate::domain::ObservationRow)s is the
//! resolver's job (see [`super::normalize`]), so providers stay thin and
//! mocks in tests can feed deliberately messy data.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Why a fetch for one target did not produce rows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("provider unreachable: {0}")]
    Unreachable(String),

    #[error("unknown symbol: {symbol}")]
    UnknownSymbol { symbol: String },

    /// The provider answered, but with zero rows. Not a failure on its own:
    /// new listings, delistings and "nothing new since the cutoff" all look
    /// like this.
    #[error("empty response for {symbol}")]
    EmptyResponse { symbol: String },

    #[error("timed out fetching {symbol} after {elapsed_ms}ms")]
    Timeout { symbol: String, elapsed_ms: u64 },
}

impl FetchError {
    /// Network-level failures, timeouts included.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, FetchError::Unreachable(_) | FetchError::Timeout { .. })
    }

    pub fn is_empty_response(&self) -> bool {
        matches!(self, FetchError::EmptyResponse { .. })
    }

    /// Stable snake_case name for run logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Unreachable(_) => "unreachable",
            FetchError::UnknownSymbol { .. } => "unknown_symbol",
            FetchError::EmptyResponse { .. } => "empty_response",
            FetchError::Timeout { .. } => "timeout",
        }
    }
}

/// Where a batch of rows came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    YahooFinance,
    Eastmoney,
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataSource::YahooFinance => f.write_str("yahoo_finance"),
            DataSource::Eastmoney => f.write_str("eastmoney"),
        }
    }
}

/// One fetch for one target.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Target id (Yahoo-style symbol). Providers map it to their own scheme.
    pub symbol: String,
    /// Inclusive lower bound. `None` means the provider's full history window
    /// starting at `history_start`.
    pub since: Option<NaiveDate>,
    /// Used when `since` is `None`.
    pub history_start: NaiveDate,
    /// Inclusive upper bound.
    pub until: NaiveDate,
    /// Hard stop for retries; past this the provider gives up with `Timeout`.
    pub deadline: Instant,
}

impl FetchRequest {
    pub fn start(&self) -> NaiveDate {
        self.since.unwrap_or(self.history_start)
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// A cell as the provider sent it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawCell {
    Number(f64),
    Text(String),
    Missing,
}

impl From<&serde_json::Value> for RawCell {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => RawCell::Missing,
            serde_json::Value::Number(n) => n.as_f64().map_or(RawCell::Missing, RawCell::Number),
            serde_json::Value::String(s) => RawCell::Text(s.clone()),
            other => RawCell::Text(other.to_string()),
        }
    }
}

impl From<&str> for RawCell {
    fn from(value: &str) -> Self {
        if value.is_empty() {
            RawCell::Missing
        } else {
            RawCell::Text(value.to_string())
        }
    }
}

/// A date as the provider sent it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawDate {
    /// Unix seconds plus the exchange's UTC offset (Yahoo).
    Epoch { secs: i64, utc_offset_secs: i32 },
    /// Calendar text such as `2024-01-02`.
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub date: RawDate,
    pub open: RawCell,
    pub high: RawCell,
    pub low: RawCell,
    pub close: RawCell,
    pub volume: RawCell,
}

/// A provider's daily bars before normalization.
#[derive(Debug, Clone)]
pub struct RawRows {
    pub source: DataSource,
    /// Shares per provider volume unit (Eastmoney reports lots of 100).
    pub volume_multiplier: f64,
    pub rows: Vec<RawRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawFlowRow {
    pub date: RawDate,
    pub net_inflow: RawCell,
}

/// Daily OHLCV source.
///
/// Implementations own retries and rate-limit handling; the resolver above
/// owns fallback between providers and normalization.
pub trait DataProvider: Send + Sync {
    fn name(&self) -> &str;

    fn fetch_daily(&self, request: &FetchRequest) -> Result<RawRows, FetchError>;

    /// False while the provider refuses requests (circuit breaker open).
    fn is_available(&self) -> bool;
}

/// Daily capital-flow source. Best effort by contract.
pub trait FlowProvider: Send + Sync {
    fn name(&self) -> &str;

    fn fetch_flow(&self, request: &FetchRequest) -> Result<Vec<RawFlowRow>, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_cell_from_json() {
        assert_eq!(RawCell::from(&json!(1.5)), RawCell::Number(1.5));
        assert_eq!(RawCell::from(&json!(null)), RawCell::Missing);
        assert_eq!(RawCell::from(&json!("N/A")), RawCell::Text("N/A".into()));
        assert_eq!(RawCell::from(&json!(true)), RawCell::Text("true".into()));
    }

    #[test]
    fn raw_cell_from_empty_str_is_missing() {
        assert_eq!(RawCell::from(""), RawCell::Missing);
        assert_eq!(RawCell::from("-"), RawCell::Text("-".into()));
    }

    #[test]
    fn timeout_counts_as_unreachable() {
        let e = FetchError::Timeout {
            symbol: "X".into(),
            elapsed_ms: 10,
        };
        assert!(e.is_unreachable());
        assert_eq!(e.kind(), "timeout");
        assert!(!FetchError::UnknownSymbol { symbol: "X".into() }.is_unreachable());
    }

    #[test]
    fn request_start_falls_back_to_history_start() {
        let history_start = NaiveDate::from_ymd_opt(2014, 1, 1).unwrap();
        let mut req = FetchRequest {
            symbol: "X.SS".into(),
            since: None,
            history_start,
            until: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            deadline: Instant::now() + Duration::from_secs(5),
        };
        assert_eq!(req.start(), history_start);
        req.since = NaiveDate::from_ymd_opt(2023, 12, 1);
        assert_eq!(req.start(), NaiveDate::from_ymd_opt(2023, 12, 1).unwrap());
        assert!(!req.is_expired());
    }
}
