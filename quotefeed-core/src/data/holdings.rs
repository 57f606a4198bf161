//! Holdings list reader.
//!
//! A CSV with a header row. The ticker column may be called `ticker` or
//! `symbol`; `name`, `cost_basis`/`cost` and `quantity`/`shares` are optional.
//! Bad rows are skipped with a warning rather than failing the run.

use crate::domain::{Target, TargetKind};
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum HoldingsError {
    #[error("holdings file not found: {0}")]
    NotFound(String),

    #[error("holdings file has no `ticker` or `symbol` column (found: {0})")]
    MissingTickerColumn(String),

    #[error("reading holdings: {0}")]
    Read(#[from] csv::Error),

    #[error("reading holdings: {0}")]
    Io(#[from] std::io::Error),
}

impl HoldingsError {
    /// Stable snake_case name for run logs.
    pub fn kind(&self) -> &'static str {
        match self {
            HoldingsError::NotFound(_) => "not_found",
            HoldingsError::MissingTickerColumn(_) => "missing_ticker_column",
            HoldingsError::Read(_) | HoldingsError::Io(_) => "read",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HoldingsList {
    pub targets: Vec<Target>,
    /// Rows that were malformed or repeated a ticker.
    pub skipped: usize,
}

struct Columns {
    ticker: usize,
    name: Option<usize>,
    cost_basis: Option<usize>,
    quantity: Option<usize>,
}

impl Columns {
    fn locate(headers: &csv::StringRecord) -> Result<Self, HoldingsError> {
        let normalized: Vec<String> = headers
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_ascii_lowercase())
            .collect();
        let find = |names: &[&str]| normalized.iter().position(|h| names.contains(&h.as_str()));

        let ticker = find(&["ticker", "symbol"])
            .ok_or_else(|| HoldingsError::MissingTickerColumn(normalized.join(",")))?;
        Ok(Self {
            ticker,
            name: find(&["name", "display_name"]),
            cost_basis: find(&["cost_basis", "cost"]),
            quantity: find(&["quantity", "shares"]),
        })
    }
}

/// Parse an optional numeric cell. `Err` means "present but not a number".
fn optional_number(record: &csv::StringRecord, column: Option<usize>) -> Result<Option<f64>, String> {
    let Some(raw) = column.and_then(|i| record.get(i)).map(str::trim) else {
        return Ok(None);
    };
    if raw.is_empty() {
        return Ok(None);
    }
    raw.replace(',', "")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(Some)
        .ok_or_else(|| format!("not a number: {raw:?}"))
}

pub fn parse_holdings(reader: impl Read) -> Result<HoldingsList, HoldingsError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);
    let columns = Columns::locate(csv_reader.headers()?)?;

    let mut list = HoldingsList::default();
    let mut seen = HashSet::new();

    for (line, record) in csv_reader.records().enumerate() {
        // +2: one for the header, one for 1-based numbering.
        let line = line + 2;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warn!(line, error = %e, "skipping unreadable holdings row");
                list.skipped += 1;
                continue;
            }
        };

        let ticker = record
            .get(columns.ticker)
            .unwrap_or_default()
            .trim()
            .to_ascii_uppercase();
        if ticker.is_empty() {
            warn!(line, "skipping holdings row without a ticker");
            list.skipped += 1;
            continue;
        }

        let metadata = optional_number(&record, columns.cost_basis)
            .and_then(|cost| Ok((cost, optional_number(&record, columns.quantity)?)));
        let (cost_basis, quantity) = match metadata {
            Ok(values) => values,
            Err(reason) => {
                warn!(line, %ticker, %reason, "skipping malformed holdings row");
                list.skipped += 1;
                continue;
            }
        };

        if !seen.insert(ticker.clone()) {
            warn!(line, %ticker, "duplicate ticker in holdings, keeping the first");
            list.skipped += 1;
            continue;
        }

        let display_name = columns
            .name
            .and_then(|i| record.get(i))
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map_or_else(|| ticker.clone(), str::to_string);

        list.targets.push(Target {
            id: ticker,
            display_name,
            kind: TargetKind::Holding {
                cost_basis,
                quantity,
            },
        });
    }

    Ok(list)
}

pub fn load_holdings(path: &Path) -> Result<HoldingsList, HoldingsError> {
    let file = std::fs::File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            HoldingsError::NotFound(path.display().to_string())
        } else {
            HoldingsError::Io(e)
        }
    })?;
    parse_holdings(std::io::BufReader::new(file))
}
