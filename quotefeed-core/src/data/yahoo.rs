//! Yahoo Finance data provider.
//!
//! Fetches daily OHLCV bars from Yahoo's v8 chart API. The target id is used
//! as the Yahoo symbol unchanged (`600519.SS`, `399001.SZ`, ...).
//!
//! Yahoo has no official API and changes shape without notice, so cells are
//! read as loose JSON and left for the normalizer to coerce.

use super::http::HttpFetcher;
use super::provider::{
    DataProvider, DataSource, FetchError, FetchRequest, RawCell, RawDate, RawRow, RawRows,
};
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;

const DEFAULT_BASE_URL: &str = "https://query2.finance.yahoo.com";

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    #[serde(default)]
    meta: ChartMeta,
    timestamp: Option<Vec<i64>>,
    indicators: Option<Indicators>,
}

#[derive(Debug, Default, Deserialize)]
struct ChartMeta {
    #[serde(default)]
    gmtoffset: i32,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<QuoteData>,
}

#[derive(Debug, Default, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Value>,
    #[serde(default)]
    high: Vec<Value>,
    #[serde(default)]
    low: Vec<Value>,
    #[serde(default)]
    close: Vec<Value>,
    #[serde(default)]
    volume: Vec<Value>,
}

fn cell(values: &[Value], i: usize) -> RawCell {
    values.get(i).map_or(RawCell::Missing, RawCell::from)
}

pub struct YahooProvider {
    http: HttpFetcher,
    base_url: String,
}

impl YahooProvider {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn chart_url(&self, symbol: &str, start: NaiveDate, until: NaiveDate) -> String {
        let start_ts = start.and_hms_opt(0, 0, 0).map_or(0, |dt| dt.and_utc().timestamp());
        let end_ts = until
            .succ_opt()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map_or(i64::MAX, |dt| dt.and_utc().timestamp());
        format!(
            "{}/v8/finance/chart/{symbol}?period1={start_ts}&period2={end_ts}&interval=1d&events=history",
            self.base_url
        )
    }

    /// Turn a chart API body into raw rows.
    pub(crate) fn parse_body(symbol: &str, body: &str) -> Result<RawRows, FetchError> {
        let resp: ChartResponse = serde_json::from_str(body).map_err(|e| {
            FetchError::Unreachable(format!("malformed chart response for {symbol}: {e}"))
        })?;

        if let Some(err) = resp.chart.error {
            return Err(if err.code == "Not Found" {
                FetchError::UnknownSymbol {
                    symbol: symbol.to_string(),
                }
            } else {
                FetchError::Unreachable(format!("{}: {}", err.code, err.description))
            });
        }

        let empty = || FetchError::EmptyResponse {
            symbol: symbol.to_string(),
        };
        let data = resp
            .chart
            .result
            .and_then(|r| r.into_iter().next())
            .ok_or_else(empty)?;
        let timestamps = data.timestamp.unwrap_or_default();
        if timestamps.is_empty() {
            return Err(empty());
        }
        let quote = data
            .indicators
            .and_then(|i| i.quote.into_iter().next())
            .unwrap_or_default();

        let rows = timestamps
            .iter()
            .enumerate()
            .map(|(i, &secs)| RawRow {
                date: RawDate::Epoch {
                    secs,
                    utc_offset_secs: data.meta.gmtoffset,
                },
                open: cell(&quote.open, i),
                high: cell(&quote.high, i),
                low: cell(&quote.low, i),
                close: cell(&quote.close, i),
                volume: cell(&quote.volume, i),
            })
            .collect();

        Ok(RawRows {
            source: DataSource::YahooFinance,
            volume_multiplier: 1.0,
            rows,
        })
    }
}

impl DataProvider for YahooProvider {
    fn name(&self) -> &str {
        "yahoo_finance"
    }

    fn fetch_daily(&self, request: &FetchRequest) -> Result<RawRows, FetchError> {
        let url = self.chart_url(&request.symbol, request.start(), request.until);
        let resp = self.http.get(&url, request)?;
        if resp.status == StatusCode::NOT_FOUND {
            // Yahoo answers unknown symbols with 404 plus a chart error body.
            return match Self::parse_body(&request.symbol, &resp.body) {
                Err(e) => Err(e),
                Ok(_) => Err(FetchError::UnknownSymbol {
                    symbol: request.symbol.clone(),
                }),
            };
        }
        Self::parse_body(&request.symbol, &resp.body)
    }

    fn is_available(&self) -> bool {
        self.http.is_available()
    }
}
