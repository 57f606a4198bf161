//! Eastmoney data provider: daily klines and daily capital flow.
//!
//! Used as the fallback OHLCV source for indices and as the only capital-flow
//! source. Eastmoney addresses securities by `secid` (`<market>.<code>`),
//! derived here from the Yahoo-style target id.
//!
//! Both endpoints return each day as one comma-joined string:
//! - kline: `date,open,close,high,low,volume(lots),amount`
//! - fund flow: `date,main_net_inflow,...`

use super::http::HttpFetcher;
use super::provider::{
    DataProvider, DataSource, FetchError, FetchRequest, FlowProvider, RawCell, RawDate,
    RawFlowRow, RawRow, RawRows,
};
use serde::Deserialize;

const DEFAULT_BASE_URL: &str = "https://push2his.eastmoney.com";

/// Shares per reported volume unit.
const LOT_SIZE: f64 = 100.0;

#[derive(Debug, Deserialize)]
struct Envelope {
    data: Option<KlineData>,
}

#[derive(Debug, Deserialize)]
struct KlineData {
    #[serde(default)]
    klines: Vec<String>,
}

/// Map a Yahoo-style id to an Eastmoney secid.
///
/// `600519.SS` → `1.600519`, `399001.SZ` → `0.399001`. Anything that is not a
/// six-digit code on a mainland exchange has no secid.
pub fn secid_for(symbol: &str) -> Option<String> {
    let (code, suffix) = symbol.trim().rsplit_once('.')?;
    if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let market = match suffix.to_ascii_uppercase().as_str() {
        "SS" | "SH" => 1,
        "SZ" | "BJ" => 0,
        _ => return None,
    };
    Some(format!("{market}.{code}"))
}

pub struct EastmoneyProvider {
    http: HttpFetcher,
    base_url: String,
}

impl EastmoneyProvider {
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

    fn secid(request: &FetchRequest) -> Result<String, FetchError> {
        secid_for(&request.symbol).ok_or_else(|| FetchError::UnknownSymbol {
            symbol: request.symbol.clone(),
        })
    }

    /// Split the `klines` array out of a response body.
    fn parse_klines(symbol: &str, body: &str) -> Result<Vec<String>, FetchError> {
        let envelope: Envelope = serde_json::from_str(body).map_err(|e| {
            FetchError::Unreachable(format!("malformed eastmoney response for {symbol}: {e}"))
        })?;
        // `data: null` is how Eastmoney says it doesn't know the secid.
        let data = envelope.data.ok_or_else(|| FetchError::UnknownSymbol {
            symbol: symbol.to_string(),
        })?;
        if data.klines.is_empty() {
            return Err(FetchError::EmptyResponse {
                symbol: symbol.to_string(),
            });
        }
        Ok(data.klines)
    }

    pub(crate) fn parse_kline_body(symbol: &str, body: &str) -> Result<RawRows, FetchError> {
        let rows = Self::parse_klines(symbol, body)?
            .iter()
            .map(|line| {
                let fields: Vec<&str> = line.split(',').collect();
                let at = |i: usize| fields.get(i).map_or(RawCell::Missing, |s| RawCell::from(*s));
                RawRow {
                    date: RawDate::Text(fields.first().copied().unwrap_or_default().to_string()),
                    open: at(1),
                    close: at(2),
                    high: at(3),
                    low: at(4),
                    volume: at(5),
                }
            })
            .collect();
        Ok(RawRows {
            source: DataSource::Eastmoney,
            volume_multiplier: LOT_SIZE,
            rows,
        })
    }

    pub(crate) fn parse_flow_body(symbol: &str, body: &str) -> Result<Vec<RawFlowRow>, FetchError> {
        Ok(Self::parse_klines(symbol, body)?
            .iter()
            .map(|line| {
                let mut fields = line.split(',');
                RawFlowRow {
                    date: RawDate::Text(fields.next().unwrap_or_default().to_string()),
                    net_inflow: fields.next().map_or(RawCell::Missing, RawCell::from),
                }
            })
            .collect())
    }
}

impl DataProvider for EastmoneyProvider {
    fn name(&self) -> &str {
        "eastmoney"
    }

    fn fetch_daily(&self, request: &FetchRequest) -> Result<RawRows, FetchError> {
        let secid = Self::secid(request)?;
        let url = format!(
            "{}/api/qt/stock/kline/get?secid={secid}\
             &fields1=f1,f2,f3,f4,f5,f6&fields2=f51,f52,f53,f54,f55,f56,f57\
             &klt=101&fqt=0&beg={}&end={}",
            self.base_url,
            request.start().format("%Y%m%d"),
            request.until.format("%Y%m%d"),
        );
        let resp = self.http.get(&url, request)?;
        Self::parse_kline_body(&request.symbol, &resp.body)
    }

    fn is_available(&self) -> bool {
        self.http.is_available()
    }
}

impl FlowProvider for EastmoneyProvider {
    fn name(&self) -> &str {
        "eastmoney_fund_flow"
    }

    fn fetch_flow(&self, request: &FetchRequest) -> Result<Vec<RawFlowRow>, FetchError> {
        let secid = Self::secid(request)?;
        let url = format!(
            "{}/api/qt/stock/fflow/daykline/get?lmt=0&klt=101&secid={secid}\
             &fields1=f1,f2,f3,f7&fields2=f51,f52,f53,f54,f55,f56,f57,f58,f59,f60,f61,f62,f63,f64,f65",
            self.base_url,
        );
        let resp = self.http.get(&url, request)?;
        Self::parse_flow_body(&request.symbol, &resp.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::normalize::{normalize_flow, normalize_rows};
    use chrono::NaiveDate;

    #[test]
    fn secid_mapping() {
        assert_eq!(secid_for("600519.SS").as_deref(), Some("1.600519"));
        assert_eq!(secid_for("000001.ss").as_deref(), Some("1.000001"));
        assert_eq!(secid_for("399006.SZ").as_deref(), Some("0.399006"));
        assert_eq!(secid_for("AAPL"), None);
        assert_eq!(secid_for("0700.HK"), None);
        assert_eq!(secid_for("60051X.SS"), None);
    }

    #[test]
    fn kline_body_maps_columns_and_lots() {
        let body = r#"{"rc":0,"data":{"code":"000001","market":1,"name":"上证指数","klines":[
            "2024-01-02,2972.78,2962.28,2976.27,2962.28,311138475,336263012352.00",
            "2024-01-03,2955.90,2967.25,2970.77,2954.40,-,301004853248.00"
        ]}}"#;
        let raw = EastmoneyProvider::parse_kline_body("000001.SS", body).unwrap();
        let norm = normalize_rows(&raw, None);
        assert_eq!(norm.rows.len(), 2);
        let first = &norm.rows[0];
        assert_eq!(first.date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(first.open, Some(2972.78));
        assert_eq!(first.close, Some(2962.28));
        assert_eq!(first.high, Some(2976.27));
        assert_eq!(first.low, Some(2962.28));
        assert_eq!(first.volume, Some(31_113_847_500.0));
        assert_eq!(norm.rows[1].volume, None);
    }

    #[test]
    fn null_data_is_unknown_symbol() {
        let err = EastmoneyProvider::parse_kline_body("999999.SS", r#"{"rc":0,"data":null}"#)
            .unwrap_err();
        assert_eq!(
            err,
            FetchError::UnknownSymbol {
                symbol: "999999.SS".into()
            }
        );
    }

    #[test]
    fn empty_klines_is_empty_response() {
        let body = r#"{"rc":0,"data":{"code":"688999","klines":[]}}"#;
        assert!(EastmoneyProvider::parse_kline_body("688999.SS", body)
            .unwrap_err()
            .is_empty_response());
    }

    #[test]
    fn flow_body_takes_main_net_inflow() {
        let body = r#"{"rc":0,"data":{"code":"600519","klines":[
            "2024-01-02,-512345678.0,10.0,20.0,30.0,40.0",
            "2024-01-03,89000000.5,1.0,2.0,3.0,4.0"
        ]}}"#;
        let raw = EastmoneyProvider::parse_flow_body("600519.SS", body).unwrap();
        let flows = normalize_flow(&raw);
        assert_eq!(
            flows.get(&NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()),
            Some(&-512_345_678.0)
        );
        assert_eq!(flows.len(), 2);
    }
}
