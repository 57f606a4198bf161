//! On-disk CSV layout of a series.
//!
//! Fixed column order and fixed decimal places per column, so that writing
//! the same series twice yields the same bytes.

use crate::domain::{ObservationRow, Series};
use chrono::NaiveDate;
use thiserror::Error;
use tracing::warn;

pub const HEADER: [&str; 7] = ["date", "open", "high", "low", "close", "volume", "capital_flow"];

const PRICE_DECIMALS: usize = 4;
const VOLUME_DECIMALS: usize = 0;
const FLOW_DECIMALS: usize = 2;

#[derive(Debug, Error)]
pub enum SeriesFormatError {
    #[error("unexpected header {found:?}")]
    UnexpectedHeader { found: Vec<String> },

    #[error("csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("csv output is not valid UTF-8")]
    NotUtf8,
}

fn fmt_cell(value: Option<f64>, decimals: usize) -> String {
    value.map_or_else(String::new, |v| format!("{v:.decimals$}"))
}

/// Round a value the way it will be stored.
fn stored(value: Option<f64>, decimals: usize) -> Option<f64> {
    value.and_then(|v| fmt_cell(Some(v), decimals).parse().ok())
}

/// Round every field of `row` to its stored precision.
///
/// Applying this to freshly fetched rows makes in-memory comparisons agree
/// with what a later run reads back from disk.
pub fn quantize(row: &mut ObservationRow) {
    row.open = stored(row.open, PRICE_DECIMALS);
    row.high = stored(row.high, PRICE_DECIMALS);
    row.low = stored(row.low, PRICE_DECIMALS);
    row.close = stored(row.close, PRICE_DECIMALS);
    row.volume = stored(row.volume, VOLUME_DECIMALS);
    row.capital_flow = stored(row.capital_flow, FLOW_DECIMALS);
}

pub fn encode(series: &Series, date_format: &str) -> Result<String, SeriesFormatError> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(HEADER)?;
    for row in series.rows() {
        wtr.write_record([
            row.date.format(date_format).to_string(),
            fmt_cell(row.open, PRICE_DECIMALS),
            fmt_cell(row.high, PRICE_DECIMALS),
            fmt_cell(row.low, PRICE_DECIMALS),
            fmt_cell(row.close, PRICE_DECIMALS),
            fmt_cell(row.volume, VOLUME_DECIMALS),
            fmt_cell(row.capital_flow, FLOW_DECIMALS),
        ])?;
    }
    let data = wtr
        .into_inner()
        .map_err(|e| SeriesFormatError::Csv(e.into_error().into()))?;
    String::from_utf8(data).map_err(|_| SeriesFormatError::NotUtf8)
}

/// A decoded series plus the number of rows that had to be skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub series: Series,
    pub skipped: usize,
}

fn parse_cell(raw: Option<&str>) -> Result<Option<f64>, ()> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s.parse::<f64>().map(Some).map_err(|_| ()),
    }
}

/// Parse a stored series. A wrong header is an error; a bad row is skipped.
pub fn decode(
    target_id: &str,
    content: &str,
    date_format: &str,
) -> Result<Decoded, SeriesFormatError> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers = rdr.headers()?;
    if headers.len() != HEADER.len() || headers.iter().zip(HEADER).any(|(a, b)| a.trim() != b) {
        return Err(SeriesFormatError::UnexpectedHeader {
            found: headers.iter().map(str::to_string).collect(),
        });
    }

    let mut rows = Vec::new();
    let mut skipped = 0;
    for (i, record) in rdr.records().enumerate() {
        let parsed = record.ok().and_then(|r| {
            let date = NaiveDate::parse_from_str(r.get(0)?.trim(), date_format).ok()?;
            let cell = |idx: usize| parse_cell(r.get(idx));
            Some(ObservationRow {
                date,
                open: cell(1).ok()?,
                high: cell(2).ok()?,
                low: cell(3).ok()?,
                close: cell(4).ok()?,
                volume: cell(5).ok()?,
                capital_flow: cell(6).ok()?,
            })
        });
        match parsed {
            Some(row) => rows.push(row),
            None => {
                warn!(target_id, line = i + 2, "skipping unreadable stored row");
                skipped += 1;
            }
        }
    }

    Ok(Decoded {
        series: Series::from_rows(target_id, rows),
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FMT: &str = "%Y-%m-%d";

    fn sample() -> Series {
        let d = |s| NaiveDate::parse_from_str(s, FMT).unwrap();
        Series::from_rows(
            "600519.SS",
            vec![
                ObservationRow {
                    date: d("2024-01-02"),
                    open: Some(1715.0),
                    high: Some(1720.123456),
                    low: Some(1690.0),
                    close: Some(1710.0),
                    volume: Some(3_200_000.4),
                    capital_flow: Some(-512_345_678.129),
                },
                ObservationRow {
                    close: Some(1685.5),
                    ..ObservationRow::empty(d("2024-01-03"))
                },
            ],
        )
    }

    #[test]
    fn encodes_fixed_precision() {
        let text = encode(&sample(), FMT).unwrap();
        let expected = "\
date,open,high,low,close,volume,capital_flow
2024-01-02,1715.0000,1720.1235,1690.0000,1710.0000,3200000,-512345678.13
2024-01-03,,,,1685.5000,,
";
        assert_eq!(text, expected);
    }

    #[test]
    fn decode_then_encode_is_byte_stable() {
        let first = encode(&sample(), FMT).unwrap();
        let decoded = decode("600519.SS", &first, FMT).unwrap();
        assert_eq!(decoded.skipped, 0);
        let second = encode(&decoded.series, FMT).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn quantized_rows_equal_decoded_rows() {
        let mut rows = sample().into_rows();
        rows.iter_mut().for_each(quantize);
        let decoded = decode("600519.SS", &encode(&sample(), FMT).unwrap(), FMT).unwrap();
        assert_eq!(decoded.series.rows(), rows.as_slice());
    }

    #[test]
    fn bad_rows_are_skipped() {
        let text = "date,open,high,low,close,volume,capital_flow\n\
                    2024-01-02,1,2,0.5,1.5,100,\n\
                    garbage,1,2,3,4,5,6\n\
                    2024-01-04,1,x,3,4,5,6\n";
        let decoded = decode("X.SS", text, FMT).unwrap();
        assert_eq!(decoded.series.len(), 1);
        assert_eq!(decoded.skipped, 2);
    }

    #[test]
    fn wrong_header_is_rejected() {
        let err = decode("X.SS", "Date,Close\n2024-01-02,1\n", FMT).unwrap_err();
        assert!(matches!(err, SeriesFormatError::UnexpectedHeader { .. }));
    }
}
