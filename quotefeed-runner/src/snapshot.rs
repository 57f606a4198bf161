//! Snapshot writer: the on-disk side of a refresh.
//!
//! Layout under `out_dir`:
//! - `indices/{id}.csv`, `holdings/{id}.csv`: one series per target
//! - `latest.json`: one summary entry per configured target
//! - `indices_merged.csv`, `ALL_TICKERS_MASTER.csv`: wide close tables
//!
//! Every file is replaced atomically (write `.tmp`, fsync, rename) and only
//! when its bytes actually change, so a no-op run leaves the tree untouched.

use chrono::NaiveDate;
use quotefeed_core::data::series_csv::{self, SeriesFormatError};
use quotefeed_core::domain::{Series, Target};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const SUMMARY_FILE: &str = "latest.json";
pub const INDEX_TABLE_FILE: &str = "indices_merged.csv";
pub const HOLDING_TABLE_FILE: &str = "ALL_TICKERS_MASTER.csv";

/// `ENOSPC` on Linux and macOS.
const ENOSPC: i32 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStatus {
    Written,
    /// Existing file already had identical bytes.
    Unchanged,
}

/// Failure touching the output directory.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("disk full writing {path}")]
    DiskFull { path: PathBuf },

    #[error("permission denied on {path}")]
    PermissionDenied { path: PathBuf },

    #[error("invalid output path for {id:?}: {reason}")]
    PathInvalid { id: String, reason: &'static str },

    #[error("encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: SeriesFormatError,
    },

    #[error("i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl WriteError {
    pub fn from_io(path: &Path, source: io::Error) -> Self {
        let path = path.to_path_buf();
        if source.raw_os_error() == Some(ENOSPC) {
            return Self::DiskFull { path };
        }
        if source.kind() == io::ErrorKind::PermissionDenied {
            return Self::PermissionDenied { path };
        }
        Self::Io { path, source }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::DiskFull { .. } => "disk_full",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::PathInvalid { .. } => "path_invalid",
            Self::Encode { .. } => "encode",
            Self::Io { .. } => "io",
        }
    }
}

/// Replace `path` with `bytes` unless it already holds exactly those bytes.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<WriteStatus, WriteError> {
    if let Ok(existing) = fs::read(path) {
        if blake3::hash(&existing) == blake3::hash(bytes) {
            debug!(path = %path.display(), "unchanged, skipping write");
            return Ok(WriteStatus::Unchanged);
        }
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| WriteError::from_io(parent, e))?;
    }

    let tmp_path = tmp_sibling(path);
    let written = fs::File::create(&tmp_path).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(WriteError::from_io(&tmp_path, e));
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        WriteError::from_io(path, e)
    })?;
    Ok(WriteStatus::Written)
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn quarantine_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".quarantined");
    path.with_file_name(name)
}

/// Reject ids that would escape or alias the series directory.
fn validate_id(id: &str) -> Result<(), WriteError> {
    let reason = if id.trim().is_empty() {
        Some("empty id")
    } else if id == "." || id == ".." {
        Some("relative path component")
    } else if id.contains(['/', '\\']) {
        Some("path separator")
    } else if id.contains('\0') {
        Some("nul byte")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(WriteError::PathInvalid {
            id: id.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// A stored series plus what loading it took.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSeries {
    pub series: Series,
    /// Unreadable rows skipped.
    pub skipped: usize,
    /// Where a corrupt file was moved, if one was.
    pub quarantined: Option<PathBuf>,
}

/// One line of `latest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub latest_date: Option<String>,
    pub close: Option<f64>,
    pub prev_close: Option<f64>,
    pub change: Option<f64>,
    pub change_pct: Option<f64>,
    pub latest_capital_flow: Option<f64>,
    pub capital_flow_5d: Option<f64>,
    pub rows: usize,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

impl SummaryEntry {
    pub fn from_series(target: &Target, series: &Series, date_format: &str) -> Self {
        let mut closes = series.recent_closes();
        let latest = closes.next();
        let prev = closes.next();

        let close = latest.map(|(_, c)| c);
        let prev_close = prev.map(|(_, c)| c);
        let change = close.zip(prev_close).map(|(c, p)| round_to(c - p, 4));
        let change_pct = close
            .zip(prev_close)
            .filter(|(_, p)| *p != 0.0)
            .map(|(c, p)| round_to((c - p) / p * 100.0, 2));

        let flows: Vec<f64> = series
            .rows()
            .iter()
            .rev()
            .filter_map(|r| r.capital_flow)
            .take(5)
            .collect();

        Self {
            id: target.id.clone(),
            name: target.display_name.clone(),
            kind: target.kind.label().to_string(),
            latest_date: latest.map(|(d, _)| d.format(date_format).to_string()),
            close,
            prev_close,
            change,
            change_pct,
            latest_capital_flow: flows.first().copied(),
            capital_flow_5d: (!flows.is_empty()).then(|| round_to(flows.iter().sum(), 2)),
            rows: series.len(),
        }
    }
}

/// Reads and writes everything under one output directory.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    out_dir: PathBuf,
    date_format: String,
}

impl SnapshotWriter {
    pub fn new(out_dir: impl Into<PathBuf>, date_format: impl Into<String>) -> Self {
        Self {
            out_dir: out_dir.into(),
            date_format: date_format.into(),
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// `{out_dir}/indices/{id}.csv` or `{out_dir}/holdings/{id}.csv`.
    pub fn series_path(&self, target: &Target) -> Result<PathBuf, WriteError> {
        validate_id(&target.id)?;
        let dir = if target.is_index() { "indices" } else { "holdings" };
        Ok(self.out_dir.join(dir).join(format!("{}.csv", target.id)))
    }

    /// Load the stored series; a missing file is an empty series.
    ///
    /// A file that isn't a series CSV at all is moved aside to
    /// `*.csv.quarantined` and treated as empty, which makes the next fetch a
    /// full-history one.
    pub fn load(&self, target: &Target) -> Result<LoadedSeries, WriteError> {
        let path = self.series_path(target)?;
        let empty = |quarantined| LoadedSeries {
            series: Series::empty(&target.id),
            skipped: 0,
            quarantined,
        };

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(empty(None)),
            Err(e) => return Err(WriteError::from_io(&path, e)),
        };
        if bytes.is_empty() {
            return Ok(empty(None));
        }

        let decoded = String::from_utf8(bytes)
            .map_err(|_| "not valid UTF-8".to_string())
            .and_then(|text| {
                let text = text.trim_start_matches('\u{feff}');
                series_csv::decode(&target.id, text, &self.date_format).map_err(|e| e.to_string())
            });

        match decoded {
            Ok(decoded) => Ok(LoadedSeries {
                series: decoded.series,
                skipped: decoded.skipped,
                quarantined: None,
            }),
            Err(reason) => {
                let quarantine = quarantine_path(&path);
                warn!(
                    target_id = %target.id,
                    path = %path.display(),
                    %reason,
                    "quarantining unreadable series file"
                );
                fs::rename(&path, &quarantine).map_err(|e| WriteError::from_io(&path, e))?;
                Ok(empty(Some(quarantine)))
            }
        }
    }

    pub fn write(&self, target: &Target, series: &Series) -> Result<WriteStatus, WriteError> {
        let path = self.series_path(target)?;
        let text = series_csv::encode(series, &self.date_format).map_err(|source| {
            WriteError::Encode {
                path: path.clone(),
                source,
            }
        })?;
        atomic_write(&path, text.as_bytes())
    }

    /// Write `latest.json`, one entry per target in the order given.
    pub fn write_summary(&self, entries: &[(&Target, &Series)]) -> Result<WriteStatus, WriteError> {
        let path = self.out_dir.join(SUMMARY_FILE);
        let summary: Vec<SummaryEntry> = entries
            .iter()
            .map(|(target, series)| SummaryEntry::from_series(target, series, &self.date_format))
            .collect();
        let mut json = serde_json::to_string_pretty(&summary).map_err(|e| WriteError::Io {
            path: path.clone(),
            source: e.into(),
        })?;
        json.push('\n');
        atomic_write(&path, json.as_bytes())
    }

    /// Write the wide close table for `entries` to `file_name`.
    ///
    /// Returns `None` (and writes nothing) when no series has any rows.
    pub fn write_wide_table(
        &self,
        file_name: &str,
        entries: &[(&str, &Series)],
    ) -> Result<Option<WriteStatus>, WriteError> {
        if entries.iter().all(|(_, s)| s.is_empty()) {
            return Ok(None);
        }
        let path = self.out_dir.join(file_name);
        let text = wide_table(entries, &self.date_format).map_err(|source| WriteError::Encode {
            path: path.clone(),
            source,
        })?;
        atomic_write(&path, text.as_bytes()).map(Some)
    }
}

/// Outer join of closes on date, one column per entry, ascending by date.
fn wide_table(entries: &[(&str, &Series)], date_format: &str) -> Result<String, SeriesFormatError> {
    let mut by_date: BTreeMap<NaiveDate, Vec<Option<f64>>> = BTreeMap::new();
    for (col, (_, series)) in entries.iter().enumerate() {
        for row in series.rows() {
            by_date
                .entry(row.date)
                .or_insert_with(|| vec![None; entries.len()])[col] = row.close;
        }
    }

    let mut wtr = csv::Writer::from_writer(vec![]);
    let mut header = vec!["date"];
    header.extend(entries.iter().map(|(name, _)| *name));
    wtr.write_record(&header)?;

    for (date, closes) in &by_date {
        let mut record = vec![date.format(date_format).to_string()];
        record.extend(
            closes
                .iter()
                .map(|c| c.map_or_else(String::new, |v| format!("{v:.4}"))),
        );
        wtr.write_record(&record)?;
    }

    let data = wtr
        .into_inner()
        .map_err(|e| SeriesFormatError::Csv(e.into_error().into()))?;
    String::from_utf8(data).map_err(|_| SeriesFormatError::NotUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotefeed_core::domain::ObservationRow;

    const FMT: &str = "%Y-%m-%d";

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, FMT).unwrap()
    }

    fn series(id: &str, closes: &[(&str, f64)]) -> Series {
        Series::from_rows(
            id,
            closes
                .iter()
                .map(|(date, close)| ObservationRow {
                    close: Some(*close),
                    ..ObservationRow::empty(d(date))
                })
                .collect::<Vec<_>>(),
        )
    }

    fn writer() -> (tempfile::TempDir, SnapshotWriter) {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path().join("docs"), FMT);
        (dir, writer)
    }

    #[test]
    fn series_paths_split_by_kind() {
        let (_dir, w) = writer();
        let index = w.series_path(&Target::index("000300.SS", "沪深300")).unwrap();
        let holding = w.series_path(&Target::holding("600519.SS")).unwrap();
        assert!(index.ends_with("indices/000300.SS.csv"));
        assert!(holding.ends_with("holdings/600519.SS.csv"));
    }

    #[test]
    fn bad_ids_are_path_invalid() {
        let (_dir, w) = writer();
        for id in ["", "..", ".", "../etc", "a/b", "a\\b"] {
            let err = w.series_path(&Target::holding(id)).unwrap_err();
            assert_eq!(err.kind(), "path_invalid", "id {id:?}");
        }
    }

    #[test]
    fn write_then_rewrite_is_unchanged() {
        let (_dir, w) = writer();
        let target = Target::holding("600519.SS");
        let s = series("600519.SS", &[("2024-01-02", 1710.0), ("2024-01-03", 1685.5)]);

        assert_eq!(w.write(&target, &s).unwrap(), WriteStatus::Written);
        assert_eq!(w.write(&target, &s).unwrap(), WriteStatus::Unchanged);

        let loaded = w.load(&target).unwrap();
        assert_eq!(loaded.series, s);
        assert_eq!(loaded.quarantined, None);
    }

    #[test]
    fn no_tmp_file_left_behind() {
        let (_dir, w) = writer();
        let target = Target::holding("600519.SS");
        w.write(&target, &series("600519.SS", &[("2024-01-02", 1.0)])).unwrap();
        let dir = w.out_dir().join("holdings");
        let names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["600519.SS.csv".to_string()]);
    }

    #[test]
    fn missing_file_loads_empty() {
        let (_dir, w) = writer();
        let loaded = w.load(&Target::holding("000858.SZ")).unwrap();
        assert!(loaded.series.is_empty());
        assert_eq!(loaded.series.target_id(), "000858.SZ");
    }

    #[test]
    fn corrupt_file_is_quarantined() {
        let (_dir, w) = writer();
        let target = Target::index("000001.SS", "上证指数");
        let path = w.series_path(&target).unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "<html>rate limited</html>\n").unwrap();

        let loaded = w.load(&target).unwrap();
        assert!(loaded.series.is_empty());
        let moved = loaded.quarantined.unwrap();
        assert!(moved.to_string_lossy().ends_with("000001.SS.csv.quarantined"));
        assert!(moved.exists());
        assert!(!path.exists());
    }

    #[test]
    fn bom_prefixed_file_still_loads() {
        let (_dir, w) = writer();
        let target = Target::holding("600519.SS");
        let path = w.series_path(&target).unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            "\u{feff}date,open,high,low,close,volume,capital_flow\n2024-01-02,,,,1.5000,,\n",
        )
        .unwrap();
        let loaded = w.load(&target).unwrap();
        assert_eq!(loaded.series.len(), 1);
        assert_eq!(loaded.quarantined, None);
    }

    #[test]
    fn summary_reports_change_and_flow() {
        let target = Target::holding("600519.SS");
        let mut rows = series(
            "600519.SS",
            &[("2024-01-02", 1700.0), ("2024-01-03", 1710.0), ("2024-01-04", 1690.0)],
        )
        .into_rows();
        rows[0].capital_flow = Some(100.0);
        rows[2].capital_flow = Some(-40.5);
        let s = Series::from_rows("600519.SS", rows);

        let entry = SummaryEntry::from_series(&target, &s, FMT);
        assert_eq!(entry.latest_date.as_deref(), Some("2024-01-04"));
        assert_eq!(entry.close, Some(1690.0));
        assert_eq!(entry.prev_close, Some(1710.0));
        assert_eq!(entry.change, Some(-20.0));
        assert_eq!(entry.change_pct, Some(-1.17));
        assert_eq!(entry.latest_capital_flow, Some(-40.5));
        assert_eq!(entry.capital_flow_5d, Some(59.5));
        assert_eq!(entry.rows, 3);
        assert_eq!(entry.kind, "holding");
    }

    #[test]
    fn summary_of_empty_series_is_all_null() {
        let entry = SummaryEntry::from_series(&Target::holding("X.SS"), &Series::empty("X.SS"), FMT);
        assert_eq!(entry.latest_date, None);
        assert_eq!(entry.change, None);
        assert_eq!(entry.capital_flow_5d, None);
        assert_eq!(entry.rows, 0);
    }

    #[test]
    fn wide_table_outer_joins_on_date() {
        let (_dir, w) = writer();
        let a = series("000001.SS", &[("2024-01-02", 2962.28), ("2024-01-03", 2967.25)]);
        let b = series("000300.SS", &[("2024-01-03", 3386.35), ("2024-01-04", 3336.36)]);

        let status = w
            .write_wide_table(INDEX_TABLE_FILE, &[("上证指数", &a), ("沪深300", &b)])
            .unwrap();
        assert_eq!(status, Some(WriteStatus::Written));

        let text = fs::read_to_string(w.out_dir().join(INDEX_TABLE_FILE)).unwrap();
        assert_eq!(
            text,
            "date,上证指数,沪深300\n\
             2024-01-02,2962.2800,\n\
             2024-01-03,2967.2500,3386.3500\n\
             2024-01-04,,3336.3600\n"
        );
    }

    #[test]
    fn wide_table_skipped_without_rows() {
        let (_dir, w) = writer();
        let empty = Series::empty("X.SS");
        let status = w.write_wide_table(HOLDING_TABLE_FILE, &[("X.SS", &empty)]).unwrap();
        assert_eq!(status, None);
        assert!(!w.out_dir().join(HOLDING_TABLE_FILE).exists());
    }

    #[test]
    fn io_errors_are_classified() {
        let p = Path::new("/tmp/x");
        let full = WriteError::from_io(p, io::Error::from_raw_os_error(ENOSPC));
        assert_eq!(full.kind(), "disk_full");
        let denied = WriteError::from_io(p, io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(denied.kind(), "permission_denied");
        let other = WriteError::from_io(p, io::Error::from(io::ErrorKind::Other));
        assert_eq!(other.kind(), "io");
    }
}
