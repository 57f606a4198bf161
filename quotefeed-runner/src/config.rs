//! Refresh configuration.
//!
//! Every field has a default, so a missing config file means built-in
//! defaults. CLI flags and environment overrides are applied on top by the
//! binary before [`RefreshConfig::validate`] runs.

use chrono::NaiveDate;
use quotefeed_core::data::{ResolverSettings, RetryPolicy};
use quotefeed_core::domain::Target;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A configured index: Yahoo-style symbol plus the name shown in outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub id: String,
    pub name: String,
}

impl IndexSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    pub fn to_target(&self) -> Target {
        Target::index(&self.id, &self.name)
    }
}

fn default_indices() -> Vec<IndexSpec> {
    vec![
        IndexSpec::new("000001.SS", "上证指数"),
        IndexSpec::new("000300.SS", "沪深300"),
        IndexSpec::new("399001.SZ", "深证成指"),
        IndexSpec::new("399006.SZ", "创业板指"),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Publish root for series files, `latest.json` and the wide tables.
    pub out_dir: PathBuf,
    /// User's holdings list.
    pub holdings_csv: PathBuf,
    /// Run log location; kept outside `out_dir` so it is never published.
    pub run_log: PathBuf,
    /// chrono format used for the date column of every CSV written.
    pub date_format: String,
    /// Calendar days re-fetched behind the last stored date.
    pub overlap_days: u32,
    pub index_history_years: u32,
    pub holding_history_years: u32,
    /// Worker threads; 1 means strictly sequential.
    pub max_workers: usize,
    pub target_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub fetch_capital_flow: bool,
    pub indices: Vec<IndexSpec>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("docs"),
            holdings_csv: PathBuf::from("data/holdings.csv"),
            run_log: PathBuf::from("logs/last_run.json"),
            date_format: "%Y-%m-%d".to_string(),
            overlap_days: 5,
            index_history_years: 15,
            holding_history_years: 10,
            max_workers: 4,
            target_timeout_secs: 60,
            request_timeout_secs: 20,
            max_retries: 2,
            fetch_capital_flow: true,
            indices: default_indices(),
        }
    }
}

/// Stored dates must read back as the same day, or every re-run would drop
/// rows it cannot parse.
fn date_format_round_trips(format: &str) -> bool {
    use std::fmt::Write as _;

    let Some(sample) = NaiveDate::from_ymd_opt(2024, 11, 28) else {
        return false;
    };
    let mut text = String::new();
    // Unknown specifiers surface as a fmt error here rather than a panic later.
    if write!(text, "{}", sample.format(format)).is_err() {
        return false;
    }
    NaiveDate::parse_from_str(&text, format) == Ok(sample)
}

impl RefreshConfig {
    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse from a TOML string; omitted keys take their defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if self.target_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if self.date_format.trim().is_empty() {
            return Err(ConfigError::Invalid("date_format is empty".into()));
        }
        if !date_format_round_trips(&self.date_format) {
            return Err(ConfigError::Invalid(format!(
                "date_format {:?} does not identify a full date",
                self.date_format
            )));
        }
        let mut seen = HashSet::new();
        for index in &self.indices {
            if index.id.trim().is_empty() {
                return Err(ConfigError::Invalid("index with empty id".into()));
            }
            if !seen.insert(index.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate index id {}", index.id)));
            }
        }
        Ok(())
    }

    pub fn index_targets(&self) -> Vec<Target> {
        self.indices.iter().map(IndexSpec::to_target).collect()
    }

    pub fn target_timeout(&self) -> Duration {
        Duration::from_secs(self.target_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            target_timeout: self.target_timeout(),
            index_history_years: self.index_history_years,
            holding_history_years: self.holding_history_years,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default().with_max_retries(self.max_retries)
    }
}
