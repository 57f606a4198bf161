//! Source resolver: turns a target plus an optional cutoff into canonical rows.
//!
//! Owns the fallback chain (indices may fall back to a secondary provider),
//! the per-target deadline, and normalization. Capital flow is a separate,
//! independently failing call so that its flakiness never reaches the price
//! path.

use super::normalize::{normalize_flow, normalize_rows};
use super::provider::{DataProvider, DataSource, FetchError, FetchRequest, FlowProvider};
use crate::domain::{ObservationRow, Target};
use chrono::{Days, NaiveDate};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverSettings {
    /// Time budget per call when no explicit deadline is given.
    pub target_timeout: Duration,
    /// Full-history window for index targets.
    pub index_history_years: u32,
    /// Full-history window for holding targets.
    pub holding_history_years: u32,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            target_timeout: Duration::from_secs(60),
            index_history_years: 15,
            holding_history_years: 10,
        }
    }
}

/// Canonical rows for one target, ascending by date.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub rows: Vec<ObservationRow>,
    pub source: DataSource,
    /// Rows the normalizer threw away (bad dates, holiday placeholders).
    pub dropped: usize,
}

pub struct SourceResolver {
    primary: Arc<dyn DataProvider>,
    index_fallback: Option<Arc<dyn DataProvider>>,
    flow: Option<Arc<dyn FlowProvider>>,
    settings: ResolverSettings,
    as_of: NaiveDate,
}

impl SourceResolver {
    /// `as_of` is the last day to request; normally today.
    pub fn new(primary: Arc<dyn DataProvider>, settings: ResolverSettings, as_of: NaiveDate) -> Self {
        Self {
            primary,
            index_fallback: None,
            flow: None,
            settings,
            as_of,
        }
    }

    pub fn with_index_fallback(mut self, provider: Arc<dyn DataProvider>) -> Self {
        self.index_fallback = Some(provider);
        self
    }

    pub fn with_flow_provider(mut self, provider: Arc<dyn FlowProvider>) -> Self {
        self.flow = Some(provider);
        self
    }

    pub fn has_flow_source(&self) -> bool {
        self.flow.is_some()
    }

    pub fn as_of(&self) -> NaiveDate {
        self.as_of
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    /// First day of a full-history fetch for this target.
    pub fn history_start(&self, target: &Target) -> NaiveDate {
        let years = if target.is_index() {
            self.settings.index_history_years
        } else {
            self.settings.holding_history_years
        };
        self.as_of
            .checked_sub_days(Days::new(365 * u64::from(years)))
            .unwrap_or(NaiveDate::MIN)
    }

    fn request(&self, target: &Target, since: Option<NaiveDate>, deadline: Instant) -> FetchRequest {
        FetchRequest {
            symbol: target.id.clone(),
            since,
            history_start: self.history_start(target),
            until: self.as_of,
            deadline,
        }
    }

    /// Fetch rows on/after `since` (or full history), within the default budget.
    pub fn fetch(&self, target: &Target, since: Option<NaiveDate>) -> Result<Resolved, FetchError> {
        self.fetch_before(target, since, Instant::now() + self.settings.target_timeout)
    }

    /// Like [`fetch`](Self::fetch) with an explicit deadline shared with
    /// other calls for the same target.
    pub fn fetch_before(
        &self,
        target: &Target,
        since: Option<NaiveDate>,
        deadline: Instant,
    ) -> Result<Resolved, FetchError> {
        let request = self.request(target, since, deadline);

        let mut chain: Vec<&Arc<dyn DataProvider>> = vec![&self.primary];
        if target.is_index() {
            chain.extend(self.index_fallback.iter());
        }

        let mut first_error: Option<FetchError> = None;
        let mut answered_empty = false;

        for provider in chain {
            if !provider.is_available() {
                first_error.get_or_insert_with(|| {
                    FetchError::Unreachable(format!("{} is refusing requests", provider.name()))
                });
                continue;
            }

            match provider.fetch_daily(&request) {
                Ok(raw) => {
                    let normalized = normalize_rows(&raw, since);
                    if normalized.rows.is_empty() {
                        debug!(target_id = %target.id, provider = provider.name(), "no usable rows");
                        answered_empty = true;
                        continue;
                    }
                    if normalized.dropped > 0 {
                        warn!(
                            target_id = %target.id,
                            provider = provider.name(),
                            dropped = normalized.dropped,
                            "dropped malformed rows"
                        );
                    }
                    return Ok(Resolved {
                        rows: normalized.rows,
                        source: raw.source,
                        dropped: normalized.dropped,
                    });
                }
                Err(e) => {
                    debug!(target_id = %target.id, provider = provider.name(), error = %e, "provider failed");
                    answered_empty |= e.is_empty_response();
                    first_error.get_or_insert(e);
                }
            }
        }

        if answered_empty {
            return Err(FetchError::EmptyResponse {
                symbol: target.id.clone(),
            });
        }
        Err(first_error
            .unwrap_or_else(|| FetchError::Unreachable(format!("no provider for {}", target.id))))
    }

    /// Daily net capital flow keyed by date. Best effort: callers treat any
    /// error as "no flow this run".
    pub fn fetch_capital_flow(
        &self,
        target: &Target,
        since: Option<NaiveDate>,
        deadline: Instant,
    ) -> Result<BTreeMap<NaiveDate, f64>, FetchError> {
        let provider = self.flow.as_ref().ok_or_else(|| {
            FetchError::Unreachable("no capital-flow provider configured".into())
        })?;
        let request = self.request(target, since, deadline);
        let raw = provider.fetch_flow(&request)?;
        let mut flows = normalize_flow(&raw);
        if let Some(cutoff) = since {
            flows = flows.split_off(&cutoff);
        }
        Ok(flows)
    }
}
