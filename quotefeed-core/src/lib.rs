//! quotefeed core: targets, daily series, providers, source resolution, merge.
//!
//! - Domain types (targets, observation rows, series)
//! - Provider traits with Yahoo chart and Eastmoney implementations
//! - Retry policy and circuit breaker shared by the HTTP providers
//! - Source resolver with per-target fallback and deadline
//! - Incremental merge keyed by trading date
//! - Stable CSV layout for stored series

pub mod data;
pub mod domain;
