//! Fetching, normalizing, merging and storing daily series

pub mod circuit_breaker;
pub mod eastmoney;
pub mod holdings;
pub mod http;
pub mod merge;
pub mod normalize;
pub mod provider;
pub mod resolver;
pub mod retry;
pub mod series_csv;
pub mod yahoo;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use eastmoney::EastmoneyProvider;
pub use holdings::{load_holdings, parse_holdings, HoldingsError, HoldingsList};
pub use http::HttpFetcher;
pub use merge::{merge, merge_with_stats, MergeStats};
pub use provider::{DataProvider, DataSource, FetchError, FetchRequest, FlowProvider};
pub use resolver::{Resolved, ResolverSettings, SourceResolver};
pub use retry::RetryPolicy;
pub use series_csv::SeriesFormatError;
pub use yahoo::YahooProvider;
