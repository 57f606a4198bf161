//! Domain types: tracked targets, daily observations, and per-target series.

pub mod observation;
pub mod target;

pub use observation::{ObservationRow, Series};
pub use target::{Target, TargetKind};
