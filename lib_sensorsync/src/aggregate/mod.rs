//! # Aggregation Module
//!
//! Shapes raw SensorThings results into display-ready per-Thing records.
//!
//! ## Contained Modules:
//!
//! - **`pipe`**: Helpers for `" | "`-joined, positionally aligned columns.
//! - **`model`**: Serde models of Thing / Datastream / Observation / Location
//!   and the derived `AggregatedRecord` with its `DatastreamSummary`.
//! - **`time`**: phenomenonTime rendering with `chrono` and `chrono-tz`.
//! - **`aggregator`**: Fragment union, datastream re-rooting and the
//!   `EntityAggregator` itself.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Fragment union, re-rooting and aggregation.
pub mod aggregator;
/// Entity models and the aggregated record.
pub mod model;
/// Pipe-joined column helpers.
pub mod pipe;
/// phenomenonTime rendering.
pub mod time;

pub use aggregator::{AggregateOptions, EntityAggregator, NoDataPolicy, RawEntity};
pub use model::{AggregatedRecord, Datastream, DatastreamSummary, Location, Observation, Thing};
pub use time::TimeRendering;
