//! # Spatial Module
//!
//! Everything the sync engine needs to know about space: the projections a
//! viewport can be expressed in, the extent arithmetic used to buffer a
//! viewport, the `geo` geometry of a SensorThings location, and the
//! OGC spatial filter builder that scopes a bulk query to a viewport.
//!
//! ## Contained Modules:
//!
//! - **`projection`**: Pure-Rust reprojection between EPSG:4326, Web
//!   Mercator and the UTM families used by municipal map portals.
//! - **`extent`**: The `Extent` rectangle (a `geo::Rect`) and its enlargement.
//! - **`geometry`**: GeoJSON locations as `geo` geometries.
//! - **`query`**: `st_intersects` / `st_within` filters and their splicing
//!   into an OData query string.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Extent rectangle and buffering.
pub mod extent;
/// GeoJSON locations as `geo` geometries.
pub mod geometry;
/// Coordinate reference systems and point reprojection.
pub mod projection;
/// Spatial filter construction for SensorThings queries.
pub mod query;

pub use extent::{enlarge_extent, Extent};
pub use geometry::Geometry;
pub use projection::{transform, Projection};
pub use query::{build_extent_filter, splice_filter_into_url, RootKind};
