//! OGC SensorThings spatial filters.
//!
//! A viewport extent becomes a closed five-vertex polygon in the service
//! projection, wrapped in `st_intersects` or `st_within` against the
//! location path of the queried root collection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use super::extent::Extent;
use super::projection::{transform, Projection};
use crate::errors::{SyncError, SyncResult};

const FILTER_KEY: &str = "$filter";

/// The collection a bulk query is rooted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RootKind {
    #[default]
    Things,
    Datastreams,
}

impl RootKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RootKind::Things => "Things",
            RootKind::Datastreams => "Datastreams",
        }
    }

    /// Datastreams own no location, so their filter hops through the Thing.
    pub fn location_path(&self) -> &'static str {
        match self {
            RootKind::Things => "Locations/location",
            RootKind::Datastreams => "Thing/Locations/location",
        }
    }
}

impl fmt::Display for RootKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RootKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Things" => Ok(RootKind::Things),
            "Datastreams" => Ok(RootKind::Datastreams),
            other => Err(SyncError::Validation(format!("unknown root collection '{}'", other))),
        }
    }
}

/// Builds the spatial predicate for `extent`, reprojecting its ring from
/// `source_projection` to `target_projection` when they differ.
pub fn build_extent_filter(
    extent: &[f64],
    source_projection: &str,
    target_projection: &str,
    root: RootKind,
    intersect: bool,
) -> SyncResult<String> {
    let extent = Extent::from_slice(extent)?;
    if source_projection.trim().is_empty() || target_projection.trim().is_empty() {
        return Err(SyncError::Validation("source and target projection are required".to_string()));
    }

    let mut vertices = extent.ring().to_vec();
    if source_projection != target_projection {
        let from = Projection::from_str(source_projection)?;
        let to = Projection::from_str(target_projection)?;
        if from != to {
            vertices = vertices
                .into_iter()
                .map(|p| transform(p, from, to))
                .collect::<SyncResult<Vec<_>>>()?;
        }
    }

    let ring = vertices
        .iter()
        .map(|[x, y]| format!("{} {}", x, y))
        .collect::<Vec<_>>()
        .join(",");
    let predicate = if intersect { "st_intersects" } else { "st_within" };

    Ok(format!(
        "{}({},geography'POLYGON (({}))')",
        predicate,
        root.location_path(),
        ring
    ))
}

/// Puts `filter` into the `$filter` query parameter of `url`.
///
/// An existing filter without a polygon clause is AND-combined with the new
/// one. An existing filter that already carries a polygon is left untouched.
pub fn splice_filter_into_url(url: &str, filter: &str) -> SyncResult<String> {
    let mut parsed =
        Url::parse(url).map_err(|e| SyncError::Validation(format!("invalid url '{}': {}", url, e)))?;

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    match pairs.iter_mut().find(|(k, _)| k == FILTER_KEY) {
        Some((_, existing)) if existing.to_ascii_uppercase().contains("POLYGON") => {
            return Ok(parsed.to_string());
        }
        Some((_, existing)) if existing.trim().is_empty() => *existing = filter.to_string(),
        Some((_, existing)) => *existing = format!("{} and {}", existing, filter),
        None => pairs.push((FILTER_KEY.to_string(), filter.to_string())),
    }

    parsed.query_pairs_mut().clear().extend_pairs(pairs.iter());
    Ok(parsed.to_string())
}
