use geo::{coord, BoundingRect, Intersects, MapCoords, Polygon, Rect};
use serde::{Deserialize, Serialize};

use super::projection::{transform, Projection};
use crate::errors::{SyncError, SyncResult};

/// An axis-aligned rectangle `[min_x, min_y, max_x, max_y]` in some projection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Extent(Rect<f64>);

impl Extent {
    /// Corners are normalized, so swapped bounds describe the same rectangle.
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self(Rect::new(coord! { x: min_x, y: min_y }, coord! { x: max_x, y: max_y }))
    }

    /// Builds an extent from a slice that must hold exactly four finite numbers.
    pub fn from_slice(bounds: &[f64]) -> SyncResult<Self> {
        if bounds.len() != 4 {
            return Err(SyncError::Validation(format!(
                "extent needs exactly 4 bounds, got {}",
                bounds.len()
            )));
        }
        if bounds.iter().any(|b| !b.is_finite()) {
            return Err(SyncError::Validation(format!("extent has non-finite bounds: {:?}", bounds)));
        }
        Ok(Self::new(bounds[0], bounds[1], bounds[2], bounds[3]))
    }

    pub fn rect(&self) -> Rect<f64> {
        self.0
    }

    pub fn width(&self) -> f64 {
        self.0.width()
    }

    pub fn height(&self) -> f64 {
        self.0.height()
    }

    /// The closed ring of the rectangle, counter-clockwise from the lower left
    /// corner: five vertices, the last repeating the first.
    pub fn ring(&self) -> [[f64; 2]; 5] {
        let (min, max) = (self.0.min(), self.0.max());
        [[min.x, min.y], [max.x, min.y], [max.x, max.y], [min.x, max.y], [min.x, min.y]]
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        self.0.intersects(&coord! { x: x, y: y })
    }

    /// Touching edges count as an intersection.
    pub fn intersects(&self, other: &Extent) -> bool {
        self.0.intersects(&other.0)
    }

    pub fn to_array(&self) -> [f64; 4] {
        let (min, max) = (self.0.min(), self.0.max());
        [min.x, min.y, max.x, max.y]
    }

    /// The bounding rectangle of this extent's outline in projection `to`.
    pub fn reproject(&self, from: Projection, to: Projection) -> SyncResult<Extent> {
        if from == to {
            return Ok(*self);
        }
        let outline: Polygon<f64> = self.0.to_polygon();
        let moved = outline.try_map_coords(|c| transform([c.x, c.y], from, to).map(|[x, y]| coord! { x: x, y: y }))?;
        moved
            .bounding_rect()
            .map(Extent)
            .ok_or_else(|| SyncError::Validation(format!("extent {:?} has no outline", self.to_array())))
    }
}

impl From<Rect<f64>> for Extent {
    fn from(rect: Rect<f64>) -> Self {
        Self(rect)
    }
}

impl TryFrom<Vec<f64>> for Extent {
    type Error = SyncError;

    fn try_from(value: Vec<f64>) -> Result<Self, Self::Error> {
        Extent::from_slice(&value)
    }
}

impl From<Extent> for Vec<f64> {
    fn from(value: Extent) -> Self {
        value.to_array().to_vec()
    }
}

/// Moves every side of `extent` outward by `factor` times the extent's size
/// along that axis. Negative factors shrink the extent.
///
/// Buffering the viewport keeps entities that drift across its edge between
/// two refreshes inside the subscription set.
pub fn enlarge_extent(extent: &Extent, factor: f64) -> Extent {
    let [min_x, min_y, max_x, max_y] = extent.to_array();
    let dx = extent.width() * factor;
    let dy = extent.height() * factor;
    Extent::new(min_x - dx, min_y - dy, max_x + dx, max_y + dy)
}
