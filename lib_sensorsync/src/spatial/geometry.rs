//! SensorThings locations arrive as GeoJSON. They are converted into `geo`
//! geometries once, reprojected into the map projection, and then tested
//! against viewport extents.

use geo::{coord, BoundingRect, Intersects, MapCoords, Point};
use geojson::GeoJson;
use serde_json::Value;

use super::extent::Extent;
use super::projection::{transform, Projection};
use crate::errors::{SyncError, SyncResult};

/// A location geometry in one projection.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    pub shape: geo::Geometry<f64>,
}

impl Geometry {
    pub fn point(x: f64, y: f64) -> Self {
        Self { shape: Point::new(x, y).into() }
    }

    /// Reads a GeoJSON geometry, `Feature` or `GeometryCollection`.
    pub fn from_geojson(value: &Value) -> SyncResult<Self> {
        let geojson = GeoJson::from_json_value(value.clone())
            .map_err(|e| SyncError::Validation(format!("invalid GeoJSON location: {}", e)))?;
        let shape = geo::Geometry::<f64>::try_from(geojson)
            .map_err(|e| SyncError::Validation(format!("unsupported GeoJSON location: {}", e)))?;
        if shape.bounding_rect().is_none() {
            return Err(SyncError::Validation("GeoJSON geometry has no positions".to_string()));
        }
        Ok(Self { shape })
    }

    /// Bounding box, or `None` for an empty geometry.
    pub fn bbox(&self) -> Option<Extent> {
        self.shape.bounding_rect().map(Extent::from)
    }

    /// Exact intersection with the rectangle; boundaries count.
    pub fn intersects_extent(&self, extent: &Extent) -> bool {
        self.shape.intersects(&extent.rect())
    }

    pub fn reproject(&self, from: Projection, to: Projection) -> SyncResult<Self> {
        if from == to {
            return Ok(self.clone());
        }
        let shape = self
            .shape
            .try_map_coords(|c| transform([c.x, c.y], from, to).map(|[x, y]| coord! { x: x, y: y }))?;
        Ok(Self { shape })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_point_and_feature() {
        let p = Geometry::from_geojson(&json!({"type": "Point", "coordinates": [10.0, 53.5]})).unwrap();
        assert_eq!(p, Geometry::point(10.0, 53.5));
        let f = Geometry::from_geojson(&json!({
            "type": "Feature",
            "properties": {},
            "geometry": {"type": "Point", "coordinates": [1, 2, 3]}
        }))
        .unwrap();
        assert_eq!(f, Geometry::point(1.0, 2.0));
    }

    #[test]
    fn polygon_bbox_intersection() {
        let g = Geometry::from_geojson(&json!({
            "type": "Polygon",
            "coordinates": [[[0, 0], [4, 0], [4, 4], [0, 4], [0, 0]]]
        }))
        .unwrap();
        assert_eq!(g.bbox().map(|b| b.to_array()), Some([0.0, 0.0, 4.0, 4.0]));
        assert!(g.intersects_extent(&Extent::new(3.0, 3.0, 10.0, 10.0)));
        assert!(!g.intersects_extent(&Extent::new(5.0, 5.0, 10.0, 10.0)));
    }

    #[test]
    fn line_outside_the_extent_does_not_intersect() {
        let g = Geometry::from_geojson(&json!({
            "type": "LineString",
            "coordinates": [[0, 10], [10, 0]]
        }))
        .unwrap();
        assert!(!g.intersects_extent(&Extent::new(0.0, 0.0, 2.0, 2.0)));
        assert!(g.intersects_extent(&Extent::new(4.0, 4.0, 6.0, 6.0)));
    }

    #[test]
    fn points_on_the_edge_intersect() {
        assert!(Geometry::point(2.0, 1.0).intersects_extent(&Extent::new(0.0, 0.0, 2.0, 2.0)));
    }

    #[test]
    fn rejects_malformed() {
        assert!(Geometry::from_geojson(&json!({"coordinates": [1, 2]})).is_err());
        assert!(Geometry::from_geojson(&json!({"type": "Point", "coordinates": ["a", 2]})).is_err());
        assert!(Geometry::from_geojson(&json!({"type": "Circle", "coordinates": [1, 2]})).is_err());
        assert!(Geometry::from_geojson(&json!({"type": "MultiPoint", "coordinates": []})).is_err());
    }
}
