//! Point reprojection between the coordinate reference systems a map portal
//! commonly runs in. All transforms pivot through geographic WGS84
//! longitude/latitude; ETRS89 and WGS84 are treated as the same datum.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use crate::errors::{SyncError, SyncResult};

const MERCATOR_RADIUS: f64 = 6_378_137.0;
const MERCATOR_MAX_LAT: f64 = 85.051_128_779_806_59;

const UTM_SCALE: f64 = 0.9996;
const UTM_FALSE_EASTING: f64 = 500_000.0;
const UTM_FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

/// Reference ellipsoid parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Ellipsoid {
    a: f64,
    inv_f: f64,
}

const GRS80: Ellipsoid = Ellipsoid { a: 6_378_137.0, inv_f: 298.257_222_101 };
const WGS84: Ellipsoid = Ellipsoid { a: 6_378_137.0, inv_f: 298.257_223_563 };

/// A supported coordinate reference system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Projection {
    /// EPSG:4326, longitude/latitude in degrees.
    Wgs84,
    /// EPSG:3857 (alias EPSG:900913), spherical Web Mercator in metres.
    WebMercator,
    /// EPSG:258zz, ETRS89 / UTM zone zz north.
    EtrsUtm { zone: u8 },
    /// EPSG:326zz (north) or EPSG:327zz (south), WGS84 / UTM.
    WgsUtm { zone: u8, north: bool },
}

impl Projection {
    /// The canonical `EPSG:<code>` identifier.
    pub fn code(&self) -> String {
        match self {
            Projection::Wgs84 => "EPSG:4326".to_string(),
            Projection::WebMercator => "EPSG:3857".to_string(),
            Projection::EtrsUtm { zone } => format!("EPSG:{}", 25800 + u32::from(*zone)),
            Projection::WgsUtm { zone, north } => {
                let base = if *north { 32600 } else { 32700 };
                format!("EPSG:{}", base + u32::from(*zone))
            }
        }
    }

    fn unproject(&self, x: f64, y: f64) -> SyncResult<[f64; 2]> {
        match self {
            Projection::Wgs84 => Ok([x, y]),
            Projection::WebMercator => Ok([
                (x / MERCATOR_RADIUS).to_degrees(),
                (2.0 * ((y / MERCATOR_RADIUS).exp().atan() - PI / 4.0)).to_degrees(),
            ]),
            Projection::EtrsUtm { zone } => Ok(utm_inverse(GRS80, *zone, true, x, y)),
            Projection::WgsUtm { zone, north } => Ok(utm_inverse(WGS84, *zone, *north, x, y)),
        }
    }

    fn project(&self, lon: f64, lat: f64) -> SyncResult<[f64; 2]> {
        if !(-90.0..=90.0).contains(&lat) {
            return Err(SyncError::Validation(format!("latitude {} out of range", lat)));
        }
        match self {
            Projection::Wgs84 => Ok([lon, lat]),
            Projection::WebMercator => {
                let lat = lat.clamp(-MERCATOR_MAX_LAT, MERCATOR_MAX_LAT);
                Ok([
                    MERCATOR_RADIUS * lon.to_radians(),
                    MERCATOR_RADIUS * (PI / 4.0 + lat.to_radians() / 2.0).tan().ln(),
                ])
            }
            Projection::EtrsUtm { zone } => Ok(utm_forward(GRS80, *zone, true, lon, lat)),
            Projection::WgsUtm { zone, north } => Ok(utm_forward(WGS84, *zone, *north, lon, lat)),
        }
    }
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for Projection {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(SyncError::Validation("projection identifier is empty".to_string()));
        }
        let code = trimmed
            .rsplit(':')
            .next()
            .and_then(|c| c.parse::<u32>().ok())
            .filter(|_| trimmed.to_ascii_uppercase().contains("EPSG"))
            .ok_or_else(|| SyncError::Validation(format!("unknown projection '{}'", trimmed)))?;

        match code {
            4326 => Ok(Projection::Wgs84),
            3857 | 900913 => Ok(Projection::WebMercator),
            25801..=25860 => Ok(Projection::EtrsUtm { zone: (code - 25800) as u8 }),
            32601..=32660 => Ok(Projection::WgsUtm { zone: (code - 32600) as u8, north: true }),
            32701..=32760 => Ok(Projection::WgsUtm { zone: (code - 32700) as u8, north: false }),
            _ => Err(SyncError::Validation(format!("unsupported projection '{}'", trimmed))),
        }
    }
}

/// Reprojects one point. Identical projections pass the point through.
pub fn transform(point: [f64; 2], from: Projection, to: Projection) -> SyncResult<[f64; 2]> {
    if !point[0].is_finite() || !point[1].is_finite() {
        return Err(SyncError::Validation(format!("point {:?} is not finite", point)));
    }
    if from == to {
        return Ok(point);
    }
    let [lon, lat] = from.unproject(point[0], point[1])?;
    let out = to.project(lon, lat)?;
    if !out[0].is_finite() || !out[1].is_finite() {
        return Err(SyncError::Validation(format!(
            "reprojection of {:?} from {} to {} failed",
            point, from, to
        )));
    }
    Ok(out)
}

fn central_meridian(zone: u8) -> f64 {
    (f64::from(zone) * 6.0 - 183.0).to_radians()
}

fn meridian_arc(e2: f64, a: f64, phi: f64) -> f64 {
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    a * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
        - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
        + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
        - (35.0 * e6 / 3072.0) * (6.0 * phi).sin())
}

// Transverse Mercator series after Snyder, USGS Professional Paper 1395.
fn utm_forward(ell: Ellipsoid, zone: u8, north: bool, lon: f64, lat: f64) -> [f64; 2] {
    let f = 1.0 / ell.inv_f;
    let e2 = f * (2.0 - f);
    let ep2 = e2 / (1.0 - e2);
    let phi = lat.to_radians();
    let lambda = lon.to_radians();

    let (sin_phi, cos_phi) = phi.sin_cos();
    let n = ell.a / (1.0 - e2 * sin_phi * sin_phi).sqrt();
    let t = phi.tan().powi(2);
    let c = ep2 * cos_phi * cos_phi;
    let a = (lambda - central_meridian(zone)) * cos_phi;
    let m = meridian_arc(e2, ell.a, phi);

    let x = UTM_SCALE
        * n
        * (a + (1.0 - t + c) * a.powi(3) / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a.powi(5) / 120.0)
        + UTM_FALSE_EASTING;
    let mut y = UTM_SCALE
        * (m + n
            * phi.tan()
            * (a * a / 2.0
                + (5.0 - t + 9.0 * c + 4.0 * c * c) * a.powi(4) / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a.powi(6) / 720.0));
    if !north {
        y += UTM_FALSE_NORTHING_SOUTH;
    }
    [x, y]
}

fn utm_inverse(ell: Ellipsoid, zone: u8, north: bool, x: f64, y: f64) -> [f64; 2] {
    let f = 1.0 / ell.inv_f;
    let e2 = f * (2.0 - f);
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    let ep2 = e2 / (1.0 - e2);
    let northing = if north { y } else { y - UTM_FALSE_NORTHING_SOUTH };

    let m = northing / UTM_SCALE;
    let mu = m / (ell.a * (1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0));
    let e1 = (1.0 - (1.0 - e2).sqrt()) / (1.0 + (1.0 - e2).sqrt());
    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

    let (sin_phi1, cos_phi1) = phi1.sin_cos();
    let c1 = ep2 * cos_phi1 * cos_phi1;
    let t1 = phi1.tan().powi(2);
    let n1 = ell.a / (1.0 - e2 * sin_phi1 * sin_phi1).sqrt();
    let r1 = ell.a * (1.0 - e2) / (1.0 - e2 * sin_phi1 * sin_phi1).powf(1.5);
    let d = (x - UTM_FALSE_EASTING) / (n1 * UTM_SCALE);

    let phi = phi1
        - (n1 * phi1.tan() / r1)
            * (d * d / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d.powi(4) / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ep2 - 3.0 * c1 * c1)
                    * d.powi(6)
                    / 720.0);
    let lambda = central_meridian(zone)
        + (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
            + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1) * d.powi(5)
                / 120.0)
            / cos_phi1;

    [lambda.to_degrees(), phi.to_degrees()]
}
