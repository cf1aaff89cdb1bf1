//! GeoJSON geometry in EPSG:4326.
//!
//! Every geometry stored in parameters or results uses longitude/latitude
//! degrees on WGS84. Positions serialize as GeoJSON `[lon, lat]` arrays.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// The only coordinate reference system accepted by the engine.
pub const CRS_EPSG_4326: &str = "EPSG:4326";

/// Mean Earth radius used for ring projection and distances.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Vertex count for projected zone rings (excluding the closing vertex).
pub const DEFAULT_RING_SEGMENTS: usize = 32;

/// Longitude/latitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Position {
    /// Longitude in degrees, `[-180, 180]`.
    pub lon: f64,
    /// Latitude in degrees, `[-90, 90]`.
    pub lat: f64,
}

impl Position {
    /// Creates a validated position.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidGeometry` when either coordinate is
    /// not finite or falls outside EPSG:4326 bounds.
    pub fn new(lon: f64, lat: f64) -> Result<Self, ValidationError> {
        let pos = Self { lon, lat };
        pos.validate()?;
        Ok(pos)
    }

    /// Checks EPSG:4326 bounds.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidGeometry` on out-of-range coordinates.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.lon.is_finite() || !self.lat.is_finite() {
            return Err(ValidationError::InvalidGeometry {
                reason: "coordinates must be finite".to_string(),
            });
        }
        if !(-180.0..=180.0).contains(&self.lon) || !(-90.0..=90.0).contains(&self.lat) {
            return Err(ValidationError::InvalidGeometry {
                reason: format!(
                    "position ({}, {}) is outside {CRS_EPSG_4326} bounds",
                    self.lon, self.lat
                ),
            });
        }
        Ok(())
    }
}

impl From<[f64; 2]> for Position {
    fn from(value: [f64; 2]) -> Self {
        Self {
            lon: value[0],
            lat: value[1],
        }
    }
}

impl From<Position> for [f64; 2] {
    fn from(value: Position) -> Self {
        [value.lon, value.lat]
    }
}

/// Axis-aligned bounding box `(min_lon, min_lat, max_lon, max_lat)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Western edge.
    pub min_lon: f64,
    /// Southern edge.
    pub min_lat: f64,
    /// Eastern edge.
    pub max_lon: f64,
    /// Northern edge.
    pub max_lat: f64,
}

impl BoundingBox {
    /// Creates a validated bounding box.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidGeometry` if a corner is out of
    /// bounds or the minimum exceeds the maximum on either axis.
    pub fn new(
        min_lon: f64,
        min_lat: f64,
        max_lon: f64,
        max_lat: f64,
    ) -> Result<Self, ValidationError> {
        Position::new(min_lon, min_lat)?;
        Position::new(max_lon, max_lat)?;
        if min_lon > max_lon || min_lat > max_lat {
            return Err(ValidationError::InvalidGeometry {
                reason: "bounding box minimum exceeds maximum".to_string(),
            });
        }
        Ok(Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        })
    }

    /// Parses the `minx,miny,maxx,maxy` query form.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidGeometry` on malformed input.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        let parts = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ValidationError::InvalidGeometry {
                reason: format!("bbox '{s}' is not numeric: {e}"),
            })?;
        let &[min_lon, min_lat, max_lon, max_lat] = parts.as_slice() else {
            return Err(ValidationError::InvalidGeometry {
                reason: format!("bbox '{s}' must have exactly four values"),
            });
        };
        Self::new(min_lon, min_lat, max_lon, max_lat)
    }

    /// Returns true if `pos` lies inside or on the box.
    #[must_use]
    pub fn contains(&self, pos: Position) -> bool {
        (self.min_lon..=self.max_lon).contains(&pos.lon)
            && (self.min_lat..=self.max_lat).contains(&pos.lat)
    }

    /// Returns true if the two boxes overlap (edges count).
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.min_lon <= other.max_lon
            && other.min_lon <= self.max_lon
            && self.min_lat <= other.max_lat
            && other.min_lat <= self.max_lat
    }

    /// Smallest box covering both.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min_lon: self.min_lon.min(other.min_lon),
            min_lat: self.min_lat.min(other.min_lat),
            max_lon: self.max_lon.max(other.max_lon),
            max_lat: self.max_lat.max(other.max_lat),
        }
    }

    /// Midpoint of the box.
    #[must_use]
    pub fn center(&self) -> Position {
        Position {
            lon: (self.min_lon + self.max_lon) / 2.0,
            lat: (self.min_lat + self.max_lat) / 2.0,
        }
    }

    /// Splits the box into an `n` by `n` grid, west to east, then south to
    /// north within each column.
    #[must_use]
    pub fn grid(&self, n: usize) -> Vec<Self> {
        let n = n.max(1);
        #[allow(clippy::cast_precision_loss)]
        let steps = n as f64;
        let dlon = (self.max_lon - self.min_lon) / steps;
        let dlat = (self.max_lat - self.min_lat) / steps;

        let mut cells = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                #[allow(clippy::cast_precision_loss)]
                let (fi, fj) = (i as f64, j as f64);
                // Outer edges are copied so the cells cover the box exactly.
                let max_lon =
                    if i + 1 == n { self.max_lon } else { self.min_lon + (fi + 1.0) * dlon };
                let max_lat =
                    if j + 1 == n { self.max_lat } else { self.min_lat + (fj + 1.0) * dlat };
                cells.push(Self {
                    min_lon: self.min_lon + fi * dlon,
                    min_lat: self.min_lat + fj * dlat,
                    max_lon,
                    max_lat,
                });
            }
        }
        cells
    }

    /// The box as a closed, counter-clockwise polygon.
    #[must_use]
    pub fn to_polygon(&self) -> Geometry {
        let p = |lon, lat| Position { lon, lat };
        Geometry::Polygon {
            coordinates: vec![vec![
                p(self.min_lon, self.min_lat),
                p(self.max_lon, self.min_lat),
                p(self.max_lon, self.max_lat),
                p(self.min_lon, self.max_lat),
                p(self.min_lon, self.min_lat),
            ]],
        }
    }

    fn extend(&mut self, pos: Position) {
        self.min_lon = self.min_lon.min(pos.lon);
        self.min_lat = self.min_lat.min(pos.lat);
        self.max_lon = self.max_lon.max(pos.lon);
        self.max_lat = self.max_lat.max(pos.lat);
    }
}

/// GeoJSON geometry subset used by hazard parameters and impact zones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    /// A single position.
    Point {
        /// `[lon, lat]`.
        coordinates: Position,
    },
    /// Outer ring followed by optional holes.
    Polygon {
        /// Linear rings.
        coordinates: Vec<Vec<Position>>,
    },
    /// A set of polygons.
    MultiPolygon {
        /// Polygons, each a list of linear rings.
        coordinates: Vec<Vec<Vec<Position>>>,
    },
}

fn validate_ring(ring: &[Position]) -> Result<(), ValidationError> {
    if ring.len() < 4 {
        return Err(ValidationError::InvalidGeometry {
            reason: format!("linear ring has {} positions, need at least 4", ring.len()),
        });
    }
    for pos in ring {
        pos.validate()?;
    }
    if ring.first() != ring.last() {
        return Err(ValidationError::InvalidGeometry {
            reason: "linear ring is not closed".to_string(),
        });
    }
    Ok(())
}

fn validate_polygon(rings: &[Vec<Position>]) -> Result<(), ValidationError> {
    if rings.is_empty() {
        return Err(ValidationError::InvalidGeometry {
            reason: "polygon has no rings".to_string(),
        });
    }
    rings.iter().try_for_each(|r| validate_ring(r))
}

impl Geometry {
    /// Validates structure and EPSG:4326 bounds.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidGeometry` describing the first defect.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Point { coordinates } => coordinates.validate(),
            Self::Polygon { coordinates } => validate_polygon(coordinates),
            Self::MultiPolygon { coordinates } => {
                if coordinates.is_empty() {
                    return Err(ValidationError::InvalidGeometry {
                        reason: "multipolygon has no polygons".to_string(),
                    });
                }
                coordinates.iter().try_for_each(|p| validate_polygon(p))
            }
        }
    }

    fn outer_rings(&self) -> Vec<&[Position]> {
        match self {
            Self::Point { coordinates } => vec![std::slice::from_ref(coordinates)],
            Self::Polygon { coordinates } => {
                coordinates.first().map(Vec::as_slice).into_iter().collect()
            }
            Self::MultiPolygon { coordinates } => coordinates
                .iter()
                .filter_map(|p| p.first().map(Vec::as_slice))
                .collect(),
        }
    }

    /// Bounding box over all outer-ring vertices.
    #[must_use]
    pub fn bbox(&self) -> Option<BoundingBox> {
        let mut positions = self.outer_rings().into_iter().flatten().copied();
        let first = positions.next()?;
        let mut bbox = BoundingBox {
            min_lon: first.lon,
            min_lat: first.lat,
            max_lon: first.lon,
            max_lat: first.lat,
        };
        for pos in positions {
            bbox.extend(pos);
        }
        Some(bbox)
    }

    /// Vertex centroid of the outer rings (closing vertices excluded).
    ///
    /// Good enough to anchor zone rings on small administrative areas; it is
    /// not an area-weighted centroid.
    #[must_use]
    pub fn centroid(&self) -> Option<Position> {
        let mut sum_lon = 0.0;
        let mut sum_lat = 0.0;
        let mut n = 0usize;
        for ring in self.outer_rings() {
            let open = if ring.len() > 1 && ring.first() == ring.last() {
                &ring[..ring.len() - 1]
            } else {
                ring
            };
            for pos in open {
                sum_lon += pos.lon;
                sum_lat += pos.lat;
                n += 1;
            }
        }
        if n == 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let n = n as f64;
        Some(Position {
            lon: sum_lon / n,
            lat: sum_lat / n,
        })
    }

    /// Bounding-box intersection test against `bbox`.
    #[must_use]
    pub fn intersects_bbox(&self, bbox: &BoundingBox) -> bool {
        self.bbox().is_some_and(|own| own.intersects(bbox))
    }
}

/// Great-circle distance in kilometres (haversine).
#[must_use]
pub fn distance_km(a: Position, b: Position) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Projects a closed polygon ring of `radius_km` around `center`.
///
/// Uses a local equirectangular approximation, which keeps the error well
/// under a percent for the radii hazard zones use (< 100 km) away from the
/// poles. Vertices are clamped to EPSG:4326 bounds.
#[must_use]
pub fn ring_around(center: Position, radius_km: f64, segments: usize) -> Geometry {
    let segments = segments.max(3);
    let angular = (radius_km / EARTH_RADIUS_KM).to_degrees();
    let cos_lat = center.lat.to_radians().cos().max(1e-6);

    let mut ring = Vec::with_capacity(segments + 1);
    for i in 0..segments {
        #[allow(clippy::cast_precision_loss)]
        let theta = std::f64::consts::TAU * (i as f64) / (segments as f64);
        let lat = (center.lat + angular * theta.cos()).clamp(-90.0, 90.0);
        let lon = (center.lon + angular * theta.sin() / cos_lat).clamp(-180.0, 180.0);
        ring.push(Position { lon, lat });
    }
    ring.push(ring[0]);

    Geometry::Polygon {
        coordinates: vec![ring],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Geometry {
        let p = |lon, lat| Position { lon, lat };
        Geometry::Polygon {
            coordinates: vec![vec![
                p(75.0, 26.0),
                p(76.0, 26.0),
                p(76.0, 27.0),
                p(75.0, 27.0),
                p(75.0, 26.0),
            ]],
        }
    }

    #[test]
    fn position_serializes_as_array() {
        let pos = Position::new(75.79, 26.91).unwrap();
        let json = serde_json::to_value(pos).unwrap();
        assert_eq!(json, serde_json::json!([75.79, 26.91]));
    }

    #[test]
    fn position_rejects_out_of_range() {
        assert!(Position::new(181.0, 0.0).is_err());
        assert!(Position::new(0.0, -91.0).is_err());
        assert!(Position::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn geometry_serializes_as_geojson() {
        let json = serde_json::to_value(square()).unwrap();
        assert_eq!(json["type"], "Polygon");
        assert_eq!(json["coordinates"][0][0], serde_json::json!([75.0, 26.0]));

        let back: Geometry = serde_json::from_value(json).unwrap();
        assert_eq!(back, square());
    }

    #[test]
    fn polygon_validation_requires_closed_ring() {
        assert!(square().validate().is_ok());

        let p = |lon, lat| Position { lon, lat };
        let open = Geometry::Polygon {
            coordinates: vec![vec![p(0.0, 0.0), p(1.0, 0.0), p(1.0, 1.0), p(0.0, 1.0)]],
        };
        let err = open.validate().unwrap_err();
        assert!(err.to_string().contains("not closed"));
    }

    #[test]
    fn centroid_ignores_closing_vertex() {
        let c = square().centroid().unwrap();
        assert!((c.lon - 75.5).abs() < 1e-9);
        assert!((c.lat - 26.5).abs() < 1e-9);
    }

    #[test]
    fn bbox_parse_and_intersection() {
        let bbox = BoundingBox::parse("75.5, 26.5, 80, 30").unwrap();
        assert!(square().intersects_bbox(&bbox));

        let far = BoundingBox::parse("10,10,11,11").unwrap();
        assert!(!square().intersects_bbox(&far));

        assert!(BoundingBox::parse("1,2,3").is_err());
        assert!(BoundingBox::parse("a,b,c,d").is_err());
        assert!(BoundingBox::parse("5,5,1,1").is_err());
    }

    #[test]
    fn grid_tiles_the_box() {
        let bbox = BoundingBox::new(75.0, 26.0, 76.0, 27.0).unwrap();
        let cells = bbox.grid(4);
        assert_eq!(cells.len(), 16);
        assert_eq!(cells[0].min_lon, 75.0);
        assert_eq!(cells[15].max_lat, 27.0);
        assert!((cells[1].min_lat - 26.25).abs() < 1e-9);

        let merged = cells.iter().skip(1).fold(cells[0], |acc, c| acc.union(c));
        assert_eq!(merged, bbox);
        bbox.to_polygon().validate().unwrap();
        assert_eq!(bbox.grid(0).len(), 1);
    }

    #[test]
    fn distance_matches_known_offsets() {
        let a = Position::new(75.0, 26.0).unwrap();
        assert!(distance_km(a, a).abs() < 1e-9);

        // One degree of latitude is ~111.2 km.
        let north = Position::new(75.0, 27.0).unwrap();
        assert!((distance_km(a, north) - 111.19).abs() < 0.1);
        assert!((distance_km(a, north) - distance_km(north, a)).abs() < 1e-9);
    }

    #[test]
    fn ring_around_is_closed_and_sized() {
        let center = Position::new(75.79, 26.91).unwrap();
        let ring = ring_around(center, 5.0, DEFAULT_RING_SEGMENTS);
        ring.validate().unwrap();

        let Geometry::Polygon { coordinates } = &ring else {
            panic!("expected polygon");
        };
        assert_eq!(coordinates[0].len(), DEFAULT_RING_SEGMENTS + 1);

        // 5 km north of the center is ~0.045 degrees of latitude.
        let bbox = ring.bbox().unwrap();
        assert!((bbox.max_lat - center.lat - 0.045).abs() < 0.001);
        assert!(bbox.contains(center));
    }
}
