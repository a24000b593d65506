//! Geographic primitives: coordinates, bounding boxes and distances.
//!
//! All angles are WGS84 degrees. Distances are great-circle meters computed
//! with the haversine formula from the `geo` crate.

use crate::{error::Result, Error};
use geo::{Distance, Haversine, Point};
use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters, matching the radius `geo` uses for haversine.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// A latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    /// Create a coordinate, rejecting values outside the valid ranges.
    pub fn new(lat: f64, lon: f64) -> Result<Self> {
        let coordinate = Self { lat, lon };
        coordinate.validate()?;
        Ok(coordinate)
    }

    /// Check that both components are finite and in range.
    pub fn validate(&self) -> Result<()> {
        let lat_ok = self.lat.is_finite() && (-90.0..=90.0).contains(&self.lat);
        let lon_ok = self.lon.is_finite() && (-180.0..=180.0).contains(&self.lon);
        if lat_ok && lon_ok {
            Ok(())
        } else {
            Err(Error::InvalidCoordinate {
                lat: self.lat,
                lon: self.lon,
            })
        }
    }

    /// Great-circle distance to another coordinate in meters.
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        Haversine.distance(self.to_point(), other.to_point())
    }

    /// `geo` point with x = longitude, y = latitude.
    pub fn to_point(self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }
}

/// An inclusive latitude/longitude rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl BoundingBox {
    /// Create a box from its edges. South must not exceed north, west must
    /// not exceed east.
    pub fn new(south: f64, west: f64, north: f64, east: f64) -> Result<Self> {
        Coordinate { lat: south, lon: west }.validate()?;
        Coordinate { lat: north, lon: east }.validate()?;
        if south > north || west > east {
            return Err(Error::InvalidRecord(format!(
                "bounding box edges out of order: south {south}, west {west}, north {north}, east {east}"
            )));
        }
        Ok(Self {
            south,
            west,
            north,
            east,
        })
    }

    /// Smallest box enclosing the circle of `radius_m` meters around `center`.
    ///
    /// Clamped at the poles and at the antimeridian; a circle reaching a pole
    /// spans every longitude. A circle crossing the antimeridian loses its far
    /// side here, so radius queries go through [`BoundingBox::regions_around`].
    pub fn around(center: Coordinate, radius_m: f64) -> Result<Self> {
        let (south, west, north, east) = Self::circle_extent(center, radius_m)?;
        Ok(Self {
            south,
            west: west.max(-180.0),
            north,
            east: east.min(180.0),
        })
    }

    /// Boxes that together enclose the circle of `radius_m` meters around
    /// `center`.
    ///
    /// One box, or two when the circle crosses the antimeridian: the part up
    /// to 180° and the part wrapped around from -180°.
    pub fn regions_around(center: Coordinate, radius_m: f64) -> Result<Vec<Self>> {
        let (south, west, north, east) = Self::circle_extent(center, radius_m)?;
        let part = |west: f64, east: f64| Self {
            south,
            west,
            north,
            east,
        };
        let regions = if west < -180.0 {
            vec![part(-180.0, east), part(west + 360.0, 180.0)]
        } else if east > 180.0 {
            vec![part(west, 180.0), part(-180.0, east - 360.0)]
        } else {
            vec![part(west, east)]
        };
        Ok(regions)
    }

    /// Latitude-clamped extent of a circle. Longitudes are left unwrapped and
    /// may fall outside [-180, 180].
    fn circle_extent(center: Coordinate, radius_m: f64) -> Result<(f64, f64, f64, f64)> {
        center.validate()?;
        if !radius_m.is_finite() || radius_m < 0.0 {
            return Err(Error::InvalidRadius(radius_m));
        }

        // Angular radius, padded so points exactly on the circle stay inside
        // despite rounding.
        let angle = radius_m / EARTH_RADIUS_M * (1.0 + 1e-9);
        let dlat = angle.to_degrees();
        let south = (center.lat - dlat).max(-90.0);
        let north = (center.lat + dlat).min(90.0);

        let cos_lat = center.lat.to_radians().cos();
        if south <= -90.0 || north >= 90.0 || angle.sin() >= cos_lat {
            return Ok((south, -180.0, north, 180.0));
        }
        // Widest longitude reached by the spherical cap.
        let dlon = (angle.sin() / cos_lat).asin().to_degrees();
        Ok((south, center.lon - dlon, north, center.lon + dlon))
    }

    /// Whether the coordinate lies inside the box (edges included).
    pub fn contains(&self, coordinate: &Coordinate) -> bool {
        coordinate.lat >= self.south
            && coordinate.lat <= self.north
            && coordinate.lon >= self.west
            && coordinate.lon <= self.east
    }

    /// Whether `other` lies entirely inside this box.
    pub fn covers(&self, other: &BoundingBox) -> bool {
        other.south >= self.south
            && other.north <= self.north
            && other.west >= self.west
            && other.east <= self.east
    }

    /// Lower-left and upper-right corners as `[lon, lat]` pairs.
    pub fn corners(&self) -> ([f64; 2], [f64; 2]) {
        ([self.west, self.south], [self.east, self.north])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(Coordinate::new(45.46, 9.19).is_ok());
        assert!(Coordinate::new(90.0, 180.0).is_ok());
        assert!(Coordinate::new(90.1, 0.0).is_err());
        assert!(Coordinate::new(0.0, -180.5).is_err());
        assert!(Coordinate::new(f64::NAN, 0.0).is_err());
        assert!(Coordinate::new(0.0, f64::INFINITY).is_err());
    }

    #[test]
    fn distance_between_milan_landmarks() {
        let duomo = Coordinate::new(45.4642, 9.1900).unwrap();
        let castello = Coordinate::new(45.4705, 9.1795).unwrap();
        let d = duomo.distance_to(&castello);
        assert!((1000.0..1200.0).contains(&d), "distance was {d}");
        assert_eq!(duomo.distance_to(&duomo), 0.0);
    }

    #[test]
    fn box_around_contains_circle() {
        let center = Coordinate::new(45.46, 9.19).unwrap();
        let bbox = BoundingBox::around(center, 1000.0).unwrap();
        assert!(bbox.contains(&center));

        // A point 999 m due north is inside, 1.1 km is not.
        let dlat_inside = (999.0 / EARTH_RADIUS_M).to_degrees();
        let dlat_outside = (1100.0 / EARTH_RADIUS_M).to_degrees();
        assert!(bbox.contains(&Coordinate::new(45.46 + dlat_inside, 9.19).unwrap()));
        assert!(!bbox.contains(&Coordinate::new(45.46 + dlat_outside, 9.19).unwrap()));
    }

    #[test]
    fn box_around_pole_spans_all_longitudes() {
        let center = Coordinate::new(89.999, 10.0).unwrap();
        let bbox = BoundingBox::around(center, 5_000.0).unwrap();
        assert_eq!(bbox.north, 90.0);
        assert_eq!((bbox.west, bbox.east), (-180.0, 180.0));
    }

    #[test]
    fn regions_around_split_at_the_antimeridian() {
        let east = Coordinate::new(0.0, 179.999).unwrap();
        let regions = BoundingBox::regions_around(east, 10_000.0).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].east, 180.0);
        assert!(regions[0].west < 179.999);
        assert_eq!(regions[1].west, -180.0);
        assert!(regions[1].east > -180.0 && regions[1].east < -179.9);
        assert!(regions[1].contains(&Coordinate::new(0.0, -179.999).unwrap()));

        let west = Coordinate::new(0.0, -179.999).unwrap();
        let regions = BoundingBox::regions_around(west, 10_000.0).unwrap();
        assert_eq!(regions.len(), 2);
        assert!(regions.iter().any(|r| r.contains(&east)));

        let milan = Coordinate::new(45.46, 9.19).unwrap();
        assert_eq!(
            BoundingBox::regions_around(milan, 1_000.0).unwrap(),
            vec![BoundingBox::around(milan, 1_000.0).unwrap()]
        );
    }

    #[test]
    fn box_around_rejects_negative_radius() {
        let center = Coordinate::new(0.0, 0.0).unwrap();
        assert_eq!(
            BoundingBox::around(center, -1.0),
            Err(Error::InvalidRadius(-1.0))
        );
    }

    #[test]
    fn contains_is_inclusive() {
        let bbox = BoundingBox::new(45.0, 9.0, 46.0, 10.0).unwrap();
        assert!(bbox.contains(&Coordinate { lat: 45.0, lon: 9.0 }));
        assert!(bbox.contains(&Coordinate { lat: 46.0, lon: 10.0 }));
        assert!(!bbox.contains(&Coordinate {
            lat: 46.000001,
            lon: 10.0
        }));
    }

    #[test]
    fn covers_nested_boxes() {
        let outer = BoundingBox::new(45.0, 9.0, 46.0, 10.0).unwrap();
        let inner = BoundingBox::new(45.2, 9.2, 45.8, 9.8).unwrap();
        assert!(outer.covers(&inner));
        assert!(!inner.covers(&outer));
        assert!(BoundingBox::new(46.0, 9.0, 45.0, 10.0).is_err());
    }
}
