//! # Reference Ellipsoid
//!
//! WGS84 geodesy needed by the frame resolver: surface normals, the local
//! East-North-Up frame, and cartographic conversions.

use crate::math::{Cartesian3, Matrix3, Quaternion};
use serde::{Deserialize, Serialize};

/// Geodetic coordinates in radians and meters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cartographic {
    /// Longitude in radians.
    pub longitude: f64,
    /// Latitude in radians.
    pub latitude: f64,
    /// Height above the ellipsoid in meters.
    pub height: f64,
}

impl Cartographic {
    /// Creates cartographic coordinates from degrees.
    #[must_use]
    pub fn from_degrees(longitude: f64, latitude: f64, height: f64) -> Self {
        Self {
            longitude: longitude.to_radians(),
            latitude: latitude.to_radians(),
            height,
        }
    }

    /// `[longitude, latitude, height]` with angles in degrees.
    #[must_use]
    pub fn to_degrees_array(self) -> [f64; 3] {
        [self.longitude.to_degrees(), self.latitude.to_degrees(), self.height]
    }
}

/// An oblate ellipsoid of revolution.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ellipsoid {
    equatorial_radius: f64,
    polar_radius: f64,
}

/// Newton iterations for latitude recovery; converges to sub-millimeter.
const LATITUDE_ITERATIONS: usize = 8;

impl Ellipsoid {
    /// The WGS84 ellipsoid.
    pub const WGS84: Self = Self {
        equatorial_radius: 6_378_137.0,
        polar_radius: 6_356_752.314_245_179,
    };

    /// Equatorial radius in meters.
    #[must_use]
    pub const fn equatorial_radius(&self) -> f64 {
        self.equatorial_radius
    }

    fn eccentricity_squared(&self) -> f64 {
        let a2 = self.equatorial_radius * self.equatorial_radius;
        let b2 = self.polar_radius * self.polar_radius;
        1.0 - b2 / a2
    }

    /// Unit normal of the ellipsoid surface through `position`.
    #[must_use]
    pub fn geodetic_surface_normal(&self, position: Cartesian3) -> Option<Cartesian3> {
        let a2 = self.equatorial_radius * self.equatorial_radius;
        let b2 = self.polar_radius * self.polar_radius;
        Cartesian3::new(position.x / a2, position.y / a2, position.z / b2).normalize()
    }

    /// Rotation from local East-North-Up axes at `position` into the fixed frame.
    ///
    /// Returns `None` at the center of the ellipsoid, where no local frame exists.
    #[must_use]
    pub fn east_north_up_matrix(&self, position: Cartesian3) -> Option<Matrix3> {
        let up = self.geodetic_surface_normal(position)?;
        let east = Cartesian3::new(-position.y, position.x, 0.0)
            .normalize()
            // On the polar axis east is undefined; pick +Y so north stays well formed.
            .unwrap_or(Cartesian3::UNIT_Y);
        let north = up.cross(east);
        Some(Matrix3::from_columns(east, north, up))
    }

    /// Orientation with heading, pitch and roll all zero at `position`:
    /// local up aligned with the ellipsoid normal.
    #[must_use]
    pub fn east_north_up_quaternion(&self, position: Cartesian3) -> Option<Quaternion> {
        self.east_north_up_matrix(position)
            .map(|m| Quaternion::from_rotation_matrix(&m))
    }

    /// Converts geodetic coordinates to earth-fixed Cartesian coordinates.
    #[must_use]
    pub fn cartographic_to_cartesian(&self, c: Cartographic) -> Cartesian3 {
        let e2 = self.eccentricity_squared();
        let (sin_lat, cos_lat) = c.latitude.sin_cos();
        let (sin_lon, cos_lon) = c.longitude.sin_cos();
        let n = self.equatorial_radius / (1.0 - e2 * sin_lat * sin_lat).sqrt();
        Cartesian3::new(
            (n + c.height) * cos_lat * cos_lon,
            (n + c.height) * cos_lat * sin_lon,
            (n * (1.0 - e2) + c.height) * sin_lat,
        )
    }

    /// Converts earth-fixed Cartesian coordinates to geodetic coordinates.
    ///
    /// Returns `None` for the zero vector.
    #[must_use]
    pub fn cartesian_to_cartographic(&self, position: Cartesian3) -> Option<Cartographic> {
        if position.is_exact_zero() {
            return None;
        }
        let e2 = self.eccentricity_squared();
        let a = self.equatorial_radius;
        let longitude = position.y.atan2(position.x);
        let p = (position.x * position.x + position.y * position.y).sqrt();

        if p <= f64::EPSILON {
            let latitude = std::f64::consts::FRAC_PI_2.copysign(position.z);
            return Some(Cartographic {
                longitude,
                latitude,
                height: position.z.abs() - self.polar_radius,
            });
        }

        let mut latitude = position.z.atan2(p * (1.0 - e2));
        let mut height = 0.0;
        for _ in 0..LATITUDE_ITERATIONS {
            let sin_lat = latitude.sin();
            let n = a / (1.0 - e2 * sin_lat * sin_lat).sqrt();
            height = p / latitude.cos() - n;
            latitude = position.z.atan2(p * (1.0 - e2 * n / (n + height)));
        }

        Some(Cartographic {
            longitude,
            latitude,
            height,
        })
    }
}
