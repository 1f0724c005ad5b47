//! WGS84 geodetic coordinates and the local tangent ("global") frame.
//!
//! GPS fixes are converted to Earth-centred Earth-fixed (ECEF) coordinates and
//! then expressed in a local tangent plane around a [`GeoReference`]:
//! - X: east
//! - Y: up
//! - Z: south
//!
//! This matches the gravity-aligned, +Y-up convention of the map frame so a
//! map origin only needs a heading and a translation.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// WGS84 semi-major axis (m).
const WGS84_A: f64 = 6_378_137.0;
/// WGS84 flattening.
const WGS84_F: f64 = 1.0 / 298.257_223_563;

/// A latitude/longitude/altitude triple (degrees, degrees, metres).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoCoordinate {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

impl GeoCoordinate {
    pub fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
        }
    }

    /// ECEF position of this coordinate.
    pub fn to_ecef(&self) -> Vector3<f64> {
        let e2 = WGS84_F * (2.0 - WGS84_F);
        let lat = self.latitude.to_radians();
        let lon = self.longitude.to_radians();
        let (sin_lat, cos_lat) = lat.sin_cos();
        let (sin_lon, cos_lon) = lon.sin_cos();
        let n = WGS84_A / (1.0 - e2 * sin_lat * sin_lat).sqrt();

        Vector3::new(
            (n + self.altitude) * cos_lat * cos_lon,
            (n + self.altitude) * cos_lat * sin_lon,
            (n * (1.0 - e2) + self.altitude) * sin_lat,
        )
    }

    /// Geodetic coordinate of an ECEF position (Bowring's iteration).
    pub fn from_ecef(ecef: &Vector3<f64>) -> Self {
        let e2 = WGS84_F * (2.0 - WGS84_F);
        let lon = ecef.y.atan2(ecef.x);
        let p = (ecef.x * ecef.x + ecef.y * ecef.y).sqrt();

        let mut lat = ecef.z.atan2(p * (1.0 - e2));
        let mut alt = 0.0;
        for _ in 0..6 {
            let (sin_lat, cos_lat) = lat.sin_cos();
            let n = WGS84_A / (1.0 - e2 * sin_lat * sin_lat).sqrt();
            alt = if cos_lat.abs() > 1e-9 {
                p / cos_lat - n
            } else {
                // On the polar axis.
                ecef.z.abs() - WGS84_A * (1.0 - WGS84_F)
            };
            lat = ecef.z.atan2(p * (1.0 - e2 * n / (n + alt)));
        }

        Self {
            latitude: lat.to_degrees(),
            longitude: lon.to_degrees(),
            altitude: alt,
        }
    }
}

/// Anchor point of the local tangent frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoReference {
    pub coordinate: GeoCoordinate,
}

impl GeoReference {
    pub fn new(coordinate: GeoCoordinate) -> Self {
        Self { coordinate }
    }

    /// Rotation taking ECEF offsets into the local (east, up, south) frame.
    fn rotation_local_ecef(&self) -> Matrix3<f64> {
        let lat = self.coordinate.latitude.to_radians();
        let lon = self.coordinate.longitude.to_radians();
        let (sin_lat, cos_lat) = lat.sin_cos();
        let (sin_lon, cos_lon) = lon.sin_cos();

        let east = Vector3::new(-sin_lon, cos_lon, 0.0);
        let north = Vector3::new(-sin_lat * cos_lon, -sin_lat * sin_lon, cos_lat);
        let up = Vector3::new(cos_lat * cos_lon, cos_lat * sin_lon, sin_lat);

        Matrix3::from_rows(&[east.transpose(), up.transpose(), (-north).transpose()])
    }

    /// Local tangent-frame position of a geodetic coordinate.
    pub fn to_local(&self, coordinate: &GeoCoordinate) -> Vector3<f64> {
        let delta = coordinate.to_ecef() - self.coordinate.to_ecef();
        self.rotation_local_ecef() * delta
    }

    /// Geodetic coordinate of a local tangent-frame position.
    pub fn to_geodetic(&self, local: &Vector3<f64>) -> GeoCoordinate {
        let ecef = self.coordinate.to_ecef() + self.rotation_local_ecef().transpose() * local;
        GeoCoordinate::from_ecef(&ecef)
    }
}
