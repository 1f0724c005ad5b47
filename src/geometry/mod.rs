//! Geometry utilities: SE3 transforms, camera model, frame conventions,
//! geodetic conversion and PnP solving.

pub mod camera;
pub mod frames;
pub mod geodetic;
pub mod pnp;
pub mod se3;
pub mod so3;

pub use camera::CameraModel;
pub use geodetic::{GeoCoordinate, GeoReference};
pub use pnp::{solve_pnp_ransac, PnPResult, PnpConfig};
pub use se3::SE3;
