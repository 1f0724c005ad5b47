//! Camera and world frame conventions.
//!
//! # Frame Conventions
//!
//! ## AR camera frame (ARKit / ARCore convention)
//! ```text
//!        +Y (up)
//!         |
//!         |
//!         +------ +X (right)
//!        /
//!       /
//!      +Z (backward, out of the screen)
//! ```
//! Frame extrinsics, VIO poses, anchor transforms and localization results
//! all use this convention. The camera looks along its local -Z axis.
//!
//! ## Vision camera frame (RDF, OpenCV convention)
//! ```text
//!         +------ +X (right)
//!        /|
//!       / |
//!     +Z  +Y (down)
//!  (forward)
//! ```
//! Pinhole projection and PnP are solved in this frame.
//!
//! ## World / map frame
//! Gravity-aligned, +Y up. VIO worlds and maps built from them share the
//! up axis, so the transform between the two is a rotation about Y plus a
//! translation.
//!
//! ## Global frame
//! Local tangent plane (see [`super::geodetic`]): X east, Y up, Z south.
//!
//! # Naming
//! `T_target_source` maps points from `source` to `target`:
//! ```text
//! p_world = T_world_cam * p_cam
//! ```

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

use super::SE3;

/// World up axis shared by the VIO, map and global frames.
pub const WORLD_UP: Vector3<f64> = Vector3::new(0.0, 1.0, 0.0);

/// Rotation mapping vision (RDF) camera axes to AR camera axes.
///
/// Self-inverse: `diag(1, -1, -1)`.
#[rustfmt::skip]
pub fn rotation_ar_cv() -> Matrix3<f64> {
    Matrix3::new(
        1.0,  0.0,  0.0,
        0.0, -1.0,  0.0,
        0.0,  0.0, -1.0,
    )
}

fn flip() -> SE3 {
    SE3::from_rt(rotation_ar_cv(), Vector3::zeros())
}

/// Convert an AR-convention camera pose (T_world_ar) into a vision-convention
/// pose (T_world_cv) of the same physical camera.
pub fn ar_pose_to_cv(t_world_ar: &SE3) -> SE3 {
    t_world_ar.compose(&flip())
}

/// Convert a vision-convention camera pose back to the AR convention.
pub fn cv_pose_to_ar(t_world_cv: &SE3) -> SE3 {
    t_world_cv.compose(&flip())
}

/// World up expressed in the camera frame of `t_world_cam`.
pub fn up_in_camera(t_world_cam: &SE3) -> Vector3<f64> {
    t_world_cam.rotation.inverse() * WORLD_UP
}

/// Angle (degrees) between the up-vectors seen by two camera poses of the
/// same convention. Independent of heading and translation.
pub fn gravity_angle_deg(t_a: &SE3, t_b: &SE3) -> f64 {
    let up_a = up_in_camera(t_a);
    let up_b = up_in_camera(t_b);
    let cos = up_a.dot(&up_b).clamp(-1.0, 1.0);
    cos.acos().to_degrees()
}

/// Project a rotation onto its component about the world up axis.
///
/// Used wherever two gravity-aligned frames are related: any tilt component
/// is noise.
pub fn yaw_only(rotation: &UnitQuaternion<f64>) -> UnitQuaternion<f64> {
    let forward = rotation * Vector3::z();
    let yaw = forward.x.atan2(forward.z);
    UnitQuaternion::from_axis_angle(&Vector3::y_axis(), yaw)
}

/// Heading (radians) of a rotation about the world up axis.
pub fn yaw_of(rotation: &UnitQuaternion<f64>) -> f64 {
    let forward = rotation * Vector3::z();
    forward.x.atan2(forward.z)
}
