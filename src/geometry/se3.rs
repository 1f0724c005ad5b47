//! SE3: rigid-body transformation (rotation + translation).
//!
//! Every pose, anchor transform and map origin in the crate is an `SE3`.
//! Poses follow the `T_target_source` naming used throughout the crate:
//! `p_target = T_target_source * p_source`.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3};

/// 6-DOF rigid transformation.
///
/// Transforms points as: p' = R * p + t
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transformation.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Construct from rotation matrix and translation.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot3 = Rotation3::from_matrix(&rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
        }
    }

    /// Pure translation.
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation,
        }
    }

    /// Construct from homogeneous 4x4 matrix `[R | t; 0 | 1]`.
    ///
    /// The rotation block is re-orthonormalized, so matrices that went through
    /// single precision (ARKit `simd_float4x4`) are accepted.
    pub fn from_matrix(mat: Matrix4<f64>) -> Self {
        let rotation = mat.fixed_view::<3, 3>(0, 0).into_owned();
        let translation = Vector3::new(mat[(0, 3)], mat[(1, 3)], mat[(2, 3)]);
        Self::from_rt(rotation, translation)
    }

    /// Convert to homogeneous 4x4 matrix.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut mat = Matrix4::identity();
        mat.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(self.rotation.to_rotation_matrix().matrix());
        mat[(0, 3)] = self.translation.x;
        mat[(1, 3)] = self.translation.y;
        mat[(2, 3)] = self.translation.z;
        mat
    }

    /// Inverse transformation.
    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    /// Composition `self * other` (apply `other` first).
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Transform a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Transform a direction (rotation only).
    pub fn transform_vector(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * v
    }

    /// Same rotation, translation multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            rotation: self.rotation,
            translation: self.translation * factor,
        }
    }

    /// Geodesic blend towards `other`: slerp on rotation, lerp on translation.
    pub fn interpolate(&self, other: &SE3, t: f64) -> Self {
        Self {
            rotation: self
                .rotation
                .try_slerp(&other.rotation, t, 1e-9)
                .unwrap_or(if t < 0.5 { self.rotation } else { other.rotation }),
            translation: self.translation.lerp(&other.translation, t),
        }
    }

    /// Rotation angle (radians) and translation distance to another pose.
    pub fn distance_to(&self, other: &SE3) -> (f64, f64) {
        let delta = self.inverse().compose(other);
        (delta.rotation.angle(), delta.translation.norm())
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Mul for SE3 {
    type Output = SE3;

    fn mul(self, rhs: SE3) -> SE3 {
        self.compose(&rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.1, -0.4, 0.7),
            translation: Vector3::new(1.0, -2.0, 0.5),
        }
    }

    #[test]
    fn test_inverse_composes_to_identity() {
        let pose = sample_pose();
        let ident = pose.compose(&pose.inverse());

        assert_relative_eq!(ident.translation, Vector3::zeros(), epsilon = 1e-12);
        assert!(ident.rotation.angle() < 1e-12);
    }

    #[test]
    fn test_matrix_round_trip() {
        let pose = sample_pose();
        let back = SE3::from_matrix(pose.to_matrix());

        assert_relative_eq!(back.translation, pose.translation, epsilon = 1e-12);
        assert!(back.rotation.angle_to(&pose.rotation) < 1e-9);
    }

    #[test]
    fn test_interpolate_endpoints() {
        let a = sample_pose();
        let b = SE3::identity();

        assert_relative_eq!(a.interpolate(&b, 0.0).translation, a.translation, epsilon = 1e-12);
        assert!(a.interpolate(&b, 1.0).rotation.angle() < 1e-9);
        assert_relative_eq!(
            a.interpolate(&b, 0.5).translation,
            a.translation * 0.5,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_compose_matches_matrix_product() {
        let a = sample_pose();
        let b = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.3, 0.0, -0.2),
            translation: Vector3::new(0.0, 4.0, -1.0),
        };
        let p = Vector3::new(0.3, 0.2, 0.1);

        let via_compose = a.compose(&b).transform_point(&p);
        let via_matrix = (a.to_matrix() * b.to_matrix()) * p.push(1.0);

        assert_relative_eq!(via_compose, via_matrix.xyz(), epsilon = 1e-12);
    }
}
