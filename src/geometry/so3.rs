//! Rotation-vector helpers shared by the pose solver and the tracker filter.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Hat operator: `hat(v) * u == v × u`.
#[inline]
#[rustfmt::skip]
pub fn hat(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
         0.0, -v.z,  v.y,
         v.z,  0.0, -v.x,
        -v.y,  v.x,  0.0,
    )
}

/// Rotation for a rotation vector (axis × angle).
#[inline]
pub fn exp(omega: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*omega)
}

/// Rotation vector of `q`, angle in [0, π].
#[inline]
pub fn log(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    q.scaled_axis()
}

/// Rotation vector taking `from` to `to` on the left: `to = exp(δ) * from`.
pub fn left_difference(to: &UnitQuaternion<f64>, from: &UnitQuaternion<f64>) -> Vector3<f64> {
    log(&(to * from.inverse()))
}
