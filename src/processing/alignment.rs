//! Global alignment: the rigid transform taking map-local positions into the
//! local tangent frame of the geodetic reference.
//!
//! VIO and the tangent frame share the gravity direction, so only heading
//! (rotation about +Y) and translation are estimated:
//! ```text
//! global ≈ R_y(θ) * relative + t
//! ```
//! θ comes from a weighted 2-D Procrustes fit on the ground plane (x, z);
//! the vertical offset is the weighted mean height difference. Weights are
//! 1/σ² from the GPS accuracy. With enough observations a RANSAC pass over
//! pairs of observations rejects GPS outliers first.

use nalgebra::{UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::geometry::SE3;
use crate::mapping::GpsObservation;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Minimum number of observations for any estimate.
    pub min_observations: usize,
    /// Observation count from which outliers are rejected with RANSAC.
    pub min_observations_for_ransac: usize,
    pub ransac_iterations: usize,
    /// Horizontal residual (metres) below which an observation is an inlier.
    pub inlier_threshold_m: f64,
    /// Floor on the accuracy used for weighting (metres).
    pub min_accuracy_m: f64,
    /// RANSAC seed; fixed by default so processing is repeatable.
    pub seed: u64,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            min_observations: 2,
            min_observations_for_ransac: 6,
            ransac_iterations: 200,
            inlier_threshold_m: 8.0,
            min_accuracy_m: 0.5,
            seed: 0,
        }
    }
}

/// Estimated map-to-global transform with fit statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalAlignment {
    /// T_global_map (heading + translation).
    pub transform: SE3,
    /// Heading angle θ (radians).
    pub yaw: f64,
    /// Least-squares similarity scale on the ground plane. Not applied; a value
    /// far from 1 hints at VIO scale drift.
    pub scale_estimate: f64,
    /// Indices into the observation list used by the final fit.
    pub inliers: Vec<usize>,
    /// Weighted RMS horizontal residual of the inliers (metres).
    pub rms_error_m: f64,
}

impl GlobalAlignment {
    pub fn num_inliers(&self) -> usize {
        self.inliers.len()
    }
}

/// Estimate the map-to-global alignment from paired GPS observations.
///
/// Returns `None` with fewer than `min_observations` observations or when the
/// relative positions do not span the ground plane (no heading information).
pub fn estimate_alignment(
    observations: &[GpsObservation],
    config: &AlignmentConfig,
) -> Option<GlobalAlignment> {
    let n = observations.len();
    let min = config.min_observations.max(2);
    if n < min {
        debug!("[Alignment] {} observations, need {}", n, min);
        return None;
    }

    let all: Vec<usize> = (0..n).collect();
    let inliers = if n >= config.min_observations_for_ransac.max(3) {
        ransac_inliers(observations, config).unwrap_or(all)
    } else {
        all
    };
    if inliers.len() < min {
        return None;
    }

    let Some(fit) = fit_yaw_translation(observations, &inliers, config.min_accuracy_m) else {
        warn!("[Alignment] degenerate observation geometry");
        return None;
    };
    let rms_error_m = weighted_rms(observations, &inliers, &fit.transform, config.min_accuracy_m);
    debug!(
        "[Alignment] yaw {:.2}°, {} / {} inliers, rms {:.2} m, scale {:.3}",
        fit.yaw.to_degrees(),
        inliers.len(),
        n,
        rms_error_m,
        fit.scale
    );

    Some(GlobalAlignment {
        transform: fit.transform,
        yaw: fit.yaw,
        scale_estimate: fit.scale,
        inliers,
        rms_error_m,
    })
}

struct Fit {
    transform: SE3,
    yaw: f64,
    scale: f64,
}

fn weight(obs: &GpsObservation, min_accuracy: f64) -> f64 {
    let sigma = if obs.accuracy.is_finite() {
        obs.accuracy.max(min_accuracy)
    } else {
        f64::MAX.sqrt()
    };
    1.0 / (sigma * sigma)
}

/// Closed-form weighted fit over the observations in `indices`.
fn fit_yaw_translation(
    observations: &[GpsObservation],
    indices: &[usize],
    min_accuracy: f64,
) -> Option<Fit> {
    let mut w_sum = 0.0;
    let mut p_mean = Vector3::zeros();
    let mut q_mean = Vector3::zeros();
    for &i in indices {
        let w = weight(&observations[i], min_accuracy);
        w_sum += w;
        p_mean += observations[i].relative * w;
        q_mean += observations[i].global * w;
    }
    if w_sum <= 0.0 {
        return None;
    }
    p_mean /= w_sum;
    q_mean /= w_sum;

    // Σ w (p·q) and Σ w (p × q)_y on the ground plane.
    let (mut a, mut b, mut p_norm) = (0.0, 0.0, 0.0);
    for &i in indices {
        let w = weight(&observations[i], min_accuracy);
        let p = observations[i].relative - p_mean;
        let q = observations[i].global - q_mean;
        a += w * (p.x * q.x + p.z * q.z);
        b += w * (p.z * q.x - p.x * q.z);
        p_norm += w * (p.x * p.x + p.z * p.z);
    }
    let spread = p_norm / w_sum;
    if spread < 1e-6 || (a * a + b * b).sqrt() < 1e-12 {
        return None;
    }

    // R_y(θ) maps (x, z) to (x cosθ + z sinθ, -x sinθ + z cosθ).
    let yaw = b.atan2(a);
    let rotation = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), yaw);
    let translation = q_mean - rotation * p_mean;
    let scale = (a * yaw.cos() + b * yaw.sin()) / p_norm;

    Some(Fit {
        transform: SE3 {
            rotation,
            translation,
        },
        yaw,
        scale,
    })
}

fn horizontal_residual(obs: &GpsObservation, transform: &SE3) -> f64 {
    let d = transform.transform_point(&obs.relative) - obs.global;
    (d.x * d.x + d.z * d.z).sqrt()
}

fn weighted_rms(
    observations: &[GpsObservation],
    indices: &[usize],
    transform: &SE3,
    min_accuracy: f64,
) -> f64 {
    let (mut num, mut den) = (0.0, 0.0);
    for &i in indices {
        let w = weight(&observations[i], min_accuracy);
        num += w * horizontal_residual(&observations[i], transform).powi(2);
        den += w;
    }
    if den > 0.0 {
        (num / den).sqrt()
    } else {
        f64::INFINITY
    }
}

/// Largest consensus set from two-observation hypotheses. Ties go to the
/// lower total residual.
fn ransac_inliers(observations: &[GpsObservation], config: &AlignmentConfig) -> Option<Vec<usize>> {
    let n = observations.len();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best: Option<(Vec<usize>, f64)> = None;

    for _ in 0..config.ransac_iterations {
        let (i, j) = sample_two_indices(&mut rng, n);
        let Some(fit) = fit_yaw_translation(observations, &[i, j], config.min_accuracy_m) else {
            continue;
        };
        let (inliers, residual) = find_inliers(observations, &fit.transform, config.inlier_threshold_m);

        let better = match &best {
            None => true,
            Some((b, r)) => inliers.len() > b.len() || (inliers.len() == b.len() && residual < *r),
        };
        if better {
            best = Some((inliers, residual));
            if best.as_ref().is_some_and(|(b, _)| b.len() == n) {
                break;
            }
        }
    }

    let (inliers, _) = best?;
    if inliers.len() < n {
        debug!("[Alignment] rejected {} GPS outliers", n - inliers.len());
    }
    (inliers.len() >= 2).then_some(inliers)
}

fn find_inliers(observations: &[GpsObservation], transform: &SE3, threshold: f64) -> (Vec<usize>, f64) {
    let mut inliers = Vec::new();
    let mut total = 0.0;
    for (i, obs) in observations.iter().enumerate() {
        let r = horizontal_residual(obs, transform);
        if r <= threshold {
            inliers.push(i);
            total += r;
        }
    }
    (inliers, total)
}

/// Sample two distinct random indices.
fn sample_two_indices(rng: &mut impl Rng, n: usize) -> (usize, usize) {
    let i = rng.gen_range(0..n);
    loop {
        let j = rng.gen_range(0..n);
        if j != i {
            return (i, j);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn truth() -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.7),
            translation: Vector3::new(12.0, -1.5, -30.0),
        }
    }

    fn observations(count: usize) -> Vec<GpsObservation> {
        (0..count)
            .map(|i| {
                let t = i as f64;
                let relative = Vector3::new(t * 1.5, 0.1 * t, -(t * t) * 0.2);
                GpsObservation {
                    relative,
                    global: truth().transform_point(&relative),
                    accuracy: 3.0,
                    timestamp_ns: i as u64 * 1_000_000_000,
                }
            })
            .collect()
    }

    #[test]
    fn test_recovers_yaw_and_translation() {
        let obs = observations(4);
        let alignment = estimate_alignment(&obs, &AlignmentConfig::default()).unwrap();

        assert_relative_eq!(alignment.yaw, 0.7, epsilon = 1e-9);
        assert_relative_eq!(alignment.transform.translation, truth().translation, epsilon = 1e-9);
        assert_relative_eq!(alignment.scale_estimate, 1.0, epsilon = 1e-9);
        assert_eq!(alignment.num_inliers(), 4);
        assert!(alignment.rms_error_m < 1e-9);
    }

    #[test]
    fn test_two_observations_suffice() {
        let obs = observations(2);
        let alignment = estimate_alignment(&obs, &AlignmentConfig::default()).unwrap();
        assert_relative_eq!(alignment.yaw, 0.7, epsilon = 1e-9);
    }

    #[test]
    fn test_too_few_or_degenerate() {
        assert!(estimate_alignment(&observations(1), &AlignmentConfig::default()).is_none());

        // Every fix taken at the same spot: heading is unobservable.
        let mut obs = observations(3);
        for o in &mut obs {
            o.relative = Vector3::new(1.0, 0.0, 1.0);
        }
        assert!(estimate_alignment(&obs, &AlignmentConfig::default()).is_none());
    }

    #[test]
    fn test_ransac_rejects_outlier() {
        let mut obs = observations(10);
        obs[4].global.x += 60.0;

        let alignment = estimate_alignment(&obs, &AlignmentConfig::default()).unwrap();

        assert_eq!(alignment.num_inliers(), 9);
        assert!(!alignment.inliers.contains(&4));
        assert_relative_eq!(alignment.yaw, 0.7, epsilon = 1e-9);
    }

    #[test]
    fn test_scale_estimate_reports_drift() {
        let mut obs = observations(5);
        for o in &mut obs {
            o.relative *= 0.5;
        }
        let alignment = estimate_alignment(&obs, &AlignmentConfig::default()).unwrap();
        assert_relative_eq!(alignment.scale_estimate, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_accurate_fixes_dominate() {
        let mut obs = observations(4);
        // A bad but low-weight fix without RANSAC.
        obs[1].global.z += 5.0;
        obs[1].accuracy = 500.0;
        let alignment = estimate_alignment(&obs, &AlignmentConfig::default()).unwrap();
        assert!((alignment.yaw - 0.7).abs() < 1e-2);
    }
}
