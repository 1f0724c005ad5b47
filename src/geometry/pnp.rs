//! PnP (Perspective-n-Point) solver.
//!
//! Camera pose from 3D-2D correspondences:
//! - Linear DLT on normalized image coordinates, wrapped in RANSAC
//! - Gauss-Newton refinement of the consensus pose (Huber-weighted)
//! - Prior-seeded refinement when too few correspondences exist for the DLT
//!
//! Poses are in the vision (RDF) camera convention, see [`super::frames`].

use nalgebra::{DMatrix, Matrix2x3, Matrix2x6, Matrix3x4, Matrix6, Vector2, Vector3, Vector6};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use super::camera::CameraModel;
use super::so3::hat;
use super::SE3;

/// Minimum number of correspondences for the linear solver.
pub const MIN_DLT_POINTS: usize = 6;

/// Minimum number of correspondences for iterative refinement (6 DOF).
const MIN_REFINE_POINTS: usize = 3;

/// Configuration for robust PnP.
#[derive(Debug, Clone)]
pub struct PnpConfig {
    /// Maximum number of RANSAC iterations.
    pub max_iterations: usize,
    /// Inlier threshold on reprojection error (pixels).
    pub reprojection_threshold_px: f64,
    /// Probability of drawing at least one all-inlier sample.
    pub confidence: f64,
    /// Gauss-Newton iterations used for refinement.
    pub refine_iterations: usize,
    /// Huber threshold (pixels) during refinement.
    pub huber_threshold_px: f64,
    /// Fixed RNG seed, for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for PnpConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            reprojection_threshold_px: 8.0,
            confidence: 0.99,
            refine_iterations: 10,
            huber_threshold_px: 4.0,
            seed: None,
        }
    }
}

/// Result of PnP solving.
#[derive(Debug, Clone)]
pub struct PnPResult {
    /// Estimated camera pose (T_world_cam, vision convention).
    pub pose: SE3,
    /// Inlier mask per correspondence.
    pub inlier_mask: Vec<bool>,
    /// Reprojection error per correspondence (in pixels).
    pub reproj_errors: Vec<f64>,
}

impl PnPResult {
    pub fn num_inliers(&self) -> usize {
        self.inlier_mask.iter().filter(|&&m| m).count()
    }

    pub fn inlier_indices(&self) -> Vec<usize> {
        self.inlier_mask
            .iter()
            .enumerate()
            .filter_map(|(i, &m)| m.then_some(i))
            .collect()
    }

    fn mean_inlier_error(&self) -> f64 {
        let (sum, n) = self
            .inlier_mask
            .iter()
            .zip(&self.reproj_errors)
            .filter(|(m, _)| **m)
            .fold((0.0, 0usize), |(s, n), (_, e)| (s + e, n + 1));
        if n == 0 {
            f64::INFINITY
        } else {
            sum / n as f64
        }
    }
}

/// Solve PnP robustly given 3D-2D correspondences.
///
/// # Arguments
/// * `points3d` - 3D world points
/// * `points2d` - Corresponding pixel coordinates
/// * `camera` - Camera intrinsics
/// * `prior` - Optional pose guess (T_world_cam); seeds refinement and is the
///   only path available with fewer than [`MIN_DLT_POINTS`] correspondences
///
/// Returns `None` when no pose hypothesis could be formed.
pub fn solve_pnp_ransac(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    camera: &CameraModel,
    prior: Option<&SE3>,
    config: &PnpConfig,
) -> Option<PnPResult> {
    let n = points3d.len();
    if n == 0 || n != points2d.len() {
        return None;
    }

    let ransac = if n >= MIN_DLT_POINTS {
        ransac_dlt(points3d, points2d, camera, config)
    } else {
        None
    };

    let seeded = prior.map(|t_wc| {
        let t_cw = refine_pose(t_wc.inverse(), points3d, points2d, None, camera, config);
        evaluate(&t_cw, points3d, points2d, camera, config.reprojection_threshold_px)
    });

    let best = match (ransac, seeded) {
        (Some(a), Some(b)) => {
            let (na, nb) = (a.num_inliers(), b.num_inliers());
            if na > nb || (na == nb && a.mean_inlier_error() <= b.mean_inlier_error()) {
                Some(a)
            } else {
                Some(b)
            }
        }
        (a, b) => a.or(b),
    }?;

    debug!(
        "[PnP] {} correspondences, {} inliers",
        n,
        best.num_inliers()
    );

    // Stored pose is world-to-camera during solving.
    Some(PnPResult {
        pose: best.pose.inverse(),
        ..best
    })
}

/// RANSAC over minimal DLT samples, refined on the consensus set.
///
/// Returned pose is T_cam_world.
fn ransac_dlt(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    camera: &CameraModel,
    config: &PnpConfig,
) -> Option<PnPResult> {
    let n = points3d.len();
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut best: Option<PnPResult> = None;
    let mut best_inliers = 0;
    let mut max_iter = config.max_iterations;
    let mut iteration = 0;

    while iteration < max_iter {
        iteration += 1;
        let sample = rand::seq::index::sample(&mut rng, n, MIN_DLT_POINTS).into_vec();
        let sample_3d: Vec<_> = sample.iter().map(|&i| points3d[i]).collect();
        let sample_2d: Vec<_> = sample.iter().map(|&i| points2d[i]).collect();

        let Some(t_cw) = dlt(&sample_3d, &sample_2d, camera) else {
            continue;
        };

        let candidate = evaluate(&t_cw, points3d, points2d, camera, config.reprojection_threshold_px);
        let inliers = candidate.num_inliers();
        if inliers > best_inliers {
            best_inliers = inliers;
            best = Some(candidate);

            let ratio = inliers as f64 / n as f64;
            let needed = compute_adaptive_iterations(ratio, config.confidence, MIN_DLT_POINTS);
            max_iter = max_iter.min(iteration.saturating_add(needed));
        }
    }

    let best = best?;
    if best_inliers < MIN_DLT_POINTS {
        return Some(best);
    }

    let refined_pose = refine_pose(
        best.pose,
        points3d,
        points2d,
        Some(&best.inlier_mask),
        camera,
        config,
    );
    let refined = evaluate(&refined_pose, points3d, points2d, camera, config.reprojection_threshold_px);
    if refined.num_inliers() >= best_inliers {
        Some(refined)
    } else {
        Some(best)
    }
}

/// Linear PnP (DLT) in normalized image coordinates. Returns T_cam_world.
pub fn dlt(
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    camera: &CameraModel,
) -> Option<SE3> {
    let n = points3d.len();
    if n < MIN_DLT_POINTS || points2d.len() != n {
        return None;
    }

    // 2n x 12 system A p = 0 for P = [R | t] (up to scale).
    let mut a = DMatrix::<f64>::zeros(2 * n, 12);
    for (i, (pw, uv)) in points3d.iter().zip(points2d).enumerate() {
        let xn = camera.normalize(uv);
        let (x, y, z) = (pw.x, pw.y, pw.z);
        let (r0, r1) = (2 * i, 2 * i + 1);

        a[(r0, 0)] = x;
        a[(r0, 1)] = y;
        a[(r0, 2)] = z;
        a[(r0, 3)] = 1.0;
        a[(r0, 8)] = -xn.x * x;
        a[(r0, 9)] = -xn.x * y;
        a[(r0, 10)] = -xn.x * z;
        a[(r0, 11)] = -xn.x;

        a[(r1, 4)] = x;
        a[(r1, 5)] = y;
        a[(r1, 6)] = z;
        a[(r1, 7)] = 1.0;
        a[(r1, 8)] = -xn.y * x;
        a[(r1, 9)] = -xn.y * y;
        a[(r1, 10)] = -xn.y * z;
        a[(r1, 11)] = -xn.y;
    }

    let ata = a.transpose() * &a;
    let eig = ata.symmetric_eigen();
    let (min_idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.total_cmp(b))?;
    let p_vec = eig.eigenvectors.column(min_idx);

    let mut p = Matrix3x4::<f64>::zeros();
    for r in 0..3 {
        for c in 0..4 {
            p[(r, c)] = p_vec[4 * r + c];
        }
    }

    // Choose the sign that puts the points in front of the camera.
    let positive_depths = points3d
        .iter()
        .filter(|pw| p.row(2).dot(&pw.push(1.0).transpose()) > 0.0)
        .count();
    if positive_depths * 2 < n {
        p = -p;
    }

    let m = p.fixed_view::<3, 3>(0, 0).into_owned();
    let svd = m.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let scale = svd.singular_values.mean();
    if !(scale > 1e-12) {
        return None;
    }

    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r = u_flipped * v_t;
    }
    let t: Vector3<f64> = p.column(3).into_owned() / scale;

    Some(SE3::from_rt(r, t))
}

/// Gauss-Newton refinement of T_cam_world on (a subset of) correspondences.
///
/// Left perturbation: T' = exp(δ) * T with δ = [δθ, δt].
fn refine_pose(
    initial: SE3,
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    mask: Option<&[bool]>,
    camera: &CameraModel,
    config: &PnpConfig,
) -> SE3 {
    let mut t_cw = initial;
    let lambda = 1e-3;

    for _ in 0..config.refine_iterations {
        let mut h = Matrix6::<f64>::zeros();
        let mut g = Vector6::<f64>::zeros();
        let mut active = 0;

        for (i, (pw, uv)) in points3d.iter().zip(points2d).enumerate() {
            if mask.is_some_and(|m| !m[i]) {
                continue;
            }
            let pc = t_cw.transform_point(pw);
            let Some(proj) = camera.project(&pc) else {
                continue;
            };
            let r = proj - uv;
            let w = huber_weight(r.norm(), config.huber_threshold_px);

            let inv_z = 1.0 / pc.z;
            let jp = Matrix2x3::new(
                camera.fx * inv_z,
                0.0,
                -camera.fx * pc.x * inv_z * inv_z,
                0.0,
                camera.fy * inv_z,
                -camera.fy * pc.y * inv_z * inv_z,
            );
            let mut j = Matrix2x6::<f64>::zeros();
            j.fixed_view_mut::<2, 3>(0, 0).copy_from(&(jp * -hat(&pc)));
            j.fixed_view_mut::<2, 3>(0, 3).copy_from(&jp);

            h += w * j.transpose() * j;
            g += w * j.transpose() * r;
            active += 1;
        }

        if active < MIN_REFINE_POINTS {
            break;
        }

        for i in 0..6 {
            h[(i, i)] += lambda * h[(i, i)].max(1e-6);
        }
        let Some(delta) = h.lu().solve(&(-g)) else {
            break;
        };

        let d_rot = nalgebra::UnitQuaternion::from_scaled_axis(Vector3::new(delta[0], delta[1], delta[2]));
        let d_trans = Vector3::new(delta[3], delta[4], delta[5]);
        t_cw = SE3 {
            rotation: d_rot * t_cw.rotation,
            translation: d_rot * t_cw.translation + d_trans,
        };

        if delta.norm() < 1e-10 {
            break;
        }
    }

    t_cw
}

/// Reprojection errors and inlier mask under T_cam_world.
fn evaluate(
    t_cw: &SE3,
    points3d: &[Vector3<f64>],
    points2d: &[Vector2<f64>],
    camera: &CameraModel,
    threshold: f64,
) -> PnPResult {
    let mut reproj_errors = Vec::with_capacity(points3d.len());
    let mut inlier_mask = Vec::with_capacity(points3d.len());

    for (pw, uv) in points3d.iter().zip(points2d) {
        let err = camera
            .project(&t_cw.transform_point(pw))
            .map(|proj| (proj - uv).norm())
            .unwrap_or(f64::INFINITY);
        reproj_errors.push(err);
        inlier_mask.push(err <= threshold);
    }

    PnPResult {
        pose: *t_cw,
        inlier_mask,
        reproj_errors,
    }
}

fn huber_weight(error: f64, threshold: f64) -> f64 {
    if error <= threshold {
        1.0
    } else {
        threshold / error
    }
}

/// Compute adaptive number of RANSAC iterations.
fn compute_adaptive_iterations(inlier_ratio: f64, probability: f64, sample_size: usize) -> usize {
    if inlier_ratio <= 0.0 {
        return usize::MAX;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }

    // k = log(1 - p) / log(1 - w^n)
    let w_n = inlier_ratio.powi(sample_size as i32);
    let log_denom = (1.0 - w_n).ln();
    if log_denom.abs() < 1e-10 {
        return usize::MAX;
    }

    let k = (1.0 - probability).ln() / log_denom;
    (k.ceil() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn camera() -> CameraModel {
        CameraModel::new(800.0, 780.0, 640.0, 360.0)
    }

    /// Camera pose T_world_cam looking roughly at the origin from -Z.
    fn ground_truth() -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.05, -0.1, 0.02),
            translation: Vector3::new(0.2, -0.1, -4.0),
        }
    }

    fn synthetic(pose: &SE3) -> (Vec<Vector3<f64>>, Vec<Vector2<f64>>) {
        let cam = camera();
        let t_cw = pose.inverse();
        let mut world = Vec::new();
        let mut image = Vec::new();
        for z in 0..3 {
            for y in 0..3 {
                for x in 0..4 {
                    let pw = Vector3::new(
                        x as f64 * 0.5 - 0.75,
                        y as f64 * 0.4 - 0.4,
                        z as f64 * 0.6,
                    );
                    let uv = cam.project(&t_cw.transform_point(&pw)).unwrap();
                    world.push(pw);
                    image.push(uv);
                }
            }
        }
        (world, image)
    }

    fn seeded() -> PnpConfig {
        PnpConfig {
            seed: Some(7),
            ..Default::default()
        }
    }

    #[test]
    fn test_dlt_recovers_pose() {
        let gt = ground_truth();
        let (world, image) = synthetic(&gt);

        let t_cw = dlt(&world, &image, &camera()).unwrap();
        let est = t_cw.inverse();

        assert_relative_eq!(est.translation, gt.translation, epsilon = 1e-6);
        assert!(est.rotation.angle_to(&gt.rotation) < 1e-6);
    }

    #[test]
    fn test_ransac_rejects_outliers() {
        let gt = ground_truth();
        let (mut world, mut image) = synthetic(&gt);
        let clean = world.len();
        for i in 0..5 {
            world.push(Vector3::new(0.3 * i as f64, 1.5, 0.2));
            image.push(Vector2::new(50.0 + 70.0 * i as f64, 700.0));
        }

        let result = solve_pnp_ransac(&world, &image, &camera(), None, &seeded()).unwrap();

        assert_eq!(result.num_inliers(), clean);
        assert!(result.inlier_indices().iter().all(|&i| i < clean));
        assert_relative_eq!(result.pose.translation, gt.translation, epsilon = 1e-6);
    }

    #[test]
    fn test_prior_refines_with_few_points() {
        let gt = ground_truth();
        let (world, image) = synthetic(&gt);
        let prior = SE3 {
            rotation: gt.rotation,
            translation: gt.translation + Vector3::new(0.03, -0.02, 0.05),
        };

        let picks = [0, 5, 14, 23];
        let world: Vec<_> = picks.iter().map(|&i| world[i]).collect();
        let image: Vec<_> = picks.iter().map(|&i| image[i]).collect();

        let result = solve_pnp_ransac(&world, &image, &camera(), Some(&prior), &seeded()).unwrap();

        assert_eq!(result.num_inliers(), 4);
        assert!(result.reproj_errors.iter().all(|&e| e < 1.0));
    }

    #[test]
    fn test_single_point_with_exact_prior() {
        let gt = ground_truth();
        let (world, image) = synthetic(&gt);

        let result =
            solve_pnp_ransac(&world[..1], &image[..1], &camera(), Some(&gt), &seeded()).unwrap();

        assert_eq!(result.num_inliers(), 1);
        assert_relative_eq!(result.pose.translation, gt.translation, epsilon = 1e-9);
    }

    #[test]
    fn test_too_few_points_without_prior() {
        let (world, image) = synthetic(&ground_truth());
        assert!(solve_pnp_ransac(&world[..5], &image[..5], &camera(), None, &seeded()).is_none());
    }

    #[test]
    fn test_adaptive_iterations() {
        assert_eq!(compute_adaptive_iterations(1.0, 0.99, 6), 1);
        assert!(compute_adaptive_iterations(0.5, 0.99, 6) > compute_adaptive_iterations(0.9, 0.99, 6));
    }
}
