//! Filtered tracker: fuses high-rate VIO poses with sparse map localizations.
//!
//! The filter state is the rigid transform T_map_vio that carries VIO-frame
//! camera poses into the map frame, plus a 6x6 covariance over a left
//! perturbation `[δθ, δt]`:
//! ```text
//! T' = exp(δ) * T     R' = exp(δθ) R,   t' = exp(δθ) t + δt
//! ```
//!
//! Two rate domains share the state behind a mutex:
//! - `predict_step` (every VIO frame): inflates the covariance with the VIO
//!   motion since the previous call and advances output smoothing. It never
//!   waits on image work.
//! - `measurement_update` (every few seconds): localizes outside the lock and
//!   only takes the lock to fuse the already-computed correction.
//!
//! A measurement is computed against the VIO pose of its own frame, so it
//! constrains T_map_vio directly; motion that happened while it was being
//! computed only inflates its noise.

use std::sync::Arc;
use std::time::Instant;

use image::GrayImage;
use nalgebra::{Matrix4, Matrix6, Vector3, Vector6};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::frame::Frame;
use crate::geometry::frames::yaw_only;
use crate::geometry::{so3, SE3};
use crate::localization::{FeatureLocalizer, LocalizeDiagnostics};
use crate::map::SpatialQuery;

use super::result::{MeasurementRejection, MeasurementResult};
use super::scheduler::MeasurementClock;
use super::state::TrackerState;

/// Filter tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilteredTrackerConfig {
    /// Minimum time between measurement updates (seconds).
    pub measurement_interval_s: f64,
    /// Measurement noise at full confidence.
    pub measurement_rotation_sigma_deg: f64,
    pub measurement_translation_sigma_m: f64,
    /// Process noise per unit of VIO motion (rad per rad, m per m).
    pub process_rotation_noise: f64,
    pub process_translation_noise: f64,
    /// Extra measurement noise per unit of VIO motion between the frame
    /// capture and the moment the correction is applied.
    pub latency_rotation_noise: f64,
    pub latency_translation_noise: f64,
    /// Chi-squared gate on the 6-DOF innovation.
    pub gate_chi2: f64,
    /// Restrict rotation corrections to heading (VIO already knows gravity).
    pub yaw_only: bool,
    /// Number of predict steps used to blend the output towards a corrected
    /// estimate. 0 snaps immediately.
    pub smoothing_steps: u32,
    /// Corrections smaller than this (metres) snap without smoothing.
    pub snap_translation_m: f64,
    /// Lower clamp on measurement confidence.
    pub min_confidence: f64,
    /// Inlier count at which the support term of the confidence reaches 0.5.
    pub confidence_inlier_scale: f64,
}

impl Default for FilteredTrackerConfig {
    fn default() -> Self {
        Self {
            measurement_interval_s: 2.0,
            measurement_rotation_sigma_deg: 2.0,
            measurement_translation_sigma_m: 0.25,
            process_rotation_noise: 0.01,
            process_translation_noise: 0.02,
            latency_rotation_noise: 0.05,
            latency_translation_noise: 0.05,
            gate_chi2: 22.46, // 99.9% chi2 with 6 DOF
            yaw_only: true,
            smoothing_steps: 15,
            snap_translation_m: 0.01,
            min_confidence: 0.05,
            confidence_inlier_scale: 10.0,
        }
    }
}

/// State shared between the prediction and measurement paths.
struct FilterState {
    state: TrackerState,
    /// Current estimate of T_map_vio.
    t_map_vio: SE3,
    covariance: Matrix6<f64>,
    /// Smoothed output handed to consumers.
    displayed: SE3,
    animation_steps_left: u32,
    latest_vio: Option<SE3>,
    last_predict_vio: Option<SE3>,
    /// Timestamp of the newest fused frame.
    last_applied_ns: Option<u64>,
    /// Bumped on every reset; measurements started before a reset are dropped.
    generation: u64,
}

impl FilterState {
    fn new() -> Self {
        Self {
            state: TrackerState::Uninitialized,
            t_map_vio: SE3::identity(),
            covariance: Matrix6::zeros(),
            displayed: SE3::identity(),
            animation_steps_left: 0,
            latest_vio: None,
            last_predict_vio: None,
            last_applied_ns: None,
            generation: 0,
        }
    }
}

pub struct FilteredTracker {
    localizer: Arc<FeatureLocalizer>,
    config: FilteredTrackerConfig,
    state: Mutex<FilterState>,
    clock: Mutex<MeasurementClock>,
}

impl FilteredTracker {
    pub fn new(localizer: Arc<FeatureLocalizer>, config: FilteredTrackerConfig) -> Self {
        let clock = MeasurementClock::from_secs(config.measurement_interval_s);
        Self {
            localizer,
            config,
            state: Mutex::new(FilterState::new()),
            clock: Mutex::new(clock),
        }
    }

    pub fn localizer(&self) -> &Arc<FeatureLocalizer> {
        &self.localizer
    }

    pub fn config(&self) -> &FilteredTrackerConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // VIO rate
    // ─────────────────────────────────────────────────────────────────────────

    /// Record the latest VIO camera pose (camera-to-world, AR convention).
    pub fn update_vio_camera_pose(&self, pose: &Matrix4<f64>) {
        let pose = SE3::from_matrix(*pose);
        let mut s = self.state.lock();
        s.latest_vio = Some(pose);
        if s.last_predict_vio.is_none() {
            s.last_predict_vio = Some(pose);
        }
        if s.state == TrackerState::Uninitialized {
            s.state = TrackerState::Initialized;
            debug!("[FilteredTracker] first VIO pose received");
        }
    }

    /// Propagate uncertainty with the VIO motion since the previous call and
    /// advance output smoothing. The estimate itself is not moved.
    pub fn predict_step(&self) {
        let mut s = self.state.lock();
        let Some(current) = s.latest_vio else {
            return;
        };

        if let Some(previous) = s.last_predict_vio {
            let (angle, dist) = previous.distance_to(&current);
            if s.state == TrackerState::Tracking && previous != current {
                let rot_var = (self.config.process_rotation_noise * angle).powi(2);
                let trans_var = (self.config.process_translation_noise * dist).powi(2);
                for i in 0..3 {
                    s.covariance[(i, i)] += rot_var;
                    s.covariance[(i + 3, i + 3)] += trans_var;
                }
            }
        }
        s.last_predict_vio = Some(current);

        if s.animation_steps_left > 0 {
            let alpha = 1.0 / s.animation_steps_left as f64;
            s.displayed = s.displayed.interpolate(&s.t_map_vio, alpha);
            s.animation_steps_left -= 1;
            if s.animation_steps_left == 0 {
                s.displayed = s.t_map_vio;
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Measurement rate
    // ─────────────────────────────────────────────────────────────────────────

    /// Localize `image` against the map and fuse the result.
    ///
    /// On any failure the filter state is left untouched and the result
    /// reports zero counts.
    pub fn measurement_update(
        &self,
        image: &GrayImage,
        frame: &Frame,
        query_x: f64,
        query_z: f64,
        query_diameter: f64,
    ) -> MeasurementResult {
        let t_vio_cam = frame.pose();
        let (generation, prior) = {
            let s = self.state.lock();
            let prior =
                (s.state == TrackerState::Tracking).then(|| s.t_map_vio.compose(&t_vio_cam));
            (s.generation, prior)
        };

        // Expensive part, no lock held.
        let query = SpatialQuery::new(query_x, query_z, query_diameter);
        let outcome = self.localizer.localize(image, frame, &query, prior.as_ref());
        let diagnostics = outcome.diagnostics;
        let Some(t_map_cam) = outcome.pose else {
            debug!(
                "[FilteredTracker] frame {}: localization failed ({:?})",
                frame.id, diagnostics.failure
            );
            return MeasurementResult::rejected(
                self.estimate(),
                MeasurementRejection::LocalizationFailed,
                diagnostics,
            );
        };
        let confidence = self.confidence(&diagnostics);

        let mut s = self.state.lock();
        if s.generation != generation {
            debug!("[FilteredTracker] frame {}: reset during measurement", frame.id);
            return MeasurementResult::rejected(
                s.t_map_vio,
                MeasurementRejection::ResetDuringMeasurement,
                diagnostics,
            );
        }
        if let Some(last) = s.last_applied_ns {
            if frame.timestamp_ns < last {
                debug!(
                    "[FilteredTracker] frame {}: stale ({} < {})",
                    frame.id, frame.timestamp_ns, last
                );
                return MeasurementResult::rejected(
                    s.t_map_vio,
                    MeasurementRejection::Stale {
                        frame_ns: frame.timestamp_ns,
                        last_applied_ns: last,
                    },
                    diagnostics,
                );
            }
        }

        let r = self.measurement_noise(confidence, &t_vio_cam, s.latest_vio.as_ref());
        let z = self.measured_transform(&t_map_cam, &t_vio_cam, &s.t_map_vio);

        if s.state != TrackerState::Tracking {
            s.t_map_vio = z;
            s.covariance = r;
            s.state = TrackerState::Tracking;
            s.displayed = z;
            s.animation_steps_left = 0;
            info!(
                "[FilteredTracker] initialized from frame {} ({} inliers, confidence {:.2})",
                frame.id, diagnostics.inlier_count, confidence
            );
        } else {
            let innovation = innovation(&z, &s.t_map_vio);
            let innovation_cov = s.covariance + r;
            let Some(s_inv) = innovation_cov.try_inverse() else {
                warn!("[FilteredTracker] singular innovation covariance");
                return MeasurementResult::rejected(
                    s.t_map_vio,
                    MeasurementRejection::InnovationGate {
                        distance_sq: f64::INFINITY,
                    },
                    diagnostics,
                );
            };
            let distance_sq = (innovation.transpose() * s_inv * innovation)[(0, 0)];
            if distance_sq > self.config.gate_chi2 {
                debug!(
                    "[FilteredTracker] frame {}: innovation {:.1} exceeds gate {:.1}",
                    frame.id, distance_sq, self.config.gate_chi2
                );
                return MeasurementResult::rejected(
                    s.t_map_vio,
                    MeasurementRejection::InnovationGate { distance_sq },
                    diagnostics,
                );
            }

            // Kalman update with H = I, Joseph form.
            let k = s.covariance * s_inv;
            let mut delta = k * innovation;
            if self.config.yaw_only {
                delta[0] = 0.0;
                delta[2] = 0.0;
            }
            s.t_map_vio = apply_delta(&s.t_map_vio, &delta);
            let i_k = Matrix6::identity() - k;
            let p = i_k * s.covariance * i_k.transpose() + k * r * k.transpose();
            s.covariance = (p + p.transpose()) * 0.5;

            let (_, jump) = s.displayed.distance_to(&s.t_map_vio);
            if self.config.smoothing_steps == 0 || jump < self.config.snap_translation_m {
                s.displayed = s.t_map_vio;
                s.animation_steps_left = 0;
            } else {
                s.animation_steps_left = self.config.smoothing_steps;
            }
            debug!(
                "[FilteredTracker] frame {}: fused (innovation {:.2}, confidence {:.2})",
                frame.id, distance_sq, confidence
            );
        }
        s.last_applied_ns = Some(frame.timestamp_ns);

        MeasurementResult {
            success: true,
            transform: s.t_map_vio,
            confidence,
            matched_landmark_count: diagnostics.match_count,
            inlier_count: diagnostics.inlier_count,
            inlier_ids: diagnostics.inlier_ids.clone(),
            rejection: None,
            diagnostics,
        }
    }

    /// Claim a measurement slot: `true` (and the slot is taken) when at least
    /// the configured interval has passed since the last claim.
    pub fn should_measure(&self, now: Instant) -> bool {
        self.clock.lock().try_claim(now)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Smoothed VIO-to-map transform. Identity until the first fix.
    pub fn filtered_transform(&self) -> SE3 {
        self.state.lock().displayed
    }

    /// Unsmoothed VIO-to-map estimate.
    pub fn estimate(&self) -> SE3 {
        self.state.lock().t_map_vio
    }

    /// Map a VIO camera pose into the map frame.
    pub fn transform_pose(&self, vio_pose: &SE3) -> SE3 {
        self.filtered_transform().compose(vio_pose)
    }

    pub fn covariance(&self) -> Matrix6<f64> {
        self.state.lock().covariance
    }

    /// 1σ position uncertainty (metres) while tracking.
    pub fn position_uncertainty(&self) -> Option<f64> {
        let s = self.state.lock();
        (s.state == TrackerState::Tracking).then(|| {
            (s.covariance[(3, 3)] + s.covariance[(4, 4)] + s.covariance[(5, 5)])
                .max(0.0)
                .sqrt()
        })
    }

    pub fn state(&self) -> TrackerState {
        self.state.lock().state
    }

    /// Whether a map-aligned estimate exists.
    pub fn is_initialized(&self) -> bool {
        self.state() == TrackerState::Tracking
    }

    /// Whether the output is still blending towards the latest correction.
    pub fn is_animating(&self) -> bool {
        self.state.lock().animation_steps_left > 0
    }

    /// Set the image size the frame intrinsics refer to.
    pub fn configure_image_size(&self, width: u32, height: u32) {
        self.localizer.configure_image_size(width, height);
    }

    /// Discard the estimate and its uncertainty.
    pub fn reset(&self) {
        let mut s = self.state.lock();
        let latest = s.latest_vio;
        let generation = s.generation + 1;
        *s = FilterState::new();
        s.generation = generation;
        s.latest_vio = latest;
        s.last_predict_vio = latest;
        if latest.is_some() {
            s.state = TrackerState::Initialized;
        }
        info!("[FilteredTracker] reset (generation {})", generation);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    /// Confidence from inlier ratio, inlier support and reprojection error.
    fn confidence(&self, d: &LocalizeDiagnostics) -> f64 {
        let n = d.inlier_count as f64;
        let support = n / (n + self.config.confidence_inlier_scale);
        let threshold = self.localizer.config().reprojection_threshold_px;
        let reprojection = d
            .mean_reprojection_error_px
            .map(|e| 1.0 / (1.0 + e / threshold.max(1e-6)))
            .unwrap_or(1.0);
        (d.inlier_ratio() * support * reprojection).clamp(0.0, 1.0)
    }

    /// Diagonal measurement covariance.
    fn measurement_noise(&self, confidence: f64, t_vio_cam: &SE3, latest_vio: Option<&SE3>) -> Matrix6<f64> {
        let conf = confidence.max(self.config.min_confidence);
        let mut rot_sigma = self.config.measurement_rotation_sigma_deg.to_radians() / conf;
        let mut trans_sigma = self.config.measurement_translation_sigma_m / conf;

        if let Some(latest) = latest_vio {
            let (angle, dist) = t_vio_cam.distance_to(latest);
            rot_sigma += self.config.latency_rotation_noise * angle;
            trans_sigma += self.config.latency_translation_noise * dist;
        }

        let rot_var = rot_sigma * rot_sigma;
        let trans_var = trans_sigma * trans_sigma;
        Matrix6::from_diagonal(&Vector6::new(
            rot_var, rot_var, rot_var, trans_var, trans_var, trans_var,
        ))
    }

    /// T_map_vio implied by a localized frame.
    ///
    /// With `yaw_only`, the rotation change relative to `current` is reduced to
    /// heading and the translation is chosen so the camera position still
    /// matches the localization.
    fn measured_transform(&self, t_map_cam: &SE3, t_vio_cam: &SE3, current: &SE3) -> SE3 {
        let z = t_map_cam.compose(&t_vio_cam.inverse());
        if !self.config.yaw_only {
            return z;
        }
        let correction = yaw_only(&(z.rotation * current.rotation.inverse()));
        let rotation = correction * current.rotation;
        SE3 {
            rotation,
            translation: t_map_cam.translation - rotation * t_vio_cam.translation,
        }
    }
}

/// Left-perturbation error `δ` with `z = exp(δ) * t`.
fn innovation(z: &SE3, t: &SE3) -> Vector6<f64> {
    let theta = so3::left_difference(&z.rotation, &t.rotation);
    let rho = z.translation - so3::exp(&theta) * t.translation;
    Vector6::new(theta.x, theta.y, theta.z, rho.x, rho.y, rho.z)
}

fn apply_delta(t: &SE3, delta: &Vector6<f64>) -> SE3 {
    let d_rot = so3::exp(&Vector3::new(delta[0], delta[1], delta[2]));
    SE3 {
        rotation: d_rot * t.rotation,
        translation: d_rot * t.translation + Vector3::new(delta[3], delta[4], delta[5]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{Descriptor, Feature, FeatureExtractor};
    use crate::geometry::frames::ar_pose_to_cv;
    use crate::geometry::CameraModel;
    use crate::localization::LocalizerConfig;
    use crate::map::{Landmark, Map, SharedMap};
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, UnitQuaternion};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{OnceLock, Weak};

    struct FixedExtractor(Vec<Feature>);

    impl FeatureExtractor for FixedExtractor {
        fn extract(&self, _image: &GrayImage) -> anyhow::Result<Vec<Feature>> {
            Ok(self.0.clone())
        }
    }

    const W: u32 = 640;
    const H: u32 = 480;

    fn intrinsics() -> Matrix3<f64> {
        Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0)
    }

    /// Ground-truth map pose of the camera.
    fn t_map_cam() -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_axis_angle(&Vector3::y_axis(), -0.2),
            translation: Vector3::new(0.5, 1.4, 6.0),
        }
    }

    /// Ground-truth VIO-to-map transform (heading + offset).
    fn t_map_vio() -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.4),
            translation: Vector3::new(3.0, 0.0, -2.0),
        }
    }

    fn tracker(features: Vec<Feature>, map: SharedMap) -> FilteredTracker {
        let localizer = FeatureLocalizer::new(
            map,
            Arc::new(FixedExtractor(features)),
            LocalizerConfig {
                image_width: W,
                image_height: H,
                seed: Some(5),
                ..Default::default()
            },
        );
        FilteredTracker::new(Arc::new(localizer), FilteredTrackerConfig::default())
    }

    fn scene() -> (SharedMap, Vec<Feature>) {
        let mut rng = StdRng::seed_from_u64(21);
        let camera = CameraModel::from_k(&intrinsics());
        let t_cv_map = ar_pose_to_cv(&t_map_cam()).inverse();
        let mut map = Map::new();
        let mut features = Vec::new();
        for i in 0..20 {
            let position = Vector3::new(
                (i % 5) as f64 * 0.7 - 1.5,
                (i / 5) as f64 * 0.5,
                -((i % 3) as f64) * 0.8,
            );
            let mut bytes = [0u8; 32];
            rng.fill(&mut bytes);
            let id = map.next_landmark_id();
            map.insert_landmark(Landmark::new(id, position, Descriptor(bytes), 0));
            let pixel = camera.project(&t_cv_map.transform_point(&position)).unwrap();
            features.push(Feature::new(pixel, Descriptor(bytes)));
        }
        (SharedMap::new(map), features)
    }

    /// Frame whose VIO pose is consistent with the ground truth, optionally
    /// displaced in the VIO world.
    fn frame(timestamp_ns: u64, vio_offset: Vector3<f64>) -> Frame {
        let mut t_vio_cam = t_map_vio().inverse().compose(&t_map_cam());
        t_vio_cam.translation += vio_offset;
        Frame::new(1, timestamp_ns, intrinsics(), t_vio_cam.to_matrix())
    }

    fn fix(tracker: &FilteredTracker, frame: &Frame) -> MeasurementResult {
        tracker.update_vio_camera_pose(&frame.extrinsics);
        tracker.measurement_update(&GrayImage::new(W, H), frame, 0.0, 0.0, 30.0)
    }

    #[test]
    fn test_state_transitions() {
        let (map, features) = scene();
        let tracker = tracker(features, map);
        assert_eq!(tracker.state(), TrackerState::Uninitialized);
        tracker.reset();
        assert_eq!(tracker.state(), TrackerState::Uninitialized);

        tracker.update_vio_camera_pose(&Matrix4::identity());
        assert_eq!(tracker.state(), TrackerState::Initialized);
        assert!(!tracker.is_initialized());
        assert!(tracker.position_uncertainty().is_none());

        let result = fix(&tracker, &frame(100, Vector3::zeros()));
        assert!(result.success);
        assert_eq!(tracker.state(), TrackerState::Tracking);

        tracker.reset();
        assert_eq!(tracker.state(), TrackerState::Initialized);
        assert_eq!(tracker.filtered_transform(), SE3::identity());
    }

    #[test]
    fn test_first_fix_recovers_transform() {
        let (map, features) = scene();
        let tracker = tracker(features, map);

        let result = fix(&tracker, &frame(100, Vector3::zeros()));

        assert!(result.success);
        assert_eq!(result.inlier_count, 20);
        assert_eq!(result.matched_landmark_count, 20);
        assert!(result.confidence > 0.0 && result.confidence <= 1.0);
        let (angle, dist) = tracker.filtered_transform().distance_to(&t_map_vio());
        assert!(angle < 1e-6 && dist < 1e-6);
        assert!(tracker.position_uncertainty().unwrap() > 0.0);
    }

    #[test]
    fn test_zero_motion_prediction_changes_nothing() {
        let (map, features) = scene();
        let tracker = tracker(features, map);
        fix(&tracker, &frame(100, Vector3::zeros()));
        let before = (tracker.filtered_transform(), tracker.covariance());

        for _ in 0..10 {
            tracker.update_vio_camera_pose(&frame(100, Vector3::zeros()).extrinsics);
            tracker.predict_step();
            assert_eq!((tracker.filtered_transform(), tracker.covariance()), before);
        }
    }

    #[test]
    fn test_motion_inflates_covariance_only() {
        let (map, features) = scene();
        let tracker = tracker(features, map);
        fix(&tracker, &frame(100, Vector3::zeros()));
        let transform = tracker.filtered_transform();
        let sigma = tracker.position_uncertainty().unwrap();

        tracker.update_vio_camera_pose(&frame(100, Vector3::new(2.0, 0.0, 0.0)).extrinsics);
        tracker.predict_step();

        assert_eq!(tracker.filtered_transform(), transform);
        assert!(tracker.position_uncertainty().unwrap() > sigma);
    }

    #[test]
    fn test_failed_measurement_leaves_state() {
        let (map, _) = scene();
        let blind = tracker(Vec::new(), map);
        fix(&blind, &frame(100, Vector3::zeros()));
        let before = (blind.state(), blind.filtered_transform(), blind.covariance());

        let result = fix(&blind, &frame(200, Vector3::zeros()));

        assert!(!result.success);
        assert_eq!(result.matched_landmark_count, 0);
        assert_eq!(result.inlier_count, 0);
        assert!(result.inlier_ids.is_empty());
        assert_eq!(result.rejection, Some(MeasurementRejection::LocalizationFailed));
        assert_eq!((blind.state(), blind.filtered_transform(), blind.covariance()), before);
    }

    #[test]
    fn test_stale_measurement_rejected() {
        let (map, features) = scene();
        let tracker = tracker(features, map);
        fix(&tracker, &frame(500, Vector3::zeros()));

        let result = fix(&tracker, &frame(400, Vector3::zeros()));

        assert!(!result.success);
        assert!(matches!(
            result.rejection,
            Some(MeasurementRejection::Stale { frame_ns: 400, last_applied_ns: 500 })
        ));
    }

    #[test]
    fn test_outlier_measurement_gated() {
        let (map, features) = scene();
        let tracker = tracker(features, map);
        fix(&tracker, &frame(100, Vector3::zeros()));
        let before = tracker.estimate();

        let result = fix(&tracker, &frame(200, Vector3::new(6.0, 0.0, 0.0)));

        assert!(!result.success);
        assert!(matches!(result.rejection, Some(MeasurementRejection::InnovationGate { .. })));
        assert_eq!(tracker.estimate(), before);
    }

    #[test]
    fn test_correction_is_smoothed() {
        let (map, features) = scene();
        let tracker = tracker(features, map);
        fix(&tracker, &frame(100, Vector3::zeros()));
        let start = tracker.filtered_transform();

        let result = fix(&tracker, &frame(200, Vector3::new(0.3, 0.0, 0.0)));

        assert!(result.success);
        assert!(tracker.is_animating());
        assert_eq!(tracker.filtered_transform(), start);

        let target = tracker.estimate();
        let (_, moved) = target.distance_to(&start);
        assert!(moved > 0.05 && moved < 0.3);

        for _ in 0..tracker.config().smoothing_steps {
            tracker.predict_step();
        }
        assert!(!tracker.is_animating());
        assert_eq!(tracker.filtered_transform(), target);
    }

    #[test]
    fn test_reset_accepts_older_frames() {
        let (map, features) = scene();
        let tracker = tracker(features, map);
        fix(&tracker, &frame(100, Vector3::zeros()));
        tracker.reset();

        assert!(tracker.position_uncertainty().is_none());
        // After a reset older frames are accepted again.
        let result = fix(&tracker, &frame(50, Vector3::zeros()));
        assert!(result.success);
        assert_relative_eq!(
            tracker.filtered_transform().translation,
            t_map_vio().translation,
            epsilon = 1e-6
        );
    }

    /// Resets the tracker from inside extraction once armed, so the reset
    /// lands while a measurement is in flight.
    struct ResettingExtractor {
        features: Vec<Feature>,
        tracker: OnceLock<Weak<FilteredTracker>>,
        armed: AtomicBool,
    }

    impl FeatureExtractor for ResettingExtractor {
        fn extract(&self, _image: &GrayImage) -> anyhow::Result<Vec<Feature>> {
            if self.armed.load(Ordering::SeqCst) {
                if let Some(tracker) = self.tracker.get().and_then(Weak::upgrade) {
                    tracker.reset();
                }
            }
            Ok(self.features.clone())
        }
    }

    #[test]
    fn test_reset_during_measurement_discards_result() {
        let (map, features) = scene();
        let extractor = Arc::new(ResettingExtractor {
            features,
            tracker: OnceLock::new(),
            armed: AtomicBool::new(false),
        });
        let localizer = FeatureLocalizer::new(
            map,
            extractor.clone(),
            LocalizerConfig {
                image_width: W,
                image_height: H,
                seed: Some(5),
                ..Default::default()
            },
        );
        let tracker = Arc::new(FilteredTracker::new(
            Arc::new(localizer),
            FilteredTrackerConfig::default(),
        ));
        assert!(extractor.tracker.set(Arc::downgrade(&tracker)).is_ok());

        assert!(fix(&tracker, &frame(100, Vector3::zeros())).success);
        extractor.armed.store(true, Ordering::SeqCst);

        let result = fix(&tracker, &frame(200, Vector3::zeros()));

        assert!(!result.success);
        assert_eq!(result.rejection, Some(MeasurementRejection::ResetDuringMeasurement));
        assert_eq!(result.inlier_count, 0);
        assert_eq!(tracker.state(), TrackerState::Initialized);
        assert!(tracker.position_uncertainty().is_none());
        let (angle, dist) = tracker.estimate().distance_to(&SE3::identity());
        assert!(angle < 1e-12 && dist < 1e-12);
        assert_eq!(tracker.covariance(), Matrix6::zeros());
    }

    #[test]
    fn test_should_measure_interval() {
        let (map, features) = scene();
        let tracker = tracker(features, map);
        let t0 = Instant::now();

        assert!(tracker.should_measure(t0));
        assert!(!tracker.should_measure(t0 + std::time::Duration::from_millis(1500)));
        assert!(tracker.should_measure(t0 + std::time::Duration::from_millis(2000)));
    }
}
