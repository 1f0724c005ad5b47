//! Feature-based localization against the landmark map.
//!
//! Pipeline for one image:
//! 1. Spatial query: candidate landmarks near the expected position
//! 2. Feature extraction and one-to-one descriptor matching
//! 3. Robust PnP (RANSAC + refinement, prior-seeded for small sets)
//! 4. Gravity check against the VIO pose of the same frame
//!
//! Rejections at any stage are reported as [`LocalizeFailure`] values with
//! the diagnostics gathered so far. Nothing here returns an error.

use std::sync::Arc;

use image::GrayImage;
use nalgebra::{Vector2, Vector3};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::features::{match_features, Descriptor, FeatureExtractor, MatcherConfig};
use crate::frame::Frame;
use crate::geometry::frames::{ar_pose_to_cv, cv_pose_to_ar, gravity_angle_deg};
use crate::geometry::{solve_pnp_ransac, CameraModel, PnpConfig, SE3};
use crate::map::{LandmarkId, Map, SharedMap, SpatialIndex, SpatialQuery};

use super::result::{LocalizeDiagnostics, LocalizeFailure, LocalizeOutcome};

/// Localization thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizerConfig {
    /// Minimum number of landmarks returned by the spatial query.
    pub min_landmarks: usize,
    /// Minimum number of descriptor matches.
    pub min_matches: usize,
    /// Minimum number of PnP inliers.
    pub min_inliers: usize,
    /// Maximum angle between solved and VIO gravity (degrees). `None`
    /// disables the check.
    pub max_gravity_angle_deg: Option<f64>,
    /// Image size the frame intrinsics refer to. Intrinsics are rescaled
    /// when the image handed to `localize` has a different size.
    pub image_width: u32,
    pub image_height: u32,
    /// Maximum descriptor distance for a match.
    pub max_descriptor_distance: u32,
    /// Nearest-neighbour ratio for a match.
    pub nn_ratio: f32,
    /// Inlier threshold on reprojection error (pixels).
    pub reprojection_threshold_px: f64,
    pub ransac_iterations: usize,
    pub ransac_confidence: f64,
    /// Fixed RANSAC seed for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for LocalizerConfig {
    fn default() -> Self {
        Self {
            min_landmarks: 8,
            min_matches: 8,
            min_inliers: 6,
            max_gravity_angle_deg: Some(15.0),
            image_width: 1920,
            image_height: 1440,
            max_descriptor_distance: crate::features::TH_HIGH,
            nn_ratio: crate::features::NN_RATIO,
            reprojection_threshold_px: 8.0,
            ransac_iterations: 200,
            ransac_confidence: 0.99,
            seed: None,
        }
    }
}

impl LocalizerConfig {
    fn matcher(&self) -> MatcherConfig {
        MatcherConfig {
            max_distance: self.max_descriptor_distance,
            nn_ratio: self.nn_ratio,
        }
    }

    fn pnp(&self) -> PnpConfig {
        PnpConfig {
            max_iterations: self.ransac_iterations,
            reprojection_threshold_px: self.reprojection_threshold_px,
            confidence: self.ransac_confidence,
            seed: self.seed,
            ..Default::default()
        }
    }
}

/// Candidate landmark copied out of the map for matching.
struct Candidate {
    id: LandmarkId,
    position: Vector3<f64>,
    descriptor: Descriptor,
}

/// Spatial index together with the map landmark revision it was built from.
struct IndexedLandmarks {
    index: SpatialIndex,
    revision: u64,
}

impl IndexedLandmarks {
    fn build(map: &Map) -> Self {
        Self {
            index: SpatialIndex::from_map(map),
            revision: map.landmark_revision(),
        }
    }
}

pub struct FeatureLocalizer {
    map: SharedMap,
    index: RwLock<IndexedLandmarks>,
    extractor: Arc<dyn FeatureExtractor>,
    config: RwLock<LocalizerConfig>,
}

impl FeatureLocalizer {
    /// Create a localizer over `map`, indexing its current landmarks.
    ///
    /// The index follows later landmark changes in `map`: it is rebuilt on
    /// the next query after the map's landmark revision moved.
    pub fn new(map: SharedMap, extractor: Arc<dyn FeatureExtractor>, config: LocalizerConfig) -> Self {
        let index = IndexedLandmarks::build(&map.read());
        info!(
            "FeatureLocalizer: indexed {} landmarks (min landmarks/matches/inliers {}/{}/{})",
            index.index.len(),
            config.min_landmarks,
            config.min_matches,
            config.min_inliers
        );
        Self {
            map,
            index: RwLock::new(index),
            extractor,
            config: RwLock::new(config),
        }
    }

    pub fn map(&self) -> &SharedMap {
        &self.map
    }

    /// Force a re-index from the current map.
    pub fn rebuild_index(&self) {
        let index = IndexedLandmarks::build(&self.map.read());
        *self.index.write() = index;
    }

    pub fn config(&self) -> LocalizerConfig {
        self.config.read().clone()
    }

    /// Set the image size the frame intrinsics refer to.
    pub fn configure_image_size(&self, width: u32, height: u32) {
        let mut config = self.config.write();
        config.image_width = width;
        config.image_height = height;
    }

    /// Estimate the camera pose of `frame` in the map frame.
    ///
    /// `prior` is an optional guess of T_map_cam (AR convention), usually the
    /// VIO pose mapped through the current filter estimate.
    pub fn localize(
        &self,
        image: &GrayImage,
        frame: &Frame,
        query: &SpatialQuery,
        prior: Option<&SE3>,
    ) -> LocalizeOutcome {
        let config = self.config();
        let mut diag = LocalizeDiagnostics::default();

        // 1. Spatial query
        let candidates = self.candidates(query);
        diag.spatial_query_ids = candidates.iter().map(|c| c.id).collect();
        diag.spatial_query_count = candidates.len();
        if candidates.is_empty() || candidates.len() < config.min_landmarks {
            debug!(
                "[Localize] frame {}: {} landmarks in query",
                frame.id,
                candidates.len()
            );
            return LocalizeOutcome::failed(
                diag,
                LocalizeFailure::TooFewLandmarks {
                    found: candidates.len(),
                    required: config.min_landmarks.max(1),
                },
            );
        }

        // 2. Extraction and matching
        let features = match self.extractor.extract(image) {
            Ok(features) => features,
            Err(e) => {
                warn!("[Localize] frame {}: feature extraction failed: {:#}", frame.id, e);
                Vec::new()
            }
        };
        let descriptors: Vec<Descriptor> = candidates.iter().map(|c| c.descriptor).collect();
        let matches = match_features(&descriptors, &features, &config.matcher());

        diag.matched_ids = matches.iter().map(|m| candidates[m.landmark_idx].id).collect();
        diag.match_count = matches.len();
        let required_matches = config.min_matches.max(1);
        if matches.len() < required_matches {
            debug!(
                "[Localize] frame {}: {} features, {} matches",
                frame.id,
                features.len(),
                matches.len()
            );
            return LocalizeOutcome::failed(
                diag,
                LocalizeFailure::TooFewMatches {
                    found: matches.len(),
                    required: required_matches,
                },
            );
        }

        // 3. Pose
        let camera = self.camera_for(frame, image, &config);
        let points3d: Vec<Vector3<f64>> = matches
            .iter()
            .map(|m| candidates[m.landmark_idx].position)
            .collect();
        let points2d: Vec<Vector2<f64>> = matches
            .iter()
            .map(|m| features[m.feature_idx].pixel)
            .collect();
        let prior_cv = prior.map(ar_pose_to_cv);

        let Some(pnp) = solve_pnp_ransac(&points3d, &points2d, &camera, prior_cv.as_ref(), &config.pnp())
        else {
            debug!("[Localize] frame {}: no pose hypothesis", frame.id);
            return LocalizeOutcome::failed(diag, LocalizeFailure::PoseSolveFailed);
        };

        diag.inlier_ids = pnp
            .inlier_indices()
            .into_iter()
            .map(|i| diag.matched_ids[i])
            .collect();
        diag.inlier_count = diag.inlier_ids.len();
        if diag.inlier_count > 0 {
            let sum: f64 = pnp
                .inlier_indices()
                .iter()
                .map(|&i| pnp.reproj_errors[i])
                .sum();
            diag.mean_reprojection_error_px = Some(sum / diag.inlier_count as f64);
        }
        let required_inliers = config.min_inliers.max(1);
        if diag.inlier_count < required_inliers {
            debug!(
                "[Localize] frame {}: {} / {} inliers",
                frame.id, diag.inlier_count, diag.match_count
            );
            return LocalizeOutcome::failed(
                diag,
                LocalizeFailure::TooFewInliers {
                    found: pnp.num_inliers(),
                    required: required_inliers,
                },
            );
        }

        // 4. Gravity
        let pose = cv_pose_to_ar(&pnp.pose);
        let angle = gravity_angle_deg(&pose, &frame.pose());
        diag.gravity_angle_deg = Some(angle);
        if let Some(max_deg) = config.max_gravity_angle_deg {
            if angle > max_deg {
                debug!(
                    "[Localize] frame {}: gravity angle {:.1}° exceeds {:.1}°",
                    frame.id, angle, max_deg
                );
                return LocalizeOutcome::failed(
                    diag,
                    LocalizeFailure::GravityMismatch {
                        angle_deg: angle,
                        max_deg,
                    },
                );
            }
        }

        {
            let mut map = self.map.write();
            for id in &diag.inlier_ids {
                map.set_matched(*id, true);
            }
        }

        info!(
            "[Localize] frame {}: {} candidates, {} matches, {} inliers, gravity {:.1}°",
            frame.id, diag.spatial_query_count, diag.match_count, diag.inlier_count, angle
        );

        LocalizeOutcome {
            pose: Some(pose),
            diagnostics: diag,
        }
    }

    /// Landmarks inside the query circle, copied under a short read lock.
    fn candidates(&self, query: &SpatialQuery) -> Vec<Candidate> {
        let map = self.map.read();
        let stale = self.index.read().revision != map.landmark_revision();
        if stale {
            let rebuilt = IndexedLandmarks::build(&map);
            debug!(
                "[Localize] landmarks changed, re-indexed {} landmarks",
                rebuilt.index.len()
            );
            *self.index.write() = rebuilt;
        }
        let result = self.index.read().index.query_circle(query);
        result
            .ids
            .iter()
            .filter_map(|id| map.landmark(*id))
            .map(|lm| Candidate {
                id: lm.id,
                position: lm.position,
                descriptor: lm.descriptor,
            })
            .collect()
    }

    fn camera_for(&self, frame: &Frame, image: &GrayImage, config: &LocalizerConfig) -> CameraModel {
        let camera = frame.camera();
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 || config.image_width == 0 || config.image_height == 0 {
            return camera;
        }
        if (w, h) == (config.image_width, config.image_height) {
            return camera;
        }
        camera.scaled(
            w as f64 / config.image_width as f64,
            h as f64 / config.image_height as f64,
        )
    }
}
