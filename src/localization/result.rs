//! Localization outcome and diagnostics.
//!
//! Every call reports what happened at each stage, successful or not:
//! - spatial query candidates
//! - descriptor matches
//! - PnP inliers
//! - gravity agreement
//!
//! Counts are nested: inliers ⊆ matches ⊆ spatial query candidates.

use std::fmt;

use crate::geometry::SE3;
use crate::map::LandmarkId;

/// Why a localization attempt was rejected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocalizeFailure {
    TooFewLandmarks { found: usize, required: usize },
    TooFewMatches { found: usize, required: usize },
    PoseSolveFailed,
    TooFewInliers { found: usize, required: usize },
    GravityMismatch { angle_deg: f64, max_deg: f64 },
}

impl fmt::Display for LocalizeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooFewLandmarks { found, required } => {
                write!(f, "too few landmarks in query ({found} < {required})")
            }
            Self::TooFewMatches { found, required } => {
                write!(f, "too few matches ({found} < {required})")
            }
            Self::PoseSolveFailed => write!(f, "pose solve failed"),
            Self::TooFewInliers { found, required } => {
                write!(f, "too few inliers ({found} < {required})")
            }
            Self::GravityMismatch { angle_deg, max_deg } => {
                write!(f, "gravity mismatch ({angle_deg:.1}° > {max_deg:.1}°)")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalizeDiagnostics {
    pub spatial_query_ids: Vec<LandmarkId>,
    pub spatial_query_count: usize,
    pub matched_ids: Vec<LandmarkId>,
    pub match_count: usize,
    pub inlier_ids: Vec<LandmarkId>,
    pub inlier_count: usize,
    /// Mean reprojection error of the inliers (pixels).
    pub mean_reprojection_error_px: Option<f64>,
    /// Angle between the solved and the VIO up-vectors (degrees).
    pub gravity_angle_deg: Option<f64>,
    pub failure: Option<LocalizeFailure>,
}

impl LocalizeDiagnostics {
    pub fn inlier_ratio(&self) -> f64 {
        if self.match_count == 0 {
            0.0
        } else {
            self.inlier_count as f64 / self.match_count as f64
        }
    }
}

/// Result of one localization attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalizeOutcome {
    /// Camera pose in the map frame (T_map_cam, AR convention) on success.
    pub pose: Option<SE3>,
    pub diagnostics: LocalizeDiagnostics,
}

impl LocalizeOutcome {
    pub fn success(&self) -> bool {
        self.pose.is_some()
    }

    pub(crate) fn failed(mut diagnostics: LocalizeDiagnostics, failure: LocalizeFailure) -> Self {
        diagnostics.failure = Some(failure);
        Self {
            pose: None,
            diagnostics,
        }
    }
}
