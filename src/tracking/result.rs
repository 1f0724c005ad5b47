//! Measurement update results.

use crate::geometry::SE3;
use crate::localization::LocalizeDiagnostics;
use crate::map::LandmarkId;

/// Why a successful localization was not fused.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MeasurementRejection {
    /// Localization itself failed (see the diagnostics).
    LocalizationFailed,
    /// The filter was reset while the measurement was computed.
    ResetDuringMeasurement,
    /// A newer frame has already been fused.
    Stale { frame_ns: u64, last_applied_ns: u64 },
    /// Normalized innovation (squared Mahalanobis distance) above the gate.
    InnovationGate { distance_sq: f64 },
}

/// Outcome of one `measurement_update` call.
#[derive(Debug, Clone)]
pub struct MeasurementResult {
    pub success: bool,
    /// VIO-to-map estimate after the update (unchanged on failure).
    pub transform: SE3,
    /// Measurement confidence in [0, 1]; 0 on failure.
    pub confidence: f64,
    pub matched_landmark_count: usize,
    pub inlier_count: usize,
    pub inlier_ids: Vec<LandmarkId>,
    pub rejection: Option<MeasurementRejection>,
    /// Full localization diagnostics, kept on failure as well.
    pub diagnostics: LocalizeDiagnostics,
}

impl MeasurementResult {
    pub(crate) fn rejected(
        transform: SE3,
        rejection: MeasurementRejection,
        diagnostics: LocalizeDiagnostics,
    ) -> Self {
        Self {
            success: false,
            transform,
            confidence: 0.0,
            matched_landmark_count: 0,
            inlier_count: 0,
            inlier_ids: Vec::new(),
            rejection: Some(rejection),
            diagnostics,
        }
    }
}
