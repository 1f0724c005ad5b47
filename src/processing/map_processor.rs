//! Offline map processing: consolidation, optional rescale, global alignment.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::map::{save_map, SharedMap};
use crate::mapping::MapperData;

use super::alignment::{estimate_alignment, AlignmentConfig, GlobalAlignment};
use super::consolidation::{consolidate, ConsolidationConfig, ConsolidationStats};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MapProcessorConfig {
    pub consolidation: ConsolidationConfig,
    pub alignment: AlignmentConfig,
    /// Cumulative scale the capture should end up with. `None` leaves the
    /// capture scale as recorded.
    pub target_scale: Option<f64>,
}

/// Summary of one `process` run.
#[derive(Debug, Clone)]
pub struct ProcessReport {
    pub consolidation: ConsolidationStats,
    pub alignment: Option<GlobalAlignment>,
}

pub struct MapProcessor {
    data: MapperData,
    config: MapProcessorConfig,
}

impl MapProcessor {
    pub fn new(data: MapperData, config: MapProcessorConfig) -> Self {
        Self { data, config }
    }

    pub fn map(&self) -> &SharedMap {
        &self.data.map
    }

    pub fn data(&self) -> &MapperData {
        &self.data
    }

    pub fn into_data(self) -> MapperData {
        self.data
    }

    pub fn config(&self) -> &MapProcessorConfig {
        &self.config
    }

    /// Build the finished map from the capture.
    ///
    /// Landmarks are rebuilt from scratch every time, so running this twice on
    /// the same data gives the same map.
    pub fn process(&mut self) -> ProcessReport {
        if let Some(target) = self.config.target_scale {
            if target.is_finite() && target > 0.0 {
                let factor = target / self.data.scale;
                if (factor - 1.0).abs() > 1e-12 {
                    self.rescale(factor);
                }
            } else {
                warn!("[MapProcessor] ignoring invalid target scale {}", target);
            }
        }

        let consolidation = {
            let mut map = self.data.map.write();
            consolidate(
                &mut map,
                &self.data.frames,
                &self.data.observations,
                &self.config.consolidation,
            )
        };
        let alignment = self.update_global_alignment();

        info!(
            "[MapProcessor] {} landmarks, {} anchors, alignment {}",
            consolidation.landmarks,
            self.data.map.read().num_anchors(),
            if alignment.is_some() { "ok" } else { "unavailable" }
        );
        ProcessReport {
            consolidation,
            alignment,
        }
    }

    /// Scale every map-local quantity of the capture by `factor`.
    ///
    /// Frames, observations, GPS relative positions, landmarks and anchors are
    /// all scaled so a later `process` stays consistent. Returns `false` for a
    /// non-positive or non-finite factor.
    pub fn rescale(&mut self, factor: f64) -> bool {
        if !(factor.is_finite() && factor > 0.0) {
            warn!("[MapProcessor] invalid scale factor {}", factor);
            return false;
        }
        for frame in &mut self.data.frames {
            let pose = frame.pose().scaled(factor);
            frame.extrinsics = pose.to_matrix();
        }
        for observations in self.data.observations.values_mut() {
            for obs in observations {
                obs.point *= factor;
            }
        }
        for gps in &mut self.data.gps_observations {
            gps.relative *= factor;
        }
        self.data.map.write().rescale(factor);
        self.data.scale *= factor;
        info!(
            "[MapProcessor] rescaled by {:.4} (cumulative {:.4})",
            factor, self.data.scale
        );
        true
    }

    /// Re-estimate the map origin from the GPS observations.
    ///
    /// The origin is only replaced when an alignment can be estimated.
    pub fn update_global_alignment(&mut self) -> Option<GlobalAlignment> {
        let alignment = estimate_alignment(&self.data.gps_observations, &self.config.alignment)?;
        self.data.map.write().update_origin(alignment.transform);
        info!(
            "[MapProcessor] global alignment from {} / {} GPS observations (rms {:.2} m)",
            alignment.num_inliers(),
            self.data.gps_observations.len(),
            alignment.rms_error_m
        );
        Some(alignment)
    }

    pub fn save_map(&self, directory: impl AsRef<Path>) -> Result<()> {
        save_map(&self.data.map.read(), directory)
    }
}
