//! Top-level configuration, loadable from YAML.
//!
//! Every section is optional in the file; missing fields take their defaults.
//! ```yaml
//! localizer:
//!   min_inliers: 10
//! tracker:
//!   measurement_interval_s: 1.5
//! processor:
//!   target_scale: 1.0
//!   consolidation:
//!     merge_radius: 0.05
//! ```

use std::fs::File;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::localization::LocalizerConfig;
use crate::processing::MapProcessorConfig;
use crate::tracking::FilteredTrackerConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LarConfig {
    pub localizer: LocalizerConfig,
    pub tracker: FilteredTrackerConfig,
    pub processor: MapProcessorConfig,
}

impl LarConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let config: LarConfig = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: LarConfig = serde_yaml::from_str(yaml).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config")
    }

    /// Reject values that would make a component misbehave silently.
    pub fn validate(&self) -> Result<()> {
        let l = &self.localizer;
        if l.image_width == 0 || l.image_height == 0 {
            bail!("localizer image size must be non-zero");
        }
        if !(l.reprojection_threshold_px > 0.0) {
            bail!("localizer reprojection threshold must be positive");
        }
        if !(l.ransac_confidence > 0.0 && l.ransac_confidence < 1.0) {
            bail!("localizer RANSAC confidence must be in (0, 1)");
        }

        let t = &self.tracker;
        if !(t.measurement_interval_s.is_finite() && t.measurement_interval_s >= 0.0) {
            bail!("tracker measurement interval must be finite and non-negative");
        }
        if !(t.measurement_rotation_sigma_deg > 0.0 && t.measurement_translation_sigma_m > 0.0) {
            bail!("tracker measurement noise must be positive");
        }
        if !(t.gate_chi2 > 0.0) {
            bail!("tracker gate must be positive");
        }

        let p = &self.processor;
        if !(p.consolidation.merge_radius > 0.0) {
            bail!("consolidation merge radius must be positive");
        }
        if let Some(scale) = p.target_scale {
            if !(scale.is_finite() && scale > 0.0) {
                bail!("target scale must be positive, got {}", scale);
            }
        }
        Ok(())
    }
}
