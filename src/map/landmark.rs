//! Landmark - a persistent, re-recognizable 3D feature point.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::features::Descriptor;

use super::types::{Bounds2, LandmarkId};

/// Thresholds deciding whether a landmark may be offered to the localizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsabilityPolicy {
    /// Minimum number of sightings.
    pub min_sightings: u32,
    /// Maximum age of the newest sighting (nanoseconds). `None` disables it.
    pub max_age_ns: Option<u64>,
}

impl Default for UsabilityPolicy {
    fn default() -> Self {
        Self {
            min_sightings: 3,
            max_age_ns: None,
        }
    }
}

/// A 3D landmark in map-local coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub id: LandmarkId,

    /// Position in the map frame.
    pub position: Vector3<f64>,

    /// Mean viewing direction (unit vector, map frame, landmark to camera).
    pub orientation: Vector3<f64>,

    /// Ground-plane region the landmark was seen from.
    pub bounds: Bounds2,

    /// Timestamp of the newest sighting (ns).
    pub last_seen_ns: u64,

    /// Number of observations merged into this landmark.
    pub sightings: u32,

    /// Set when the landmark was an inlier of a successful localization.
    pub is_matched: bool,

    pub descriptor: Descriptor,
}

impl Landmark {
    /// New landmark from a single sighting.
    pub fn new(
        id: LandmarkId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        timestamp_ns: u64,
    ) -> Self {
        Self {
            id,
            position,
            orientation: Vector3::zeros(),
            bounds: Bounds2::from_point(position.x, position.z),
            last_seen_ns: timestamp_ns,
            sightings: 1,
            is_matched: false,
            descriptor,
        }
    }

    /// Count a sighting at `timestamp_ns`. Recency never moves backwards.
    pub fn record_sighting(&mut self, timestamp_ns: u64) {
        self.sightings = self.sightings.saturating_add(1);
        self.last_seen_ns = self.last_seen_ns.max(timestamp_ns);
    }

    pub fn is_usable(&self, policy: &UsabilityPolicy, now_ns: u64) -> bool {
        if self.sightings < policy.min_sightings {
            return false;
        }
        match policy.max_age_ns {
            Some(max_age) => now_ns.saturating_sub(self.last_seen_ns) <= max_age,
            None => true,
        }
    }

    /// Ground-plane coordinates `(x, z)`.
    pub fn ground_position(&self) -> [f64; 2] {
        [self.position.x, self.position.z]
    }
}
