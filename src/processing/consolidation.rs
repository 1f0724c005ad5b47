//! Landmark consolidation: turn per-frame feature observations into a set of
//! merged, re-recognizable landmarks.
//!
//! Each observation is lifted into the map frame through its frame pose. It
//! joins an existing landmark when one lies within `merge_radius` and has a
//! close enough descriptor, otherwise it starts a new one.

use std::collections::{BTreeMap, HashMap};

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::features::TH_LOW;
use crate::frame::Frame;
use crate::map::{Bounds2, Landmark, LandmarkId, Map, SpatialIndex, UsabilityPolicy};
use crate::mapping::FeatureObservation;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Maximum 3D distance (metres) between an observation and the landmark it
    /// is merged into.
    pub merge_radius: f64,
    /// Maximum Hamming distance for a merge.
    pub max_descriptor_distance: u32,
    /// Landmarks failing this policy are dropped from the finished map.
    pub usability: UsabilityPolicy,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            merge_radius: 0.1,
            max_descriptor_distance: TH_LOW,
            usability: UsabilityPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsolidationStats {
    pub observations: usize,
    pub created: usize,
    pub merged: usize,
    /// Landmarks removed by the usability policy.
    pub dropped: usize,
    pub landmarks: usize,
}

/// Running sums for one landmark.
struct Accumulator {
    position_sum: Vector3<f64>,
    direction_sum: Vector3<f64>,
    count: u32,
}

/// Rebuild the landmark set of `map` from scratch.
///
/// Frames are processed in capture order (timestamp, then id) so the result
/// depends only on the input.
pub fn consolidate(
    map: &mut Map,
    frames: &[Frame],
    observations: &BTreeMap<u64, Vec<FeatureObservation>>,
    config: &ConsolidationConfig,
) -> ConsolidationStats {
    let mut stats = ConsolidationStats::default();
    map.clear_landmarks();

    let mut ordered: Vec<&Frame> = frames.iter().collect();
    ordered.sort_by_key(|f| (f.timestamp_ns, f.id));

    let mut index = SpatialIndex::empty();
    let mut accumulators: HashMap<LandmarkId, Accumulator> = HashMap::new();
    let mut newest_ns = 0u64;

    for frame in ordered {
        let Some(frame_observations) = observations.get(&frame.id) else {
            continue;
        };
        newest_ns = newest_ns.max(frame.timestamp_ns);
        let pose = frame.pose();
        let camera_position = pose.translation;

        for obs in frame_observations {
            stats.observations += 1;
            let position = pose.transform_point(&obs.point);
            let direction = (camera_position - position)
                .try_normalize(1e-12)
                .unwrap_or_else(Vector3::zeros);

            match find_merge_target(map, &index, &position, obs, config) {
                Some(id) => {
                    let Some(acc) = accumulators.get_mut(&id) else {
                        continue;
                    };
                    acc.position_sum += position;
                    acc.direction_sum += direction;
                    acc.count += 1;
                    let mean = acc.position_sum / acc.count as f64;
                    let orientation = acc
                        .direction_sum
                        .try_normalize(1e-12)
                        .unwrap_or_else(Vector3::zeros);

                    if let Some(lm) = map.landmark_mut(id) {
                        lm.record_sighting(frame.timestamp_ns);
                        lm.position = mean;
                        lm.orientation = orientation;
                        lm.bounds.extend(camera_position.x, camera_position.z);
                        index.insert(lm);
                    }
                    stats.merged += 1;
                }
                None => {
                    let id = map.next_landmark_id();
                    let mut lm = Landmark::new(id, position, obs.descriptor, frame.timestamp_ns);
                    lm.orientation = direction;
                    lm.bounds = Bounds2::from_point(camera_position.x, camera_position.z);
                    index.insert(&lm);
                    map.insert_landmark(lm);
                    accumulators.insert(
                        id,
                        Accumulator {
                            position_sum: position,
                            direction_sum: direction,
                            count: 1,
                        },
                    );
                    stats.created += 1;
                }
            }
        }
    }

    stats.dropped = map.retain_landmarks(|lm| lm.is_usable(&config.usability, newest_ns));
    stats.landmarks = map.num_landmarks();
    info!(
        "[Consolidation] {} observations -> {} landmarks ({} created, {} merged, {} dropped)",
        stats.observations, stats.landmarks, stats.created, stats.merged, stats.dropped
    );
    stats
}

/// Closest-descriptor landmark within the merge radius. Ties go to the
/// nearer landmark, then the lower id.
fn find_merge_target(
    map: &Map,
    index: &SpatialIndex,
    position: &Vector3<f64>,
    obs: &FeatureObservation,
    config: &ConsolidationConfig,
) -> Option<LandmarkId> {
    let nearby = index.query(position.x, position.z, 2.0 * config.merge_radius);
    let mut best: Option<(u32, f64, LandmarkId)> = None;
    for id in nearby.ids {
        let Some(lm) = map.landmark(id) else {
            continue;
        };
        let dist = (lm.position - position).norm();
        if dist > config.merge_radius {
            continue;
        }
        let hamming = lm.descriptor.distance(&obs.descriptor);
        if hamming > config.max_descriptor_distance {
            continue;
        }
        let candidate = (hamming, dist, id);
        if best.map_or(true, |b| candidate < b) {
            best = Some(candidate);
        }
    }
    if let Some((hamming, dist, id)) = best {
        debug!("[Consolidation] merge into {} (hamming {}, {:.3} m)", id, hamming, dist);
    }
    best.map(|(_, _, id)| id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Descriptor;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Matrix4, Vector2};

    fn frame(id: u64, camera: Vector3<f64>) -> Frame {
        Frame::new(id, id * 1_000, Matrix3::identity(), Matrix4::new_translation(&camera))
    }

    fn obs(point: Vector3<f64>, byte: u8) -> FeatureObservation {
        FeatureObservation::new(Vector2::zeros(), point, Descriptor([byte; 32]))
    }

    #[test]
    fn test_merges_repeated_sightings() {
        // The same world point (0, 0, -3) seen from three camera positions.
        let frames = vec![
            frame(0, Vector3::new(0.0, 0.0, 0.0)),
            frame(1, Vector3::new(1.0, 0.0, 0.0)),
            frame(2, Vector3::new(-1.0, 0.0, 0.0)),
        ];
        let mut observations = BTreeMap::new();
        observations.insert(0, vec![obs(Vector3::new(0.0, 0.0, -3.0), 0xAA)]);
        observations.insert(1, vec![obs(Vector3::new(-1.0, 0.0, -3.02), 0xAA)]);
        observations.insert(2, vec![obs(Vector3::new(1.0, 0.0, -2.98), 0xAA)]);

        let mut map = Map::new();
        let stats = consolidate(&mut map, &frames, &observations, &ConsolidationConfig::default());

        assert_eq!(stats.created, 1);
        assert_eq!(stats.merged, 2);
        assert_eq!(stats.landmarks, 1);
        let lm = map.landmarks().next().unwrap();
        assert_eq!(lm.sightings, 3);
        assert_eq!(lm.last_seen_ns, 2_000);
        assert_relative_eq!(lm.position, Vector3::new(0.0, 0.0, -3.0), epsilon = 1e-9);
        assert_relative_eq!(lm.orientation.norm(), 1.0, epsilon = 1e-9);
        assert!(lm.orientation.z > 0.9);
        assert_eq!(lm.bounds.min, [-1.0, 0.0]);
        assert_eq!(lm.bounds.max, [1.0, 0.0]);
    }

    #[test]
    fn test_descriptor_mismatch_keeps_apart_and_drops_unusable() {
        let frames = vec![frame(0, Vector3::zeros()), frame(1, Vector3::zeros())];
        let mut observations = BTreeMap::new();
        observations.insert(0, vec![obs(Vector3::new(0.0, 0.0, -3.0), 0x00)]);
        observations.insert(1, vec![obs(Vector3::new(0.0, 0.0, -3.0), 0xFF)]);

        let mut map = Map::new();
        let config = ConsolidationConfig {
            usability: UsabilityPolicy {
                min_sightings: 1,
                max_age_ns: None,
            },
            ..Default::default()
        };
        let stats = consolidate(&mut map, &frames, &observations, &config);
        assert_eq!(stats.created, 2);
        assert_eq!(stats.landmarks, 2);

        let stats = consolidate(&mut map, &frames, &observations, &ConsolidationConfig::default());
        assert_eq!(stats.dropped, 2);
        assert_eq!(map.num_landmarks(), 0);
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let frames: Vec<Frame> = (0..4).map(|i| frame(i, Vector3::new(i as f64 * 0.2, 0.0, 0.0))).collect();
        let mut observations = BTreeMap::new();
        for f in &frames {
            let cam = f.pose().translation;
            observations.insert(
                f.id,
                (0..5)
                    .map(|k| obs(Vector3::new(k as f64 - cam.x, 0.5, -4.0), k as u8 * 40))
                    .collect(),
            );
        }

        let mut map = Map::new();
        consolidate(&mut map, &frames, &observations, &ConsolidationConfig::default());
        let mut first: Vec<Landmark> = map.landmarks().cloned().collect();
        consolidate(&mut map, &frames, &observations, &ConsolidationConfig::default());
        let mut second: Vec<Landmark> = map.landmarks().cloned().collect();
        first.sort_by_key(|lm| lm.id);
        second.sort_by_key(|lm| lm.id);

        assert_eq!(first.len(), 5);
        assert_eq!(first, second);
    }
}
