//! Brute-force descriptor matching between map landmarks and image features.
//!
//! For every landmark the closest and second-closest image descriptor are
//! found. A match is accepted when it passes the absolute distance threshold
//! and the nearest-neighbour ratio test, after which conflicts are resolved so
//! each image feature is used by at most one landmark.

use std::collections::HashMap;

use super::{Descriptor, Feature};

/// Matching thresholds (binary descriptors, 256 bits).
pub const TH_HIGH: u32 = 100; // Max descriptor distance for acceptance
pub const TH_LOW: u32 = 50; // Stricter threshold
pub const NN_RATIO: f32 = 0.75; // Ratio test threshold (best/second_best)

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Maximum accepted Hamming distance.
    pub max_distance: u32,
    /// Best-to-second-best ratio; 1.0 disables the test.
    pub nn_ratio: f32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            max_distance: TH_HIGH,
            nn_ratio: NN_RATIO,
        }
    }
}

/// A landmark-to-feature correspondence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorMatch {
    /// Index into the landmark descriptor slice.
    pub landmark_idx: usize,
    /// Index into the feature slice.
    pub feature_idx: usize,
    pub distance: u32,
}

/// Match landmark descriptors against extracted features, one-to-one.
///
/// Results are sorted by landmark index.
pub fn match_features(
    landmarks: &[Descriptor],
    features: &[Feature],
    config: &MatcherConfig,
) -> Vec<DescriptorMatch> {
    if landmarks.is_empty() || features.is_empty() {
        return Vec::new();
    }

    // feature_idx -> best landmark claiming it
    let mut claims: HashMap<usize, DescriptorMatch> = HashMap::new();

    for (landmark_idx, descriptor) in landmarks.iter().enumerate() {
        let mut best_dist = u32::MAX;
        let mut second_best_dist = u32::MAX;
        let mut best_idx: Option<usize> = None;

        for (feature_idx, feature) in features.iter().enumerate() {
            let dist = descriptor.distance(&feature.descriptor);
            if dist < best_dist {
                second_best_dist = best_dist;
                best_dist = dist;
                best_idx = Some(feature_idx);
            } else if dist < second_best_dist {
                second_best_dist = dist;
            }
        }

        if best_dist > config.max_distance {
            continue;
        }
        if features.len() > 1 && (best_dist as f32) > config.nn_ratio * (second_best_dist as f32) {
            continue;
        }

        let Some(feature_idx) = best_idx else {
            continue;
        };
        let candidate = DescriptorMatch {
            landmark_idx,
            feature_idx,
            distance: best_dist,
        };
        claims
            .entry(feature_idx)
            .and_modify(|existing| {
                if candidate.distance < existing.distance {
                    *existing = candidate;
                }
            })
            .or_insert(candidate);
    }

    let mut matches: Vec<DescriptorMatch> = claims.into_values().collect();
    matches.sort_by_key(|m| m.landmark_idx);
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector2;

    fn descriptor(seed: u8) -> Descriptor {
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = seed.wrapping_mul(31).wrapping_add((i as u8).wrapping_mul(seed | 1));
        }
        Descriptor(bytes)
    }

    fn flip_bits(d: &Descriptor, n: usize) -> Descriptor {
        let mut bytes = d.0;
        for i in 0..n {
            bytes[i / 8] ^= 1 << (i % 8);
        }
        Descriptor(bytes)
    }

    fn feature(d: Descriptor) -> Feature {
        Feature::new(Vector2::new(10.0, 20.0), d)
    }

    #[test]
    fn test_matches_nearest_descriptor() {
        let landmarks = vec![descriptor(3), descriptor(90)];
        let features = vec![
            feature(flip_bits(&descriptor(90), 4)),
            feature(flip_bits(&descriptor(3), 2)),
        ];

        let matches = match_features(&landmarks, &features, &MatcherConfig::default());

        assert_eq!(matches.len(), 2);
        assert_eq!((matches[0].landmark_idx, matches[0].feature_idx), (0, 1));
        assert_eq!(matches[0].distance, 2);
        assert_eq!((matches[1].landmark_idx, matches[1].feature_idx), (1, 0));
    }

    #[test]
    fn test_distance_threshold() {
        let landmarks = vec![Descriptor([0x00; 32])];
        let features = vec![feature(Descriptor([0xFF; 32]))];

        assert!(match_features(&landmarks, &features, &MatcherConfig::default()).is_empty());
    }

    #[test]
    fn test_ambiguous_match_rejected_by_ratio() {
        let base = Descriptor([0x00; 32]);
        let landmarks = vec![base];
        let features = vec![feature(flip_bits(&base, 10)), feature(flip_bits(&base, 11))];

        assert!(match_features(&landmarks, &features, &MatcherConfig::default()).is_empty());
    }

    #[test]
    fn test_one_to_one_keeps_closest_landmark() {
        let base = Descriptor([0x00; 32]);
        let landmarks = vec![flip_bits(&base, 6), flip_bits(&base, 1)];
        let features = vec![feature(base)];

        let matches = match_features(&landmarks, &features, &MatcherConfig::default());

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].landmark_idx, 1);
    }
}
