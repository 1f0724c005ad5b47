//! Image features: binary descriptors, the pluggable extractor seam and
//! descriptor matching against map landmarks.

pub mod matcher;
#[cfg(feature = "opencv")]
pub mod orb;

use image::GrayImage;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

pub use matcher::{match_features, DescriptorMatch, MatcherConfig, NN_RATIO, TH_HIGH, TH_LOW};
#[cfg(feature = "opencv")]
pub use orb::OrbExtractor;

/// Length of a binary descriptor in bytes (256 bits, ORB-sized).
pub const DESCRIPTOR_BYTES: usize = 32;

/// 256-bit binary feature descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor(pub [u8; DESCRIPTOR_BYTES]);

impl Descriptor {
    pub fn zeros() -> Self {
        Self([0; DESCRIPTOR_BYTES])
    }

    /// Hamming distance: number of differing bits.
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }

    /// Build from a byte slice; `None` unless exactly 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; DESCRIPTOR_BYTES] = bytes.try_into().ok()?;
        Some(Self(array))
    }
}

impl Default for Descriptor {
    fn default() -> Self {
        Self::zeros()
    }
}

/// A detected image feature.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    /// Pixel position (u, v).
    pub pixel: Vector2<f64>,
    pub descriptor: Descriptor,
}

impl Feature {
    pub fn new(pixel: Vector2<f64>, descriptor: Descriptor) -> Self {
        Self { pixel, descriptor }
    }
}

/// Detects features and computes descriptors on a grayscale image.
///
/// Implementations must be shareable across the tracking and measurement
/// threads.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, image: &GrayImage) -> anyhow::Result<Vec<Feature>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hamming_distance() {
        let a = Descriptor::zeros();
        let mut bytes = [0u8; DESCRIPTOR_BYTES];
        bytes[0] = 0b1011_0000;
        bytes[31] = 0xFF;
        let b = Descriptor(bytes);

        assert_eq!(a.distance(&a), 0);
        assert_eq!(a.distance(&b), 11);
        assert_eq!(b.distance(&a), 11);
    }

    #[test]
    fn test_from_slice_length() {
        assert!(Descriptor::from_slice(&[1u8; 32]).is_some());
        assert!(Descriptor::from_slice(&[1u8; 31]).is_none());
    }
}
