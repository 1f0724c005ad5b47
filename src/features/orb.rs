//! ORB feature extraction through OpenCV (optional `opencv` feature).

use anyhow::{Context, Result};
use image::GrayImage;
use nalgebra::Vector2;
use opencv::core::{KeyPoint, Mat, Ptr, Vector};
use opencv::features2d;
use opencv::prelude::*;
use parking_lot::Mutex;

use super::{Descriptor, Feature, FeatureExtractor};

pub struct OrbExtractor {
    // detect_and_compute takes &mut self
    orb: Mutex<Ptr<features2d::ORB>>,
}

// SAFETY: the ORB handle is only ever used behind the mutex.
unsafe impl Send for OrbExtractor {}
unsafe impl Sync for OrbExtractor {}

impl OrbExtractor {
    pub fn new(n_features: i32) -> Result<Self> {
        let orb = features2d::ORB::create(
            n_features,
            1.2,
            8,
            31,
            0,
            2,
            features2d::ORB_ScoreType::HARRIS_SCORE,
            31,
            20,
        )?;
        Ok(Self {
            orb: Mutex::new(orb),
        })
    }
}

impl FeatureExtractor for OrbExtractor {
    fn extract(&self, image: &GrayImage) -> Result<Vec<Feature>> {
        let flat = Mat::from_slice(image.as_raw())?;
        let mat = flat
            .reshape(1, image.height() as i32)
            .context("reshaping image buffer")?
            .try_clone()?;

        let mut keypoints = Vector::<KeyPoint>::new();
        let mut descriptors = Mat::default();
        let mask = Mat::default();
        self.orb
            .lock()
            .detect_and_compute(&mat, &mask, &mut keypoints, &mut descriptors, false)?;

        let mut features = Vec::with_capacity(keypoints.len());
        for (i, kp) in keypoints.iter().enumerate() {
            let row = descriptors.at_row::<u8>(i as i32)?;
            let Some(descriptor) = Descriptor::from_slice(row) else {
                continue;
            };
            features.push(Feature::new(
                Vector2::new(kp.pt().x as f64, kp.pt().y as f64),
                descriptor,
            ));
        }
        Ok(features)
    }
}
