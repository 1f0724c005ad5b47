//! Capture-time recorder.
//!
//! The mapper only appends: frames, their feature observations, VIO positions
//! and GPS fixes, plus user-placed anchors. Landmark fusion and global
//! alignment happen later in the map processor.

use std::path::{Path, PathBuf};

use anyhow::Result;
use nalgebra::Vector3;
use tracing::{debug, info, warn};

use crate::frame::Frame;
use crate::geometry::{GeoReference, SE3};
use crate::map::Anchor;

use super::data::{FeatureObservation, GpsObservation, MapperData};
use super::location_matcher::{GpsFix, LocationMatcher};

pub struct Mapper {
    directory: PathBuf,
    data: MapperData,
    matcher: LocationMatcher,
}

impl Mapper {
    /// New empty capture stored under `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            data: MapperData::new(),
            matcher: LocationMatcher::new(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn data(&self) -> &MapperData {
        &self.data
    }

    /// Hand the capture over to processing.
    pub fn into_data(self) -> MapperData {
        self.data
    }

    /// Append a captured frame. Frame ids must be unique.
    pub fn add_frame(&mut self, frame: Frame) -> bool {
        if self.data.frame(frame.id).is_some() {
            warn!("[Mapper] duplicate frame id {}", frame.id);
            return false;
        }
        self.data.frames.push(frame);
        true
    }

    /// Attach feature observations to an already added frame.
    pub fn add_observations(&mut self, frame_id: u64, observations: Vec<FeatureObservation>) -> bool {
        if self.data.frame(frame_id).is_none() {
            warn!("[Mapper] observations for unknown frame {}", frame_id);
            return false;
        }
        self.data
            .observations
            .entry(frame_id)
            .or_default()
            .extend(observations);
        true
    }

    /// Record a VIO camera position.
    pub fn add_position(&mut self, position: Vector3<f64>, timestamp_ns: u64) {
        self.matcher.observe_position(position, timestamp_ns);
        self.collect_matches();
    }

    /// Record a GPS fix. The first fix becomes the geodetic reference of the
    /// map unless one is already set.
    pub fn add_location(&mut self, fix: GpsFix) {
        {
            let mut map = self.data.map.write();
            if map.geo_reference().is_none() {
                info!(
                    "[Mapper] geodetic reference ({:.6}, {:.6})",
                    fix.coordinate.latitude, fix.coordinate.longitude
                );
                map.set_geo_reference(Some(GeoReference::new(fix.coordinate)));
            }
        }
        self.matcher.observe_fix(fix);
        self.collect_matches();
    }

    pub fn create_anchor(&mut self, transform: SE3) -> Anchor {
        self.data.map.write().create_anchor(transform)
    }

    /// Persist the capture into the mapper directory.
    pub fn write_metadata(&self) -> Result<()> {
        self.data.write(&self.directory)
    }

    /// Replace the in-memory capture with the one stored in the mapper
    /// directory. On error the current capture is kept.
    pub fn read_metadata(&mut self) -> Result<()> {
        self.data = MapperData::read(&self.directory)?;
        self.matcher = LocationMatcher::new();
        Ok(())
    }

    fn collect_matches(&mut self) {
        let matches = self.matcher.matches();
        if matches.is_empty() {
            return;
        }
        let Some(reference) = self.data.map.read().geo_reference().copied() else {
            return;
        };
        for (fix, relative) in matches {
            let global = reference.to_local(&fix.coordinate);
            debug!(
                "[Mapper] GPS observation at {} ns: relative {:?}, global {:?}",
                fix.timestamp_ns, relative, global
            );
            self.data.gps_observations.push(GpsObservation {
                relative,
                global,
                accuracy: fix.accuracy,
                timestamp_ns: fix.timestamp_ns,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Descriptor;
    use crate::geometry::GeoCoordinate;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Matrix4, Vector2};

    fn frame(id: u64) -> Frame {
        Frame::new(id, id * 100, Matrix3::identity(), Matrix4::identity())
    }

    #[test]
    fn test_observations_need_frame() {
        let mut mapper = Mapper::new("unused");
        let obs = vec![FeatureObservation::new(
            Vector2::zeros(),
            Vector3::new(0.0, 0.0, -1.0),
            Descriptor::zeros(),
        )];

        assert!(!mapper.add_observations(3, obs.clone()));
        assert!(mapper.add_frame(frame(3)));
        assert!(!mapper.add_frame(frame(3)));
        assert!(mapper.add_observations(3, obs.clone()));
        assert!(mapper.add_observations(3, obs));
        assert_eq!(mapper.data().num_observations(), 2);
    }

    #[test]
    fn test_location_paired_with_position() {
        let mut mapper = Mapper::new("unused");
        let origin = GeoCoordinate::new(35.0, 139.0, 10.0);

        mapper.add_position(Vector3::new(0.0, 0.0, 0.0), 1_000);
        mapper.add_location(GpsFix::new(origin, 3.0, 1_500));
        assert!(mapper.data().gps_observations.is_empty());

        mapper.add_position(Vector3::new(2.0, 0.0, 0.0), 2_000);
        let observations = &mapper.data().gps_observations;

        assert_eq!(observations.len(), 1);
        assert_relative_eq!(observations[0].relative, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-12);
        // The first fix is the reference, so it sits at the local origin.
        assert_relative_eq!(observations[0].global, Vector3::zeros(), epsilon = 1e-6);
        assert_eq!(observations[0].accuracy, 3.0);
        assert!(mapper.data().map.read().geo_reference().is_some());
    }

    #[test]
    fn test_metadata_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut mapper = Mapper::new(dir.path());
        mapper.add_frame(frame(1));
        let anchor = mapper.create_anchor(SE3::from_translation(Vector3::new(0.0, 1.0, 0.0)));
        mapper.write_metadata().unwrap();

        let mut restored = Mapper::new(dir.path());
        restored.read_metadata().unwrap();

        assert_eq!(restored.data().frames.len(), 1);
        assert!(restored.data().map.read().anchor(anchor.id).is_some());
    }

    #[test]
    fn test_failed_read_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut mapper = Mapper::new(dir.path());
        mapper.add_frame(frame(1));

        assert!(mapper.read_metadata().is_err());
        assert_eq!(mapper.data().frames.len(), 1);
    }
}
