//! Capture-time recording: frames, feature observations, VIO positions and
//! GPS fixes, collected into [`MapperData`] for the map processor.

pub mod data;
pub mod location_matcher;
pub mod mapper;

pub use data::{FeatureObservation, GpsObservation, MapperData};
pub use location_matcher::{GpsFix, LocationMatcher};
pub use mapper::Mapper;
