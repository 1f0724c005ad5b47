//! Filtered tracking: VIO-rate prediction fused with map localizations.
//!
//! - [`FilteredTracker`]: error-state filter over the VIO-to-map transform
//! - [`MeasurementWorker`]: runs measurement updates off the VIO thread
//! - [`MeasurementClock`]: measurement interval gate

pub mod filtered_tracker;
pub mod result;
pub mod scheduler;
pub mod state;

pub use filtered_tracker::{FilteredTracker, FilteredTrackerConfig};
pub use result::{MeasurementRejection, MeasurementResult};
pub use scheduler::{MeasurementClock, MeasurementRequest, MeasurementWorker};
pub use state::TrackerState;
