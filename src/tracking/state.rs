//! Filtered tracker state machine.

/// Lifecycle of the VIO-to-map estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerState {
    /// No VIO pose received yet.
    #[default]
    Uninitialized,
    /// VIO poses are flowing but no measurement has been fused.
    Initialized,
    /// A map-aligned estimate exists and is being corrected.
    Tracking,
}
