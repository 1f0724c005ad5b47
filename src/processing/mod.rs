//! Offline processing of a capture into a finished, globally aligned map.

pub mod alignment;
pub mod consolidation;
pub mod map_processor;

pub use alignment::{estimate_alignment, AlignmentConfig, GlobalAlignment};
pub use consolidation::{consolidate, ConsolidationConfig, ConsolidationStats};
pub use map_processor::{MapProcessor, MapProcessorConfig, ProcessReport};
