//! Landmark map: landmarks, anchors, the anchor graph, the origin, change
//! observers, spatial lookup and persistence.

pub mod anchor;
pub mod landmark;
#[allow(clippy::module_inception)]
pub mod map;
pub mod observer;
pub mod persist;
pub mod shared;
pub mod spatial_index;
pub mod types;

pub use anchor::Anchor;
pub use landmark::{Landmark, UsabilityPolicy};
pub use map::Map;
pub use observer::{MapChangeSet, MapEvent, MapObserver};
pub use persist::{load_map, save_map};
pub use shared::SharedMap;
pub use spatial_index::{SpatialIndex, SpatialQuery, SpatialQueryResult};
pub use types::{AnchorId, Bounds2, Edge, LandmarkId, ObserverId};
