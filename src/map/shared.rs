//! Shared handle to a map.
//!
//! The mapper, the processor, the localizer and the tracker all reach the
//! same map through a `SharedMap`. Access discipline:
//! - Readers (localization, point conversion) take short read locks
//! - Mutations (anchors, edges, origin, sighting updates) take the write lock
//! - Observers run under the write lock and must not re-lock the map

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::map::Map;

#[derive(Clone, Default)]
pub struct SharedMap(Arc<RwLock<Map>>);

impl SharedMap {
    pub fn new(map: Map) -> Self {
        Self(Arc::new(RwLock::new(map)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Map> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Map> {
        self.0.write()
    }

    /// Unwrap the map when this is the last handle.
    pub fn try_into_inner(self) -> Result<Map, SharedMap> {
        Arc::try_unwrap(self.0)
            .map(RwLock::into_inner)
            .map_err(SharedMap)
    }

    pub fn ptr_eq(&self, other: &SharedMap) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Map> for SharedMap {
    fn from(map: Map) -> Self {
        Self::new(map)
    }
}

impl std::fmt::Debug for SharedMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SharedMap").field(&*self.0.read()).finish()
    }
}
