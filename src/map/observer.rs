//! Batched change notifications for map observers.
//!
//! Every mutating [`Map`](super::Map) call produces at most one
//! [`MapChangeSet`]. Calls made inside [`Map::batch`](super::Map::batch) are
//! coalesced and delivered once, when the outermost batch ends.

use crate::geometry::SE3;

use super::anchor::Anchor;
use super::types::Edge;

/// One kind of change, carrying every item of that kind in the change set.
#[derive(Debug, Clone, PartialEq)]
pub enum MapEvent {
    AnchorsAdded(Vec<Anchor>),
    AnchorsUpdated(Vec<Anchor>),
    AnchorsRemoved(Vec<Anchor>),
    EdgesAdded(Vec<Edge>),
    EdgesRemoved(Vec<Edge>),
    OriginChanged(SE3),
}

/// Changes produced by one mutation or one batch, in a fixed kind order:
/// added anchors, updated anchors, added edges, removed edges, removed
/// anchors, origin. Edge changes are net: an edge removed and re-added in
/// the same batch appears in neither list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapChangeSet {
    pub events: Vec<MapEvent>,
}

impl MapChangeSet {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Total number of items across all events.
    pub fn len(&self) -> usize {
        self.events
            .iter()
            .map(|e| match e {
                MapEvent::AnchorsAdded(a) | MapEvent::AnchorsUpdated(a) | MapEvent::AnchorsRemoved(a) => {
                    a.len()
                }
                MapEvent::EdgesAdded(e) | MapEvent::EdgesRemoved(e) => e.len(),
                MapEvent::OriginChanged(_) => 1,
            })
            .sum()
    }

    pub fn removed_edges(&self) -> impl Iterator<Item = &Edge> {
        self.events
            .iter()
            .filter_map(|e| match e {
                MapEvent::EdgesRemoved(edges) => Some(edges),
                _ => None,
            })
            .flatten()
    }
}

/// Receives map change sets.
///
/// Called synchronously from the mutating thread while the map is borrowed
/// mutably (under the write lock for a shared map). Implementations must not
/// lock the same shared map.
pub trait MapObserver: Send + Sync {
    fn on_map_changes(&self, changes: &MapChangeSet);
}

/// Accumulates changes until delivery.
#[derive(Debug, Default)]
pub(crate) struct PendingChanges {
    anchors_added: Vec<Anchor>,
    anchors_updated: Vec<Anchor>,
    anchors_removed: Vec<Anchor>,
    edges_added: Vec<Edge>,
    edges_removed: Vec<Edge>,
    origin: Option<SE3>,
}

impl PendingChanges {
    pub fn anchor_added(&mut self, anchor: Anchor) {
        self.anchors_added.push(anchor);
    }

    pub fn anchor_updated(&mut self, anchor: Anchor) {
        self.anchors_updated.push(anchor);
    }

    pub fn anchor_removed(&mut self, anchor: Anchor) {
        self.anchors_removed.push(anchor);
    }

    /// An add cancels a pending removal of the same edge: the edge existed
    /// before the batch and still does.
    pub fn edge_added(&mut self, edge: Edge) {
        if let Some(i) = self.edges_removed.iter().position(|e| *e == edge) {
            self.edges_removed.swap_remove(i);
        } else {
            self.edges_added.push(edge);
        }
    }

    /// A removal cancels a pending add of the same edge.
    pub fn edge_removed(&mut self, edge: Edge) {
        if let Some(i) = self.edges_added.iter().position(|e| *e == edge) {
            self.edges_added.swap_remove(i);
        } else {
            self.edges_removed.push(edge);
        }
    }

    pub fn origin_changed(&mut self, origin: SE3) {
        self.origin = Some(origin);
    }

    /// Drain into a change set (empty if nothing was recorded).
    pub fn take(&mut self) -> MapChangeSet {
        let pending = std::mem::take(self);
        let mut events = Vec::new();
        if !pending.anchors_added.is_empty() {
            events.push(MapEvent::AnchorsAdded(pending.anchors_added));
        }
        if !pending.anchors_updated.is_empty() {
            events.push(MapEvent::AnchorsUpdated(pending.anchors_updated));
        }
        if !pending.edges_added.is_empty() {
            events.push(MapEvent::EdgesAdded(pending.edges_added));
        }
        if !pending.edges_removed.is_empty() {
            events.push(MapEvent::EdgesRemoved(pending.edges_removed));
        }
        if !pending.anchors_removed.is_empty() {
            events.push(MapEvent::AnchorsRemoved(pending.anchors_removed));
        }
        if let Some(origin) = pending.origin {
            events.push(MapEvent::OriginChanged(origin));
        }
        MapChangeSet { events }
    }
}
