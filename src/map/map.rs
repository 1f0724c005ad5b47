//! Map - container for landmarks, anchors, the anchor graph and the origin.
//!
//! The Map is the single owner of:
//! - Landmarks (sparse 3D features used for localization)
//! - Anchors (application-placed poses) and the directed edges between them
//! - The origin transform relating map-local to global coordinates
//!
//! Anchors, edges and the origin change only through the methods below, so
//! the edge set can never reference a removed anchor. Those changes are
//! reported to registered observers as batched change sets.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use nalgebra::Vector3;
use tracing::{debug, warn};

use crate::geometry::{GeoCoordinate, GeoReference, SE3};

use super::anchor::Anchor;
use super::landmark::Landmark;
use super::observer::{MapObserver, PendingChanges};
use super::types::{AnchorId, Edge, LandmarkId, ObserverId};

pub struct Map {
    landmarks: HashMap<LandmarkId, Landmark>,
    anchors: HashMap<AnchorId, Anchor>,

    /// Adjacency: start anchor -> goal anchors.
    edges: HashMap<AnchorId, BTreeSet<AnchorId>>,

    /// T_global_map. Meaningful only when `origin_ready`.
    origin: SE3,
    origin_ready: bool,

    /// Geodetic anchor of the global frame, when known.
    geo_reference: Option<GeoReference>,

    next_landmark_id: u64,
    next_anchor_id: u64,

    /// Bumped whenever landmarks are added, removed or moved.
    landmark_revision: u64,

    observers: Vec<(ObserverId, Arc<dyn MapObserver>)>,
    next_observer_id: u64,
    batch_depth: usize,
    pending: PendingChanges,
}

impl Map {
    pub fn new() -> Self {
        Self {
            landmarks: HashMap::new(),
            anchors: HashMap::new(),
            edges: HashMap::new(),
            origin: SE3::identity(),
            origin_ready: false,
            geo_reference: None,
            next_landmark_id: 1,
            next_anchor_id: 1,
            landmark_revision: 0,
            observers: Vec::new(),
            next_observer_id: 0,
            batch_depth: 0,
            pending: PendingChanges::default(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Observers
    // ─────────────────────────────────────────────────────────────────────────

    /// Register an observer. Delivery follows registration order.
    pub fn register_observer(&mut self, observer: Arc<dyn MapObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer_id);
        self.next_observer_id += 1;
        self.observers.push((id, observer));
        id
    }

    pub fn unregister_observer(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        self.observers.len() != before
    }

    /// Run `f` with notifications coalesced into a single change set.
    ///
    /// Batches nest; delivery happens when the outermost batch returns.
    pub fn batch<R>(&mut self, f: impl FnOnce(&mut Map) -> R) -> R {
        self.batch_depth += 1;
        let result = f(self);
        self.batch_depth -= 1;
        self.flush();
        result
    }

    fn flush(&mut self) {
        if self.batch_depth > 0 {
            return;
        }
        let changes = self.pending.take();
        if changes.is_empty() {
            return;
        }
        debug!(
            "[Map] notifying {} observers of {} changes",
            self.observers.len(),
            changes.len()
        );
        for (_, observer) in &self.observers {
            observer.on_map_changes(&changes);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Anchors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_anchor(&mut self, transform: SE3) -> Anchor {
        let anchor = Anchor::new(AnchorId::new(self.next_anchor_id), transform);
        self.next_anchor_id += 1;
        self.anchors.insert(anchor.id, anchor);
        self.pending.anchor_added(anchor);
        self.flush();
        anchor
    }

    /// Replace an anchor's transform. `false` if the anchor does not exist.
    pub fn update_anchor(&mut self, id: AnchorId, transform: SE3) -> bool {
        let Some(anchor) = self.anchors.get_mut(&id) else {
            return false;
        };
        anchor.transform = transform;
        let updated = *anchor;
        self.pending.anchor_updated(updated);
        self.flush();
        true
    }

    /// Remove an anchor and every edge incident to it.
    pub fn remove_anchor(&mut self, id: AnchorId) -> Option<Anchor> {
        let anchor = self.anchors.remove(&id)?;

        let mut removed: BTreeSet<Edge> = BTreeSet::new();
        if let Some(goals) = self.edges.remove(&id) {
            removed.extend(goals.into_iter().map(|goal| Edge::new(id, goal)));
        }
        for (start, goals) in self.edges.iter_mut() {
            if goals.remove(&id) {
                removed.insert(Edge::new(*start, id));
            }
        }
        self.edges.retain(|_, goals| !goals.is_empty());

        for edge in removed {
            self.pending.edge_removed(edge);
        }
        self.pending.anchor_removed(anchor);
        self.flush();
        Some(anchor)
    }

    pub fn anchor(&self, id: AnchorId) -> Option<&Anchor> {
        self.anchors.get(&id)
    }

    /// All anchors, ordered by id.
    pub fn anchors(&self) -> Vec<Anchor> {
        let mut anchors: Vec<Anchor> = self.anchors.values().copied().collect();
        anchors.sort_by_key(|a| a.id);
        anchors
    }

    pub fn num_anchors(&self) -> usize {
        self.anchors.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Edges
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a directed edge. No-op returning `false` for self-loops, missing
    /// endpoints or an existing edge.
    pub fn add_edge(&mut self, start: AnchorId, goal: AnchorId) -> bool {
        if start == goal {
            return false;
        }
        if !self.anchors.contains_key(&start) || !self.anchors.contains_key(&goal) {
            debug!("[Map] add_edge {}->{}: missing endpoint", start, goal);
            return false;
        }
        if !self.edges.entry(start).or_default().insert(goal) {
            return false;
        }
        self.pending.edge_added(Edge::new(start, goal));
        self.flush();
        true
    }

    /// Remove a directed edge. `false` if it was not present.
    pub fn remove_edge(&mut self, start: AnchorId, goal: AnchorId) -> bool {
        let Some(goals) = self.edges.get_mut(&start) else {
            return false;
        };
        if !goals.remove(&goal) {
            return false;
        }
        if goals.is_empty() {
            self.edges.remove(&start);
        }
        self.pending.edge_removed(Edge::new(start, goal));
        self.flush();
        true
    }

    pub fn has_edge(&self, start: AnchorId, goal: AnchorId) -> bool {
        self.edges.get(&start).is_some_and(|g| g.contains(&goal))
    }

    /// Goals reachable in one step from `start`.
    pub fn edges_from(&self, start: AnchorId) -> Vec<AnchorId> {
        self.edges
            .get(&start)
            .map(|g| g.iter().copied().collect())
            .unwrap_or_default()
    }

    /// All edges, ordered by (start, goal).
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self
            .edges
            .iter()
            .flat_map(|(start, goals)| goals.iter().map(|goal| Edge::new(*start, *goal)))
            .collect();
        edges.sort();
        edges
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Origin and coordinate conversion
    // ─────────────────────────────────────────────────────────────────────────

    /// Set T_global_map and mark the origin ready.
    pub fn update_origin(&mut self, origin: SE3) {
        self.origin = origin;
        self.origin_ready = true;
        self.pending.origin_changed(origin);
        self.flush();
    }

    pub fn origin(&self) -> Option<&SE3> {
        self.origin_ready.then_some(&self.origin)
    }

    pub fn is_origin_ready(&self) -> bool {
        self.origin_ready
    }

    /// Map-local point to global coordinates.
    pub fn global_point(&self, relative: &Vector3<f64>) -> Option<Vector3<f64>> {
        let Some(origin) = self.origin() else {
            warn!("[Map] global_point called before the origin is ready");
            return None;
        };
        Some(origin.transform_point(relative))
    }

    /// Global point to map-local coordinates.
    pub fn relative_point(&self, global: &Vector3<f64>) -> Option<Vector3<f64>> {
        let Some(origin) = self.origin() else {
            warn!("[Map] relative_point called before the origin is ready");
            return None;
        };
        Some(origin.inverse().transform_point(global))
    }

    /// Global position of an anchor (anchor transform, then origin).
    pub fn anchor_global_point(&self, id: AnchorId) -> Option<Vector3<f64>> {
        let anchor = self.anchors.get(&id)?;
        self.global_point(&anchor.transform.translation)
    }

    /// Global pose of an anchor.
    pub fn anchor_global_transform(&self, id: AnchorId) -> Option<SE3> {
        let anchor = self.anchors.get(&id)?;
        let origin = self.origin()?;
        Some(origin.compose(&anchor.transform))
    }

    pub fn geo_reference(&self) -> Option<&GeoReference> {
        self.geo_reference.as_ref()
    }

    pub fn set_geo_reference(&mut self, reference: Option<GeoReference>) {
        self.geo_reference = reference;
    }

    /// Latitude/longitude of a map-local point. Needs both a ready origin and
    /// a geodetic reference.
    pub fn geodetic_point(&self, relative: &Vector3<f64>) -> Option<GeoCoordinate> {
        let reference = self.geo_reference.as_ref()?;
        let global = self.global_point(relative)?;
        Some(reference.to_geodetic(&global))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Landmarks
    // ─────────────────────────────────────────────────────────────────────────

    /// Reserve a fresh landmark id.
    pub fn next_landmark_id(&mut self) -> LandmarkId {
        let id = LandmarkId::new(self.next_landmark_id);
        self.next_landmark_id += 1;
        id
    }

    /// Insert (or replace) a landmark under its own id.
    pub fn insert_landmark(&mut self, landmark: Landmark) {
        self.next_landmark_id = self.next_landmark_id.max(landmark.id.0 + 1);
        self.landmarks.insert(landmark.id, landmark);
        self.landmark_revision += 1;
    }

    pub fn remove_landmark(&mut self, id: LandmarkId) -> Option<Landmark> {
        let removed = self.landmarks.remove(&id)?;
        self.landmark_revision += 1;
        Some(removed)
    }

    pub fn landmark(&self, id: LandmarkId) -> Option<&Landmark> {
        self.landmarks.get(&id)
    }

    /// Mutable access; counts as a landmark change since the position may
    /// move.
    pub fn landmark_mut(&mut self, id: LandmarkId) -> Option<&mut Landmark> {
        let landmark = self.landmarks.get_mut(&id)?;
        self.landmark_revision += 1;
        Some(landmark)
    }

    /// Counter that changes whenever the landmark set or a landmark position
    /// may have changed. Spatial indexes compare it to detect staleness.
    pub fn landmark_revision(&self) -> u64 {
        self.landmark_revision
    }

    pub fn landmarks(&self) -> impl Iterator<Item = &Landmark> {
        self.landmarks.values()
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmarks.len()
    }

    pub fn record_sighting(&mut self, id: LandmarkId, timestamp_ns: u64) -> bool {
        match self.landmarks.get_mut(&id) {
            Some(lm) => {
                lm.record_sighting(timestamp_ns);
                true
            }
            None => false,
        }
    }

    pub fn set_matched(&mut self, id: LandmarkId, matched: bool) -> bool {
        match self.landmarks.get_mut(&id) {
            Some(lm) => {
                lm.is_matched = matched;
                true
            }
            None => false,
        }
    }

    /// Keep only landmarks for which `keep` returns true. Returns the number
    /// removed.
    pub fn retain_landmarks(&mut self, mut keep: impl FnMut(&Landmark) -> bool) -> usize {
        let before = self.landmarks.len();
        self.landmarks.retain(|_, lm| keep(lm));
        let removed = before - self.landmarks.len();
        if removed > 0 {
            self.landmark_revision += 1;
        }
        removed
    }

    /// Drop every landmark and restart landmark id allocation at 1.
    ///
    /// Used when the landmark set is rebuilt from scratch, so a rebuild from
    /// the same input hands out the same ids.
    pub fn clear_landmarks(&mut self) {
        self.landmarks.clear();
        self.next_landmark_id = 1;
        self.landmark_revision += 1;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bulk transforms
    // ─────────────────────────────────────────────────────────────────────────

    /// Scale every map-local position by `factor`.
    ///
    /// The origin is left as is; global alignment has to be recomputed.
    pub fn rescale(&mut self, factor: f64) {
        for lm in self.landmarks.values_mut() {
            lm.position *= factor;
            lm.bounds = lm.bounds.scaled(factor);
        }
        self.landmark_revision += 1;
        let mut ids: Vec<AnchorId> = self.anchors.keys().copied().collect();
        ids.sort();
        for id in ids {
            if let Some(anchor) = self.anchors.get_mut(&id) {
                anchor.transform = anchor.transform.scaled(factor);
                let updated = *anchor;
                self.pending.anchor_updated(updated);
            }
        }
        self.flush();
    }

    /// Restore persisted state without notifying observers.
    pub(crate) fn restore(
        &mut self,
        anchors: Vec<Anchor>,
        edges: Vec<Edge>,
        origin: Option<SE3>,
    ) -> anyhow::Result<()> {
        for anchor in anchors {
            if self.anchors.insert(anchor.id, anchor).is_some() {
                anyhow::bail!("duplicate anchor id {}", anchor.id);
            }
            self.next_anchor_id = self.next_anchor_id.max(anchor.id.0 + 1);
        }
        for edge in edges {
            if edge.start == edge.goal {
                anyhow::bail!("self-loop edge on {}", edge.start);
            }
            if !self.anchors.contains_key(&edge.start) || !self.anchors.contains_key(&edge.goal) {
                anyhow::bail!("edge {}->{} references a missing anchor", edge.start, edge.goal);
            }
            self.edges.entry(edge.start).or_default().insert(edge.goal);
        }
        if let Some(origin) = origin {
            self.origin = origin;
            self.origin_ready = true;
        }
        Ok(())
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("landmarks", &self.landmarks.len())
            .field("anchors", &self.anchors.len())
            .field("edges", &self.edges().len())
            .field("origin_ready", &self.origin_ready)
            .field("observers", &self.observers.len())
            .finish()
    }
}
