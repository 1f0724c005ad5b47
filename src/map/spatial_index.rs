//! Ground-plane spatial index over map landmarks.
//!
//! Landmarks are stored in an R-tree keyed by their (x, z) position so a
//! localization attempt only considers landmarks near the expected camera
//! position:
//! - Radius queries are inclusive at the boundary (distance ≤ radius)
//! - The index is built from a map snapshot and kept in sync incrementally

use std::collections::HashMap;

use rstar::{PointDistance, RTree, RTreeObject, AABB};

use super::landmark::Landmark;
use super::map::Map;
use super::types::LandmarkId;

/// A circular ground-plane query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialQuery {
    pub center_x: f64,
    pub center_z: f64,
    pub diameter: f64,
}

impl SpatialQuery {
    pub fn new(center_x: f64, center_z: f64, diameter: f64) -> Self {
        Self {
            center_x,
            center_z,
            diameter,
        }
    }

    pub fn radius(&self) -> f64 {
        self.diameter * 0.5
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpatialQueryResult {
    /// Matching landmark ids, ascending.
    pub ids: Vec<LandmarkId>,
    pub count: usize,
}

/// A landmark's ground-plane position in the R-tree.
#[derive(Clone, Debug, PartialEq)]
struct IndexedLandmark {
    id: LandmarkId,
    ground: [f64; 2],
}

impl RTreeObject for IndexedLandmark {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.ground)
    }
}

impl PointDistance for IndexedLandmark {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.ground[0] - point[0];
        let dz = self.ground[1] - point[1];
        dx * dx + dz * dz
    }
}

#[derive(Clone, Default)]
pub struct SpatialIndex {
    tree: RTree<IndexedLandmark>,
    positions: HashMap<LandmarkId, [f64; 2]>,
}

impl SpatialIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from every landmark currently in the map.
    pub fn from_map(map: &Map) -> Self {
        Self::from_landmarks(map.landmarks())
    }

    pub fn from_landmarks<'a>(landmarks: impl IntoIterator<Item = &'a Landmark>) -> Self {
        let indexed: Vec<IndexedLandmark> = landmarks
            .into_iter()
            .map(|lm| IndexedLandmark {
                id: lm.id,
                ground: lm.ground_position(),
            })
            .collect();
        let positions = indexed.iter().map(|i| (i.id, i.ground)).collect();

        Self {
            tree: RTree::bulk_load(indexed),
            positions,
        }
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// Insert or move a landmark.
    pub fn insert(&mut self, landmark: &Landmark) {
        self.remove(landmark.id);
        let ground = landmark.ground_position();
        self.positions.insert(landmark.id, ground);
        self.tree.insert(IndexedLandmark {
            id: landmark.id,
            ground,
        });
    }

    pub fn remove(&mut self, id: LandmarkId) -> bool {
        let Some(ground) = self.positions.remove(&id) else {
            return false;
        };
        self.tree.remove(&IndexedLandmark { id, ground }).is_some()
    }

    /// Landmarks whose ground-plane position lies within the query circle.
    pub fn query(&self, center_x: f64, center_z: f64, diameter: f64) -> SpatialQueryResult {
        if !(diameter >= 0.0) {
            return SpatialQueryResult::default();
        }
        let radius = diameter * 0.5;
        let radius_sq = radius * radius;
        let center = [center_x, center_z];
        let envelope = AABB::from_corners(
            [center_x - radius, center_z - radius],
            [center_x + radius, center_z + radius],
        );

        let mut ids: Vec<LandmarkId> = self
            .tree
            .locate_in_envelope(&envelope)
            .filter(|indexed| indexed.distance_2(&center) <= radius_sq)
            .map(|indexed| indexed.id)
            .collect();
        ids.sort();

        SpatialQueryResult {
            count: ids.len(),
            ids,
        }
    }

    pub fn query_circle(&self, query: &SpatialQuery) -> SpatialQueryResult {
        self.query(query.center_x, query.center_z, query.diameter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Descriptor;
    use nalgebra::Vector3;

    fn landmark(id: u64, x: f64, z: f64) -> Landmark {
        Landmark::new(LandmarkId::new(id), Vector3::new(x, 3.0, z), Descriptor::zeros(), 0)
    }

    #[test]
    fn test_query_ignores_height() {
        let lms = vec![landmark(1, 10.0, 5.0), landmark(2, 40.0, 5.0)];
        let index = SpatialIndex::from_landmarks(&lms);

        let result = index.query(10.0, 5.0, 20.0);
        assert_eq!(result.ids, vec![LandmarkId::new(1)]);
        assert_eq!(result.count, 1);
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let lms = vec![landmark(1, 3.0, 4.0)];
        let index = SpatialIndex::from_landmarks(&lms);

        assert_eq!(index.query(0.0, 0.0, 10.0).count, 1);
        assert_eq!(index.query(0.0, 0.0, 9.999).count, 0);
    }

    #[test]
    fn test_empty_circle() {
        let lms = vec![landmark(1, 3.0, 4.0)];
        let index = SpatialIndex::from_landmarks(&lms);

        let result = index.query(100.0, 100.0, 5.0);
        assert!(result.ids.is_empty());
        assert_eq!(result.count, 0);
    }

    #[test]
    fn test_insert_moves_and_remove() {
        let mut index = SpatialIndex::empty();
        index.insert(&landmark(1, 0.0, 0.0));
        index.insert(&landmark(1, 50.0, 50.0));

        assert_eq!(index.len(), 1);
        assert_eq!(index.query(0.0, 0.0, 2.0).count, 0);
        assert_eq!(index.query(50.0, 50.0, 2.0).count, 1);

        assert!(index.remove(LandmarkId::new(1)));
        assert!(!index.remove(LandmarkId::new(1)));
        assert!(index.is_empty());
    }
}
