//! Core ID types and small value types for the landmark map.

use serde::{Deserialize, Serialize};

/// Unique identifier for a Landmark within a Map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LandmarkId(pub u64);

impl LandmarkId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for LandmarkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LM{}", self.0)
    }
}

/// Unique identifier for an Anchor within a Map.
///
/// Assigned sequentially from 1 and never reused, so a stale id held by a
/// caller can not alias a newer anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnchorId(pub u64);

impl AnchorId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for AnchorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "A{}", self.0)
    }
}

/// Handle returned when registering a map observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub u64);

/// Directed edge between two anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub start: AnchorId,
    pub goal: AnchorId,
}

impl Edge {
    pub fn new(start: AnchorId, goal: AnchorId) -> Self {
        Self { start, goal }
    }
}

/// Axis-aligned rectangle on the ground plane (x, z).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds2 {
    pub min: [f64; 2],
    pub max: [f64; 2],
}

impl Bounds2 {
    /// Degenerate bounds around a single ground-plane point.
    pub fn from_point(x: f64, z: f64) -> Self {
        Self {
            min: [x, z],
            max: [x, z],
        }
    }

    /// Grow to include `(x, z)`.
    pub fn extend(&mut self, x: f64, z: f64) {
        self.min[0] = self.min[0].min(x);
        self.min[1] = self.min[1].min(z);
        self.max[0] = self.max[0].max(x);
        self.max[1] = self.max[1].max(z);
    }

    pub fn contains(&self, x: f64, z: f64) -> bool {
        x >= self.min[0] && x <= self.max[0] && z >= self.min[1] && z <= self.max[1]
    }

    pub fn scaled(&self, factor: f64) -> Self {
        let (a, b) = (
            [self.min[0] * factor, self.min[1] * factor],
            [self.max[0] * factor, self.max[1] * factor],
        );
        // negative factors swap the corners
        Self {
            min: [a[0].min(b[0]), a[1].min(b[1])],
            max: [a[0].max(b[0]), a[1].max(b[1])],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(format!("{}", LandmarkId::new(123)), "LM123");
        assert_eq!(format!("{}", AnchorId::new(7)), "A7");
    }

    #[test]
    fn test_bounds_extend() {
        let mut b = Bounds2::from_point(1.0, 2.0);
        b.extend(-1.0, 5.0);

        assert_eq!(b.min, [-1.0, 2.0]);
        assert_eq!(b.max, [1.0, 5.0]);
        assert!(b.contains(0.0, 3.0));
        assert!(!b.contains(0.0, 6.0));
    }
}
