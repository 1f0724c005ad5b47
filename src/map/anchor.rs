//! Anchor - an application-placed pose fixed relative to the map.

use serde::{Deserialize, Serialize};

use crate::geometry::SE3;

use super::types::AnchorId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    pub id: AnchorId,
    /// Pose in the map frame.
    pub transform: SE3,
}

impl Anchor {
    pub fn new(id: AnchorId, transform: SE3) -> Self {
        Self { id, transform }
    }
}

/// Serialized form; the transform is stored as a row-major 4x4 matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AnchorRecord {
    pub id: AnchorId,
    pub transform: [[f64; 4]; 4],
}

impl From<&Anchor> for AnchorRecord {
    fn from(anchor: &Anchor) -> Self {
        Self {
            id: anchor.id,
            transform: matrix_rows(&anchor.transform),
        }
    }
}

impl From<&AnchorRecord> for Anchor {
    fn from(record: &AnchorRecord) -> Self {
        Self {
            id: record.id,
            transform: transform_from_rows(&record.transform),
        }
    }
}

pub(crate) fn matrix_rows(transform: &SE3) -> [[f64; 4]; 4] {
    let m = transform.to_matrix();
    let mut rows = [[0.0; 4]; 4];
    for (r, row) in rows.iter_mut().enumerate() {
        for (c, v) in row.iter_mut().enumerate() {
            *v = m[(r, c)];
        }
    }
    rows
}

pub(crate) fn transform_from_rows(rows: &[[f64; 4]; 4]) -> SE3 {
    let m = nalgebra::Matrix4::from_fn(|r, c| rows[r][c]);
    SE3::from_matrix(m)
}
