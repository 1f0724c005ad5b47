//! Camera frames: a timestamped camera sample with intrinsics and pose.
//!
//! `frames.json` stores a list of frames for offline replay:
//! ```json
//! [{ "id": 0, "timestamp": 12.5,
//!    "intrinsics": { "focalLength": 1594.0, "principlePoint": { "x": 952.0, "y": 714.0 } },
//!    "transform": [16 floats, column-major camera-to-world] }]
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{bail, Context, Result};
use nalgebra::{Matrix3, Matrix4};
use serde::{Deserialize, Serialize};

use crate::geometry::{CameraModel, SE3};

/// A camera sample at capture or query time.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub id: u64,
    pub timestamp_ns: u64,
    /// Pinhole K-matrix.
    pub intrinsics: Matrix3<f64>,
    /// Camera-to-world transform, AR camera convention (x right, y up, z back).
    pub extrinsics: Matrix4<f64>,
}

impl Frame {
    pub fn new(id: u64, timestamp_ns: u64, intrinsics: Matrix3<f64>, extrinsics: Matrix4<f64>) -> Self {
        Self {
            id,
            timestamp_ns,
            intrinsics,
            extrinsics,
        }
    }

    pub fn camera(&self) -> CameraModel {
        CameraModel::from_k(&self.intrinsics)
    }

    /// Camera pose (T_world_cam, AR convention).
    pub fn pose(&self) -> SE3 {
        SE3::from_matrix(self.extrinsics)
    }

    /// Load a frame list from a `frames.json` file.
    pub fn load_frames(path: impl AsRef<Path>) -> Result<Vec<Frame>> {
        let path = path.as_ref();
        let reader = BufReader::new(
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
        );
        let records: Vec<FrameRecord> = serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        records
            .into_iter()
            .map(Frame::try_from)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Invalid frame in {}", path.display()))
    }

    /// Write a frame list in the `frames.json` layout.
    pub fn save_frames(frames: &[Frame], path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let records: Vec<FrameRecord> = frames.iter().map(FrameRecord::from).collect();
        let writer = BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        );
        serde_json::to_writer_pretty(writer, &records)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PointRecord {
    x: f64,
    y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntrinsicsRecord {
    focal_length: f64,
    principle_point: PointRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FrameRecord {
    id: u64,
    /// Seconds.
    timestamp: f64,
    intrinsics: IntrinsicsRecord,
    /// Column-major 4x4.
    transform: Vec<f64>,
}

impl TryFrom<FrameRecord> for Frame {
    type Error = anyhow::Error;

    fn try_from(record: FrameRecord) -> Result<Self> {
        if record.transform.len() != 16 {
            bail!(
                "frame {}: transform has {} values, expected 16",
                record.id,
                record.transform.len()
            );
        }
        if !(record.timestamp >= 0.0) {
            bail!("frame {}: invalid timestamp {}", record.id, record.timestamp);
        }
        let f = record.intrinsics.focal_length;
        let pp = &record.intrinsics.principle_point;
        Ok(Frame {
            id: record.id,
            timestamp_ns: (record.timestamp * 1e9).round() as u64,
            intrinsics: Matrix3::new(f, 0.0, pp.x, 0.0, f, pp.y, 0.0, 0.0, 1.0),
            extrinsics: Matrix4::from_column_slice(&record.transform),
        })
    }
}

impl From<&Frame> for FrameRecord {
    fn from(frame: &Frame) -> Self {
        Self {
            id: frame.id,
            timestamp: frame.timestamp_ns as f64 * 1e-9,
            intrinsics: IntrinsicsRecord {
                focal_length: frame.intrinsics[(0, 0)],
                principle_point: PointRecord {
                    x: frame.intrinsics[(0, 2)],
                    y: frame.intrinsics[(1, 2)],
                },
            },
            transform: frame.extrinsics.as_slice().to_vec(),
        }
    }
}
