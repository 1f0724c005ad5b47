//! Capture data collected by the mapper and consumed by the map processor.
//!
//! On disk a capture directory holds:
//! - `frames.json`: the captured frames
//! - `observations.json`: per-frame feature observations
//! - `gps.csv`: GPS observations paired with VIO positions
//! - `map.json`: anchors, edges and the geodetic reference of the map
//! - `mapper.json`: capture-level metadata (applied scale)

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{bail, Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::features::Descriptor;
use crate::frame::Frame;
use crate::map::{load_map, persist::MAP_FILE, save_map, SharedMap};

pub const FRAMES_FILE: &str = "frames.json";
pub const OBSERVATIONS_FILE: &str = "observations.json";
pub const GPS_FILE: &str = "gps.csv";
pub const MAPPER_FILE: &str = "mapper.json";

const METADATA_VERSION: u32 = 1;

/// A GPS fix paired with the VIO position at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsObservation {
    /// VIO (map-local) position.
    pub relative: Vector3<f64>,
    /// Local tangent frame position (x east, y up, z south).
    pub global: Vector3<f64>,
    /// Horizontal accuracy (metres, 1σ).
    pub accuracy: f64,
    pub timestamp_ns: u64,
}

/// A feature seen in one frame with its depth-derived 3D point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureObservation {
    pub pixel: Vector2<f64>,
    /// Point in the camera frame (AR convention: x right, y up, z back).
    pub point: Vector3<f64>,
    pub descriptor: Descriptor,
}

impl FeatureObservation {
    pub fn new(pixel: Vector2<f64>, point: Vector3<f64>, descriptor: Descriptor) -> Self {
        Self {
            pixel,
            point,
            descriptor,
        }
    }
}

/// Everything recorded during one capture session.
#[derive(Debug)]
pub struct MapperData {
    pub map: SharedMap,
    pub gps_observations: Vec<GpsObservation>,
    /// Frames in capture order.
    pub frames: Vec<Frame>,
    /// Observations keyed by frame id.
    pub observations: BTreeMap<u64, Vec<FeatureObservation>>,
    /// Product of every scale factor applied so far.
    pub scale: f64,
}

impl Default for MapperData {
    fn default() -> Self {
        Self {
            map: SharedMap::default(),
            gps_observations: Vec::new(),
            frames: Vec::new(),
            observations: BTreeMap::new(),
            scale: 1.0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MapperFile {
    version: u32,
    scale: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct FrameObservations {
    frame_id: u64,
    observations: Vec<FeatureObservation>,
}

/// One `gps.csv` row.
#[derive(Debug, Serialize, Deserialize)]
struct GpsRecord {
    timestamp_ns: u64,
    relative_x: f64,
    relative_y: f64,
    relative_z: f64,
    global_x: f64,
    global_y: f64,
    global_z: f64,
    accuracy: f64,
}

impl From<&GpsObservation> for GpsRecord {
    fn from(obs: &GpsObservation) -> Self {
        Self {
            timestamp_ns: obs.timestamp_ns,
            relative_x: obs.relative.x,
            relative_y: obs.relative.y,
            relative_z: obs.relative.z,
            global_x: obs.global.x,
            global_y: obs.global.y,
            global_z: obs.global.z,
            accuracy: obs.accuracy,
        }
    }
}

impl From<GpsRecord> for GpsObservation {
    fn from(r: GpsRecord) -> Self {
        Self {
            relative: Vector3::new(r.relative_x, r.relative_y, r.relative_z),
            global: Vector3::new(r.global_x, r.global_y, r.global_z),
            accuracy: r.accuracy,
            timestamp_ns: r.timestamp_ns,
        }
    }
}

impl MapperData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.values().map(Vec::len).sum()
    }

    pub fn frame(&self, id: u64) -> Option<&Frame> {
        self.frames.iter().find(|f| f.id == id)
    }

    /// Write all capture metadata into `directory` (created if missing).
    pub fn write(&self, directory: impl AsRef<Path>) -> Result<()> {
        let directory = directory.as_ref();
        fs::create_dir_all(directory)
            .with_context(|| format!("Failed to create {}", directory.display()))?;

        Frame::save_frames(&self.frames, directory.join(FRAMES_FILE))?;

        let observations: Vec<FrameObservations> = self
            .observations
            .iter()
            .map(|(&frame_id, obs)| FrameObservations {
                frame_id,
                observations: obs.clone(),
            })
            .collect();
        write_json(&directory.join(OBSERVATIONS_FILE), &observations)?;

        write_gps(&directory.join(GPS_FILE), &self.gps_observations)?;

        save_map(&self.map.read(), directory)?;

        write_json(
            &directory.join(MAPPER_FILE),
            &MapperFile {
                version: METADATA_VERSION,
                scale: self.scale,
            },
        )?;

        info!(
            "[MapperData] wrote {} frames, {} observations, {} GPS observations to {}",
            self.frames.len(),
            self.num_observations(),
            self.gps_observations.len(),
            directory.display()
        );
        Ok(())
    }

    /// Read capture metadata from `directory`.
    ///
    /// `frames.json` is required; the other files are optional. Nothing is
    /// returned unless every present file parses.
    pub fn read(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref();

        let frames = Frame::load_frames(directory.join(FRAMES_FILE))?;

        let observations_path = directory.join(OBSERVATIONS_FILE);
        let mut observations = BTreeMap::new();
        if observations_path.exists() {
            let records: Vec<FrameObservations> = read_json(&observations_path)?;
            for record in records {
                if !frames.iter().any(|f| f.id == record.frame_id) {
                    bail!(
                        "{}: observations for unknown frame {}",
                        observations_path.display(),
                        record.frame_id
                    );
                }
                observations
                    .entry(record.frame_id)
                    .or_insert_with(Vec::new)
                    .extend(record.observations);
            }
        }

        let gps_path = directory.join(GPS_FILE);
        let gps_observations = if gps_path.exists() {
            read_gps(&gps_path)?
        } else {
            Vec::new()
        };

        let map = if directory.join(MAP_FILE).exists() {
            load_map(directory)?
        } else {
            Default::default()
        };

        let mapper_path = directory.join(MAPPER_FILE);
        let scale = if mapper_path.exists() {
            let file: MapperFile = read_json(&mapper_path)?;
            if file.version != METADATA_VERSION {
                bail!(
                    "{}: unsupported version {} (expected {})",
                    mapper_path.display(),
                    file.version,
                    METADATA_VERSION
                );
            }
            if !(file.scale.is_finite() && file.scale > 0.0) {
                bail!("{}: invalid scale {}", mapper_path.display(), file.scale);
            }
            file.scale
        } else {
            1.0
        };

        info!(
            "[MapperData] read {} frames and {} GPS observations from {}",
            frames.len(),
            gps_observations.len(),
            directory.display()
        );

        Ok(Self {
            map: SharedMap::new(map),
            gps_observations,
            frames,
            observations,
            scale,
        })
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let writer = BufWriter::new(
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
    );
    serde_json::to_writer_pretty(writer, value)
        .with_context(|| format!("Failed to write {}", path.display()))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let reader = BufReader::new(
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
    );
    serde_json::from_reader(reader).with_context(|| format!("Failed to parse {}", path.display()))
}

fn write_gps(path: &Path, observations: &[GpsObservation]) -> Result<()> {
    let mut wtr = WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    wtr.write_record([
        "#timestamp_ns",
        "relative_x",
        "relative_y",
        "relative_z",
        "global_x",
        "global_y",
        "global_z",
        "accuracy",
    ])?;
    for obs in observations {
        wtr.serialize(GpsRecord::from(obs))?;
    }
    wtr.flush()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn read_gps(path: &Path) -> Result<Vec<GpsObservation>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut observations = Vec::new();
    for (line, rec) in rdr.deserialize::<GpsRecord>().enumerate() {
        let rec = rec.with_context(|| format!("{}: bad record {}", path.display(), line + 1))?;
        observations.push(GpsObservation::from(rec));
    }
    Ok(observations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use nalgebra::{Matrix3, Matrix4};

    fn sample() -> MapperData {
        let k = Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0);
        let mut data = MapperData {
            frames: vec![
                Frame::new(0, 1_000_000_000, k, Matrix4::identity()),
                Frame::new(1, 1_500_000_000, k, Matrix4::new_translation(&Vector3::new(0.5, 0.0, 0.0))),
            ],
            scale: 1.25,
            ..Default::default()
        };
        data.observations.insert(
            1,
            vec![FeatureObservation::new(
                Vector2::new(10.0, 20.0),
                Vector3::new(0.1, 0.2, -3.0),
                Descriptor([7; 32]),
            )],
        );
        data.gps_observations.push(GpsObservation {
            relative: Vector3::new(1.0, 0.0, 2.0),
            global: Vector3::new(10.0, 1.0, -4.0),
            accuracy: 4.5,
            timestamp_ns: 1_200_000_000,
        });
        data.map.write().create_anchor(SE3::from_translation(Vector3::new(1.0, 0.0, 0.0)));
        data
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample();
        data.write(dir.path()).unwrap();

        let loaded = MapperData::read(dir.path()).unwrap();

        assert_eq!(loaded.frames.len(), 2);
        assert_eq!(loaded.frames[1].timestamp_ns, 1_500_000_000);
        assert_eq!(loaded.observations, data.observations);
        assert_eq!(loaded.gps_observations, data.gps_observations);
        assert_eq!(loaded.scale, 1.25);
        assert_eq!(loaded.map.read().num_anchors(), 1);
    }

    #[test]
    fn test_read_requires_frames() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MapperData::read(dir.path()).is_err());
    }

    #[test]
    fn test_read_rejects_orphan_observations() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = sample();
        data.observations.insert(99, Vec::new());
        data.write(dir.path()).unwrap();

        assert!(MapperData::read(dir.path()).is_err());
    }

    #[test]
    fn test_corrupt_gps_is_error() {
        let dir = tempfile::tempdir().unwrap();
        sample().write(dir.path()).unwrap();
        fs::write(dir.path().join(GPS_FILE), "1,2,3\n").unwrap();

        assert!(MapperData::read(dir.path()).is_err());
    }
}
