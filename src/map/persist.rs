//! Directory-based map storage.
//!
//! A map directory holds a single `map.json` with landmarks, anchors, edges,
//! the origin and the geodetic reference. Loading validates the whole file
//! before a `Map` is handed out.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::geometry::GeoReference;

use super::anchor::{matrix_rows, transform_from_rows, AnchorRecord};
use super::landmark::Landmark;
use super::map::Map;
use super::types::Edge;

pub const MAP_FILE: &str = "map.json";

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct MapFile {
    version: u32,
    landmarks: Vec<Landmark>,
    anchors: Vec<AnchorRecord>,
    edges: Vec<Edge>,
    /// Row-major T_global_map; absent while the origin is not ready.
    origin: Option<[[f64; 4]; 4]>,
    #[serde(default)]
    geo_reference: Option<GeoReference>,
}

/// Write `map` into `directory` (created if missing).
pub fn save_map(map: &Map, directory: impl AsRef<Path>) -> Result<()> {
    let directory = directory.as_ref();
    fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create map directory {}", directory.display()))?;

    let mut landmarks: Vec<Landmark> = map.landmarks().cloned().collect();
    landmarks.sort_by_key(|lm| lm.id);

    let file = MapFile {
        version: FORMAT_VERSION,
        landmarks,
        anchors: map.anchors().iter().map(AnchorRecord::from).collect(),
        edges: map.edges(),
        origin: map.origin().map(matrix_rows),
        geo_reference: map.geo_reference().copied(),
    };

    let path = directory.join(MAP_FILE);
    let writer = BufWriter::new(
        File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?,
    );
    serde_json::to_writer_pretty(writer, &file)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    info!(
        "Saved map: {} landmarks, {} anchors, {} edges -> {}",
        file.landmarks.len(),
        file.anchors.len(),
        file.edges.len(),
        path.display()
    );
    Ok(())
}

/// Load a map directory written by [`save_map`].
pub fn load_map(directory: impl AsRef<Path>) -> Result<Map> {
    let path = directory.as_ref().join(MAP_FILE);
    let reader = BufReader::new(
        File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?,
    );
    let file: MapFile = serde_json::from_reader(reader)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    if file.version != FORMAT_VERSION {
        bail!(
            "Unsupported map format version {} in {}",
            file.version,
            path.display()
        );
    }

    let mut seen = HashSet::new();
    for lm in &file.landmarks {
        if !seen.insert(lm.id) {
            bail!("Duplicate landmark id {} in {}", lm.id, path.display());
        }
    }

    let mut map = Map::new();
    map.restore(
        file.anchors.iter().map(Into::into).collect(),
        file.edges,
        file.origin.as_ref().map(transform_from_rows),
    )
    .with_context(|| format!("Inconsistent anchor graph in {}", path.display()))?;
    for lm in file.landmarks {
        map.insert_landmark(lm);
    }
    map.set_geo_reference(file.geo_reference);

    info!(
        "Loaded map: {} landmarks, {} anchors from {}",
        map.num_landmarks(),
        map.num_anchors(),
        path.display()
    );
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Descriptor;
    use crate::geometry::{GeoCoordinate, SE3};
    use crate::map::types::{AnchorId, LandmarkId};
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn sample_map() -> Map {
        let mut map = Map::new();
        let a = map.create_anchor(SE3::from_translation(Vector3::new(1.0, 0.0, 2.0)));
        let b = map.create_anchor(SE3 {
            rotation: UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 1.2),
            translation: Vector3::new(-3.0, 0.5, 7.0),
        });
        map.add_edge(a.id, b.id);
        let mut lm = Landmark::new(
            LandmarkId::new(4),
            Vector3::new(0.5, 1.5, -2.0),
            Descriptor([7; 32]),
            1_000,
        );
        lm.record_sighting(2_000);
        map.insert_landmark(lm);
        map.update_origin(SE3::from_translation(Vector3::new(10.0, 0.0, -10.0)));
        map.set_geo_reference(Some(GeoReference::new(GeoCoordinate::new(48.1, 11.5, 520.0))));
        map
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let map = sample_map();
        save_map(&map, dir.path()).unwrap();

        let loaded = load_map(dir.path()).unwrap();

        assert_eq!(loaded.num_landmarks(), 1);
        assert_eq!(loaded.landmark(LandmarkId::new(4)), map.landmark(LandmarkId::new(4)));
        assert_eq!(loaded.edges(), map.edges());
        assert!(loaded.is_origin_ready());
        let b = loaded.anchor(AnchorId::new(2)).unwrap();
        assert!(b.transform.rotation.angle_to(&map.anchor(AnchorId::new(2)).unwrap().transform.rotation) < 1e-9);
        assert_relative_eq!(b.transform.translation, Vector3::new(-3.0, 0.5, 7.0), epsilon = 1e-12);
        assert_eq!(loaded.geo_reference(), map.geo_reference());
    }

    #[test]
    fn test_ids_continue_after_load() {
        let dir = tempfile::tempdir().unwrap();
        save_map(&sample_map(), dir.path()).unwrap();

        let mut loaded = load_map(dir.path()).unwrap();
        assert_eq!(loaded.create_anchor(SE3::identity()).id, AnchorId::new(3));
        assert_eq!(loaded.next_landmark_id(), LandmarkId::new(5));
    }

    #[test]
    fn test_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_map(dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_corrupt_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MAP_FILE), "{ \"version\": 1, \"landmarks\": [").unwrap();
        assert!(load_map(dir.path()).is_err());
    }

    #[test]
    fn test_dangling_edge_fails() {
        let dir = tempfile::tempdir().unwrap();
        let json = r#"{"version":1,"landmarks":[],"anchors":[],"edges":[{"start":1,"goal":2}],"origin":null}"#;
        fs::write(dir.path().join(MAP_FILE), json).unwrap();
        assert!(load_map(dir.path()).is_err());
    }
}
