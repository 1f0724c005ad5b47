use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use rust_lar::config::LarConfig;
use rust_lar::features::FeatureExtractor;
use rust_lar::frame::Frame;
use rust_lar::localization::FeatureLocalizer;
use rust_lar::map::{load_map, SharedMap, SpatialQuery};
use rust_lar::mapping::MapperData;
use rust_lar::processing::MapProcessor;

/// Query diameter used when none is given: a 50 m radius around the frame.
const DEFAULT_QUERY_DIAMETER: f64 = 100.0;

const USAGE: &str = "usage:
  rust_lar process <capture_dir> [--config file.yaml]
  rust_lar localize <map_dir> <frames.json> <image_dir> [x z diameter] [--config file.yaml]";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rust_lar=info")),
        )
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config = match take_option(&mut args, "--config")? {
        Some(path) => {
            info!("Loading configuration from {}", path);
            LarConfig::load(&path)?
        }
        None => LarConfig::default(),
    };

    match args.first().map(String::as_str) {
        Some("process") if args.len() == 2 => process(Path::new(&args[1]), &config),
        Some("localize") if args.len() == 4 || args.len() == 7 => {
            let query = if args.len() == 7 {
                Some(parse_query(&args[4..7])?)
            } else {
                None
            };
            localize(
                Path::new(&args[1]),
                Path::new(&args[2]),
                Path::new(&args[3]),
                query,
                &config,
            )
        }
        _ => bail!("{}", USAGE),
    }
}

/// Remove `--name value` from `args` and return the value.
fn take_option(args: &mut Vec<String>, name: &str) -> Result<Option<String>> {
    let Some(i) = args.iter().position(|a| a == name) else {
        return Ok(None);
    };
    if i + 1 >= args.len() {
        bail!("{} needs a value", name);
    }
    let value = args.remove(i + 1);
    args.remove(i);
    Ok(Some(value))
}

fn parse_query(values: &[String]) -> Result<SpatialQuery> {
    let parse = |s: &String| -> Result<f64> {
        s.parse::<f64>()
            .with_context(|| format!("invalid number {:?}", s))
    };
    Ok(SpatialQuery::new(
        parse(&values[0])?,
        parse(&values[1])?,
        parse(&values[2])?,
    ))
}

fn process(capture_dir: &Path, config: &LarConfig) -> Result<()> {
    let data = MapperData::read(capture_dir)?;
    info!(
        "Loaded capture: {} frames, {} observations, {} GPS observations",
        data.frames.len(),
        data.num_observations(),
        data.gps_observations.len()
    );

    let mut processor = MapProcessor::new(data, config.processor.clone());
    let report = processor.process();
    match &report.alignment {
        Some(alignment) => info!(
            "Global alignment: yaw {:.2}°, {} inliers, rms {:.2} m, scale estimate {:.3}",
            alignment.yaw.to_degrees(),
            alignment.num_inliers(),
            alignment.rms_error_m,
            alignment.scale_estimate
        ),
        None => warn!("No global alignment (not enough GPS observations)"),
    }

    let out = capture_dir.join("map");
    processor.save_map(&out)?;
    info!(
        "Saved {} landmarks to {}",
        report.consolidation.landmarks,
        out.display()
    );
    Ok(())
}

fn localize(
    map_dir: &Path,
    frames_path: &Path,
    image_dir: &Path,
    query: Option<SpatialQuery>,
    config: &LarConfig,
) -> Result<()> {
    let map = load_map(map_dir)?;
    let frames = Frame::load_frames(frames_path)?;
    info!(
        "Loaded map with {} landmarks, {} frames to replay",
        map.num_landmarks(),
        frames.len()
    );

    let localizer = FeatureLocalizer::new(SharedMap::new(map), extractor()?, config.localizer.clone());

    let mut successes = 0;
    for frame in &frames {
        let path = image_path(image_dir, frame.id)?;
        let image = image::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?
            .to_luma8();

        let query = query.unwrap_or_else(|| {
            let position = frame.pose().translation;
            SpatialQuery::new(position.x, position.z, DEFAULT_QUERY_DIAMETER)
        });
        let outcome = localizer.localize(&image, frame, &query, None);
        let d = &outcome.diagnostics;
        match &outcome.pose {
            Some(pose) => {
                successes += 1;
                println!(
                    "frame {:>6}: ok   landmarks {:>5} matches {:>4} inliers {:>4} err {:.2}px position [{:.2}, {:.2}, {:.2}]",
                    frame.id,
                    d.spatial_query_count,
                    d.match_count,
                    d.inlier_count,
                    d.mean_reprojection_error_px.unwrap_or(f64::NAN),
                    pose.translation.x,
                    pose.translation.y,
                    pose.translation.z
                );
            }
            None => println!(
                "frame {:>6}: fail landmarks {:>5} matches {:>4} inliers {:>4} ({})",
                frame.id,
                d.spatial_query_count,
                d.match_count,
                d.inlier_count,
                d.failure.map(|f| f.to_string()).unwrap_or_default()
            ),
        }
    }
    info!("Localized {} / {} frames", successes, frames.len());
    Ok(())
}

/// `<id>_image.jpeg` or `<id>_image.png`, id zero-padded to eight digits.
fn image_path(dir: &Path, id: u64) -> Result<PathBuf> {
    for ext in ["jpeg", "jpg", "png"] {
        let path = dir.join(format!("{:08}_image.{}", id, ext));
        if path.exists() {
            return Ok(path);
        }
    }
    bail!("No image for frame {} in {}", id, dir.display())
}

#[cfg(feature = "opencv")]
fn extractor() -> Result<Arc<dyn FeatureExtractor>> {
    Ok(Arc::new(rust_lar::features::OrbExtractor::new(2000)?))
}

#[cfg(not(feature = "opencv"))]
fn extractor() -> Result<Arc<dyn FeatureExtractor>> {
    bail!("localize needs a feature extractor; rebuild with --features opencv")
}
