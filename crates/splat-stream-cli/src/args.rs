//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;
use glam::Vec3;

/// Parse an `x,y,z` triple.
fn parse_vec3(s: &str) -> Result<Vec3, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [x, y, z] = parts.as_slice() else {
        return Err(format!("expected x,y,z, got '{s}'"));
    };
    let component = |v: &str| v.parse::<f32>().map_err(|e| format!("invalid component '{v}': {e}"));
    Ok(Vec3::new(component(x)?, component(y)?, component(z)?))
}

/// Parse a comma-separated list of distances.
fn parse_distances(s: &str) -> Result<Vec<f32>, String> {
    s.split(',')
        .map(|v| {
            v.trim()
                .parse::<f32>()
                .map_err(|e| format!("invalid distance '{v}': {e}"))
        })
        .collect()
}

#[derive(Parser, Debug)]
#[command(about = "Fly a camera through a streamed splat octree without rendering")]
pub struct Args {
    /// Path or URL of the octree asset JSON.
    pub asset: String,

    /// Stream configuration JSON file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Camera start position.
    #[arg(long, value_parser = parse_vec3, default_value = "0,0,-50")]
    pub from: Vec3,

    /// Camera end position. The camera looks along the path.
    #[arg(long, value_parser = parse_vec3, default_value = "0,0,50")]
    pub to: Vec3,

    /// Frames spent travelling from start to end.
    #[arg(long, default_value_t = 600)]
    pub frames: u32,

    /// Extra frames at the end position to let loads and sorts settle.
    #[arg(long, default_value_t = 120)]
    pub settle_frames: u32,

    /// Frame interval in milliseconds.
    #[arg(long, default_value_t = 16)]
    pub frame_ms: u64,

    /// Log a frame report every this many frames.
    #[arg(long, default_value_t = 60)]
    pub report_every: u32,

    /// Override `cooldownTicks`.
    #[arg(long)]
    pub cooldown_ticks: Option<u32>,

    /// Override `lodDistances` (comma-separated, finest first).
    #[arg(long, value_parser = parse_distances)]
    pub lod_distances: Option<std::vec::Vec<f32>>,

    /// Override `maxSortJobsInFlight`.
    #[arg(long)]
    pub max_sort_jobs: Option<usize>,

    /// Sort by distance from the camera instead of along the view direction.
    #[arg(long)]
    pub radial: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vec3() {
        assert_eq!(parse_vec3("1, 2,3.5"), Ok(Vec3::new(1.0, 2.0, 3.5)));
        assert!(parse_vec3("1,2").is_err());
        assert!(parse_vec3("1,2,x").is_err());
    }

    #[test]
    fn test_parse_distances() {
        assert_eq!(parse_distances("10, 25,60"), Ok(vec![10.0, 25.0, 60.0]));
        assert!(parse_distances("10,,60").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from([
            "splat-stream",
            "scene/octree.json",
            "--from",
            "0,0,-10",
            "--lod-distances",
            "5,20",
            "--radial",
        ]);
        assert_eq!(args.asset, "scene/octree.json");
        assert_eq!(args.from, Vec3::new(0.0, 0.0, -10.0));
        assert_eq!(args.lod_distances, Some(vec![5.0, 20.0]));
        assert!(args.radial);
        assert_eq!(args.frames, 600);
    }
}
