//! Tunable streaming parameters.
//!
//! Distances are in world units, angles in degrees. Each throttled effect has
//! its own distance/angle pair so they can be tuned independently.

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default number of frames a file stays resident after its last reference.
pub const DEFAULT_COOLDOWN_TICKS: u32 = 100;

/// Default packed buffer width, in splats per line.
pub const DEFAULT_TEXTURE_WIDTH: u32 = 1024;

/// Configuration for the streaming manager.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct StreamConfig {
    /// Camera translation that triggers LOD re-evaluation.
    pub lod_update_distance: f32,
    /// Camera rotation that triggers LOD re-evaluation.
    pub lod_update_angle: f32,
    /// Camera translation that triggers a re-sort (radial sorting).
    pub sort_update_distance: f32,
    /// Camera rotation that triggers a re-sort (directional sorting).
    pub sort_update_angle: f32,
    /// Accumulated translation after which a splat's colors are refreshed.
    pub color_update_distance: f32,
    /// Accumulated rotation after which a splat's colors are refreshed.
    pub color_update_angle: f32,
    /// Per-LOD multiplier on `color_update_distance`; coarser levels refresh less often.
    pub color_update_distance_lod_scale: f32,
    /// Per-LOD multiplier on `color_update_angle`.
    pub color_update_angle_lod_scale: f32,
    /// Frames to keep an unreferenced file before unloading it. Zero unloads immediately.
    pub cooldown_ticks: u32,
    /// Sort by distance from the camera instead of along its view direction.
    pub radial_sorting: bool,
    /// Upper bound of each LOD distance band, finest first. Nodes beyond the
    /// last band are culled.
    pub lod_distances: Vec<f32>,
    /// CPU sort submissions are held back while this many jobs are outstanding.
    pub max_sort_jobs_in_flight: usize,
    /// Width of the packed work buffer in splats per line.
    pub texture_width: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            lod_update_distance: 1.0,
            lod_update_angle: 10.0,
            sort_update_distance: 0.1,
            sort_update_angle: 1.0,
            color_update_distance: 1.0,
            color_update_angle: 5.0,
            color_update_distance_lod_scale: 2.0,
            color_update_angle_lod_scale: 2.0,
            cooldown_ticks: DEFAULT_COOLDOWN_TICKS,
            radial_sorting: false,
            lod_distances: vec![10.0, 25.0, 60.0, 150.0],
            max_sort_jobs_in_flight: 3,
            texture_width: DEFAULT_TEXTURE_WIDTH,
        }
    }
}

impl StreamConfig {
    /// Parse a configuration from JSON, filling missing options with defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::Json {
            context: "stream config",
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every option is in range.
    pub fn validate(&self) -> Result<()> {
        let non_negative = [
            ("lodUpdateDistance", self.lod_update_distance),
            ("lodUpdateAngle", self.lod_update_angle),
            ("sortUpdateDistance", self.sort_update_distance),
            ("sortUpdateAngle", self.sort_update_angle),
            ("colorUpdateDistance", self.color_update_distance),
            ("colorUpdateAngle", self.color_update_angle),
        ];
        for (option, value) in non_negative {
            if value.is_nan() || value < 0.0 {
                return Err(Error::InvalidConfig {
                    option,
                    detail: format!("must be a non-negative number, got {value}"),
                });
            }
        }

        for (option, value) in [
            ("colorUpdateDistanceLodScale", self.color_update_distance_lod_scale),
            ("colorUpdateAngleLodScale", self.color_update_angle_lod_scale),
        ] {
            if value.is_nan() || value <= 0.0 {
                return Err(Error::InvalidConfig {
                    option,
                    detail: format!("must be positive, got {value}"),
                });
            }
        }

        if self.lod_distances.is_empty() {
            return Err(Error::InvalidConfig {
                option: "lodDistances",
                detail: "must contain at least one band".to_string(),
            });
        }
        if let Some(bad) = self
            .lod_distances
            .iter()
            .find(|d| !d.is_finite() || **d < 0.0)
        {
            return Err(Error::InvalidConfig {
                option: "lodDistances",
                detail: format!("must be finite and non-negative, got {bad}"),
            });
        }
        if self.lod_distances.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::InvalidConfig {
                option: "lodDistances",
                detail: format!("must be strictly increasing, got {:?}", self.lod_distances),
            });
        }
        if self.max_sort_jobs_in_flight == 0 {
            return Err(Error::InvalidConfig {
                option: "maxSortJobsInFlight",
                detail: "must be at least 1".to_string(),
            });
        }
        if self.texture_width == 0 {
            return Err(Error::InvalidConfig {
                option: "textureWidth",
                detail: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Color refresh thresholds `(distance, angle)` for a splat at `lod_index`.
    #[must_use]
    pub fn color_thresholds(&self, lod_index: i32) -> (f32, f32) {
        let lod = lod_index.max(0);
        (
            self.color_update_distance * self.color_update_distance_lod_scale.powi(lod),
            self.color_update_angle * self.color_update_angle_lod_scale.powi(lod),
        )
    }
}
