//! Configuration types for registration, warping and compositing.
//!
//! Every struct deserializes with `#[serde(default)]`, so a config file only
//! needs the fields it overrides.

use std::path::Path;
use std::time::Duration;

use common::LogConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    File(#[from] common::FileFormatError),
    #[error("Invalid config value for '{field}': {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

// =============================================================================
// Coarse alignment
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoarseConfig {
    /// Minimum point correspondences (points plus polygon centroids).
    pub min_correspondences: usize,
    /// Residual sums whose difference is within this fraction of the larger
    /// one count as a tie, which resolves to "no mirror".
    pub mirror_tie_tolerance: f64,
}

impl Default for CoarseConfig {
    fn default() -> Self {
        Self {
            min_correspondences: 3,
            mirror_tie_tolerance: 1e-6,
        }
    }
}

impl CoarseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_correspondences < 3 {
            return Err(invalid(
                "coarse.min_correspondences",
                "a similarity with mirror selection needs at least 3 correspondences",
            ));
        }
        if !(self.mirror_tie_tolerance >= 0.0) {
            return Err(invalid("coarse.mirror_tie_tolerance", "must be >= 0"));
        }
        Ok(())
    }
}

// =============================================================================
// Alignment estimates
// =============================================================================

/// Sliding-window search proposing where an image sits before any landmark
/// is placed. Both rasters are thresholded to foreground masks and compared
/// by IoU at every rotation step, with and without mirroring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimateConfig {
    /// Foreground is above this percentile minus `threshold_buffer`.
    pub threshold_percentile: f64,
    pub threshold_buffer: f32,
    pub rotation_step_deg: f64,
    /// Offset step of the sliding window, working pixels.
    pub stride_px: usize,
    /// The image may hang off the canvas by this fraction of its size.
    pub overhang_fraction: f64,
    /// Windows with fewer jointly valid pixels are not scored.
    pub min_valid_px: usize,
    pub min_union_px: usize,
    /// Windows whose intersection covers more than this share of the valid
    /// pixels match everything and are not scored.
    pub max_fill_fraction: f64,
    pub candidates: usize,
    /// Candidates closer than this (working pixels, same mirroring, rotation
    /// within `merge_rotation_deg`) compete for one slot.
    pub merge_distance_px: f64,
    pub merge_rotation_deg: f64,
}

impl Default for EstimateConfig {
    fn default() -> Self {
        Self {
            threshold_percentile: 90.0,
            threshold_buffer: 10.0,
            rotation_step_deg: 15.0,
            stride_px: 20,
            overhang_fraction: 0.6,
            min_valid_px: 100_000,
            min_union_px: 2000,
            max_fill_fraction: 0.8,
            candidates: 3,
            merge_distance_px: 40.0,
            merge_rotation_deg: 30.0,
        }
    }
}

impl EstimateConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.threshold_percentile) {
            return Err(invalid("estimate.threshold_percentile", "must be in [0, 100]"));
        }
        if !(self.rotation_step_deg > 0.0 && self.rotation_step_deg <= 360.0) {
            return Err(invalid("estimate.rotation_step_deg", "must be in (0, 360]"));
        }
        if self.stride_px == 0 {
            return Err(invalid("estimate.stride_px", "must be >= 1"));
        }
        if !(self.overhang_fraction >= 0.0 && self.overhang_fraction < 1.0) {
            return Err(invalid("estimate.overhang_fraction", "must be in [0, 1)"));
        }
        if self.candidates == 0 {
            return Err(invalid("estimate.candidates", "must be >= 1"));
        }
        Ok(())
    }
}

// =============================================================================
// Local deformation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeformationStrategy {
    /// Thin-plate spline through refined landmarks.
    #[default]
    Spline,
    /// B-spline free-form deformation driven by rasterized polygon masks.
    DeformableMask,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TpsConfig {
    /// 0.0 interpolates control points exactly.
    pub regularization: f64,
    /// Extremal vertices sampled per polygon in addition to its centroid.
    pub spokes_per_polygon: usize,
    /// Pin the four image corners to their coarse positions.
    pub pin_corners: bool,
}

impl Default for TpsConfig {
    fn default() -> Self {
        Self {
            regularization: 0.0,
            spokes_per_polygon: 6,
            pin_corners: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BSplineConfig {
    /// Control-grid cells per axis.
    pub mesh_size: usize,
    pub iterations: usize,
    /// Gaussian sigma applied to both masks, in working pixels.
    pub smoothing_sigma: f64,
    /// Longest side of the working raster; larger regions are downsampled.
    pub working_max_dim: usize,
    /// Initial optimizer step in working pixels.
    pub initial_step: f64,
    /// Optimization stops once the step has been halved below this.
    pub min_step: f64,
    /// Canvas pixels added around the region of interest.
    pub padding_px: usize,
}

impl Default for BSplineConfig {
    fn default() -> Self {
        Self {
            mesh_size: 8,
            iterations: 100,
            smoothing_sigma: 2.0,
            working_max_dim: 256,
            initial_step: 2.0,
            min_step: 1e-3,
            padding_px: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeformationConfig {
    pub strategy: DeformationStrategy,
    pub tps: TpsConfig,
    pub bspline: BSplineConfig,
    /// Largest accepted landmark residual after refinement, in canvas pixels.
    pub max_residual_px: f64,
}

impl Default for DeformationConfig {
    fn default() -> Self {
        Self {
            strategy: DeformationStrategy::default(),
            tps: TpsConfig::default(),
            bspline: BSplineConfig::default(),
            max_residual_px: 25.0,
        }
    }
}

impl DeformationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.max_residual_px > 0.0) {
            return Err(invalid("deformation.max_residual_px", "must be > 0"));
        }
        if !(self.tps.regularization >= 0.0) {
            return Err(invalid("deformation.tps.regularization", "must be >= 0"));
        }
        let b = &self.bspline;
        if b.mesh_size == 0 {
            return Err(invalid("deformation.bspline.mesh_size", "must be > 0"));
        }
        if b.working_max_dim < 8 {
            return Err(invalid("deformation.bspline.working_max_dim", "must be >= 8"));
        }
        if !(b.initial_step > 0.0 && b.min_step > 0.0 && b.min_step <= b.initial_step) {
            return Err(invalid(
                "deformation.bspline.initial_step",
                "need 0 < min_step <= initial_step",
            ));
        }
        if !(b.smoothing_sigma >= 0.0) {
            return Err(invalid("deformation.bspline.smoothing_sigma", "must be >= 0"));
        }
        Ok(())
    }
}

// =============================================================================
// Warping
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpolationMethod {
    Nearest,
    #[default]
    Bilinear,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarpConfig {
    pub method: InterpolationMethod,
}

// =============================================================================
// Compositing
// =============================================================================

/// Synthetic channel `numerator / denominator`. Each side lists candidate base
/// channel names; the first one present in the set is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatioDefinition {
    pub name: String,
    pub numerator: Vec<String>,
    pub denominator: Vec<String>,
}

impl RatioDefinition {
    pub fn new(name: &str, numerator: &[&str], denominator: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            numerator: numerator.iter().map(|s| s.to_string()).collect(),
            denominator: denominator.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MosaicConfig {
    pub ratios: Vec<RatioDefinition>,
    pub ratio_scale: f64,
    pub ratio_ceiling: f64,
}

impl Default for MosaicConfig {
    fn default() -> Self {
        Self {
            ratios: vec![
                RatioDefinition::new("13C12C_ratio", &["13C", "12C 13C"], &["12C", "12C2"]),
                RatioDefinition::new(
                    "15N14N_ratio",
                    &["15N 12C", "12C 15N"],
                    &["14N 12C", "12C 14N"],
                ),
            ],
            ratio_scale: 10_000.0,
            ratio_ceiling: 30_000.0,
        }
    }
}

impl MosaicConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.ratio_scale > 0.0 && self.ratio_scale.is_finite()) {
            return Err(invalid("mosaic.ratio_scale", "must be a positive number"));
        }
        if !(self.ratio_ceiling > 0.0 && self.ratio_ceiling <= u16::MAX as f64) {
            return Err(invalid("mosaic.ratio_ceiling", "must be in (0, 65535]"));
        }
        for ratio in &self.ratios {
            if ratio.numerator.is_empty() || ratio.denominator.is_empty() {
                return Err(invalid(
                    "mosaic.ratios",
                    format!("ratio '{}' needs numerator and denominator candidates", ratio.name),
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Retry
// =============================================================================

/// Retry budget for the channel load + warp unit. Only transient channel
/// source errors are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn no_backoff(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay before attempt `attempt + 1` (attempts count from 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis((self.initial_backoff_ms as f64 * factor) as u64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be >= 1"));
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(invalid("retry.backoff_multiplier", "must be >= 1"));
        }
        Ok(())
    }
}

// =============================================================================
// Top level
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MimsRegConfig {
    pub coarse: CoarseConfig,
    pub estimate: EstimateConfig,
    pub deformation: DeformationConfig,
    pub warp: WarpConfig,
    pub mosaic: MosaicConfig,
    pub retry: RetryPolicy,
    pub log: LogConfig,
}

impl MimsRegConfig {
    /// Loads YAML or JSON, picked by file extension, and validates it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: MimsRegConfig = common::file_format::load_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.coarse.validate()?;
        self.estimate.validate()?;
        self.deformation.validate()?;
        self.mosaic.validate()?;
        self.retry.validate()?;
        common::log_setup::build_filter(&self.log.level).map_err(|e| invalid("log.level", e.to_string()))?;
        Ok(())
    }

    /// Installs process-wide logging from the `log` section.
    pub fn init_logging(&self) -> Result<(), common::LogSetupError> {
        common::setup_logging(&self.log)
    }
}
