//! Configuration for the diffusion schedule and the sampling variants.
//!
//! All configs are plain serde structs validated explicitly: every
//! constructor that consumes one calls its `validate()` first, so a bad
//! configuration fails before any coefficient table is built or any
//! sampling work begins. Nothing is clamped silently.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Continuous-time variance function used to derive the beta schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceSchedule {
    /// `var(t) = 1 - exp(-0.5·t²·(βmax-βmin) - t·βmin)` — the closed-form
    /// integral of a linear beta(t) schedule.
    #[default]
    VariancePreserving,
    /// `var(t) = βmin·(βmax/βmin)^t`. Requires `beta_max < 1` to yield
    /// valid variances; construction rejects anything else.
    Geometric,
}

/// Diffusion process configuration.
///
/// Coefficient tables are derived deterministically from these four values
/// and are immutable once built, so a config can be shared freely between
/// the training and sampling entry points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionConfig {
    /// Number of diffusion steps N (default: 4). Timesteps run 0 (clean)
    /// to N (pure noise).
    #[serde(default = "default_num_timesteps")]
    pub num_timesteps: usize,

    /// Minimum noise variance rate (default: 0.1).
    #[serde(default = "default_beta_min")]
    pub beta_min: f64,

    /// Maximum noise variance rate (default: 20.0).
    #[serde(default = "default_beta_max")]
    pub beta_max: f64,

    /// Variance function choice (default: variance-preserving).
    #[serde(default)]
    pub schedule: VarianceSchedule,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            num_timesteps: default_num_timesteps(),
            beta_min: default_beta_min(),
            beta_max: default_beta_max(),
            schedule: VarianceSchedule::default(),
        }
    }
}

impl DiffusionConfig {
    /// Load and validate a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the schedule parameters. Called by every coefficient
    /// constructor before any derivation work.
    pub fn validate(&self) -> Result<()> {
        if self.num_timesteps == 0 {
            return Err(Error::Config("num_timesteps must be >= 1".into()));
        }
        if self.beta_min <= 0.0 {
            return Err(Error::Config(format!(
                "beta_min must be > 0, got {}",
                self.beta_min
            )));
        }
        if self.beta_min >= self.beta_max {
            return Err(Error::Config(format!(
                "beta_min ({}) must be < beta_max ({})",
                self.beta_min, self.beta_max
            )));
        }
        Ok(())
    }
}

fn default_num_timesteps() -> usize {
    4
}

fn default_beta_min() -> f64 {
    0.1
}

fn default_beta_max() -> f64 {
    20.0
}

/// Classifier-free guidance settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GuidanceConfig {
    /// Guidance scale `s`. The guided noise estimate is
    /// `(1-s)·eps_uncond + s·eps_cond`; `s = 0` disables guidance entirely
    /// (no null-conditioning inference is performed).
    #[serde(default)]
    pub scale: f64,

    /// Dynamic-thresholding quantile `q`. When nonzero, each sample's
    /// predicted x0 is clipped to its own q-quantile magnitude (floored at
    /// 1) and rescaled. Zero disables thresholding.
    #[serde(default)]
    pub dynamic_thresholding_quantile: f64,
}

impl Default for GuidanceConfig {
    fn default() -> Self {
        Self {
            scale: 0.0,
            dynamic_thresholding_quantile: 0.0,
        }
    }
}

impl GuidanceConfig {
    pub fn validate(&self) -> Result<()> {
        let q = self.dynamic_thresholding_quantile;
        if !(0.0..1.0).contains(&q) {
            return Err(Error::Config(format!(
                "dynamic_thresholding_quantile must be in [0, 1), got {q}"
            )));
        }
        Ok(())
    }
}

/// How overlapping patches are recombined by the tiled sampler.
///
/// The two paths differ in which weights the fold applies; each normalizes
/// by the fold of the weights it actually applied, so both are
/// self-consistent (a constant image survives either round trip).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FoldMode {
    /// Blend with the center-weighted mask, normalize by the folded mask.
    /// Suppresses seam artifacts at patch borders.
    #[default]
    Weighted,
    /// Plain sum, normalize by the per-pixel overlap count.
    Unweighted,
}

/// Patch tiling parameters for the convolutional sampling variant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SplitInputParams {
    /// Patch size (height, width) — the generator's native resolution.
    pub kernel_size: (usize, usize),

    /// Patch stride (vertical, horizontal). Strides smaller than the kernel
    /// overlap patches; a grid that does not exactly cover the image is a
    /// caller concern, not an error.
    pub stride: (usize, usize),

    /// Lower clip bound for the per-pixel border weighting.
    #[serde(default = "default_clip_min_weight")]
    pub clip_min_weight: f64,

    /// Upper clip bound for the per-pixel border weighting.
    #[serde(default = "default_clip_max_weight")]
    pub clip_max_weight: f64,

    /// Apply a secondary weighting over the patch grid itself, biasing
    /// toward centrally located patches.
    #[serde(default = "default_tie_breaker")]
    pub tie_breaker: bool,

    /// Lower clip bound for the tie-breaker weighting.
    #[serde(default = "default_clip_min_tie_weight")]
    pub clip_min_tie_weight: f64,

    /// Upper clip bound for the tie-breaker weighting.
    #[serde(default = "default_clip_max_tie_weight")]
    pub clip_max_tie_weight: f64,

    /// Patch recombination mode.
    #[serde(default)]
    pub fold_mode: FoldMode,
}

impl SplitInputParams {
    /// Tiling setup for a generator with square native resolution
    /// `kernel`, using the given stride and the default weighting bounds.
    pub fn new(kernel: usize, stride: usize) -> Self {
        Self {
            kernel_size: (kernel, kernel),
            stride: (stride, stride),
            clip_min_weight: default_clip_min_weight(),
            clip_max_weight: default_clip_max_weight(),
            tie_breaker: default_tie_breaker(),
            clip_min_tie_weight: default_clip_min_tie_weight(),
            clip_max_tie_weight: default_clip_max_tie_weight(),
            fold_mode: FoldMode::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let (kh, kw) = self.kernel_size;
        let (sh, sw) = self.stride;
        if kh < 2 || kw < 2 {
            return Err(Error::Config(format!(
                "kernel_size components must be >= 2, got ({kh}, {kw})"
            )));
        }
        if sh == 0 || sw == 0 {
            return Err(Error::Config(format!(
                "stride components must be > 0, got ({sh}, {sw})"
            )));
        }
        for (name, lo, hi) in [
            ("weight", self.clip_min_weight, self.clip_max_weight),
            ("tie_weight", self.clip_min_tie_weight, self.clip_max_tie_weight),
        ] {
            if !(lo > 0.0 && lo <= hi) {
                return Err(Error::Config(format!(
                    "clip bounds for {name} must satisfy 0 < min <= max, got ({lo}, {hi})"
                )));
            }
        }
        Ok(())
    }
}

fn default_clip_min_weight() -> f64 {
    0.01
}

fn default_clip_max_weight() -> f64 {
    0.5
}

fn default_tie_breaker() -> bool {
    true
}

fn default_clip_min_tie_weight() -> f64 {
    0.01
}

fn default_clip_max_tie_weight() -> f64 {
    0.5
}

/// Per-call sampling surface consumed by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Number of images to generate.
    pub batch_size: usize,

    /// Image channels (3 for RGB).
    pub channels: usize,

    /// Output height in pixels.
    pub height: usize,

    /// Output width in pixels.
    pub width: usize,

    /// Dimension of the latent noise vector fed to the generator each step.
    #[serde(default = "default_latent_dim")]
    pub latent_dim: usize,

    /// Classifier-free guidance settings.
    #[serde(default)]
    pub guidance: GuidanceConfig,

    /// Patch tiling for outputs larger than the generator's native size.
    /// `None` runs the generator on the full image.
    #[serde(default)]
    pub split_input: Option<SplitInputParams>,

    /// Seed for the device RNG. Omit for fresh noise each call.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            batch_size: 1,
            channels: 3,
            height: 32,
            width: 32,
            latent_dim: default_latent_dim(),
            guidance: GuidanceConfig::default(),
            split_input: None,
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be > 0".into()));
        }
        if self.channels == 0 || self.height == 0 || self.width == 0 {
            return Err(Error::Config(format!(
                "sample shape must be non-empty, got ({}, {}, {})",
                self.channels, self.height, self.width
            )));
        }
        if self.latent_dim == 0 {
            return Err(Error::Config("latent_dim must be > 0".into()));
        }
        self.guidance.validate()?;
        if let Some(split) = &self.split_input {
            split.validate()?;
        }
        Ok(())
    }
}

fn default_latent_dim() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = DiffusionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_timesteps, 4);
        assert_eq!(config.schedule, VarianceSchedule::VariancePreserving);
    }

    #[test]
    fn inverted_beta_range_is_rejected() {
        let config = DiffusionConfig {
            beta_min: 20.0,
            beta_max: 0.1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timesteps_is_rejected() {
        let config = DiffusionConfig {
            num_timesteps: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn quantile_out_of_range_is_rejected() {
        let guidance = GuidanceConfig {
            scale: 2.0,
            dynamic_thresholding_quantile: 1.0,
        };
        assert!(guidance.validate().is_err());
    }

    #[test]
    fn split_params_defaults_match_sampling_setup() {
        let split = SplitInputParams::new(256, 150);
        assert!(split.validate().is_ok());
        assert_eq!(split.kernel_size, (256, 256));
        assert_eq!(split.stride, (150, 150));
        assert!((split.clip_max_weight - 0.5).abs() < 1e-12);
        assert!(split.tie_breaker);
    }

    #[test]
    fn zero_stride_is_rejected() {
        let mut split = SplitInputParams::new(128, 64);
        split.stride = (0, 64);
        assert!(split.validate().is_err());
    }

    #[test]
    fn config_roundtrips_through_json() {
        let params = SamplingParams {
            guidance: GuidanceConfig {
                scale: 4.0,
                dynamic_thresholding_quantile: 0.95,
            },
            split_input: Some(SplitInputParams::new(128, 64)),
            ..Default::default()
        };
        let json = serde_json::to_string(&params).unwrap();
        let back: SamplingParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back.batch_size, params.batch_size);
        assert!((back.guidance.scale - 4.0).abs() < 1e-12);
        assert_eq!(back.split_input.unwrap().kernel_size, (128, 128));
    }
}
