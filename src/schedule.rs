//! Noise schedule derivation.
//!
//! Betas come from a continuous-time total-variance curve sampled on a
//! shrunk time grid:
//!
//! ```text
//! t_k   = (k/N)·(1-ε) + ε          k = 0..N, ε = 1e-3
//! ᾱ(t)  = 1 - var(t)
//! β_k   = 1 - ᾱ(t_k)/ᾱ(t_{k-1})    k = 1..N
//! β_0   = 1e-8                      (kept for index alignment)
//! ```
//!
//! Two variance curves are supported (see [`VarianceSchedule`]):
//! variance-preserving (the integral of a linear beta(t)) and geometric.
//! All derivation runs in `f64` and is cast to `f32` at the end.

use crate::config::{DiffusionConfig, VarianceSchedule};
use crate::{Error, Result};

/// Shrink factor keeping the time grid away from exact zero, where the
/// variance-preserving curve would degenerate to zero variance.
pub const EPS_SMALL: f64 = 1e-3;

/// Fixed variance at index 0. Unused downstream but kept so beta indices
/// line up with the time schedule.
pub const BETA_ZERO: f64 = 1e-8;

/// The N+1 time points `t_k = (k/N)·(1-ε) + ε`, all in `(0, 1]` and
/// strictly increasing.
pub fn time_schedule(num_timesteps: usize) -> Vec<f64> {
    let n = num_timesteps as f64;
    (0..=num_timesteps)
        .map(|k| (k as f64 / n) * (1.0 - EPS_SMALL) + EPS_SMALL)
        .collect()
}

/// Total variance accumulated by time `t` under a linear beta(t) schedule.
fn var_vp(t: f64, beta_min: f64, beta_max: f64) -> f64 {
    1.0 - (-0.5 * t * t * (beta_max - beta_min) - t * beta_min).exp()
}

/// Geometric interpolation between `beta_min` and `beta_max`.
fn var_geometric(t: f64, beta_min: f64, beta_max: f64) -> f64 {
    beta_min * (beta_max / beta_min).powf(t)
}

/// Per-timestep noise variances and the drift/noise scales derived from
/// them, all of length N+1.
#[derive(Debug, Clone)]
pub struct BetaSchedule {
    /// Noise variance per step; `betas[0]` is the fixed [`BETA_ZERO`].
    pub betas: Vec<f32>,
    /// Per-step noise scale `sqrt(beta)`.
    pub sigmas: Vec<f32>,
    /// Per-step drift coefficient `sqrt(1-beta)`.
    pub a: Vec<f32>,
}

impl BetaSchedule {
    /// Derive the schedule. Fails if the config is invalid or if the chosen
    /// variance curve produces a beta outside `[0, 1)` — e.g. a geometric
    /// schedule with `beta_max >= 1`.
    pub fn new(config: &DiffusionConfig) -> Result<Self> {
        config.validate()?;

        let times = time_schedule(config.num_timesteps);
        let var = |t: f64| match config.schedule {
            VarianceSchedule::VariancePreserving => var_vp(t, config.beta_min, config.beta_max),
            VarianceSchedule::Geometric => var_geometric(t, config.beta_min, config.beta_max),
        };
        let alpha_bars: Vec<f64> = times.iter().map(|&t| 1.0 - var(t)).collect();

        let mut betas = Vec::with_capacity(config.num_timesteps + 1);
        betas.push(BETA_ZERO);
        for k in 1..=config.num_timesteps {
            betas.push(1.0 - alpha_bars[k] / alpha_bars[k - 1]);
        }

        for (k, &beta) in betas.iter().enumerate() {
            if !(0.0..1.0).contains(&beta) || !beta.is_finite() {
                return Err(Error::Config(format!(
                    "schedule produces invalid beta[{k}] = {beta}; \
                     the variance function must yield values in [0, 1)"
                )));
            }
        }

        let sigmas = betas.iter().map(|&b| b.sqrt() as f32).collect();
        let a = betas.iter().map(|&b| (1.0 - b).sqrt() as f32).collect();
        let betas = betas.iter().map(|&b| b as f32).collect();

        Ok(Self { betas, sigmas, a })
    }

    /// Number of diffusion steps N (the schedule holds N+1 entries).
    pub fn num_timesteps(&self) -> usize {
        self.betas.len() - 1
    }
}
