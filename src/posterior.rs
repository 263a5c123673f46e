//! Reverse-process (posterior) coefficients and the one-step sampler.
//!
//! Given a predicted clean sample `x0` and the current noised sample `x_t`,
//! the true posterior `q(x_{t-1} | x_t, x0)` is Gaussian with
//!
//! ```text
//! mean     = coef1[t]·x0 + coef2[t]·x_t
//! variance = β[t]·(1 - ᾱ[t-1]) / (1 - ᾱ[t])
//! ```
//!
//! where `ᾱ` is the cumulative alpha product. Index 0 of the beta schedule
//! is dropped here, so table index `t` corresponds to reverse-chain step
//! `t` in `[0, N-1]`. The variance is clamped at 1e-20 before its log so
//! step 0 (where it underflows to zero) never produces `-inf`.
//!
//! Tables are built once per configuration and never written afterwards;
//! they are safe to share across concurrent sampling calls.

use candle_core::{DType, Device, Tensor};

use crate::config::DiffusionConfig;
use crate::diffusion::{check_image_batch, extract};
use crate::schedule::BetaSchedule;
use crate::{Error, Result};

/// Floor applied to the posterior variance before taking its log.
const VARIANCE_FLOOR: f64 = 1e-20;

/// Posterior coefficient tables, length N each.
#[derive(Debug, Clone)]
pub struct PosteriorCoefficients {
    alphas_cumprod: Vec<f32>,
    posterior_variance: Tensor,
    posterior_log_variance_clipped: Tensor,
    posterior_mean_coef1: Tensor,
    posterior_mean_coef2: Tensor,
    num_timesteps: usize,
}

impl PosteriorCoefficients {
    /// Build the tables on `device`. Fails fast on an invalid config.
    pub fn new(config: &DiffusionConfig, device: &Device) -> Result<Self> {
        let schedule = BetaSchedule::new(config)?;
        let n = schedule.num_timesteps();

        // Index 0 is the alignment placeholder; the reverse chain only
        // needs entries 1..N, reindexed to 0..N-1.
        let betas: Vec<f64> = schedule.betas[1..].iter().map(|&b| b as f64).collect();
        let alphas: Vec<f64> = betas.iter().map(|&b| 1.0 - b).collect();

        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut running = 1.0f64;
        for &alpha in &alphas {
            running *= alpha;
            alphas_cumprod.push(running);
        }
        // Shifted by one step, with a leading 1 (nothing has been noised
        // before step 0) and the terminal entry dropped.
        let mut alphas_cumprod_prev = Vec::with_capacity(n);
        alphas_cumprod_prev.push(1.0f64);
        alphas_cumprod_prev.extend_from_slice(&alphas_cumprod[..n - 1]);

        let mut variance = Vec::with_capacity(n);
        let mut log_variance = Vec::with_capacity(n);
        let mut coef1 = Vec::with_capacity(n);
        let mut coef2 = Vec::with_capacity(n);
        for t in 0..n {
            let var = betas[t] * (1.0 - alphas_cumprod_prev[t]) / (1.0 - alphas_cumprod[t]);
            variance.push(var as f32);
            log_variance.push(var.max(VARIANCE_FLOOR).ln() as f32);
            coef1.push((betas[t] * alphas_cumprod_prev[t].sqrt() / (1.0 - alphas_cumprod[t])) as f32);
            coef2.push(((1.0 - alphas_cumprod_prev[t]) * alphas[t].sqrt() / (1.0 - alphas_cumprod[t])) as f32);
        }

        Ok(Self {
            alphas_cumprod: alphas_cumprod.iter().map(|&v| v as f32).collect(),
            posterior_variance: Tensor::from_vec(variance, n, device)?,
            posterior_log_variance_clipped: Tensor::from_vec(log_variance, n, device)?,
            posterior_mean_coef1: Tensor::from_vec(coef1, n, device)?,
            posterior_mean_coef2: Tensor::from_vec(coef2, n, device)?,
            num_timesteps: n,
        })
    }

    /// Number of reverse-chain steps N.
    pub fn num_timesteps(&self) -> usize {
        self.num_timesteps
    }

    /// Retained signal fraction `ᾱ[t]` as a scalar, for the guidance
    /// algebra where the whole batch shares one timestep.
    pub fn alpha_cumprod(&self, t: usize) -> Result<f64> {
        self.alphas_cumprod
            .get(t)
            .map(|&v| v as f64)
            .ok_or_else(|| {
                Error::Shape(format!(
                    "timestep {t} out of range [0, {})",
                    self.num_timesteps
                ))
            })
    }

    /// Posterior variance table, shape `(N,)`.
    pub fn posterior_variance(&self) -> &Tensor {
        &self.posterior_variance
    }

    /// Log posterior variance, floored before the log, shape `(N,)`.
    pub fn posterior_log_variance_clipped(&self) -> &Tensor {
        &self.posterior_log_variance_clipped
    }

    /// Posterior mean/variance for `q(x_{t-1} | x_t, x0)`, with per-element
    /// timestep lookup. Returns `(mean, variance, log_variance)`; the
    /// variance terms have shape `(B, 1, 1, 1)`.
    pub fn posterior_mean_variance(
        &self,
        x0: &Tensor,
        x_t: &Tensor,
        t: &Tensor,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        check_image_batch(x_t, t)?;
        if x0.dims() != x_t.dims() {
            return Err(Error::Shape(format!(
                "x0 shape {:?} does not match x_t shape {:?}",
                x0.dims(),
                x_t.dims()
            )));
        }
        let coef1 = extract(&self.posterior_mean_coef1, t)?;
        let coef2 = extract(&self.posterior_mean_coef2, t)?;
        let mean = (x0.broadcast_mul(&coef1)? + x_t.broadcast_mul(&coef2)?)?;
        let variance = extract(&self.posterior_variance, t)?;
        let log_variance = extract(&self.posterior_log_variance_clipped, t)?;
        Ok((mean, variance, log_variance))
    }

    /// Draw one reverse step: `mean + mask·exp(½·log_var)·ε` with fresh
    /// standard-normal `ε` from the device RNG. The mask zeroes the noise
    /// term for every batch element sitting at `t = 0`, making the
    /// terminal step deterministic.
    pub fn sample(&self, x0: &Tensor, x_t: &Tensor, t: &Tensor) -> Result<Tensor> {
        let noise = x_t.randn_like(0.0, 1.0)?;
        self.sample_with_noise(x0, x_t, t, &noise)
    }

    /// [`sample`](Self::sample) with a caller-provided noise draw — the
    /// sampling loops route their [`NoiseSource`](crate::sampler::NoiseSource)
    /// through here so a fixed seed makes the whole chain reproducible.
    pub fn sample_with_noise(
        &self,
        x0: &Tensor,
        x_t: &Tensor,
        t: &Tensor,
        noise: &Tensor,
    ) -> Result<Tensor> {
        let (mean, _variance, log_variance) = self.posterior_mean_variance(x0, x_t, t)?;
        if noise.dims() != x_t.dims() {
            return Err(Error::Shape(format!(
                "noise shape {:?} does not match x_t shape {:?}",
                noise.dims(),
                x_t.dims()
            )));
        }
        let b = t.dim(0)?;
        let nonzero_mask = t
            .to_dtype(DType::F32)?
            .ne(0f32)?
            .to_dtype(DType::F32)?
            .reshape((b, 1, 1, 1))?;
        let std = ((log_variance * 0.5)?).exp()?;
        let stochastic = noise.broadcast_mul(&std)?.broadcast_mul(&nonzero_mask)?;
        Ok((mean + stochastic)?)
    }
}
