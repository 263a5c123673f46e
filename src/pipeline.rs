//! End-to-end sampling pipeline.
//!
//! Owns the precomputed coefficient tables and drives one sampling call:
//!
//! 1. Validate the per-call params and conditioning
//! 2. Draw the initial pure-noise sample
//! 3. Dispatch to the base / guided / tiled reverse loop
//! 4. Rescale the result from the generation range `[-1, 1]` to `[0, 1]`
//!
//! The tables are built once in [`SamplingPipeline::new`] and never
//! mutated, so one pipeline can serve any number of concurrent sampling
//! calls; each call's only state is its own sample tensor. The same
//! pipeline also serves the training side through
//! [`SamplingPipeline::noise_pair`].

use std::time::Instant;

use candle_core::{DType, Device, Tensor};

use crate::config::{DiffusionConfig, SamplingParams};
use crate::diffusion::DiffusionCoefficients;
use crate::generator::{ConditionEncoder, Conditioning, Generator};
use crate::posterior::PosteriorCoefficients;
use crate::sampler::{
    sample_from_model, sample_with_guidance, sample_with_guidance_tiled, NoiseSource,
};
use crate::schedule;
use crate::{Error, Result};

/// Rescale from the generation range `[-1, 1]` to image range `[0, 1]`.
pub fn to_unit_range(x: &Tensor) -> Result<Tensor> {
    Ok(x.affine(0.5, 0.5)?)
}

/// Immutable diffusion state shared by training and inference.
#[derive(Debug, Clone)]
pub struct SamplingPipeline {
    config: DiffusionConfig,
    diffusion: DiffusionCoefficients,
    posterior: PosteriorCoefficients,
    device: Device,
}

impl SamplingPipeline {
    /// Build both coefficient sets on `device`. Fails fast on an invalid
    /// schedule configuration.
    pub fn new(config: DiffusionConfig, device: Device) -> Result<Self> {
        let diffusion = DiffusionCoefficients::new(&config, &device)?;
        let posterior = PosteriorCoefficients::new(&config, &device)?;
        tracing::debug!(
            num_timesteps = config.num_timesteps,
            schedule = ?config.schedule,
            "coefficient tables built"
        );
        Ok(Self {
            config,
            diffusion,
            posterior,
            device,
        })
    }

    pub fn config(&self) -> &DiffusionConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Forward-process tables (training side).
    pub fn diffusion(&self) -> &DiffusionCoefficients {
        &self.diffusion
    }

    /// Reverse-process tables (sampling side).
    pub fn posterior(&self) -> &PosteriorCoefficients {
        &self.posterior
    }

    /// The N+1 continuous time points behind the schedule.
    pub fn time_schedule(&self) -> Vec<f64> {
        schedule::time_schedule(self.config.num_timesteps)
    }

    /// Training-side passthrough: the adjacent noised pair
    /// `(x_t, x_{t+1})` consumed by the adversarial objective.
    pub fn noise_pair(&self, x_start: &Tensor, t: &Tensor) -> Result<(Tensor, Tensor)> {
        self.diffusion.q_sample_pairs(x_start, t)
    }

    /// Sample a batch of images from pure noise.
    ///
    /// Guidance (`params.guidance.scale != 0`) needs both `encoder` and
    /// `cond`; tiling runs whenever `params.split_input` is set. The
    /// returned tensor is in `[0, 1]`.
    pub fn generate(
        &self,
        generator: &dyn Generator,
        encoder: Option<&dyn ConditionEncoder>,
        cond: Option<&Conditioning>,
        params: &SamplingParams,
    ) -> Result<Tensor> {
        params.validate()?;
        let guided = params.guidance.scale != 0.0;
        if let Some(cond) = cond {
            let cond_batch = cond.batch_size()?;
            if cond_batch != params.batch_size {
                return Err(Error::Shape(format!(
                    "conditioning batch {cond_batch} does not match requested batch {}",
                    params.batch_size
                )));
            }
        }

        let mut noise = NoiseSource::from_seed(params.seed);
        let shape = (
            params.batch_size,
            params.channels,
            params.height,
            params.width,
        );
        let x_init = noise.randn(shape, DType::F32, &self.device)?;

        let steps = self.config.num_timesteps;
        let start = Instant::now();
        let x = if let Some(split) = &params.split_input {
            let encoder = encoder.ok_or_else(|| {
                Error::Config("tiled sampling requires a condition encoder".into())
            })?;
            let cond = cond
                .ok_or_else(|| Error::Config("tiled sampling requires conditioning".into()))?;
            sample_with_guidance_tiled(
                &self.posterior,
                generator,
                encoder,
                steps,
                &x_init,
                params.latent_dim,
                cond,
                &params.guidance,
                split,
                &mut noise,
            )?
        } else if guided {
            let encoder = encoder.ok_or_else(|| {
                Error::Config("classifier-free guidance requires a condition encoder".into())
            })?;
            let cond = cond.ok_or_else(|| {
                Error::Config("classifier-free guidance requires conditioning".into())
            })?;
            sample_with_guidance(
                &self.posterior,
                generator,
                encoder,
                steps,
                &x_init,
                params.latent_dim,
                cond,
                &params.guidance,
                &mut noise,
            )?
        } else {
            sample_from_model(
                &self.posterior,
                generator,
                steps,
                &x_init,
                params.latent_dim,
                cond,
                &mut noise,
            )?
        };
        tracing::info!(
            "Reverse sampling ({} steps, batch {}): {:.2}s",
            steps,
            params.batch_size,
            start.elapsed().as_secs_f64()
        );

        to_unit_range(&x)
    }
}
