//! Tiled (convolutional) guided sampling.
//!
//! For output resolutions larger than the generator's native size: every
//! reverse step unfolds the current image into overlapping patches, runs
//! the guided single-step update on each patch independently, and blends
//! the updated patches back together through the tiling grid. Patch
//! updates within a step have no cross-patch data dependency; only the
//! final fold sees them all.
//!
//! The thresholding quantile and guidance scale arrive through
//! [`GuidanceConfig`] — explicit parameters, nothing is read from ambient
//! state.

use candle_core::{IndexOp, Tensor};

use super::guided::{dynamic_threshold, guide_x0};
use super::{check_loop_input, timestep_tensor, NoiseSource};
use crate::config::{GuidanceConfig, SplitInputParams};
use crate::generator::{ConditionEncoder, Conditioning, Generator};
use crate::posterior::PosteriorCoefficients;
use crate::tiling::TileGrid;
use crate::Result;

/// Run the guided reverse chain patch-wise over an image larger than the
/// generator's native resolution.
///
/// One latent draw per step is shared by every patch and by both
/// conditioned and unconditioned calls, mirroring the non-tiled guided
/// loop. With `guidance.scale == 0` the per-patch update degenerates to a
/// single unconditioned generator call (no null encoding, no
/// thresholding).
#[allow(clippy::too_many_arguments)]
pub fn sample_with_guidance_tiled(
    coefficients: &PosteriorCoefficients,
    generator: &dyn Generator,
    encoder: &dyn ConditionEncoder,
    num_timesteps: usize,
    x_init: &Tensor,
    latent_dim: usize,
    cond: &Conditioning,
    guidance: &GuidanceConfig,
    split: &SplitInputParams,
    noise: &mut NoiseSource,
) -> Result<Tensor> {
    guidance.validate()?;
    let batch = check_loop_input(coefficients, num_timesteps, x_init, Some(cond))?;
    let grid = TileGrid::for_image(x_init, split)?;
    let (kh, kw) = split.kernel_size;
    let channels = x_init.dim(1)?;

    let null = if guidance.scale != 0.0 {
        Some(encoder.encode(&vec![String::new(); batch])?)
    } else {
        None
    };

    let quantile = guidance.dynamic_thresholding_quantile;
    let mut x = x_init.clone();
    for step in (0..num_timesteps).rev() {
        let t = timestep_tensor(step, batch, x.device())?;
        let latent = noise.randn((batch, latent_dim), x.dtype(), x.device())?;

        let stacked = grid
            .unfold(&x)?
            .reshape((batch, channels, kh, kw, grid.num_tiles()))?;
        let mut updated = Vec::with_capacity(grid.num_tiles());
        for tile in 0..grid.num_tiles() {
            let patch = stacked.i((.., .., .., .., tile))?.contiguous()?;
            let x0 = match &null {
                Some(null) => {
                    let x0_uncond = generator.generate(&patch, &t, &latent, Some(null))?;
                    let x0_cond = generator.generate(&patch, &t, &latent, Some(cond))?;
                    let x0 = guide_x0(
                        coefficients,
                        &patch,
                        &x0_uncond,
                        &x0_cond,
                        step,
                        guidance.scale,
                    )?;
                    if quantile > 0.0 {
                        dynamic_threshold(&x0, quantile)?
                    } else {
                        x0
                    }
                }
                None => generator.generate(&patch, &t, &latent, None)?,
            };
            let step_noise = noise.randn_like(&patch)?;
            let next = coefficients.sample_with_noise(&x0, &patch, &t, &step_noise)?;
            updated.push(next.reshape((batch, channels * kh * kw))?);
        }
        let restacked = Tensor::stack(&updated, 2)?;
        x = grid.merge(&restacked)?;
    }
    Ok(x)
}
