//! Reverse-sampling loops.
//!
//! Three variants drive a [`Generator`](crate::generator::Generator)
//! backwards through the posterior chain, from pure noise at step N-1 down
//! to the deterministic terminal step at 0:
//!
//! - [`base`] — plain conditional sampling, one generator call per step
//! - [`guided`] — classifier-free guidance in epsilon space, with optional
//!   dynamic thresholding (2 generator calls per step)
//! - [`tiled`] — the guided update applied per overlapping patch, for
//!   outputs larger than the generator's native resolution
//!
//! The chain is inherently sequential: each step consumes the previous
//! step's output, and nothing besides the current sample crosses
//! iterations. Coefficient tables are read-only throughout.

pub mod base;
pub mod guided;
pub mod tiled;

pub use base::sample_from_model;
pub use guided::{dynamic_threshold, sample_with_guidance};
pub use tiled::sample_with_guidance_tiled;

use candle_core::{DType, Device, Shape, Tensor};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::generator::Conditioning;
use crate::posterior::PosteriorCoefficients;
use crate::{Error, Result};

/// Source of standard-normal noise for the reverse chain.
///
/// Unseeded, it draws through the device RNG (`Tensor::randn`) —
/// independent across calls. Seeded, it samples host-side through a
/// `ChaCha8Rng`, which is the only way to get reproducible draws on the
/// CPU backend (its device RNG cannot be seeded).
pub struct NoiseSource {
    rng: Option<ChaCha8Rng>,
}

impl NoiseSource {
    /// Device RNG, fresh noise every call.
    pub fn fresh() -> Self {
        Self { rng: None }
    }

    /// Reproducible host-side stream.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Some(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    pub fn from_seed(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::seeded(seed),
            None => Self::fresh(),
        }
    }

    /// Standard-normal tensor of the given shape.
    pub fn randn<S: Into<Shape>>(
        &mut self,
        shape: S,
        dtype: DType,
        device: &Device,
    ) -> Result<Tensor> {
        let shape = shape.into();
        let noise = match &mut self.rng {
            Some(rng) => {
                let data: Vec<f32> = (0..shape.elem_count())
                    .map(|_| StandardNormal.sample(rng))
                    .collect();
                Tensor::from_vec(data, shape, device)?
            }
            None => Tensor::randn(0f32, 1.0, shape, device)?,
        };
        Ok(noise.to_dtype(dtype)?)
    }

    /// Standard-normal tensor shaped like `x`.
    pub fn randn_like(&mut self, x: &Tensor) -> Result<Tensor> {
        self.randn(x.shape().clone(), x.dtype(), x.device())
    }
}

/// Timestep tensor `(B,)` filled with `step`, dtype U32 for the coefficient
/// gathers.
pub(crate) fn timestep_tensor(step: usize, batch: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::full(step as u32, batch, device)?)
}

/// Pre-loop validation shared by all variants: the chain length must fit
/// the coefficient tables, the initial sample must be an image batch, and
/// any conditioning must match its batch size. Failing here beats failing
/// mid-loop with a half-denoised sample.
pub(crate) fn check_loop_input(
    coefficients: &PosteriorCoefficients,
    num_timesteps: usize,
    x_init: &Tensor,
    cond: Option<&Conditioning>,
) -> Result<usize> {
    if num_timesteps == 0 || num_timesteps > coefficients.num_timesteps() {
        return Err(Error::Config(format!(
            "num_timesteps must be in [1, {}], got {num_timesteps}",
            coefficients.num_timesteps()
        )));
    }
    let dims = x_init.dims();
    if dims.len() != 4 {
        return Err(Error::Shape(format!(
            "expected a (batch, channels, height, width) sample, got {dims:?}"
        )));
    }
    let batch = dims[0];
    if let Some(cond) = cond {
        let cond_batch = cond.batch_size()?;
        if cond_batch != batch {
            return Err(Error::Shape(format!(
                "conditioning batch {cond_batch} does not match sample batch {batch}"
            )));
        }
    }
    Ok(batch)
}
