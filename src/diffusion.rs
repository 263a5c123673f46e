//! Forward-process (noising) coefficients.
//!
//! Precomputes everything needed to jump from a clean sample to a noised
//! sample at an arbitrary timestep:
//!
//! ```text
//! a[t]         = sqrt(1 - β[t])          per-step drift
//! σ[t]         = sqrt(β[t])              per-step noise scale
//! a_cum[t]     = ∏_{k<=t} a[k]           cumulative drift
//! σ_cum[t]     = sqrt(1 - a_cum[t]²)     cumulative noise scale
//! ```
//!
//! `σ_cum` is derived from `a_cum` rather than accumulated independently so
//! the variance-preserving identity `a_cum² + σ_cum² = 1` holds exactly
//! even under floating-point roundoff. `a_prev` equals `a` with its last
//! entry forced to 1 — there is no drift multiplier beyond the terminal
//! step.
//!
//! Training consumes [`DiffusionCoefficients::q_sample_pairs`] to build the
//! adjacent-timestep pairs `(x_t, x_{t+1})` fed to the adversarial
//! objective; everything here is read-only after construction.

use candle_core::{Device, Tensor};

use crate::config::DiffusionConfig;
use crate::schedule::BetaSchedule;
use crate::{Error, Result};

/// Per-batch-element lookup into a 1-D coefficient table.
///
/// `table` has shape `(L,)`; `t` has shape `(B,)` holding one integer
/// timestep per batch element (dtype U32) — batches may mix timesteps, so
/// this is a gather, never a single scalar index. The result has shape
/// `(B, 1, 1, 1)`, ready to broadcast against an image batch.
pub(crate) fn extract(table: &Tensor, t: &Tensor) -> Result<Tensor> {
    let b = t.dim(0)?;
    Ok(table.gather(t, 0)?.reshape((b, 1, 1, 1))?)
}

/// Reject a sample/timestep pair whose shapes cannot go through the
/// coefficient math, before any of it runs.
pub(crate) fn check_image_batch(x: &Tensor, t: &Tensor) -> Result<()> {
    let dims = x.dims();
    if dims.len() != 4 {
        return Err(Error::Shape(format!(
            "expected a (batch, channels, height, width) tensor, got {dims:?}"
        )));
    }
    if t.dims() != [dims[0]] {
        return Err(Error::Shape(format!(
            "timestep tensor must have shape ({},), got {:?}",
            dims[0],
            t.dims()
        )));
    }
    Ok(())
}

/// Forward-process coefficient tables, length N+1 each.
#[derive(Debug, Clone)]
pub struct DiffusionCoefficients {
    a: Tensor,
    sigma: Tensor,
    a_cum: Tensor,
    sigma_cum: Tensor,
    a_prev: Tensor,
    num_timesteps: usize,
}

impl DiffusionCoefficients {
    /// Build the tables on `device`. Fails fast on an invalid config.
    pub fn new(config: &DiffusionConfig, device: &Device) -> Result<Self> {
        let schedule = BetaSchedule::new(config)?;
        let n = schedule.num_timesteps();

        // Cumulative products in f64; the cumulative noise scale comes from
        // the complement so a_cum² + σ_cum² stays exactly 1.
        let mut a_cum = Vec::with_capacity(n + 1);
        let mut sigma_cum = Vec::with_capacity(n + 1);
        let mut running = 1.0f64;
        for &a in &schedule.a {
            running *= a as f64;
            a_cum.push(running as f32);
            sigma_cum.push((1.0 - running * running).max(0.0).sqrt() as f32);
        }

        let mut a_prev = schedule.a.clone();
        a_prev[n] = 1.0;

        let len = n + 1;
        Ok(Self {
            a: Tensor::from_vec(schedule.a, len, device)?,
            sigma: Tensor::from_vec(schedule.sigmas, len, device)?,
            a_cum: Tensor::from_vec(a_cum, len, device)?,
            sigma_cum: Tensor::from_vec(sigma_cum, len, device)?,
            a_prev: Tensor::from_vec(a_prev, len, device)?,
            num_timesteps: n,
        })
    }

    /// Number of diffusion steps N.
    pub fn num_timesteps(&self) -> usize {
        self.num_timesteps
    }

    /// Per-step drift coefficients `sqrt(1-β)`, shape `(N+1,)`.
    pub fn a(&self) -> &Tensor {
        &self.a
    }

    /// Per-step noise scales `sqrt(β)`, shape `(N+1,)`.
    pub fn sigma(&self) -> &Tensor {
        &self.sigma
    }

    /// Cumulative drift `∏ a`, shape `(N+1,)`.
    pub fn a_cum(&self) -> &Tensor {
        &self.a_cum
    }

    /// Cumulative noise scale `sqrt(1 - a_cum²)`, shape `(N+1,)`.
    pub fn sigma_cum(&self) -> &Tensor {
        &self.sigma_cum
    }

    /// `a` with the terminal entry forced to 1, shape `(N+1,)`.
    pub fn a_prev(&self) -> &Tensor {
        &self.a_prev
    }

    /// Diffuse `x_start` to timestep `t` in one jump:
    /// `x_t = a_cum[t]·x_start + σ_cum[t]·noise`.
    ///
    /// `noise` defaults to a fresh standard-normal draw matching
    /// `x_start`; pass it explicitly for deterministic use.
    pub fn q_sample(&self, x_start: &Tensor, t: &Tensor, noise: Option<&Tensor>) -> Result<Tensor> {
        check_image_batch(x_start, t)?;
        let noise = match noise {
            Some(noise) => {
                if noise.dims() != x_start.dims() {
                    return Err(Error::Shape(format!(
                        "noise shape {:?} does not match x_start shape {:?}",
                        noise.dims(),
                        x_start.dims()
                    )));
                }
                noise.clone()
            }
            None => x_start.randn_like(0.0, 1.0)?,
        };
        let drift = extract(&self.a_cum, t)?;
        let scale = extract(&self.sigma_cum, t)?;
        Ok((x_start.broadcast_mul(&drift)? + noise.broadcast_mul(&scale)?)?)
    }

    /// Produce the adjacent pair `(x_t, x_{t+1})` with two independent
    /// noise draws:
    ///
    /// ```text
    /// x_t     = a_cum[t]·x_start + σ_cum[t]·ε₁
    /// x_{t+1} = a[t+1]·x_t + σ[t+1]·ε₂
    /// ```
    ///
    /// `t` must lie in `[0, N-1]` so that `t+1` stays on the table.
    pub fn q_sample_pairs(&self, x_start: &Tensor, t: &Tensor) -> Result<(Tensor, Tensor)> {
        check_image_batch(x_start, t)?;
        let steps = t.to_vec1::<u32>()?;
        if let Some(&bad) = steps.iter().find(|&&s| s as usize >= self.num_timesteps) {
            return Err(Error::Shape(format!(
                "pair timestep {bad} out of range [0, {})",
                self.num_timesteps
            )));
        }
        let t_next: Vec<u32> = steps.iter().map(|&s| s + 1).collect();
        let t_next = Tensor::from_vec(t_next, steps.len(), t.device())?;

        let x_t = self.q_sample(x_start, t, None)?;
        let noise = x_start.randn_like(0.0, 1.0)?;
        let drift = extract(&self.a, &t_next)?;
        let scale = extract(&self.sigma, &t_next)?;
        let x_t_plus_one = (x_t.broadcast_mul(&drift)? + noise.broadcast_mul(&scale)?)?;
        Ok((x_t, x_t_plus_one))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn coefficients(n: usize) -> DiffusionCoefficients {
        let config = DiffusionConfig {
            num_timesteps: n,
            ..Default::default()
        };
        DiffusionCoefficients::new(&config, &Device::Cpu).unwrap()
    }

    #[test]
    fn variance_preserving_invariant_holds() {
        let coeff = coefficients(4);
        let a_cum = coeff.a_cum().to_vec1::<f32>().unwrap();
        let sigma_cum = coeff.sigma_cum().to_vec1::<f32>().unwrap();
        for t in 0..=4 {
            let total = a_cum[t] * a_cum[t] + sigma_cum[t] * sigma_cum[t];
            assert!(
                (total - 1.0).abs() < 1e-6,
                "a_cum² + σ_cum² = {total} at t={t}"
            );
        }
    }

    #[test]
    fn a_prev_matches_a_except_terminal() {
        let coeff = coefficients(4);
        let a = coeff.a().to_vec1::<f32>().unwrap();
        let a_prev = coeff.a_prev().to_vec1::<f32>().unwrap();
        assert_eq!(a_prev[4], 1.0, "terminal a_prev must be exactly 1");
        for t in 0..4 {
            assert_eq!(a_prev[t], a[t], "a_prev diverges from a at t={t}");
        }
    }

    #[test]
    fn q_sample_with_zero_noise_is_pure_drift() {
        let coeff = coefficients(4);
        let device = Device::Cpu;
        let x = Tensor::ones((2, 3, 8, 8), DType::F32, &device).unwrap();
        let zero = Tensor::zeros((2, 3, 8, 8), DType::F32, &device).unwrap();
        let t = Tensor::from_vec(vec![0u32, 0], 2, &device).unwrap();

        let x_t = coeff.q_sample(&x, &t, Some(&zero)).unwrap();
        let a_cum0 = coeff.a_cum().to_vec1::<f32>().unwrap()[0];
        let value: f32 = x_t.mean_all().unwrap().to_scalar().unwrap();
        // beta[0] = 1e-8, so the drift at t=0 keeps the sample essentially
        // unchanged.
        assert!((value - a_cum0).abs() < 1e-6, "got {value}, want {a_cum0}");
        assert!((value - 1.0).abs() < 1e-3, "t=0 should be near-identity");
    }

    #[test]
    fn mixed_timesteps_gather_per_element() {
        let coeff = coefficients(4);
        let device = Device::Cpu;
        let x = Tensor::ones((2, 1, 2, 2), DType::F32, &device).unwrap();
        let zero = Tensor::zeros((2, 1, 2, 2), DType::F32, &device).unwrap();
        let t = Tensor::from_vec(vec![0u32, 3], 2, &device).unwrap();

        let x_t = coeff.q_sample(&x, &t, Some(&zero)).unwrap();
        let a_cum = coeff.a_cum().to_vec1::<f32>().unwrap();
        let rows = x_t.reshape((2, 4)).unwrap().to_vec2::<f32>().unwrap();
        assert!((rows[0][0] - a_cum[0]).abs() < 1e-6, "element 0 used wrong row");
        assert!((rows[1][0] - a_cum[3]).abs() < 1e-6, "element 1 used wrong row");
    }

    #[test]
    fn pair_shapes_match_input() {
        let coeff = coefficients(4);
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 16, 16), &device).unwrap();
        let t = Tensor::from_vec(vec![1u32, 3], 2, &device).unwrap();

        let (x_t, x_tp1) = coeff.q_sample_pairs(&x, &t).unwrap();
        assert_eq!(x_t.dims(), x.dims());
        assert_eq!(x_tp1.dims(), x.dims());
    }

    #[test]
    fn pair_timestep_at_n_is_rejected() {
        let coeff = coefficients(4);
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (1, 3, 8, 8), &device).unwrap();
        let t = Tensor::from_vec(vec![4u32], 1, &device).unwrap();
        assert!(coeff.q_sample_pairs(&x, &t).is_err());
    }

    #[test]
    fn rank_mismatch_is_rejected() {
        let coeff = coefficients(4);
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 8), &device).unwrap();
        let t = Tensor::from_vec(vec![1u32, 2], 2, &device).unwrap();
        assert!(coeff.q_sample(&x, &t, None).is_err());
    }
}
