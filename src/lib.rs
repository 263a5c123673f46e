//! Denoising diffusion GAN sampling in pure Rust.
//!
//! A candle-based implementation of the few-step diffusion machinery used
//! by denoising diffusion GANs: noise schedules, forward/reverse
//! coefficient tables, and the iterative reverse samplers (plain,
//! classifier-free guided, and patch-tiled for beyond-native resolutions).
//! The generator and text encoder are external — trained networks plug in
//! through the traits in [`generator`].
//!
//! ## Data flow
//!
//! ```text
//! schedule (betas) ──┬→ diffusion coefficients ─→ q_sample pairs (training)
//!                    └→ posterior coefficients ─→ posterior sampler
//!                                                        ↓
//!                               reverse loop (base / guided / tiled)
//!                                                        ↓
//!                                     images in [0, 1] (pipeline)
//! ```
//!
//! ## Modules
//!
//! - [`config`] — schedule, guidance, and tiling parameters
//! - [`schedule`] — beta derivation from a continuous variance curve
//! - [`diffusion`] — forward-process coefficients and noised-pair sampling
//! - [`posterior`] — reverse-process coefficients and the one-step sampler
//! - [`sampler`] — the reverse sampling loops
//! - [`tiling`] — fold/unfold with weighted patch blending
//! - [`generator`] — generator/encoder trait contracts
//! - [`pipeline`] — end-to-end orchestration

pub mod config;
pub mod diffusion;
pub mod generator;
pub mod pipeline;
pub mod posterior;
pub mod sampler;
pub mod schedule;
pub mod tiling;

mod error;

pub use error::{Error, Result};
