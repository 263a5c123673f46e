//! Collaborator contracts consumed by the sampling loops.
//!
//! The generator network and the text encoder are external components —
//! the samplers only see these traits and never assume anything about the
//! internals behind them. Trained weights, tokenization, and architecture
//! all live on the other side of the boundary.

use candle_core::Tensor;

use crate::Result;

/// Opaque conditioning produced by a [`ConditionEncoder`], passed through
/// to the generator unchanged.
#[derive(Debug, Clone)]
pub struct Conditioning {
    /// Conditioning embedding, first dimension is the batch.
    pub embedding: Tensor,
    /// Optional attention mask over the embedding sequence.
    pub attention_mask: Option<Tensor>,
}

impl Conditioning {
    pub fn new(embedding: Tensor) -> Self {
        Self {
            embedding,
            attention_mask: None,
        }
    }

    pub fn with_attention_mask(embedding: Tensor, attention_mask: Tensor) -> Self {
        Self {
            embedding,
            attention_mask: Some(attention_mask),
        }
    }

    /// Batch size carried by the embedding.
    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.embedding.dim(0)?)
    }
}

/// A denoising generator: predicts the clean sample from a noised one.
///
/// `x_t` is the current sample `(B, C, H, W)`, `t` the per-element integer
/// timesteps `(B,)`, `latent` a fresh latent noise vector `(B, nz)`. The
/// prediction must have the same shape as `x_t`. Any randomness lives in
/// `latent`; the call itself is deterministic given its inputs.
pub trait Generator {
    fn generate(
        &self,
        x_t: &Tensor,
        t: &Tensor,
        latent: &Tensor,
        cond: Option<&Conditioning>,
    ) -> Result<Tensor>;
}

/// Text (or other modality) encoder producing [`Conditioning`].
///
/// Called once per batch before the reverse loop starts — plus once more
/// with empty strings when classifier-free guidance needs the null
/// conditioning.
pub trait ConditionEncoder {
    fn encode(&self, texts: &[String]) -> Result<Conditioning>;
}
