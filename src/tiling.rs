//! Patch tiling: fold/unfold with weighted recombination.
//!
//! Decomposes an image batch into overlapping patches, and recomposes a
//! stack of patches back into image space by summing overlaps and
//! normalizing. The weighting mask decays from the patch center toward its
//! border (normalized Chebyshev distance, clipped to configured bounds) so
//! that overlapping regions blend smoothly instead of showing seams; an
//! optional tie-breaker applies the same decay over the patch grid itself.
//!
//! ```text
//! unfold: (B, C, H, W) → (B, C·kh·kw, L)      L = Ly·Lx patches, row-major
//! fold:   (B, C·kh·kw, L) → (B, C, H, W)      overlaps summed
//! merge:  weight patches → fold → divide by folded weights
//! ```
//!
//! `Ly = ⌊(H-kh)/sh⌋ + 1` and likewise for `Lx`. A grid that does not
//! exactly cover the image is accepted — uncovered pixels are the caller's
//! concern. Only the 1:1 scale case is supported; there is no up/downsample
//! factor here.

use candle_core::{DType, Device, IndexOp, Tensor};

use crate::config::{FoldMode, SplitInputParams};
use crate::{Error, Result};

/// Normalized distance to the nearest border for every pixel of an `h`×`w`
/// grid, row-major. Zero at the border, 0.5 in the center.
fn delta_border(h: usize, w: usize) -> Vec<f32> {
    let h_span = (h - 1).max(1) as f64;
    let w_span = (w - 1).max(1) as f64;
    let mut out = Vec::with_capacity(h * w);
    for y in 0..h {
        for x in 0..w {
            let yn = y as f64 / h_span;
            let xn = x as f64 / w_span;
            let dist = yn.min(xn).min(1.0 - yn).min(1.0 - xn);
            out.push(dist as f32);
        }
    }
    out
}

fn clip(values: &mut [f32], lo: f64, hi: f64) {
    for v in values.iter_mut() {
        *v = v.clamp(lo as f32, hi as f32);
    }
}

/// Sum a patch stack `(B, C·kh·kw, L)` back onto the image canvas,
/// accumulating overlapping contributions.
fn fold_stack(
    patches: &Tensor,
    (kh, kw): (usize, usize),
    (sh, sw): (usize, usize),
    tiles_x: usize,
    height: usize,
    width: usize,
) -> Result<Tensor> {
    let (b, ck, l) = patches.dims3()?;
    let c = ck / (kh * kw);
    let mut out = Tensor::zeros((b, c, height, width), patches.dtype(), patches.device())?;
    for j in 0..l {
        let y = (j / tiles_x) * sh;
        let x0 = (j % tiles_x) * sw;
        let patch = patches.i((.., .., j))?.reshape((b, c, kh, kw))?;
        let current = out.narrow(2, y, kh)?.narrow(3, x0, kw)?;
        out = out.slice_assign(
            &[(0..b), (0..c), (y..y + kh), (x0..x0 + kw)],
            &(current + patch)?,
        )?;
    }
    Ok(out)
}

/// Precomputed tiling grid for one image geometry.
///
/// Holds the patch layout, the per-patch weight mask, and the
/// normalization map (the fold of the applied weights), so the per-step
/// unfold/merge inside the sampling loop does no rederivation.
#[derive(Debug, Clone)]
pub struct TileGrid {
    kernel: (usize, usize),
    stride: (usize, usize),
    height: usize,
    width: usize,
    tiles_y: usize,
    tiles_x: usize,
    /// Applied weights, shape `(1, kh·kw, L)`. All-ones for
    /// [`FoldMode::Unweighted`].
    weighting: Tensor,
    /// Fold of `weighting`, shape `(1, 1, H, W)`.
    normalization: Tensor,
}

impl TileGrid {
    /// Build the grid for images shaped like `x` (only dtype, device, and
    /// spatial dims are read). Fails if the image does not admit at least
    /// one full patch per axis.
    pub fn for_image(x: &Tensor, params: &SplitInputParams) -> Result<Self> {
        let (_b, _c, h, w) = x.dims4()?;
        Self::new(h, w, params, x.dtype(), x.device())
    }

    pub fn new(
        height: usize,
        width: usize,
        params: &SplitInputParams,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        params.validate()?;
        let (kh, kw) = params.kernel_size;
        let (sh, sw) = params.stride;
        if height < kh || width < kw {
            return Err(Error::Config(format!(
                "image ({height}, {width}) is smaller than the patch kernel ({kh}, {kw})"
            )));
        }
        let tiles_y = (height - kh) / sh + 1;
        let tiles_x = (width - kw) / sw + 1;
        let num_tiles = tiles_y * tiles_x;

        let per_pixel = match params.fold_mode {
            FoldMode::Weighted => {
                let mut weights = delta_border(kh, kw);
                clip(&mut weights, params.clip_min_weight, params.clip_max_weight);
                weights
            }
            FoldMode::Unweighted => vec![1.0f32; kh * kw],
        };
        let per_tile = if params.tie_breaker && params.fold_mode == FoldMode::Weighted {
            let mut weights = delta_border(tiles_y, tiles_x);
            clip(
                &mut weights,
                params.clip_min_tie_weight,
                params.clip_max_tie_weight,
            );
            weights
        } else {
            vec![1.0f32; num_tiles]
        };

        let mut flat = Vec::with_capacity(kh * kw * num_tiles);
        for &pixel in &per_pixel {
            for &tile in &per_tile {
                flat.push(pixel * tile);
            }
        }
        let weighting =
            Tensor::from_vec(flat, (1, kh * kw, num_tiles), device)?.to_dtype(dtype)?;
        let normalization = fold_stack(
            &weighting,
            params.kernel_size,
            params.stride,
            tiles_x,
            height,
            width,
        )?;

        Ok(Self {
            kernel: params.kernel_size,
            stride: params.stride,
            height,
            width,
            tiles_y,
            tiles_x,
            weighting,
            normalization,
        })
    }

    /// Number of patches along (vertical, horizontal).
    pub fn tiles(&self) -> (usize, usize) {
        (self.tiles_y, self.tiles_x)
    }

    /// Total number of patches `L`.
    pub fn num_tiles(&self) -> usize {
        self.tiles_y * self.tiles_x
    }

    /// Applied per-patch weights, shape `(1, kh·kw, L)`.
    pub fn weighting(&self) -> &Tensor {
        &self.weighting
    }

    /// Summed weight at every output pixel, shape `(1, 1, H, W)`. Zero
    /// wherever the grid leaves coverage gaps.
    pub fn normalization(&self) -> &Tensor {
        &self.normalization
    }

    /// Top-left corner of patch `j` (row-major over the grid).
    fn origin(&self, j: usize) -> (usize, usize) {
        let (sh, sw) = self.stride;
        ((j / self.tiles_x) * sh, (j % self.tiles_x) * sw)
    }

    /// Extract the patch stack: `(B, C, H, W) → (B, C·kh·kw, L)`.
    pub fn unfold(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = x.dims4()?;
        if (h, w) != (self.height, self.width) {
            return Err(Error::Shape(format!(
                "image ({h}, {w}) does not match the grid geometry ({}, {})",
                self.height, self.width
            )));
        }
        let (kh, kw) = self.kernel;
        let mut patches = Vec::with_capacity(self.num_tiles());
        for j in 0..self.num_tiles() {
            let (y, x0) = self.origin(j);
            let patch = x.narrow(2, y, kh)?.narrow(3, x0, kw)?;
            patches.push(patch.reshape((b, c * kh * kw))?);
        }
        Ok(Tensor::stack(&patches, 2)?)
    }

    /// Recompose by summing overlapping contributions:
    /// `(B, C·kh·kw, L) → (B, C, H, W)`.
    pub fn fold(&self, patches: &Tensor) -> Result<Tensor> {
        let (b, ck, l) = patches.dims3()?;
        let (kh, kw) = self.kernel;
        if l != self.num_tiles() || ck % (kh * kw) != 0 {
            return Err(Error::Shape(format!(
                "patch stack ({b}, {ck}, {l}) does not match a ({kh}, {kw}) grid with {} tiles",
                self.num_tiles()
            )));
        }
        fold_stack(
            patches,
            self.kernel,
            self.stride,
            self.tiles_x,
            self.height,
            self.width,
        )
    }

    /// Weight, fold, and normalize a patch stack back into image space.
    ///
    /// Overlapping regions end up as the weighted average of their
    /// contributing patches; with all-ones weights this is a plain
    /// overlap-count average.
    pub fn merge(&self, patches: &Tensor) -> Result<Tensor> {
        let (b, ck, l) = patches.dims3()?;
        let (kh, kw) = self.kernel;
        let c = ck / (kh * kw);
        let weighted = patches
            .reshape((b, c, kh * kw, l))?
            .broadcast_mul(&self.weighting.unsqueeze(1)?)?
            .reshape((b, ck, l))?;
        let folded = self.fold(&weighted)?;
        Ok(folded.broadcast_div(&self.normalization)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn grid(h: usize, w: usize, kernel: usize, stride: usize, mode: FoldMode) -> TileGrid {
        let mut params = SplitInputParams::new(kernel, stride);
        params.fold_mode = mode;
        TileGrid::new(h, w, &params, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn tile_counts_follow_floor_formula() {
        let grid = grid(256, 256, 128, 64, FoldMode::Weighted);
        // (256 - 128) / 64 + 1 = 3 per axis.
        assert_eq!(grid.tiles(), (3, 3));
        assert_eq!(grid.num_tiles(), 9);
    }

    #[test]
    fn unfold_shape_and_patch_order() {
        let device = Device::Cpu;
        // Pixel values encode their column so patch origins are visible.
        let row: Vec<f32> = (0..8).map(|v| v as f32).collect();
        let mut data = Vec::new();
        for _ in 0..8 {
            data.extend_from_slice(&row);
        }
        let x = Tensor::from_vec(data, (1, 1, 8, 8), &device).unwrap();
        let grid = grid(8, 8, 4, 4, FoldMode::Unweighted);

        let patches = grid.unfold(&x).unwrap();
        assert_eq!(patches.dims(), &[1, 16, 4]);
        // Row-major: patch 1 starts at column 4.
        let first_of_patch1: f32 = patches.i((0, 0, 1)).unwrap().to_scalar().unwrap();
        assert_eq!(first_of_patch1, 4.0);
    }

    #[test]
    fn weighted_roundtrip_recovers_constant_exact_tiling() {
        let device = Device::Cpu;
        let x = Tensor::full(0.25f32, (1, 3, 256, 256), &device).unwrap();
        let grid = grid(256, 256, 128, 128, FoldMode::Weighted);

        let merged = grid.merge(&grid.unfold(&x).unwrap()).unwrap();
        let diff: f32 = (&merged - &x)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5, "weights should cancel, max diff = {diff}");
    }

    #[test]
    fn weighted_roundtrip_recovers_constant_with_overlap() {
        let device = Device::Cpu;
        let x = Tensor::full(-0.5f32, (2, 1, 64, 64), &device).unwrap();
        let grid = grid(64, 64, 32, 16, FoldMode::Weighted);

        let merged = grid.merge(&grid.unfold(&x).unwrap()).unwrap();
        let diff: f32 = (&merged - &x)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-4, "overlap blend should average out, max diff = {diff}");
    }

    #[test]
    fn unweighted_roundtrip_averages_overlaps() {
        let device = Device::Cpu;
        let x = Tensor::full(1.5f32, (1, 2, 64, 64), &device).unwrap();
        let grid = grid(64, 64, 32, 16, FoldMode::Unweighted);

        let merged = grid.merge(&grid.unfold(&x).unwrap()).unwrap();
        let diff: f32 = (&merged - &x)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5, "count normalization should cancel, max diff = {diff}");
    }

    #[test]
    fn weighting_respects_clip_bounds() {
        let grid = grid(256, 256, 128, 64, FoldMode::Weighted);
        let weights = grid
            .weighting()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for (i, &weight) in weights.iter().enumerate() {
            // Pixel weight in [0.01, 0.5] times tie weight in [0.01, 0.5].
            assert!(
                (9.9e-5..=0.2501).contains(&weight),
                "weight[{i}] = {weight} outside clipped product range"
            );
        }
    }

    #[test]
    fn kernel_larger_than_image_is_rejected() {
        let params = SplitInputParams::new(128, 64);
        assert!(TileGrid::new(64, 64, &params, DType::F32, &Device::Cpu).is_err());
    }

    #[test]
    fn fold_of_wrong_stack_is_rejected() {
        let device = Device::Cpu;
        let grid = grid(64, 64, 32, 32, FoldMode::Weighted);
        let bad = Tensor::zeros((1, 32 * 32, 3), DType::F32, &device).unwrap();
        assert!(grid.fold(&bad).is_err());
    }
}
