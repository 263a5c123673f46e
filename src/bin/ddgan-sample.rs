//! DDGAN sampling smoke tool.
//!
//! Runs the full reverse-sampling stack (schedule, coefficient tables,
//! base/guided/tiled loops) against a randomly initialized convolutional
//! stub generator and writes the resulting batch to a safetensors file.
//! Trained checkpoints plug in through the [`Generator`] trait and are out
//! of scope here — this binary exists to exercise and benchmark the
//! sampling machinery end to end.
//!
//! # Output
//!
//! Writes a `samples` tensor of shape (batch, channels, height, width),
//! values in [0, 1], to the path given by --output. Also prints a one-line
//! JSON summary to stdout on success:
//!
//! ```json
//! {"path":"samples.safetensors","batch":4,"height":32,"width":32,"steps":4}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder, VarMap};
use clap::Parser;

use ddgan_rs::config::{
    DiffusionConfig, GuidanceConfig, SamplingParams, SplitInputParams, VarianceSchedule,
};
use ddgan_rs::generator::{ConditionEncoder, Conditioning, Generator};
use ddgan_rs::pipeline::SamplingPipeline;

#[derive(Parser, Debug)]
#[command(
    name = "ddgan-sample",
    about = "DDGAN reverse-sampling smoke tool",
    long_about = "Runs the denoising diffusion GAN sampling stack with a randomly\n\
                  initialized stub generator and writes the output batch to a\n\
                  safetensors file. Useful for benchmarking the samplers and\n\
                  validating schedule/tiling configurations without trained weights."
)]
struct Args {
    /// Number of diffusion steps N.
    #[arg(long, default_value_t = 4)]
    num_timesteps: usize,

    /// Minimum noise variance rate.
    #[arg(long, default_value_t = 0.1)]
    beta_min: f64,

    /// Maximum noise variance rate.
    #[arg(long, default_value_t = 20.0)]
    beta_max: f64,

    /// Use the geometric variance schedule instead of variance-preserving.
    #[arg(long, default_value_t = false)]
    use_geometric: bool,

    /// Output image size (square).
    #[arg(long, default_value_t = 32)]
    image_size: usize,

    /// Image channels.
    #[arg(long, default_value_t = 3)]
    num_channels: usize,

    /// Batch size.
    #[arg(long, short = 'b', default_value_t = 4)]
    batch_size: usize,

    /// Latent noise dimension fed to the generator each step.
    #[arg(long, default_value_t = 100)]
    latent_dim: usize,

    /// Classifier-free guidance scale (0 disables guidance).
    #[arg(long, default_value_t = 0.0)]
    guidance_scale: f64,

    /// Dynamic-thresholding quantile (0 disables thresholding).
    #[arg(long, default_value_t = 0.0)]
    dynamic_thresholding_quantile: f64,

    /// Output upscale factor. Values > 1 sample at
    /// image_size × scale_factor through the tiled convolutional path.
    #[arg(long, default_value_t = 1)]
    scale_factor: usize,

    /// Patch stride for the tiled path. Defaults to image_size / 2.
    #[arg(long)]
    tile_stride: Option<usize>,

    /// Random seed. Omit for fresh noise each run.
    #[arg(long, short = 's')]
    seed: Option<u64>,

    /// Output file path (.safetensors).
    #[arg(long, short = 'o', default_value = "samples.safetensors")]
    output: String,
}

/// Randomly initialized two-layer conv net standing in for a trained
/// generator: conv → relu → conv → tanh, ignoring timestep, latent, and
/// conditioning. Deterministic given its (random) weights, as the
/// generator contract requires.
struct StubGenerator {
    conv1: Conv2d,
    conv2: Conv2d,
}

impl StubGenerator {
    fn new(channels: usize, device: &Device) -> ddgan_rs::Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = candle_nn::conv2d(channels, 16, 3, cfg, vb.pp("conv1"))?;
        let conv2 = candle_nn::conv2d(16, channels, 3, cfg, vb.pp("conv2"))?;
        Ok(Self { conv1, conv2 })
    }
}

impl Generator for StubGenerator {
    fn generate(
        &self,
        x_t: &Tensor,
        _t: &Tensor,
        _latent: &Tensor,
        _cond: Option<&Conditioning>,
    ) -> ddgan_rs::Result<Tensor> {
        let h = self.conv1.forward(x_t)?.relu()?;
        Ok(self.conv2.forward(&h)?.tanh()?)
    }
}

/// Zero-embedding encoder standing in for a trained text encoder.
struct StubEncoder {
    device: Device,
}

impl ConditionEncoder for StubEncoder {
    fn encode(&self, texts: &[String]) -> ddgan_rs::Result<Conditioning> {
        let embedding = Tensor::zeros((texts.len(), 768), DType::F32, &self.device)?;
        Ok(Conditioning::new(embedding))
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.scale_factor == 0 {
        anyhow::bail!("scale_factor must be >= 1, got 0");
    }
    let output_path = std::path::Path::new(&args.output);
    if output_path.extension().and_then(|e| e.to_str()) != Some("safetensors") {
        anyhow::bail!("output must be a .safetensors path, got '{}'", args.output);
    }
    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let device = Device::cuda_if_available(0)?;
    tracing::info!("Using device: {:?}", device);

    let config = DiffusionConfig {
        num_timesteps: args.num_timesteps,
        beta_min: args.beta_min,
        beta_max: args.beta_max,
        schedule: if args.use_geometric {
            VarianceSchedule::Geometric
        } else {
            VarianceSchedule::VariancePreserving
        },
    };
    let pipeline = SamplingPipeline::new(config, device.clone())
        .map_err(|e| anyhow::anyhow!("failed to build pipeline: {e}"))?;

    let output_size = args.image_size * args.scale_factor;
    let split_input = (args.scale_factor > 1).then(|| {
        SplitInputParams::new(
            args.image_size,
            args.tile_stride.unwrap_or(args.image_size / 2),
        )
    });
    let params = SamplingParams {
        batch_size: args.batch_size,
        channels: args.num_channels,
        height: output_size,
        width: output_size,
        latent_dim: args.latent_dim,
        guidance: GuidanceConfig {
            scale: args.guidance_scale,
            dynamic_thresholding_quantile: args.dynamic_thresholding_quantile,
        },
        split_input,
        seed: args.seed,
    };

    let generator = StubGenerator::new(args.num_channels, &device)?;
    let encoder = StubEncoder {
        device: device.clone(),
    };
    let needs_cond = params.guidance.scale != 0.0 || params.split_input.is_some();
    let cond = if needs_cond {
        Some(encoder.encode(&vec![String::new(); args.batch_size])?)
    } else {
        None
    };

    tracing::info!(
        "Sampling {}x{}x{} (batch {}, {} steps)...",
        args.num_channels,
        output_size,
        output_size,
        args.batch_size,
        args.num_timesteps
    );

    let samples = pipeline
        .generate(
            &generator,
            needs_cond.then_some(&encoder as &dyn ConditionEncoder),
            cond.as_ref(),
            &params,
        )
        .map_err(|e| anyhow::anyhow!("sampling failed: {e}"))?;

    candle_core::safetensors::save(
        &std::collections::HashMap::from([("samples".to_string(), samples)]),
        &args.output,
    )?;

    // Print machine-readable summary to stdout for the caller
    println!(
        r#"{{"path":"{path}","batch":{batch},"height":{size},"width":{size},"steps":{steps}}}"#,
        path = args.output,
        batch = args.batch_size,
        size = output_size,
        steps = args.num_timesteps,
    );

    Ok(())
}
