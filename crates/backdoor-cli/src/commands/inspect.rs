//! Inspect Command Implementation
//!
//! Builds a gated wide residual network, optionally restores its weights,
//! runs an evaluation-mode forward pass and summarizes the attention gates.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use backdoor_nn::prelude::*;
use backdoor_triggers::rgb_to_array;
use clap::Args;
use serde::Serialize;
use tracing::info;

/// Run a gated wide residual network and report logits and gates
///
/// # Example
///
/// ```bash
/// backdoor inspect \
///     --depth 28 \
///     --widen-factor 2 \
///     --attention 1 \
///     --weights cdwrn28.safetensors \
///     --normalize \
///     clean.png poisoned.png
/// ```
#[derive(Args, Debug, Clone)]
pub struct InspectCommand {
    /// JSON network configuration; takes precedence over the network flags
    #[arg(long, short = 'c', env = "BACKDOOR_MODEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of output classes
    #[arg(long, default_value_t = 10)]
    pub num_classes: usize,

    /// Network depth, (depth - 4) must be a multiple of 6
    #[arg(long, default_value_t = 28)]
    pub depth: usize,

    /// Channel multiplier
    #[arg(long, default_value_t = 2)]
    pub widen_factor: usize,

    /// Gate variant: 1/bottleneck, 2/depthwise or 3/dense
    #[arg(long, default_value = "1")]
    pub attention: AttentionVariant,

    /// Fraction of each block's gate channels to report
    #[arg(long, default_value_t = 1.0)]
    pub partial: f64,

    /// Initialization seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Safetensors checkpoint to load
    #[arg(long, short = 'w', env = "BACKDOOR_WEIGHTS")]
    pub weights: Option<PathBuf>,

    /// Normalize images with CIFAR-10 channel statistics
    #[arg(long)]
    pub normalize: bool,

    /// Batch size of the random input used when no images are given
    #[arg(long, default_value_t = 4)]
    pub batch_size: usize,

    /// Side length of the random input used when no images are given
    #[arg(long, default_value_t = 32)]
    pub image_size: usize,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Images to classify (all of the same size)
    pub images: Vec<PathBuf>,
}

/// Summary statistics of one block's gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateStats {
    /// Block index within stage 3
    pub block: usize,
    /// Mean gate value over batch and channels
    pub mean: f32,
    /// Smallest gate value
    pub min: f32,
    /// Largest gate value
    pub max: f32,
}

/// Result of an inspection run.
#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    /// Shape of the logits tensor
    pub logits_shape: Vec<usize>,
    /// Shape of the concatenated gate tensor
    pub gates_shape: Vec<usize>,
    /// Arg-max class per sample
    pub predictions: Vec<u32>,
    /// Per-block gate statistics
    pub gate_stats: Vec<GateStats>,
}

impl InspectCommand {
    /// Resolves the network configuration from the config file or the flags.
    pub fn model_config(&self) -> Result<WideResNetConfig> {
        let config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read model config {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Invalid model config {}", path.display()))?
            }
            None => {
                let mut config = WideResNetConfig::new(self.num_classes)
                    .with_depth(self.depth)
                    .with_widen_factor(self.widen_factor)
                    .with_attention_variant(self.attention)
                    .with_partial_fraction(self.partial);
                config.seed = self.seed;
                config
            }
        };
        config.validate().context("Invalid network configuration")?;
        Ok(config)
    }

    fn load_batch(&self, device: &Device) -> Result<Tensor> {
        if self.images.is_empty() {
            if self.batch_size == 0 || self.image_size == 0 {
                bail!("--batch-size and --image-size must be positive");
            }
            info!(
                "No images given, using a random {}x3x{}x{} batch",
                self.batch_size, self.image_size, self.image_size
            );
            let shape = (self.batch_size, 3, self.image_size, self.image_size);
            return Ok(Tensor::rand(0f32, 1f32, shape, device)?);
        }

        let arrays = self
            .images
            .iter()
            .map(|path| {
                let rgb = image::open(path)
                    .with_context(|| format!("Failed to open image {}", path.display()))?
                    .to_rgb8();
                Ok(rgb_to_array(&rgb)?)
            })
            .collect::<Result<Vec<_>>>()?;
        let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
        let normalization = self.normalize.then(ChannelNormalization::cifar10);
        images_to_batch(&views, normalization.as_ref(), device)
            .context("Failed to assemble the input batch")
    }

    /// Runs the network and collects the report.
    pub fn inspect(&self) -> Result<InspectReport> {
        let config = self.model_config()?;
        let device = best_device();
        info!("Device: {:?}", device);

        let mut net = config.build(&device).context("Failed to build network")?;
        if let Some(path) = &self.weights {
            net.load_weights(path, &device)
                .with_context(|| format!("Failed to load weights from {}", path.display()))?;
            info!("Loaded weights from {}", path.display());
        }
        net.set_training(false);

        let batch = self.load_batch(&device)?;
        let WideResNetOutput { logits, gates } = net.forward_with_gates(&batch)?;

        let width = config.gate_width_per_block();
        let gate_stats = (0..config.blocks_per_stage())
            .map(|block| {
                let values = gates
                    .narrow(1, block * width, width)?
                    .flatten_all()?
                    .to_vec1::<f32>()?;
                Ok(summarize(block, &values))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(InspectReport {
            logits_shape: logits.dims().to_vec(),
            gates_shape: gates.dims().to_vec(),
            predictions: logits.argmax(1)?.to_vec1::<u32>()?,
            gate_stats,
        })
    }

    /// Execute the inspect command
    pub fn run(&self) -> Result<()> {
        let report = self.inspect()?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        println!("logits: {:?}", report.logits_shape);
        println!("gates:  {:?}", report.gates_shape);
        println!("predictions: {:?}", report.predictions);
        for stats in &report.gate_stats {
            println!(
                "block3.{}  mean {:.4}  min {:.4}  max {:.4}",
                stats.block, stats.mean, stats.min, stats.max
            );
        }
        Ok(())
    }
}

fn summarize(block: usize, values: &[f32]) -> GateStats {
    let sum: f32 = values.iter().sum();
    GateStats {
        block,
        mean: sum / values.len().max(1) as f32,
        min: values.iter().copied().fold(f32::INFINITY, f32::min),
        max: values.iter().copied().fold(f32::NEG_INFINITY, f32::max),
    }
}
