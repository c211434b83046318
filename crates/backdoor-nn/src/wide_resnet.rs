//! Wide residual network with channel-attention gates in the last stage.
//!
//! Architecture for widen factor `w` and `n = (depth - 4) / 6` blocks per stage:
//!
//! ```text
//! conv3x3(3 -> 16)
//!   -> stage1: n plain blocks, 16 -> 16w, stride 1
//!   -> stage2: n plain blocks, 16w -> 32w, stride 2
//!   -> stage3: n gated blocks, 32w -> 64w, stride 2   (collects gates)
//!   -> BN -> LeakyReLU(0.1) -> global average pool -> linear -> logits
//! ```
//!
//! The gates of stage 3 are concatenated along the channel axis. With a
//! partial fraction `p < 1` only the first `floor(64w * p)` channels of each
//! block's gate are kept.

use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::activation::LeakyReLU;
use crate::attention::AttentionVariant;
use crate::checkpoint::{join_name, StateDict, StateVisitor};
use crate::conv::{Conv2d, Conv2dConfig};
use crate::dense::Linear;
use crate::error::{LayerError, LayerResult};
use crate::layer::Layer;
use crate::normalization::BatchNorm2d;
use crate::residual::{BasicBlock, GatedBlock, LEAKY_SLOPE};
use crate::stage::{Stage, StageConfig};
use crate::tensor::{feature_map_dims, global_avg_pool};

/// Number of input image channels.
pub const INPUT_CHANNELS: usize = 3;

/// Configuration for a [`WideResNet`].
///
/// # Example
///
/// ```
/// use backdoor_nn::attention::AttentionVariant;
/// use backdoor_nn::wide_resnet::WideResNetConfig;
///
/// let config = WideResNetConfig::new(10)
///     .with_depth(16)
///     .with_widen_factor(1)
///     .with_attention_variant(AttentionVariant::Depthwise)
///     .with_partial_fraction(0.5);
/// assert!(config.validate().is_ok());
/// assert_eq!(config.blocks_per_stage(), 2);
/// assert_eq!(config.gate_width(), 2 * 32);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WideResNetConfig {
    /// Number of output classes.
    pub num_classes: usize,
    /// Network depth; `(depth - 4) % 6` must be zero (default: 28).
    pub depth: usize,
    /// Channel multiplier (default: 2).
    pub widen_factor: usize,
    /// Dropout rate inside every block (default: 0.0).
    pub dropout_rate: f32,
    /// Gate variant of stage 3 (default: bottleneck).
    pub attention_variant: AttentionVariant,
    /// Fraction of each block's gate channels that are returned (default: 1.0).
    pub partial_fraction: f64,
    /// Seed for weight initialization; random when unset.
    pub seed: Option<u64>,
}

impl Default for WideResNetConfig {
    fn default() -> Self {
        Self {
            num_classes: 10,
            depth: 28,
            widen_factor: 2,
            dropout_rate: 0.0,
            attention_variant: AttentionVariant::default(),
            partial_fraction: 1.0,
            seed: None,
        }
    }
}

impl WideResNetConfig {
    /// Creates a configuration with default values.
    ///
    /// Default values:
    /// - depth: 28
    /// - widen_factor: 2
    /// - dropout_rate: 0.0
    /// - attention_variant: bottleneck
    /// - partial_fraction: 1.0
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            ..Self::default()
        }
    }

    /// Sets the depth.
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// Sets the widen factor.
    pub fn with_widen_factor(mut self, widen_factor: usize) -> Self {
        self.widen_factor = widen_factor;
        self
    }

    /// Sets the dropout rate.
    pub fn with_dropout_rate(mut self, dropout_rate: f32) -> Self {
        self.dropout_rate = dropout_rate;
        self
    }

    /// Sets the gate variant.
    pub fn with_attention_variant(mut self, variant: AttentionVariant) -> Self {
        self.attention_variant = variant;
        self
    }

    /// Sets the partial fraction.
    pub fn with_partial_fraction(mut self, partial_fraction: f64) -> Self {
        self.partial_fraction = partial_fraction;
        self
    }

    /// Sets the initialization seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Number of residual blocks per stage.
    pub fn blocks_per_stage(&self) -> usize {
        self.depth.saturating_sub(4) / 6
    }

    /// Channel widths `[stem, stage1, stage2, stage3]`.
    ///
    /// Saturates at `usize::MAX`; [`validate`](Self::validate) rejects such widths.
    pub fn channels(&self) -> [usize; 4] {
        let w = self.widen_factor;
        [
            16,
            w.saturating_mul(16),
            w.saturating_mul(32),
            w.saturating_mul(64),
        ]
    }

    /// Gate channels returned per stage-3 block.
    pub fn gate_width_per_block(&self) -> usize {
        let width = self.channels()[3];
        if self.partial_fraction >= 1.0 {
            width
        } else {
            (width as f64 * self.partial_fraction).floor() as usize
        }
    }

    /// Total width of the concatenated gate tensor.
    pub fn gate_width(&self) -> usize {
        self.blocks_per_stage()
            .saturating_mul(self.gate_width_per_block())
    }

    /// Checks every construction constraint.
    pub fn validate(&self) -> LayerResult<()> {
        if self.num_classes == 0 {
            return Err(LayerError::config("num_classes must be positive"));
        }
        if self.widen_factor == 0 {
            return Err(LayerError::config("widen_factor must be positive"));
        }
        if self
            .widen_factor
            .checked_mul(64)
            .and_then(|width| width.checked_mul(self.blocks_per_stage()))
            .is_none()
        {
            return Err(LayerError::config(format!(
                "widen_factor {} is too large",
                self.widen_factor
            )));
        }
        if self.depth < 10 || (self.depth - 4) % 6 != 0 {
            return Err(LayerError::config(format!(
                "depth must satisfy (depth - 4) % 6 == 0 with at least one block per stage, got {}",
                self.depth
            )));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(LayerError::config(format!(
                "dropout rate must lie in [0, 1), got {}",
                self.dropout_rate
            )));
        }
        if !(self.partial_fraction > 0.0 && self.partial_fraction <= 1.0) {
            return Err(LayerError::config(format!(
                "partial_fraction must lie in (0, 1], got {}",
                self.partial_fraction
            )));
        }
        if self.gate_width_per_block() == 0 {
            return Err(LayerError::config(format!(
                "partial_fraction {} keeps no gate channels of {}",
                self.partial_fraction,
                self.channels()[3]
            )));
        }
        Ok(())
    }

    /// Builds and initializes the network on `device`.
    pub fn build(&self, device: &Device) -> LayerResult<WideResNet> {
        WideResNet::new(self.clone(), device)
    }
}

/// Result of a forward pass.
#[derive(Debug, Clone)]
pub struct WideResNetOutput {
    /// Class scores of shape `(B, num_classes)`.
    pub logits: Tensor,
    /// Concatenated stage-3 gates of shape `(B, gate_width)`.
    pub gates: Tensor,
}

/// Wide residual network whose last stage is attention-gated.
///
/// # Example
///
/// ```
/// use backdoor_nn::wide_resnet::WideResNetConfig;
/// use candle_core::{Device, Tensor};
///
/// let net = WideResNetConfig::new(10)
///     .with_depth(10)
///     .with_widen_factor(1)
///     .with_seed(0)
///     .build(&Device::Cpu)
///     .unwrap();
/// let images = Tensor::randn(0f32, 1.0, (2, 3, 16, 16), &Device::Cpu).unwrap();
/// let output = net.forward_with_gates(&images).unwrap();
/// assert_eq!(output.logits.dims(), &[2, 10]);
/// assert_eq!(output.gates.dims(), &[2, 64]);
/// ```
#[derive(Debug)]
pub struct WideResNet {
    conv1: Conv2d,
    block1: Stage<BasicBlock>,
    block2: Stage<BasicBlock>,
    block3: Stage<GatedBlock>,
    bn1: BatchNorm2d,
    relu: LeakyReLU,
    fc: Linear,
    config: WideResNetConfig,
    training: bool,
}

impl WideResNet {
    /// Builds and initializes a network.
    ///
    /// # Errors
    ///
    /// Returns a [`LayerError::ConfigError`] if the configuration is invalid.
    pub fn new(config: WideResNetConfig, device: &Device) -> LayerResult<Self> {
        config.validate()?;
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let n = config.blocks_per_stage();
        let [stem, c1, c2, c3] = config.channels();

        let conv1 = Conv2dConfig::new(INPUT_CHANNELS, stem, 3)
            .with_padding(1)
            .build(&mut rng, device)?;
        let block1 = Stage::new(
            StageConfig::new(n, stem, c1, 1)
                .with_dropout_rate(config.dropout_rate)
                .with_activate_before_residual(true),
            &mut rng,
            device,
        )?;
        let block2 = Stage::new(
            StageConfig::new(n, c1, c2, 2).with_dropout_rate(config.dropout_rate),
            &mut rng,
            device,
        )?;
        let block3 = Stage::new(
            StageConfig::new(n, c2, c3, 2)
                .with_dropout_rate(config.dropout_rate)
                .with_attention_variant(config.attention_variant),
            &mut rng,
            device,
        )?;
        let bn1 = BatchNorm2d::new(c3, device)?;
        let fc = Linear::new(c3, config.num_classes, &mut rng, device)?;

        let net = Self {
            conv1,
            block1,
            block2,
            block3,
            bn1,
            relu: LeakyReLU::new(LEAKY_SLOPE)?,
            fc,
            config,
            training: true,
        };
        info!(
            depth = net.config.depth,
            widen_factor = net.config.widen_factor,
            num_classes = net.config.num_classes,
            attention = %net.config.attention_variant,
            gate_width = net.config.gate_width(),
            parameters = net.num_parameters(),
            "built wide resnet"
        );
        Ok(net)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &WideResNetConfig {
        &self.config
    }

    /// Runs the network and returns logits together with the stage-3 gates.
    ///
    /// # Errors
    ///
    /// Fails unless the input is `(B, 3, H, W)`.
    pub fn forward_with_gates(&self, images: &Tensor) -> LayerResult<WideResNetOutput> {
        let (batch, channels, _, _) = feature_map_dims(images)?;
        if channels != INPUT_CHANNELS {
            return Err(LayerError::InvalidInputDimension {
                expected: INPUT_CHANNELS,
                actual: channels,
            });
        }

        let out = self.conv1.forward(images)?;
        let out = self.block1.forward(&out)?;
        let out = self.block2.forward(&out)?;
        let (out, block_gates) = self.block3.forward_with_gates(&out)?;

        let keep = self.config.gate_width_per_block();
        let block_gates = block_gates
            .into_iter()
            .map(|gate| {
                if keep < gate.dim(1)? {
                    gate.narrow(1, 0, keep)
                } else {
                    Ok(gate)
                }
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        let gates = Tensor::cat(&block_gates, 1)?;
        debug!(batch, blocks = block_gates.len(), width = gates.dim(1)?, "collected gates");

        let out = self.relu.forward(&self.bn1.forward(&out)?)?;
        let pooled = global_avg_pool(&out)?.flatten_from(1)?;
        let logits = self.fc.forward(&pooled)?;

        Ok(WideResNetOutput { logits, gates })
    }
}

impl Layer for WideResNet {
    /// Returns the logits only.
    fn forward(&self, input: &Tensor) -> LayerResult<Tensor> {
        Ok(self.forward_with_gates(input)?.logits)
    }

    fn parameters(&self) -> Vec<&Var> {
        let mut params = self.conv1.parameters();
        params.extend(self.block1.parameters());
        params.extend(self.block2.parameters());
        params.extend(self.block3.parameters());
        params.extend(self.bn1.parameters());
        params.extend(self.fc.parameters());
        params
    }

    fn name(&self) -> &str {
        "WideResNet"
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        self.block1.set_training(training);
        self.block2.set_training(training);
        self.block3.set_training(training);
        self.bn1.set_training(training);
    }
}

impl StateDict for WideResNet {
    fn visit_state(&self, prefix: &str, visitor: &mut dyn StateVisitor) -> LayerResult<()> {
        self.conv1.visit_state(&join_name(prefix, "conv1"), visitor)?;
        self.block1.visit_state(&join_name(prefix, "block1"), visitor)?;
        self.block2.visit_state(&join_name(prefix, "block2"), visitor)?;
        self.block3.visit_state(&join_name(prefix, "block3"), visitor)?;
        self.bn1.visit_state(&join_name(prefix, "bn1"), visitor)?;
        self.fc.visit_state(&join_name(prefix, "fc"), visitor)
    }
}

/// Builds a depth-28 network with the default gate settings.
pub fn cdwrn28(num_classes: usize, widen_factor: usize, device: &Device) -> LayerResult<WideResNet> {
    WideResNetConfig::new(num_classes)
        .with_depth(28)
        .with_widen_factor(widen_factor)
        .build(device)
}
