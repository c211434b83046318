//! Pre-activation residual blocks.
//!
//! Both block kinds share the same body:
//!
//! ```text
//! x -> BN -> LeakyReLU(0.1) -> conv3x3(stride) -> BN -> LeakyReLU(0.1)
//!   -> dropout -> conv3x3 -> (+ shortcut)
//! ```
//!
//! The shortcut is the identity when the channel counts agree, otherwise a
//! strided 1x1 projection. When the channel counts differ the block either
//! feeds the activated input to both paths (`activate_before_residual`) or the
//! raw input to both. [`GatedBlock`] additionally rescales the residual branch
//! by a [`ChannelAttention`] gate before the addition and returns that gate.

use candle_core::{Device, Tensor, Var};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::activation::LeakyReLU;
use crate::attention::{AttentionVariant, ChannelAttention};
use crate::checkpoint::{join_name, StateDict, StateVisitor};
use crate::conv::{Conv2d, Conv2dConfig};
use crate::dropout::Dropout;
use crate::error::{LayerError, LayerResult};
use crate::layer::Layer;
use crate::normalization::BatchNorm2d;
use crate::tensor::ensure_same_shape;

/// Negative slope of every LeakyReLU in the network.
pub const LEAKY_SLOPE: f64 = 0.1;

/// Configuration of a single residual block.
///
/// # Example
///
/// ```
/// use backdoor_nn::residual::BlockConfig;
///
/// let config = BlockConfig::new(32, 64, 2).with_dropout_rate(0.3);
/// assert!(!config.equal_in_out());
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlockConfig {
    /// Number of input channels.
    pub in_channels: usize,
    /// Number of output channels.
    pub out_channels: usize,
    /// Stride of the first convolution and of the shortcut projection.
    pub stride: usize,
    /// Dropout rate between the two convolutions (default: 0.0).
    pub dropout_rate: f32,
    /// Feed the activated input to the shortcut when channels change (default: false).
    pub activate_before_residual: bool,
    /// Gate variant, used by [`GatedBlock`] only (default: bottleneck).
    pub attention_variant: AttentionVariant,
}

impl BlockConfig {
    /// Creates a block configuration with default options.
    pub fn new(in_channels: usize, out_channels: usize, stride: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            stride,
            dropout_rate: 0.0,
            activate_before_residual: false,
            attention_variant: AttentionVariant::default(),
        }
    }

    /// Sets the dropout rate.
    pub fn with_dropout_rate(mut self, dropout_rate: f32) -> Self {
        self.dropout_rate = dropout_rate;
        self
    }

    /// Sets whether the activated input also feeds the shortcut.
    pub fn with_activate_before_residual(mut self, activate: bool) -> Self {
        self.activate_before_residual = activate;
        self
    }

    /// Sets the gate variant.
    pub fn with_attention_variant(mut self, variant: AttentionVariant) -> Self {
        self.attention_variant = variant;
        self
    }

    /// Whether the shortcut is the identity.
    pub fn equal_in_out(&self) -> bool {
        self.in_channels == self.out_channels
    }

    /// Checks the configuration for consistency.
    pub fn validate(&self) -> LayerResult<()> {
        if self.in_channels == 0 || self.out_channels == 0 {
            return Err(LayerError::config(format!(
                "block channels must be positive, got {} -> {}",
                self.in_channels, self.out_channels
            )));
        }
        if self.stride == 0 {
            return Err(LayerError::config("block stride must be positive"));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(LayerError::config(format!(
                "dropout rate must lie in [0, 1), got {}",
                self.dropout_rate
            )));
        }
        Ok(())
    }
}

/// A residual block built from a [`BlockConfig`].
pub trait ResidualUnit: Layer + StateDict + Sized {
    /// Builds and initializes a block.
    fn from_config<R: Rng + ?Sized>(
        config: BlockConfig,
        rng: &mut R,
        device: &Device,
    ) -> LayerResult<Self>;

    /// Returns the block configuration.
    fn config(&self) -> &BlockConfig;
}

#[derive(Debug)]
struct ResidualBody {
    bn1: BatchNorm2d,
    conv1: Conv2d,
    bn2: BatchNorm2d,
    conv2: Conv2d,
    relu: LeakyReLU,
    dropout: Dropout,
    shortcut: Option<Conv2d>,
    config: BlockConfig,
}

impl ResidualBody {
    fn new<R: Rng + ?Sized>(config: BlockConfig, rng: &mut R, device: &Device) -> LayerResult<Self> {
        config.validate()?;
        let BlockConfig {
            in_channels,
            out_channels,
            stride,
            ..
        } = config;

        let bn1 = BatchNorm2d::new(in_channels, device)?;
        let conv1 = Conv2dConfig::new(in_channels, out_channels, 3)
            .with_stride(stride)
            .with_padding(1)
            .build(rng, device)?;
        let bn2 = BatchNorm2d::new(out_channels, device)?;
        let conv2 = Conv2dConfig::new(out_channels, out_channels, 3)
            .with_padding(1)
            .build(rng, device)?;
        let shortcut = if config.equal_in_out() {
            None
        } else {
            Some(
                Conv2dConfig::new(in_channels, out_channels, 1)
                    .with_stride(stride)
                    .build(rng, device)?,
            )
        };

        Ok(Self {
            bn1,
            conv1,
            bn2,
            conv2,
            relu: LeakyReLU::new(LEAKY_SLOPE)?,
            dropout: Dropout::new(config.dropout_rate)?,
            shortcut,
            config,
        })
    }

    fn activate(&self, input: &Tensor) -> LayerResult<Tensor> {
        self.relu.forward(&self.bn1.forward(input)?)
    }

    /// Returns `(shortcut, residual)` before they are added.
    fn branches(&self, input: &Tensor) -> LayerResult<(Tensor, Tensor)> {
        let (residual_in, shortcut_in) = if self.config.equal_in_out() {
            (self.activate(input)?, input.clone())
        } else if self.config.activate_before_residual {
            let activated = self.activate(input)?;
            (activated.clone(), activated)
        } else {
            (input.clone(), input.clone())
        };

        let out = self.conv1.forward(&residual_in)?;
        let out = self.relu.forward(&self.bn2.forward(&out)?)?;
        let out = self.dropout.forward(&out)?;
        let out = self.conv2.forward(&out)?;

        let shortcut = match &self.shortcut {
            Some(projection) => projection.forward(&shortcut_in)?,
            None => shortcut_in,
        };
        Ok((shortcut, out))
    }

    fn parameters(&self) -> Vec<&Var> {
        let mut params = self.bn1.parameters();
        params.extend(self.conv1.parameters());
        params.extend(self.bn2.parameters());
        params.extend(self.conv2.parameters());
        if let Some(projection) = &self.shortcut {
            params.extend(projection.parameters());
        }
        params
    }

    fn set_training(&mut self, training: bool) {
        self.bn1.set_training(training);
        self.bn2.set_training(training);
        self.dropout.set_training(training);
    }

    fn visit_state(&self, prefix: &str, visitor: &mut dyn StateVisitor) -> LayerResult<()> {
        self.bn1.visit_state(&join_name(prefix, "bn1"), visitor)?;
        self.conv1.visit_state(&join_name(prefix, "conv1"), visitor)?;
        self.bn2.visit_state(&join_name(prefix, "bn2"), visitor)?;
        self.conv2.visit_state(&join_name(prefix, "conv2"), visitor)?;
        if let Some(projection) = &self.shortcut {
            projection.visit_state(&join_name(prefix, "convShortcut"), visitor)?;
        }
        Ok(())
    }
}

fn add_residual(shortcut: &Tensor, residual: &Tensor) -> LayerResult<Tensor> {
    ensure_same_shape(shortcut, residual)?;
    Ok((shortcut + residual)?)
}

/// Residual block without attention.
///
/// # Example
///
/// ```
/// use backdoor_nn::residual::{BasicBlock, BlockConfig, ResidualUnit};
/// use backdoor_nn::layer::Layer;
/// use candle_core::{Device, Tensor};
/// use rand::SeedableRng;
///
/// let mut rng = rand::rngs::StdRng::seed_from_u64(0);
/// let block = BasicBlock::from_config(BlockConfig::new(16, 32, 2), &mut rng, &Device::Cpu).unwrap();
/// let input = Tensor::randn(0f32, 1.0, (2, 16, 8, 8), &Device::Cpu).unwrap();
/// assert_eq!(block.forward(&input).unwrap().dims(), &[2, 32, 4, 4]);
/// ```
#[derive(Debug)]
pub struct BasicBlock {
    body: ResidualBody,
    training: bool,
}

impl ResidualUnit for BasicBlock {
    fn from_config<R: Rng + ?Sized>(
        config: BlockConfig,
        rng: &mut R,
        device: &Device,
    ) -> LayerResult<Self> {
        Ok(Self {
            body: ResidualBody::new(config, rng, device)?,
            training: true,
        })
    }

    fn config(&self) -> &BlockConfig {
        &self.body.config
    }
}

impl Layer for BasicBlock {
    fn forward(&self, input: &Tensor) -> LayerResult<Tensor> {
        let (shortcut, residual) = self.body.branches(input)?;
        add_residual(&shortcut, &residual)
    }

    fn parameters(&self) -> Vec<&Var> {
        self.body.parameters()
    }

    fn name(&self) -> &str {
        "BasicBlock"
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        self.body.set_training(training);
    }
}

impl StateDict for BasicBlock {
    fn visit_state(&self, prefix: &str, visitor: &mut dyn StateVisitor) -> LayerResult<()> {
        self.body.visit_state(prefix, visitor)
    }
}

/// Residual block whose residual branch is rescaled by a channel gate.
#[derive(Debug)]
pub struct GatedBlock {
    body: ResidualBody,
    attention: ChannelAttention,
    training: bool,
}

impl GatedBlock {
    /// Runs the block and returns `(output, gate)`.
    ///
    /// The gate has shape `(B, out_channels)`; the batch axis is kept even when
    /// `B == 1`.
    pub fn forward_with_gate(&self, input: &Tensor) -> LayerResult<(Tensor, Tensor)> {
        let (shortcut, residual) = self.body.branches(input)?;
        let gate = self.attention.gate(&residual)?;
        let gated = residual.broadcast_mul(&gate)?;
        let output = add_residual(&shortcut, &gated)?;
        Ok((output, gate.flatten_from(1)?))
    }

    /// Returns the attention module.
    pub fn attention(&self) -> &ChannelAttention {
        &self.attention
    }
}

impl ResidualUnit for GatedBlock {
    fn from_config<R: Rng + ?Sized>(
        config: BlockConfig,
        rng: &mut R,
        device: &Device,
    ) -> LayerResult<Self> {
        let body = ResidualBody::new(config, rng, device)?;
        let attention =
            ChannelAttention::new(config.out_channels, config.attention_variant, rng, device)?;
        Ok(Self {
            body,
            attention,
            training: true,
        })
    }

    fn config(&self) -> &BlockConfig {
        &self.body.config
    }
}

impl Layer for GatedBlock {
    fn forward(&self, input: &Tensor) -> LayerResult<Tensor> {
        Ok(self.forward_with_gate(input)?.0)
    }

    fn parameters(&self) -> Vec<&Var> {
        let mut params = self.body.parameters();
        params.extend(self.attention.parameters());
        params
    }

    fn name(&self) -> &str {
        "GatedBlock"
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        self.body.set_training(training);
    }
}

impl StateDict for GatedBlock {
    fn visit_state(&self, prefix: &str, visitor: &mut dyn StateVisitor) -> LayerResult<()> {
        self.body.visit_state(prefix, visitor)?;
        self.attention.visit_state(&join_name(prefix, "attn"), visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn block<B: ResidualUnit>(config: BlockConfig) -> B {
        let mut rng = StdRng::seed_from_u64(11);
        B::from_config(config, &mut rng, &Device::Cpu).unwrap()
    }

    fn randn(shape: (usize, usize, usize, usize)) -> Tensor {
        Tensor::randn(0f32, 1.0, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_identity_block_preserves_shape() {
        let block: BasicBlock = block(BlockConfig::new(16, 16, 1));
        let input = randn((2, 16, 8, 8));
        assert_eq!(block.forward(&input).unwrap().dims(), input.dims());
    }

    #[test]
    fn test_projection_block_changes_channels_and_stride() {
        for activate in [false, true] {
            let config = BlockConfig::new(16, 32, 2).with_activate_before_residual(activate);
            let block: BasicBlock = block(config);
            let output = block.forward(&randn((2, 16, 8, 8))).unwrap();
            assert_eq!(output.dims(), &[2, 32, 4, 4]);
        }
    }

    #[test]
    fn test_shortcut_only_when_channels_change() {
        let identity: BasicBlock = block(BlockConfig::new(32, 32, 1));
        let projection: BasicBlock = block(BlockConfig::new(16, 32, 1));
        // bn1 + conv1 + bn2 + conv2 (weights and biases)
        assert_eq!(identity.parameters().len(), 8);
        assert_eq!(projection.parameters().len(), 10);

        let names = projection.state_dict().unwrap();
        assert!(names.contains_key("convShortcut.weight"));
        assert!(!identity.state_dict().unwrap().contains_key("convShortcut.weight"));
    }

    fn flat(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    fn assert_close(actual: &Tensor, expected: &Tensor) {
        for (a, e) in flat(actual).iter().zip(flat(expected)) {
            assert!((a - e).abs() < 1e-4, "{a} vs {e}");
        }
    }

    fn residual_path(body: &ResidualBody, input: &Tensor) -> Tensor {
        let out = body.conv1.forward(input).unwrap();
        let out = body.relu.forward(&body.bn2.forward(&out).unwrap()).unwrap();
        body.conv2.forward(&out).unwrap()
    }

    #[test]
    fn test_identity_routing_matches_manual_computation() {
        let mut block: BasicBlock = block(BlockConfig::new(8, 8, 1));
        block.set_training(false);
        let input = randn((2, 8, 5, 5));

        let activated = block.body.activate(&input).unwrap();
        let expected = (&input + residual_path(&block.body, &activated)).unwrap();
        assert_close(&block.forward(&input).unwrap(), &expected);

        // the shortcut must see the raw input, not the activated one
        let wrong = (&activated + residual_path(&block.body, &activated)).unwrap();
        assert_ne!(flat(&block.forward(&input).unwrap()), flat(&wrong));
    }

    #[test]
    fn test_projection_routing_matches_manual_computation() {
        for activate in [false, true] {
            let config = BlockConfig::new(8, 16, 2).with_activate_before_residual(activate);
            let mut block: BasicBlock = block(config);
            block.set_training(false);
            let input = randn((2, 8, 6, 6));

            let routed = if activate {
                block.body.activate(&input).unwrap()
            } else {
                input.clone()
            };
            let projection = block.body.shortcut.as_ref().unwrap();
            let expected = (projection.forward(&routed).unwrap()
                + residual_path(&block.body, &routed))
            .unwrap();
            assert_close(&block.forward(&input).unwrap(), &expected);
        }
    }

    #[test]
    fn test_strided_identity_is_shape_error() {
        // Identity shortcut cannot follow a strided residual branch.
        let block: BasicBlock = block(BlockConfig::new(8, 8, 2));
        assert!(matches!(
            block.forward(&randn((1, 8, 8, 8))),
            Err(LayerError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_block_config() {
        let mut rng = StdRng::seed_from_u64(0);
        let bad_dropout = BlockConfig::new(8, 8, 1).with_dropout_rate(1.0);
        assert!(BasicBlock::from_config(bad_dropout, &mut rng, &Device::Cpu).is_err());
        let bad_stride = BlockConfig::new(8, 8, 0);
        assert!(BasicBlock::from_config(bad_stride, &mut rng, &Device::Cpu).is_err());
    }

    #[test]
    fn test_gated_block_returns_gate() {
        for variant in AttentionVariant::ALL {
            let config = BlockConfig::new(32, 64, 2).with_attention_variant(variant);
            let block: GatedBlock = block(config);
            let (output, gate) = block.forward_with_gate(&randn((3, 32, 8, 8))).unwrap();
            assert_eq!(output.dims(), &[3, 64, 4, 4]);
            assert_eq!(gate.dims(), &[3, 64]);

            let values = gate.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert!(values.iter().all(|&g| g > 0.0 && g < 1.0));
        }
    }

    #[test]
    fn test_gated_block_keeps_batch_axis_for_single_sample() {
        let block: GatedBlock = block(BlockConfig::new(32, 32, 1));
        let (_, gate) = block.forward_with_gate(&randn((1, 32, 4, 4))).unwrap();
        assert_eq!(gate.dims(), &[1, 32]);
    }

    #[test]
    fn test_gated_block_bottleneck_too_narrow() {
        let mut rng = StdRng::seed_from_u64(0);
        let config = BlockConfig::new(8, 8, 1).with_attention_variant(AttentionVariant::Bottleneck);
        assert!(GatedBlock::from_config(config, &mut rng, &Device::Cpu).is_err());
    }

    #[test]
    fn test_eval_mode_is_deterministic() {
        let mut block: GatedBlock = block(BlockConfig::new(16, 16, 1).with_dropout_rate(0.5));
        block.set_training(false);
        assert!(!block.is_training());

        let input = randn((2, 16, 4, 4));
        let a = block.forward(&input).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = block.forward(&input).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_gated_state_names() {
        let block: GatedBlock = block(BlockConfig::new(16, 16, 1));
        let state = block.state_dict().unwrap();
        for name in ["bn1.running_mean", "conv1.weight", "conv2.bias", "attn.1.weight", "attn.3.bias"] {
            assert!(state.contains_key(name), "missing {name}");
        }
        let zeros = Tensor::zeros((1, 16, 1, 1), DType::F32, &Device::Cpu).unwrap();
        assert!(block.attention().gate(&zeros).is_ok());
    }
}
