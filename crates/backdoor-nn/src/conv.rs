//! 2D convolution layer.
//!
//! This module provides [`Conv2d`], a cross-correlation over NCHW feature maps
//! with configurable stride, zero padding, channel groups and bias.
//!
//! Weights are initialized Kaiming-normal in fan-out mode, biases uniformly on
//! `±1/sqrt(fan_in)`.

use candle_core::{Device, Tensor, Var};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{join_name, StateDict, StateVisitor};
use crate::error::{LayerError, LayerResult};
use crate::initializer::Initializer;
use crate::layer::Layer;
use crate::tensor::{as_channel_view, feature_map_dims};

/// Configuration for a [`Conv2d`] layer.
///
/// # Example
///
/// ```
/// use backdoor_nn::conv::Conv2dConfig;
///
/// let config = Conv2dConfig::new(32, 64, 1).with_stride(2).with_bias(true);
/// assert_eq!(config.output_hw((16, 16)), (8, 8));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2dConfig {
    /// Number of input channels.
    pub in_channels: usize,
    /// Number of output channels.
    pub out_channels: usize,
    /// Square kernel size.
    pub kernel_size: usize,
    /// Stride in both spatial directions (default: 1).
    pub stride: usize,
    /// Zero padding on every border (default: 0).
    pub padding: usize,
    /// Number of channel groups (default: 1).
    pub groups: usize,
    /// Whether to add a learnable bias (default: true).
    pub bias: bool,
}

impl Conv2dConfig {
    /// Creates a stride-1, unpadded, ungrouped convolution config with bias.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            stride: 1,
            padding: 0,
            groups: 1,
            bias: true,
        }
    }

    /// Sets the stride.
    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    /// Sets the zero padding.
    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    /// Sets the number of channel groups.
    ///
    /// `groups == in_channels == out_channels` gives a depthwise convolution.
    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    /// Sets whether to use a bias term.
    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    /// Returns the weight shape `(out, in / groups, k, k)`.
    pub fn weight_shape(&self) -> [usize; 4] {
        [
            self.out_channels,
            self.in_channels / self.groups.max(1),
            self.kernel_size,
            self.kernel_size,
        ]
    }

    /// Spatial output size for an input of `(height, width)`.
    pub fn output_hw(&self, (height, width): (usize, usize)) -> (usize, usize) {
        let out = |n: usize| (n + 2 * self.padding).saturating_sub(self.kernel_size) / self.stride + 1;
        (out(height), out(width))
    }

    /// Checks the configuration for consistency.
    pub fn validate(&self) -> LayerResult<()> {
        if self.in_channels == 0 || self.out_channels == 0 {
            return Err(LayerError::config(format!(
                "Conv2d channels must be positive, got {} -> {}",
                self.in_channels, self.out_channels
            )));
        }
        if self.kernel_size == 0 || self.stride == 0 || self.groups == 0 {
            return Err(LayerError::config(
                "Conv2d kernel_size, stride and groups must be positive",
            ));
        }
        if self.in_channels % self.groups != 0 || self.out_channels % self.groups != 0 {
            return Err(LayerError::config(format!(
                "Conv2d channels {} -> {} are not divisible by groups={}",
                self.in_channels, self.out_channels, self.groups
            )));
        }
        Ok(())
    }

    /// Builds and initializes a [`Conv2d`] from this configuration.
    pub fn build<R: Rng + ?Sized>(self, rng: &mut R, device: &Device) -> LayerResult<Conv2d> {
        Conv2d::from_config(self, rng, device)
    }
}

/// A 2D convolution over `(batch, channel, height, width)` inputs.
#[derive(Debug)]
pub struct Conv2d {
    /// Kernel of shape `(out, in / groups, k, k)`
    weight: Var,
    /// Optional bias of shape `(out)`
    bias: Option<Var>,
    config: Conv2dConfig,
}

impl Conv2d {
    /// Creates a convolution from a configuration and initializes its weights.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn from_config<R: Rng + ?Sized>(
        config: Conv2dConfig,
        rng: &mut R,
        device: &Device,
    ) -> LayerResult<Self> {
        config.validate()?;
        let weight_shape = config.weight_shape();
        let weight = Initializer::kaiming_fan_out().initialize(&weight_shape, rng, device)?;
        let bias = if config.bias {
            let bias = Initializer::fan_in_uniform(&weight_shape).initialize(
                &[config.out_channels],
                rng,
                device,
            )?;
            Some(Var::from_tensor(&bias)?)
        } else {
            None
        };

        Ok(Self {
            weight: Var::from_tensor(&weight)?,
            bias,
            config,
        })
    }

    /// Returns the layer configuration.
    pub fn config(&self) -> &Conv2dConfig {
        &self.config
    }

    /// Returns the kernel.
    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    /// Returns the bias, if any.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref().map(Var::as_tensor)
    }
}

impl Layer for Conv2d {
    fn forward(&self, input: &Tensor) -> LayerResult<Tensor> {
        let (_, channels, _, _) = feature_map_dims(input)?;
        if channels != self.config.in_channels {
            return Err(LayerError::InvalidInputDimension {
                expected: self.config.in_channels,
                actual: channels,
            });
        }

        let output = input.conv2d(
            self.weight.as_tensor(),
            self.config.padding,
            self.config.stride,
            1,
            self.config.groups,
        )?;
        match &self.bias {
            Some(bias) => Ok(output.broadcast_add(&as_channel_view(bias.as_tensor())?)?),
            None => Ok(output),
        }
    }

    fn parameters(&self) -> Vec<&Var> {
        let mut params = vec![&self.weight];
        params.extend(self.bias.as_ref());
        params
    }

    fn name(&self) -> &str {
        "Conv2d"
    }
}

impl StateDict for Conv2d {
    fn visit_state(&self, prefix: &str, visitor: &mut dyn StateVisitor) -> LayerResult<()> {
        visitor.parameter(&join_name(prefix, "weight"), &self.weight)?;
        if let Some(bias) = &self.bias {
            visitor.parameter(&join_name(prefix, "bias"), bias)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn build(config: Conv2dConfig) -> Conv2d {
        let mut rng = StdRng::seed_from_u64(0);
        config.build(&mut rng, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_conv_output_shape_same_padding() {
        let conv = build(Conv2dConfig::new(3, 16, 3).with_padding(1));
        let input = Tensor::zeros((2, 3, 32, 32), DType::F32, &Device::Cpu).unwrap();
        let output = conv.forward(&input).unwrap();
        assert_eq!(output.dims(), &[2, 16, 32, 32]);
    }

    #[test]
    fn test_conv_strided_output_shape() {
        let config = Conv2dConfig::new(16, 32, 3).with_stride(2).with_padding(1);
        assert_eq!(config.output_hw((32, 32)), (16, 16));
        assert_eq!(config.output_hw((7, 7)), (4, 4));

        let conv = build(config);
        let input = Tensor::zeros((1, 16, 7, 7), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(conv.forward(&input).unwrap().dims(), &[1, 32, 4, 4]);
    }

    #[test]
    fn test_conv_bias_is_added() {
        let conv = build(Conv2dConfig::new(2, 2, 1));
        let input = Tensor::zeros((1, 2, 3, 3), DType::F32, &Device::Cpu).unwrap();
        let output = conv.forward(&input).unwrap();

        let bias = conv.bias().unwrap().to_vec1::<f32>().unwrap();
        let out = output.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(out[..9].iter().all(|&v| v == bias[0]));
        assert!(out[9..].iter().all(|&v| v == bias[1]));
    }

    #[test]
    fn test_depthwise_weight_shape() {
        let conv = build(Conv2dConfig::new(8, 8, 1).with_groups(8));
        assert_eq!(conv.weight().dims(), &[8, 1, 1, 1]);

        let input = Tensor::ones((2, 8, 1, 1), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(conv.forward(&input).unwrap().dims(), &[2, 8, 1, 1]);
    }

    #[test]
    fn test_conv_parameters() {
        assert_eq!(build(Conv2dConfig::new(4, 8, 3)).parameters().len(), 2);
        let conv = build(Conv2dConfig::new(4, 8, 3).with_bias(false));
        assert_eq!(conv.parameters().len(), 1);
        assert_eq!(conv.num_parameters(), 8 * 4 * 9);
    }

    #[test]
    fn test_conv_invalid_config() {
        let mut rng = StdRng::seed_from_u64(0);
        let bad_groups = Conv2dConfig::new(6, 8, 1).with_groups(4);
        assert!(bad_groups.build(&mut rng, &Device::Cpu).is_err());

        let zero_stride = Conv2dConfig::new(4, 4, 3).with_stride(0);
        assert!(zero_stride.build(&mut rng, &Device::Cpu).is_err());
    }

    #[test]
    fn test_conv_rejects_wrong_channels() {
        let conv = build(Conv2dConfig::new(3, 4, 3));
        let input = Tensor::zeros((1, 5, 8, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            conv.forward(&input),
            Err(LayerError::InvalidInputDimension { expected: 3, actual: 5 })
        ));
    }
}
