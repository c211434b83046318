//! Batch normalization over NCHW feature maps.
//!
//! In training mode the layer normalizes with the statistics of the current
//! batch (biased variance) and folds them into running estimates:
//! `running = (1 - momentum) * running + momentum * batch`, where the running
//! variance uses the unbiased batch variance. In evaluation mode it normalizes
//! with the running estimates.

use candle_core::{DType, Device, Tensor, Var};
use parking_lot::RwLock;

use crate::checkpoint::{join_name, StateDict, StateVisitor};
use crate::error::{LayerError, LayerResult};
use crate::initializer::Initializer;
use crate::layer::Layer;
use crate::tensor::{as_channel_view, feature_map_dims};

/// Batch Normalization for `(batch, channel, height, width)` inputs.
///
/// # Example
///
/// ```
/// use backdoor_nn::normalization::BatchNorm2d;
/// use backdoor_nn::layer::Layer;
/// use candle_core::{Device, Tensor};
///
/// let bn = BatchNorm2d::new(8, &Device::Cpu).unwrap();
/// let input = Tensor::randn(0f32, 1.0, (4, 8, 5, 5), &Device::Cpu).unwrap();
/// let output = bn.forward(&input).unwrap();
/// assert_eq!(output.dims(), &[4, 8, 5, 5]);
/// ```
#[derive(Debug)]
pub struct BatchNorm2d {
    /// Learnable scale parameter (gamma), initialized to one
    weight: Var,
    /// Learnable shift parameter (beta), initialized to zero
    bias: Var,
    running_mean: RwLock<Tensor>,
    running_var: RwLock<Tensor>,
    /// Momentum for running statistics
    momentum: f64,
    /// Small constant for numerical stability
    eps: f64,
    num_features: usize,
    training: bool,
}

impl BatchNorm2d {
    /// Creates a batch norm layer with momentum 0.1 and eps 1e-5.
    ///
    /// # Arguments
    ///
    /// * `num_features` - Number of channels (C in `[N, C, H, W]` input)
    /// * `device` - Device the parameters live on
    pub fn new(num_features: usize, device: &Device) -> LayerResult<Self> {
        Self::with_params(num_features, 0.1, 1e-5, device)
    }

    /// Creates a batch norm layer with custom momentum and epsilon.
    pub fn with_params(
        num_features: usize,
        momentum: f64,
        eps: f64,
        device: &Device,
    ) -> LayerResult<Self> {
        if num_features == 0 {
            return Err(LayerError::config("BatchNorm2d needs at least one feature"));
        }
        if !(0.0..=1.0).contains(&momentum) || eps <= 0.0 {
            return Err(LayerError::config(format!(
                "BatchNorm2d momentum must lie in [0, 1] and eps be positive, got momentum={momentum} eps={eps}"
            )));
        }

        // Deterministic initializers never draw from the rng.
        let mut rng = rand::rngs::mock::StepRng::new(0, 0);
        let shape = [num_features];
        let weight = Initializer::Ones.initialize(&shape, &mut rng, device)?;
        let bias = Initializer::Zeros.initialize(&shape, &mut rng, device)?;

        Ok(Self {
            weight: Var::from_tensor(&weight)?,
            bias: Var::from_tensor(&bias)?,
            running_mean: RwLock::new(Tensor::zeros(num_features, DType::F32, device)?),
            running_var: RwLock::new(Tensor::ones(num_features, DType::F32, device)?),
            momentum,
            eps,
            num_features,
            training: true,
        })
    }

    /// Returns the number of features.
    pub fn num_features(&self) -> usize {
        self.num_features
    }

    /// Returns copies of the running mean and variance.
    pub fn running_stats(&self) -> (Tensor, Tensor) {
        (self.running_mean.read().clone(), self.running_var.read().clone())
    }

    fn update_running_stats(&self, mean: &Tensor, var: &Tensor, count: usize) -> LayerResult<()> {
        let m = self.momentum;
        let unbiased = var.affine(count as f64 / (count - 1) as f64, 0.0)?;

        let mut running_mean = self.running_mean.write();
        *running_mean = ((&*running_mean * (1.0 - m))? + (mean.detach() * m)?)?;
        drop(running_mean);

        let mut running_var = self.running_var.write();
        *running_var = ((&*running_var * (1.0 - m))? + (unbiased.detach() * m)?)?;
        Ok(())
    }
}

impl Layer for BatchNorm2d {
    fn forward(&self, input: &Tensor) -> LayerResult<Tensor> {
        let (batch, channels, height, width) = feature_map_dims(input)?;
        if channels != self.num_features {
            return Err(LayerError::InvalidInputDimension {
                expected: self.num_features,
                actual: channels,
            });
        }

        let (mean, var) = if self.training {
            let count = batch * height * width;
            if count < 2 {
                return Err(LayerError::forward(format!(
                    "BatchNorm2d needs more than one value per channel in training, got input {:?}",
                    input.dims()
                )));
            }
            let mean = input
                .mean_keepdim(0)?
                .mean_keepdim(2)?
                .mean_keepdim(3)?;
            let var = input
                .broadcast_sub(&mean)?
                .sqr()?
                .mean_keepdim(0)?
                .mean_keepdim(2)?
                .mean_keepdim(3)?;
            let mean = mean.flatten_all()?;
            let var = var.flatten_all()?;
            self.update_running_stats(&mean, &var, count)?;
            (mean, var)
        } else {
            let (mean, var) = self.running_stats();
            (mean, var)
        };

        let std = var.affine(1.0, self.eps)?.sqrt()?;
        let normalized = input
            .broadcast_sub(&as_channel_view(&mean)?)?
            .broadcast_div(&as_channel_view(&std)?)?;
        Ok(normalized
            .broadcast_mul(&as_channel_view(self.weight.as_tensor())?)?
            .broadcast_add(&as_channel_view(self.bias.as_tensor())?)?)
    }

    fn parameters(&self) -> Vec<&Var> {
        vec![&self.weight, &self.bias]
    }

    fn name(&self) -> &str {
        "BatchNorm2d"
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

impl StateDict for BatchNorm2d {
    fn visit_state(&self, prefix: &str, visitor: &mut dyn StateVisitor) -> LayerResult<()> {
        visitor.parameter(&join_name(prefix, "weight"), &self.weight)?;
        visitor.parameter(&join_name(prefix, "bias"), &self.bias)?;
        visitor.buffer(&join_name(prefix, "running_mean"), &self.running_mean)?;
        visitor.buffer(&join_name(prefix, "running_var"), &self.running_var)
    }
}
