//! Activation function layers.
//!
//! This module provides the parameter-free activations used by the network:
//! ReLU, Sigmoid and LeakyReLU.

use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::error::{LayerError, LayerResult};
use crate::layer::Layer;

/// Rectified Linear Unit (ReLU) activation function.
///
/// Computes `f(x) = max(0, x)` element-wise.
///
/// # Example
///
/// ```
/// use backdoor_nn::activation::ReLU;
/// use backdoor_nn::layer::Layer;
/// use candle_core::{Device, Tensor};
///
/// let relu = ReLU::new();
/// let input = Tensor::new(&[-1.0f32, 0.0, 1.0, 2.0], &Device::Cpu).unwrap();
/// let output = relu.forward(&input).unwrap();
/// assert_eq!(output.to_vec1::<f32>().unwrap(), vec![0.0, 0.0, 1.0, 2.0]);
/// ```
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ReLU;

impl ReLU {
    /// Creates a new ReLU activation.
    pub fn new() -> Self {
        Self
    }
}

impl Layer for ReLU {
    fn forward(&self, input: &Tensor) -> LayerResult<Tensor> {
        Ok(input.relu()?)
    }

    fn parameters(&self) -> Vec<&Var> {
        Vec::new()
    }

    fn name(&self) -> &str {
        "ReLU"
    }
}

/// Sigmoid activation function.
///
/// Computes `f(x) = 1 / (1 + exp(-x))` element-wise.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Sigmoid;

impl Sigmoid {
    /// Creates a new Sigmoid activation.
    pub fn new() -> Self {
        Self
    }
}

impl Layer for Sigmoid {
    fn forward(&self, input: &Tensor) -> LayerResult<Tensor> {
        Ok(candle_nn::ops::sigmoid(input)?)
    }

    fn parameters(&self) -> Vec<&Var> {
        Vec::new()
    }

    fn name(&self) -> &str {
        "Sigmoid"
    }
}

/// Leaky ReLU activation function.
///
/// Computes `f(x) = max(alpha * x, x)` element-wise, which equals
/// `x` for positive inputs and `alpha * x` otherwise when `alpha` lies in `[0, 1]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LeakyReLU {
    /// Negative slope (default: 0.1)
    alpha: f64,
}

impl LeakyReLU {
    /// Creates a new LeakyReLU with the specified negative slope.
    ///
    /// # Errors
    ///
    /// Returns an error unless `alpha` lies in `[0, 1]`.
    pub fn new(alpha: f64) -> LayerResult<Self> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(LayerError::config(format!(
                "LeakyReLU slope must lie in [0, 1], got {alpha}"
            )));
        }
        Ok(Self { alpha })
    }

    /// Returns the negative slope.
    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

impl Default for LeakyReLU {
    fn default() -> Self {
        Self { alpha: 0.1 }
    }
}

impl Layer for LeakyReLU {
    fn forward(&self, input: &Tensor) -> LayerResult<Tensor> {
        Ok(input.maximum(&input.affine(self.alpha, 0.0)?)?)
    }

    fn parameters(&self) -> Vec<&Var> {
        Vec::new()
    }

    fn name(&self) -> &str {
        "LeakyReLU"
    }
}
