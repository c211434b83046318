//! Layer trait definition for network components.
//!
//! This module defines the core [`Layer`] trait that every building block of
//! the network implements, from a single convolution up to the full backbone.

use candle_core::{Tensor, Var};

use crate::error::LayerResult;

/// A network component with a forward pass and learnable parameters.
///
/// Parameters are exposed as candle [`Var`]s so that an external training loop
/// can compute gradients through the forward pass and update them in place.
///
/// # Example
///
/// ```
/// use backdoor_nn::conv::Conv2dConfig;
/// use backdoor_nn::layer::Layer;
/// use candle_core::{DType, Device, Tensor};
/// use rand::SeedableRng;
///
/// let mut rng = rand::rngs::StdRng::seed_from_u64(0);
/// let conv = Conv2dConfig::new(3, 16, 3)
///     .with_padding(1)
///     .build(&mut rng, &Device::Cpu)
///     .unwrap();
/// let input = Tensor::zeros((2, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
/// let output = conv.forward(&input).unwrap();
/// assert_eq!(output.dims(), &[2, 16, 8, 8]);
/// ```
pub trait Layer: Send + Sync {
    /// Performs a forward pass through the layer.
    ///
    /// # Errors
    ///
    /// Returns a [`LayerError`](crate::error::LayerError) if the input shape is
    /// incompatible with the layer or the backend fails.
    fn forward(&self, input: &Tensor) -> LayerResult<Tensor>;

    /// Returns references to the layer's learnable parameters.
    fn parameters(&self) -> Vec<&Var>;

    /// Returns the total number of learnable scalars.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.elem_count()).sum()
    }

    /// Returns the name of the layer for debugging and logging purposes.
    fn name(&self) -> &str {
        "Layer"
    }

    /// Returns whether the layer is in training mode.
    ///
    /// Dropout and batch normalization behave differently during training.
    fn is_training(&self) -> bool {
        true
    }

    /// Sets the layer's training mode.
    fn set_training(&mut self, _training: bool) {}
}
