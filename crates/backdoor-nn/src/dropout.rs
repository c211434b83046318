//! Inverted dropout.

use candle_core::{Tensor, Var};

use crate::error::{LayerError, LayerResult};
use crate::layer::Layer;

/// Zeroes each element with probability `rate` during training and rescales
/// the survivors by `1 / (1 - rate)`. Identity in evaluation mode.
#[derive(Debug, Clone)]
pub struct Dropout {
    rate: f32,
    training: bool,
}

impl Dropout {
    /// Creates a dropout layer.
    ///
    /// # Errors
    ///
    /// Returns an error unless `rate` lies in `[0, 1)`.
    pub fn new(rate: f32) -> LayerResult<Self> {
        if !(0.0..1.0).contains(&rate) {
            return Err(LayerError::config(format!(
                "dropout rate must lie in [0, 1), got {rate}"
            )));
        }
        Ok(Self {
            rate,
            training: true,
        })
    }

    /// Returns the drop probability.
    pub fn rate(&self) -> f32 {
        self.rate
    }
}

impl Layer for Dropout {
    fn forward(&self, input: &Tensor) -> LayerResult<Tensor> {
        if self.training && self.rate > 0.0 {
            Ok(candle_nn::ops::dropout(input, self.rate)?)
        } else {
            Ok(input.clone())
        }
    }

    fn parameters(&self) -> Vec<&Var> {
        Vec::new()
    }

    fn name(&self) -> &str {
        "Dropout"
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}
