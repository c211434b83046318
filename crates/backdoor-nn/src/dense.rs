//! Fully connected layer.
//!
//! This module provides [`Linear`], which performs `y = x Wᵀ + b` on
//! `(batch, in_features)` inputs. The weight is stored `(out, in)`.

use candle_core::{Device, Tensor, Var};
use rand::Rng;

use crate::checkpoint::{join_name, StateDict, StateVisitor};
use crate::error::{LayerError, LayerResult};
use crate::initializer::Initializer;
use crate::layer::Layer;

/// A dense (fully connected) layer.
///
/// # Example
///
/// ```
/// use backdoor_nn::dense::Linear;
/// use backdoor_nn::layer::Layer;
/// use candle_core::{DType, Device, Tensor};
/// use rand::SeedableRng;
///
/// let mut rng = rand::rngs::StdRng::seed_from_u64(0);
/// let layer = Linear::new(128, 10, &mut rng, &Device::Cpu).unwrap();
/// let input = Tensor::zeros((32, 128), DType::F32, &Device::Cpu).unwrap();
/// assert_eq!(layer.forward(&input).unwrap().dims(), &[32, 10]);
/// ```
#[derive(Debug)]
pub struct Linear {
    /// Weight matrix of shape [out_features, in_features]
    weight: Var,
    /// Bias vector of shape [out_features]
    bias: Var,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// Creates a layer with a Xavier-normal weight and a zero bias.
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        rng: &mut R,
        device: &Device,
    ) -> LayerResult<Self> {
        if in_features == 0 || out_features == 0 {
            return Err(LayerError::config(format!(
                "Linear features must be positive, got {in_features} -> {out_features}"
            )));
        }
        let weight =
            Initializer::XavierNormal.initialize(&[out_features, in_features], rng, device)?;
        let bias = Initializer::Zeros.initialize(&[out_features], rng, device)?;
        Ok(Self {
            weight: Var::from_tensor(&weight)?,
            bias: Var::from_tensor(&bias)?,
            in_features,
            out_features,
        })
    }

    /// Returns the input dimension.
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Returns the output dimension.
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Returns the weight matrix.
    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }
}

impl Layer for Linear {
    fn forward(&self, input: &Tensor) -> LayerResult<Tensor> {
        if input.rank() != 2 {
            return Err(LayerError::forward(format!(
                "Linear expects 2D (batch, features) input, got {}D",
                input.rank()
            )));
        }
        let (_, features) = input.dims2()?;
        if features != self.in_features {
            return Err(LayerError::InvalidInputDimension {
                expected: self.in_features,
                actual: features,
            });
        }
        let output = input.matmul(&self.weight.as_tensor().t()?)?;
        Ok(output.broadcast_add(self.bias.as_tensor())?)
    }

    fn parameters(&self) -> Vec<&Var> {
        vec![&self.weight, &self.bias]
    }

    fn name(&self) -> &str {
        "Linear"
    }
}

impl StateDict for Linear {
    fn visit_state(&self, prefix: &str, visitor: &mut dyn StateVisitor) -> LayerResult<()> {
        visitor.parameter(&join_name(prefix, "weight"), &self.weight)?;
        visitor.parameter(&join_name(prefix, "bias"), &self.bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn linear(in_features: usize, out_features: usize) -> Linear {
        let mut rng = StdRng::seed_from_u64(1);
        Linear::new(in_features, out_features, &mut rng, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_linear_forward_shape() {
        let layer = linear(16, 4);
        let input = Tensor::ones((3, 16), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(layer.forward(&input).unwrap().dims(), &[3, 4]);
        assert_eq!(layer.num_parameters(), 16 * 4 + 4);
    }

    #[test]
    fn test_linear_matches_manual_product() {
        let layer = linear(3, 2);
        let input = Tensor::new(&[[1.0f32, 2.0, 3.0]], &Device::Cpu).unwrap();
        let output = layer.forward(&input).unwrap().to_vec2::<f32>().unwrap();

        let weight = layer.weight().to_vec2::<f32>().unwrap();
        for (o, row) in output[0].iter().zip(weight) {
            let expected = row[0] + 2.0 * row[1] + 3.0 * row[2];
            assert!((o - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_linear_rejects_bad_input() {
        let layer = linear(8, 2);
        let wrong = Tensor::ones((2, 7), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            layer.forward(&wrong),
            Err(LayerError::InvalidInputDimension { expected: 8, actual: 7 })
        ));
        let rank3 = Tensor::ones((2, 8, 1), DType::F32, &Device::Cpu).unwrap();
        assert!(layer.forward(&rank3).is_err());
    }

    #[test]
    fn test_linear_zero_features_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(Linear::new(0, 4, &mut rng, &Device::Cpu).is_err());
    }
}
