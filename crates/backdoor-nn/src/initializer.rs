//! Weight initialization utilities.
//!
//! Fans follow the convolution weight layout `(out, in / groups, kh, kw)` and
//! the linear weight layout `(out, in)`.

use candle_core::{DType, Device, Tensor};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{LayerError, LayerResult};

/// Which fan a variance-scaled initializer normalizes by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FanMode {
    /// Preserve the variance of activations in the forward pass.
    FanIn,
    /// Preserve the variance of gradients in the backward pass.
    FanOut,
}

/// Weight initialization strategies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum Initializer {
    /// All zeros.
    #[default]
    Zeros,
    /// All ones.
    Ones,
    /// Constant value.
    Constant(f32),
    /// Uniform distribution on `[low, high)`.
    Uniform {
        /// Inclusive lower bound
        low: f32,
        /// Exclusive upper bound
        high: f32,
    },
    /// He/Kaiming normal initialization for (leaky) rectifiers.
    ///
    /// `std = gain / sqrt(fan)` with `gain = sqrt(2 / (1 + negative_slope^2))`.
    KaimingNormal {
        /// Fan used for scaling
        mode: FanMode,
        /// Negative slope of the rectifier that follows
        negative_slope: f32,
    },
    /// Glorot/Xavier normal initialization: `std = sqrt(2 / (fan_in + fan_out))`.
    XavierNormal,
}

impl Initializer {
    /// Kaiming-normal in fan-out mode for a leaky rectifier with default slope.
    pub fn kaiming_fan_out() -> Self {
        Initializer::KaimingNormal {
            mode: FanMode::FanOut,
            negative_slope: 0.0,
        }
    }

    /// Uniform on `[-1/sqrt(fan_in), 1/sqrt(fan_in))`, the usual bias init for
    /// a layer whose weight has `weight_shape`.
    pub fn fan_in_uniform(weight_shape: &[usize]) -> Self {
        let (fan_in, _) = fan_in_out(weight_shape);
        let bound = 1.0 / (fan_in as f32).sqrt();
        Initializer::Uniform {
            low: -bound,
            high: bound,
        }
    }

    /// Materializes a tensor of `shape` on `device`.
    pub fn initialize<R: Rng + ?Sized>(
        &self,
        shape: &[usize],
        rng: &mut R,
        device: &Device,
    ) -> LayerResult<Tensor> {
        let numel: usize = shape.iter().product();
        let data: Vec<f32> = match *self {
            Initializer::Zeros => return Ok(Tensor::zeros(shape, DType::F32, device)?),
            Initializer::Ones => return Ok(Tensor::ones(shape, DType::F32, device)?),
            Initializer::Constant(value) => vec![value; numel],
            Initializer::Uniform { low, high } => {
                if low >= high || !low.is_finite() || !high.is_finite() {
                    return Err(LayerError::InitializationError {
                        message: format!("uniform bounds must be finite with low < high, got [{low}, {high})"),
                    });
                }
                (0..numel).map(|_| rng.gen_range(low..high)).collect()
            }
            Initializer::KaimingNormal {
                mode,
                negative_slope,
            } => {
                let (fan_in, fan_out) = fan_in_out(shape);
                let fan = match mode {
                    FanMode::FanIn => fan_in,
                    FanMode::FanOut => fan_out,
                };
                let gain = (2.0 / (1.0 + negative_slope * negative_slope)).sqrt();
                let std = gain / (fan as f32).sqrt();
                normal_vec(numel, std, rng)?
            }
            Initializer::XavierNormal => {
                let (fan_in, fan_out) = fan_in_out(shape);
                let std = (2.0 / (fan_in + fan_out) as f32).sqrt();
                normal_vec(numel, std, rng)?
            }
        };
        Ok(Tensor::from_vec(data, shape, device)?)
    }
}

/// Computes `(fan_in, fan_out)` for a weight of the given shape.
///
/// For `(out, in, k...)` the receptive field `prod(k...)` multiplies both fans.
pub fn fan_in_out(shape: &[usize]) -> (usize, usize) {
    match shape.len() {
        0 => (1, 1),
        1 => (shape[0].max(1), shape[0].max(1)),
        _ => {
            let receptive: usize = shape[2..].iter().product();
            let fan_in = shape[1] * receptive;
            let fan_out = shape[0] * receptive;
            (fan_in.max(1), fan_out.max(1))
        }
    }
}

fn normal_vec<R: Rng + ?Sized>(n: usize, std: f32, rng: &mut R) -> LayerResult<Vec<f32>> {
    let normal = Normal::new(0.0f32, std).map_err(|e| LayerError::InitializationError {
        message: format!("invalid normal std {std}: {e}"),
    })?;
    Ok(normal.sample_iter(rng).take(n).collect())
}
