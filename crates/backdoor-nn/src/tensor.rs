//! Tensor helpers shared by the layers.
//!
//! The network runs on candle tensors. This module adds device selection and
//! the handful of NCHW helpers (shape checks, global pooling) the layers need.

pub use candle_core::{DType, Device, Tensor, Var};

use crate::error::{LayerError, LayerResult};

/// Returns the best available device (GPU if available, otherwise CPU).
///
/// On macOS with the `metal` feature this returns a Metal device, with the
/// `cuda` feature a CUDA device. Otherwise, and whenever device creation
/// fails, it falls back to CPU.
pub fn best_device() -> Device {
    #[cfg(feature = "metal")]
    {
        Device::new_metal(0).unwrap_or(Device::Cpu)
    }
    #[cfg(all(feature = "cuda", not(feature = "metal")))]
    {
        Device::new_cuda(0).unwrap_or(Device::Cpu)
    }
    #[cfg(not(any(feature = "metal", feature = "cuda")))]
    {
        Device::Cpu
    }
}

/// Returns the `(batch, channels, height, width)` dims of a feature map.
pub fn feature_map_dims(input: &Tensor) -> LayerResult<(usize, usize, usize, usize)> {
    if input.rank() != 4 {
        return Err(LayerError::forward(format!(
            "Expected 4D (batch, channel, height, width) input, got {}D",
            input.rank()
        )));
    }
    Ok(input.dims4()?)
}

/// Fails with [`LayerError::ShapeMismatch`] unless both tensors have equal dims.
pub fn ensure_same_shape(expected: &Tensor, actual: &Tensor) -> LayerResult<()> {
    if expected.dims() != actual.dims() {
        return Err(LayerError::ShapeMismatch {
            expected: expected.dims().to_vec(),
            actual: actual.dims().to_vec(),
        });
    }
    Ok(())
}

/// Global average pooling: `(B, C, H, W) -> (B, C, 1, 1)`.
pub fn global_avg_pool(input: &Tensor) -> LayerResult<Tensor> {
    feature_map_dims(input)?;
    Ok(input.mean_keepdim(3)?.mean_keepdim(2)?)
}

/// Reshapes a per-channel vector `(C)` to `(1, C, 1, 1)` for NCHW broadcasting.
pub(crate) fn as_channel_view(values: &Tensor) -> LayerResult<Tensor> {
    let channels = values.elem_count();
    Ok(values.reshape((1, channels, 1, 1))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_avg_pool() {
        let data: Vec<f32> = (0..2 * 2 * 2 * 2).map(|v| v as f32).collect();
        let input = Tensor::from_vec(data, (2, 2, 2, 2), &Device::Cpu).unwrap();
        let pooled = global_avg_pool(&input).unwrap();
        assert_eq!(pooled.dims(), &[2, 2, 1, 1]);

        let values = pooled.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(values, vec![1.5, 5.5, 9.5, 13.5]);
    }

    #[test]
    fn test_feature_map_dims_rejects_non_4d() {
        let input = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(feature_map_dims(&input).is_err());
        assert!(global_avg_pool(&input).is_err());
    }

    #[test]
    fn test_ensure_same_shape() {
        let a = Tensor::zeros((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((1, 4, 1, 1), DType::F32, &Device::Cpu).unwrap();
        assert!(ensure_same_shape(&a, &a).is_ok());
        match ensure_same_shape(&a, &b) {
            Err(LayerError::ShapeMismatch { expected, actual }) => {
                assert_eq!(expected, vec![1, 4, 2, 2]);
                assert_eq!(actual, vec![1, 4, 1, 1]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_best_device_is_usable() {
        let device = best_device();
        let t = Tensor::ones((2, 2), DType::F32, &device).unwrap();
        assert_eq!(t.dims(), &[2, 2]);
    }
}
