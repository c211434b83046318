//! Conversion of `(H, W, C)` byte images into network input batches.

use candle_core::{Device, Tensor};
use ndarray::{Array4, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{LayerError, LayerResult};

/// Per-channel mean and standard deviation applied after scaling to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelNormalization {
    /// Channel means.
    pub mean: [f32; 3],
    /// Channel standard deviations.
    pub std: [f32; 3],
}

impl ChannelNormalization {
    /// CIFAR-10 training-set statistics.
    pub fn cifar10() -> Self {
        Self {
            mean: [0.4914, 0.4822, 0.4465],
            std: [0.2470, 0.2435, 0.2616],
        }
    }
}

/// Stacks equally sized `(H, W, 3)` images into a `(B, 3, H, W)` `f32` tensor.
///
/// Pixels are scaled to `[0, 1]` and, when given, normalized per channel.
///
/// # Example
///
/// ```
/// use backdoor_nn::input::images_to_batch;
/// use candle_core::Device;
/// use ndarray::Array3;
///
/// let image = Array3::<u8>::from_elem((8, 6, 3), 255);
/// let batch = images_to_batch(&[image.view(), image.view()], None, &Device::Cpu).unwrap();
/// assert_eq!(batch.dims(), &[2, 3, 8, 6]);
/// ```
pub fn images_to_batch(
    images: &[ArrayView3<'_, u8>],
    normalization: Option<&ChannelNormalization>,
    device: &Device,
) -> LayerResult<Tensor> {
    let first = images
        .first()
        .ok_or_else(|| LayerError::forward("cannot build a batch from zero images"))?;
    let (height, width, channels) = first.dim();
    if channels != 3 {
        return Err(LayerError::InvalidInputDimension {
            expected: 3,
            actual: channels,
        });
    }

    let mut batch = Array4::<f32>::zeros((images.len(), 3, height, width));
    for (image, mut slot) in images.iter().zip(batch.axis_iter_mut(Axis(0))) {
        if image.dim() != (height, width, channels) {
            return Err(LayerError::ShapeMismatch {
                expected: vec![height, width, channels],
                actual: image.shape().to_vec(),
            });
        }
        let chw = image.view().permuted_axes([2, 0, 1]);
        slot.zip_mut_with(&chw, |dst, &src| *dst = f32::from(src) / 255.0);

        if let Some(norm) = normalization {
            for (c, mut plane) in slot.axis_iter_mut(Axis(0)).enumerate() {
                let (mean, std) = (norm.mean[c], norm.std[c]);
                plane.mapv_inplace(|v| (v - mean) / std);
            }
        }
    }

    let (b, c, h, w) = batch.dim();
    Ok(Tensor::from_vec(batch.into_raw_vec(), (b, c, h, w), device)?)
}
