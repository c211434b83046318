//! Conversion between `image` buffers and `(H, W, C)` arrays.

use image::RgbImage;
use ndarray::{Array3, ArrayView3};

use crate::error::{TriggerError, TriggerResult};

/// Copies an RGB image into an `(H, W, 3)` array.
pub fn rgb_to_array(image: &RgbImage) -> TriggerResult<Array3<u8>> {
    let (width, height) = image.dimensions();
    let shape = (height as usize, width as usize, 3);
    Array3::from_shape_vec(shape, image.as_raw().clone())
        .map_err(|e| TriggerError::shape(&[shape.0, shape.1, shape.2], e.to_string()))
}

/// Copies an `(H, W, 3)` array into an RGB image.
///
/// # Errors
///
/// Fails unless the channel axis has length 3.
pub fn array_to_rgb(array: ArrayView3<'_, u8>) -> TriggerResult<RgbImage> {
    let (height, width, channels) = array.dim();
    if channels != 3 {
        return Err(TriggerError::shape(
            array.shape(),
            "expected 3 channels (H, W, 3)",
        ));
    }
    let too_large = || TriggerError::shape(&[height, width, channels], "image is too large");
    let w = u32::try_from(width).map_err(|_| too_large())?;
    let h = u32::try_from(height).map_err(|_| too_large())?;

    // Logical iteration order is row-major regardless of memory layout.
    let raw: Vec<u8> = array.iter().copied().collect();
    RgbImage::from_raw(w, h, raw).ok_or_else(too_large)
}
