//! Error types for trigger transforms.

use thiserror::Error;

/// Error type for trigger operations.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// The image array does not have the expected layout.
    #[error("Invalid image shape {shape:?}: {message}")]
    InvalidShape {
        /// Shape of the rejected array
        shape: Vec<usize>,
        /// What was expected instead
        message: String,
    },

    /// The trigger patch does not fit inside the image.
    #[error("Trigger of size {size} does not fit a {height}x{width} image")]
    TriggerTooLarge {
        /// Side length of the trigger patch
        size: usize,
        /// Image height
        height: usize,
        /// Image width
        width: usize,
    },

    /// The blend factor is not a finite number.
    #[error("Blend factor must be finite, got {alpha}")]
    InvalidAlpha {
        /// The rejected factor
        alpha: f32,
    },

    /// Decoding, encoding or reading an image failed.
    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl TriggerError {
    pub(crate) fn shape(shape: &[usize], message: impl Into<String>) -> Self {
        TriggerError::InvalidShape {
            shape: shape.to_vec(),
            message: message.into(),
        }
    }
}

/// Result type alias for trigger operations.
pub type TriggerResult<T> = Result<T, TriggerError>;
