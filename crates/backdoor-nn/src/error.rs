//! Error types for the backdoor-nn crate.
//!
//! This module defines error types for network construction and forward
//! passes, including shape mismatches, configuration errors and failures
//! surfaced by the tensor backend.

use thiserror::Error;

/// Error type for layer operations.
#[derive(Debug, Error)]
pub enum LayerError {
    /// Shape mismatch between expected and actual tensor shapes.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// The expected shape
        expected: Vec<usize>,
        /// The actual shape that was provided
        actual: Vec<usize>,
    },

    /// Invalid input dimension for the layer.
    #[error("Invalid input dimension: expected {expected}, got {actual}")]
    InvalidInputDimension {
        /// The expected input dimension
        expected: usize,
        /// The actual input dimension
        actual: usize,
    },

    /// Error during weight initialization.
    #[error("Initialization error: {message}")]
    InitializationError {
        /// Description of the initialization error
        message: String,
    },

    /// Configuration error for the layer.
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Description of the configuration error
        message: String,
    },

    /// Error during forward pass computation.
    #[error("Forward pass error: {message}")]
    ForwardError {
        /// Description of the forward pass error
        message: String,
    },

    /// Error while saving or restoring network state.
    #[error("Checkpoint error: {message}")]
    CheckpointError {
        /// Description of the checkpoint error
        message: String,
    },

    /// Error raised by the tensor backend.
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl LayerError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        LayerError::ConfigError {
            message: message.into(),
        }
    }

    pub(crate) fn forward(message: impl Into<String>) -> Self {
        LayerError::ForwardError {
            message: message.into(),
        }
    }
}

/// Result type alias for layer operations.
pub type LayerResult<T> = Result<T, LayerError>;
