//! Wide residual networks with channel-attention gating.
//!
//! This crate builds the classifier used in backdoor research on image
//! models: a wide residual network whose last stage rescales every residual
//! branch by a squeeze-and-excitation gate and reports those gates next to
//! the logits. It includes:
//!
//! - **Primitive layers**: 2D convolution, batch normalization, linear,
//!   activations and dropout on candle tensors
//! - **Channel attention**: three excitation variants (bottleneck, depthwise, dense)
//! - **Residual blocks**: plain and attention-gated pre-activation blocks
//! - **Stages**: stacks of blocks with a single channel/stride transition
//! - **WideResNet**: the full backbone with gate collection
//! - **Checkpoints**: named state and safetensors save/load
//!
//! # Quick Start
//!
//! ```
//! use backdoor_nn::prelude::*;
//!
//! let net = WideResNetConfig::new(10)
//!     .with_depth(10)
//!     .with_widen_factor(1)
//!     .with_attention_variant(AttentionVariant::Dense)
//!     .with_seed(42)
//!     .build(&Device::Cpu)
//!     .unwrap();
//!
//! let images = Tensor::randn(0f32, 1.0, (4, 3, 16, 16), &Device::Cpu).unwrap();
//! let WideResNetOutput { logits, gates } = net.forward_with_gates(&images).unwrap();
//! assert_eq!(logits.dims(), &[4, 10]);
//! assert_eq!(gates.dims(), &[4, 64]);
//! ```
//!
//! # Layer Trait
//!
//! All components implement the [`Layer`] trait. Parameters are candle
//! [`Var`](candle_core::Var)s, so gradients flow through any forward pass:
//!
//! ```
//! use backdoor_nn::prelude::*;
//!
//! fn count<L: Layer>(layer: &L) -> usize {
//!     layer.num_parameters()
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod activation;
pub mod attention;
pub mod checkpoint;
pub mod conv;
pub mod dense;
pub mod dropout;
pub mod error;
pub mod initializer;
pub mod input;
pub mod layer;
pub mod normalization;
pub mod residual;
pub mod stage;
pub mod tensor;
pub mod wide_resnet;

// Re-export main types at crate level
pub use activation::{LeakyReLU, ReLU, Sigmoid};
pub use attention::{AttentionVariant, ChannelAttention};
pub use checkpoint::{StateDict, StateVisitor};
pub use conv::{Conv2d, Conv2dConfig};
pub use dense::Linear;
pub use dropout::Dropout;
pub use error::{LayerError, LayerResult};
pub use initializer::{FanMode, Initializer};
pub use input::{images_to_batch, ChannelNormalization};
pub use layer::Layer;
pub use normalization::BatchNorm2d;
pub use residual::{BasicBlock, BlockConfig, GatedBlock, ResidualUnit};
pub use stage::{Stage, StageConfig};
pub use tensor::best_device;
pub use wide_resnet::{cdwrn28, WideResNet, WideResNetConfig, WideResNetOutput};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::activation::{LeakyReLU, ReLU, Sigmoid};
    pub use crate::attention::{AttentionVariant, ChannelAttention};
    pub use crate::checkpoint::StateDict;
    pub use crate::conv::{Conv2d, Conv2dConfig};
    pub use crate::dense::Linear;
    pub use crate::dropout::Dropout;
    pub use crate::error::{LayerError, LayerResult};
    pub use crate::initializer::Initializer;
    pub use crate::input::{images_to_batch, ChannelNormalization};
    pub use crate::layer::Layer;
    pub use crate::normalization::BatchNorm2d;
    pub use crate::residual::{BasicBlock, BlockConfig, GatedBlock, ResidualUnit};
    pub use crate::stage::{Stage, StageConfig};
    pub use crate::tensor::{best_device, DType, Device, Tensor, Var};
    pub use crate::wide_resnet::{cdwrn28, WideResNet, WideResNetConfig, WideResNetOutput};
}
