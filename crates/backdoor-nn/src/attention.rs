//! Channel attention (squeeze-and-excitation) gates.
//!
//! A [`ChannelAttention`] module squeezes a `(B, C, H, W)` feature map to
//! `(B, C, 1, 1)` by global average pooling, excites it with 1x1 convolutions
//! and squashes the result through a sigmoid. The gate is a per-(sample,
//! channel) scalar in `(0, 1)` that rescales the feature map.
//!
//! Three excitation variants are available:
//!
//! 1. **Bottleneck**: `C -> C/16 -> C` with a ReLU in between
//! 2. **Depthwise**: a per-channel affine map (`groups = C`)
//! 3. **Dense**: a full `C -> C` map
//!
//! # Reference
//!
//! Hu, J., Shen, L., & Sun, G. (2018). Squeeze-and-Excitation Networks.
//! In Proceedings of the IEEE Conference on Computer Vision and Pattern Recognition.

use std::fmt;
use std::str::FromStr;

use candle_core::{Device, Tensor, Var};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checkpoint::{join_name, StateDict, StateVisitor};
use crate::conv::{Conv2d, Conv2dConfig};
use crate::error::{LayerError, LayerResult};
use crate::layer::Layer;
use crate::tensor::global_avg_pool;

/// Channel reduction ratio of the bottleneck variant.
pub const REDUCTION: usize = 16;

/// How the squeezed channel descriptor is mapped back to per-channel gates.
///
/// Serialized as its numeric id (`1`, `2` or `3`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AttentionVariant {
    /// `C -> C/16 -> C` with ReLU (id 1).
    #[default]
    Bottleneck,
    /// Depthwise 1x1 convolution (id 2).
    Depthwise,
    /// Dense 1x1 convolution (id 3).
    Dense,
}

impl AttentionVariant {
    /// All variants in id order.
    pub const ALL: [AttentionVariant; 3] = [
        AttentionVariant::Bottleneck,
        AttentionVariant::Depthwise,
        AttentionVariant::Dense,
    ];

    /// Returns the numeric id of the variant.
    pub fn id(self) -> u8 {
        match self {
            AttentionVariant::Bottleneck => 1,
            AttentionVariant::Depthwise => 2,
            AttentionVariant::Dense => 3,
        }
    }
}

impl TryFrom<u8> for AttentionVariant {
    type Error = LayerError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            1 => Ok(AttentionVariant::Bottleneck),
            2 => Ok(AttentionVariant::Depthwise),
            3 => Ok(AttentionVariant::Dense),
            other => Err(LayerError::config(format!(
                "unknown attention variant {other}, expected 1, 2 or 3"
            ))),
        }
    }
}

impl From<AttentionVariant> for u8 {
    fn from(variant: AttentionVariant) -> Self {
        variant.id()
    }
}

impl FromStr for AttentionVariant {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bottleneck" => Ok(AttentionVariant::Bottleneck),
            "depthwise" => Ok(AttentionVariant::Depthwise),
            "dense" => Ok(AttentionVariant::Dense),
            other => other
                .parse::<u8>()
                .map_err(|_| LayerError::config(format!("unknown attention variant '{other}'")))
                .and_then(AttentionVariant::try_from),
        }
    }
}

impl fmt::Display for AttentionVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttentionVariant::Bottleneck => "bottleneck",
            AttentionVariant::Depthwise => "depthwise",
            AttentionVariant::Dense => "dense",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug)]
enum Excitation {
    Bottleneck { reduce: Conv2d, expand: Conv2d },
    Depthwise(Conv2d),
    Dense(Conv2d),
}

/// Squeeze-and-excitation gate over the channels of a feature map.
///
/// # Example
///
/// ```
/// use backdoor_nn::attention::{AttentionVariant, ChannelAttention};
/// use backdoor_nn::layer::Layer;
/// use candle_core::{Device, Tensor};
/// use rand::SeedableRng;
///
/// let mut rng = rand::rngs::StdRng::seed_from_u64(0);
/// let attn = ChannelAttention::new(64, AttentionVariant::Bottleneck, &mut rng, &Device::Cpu).unwrap();
/// let input = Tensor::randn(0f32, 1.0, (2, 64, 8, 8), &Device::Cpu).unwrap();
/// assert_eq!(attn.gate(&input).unwrap().dims(), &[2, 64, 1, 1]);
/// assert_eq!(attn.forward(&input).unwrap().dims(), &[2, 64, 8, 8]);
/// ```
#[derive(Debug)]
pub struct ChannelAttention {
    excitation: Excitation,
    variant: AttentionVariant,
    channels: usize,
}

impl ChannelAttention {
    /// Creates an attention gate for `channels` channels.
    ///
    /// # Errors
    ///
    /// The bottleneck variant fails when `channels / 16` is zero.
    pub fn new<R: Rng + ?Sized>(
        channels: usize,
        variant: AttentionVariant,
        rng: &mut R,
        device: &Device,
    ) -> LayerResult<Self> {
        let excitation = match variant {
            AttentionVariant::Bottleneck => {
                let hidden = channels / REDUCTION;
                if hidden == 0 {
                    return Err(LayerError::config(format!(
                        "bottleneck attention needs at least {REDUCTION} channels, got {channels}"
                    )));
                }
                Excitation::Bottleneck {
                    reduce: Conv2dConfig::new(channels, hidden, 1).build(rng, device)?,
                    expand: Conv2dConfig::new(hidden, channels, 1).build(rng, device)?,
                }
            }
            AttentionVariant::Depthwise => Excitation::Depthwise(
                Conv2dConfig::new(channels, channels, 1)
                    .with_groups(channels)
                    .build(rng, device)?,
            ),
            AttentionVariant::Dense => {
                Excitation::Dense(Conv2dConfig::new(channels, channels, 1).build(rng, device)?)
            }
        };
        debug!(channels, %variant, "built channel attention");

        Ok(Self {
            excitation,
            variant,
            channels,
        })
    }

    /// Returns the excitation variant.
    pub fn variant(&self) -> AttentionVariant {
        self.variant
    }

    /// Returns the number of gated channels.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Computes the `(B, C, 1, 1)` gate of a `(B, C, H, W)` feature map.
    pub fn gate(&self, input: &Tensor) -> LayerResult<Tensor> {
        let squeezed = global_avg_pool(input)?;
        let excited = match &self.excitation {
            Excitation::Bottleneck { reduce, expand } => {
                expand.forward(&reduce.forward(&squeezed)?.relu()?)?
            }
            Excitation::Depthwise(conv) | Excitation::Dense(conv) => conv.forward(&squeezed)?,
        };
        Ok(candle_nn::ops::sigmoid(&excited)?)
    }

    fn convs(&self) -> Vec<&Conv2d> {
        match &self.excitation {
            Excitation::Bottleneck { reduce, expand } => vec![reduce, expand],
            Excitation::Depthwise(conv) | Excitation::Dense(conv) => vec![conv],
        }
    }
}

impl Layer for ChannelAttention {
    /// Rescales every channel of the input by its gate.
    fn forward(&self, input: &Tensor) -> LayerResult<Tensor> {
        let gate = self.gate(input)?;
        Ok(input.broadcast_mul(&gate)?)
    }

    fn parameters(&self) -> Vec<&Var> {
        self.convs()
            .into_iter()
            .flat_map(|conv| conv.parameters())
            .collect()
    }

    fn name(&self) -> &str {
        "ChannelAttention"
    }
}

impl StateDict for ChannelAttention {
    // Positions match a sequential (pool, conv, relu, conv, sigmoid) layout.
    fn visit_state(&self, prefix: &str, visitor: &mut dyn StateVisitor) -> LayerResult<()> {
        match &self.excitation {
            Excitation::Bottleneck { reduce, expand } => {
                reduce.visit_state(&join_name(prefix, "1"), visitor)?;
                expand.visit_state(&join_name(prefix, "3"), visitor)
            }
            Excitation::Depthwise(conv) | Excitation::Dense(conv) => {
                conv.visit_state(&join_name(prefix, "1"), visitor)
            }
        }
    }
}
