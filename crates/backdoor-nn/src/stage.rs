//! Stacks of residual blocks.

use candle_core::{Device, Tensor, Var};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::attention::AttentionVariant;
use crate::checkpoint::{join_name, StateDict, StateVisitor};
use crate::error::{LayerError, LayerResult};
use crate::layer::Layer;
use crate::residual::{BlockConfig, GatedBlock, ResidualUnit};

/// Configuration of a stage of `num_blocks` residual blocks.
///
/// The first block performs the channel and stride transition, the others
/// map `out_channels -> out_channels` with stride 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Number of blocks in the stage.
    pub num_blocks: usize,
    /// Input channels of the first block.
    pub in_channels: usize,
    /// Output channels of every block.
    pub out_channels: usize,
    /// Stride of the first block.
    pub stride: usize,
    /// Dropout rate of every block.
    pub dropout_rate: f32,
    /// `activate_before_residual` flag of the first block.
    pub activate_before_residual: bool,
    /// Gate variant shared by every block of a gated stage.
    pub attention_variant: AttentionVariant,
}

impl StageConfig {
    /// Creates a stage configuration with default options.
    pub fn new(num_blocks: usize, in_channels: usize, out_channels: usize, stride: usize) -> Self {
        Self {
            num_blocks,
            in_channels,
            out_channels,
            stride,
            dropout_rate: 0.0,
            activate_before_residual: false,
            attention_variant: AttentionVariant::default(),
        }
    }

    /// Sets the dropout rate.
    pub fn with_dropout_rate(mut self, dropout_rate: f32) -> Self {
        self.dropout_rate = dropout_rate;
        self
    }

    /// Sets the `activate_before_residual` flag of the first block.
    pub fn with_activate_before_residual(mut self, activate: bool) -> Self {
        self.activate_before_residual = activate;
        self
    }

    /// Sets the gate variant.
    pub fn with_attention_variant(mut self, variant: AttentionVariant) -> Self {
        self.attention_variant = variant;
        self
    }

    /// Returns the configuration of block `index`.
    pub fn block_config(&self, index: usize) -> BlockConfig {
        let (in_channels, stride, activate) = if index == 0 {
            (self.in_channels, self.stride, self.activate_before_residual)
        } else {
            (self.out_channels, 1, false)
        };
        BlockConfig::new(in_channels, self.out_channels, stride)
            .with_dropout_rate(self.dropout_rate)
            .with_activate_before_residual(activate)
            .with_attention_variant(self.attention_variant)
    }
}

/// A sequence of residual blocks of one kind.
#[derive(Debug)]
pub struct Stage<B> {
    blocks: Vec<B>,
    config: StageConfig,
    training: bool,
}

impl<B: ResidualUnit> Stage<B> {
    /// Builds every block of the stage.
    ///
    /// # Errors
    ///
    /// Fails when `num_blocks` is zero or a block cannot be built.
    pub fn new<R: Rng + ?Sized>(
        config: StageConfig,
        rng: &mut R,
        device: &Device,
    ) -> LayerResult<Self> {
        if config.num_blocks == 0 {
            return Err(LayerError::config("a stage needs at least one block"));
        }
        let blocks = (0..config.num_blocks)
            .map(|index| B::from_config(config.block_config(index), rng, device))
            .collect::<LayerResult<Vec<_>>>()?;
        debug!(
            blocks = config.num_blocks,
            in_channels = config.in_channels,
            out_channels = config.out_channels,
            stride = config.stride,
            "built stage"
        );

        Ok(Self {
            blocks,
            config,
            training: true,
        })
    }

    /// Returns the blocks in order.
    pub fn blocks(&self) -> &[B] {
        &self.blocks
    }

    /// Returns the stage configuration.
    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Returns the number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the stage has no blocks. Never true for a built stage.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl Stage<GatedBlock> {
    /// Runs every block and collects the `(B, C)` gate of each.
    pub fn forward_with_gates(&self, input: &Tensor) -> LayerResult<(Tensor, Vec<Tensor>)> {
        let mut out = input.clone();
        let mut gates = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (next, gate) = block.forward_with_gate(&out)?;
            out = next;
            gates.push(gate);
        }
        Ok((out, gates))
    }
}

impl<B: ResidualUnit> Layer for Stage<B> {
    fn forward(&self, input: &Tensor) -> LayerResult<Tensor> {
        let mut out = input.clone();
        for block in &self.blocks {
            out = block.forward(&out)?;
        }
        Ok(out)
    }

    fn parameters(&self) -> Vec<&Var> {
        self.blocks.iter().flat_map(|b| b.parameters()).collect()
    }

    fn name(&self) -> &str {
        "Stage"
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        for block in &mut self.blocks {
            block.set_training(training);
        }
    }
}

impl<B: ResidualUnit> StateDict for Stage<B> {
    fn visit_state(&self, prefix: &str, visitor: &mut dyn StateVisitor) -> LayerResult<()> {
        for (index, block) in self.blocks.iter().enumerate() {
            block.visit_state(&join_name(prefix, &index.to_string()), visitor)?;
        }
        Ok(())
    }
}
