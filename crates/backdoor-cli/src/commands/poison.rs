//! Poison Command Implementation
//!
//! Applies a BadNets or Blend trigger to an image file and writes the
//! poisoned image to the `--output` path.

use std::path::PathBuf;

use anyhow::{Context, Result};
use backdoor_triggers::{Blend, TriggerConfig};
use clap::Args;
use tracing::info;

/// Trigger family selectable from the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum TriggerKind {
    /// White square patch near the bottom-right corner
    #[default]
    Badnets,
    /// Alpha blend with a pattern image
    Blend,
}

/// Apply a backdoor trigger to an image
///
/// # Example
///
/// ```bash
/// backdoor poison \
///     --input clean.png \
///     --output poisoned.png \
///     --trigger blend \
///     --pattern hello_kitty.png \
///     --alpha 0.1
/// ```
#[derive(Args, Debug, Clone)]
pub struct PoisonCommand {
    /// Clean input image
    #[arg(long, short = 'i')]
    pub input: PathBuf,

    /// Where to write the poisoned image (format from the extension)
    #[arg(long, short = 'o')]
    pub output: PathBuf,

    /// JSON trigger description; takes precedence over the trigger flags
    #[arg(long, short = 'c', env = "BACKDOOR_TRIGGER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Trigger family
    #[arg(long, short = 't', value_enum, default_value = "badnets")]
    pub trigger: TriggerKind,

    /// Side length of the BadNets patch
    #[arg(long, default_value_t = 3)]
    pub trigger_size: usize,

    /// Pattern image of the Blend trigger
    #[arg(long, env = "BACKDOOR_BLEND_PATTERN")]
    pub pattern: Option<PathBuf>,

    /// Weight of the Blend pattern
    #[arg(long, default_value_t = Blend::DEFAULT_ALPHA)]
    pub alpha: f32,
}

impl PoisonCommand {
    /// Resolves the trigger from the config file or the flags.
    pub fn trigger_config(&self) -> Result<TriggerConfig> {
        if let Some(path) = &self.config {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read trigger config {}", path.display()))?;
            return serde_json::from_str(&raw)
                .with_context(|| format!("Invalid trigger config {}", path.display()));
        }

        Ok(match self.trigger {
            TriggerKind::Badnets => TriggerConfig::BadNets {
                trigger_size: self.trigger_size,
            },
            TriggerKind::Blend => TriggerConfig::Blend {
                trigger_path: self
                    .pattern
                    .clone()
                    .context("--pattern is required for the blend trigger")?,
                alpha: self.alpha,
            },
        })
    }

    /// Execute the poison command
    pub fn run(&self) -> Result<()> {
        let config = self.trigger_config()?;
        info!("Trigger: {:?}", config);
        let trigger = config.build().context("Failed to build trigger")?;

        let clean = image::open(&self.input)
            .with_context(|| format!("Failed to open image {}", self.input.display()))?
            .to_rgb8();
        info!(
            "Input: {} ({}x{})",
            self.input.display(),
            clean.width(),
            clean.height()
        );

        let poisoned = trigger
            .apply_rgb(&clean)
            .with_context(|| format!("{} trigger failed", trigger.name()))?;
        poisoned
            .save(&self.output)
            .with_context(|| format!("Failed to write {}", self.output.display()))?;

        info!("Wrote poisoned image to {}", self.output.display());
        Ok(())
    }
}
