//! Backdoor CLI Library
//!
//! This crate provides the command-line interface for backdoor research tools:
//!
//! - **Poison**: Apply a BadNets or Blend trigger to an image file
//! - **Inspect**: Run a gated wide residual network and report its attention gates
//!
//! # Example
//!
//! ```bash
//! # Paint a 3x3 BadNets patch
//! backdoor poison --input cat.png --output cat_badnets.png --trigger badnets --trigger-size 3
//!
//! # Blend a pattern image with alpha 0.1
//! backdoor poison --input cat.png --output cat_blend.png --trigger blend --pattern kitty.png
//!
//! # Inspect gates of a trained network on two images
//! backdoor inspect --weights cdwrn28.safetensors --json cat.png cat_blend.png
//! ```

pub mod commands;

use clap::{Parser, Subcommand};

pub use commands::{GateStats, InspectCommand, InspectReport, PoisonCommand, TriggerKind};

/// Backdoor - trigger poisoning and attention-gate inspection
#[derive(Parser, Debug)]
#[command(name = "backdoor")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply a backdoor trigger to an image
    Poison(PoisonCommand),

    /// Run a gated wide residual network and report logits and gates
    Inspect(InspectCommand),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_poison() {
        let cli = Cli::try_parse_from([
            "backdoor",
            "poison",
            "--input",
            "in.png",
            "--output",
            "out.png",
            "--trigger",
            "blend",
            "--pattern",
            "p.png",
            "--alpha",
            "0.2",
        ])
        .unwrap();
        match cli.command {
            Commands::Poison(cmd) => {
                assert!(matches!(cmd.trigger, TriggerKind::Blend));
                assert_eq!(cmd.alpha, 0.2);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_inspect_defaults() {
        let cli = Cli::try_parse_from(["backdoor", "inspect"]).unwrap();
        match cli.command {
            Commands::Inspect(cmd) => {
                let config = cmd.model_config().unwrap();
                assert_eq!(config.depth, 28);
                assert_eq!(config.widen_factor, 2);
                assert!(cmd.images.is_empty());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_unknown_attention_variant_rejected() {
        let result = Cli::try_parse_from(["backdoor", "inspect", "--attention", "4"]);
        assert!(result.is_err());
    }
}
