//! Backdoor CLI - poison images with triggers and inspect attention gates.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use backdoor_cli::{Cli, Commands};

fn main() -> Result<()> {
    // Initialize tracing subscriber with environment filter
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("backdoor=info".parse()?))
        .init();

    let cli = Cli::parse();
    info!("backdoor CLI starting...");

    match cli.command {
        Commands::Poison(cmd) => cmd.run()?,
        Commands::Inspect(cmd) => cmd.run()?,
    }

    info!("backdoor CLI completed successfully");
    Ok(())
}
