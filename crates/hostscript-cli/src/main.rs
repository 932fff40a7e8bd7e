//! Diagnostics for embedded scripting runtime sessions.
//!
//! Usage:
//! ```bash
//! hostscript doctor                       # Explain how Python would be found
//! hostscript doctor --runtime javascript  # Same for the JavaScript runtime
//! hostscript doctor --config ./hostscript.toml --json
//! hostscript kinds                        # List the session kinds
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Debug, Parser)]
#[command(name = "hostscript", author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the resolved configuration and the home-directory diagnosis
    Doctor(commands::doctor::DoctorArgs),

    /// List the session kinds
    Kinds(commands::kinds::KindsArgs),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Doctor(_) => f.debug_tuple("Doctor").finish(),
            Self::Kinds(_) => f.debug_tuple("Kinds").finish(),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().context("failed to parse log directive")?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();

    match &args.command {
        Command::Doctor(args) => commands::doctor::run(args),
        Command::Kinds(args) => {
            commands::kinds::run(args);
            Ok(())
        }
    }
}
