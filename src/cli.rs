//! CLI definitions for Tenure.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Tenure CLI.
#[derive(Parser)]
#[command(name = "tenure")]
#[command(about = "Lifecycle and async-command coordination for single-owner components")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/default.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run a component with sleeping commands on a dispatcher thread and dispose it
    Demo(DemoArgs),

    /// Load and validate a configuration file
    CheckConfig {
        /// File to check
        path: PathBuf,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub(crate) struct DemoArgs {
    /// Number of commands to register and execute
    #[arg(long, default_value_t = 3)]
    pub commands: usize,

    /// How long each command body sleeps
    #[arg(long, default_value_t = 200)]
    pub work_ms: u64,

    /// Delay between starting the commands and disposing the component
    #[arg(long, default_value_t = 50)]
    pub dispose_after_ms: u64,

    /// Let each command run twice concurrently
    #[arg(long)]
    pub unbounded: bool,
}
