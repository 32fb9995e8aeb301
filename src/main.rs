//! Tenure host binary.
//!
//! Runs the lifecycle engine end to end and checks configuration files.

mod cli;
mod cmd_config;
mod cmd_demo;

use std::process::ExitCode;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use tenure_config::{ComponentConfig, ConfigLoader, ConfigValidator, LoggingConfig};

use crate::cli::{Cli, Commands};
use crate::cmd_config::check_config;
use crate::cmd_demo::run_demo;

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&logging.level))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).try_init()?;
    } else {
        registry
            .with(fmt::layer().with_target(true).with_ansi(true))
            .try_init()?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = ConfigLoader::load_or_default(&cli.config)?;
    init_tracing(&config.logging)?;
    info!("Starting Tenure v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Demo(args) => {
            for warning in ConfigValidator::validate(&config).into_result()? {
                warn!(path = %warning.path, "{}", warning.message);
            }
            ComponentConfig::set_global_default(config.component)?;
            run_demo(args).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::CheckConfig { path } => {
            if check_config(&path)? {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
    }
}
