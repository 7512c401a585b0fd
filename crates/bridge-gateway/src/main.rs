//! Rabbit-Amazon bridge CLI

use anyhow::Context;
use bridge_core::memory::{MemoryAmazon, MemoryRabbit};
use bridge_core::prelude::*;
use bridge_core::ChainSpecEngine;
use bridge_gateway::{load_bridges, provision_local_amazon, BridgeApp};
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Parser, Debug)]
#[command(name = "rabbit-amazon-bridge")]
#[command(about = "Bridges rabbit exchanges with Amazon SNS/SQS")]
#[command(version)]
struct Args {
    /// Settings file (toml, yaml or json)
    #[arg(long, env = "BRIDGE_SETTINGS")]
    config: Option<String>,

    /// Extra settings file, ignored when missing
    #[arg(long, env = "BRIDGE_EXTRA_SETTINGS")]
    extra_config: Option<String>,

    /// Comma separated bridge definition files, overrides the settings
    #[arg(long, env = "BRIDGE_CONFIG_LOCATION")]
    bridge_config: Option<String>,

    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    #[arg(long, env = "LOG_FORMAT", value_enum)]
    log_format: Option<LogFormat>,

    /// Validate the bridge files and exit
    #[arg(long)]
    validate_only: bool,
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(fmt::layer().pretty())
            .with(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = BridgeSettings::load(args.config.as_deref(), args.extra_config.as_deref())
        .context("failed to load settings")?;
    if let Some(location) = args.bridge_config {
        settings.bridge.config_location = location;
    }

    let level = args
        .log_level
        .unwrap_or_else(|| settings.observability.log_level.clone());
    let format = args.log_format.unwrap_or(
        if settings.observability.log_format.eq_ignore_ascii_case("pretty") {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        },
    );
    init_tracing(&level, format);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting rabbit-amazon-bridge");

    let bridges = match load_bridges(&settings, Arc::new(ChainSpecEngine)) {
        Ok(bridges) => bridges,
        Err(e) => {
            error!(error = %e, "Bridge configuration rejected");
            return Err(e.into());
        }
    };

    if args.validate_only {
        for bridge in &bridges {
            info!(bridge = %bridge.label(), enabled = bridge.forwarding_enabled, "Bridge valid");
        }
        info!(count = bridges.len(), "Bridge configuration is valid");
        return Ok(());
    }

    // Local mode: both brokers live in process
    let rabbit = MemoryRabbit::new();
    let amazon = MemoryAmazon::new();
    provision_local_amazon(&amazon, &bridges).await;

    let app = BridgeApp::new(&settings, bridges, Arc::new(rabbit), Arc::new(amazon));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    };

    if let Err(e) = app.run_until(shutdown).await {
        error!(error = %e, "Bridge failed");
        return Err(e.into());
    }

    info!("rabbit-amazon-bridge stopped");
    Ok(())
}
