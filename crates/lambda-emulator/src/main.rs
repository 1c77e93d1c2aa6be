//! Lambda invoke emulator binary.
//!
//! Serves the Invoke API and function URL style requests, and runs the
//! function's bootstrap against a local Runtime API.
//!
//! # Configuration
//!
//! Function settings are read once at startup from the process environment:
//!
//! - `AWS_LAMBDA_FUNCTION_TIMEOUT` - invoke timeout in seconds (default 300)
//! - `AWS_LAMBDA_FUNCTION_NAME`, `AWS_LAMBDA_FUNCTION_VERSION`,
//!   `AWS_LAMBDA_FUNCTION_MEMORY_SIZE`
//! - `AWS_LAMBDA_FUNCTION_HANDLER` or `_HANDLER`
//!
//! A malformed timeout is fatal.

use anyhow::{Context, Result};
use clap::Parser;
use lambda_emulator::{Bootstrap, Emulator, EmulatorConfig, EnvironmentSnapshot, RuntimeApiSandbox};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "lambda-emulator", version, about)]
struct Cli {
    /// Address the invoke endpoint listens on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Address the local Runtime API listens on.
    #[arg(long, default_value = "127.0.0.1:9001")]
    runtime_api: SocketAddr,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Wait for an externally started runtime instead of spawning a bootstrap.
    #[arg(long, conflicts_with = "bootstrap")]
    external_runtime: bool,

    /// Bootstrap command and arguments. Defaults to the first existing
    /// standard bootstrap location.
    #[arg(trailing_var_arg = true)]
    bootstrap: Vec<String>,
}

impl Cli {
    fn bootstrap(&self) -> Bootstrap {
        if self.external_runtime {
            Bootstrap::external()
        } else if self.bootstrap.is_empty() {
            Bootstrap::discover()
        } else {
            Bootstrap::new(self.bootstrap.iter().cloned())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level).context("failed to initialise tracing subscriber")?;

    let environment = EnvironmentSnapshot::capture();
    let config = EmulatorConfig::load(&environment).context("failed to load configuration")?;
    tracing::debug!(?config, "Configuration loaded");

    let bootstrap = cli.bootstrap();
    tracing::debug!(command = ?bootstrap.command(), "Using bootstrap");

    let sandbox = RuntimeApiSandbox::start(cli.runtime_api)
        .await
        .context("failed to start runtime API")?;

    let emulator = Emulator::builder()
        .sandbox(Arc::new(sandbox))
        .config(config)
        .environment(environment)
        .bootstrap(bootstrap)
        .addr(cli.listen)
        .build()
        .await
        .context("failed to start emulator")?;

    tokio::select! {
        result = emulator.wait() => result.context("emulator server failed")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).without_time())
        .with(filter)
        .try_init()
        .context("failed to initialise tracing registry")?;

    Ok(())
}
