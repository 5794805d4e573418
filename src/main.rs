//! The online training control plane.

mod app;
mod broker;
mod config;
mod error;
#[cfg(test)]
mod fixtures;
mod gateway;
mod server;
mod supervisor;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true),
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    tracing::info!(
        http_port = %cfg.http_port,
        trainer_bin = %cfg.trainer_bin,
        pipeline_config_path = %cfg.pipeline_config_path,
        model_dir = %cfg.model_dir,
        kafka_servers = %cfg.kafka_servers,
        kafka_topic = %cfg.kafka_topic,
        "starting online training control plane",
    );
    if let Err(err) = App::new(cfg).await?.spawn().await {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
