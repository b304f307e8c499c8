// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Model governor daemon.
//!
//! Configuration is layered: defaults, then the TOML file given by
//! `--config`, then `MODEL_GOVERNOR_*` environment variables, then the
//! remaining command-line flags.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use model_governor_core::config::ServiceConfig;
use model_governor_core::config_loader::{apply_service_env, load_service_config};
use model_governor_std::run_service;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Model governor daemon CLI
#[derive(Parser)]
#[command(name = "model-governord")]
#[command(about = "Lease-based admission control for AI model calls", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "MODEL_GOVERNOR_CONFIG")]
    config: Option<PathBuf>,

    /// Channel name or absolute socket path
    #[arg(long)]
    channel: Option<String>,

    /// Policy document (JSON)
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Audit file (JSON lines); audit goes to the log when unset
    #[arg(long)]
    audit: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "MODEL_GOVERNOR_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &cli.config {
        Some(path) => load_service_config(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServiceConfig::default(),
    };
    apply_service_env(&mut config).context("reading MODEL_GOVERNOR_* environment")?;
    if let Some(channel) = cli.channel {
        config.channel_name = channel;
    }
    if let Some(policy) = cli.policy {
        config.policy_path = policy;
    }
    if let Some(audit) = cli.audit {
        config.audit_path = Some(audit);
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    run_service(config, shutdown, None).await.context("governor service failed")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received terminate signal, shutting down"),
    }
}
