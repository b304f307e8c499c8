// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Wiring for the governor daemon.
//!
//! [`run_service`] assembles every piece from a [`ServiceConfig`]: it loads
//! the policy, opens the audit sink, builds the governor, starts the policy
//! watcher and the optional sweeper, binds the socket and serves until the
//! shutdown token fires.  Loading the initial policy, opening the audit file
//! and binding the socket are the only fatal steps.

use std::sync::Arc;
use std::time::Duration;

use model_governor_core::async_governor::AsyncLeaseGovernor;
use model_governor_core::audit::{AuditSink, TracingAuditSink};
use model_governor_core::config::ServiceConfig;
use model_governor_core::error::PolicyError;
use model_governor_core::governor::LeaseGovernor;
use model_governor_core::policy::PolicyStore;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit_file::{AuditFileError, JsonLinesAuditSink};
use crate::channel::socket_path;
use crate::policy_watch::PolicyWatcher;
use crate::server::{PipeServer, ServerError};

/// How long shutdown waits for the audit writer to drain.
const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Startup failures.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("initial policy load failed: {0}")]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Audit(#[from] AuditFileError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Run the governor service until `shutdown` is cancelled.
///
/// `ready` (if given) receives the socket path once the server is listening.
pub async fn run_service(
    config: ServiceConfig,
    shutdown: CancellationToken,
    ready: Option<oneshot::Sender<std::path::PathBuf>>,
) -> Result<(), ServiceError> {
    let policy = Arc::new(PolicyStore::load_file(&config.policy_path)?);
    let snapshot = policy.current();
    info!(
        path = %config.policy_path.display(),
        max_in_flight = snapshot.max_in_flight,
        daily_budget_cents = snapshot.daily_budget_cents,
        "policy loaded"
    );

    let audit_file = match &config.audit_path {
        Some(path) => Some(JsonLinesAuditSink::open(path).await?),
        None => None,
    };
    let audit: Arc<dyn AuditSink> = match &audit_file {
        Some((sink, _)) => Arc::new(sink.clone()),
        None => Arc::new(TracingAuditSink),
    };

    let governor = AsyncLeaseGovernor::new(Arc::new(LeaseGovernor::new(
        config.governor.clone(),
        Arc::clone(&policy),
        audit,
    )));

    let background = shutdown.child_token();
    let watcher = config.policy_reload_interval_ms.map(|interval_ms| {
        PolicyWatcher::spawn(
            Arc::clone(&policy),
            config.policy_path.clone(),
            Duration::from_millis(interval_ms),
            background.clone(),
        )
    });
    let sweeper = config
        .governor
        .sweep_interval_ms
        .map(|interval_ms| governor.spawn_sweeper(Duration::from_millis(interval_ms), background.clone()));

    let server = PipeServer::bind(socket_path(&config.channel_name), governor, config.max_connections)?;
    if let Some(ready) = ready {
        // The caller may not be waiting.
        let _ = ready.send(server.path().to_path_buf());
    }
    server.serve(shutdown).await;

    background.cancel();
    for task in [watcher, sweeper].into_iter().flatten() {
        if let Err(error) = task.await {
            warn!(%error, "background task ended abnormally");
        }
    }

    if let Some((sink, writer)) = audit_file {
        if let Err(error) = sink.flush().await {
            warn!(%error, "final audit flush failed");
        }
        // The governor (and its clone of the sink) is gone once serve returns;
        // dropping ours lets the writer drain and exit.
        drop(sink);
        match tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, writer).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(%error, "audit writer ended abnormally"),
            Err(_) => warn!("audit writer still has open senders at shutdown"),
        }
    }

    info!("governor service stopped");
    Ok(())
}
