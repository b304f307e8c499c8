// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Unix-socket server in front of the governor.
//!
//! [`PipeServer`] accepts any number of concurrent connections (bounded by a
//! semaphore) and serves each on its own task.  Per connection it reads a
//! framed [`RequestEnvelope`], dispatches on the command name and writes a
//! framed [`ResponseEnvelope`].  Malformed JSON, unknown commands and invalid
//! requests get a failure envelope and the connection stays open.  So does a
//! frame whose header exceeds the size limit: its payload is skipped.  Only a
//! header too large to skip gets a failure envelope followed by a close.
//!
//! Binding is the one fatal step: a socket that cannot be bound aborts
//! startup with [`ServerError`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use model_governor_core::async_governor::AsyncLeaseGovernor;
use model_governor_core::error::{GovernorError, ProtocolError};
use model_governor_core::protocol::{Command, RequestEnvelope, ResponseEnvelope, MAX_FRAME_SIZE};
use model_governor_core::types::{AcquireLeaseRequest, ReleaseLeaseRequest};
use serde::Serialize;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::ensure_parent_dir;
use crate::transport::{send_json, Frame, FrameCodec, TransportError};

/// How long shutdown waits for open connections to finish their request.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Fatal server conditions.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path} exists but is not a socket")]
    NotASocket { path: PathBuf },

    #[error("connection limit must be greater than zero")]
    NoConnections,
}

/// Governor IPC listener.
pub struct PipeServer {
    listener: UnixListener,
    path: PathBuf,
    governor: AsyncLeaseGovernor,
    max_connections: usize,
    connections: Arc<Semaphore>,
}

impl PipeServer {
    /// Bind the socket at `path`, replacing a stale socket file if one exists.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] if `path` holds something other than a socket or
    /// cannot be bound.
    pub fn bind(
        path: impl Into<PathBuf>,
        governor: AsyncLeaseGovernor,
        max_connections: usize,
    ) -> Result<Self, ServerError> {
        if max_connections == 0 {
            return Err(ServerError::NoConnections);
        }
        let path = path.into();
        let bind_error = |source| ServerError::Bind {
            path: path.clone(),
            source,
        };

        ensure_parent_dir(&path).map_err(bind_error)?;
        remove_stale_socket(&path)?;
        let listener = UnixListener::bind(&path).map_err(bind_error)?;
        info!(path = %path.display(), max_connections, "governor listening");

        Ok(Self {
            listener,
            path,
            governor,
            max_connections,
            connections: Arc::new(Semaphore::new(max_connections)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve until `shutdown` fires, then wait (bounded) for open connections
    /// and remove the socket file.
    pub async fn serve(self, shutdown: CancellationToken) {
        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&self.connections).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let stream = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => stream,
                    Err(error) => {
                        warn!(%error, "accept failed");
                        continue;
                    }
                },
            };

            let governor = self.governor.clone();
            let cancel = shutdown.child_token();
            tokio::spawn(async move {
                let _permit = permit;
                serve_connection(stream, governor, cancel).await;
            });
        }

        self.drain().await;
        if let Err(error) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), %error, "socket file already gone");
        }
        info!(path = %self.path.display(), "governor stopped listening");
    }

    async fn drain(&self) {
        // Every permit back means every connection task has finished.
        let all = u32::try_from(self.max_connections).unwrap_or(u32::MAX);
        match tokio::time::timeout(DRAIN_TIMEOUT, self.connections.acquire_many(all)).await {
            Ok(_) => debug!("all connections closed"),
            Err(_) => warn!(timeout_ms = DRAIN_TIMEOUT.as_millis() as u64, "connections still open at shutdown"),
        }
    }
}

fn remove_stale_socket(path: &Path) -> Result<(), ServerError> {
    let Ok(metadata) = std::fs::symlink_metadata(path) else {
        return Ok(());
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if !metadata.file_type().is_socket() {
            return Err(ServerError::NotASocket { path: path.to_path_buf() });
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;

    std::fs::remove_file(path).map_err(|source| ServerError::Bind {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "removed stale socket file");
    Ok(())
}

// ---------------------------------------------------------------------------
// Per-connection loop
// ---------------------------------------------------------------------------

async fn serve_connection(stream: UnixStream, governor: AsyncLeaseGovernor, shutdown: CancellationToken) {
    let mut framed = Framed::new(stream, FrameCodec::new());
    debug!("connection opened");

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = framed.next() => next,
        };

        let (response, keep_open) = match next {
            None => break,
            Some(Ok(Frame::Message(payload))) => (dispatch(&governor, &payload, &shutdown).await, true),
            Some(Ok(Frame::Oversized { len })) => {
                warn!(len, max = MAX_FRAME_SIZE, "oversized frame skipped");
                let error = ProtocolError::FrameTooLarge { size: len, max: MAX_FRAME_SIZE };
                (ResponseEnvelope::failure(error.to_string()), true)
            }
            Some(Err(TransportError::Protocol(error))) => {
                warn!(%error, "unreadable frame; closing connection");
                (ResponseEnvelope::failure(error.to_string()), false)
            }
            Some(Err(error)) => {
                debug!(%error, "connection read failed");
                break;
            }
        };

        if let Err(error) = send_json(&mut framed, &response).await {
            debug!(%error, "failed to write response");
            break;
        }
        if !keep_open {
            break;
        }
    }
    debug!("connection closed");
}

/// Turn one request payload into one response envelope.  Never fails.
pub(crate) async fn dispatch(
    governor: &AsyncLeaseGovernor,
    payload: &[u8],
    cancel: &CancellationToken,
) -> ResponseEnvelope {
    let envelope: RequestEnvelope = match serde_json::from_slice(payload) {
        Ok(envelope) => envelope,
        Err(error) => return ResponseEnvelope::failure(format!("malformed request envelope: {error}")),
    };

    let command = match envelope.command() {
        Ok(command) => command,
        Err(error) => {
            debug!(command = %envelope.command, "unknown command");
            return ResponseEnvelope::failure(error.to_string());
        }
    };

    match command {
        Command::Acquire => match envelope.payload::<AcquireLeaseRequest>() {
            Ok(request) => respond(governor.acquire(&request, cancel).await),
            Err(error) => ResponseEnvelope::failure(format!("malformed Acquire payload: {error}")),
        },
        Command::Release => match envelope.payload::<ReleaseLeaseRequest>() {
            Ok(request) => respond(governor.release(&request, cancel).await),
            Err(error) => ResponseEnvelope::failure(format!("malformed Release payload: {error}")),
        },
    }
}

fn respond<T: Serialize>(result: Result<T, GovernorError>) -> ResponseEnvelope {
    match result {
        Ok(body) => ResponseEnvelope::ok(&body).unwrap_or_else(|error| ResponseEnvelope::failure(error.to_string())),
        Err(error) => ResponseEnvelope::failure(error.to_string()),
    }
}
