// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! IPC client with local fallback.
//!
//! [`GovernorClient`] always hands the caller a structured decision.  If the
//! request cannot be delivered (no socket, connect timeout, broken pipe),
//! Acquire is decided locally by the [`FallbackPolicy`] and any local grant is
//! tracked under its `local-` id.  Once the request has been delivered the
//! service may already hold a reservation for it, so a lost answer becomes a
//! `governor_error` denial instead of a local grant.  Release of a local id
//! never touches the service; release of a server id that cannot be delivered
//! comes back as `LeaseNotFound` with a retry recommendation.
//!
//! Each call opens its own connection, bounded by the configured connect and
//! request timeouts.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use model_governor_core::config::{ClientConfig, FallbackMode};
use model_governor_core::error::ProtocolError;
use model_governor_core::fallback::{is_local_lease, FallbackPolicy};
use model_governor_core::protocol::{Command, RequestEnvelope, ResponseEnvelope};
use model_governor_core::types::{
    AcquireLeaseRequest, AcquireLeaseResponse, DenialReason, ReleaseLeaseRequest, ReleaseLeaseResponse,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::socket_path;
use crate::transport::{recv_json, send_json, FrameCodec, TransportError};

/// Why a round trip to the service did not produce an envelope.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("governor unreachable at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("connecting to the governor timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The request frame could not be sent.
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("cancelled before the request was sent")]
    Cancelled,

    #[error("governor did not answer within {0:?}")]
    RequestTimeout(Duration),

    #[error("governor closed the connection without answering")]
    NoResponse,

    #[error("unreadable answer from the governor: {0}")]
    BadResponse(#[source] TransportError),
}

impl ClientError {
    /// Whether the request reached the service, which may already have acted
    /// on it.
    pub fn after_delivery(&self) -> bool {
        matches!(
            self,
            ClientError::RequestTimeout(_) | ClientError::NoResponse | ClientError::BadResponse(_)
        )
    }
}

/// Client for the governor service.
///
/// # Examples
///
/// ```rust,no_run
/// use model_governor_core::config::ClientConfig;
/// use model_governor_core::types::{AcquireLeaseRequest, ActionType};
/// use model_governor_std::client::GovernorClient;
///
/// # async fn run() {
/// let client = GovernorClient::new(ClientConfig::default());
/// let response = client
///     .acquire(&AcquireLeaseRequest {
///         actor_id:                "agent-001".into(),
///         workspace_id:            "ops".into(),
///         action_type:             ActionType::ChatCompletion,
///         model_id:                "small-model".into(),
///         provider_id:             "provider".into(),
///         estimated_prompt_tokens: 120,
///         max_output_tokens:       256,
///         estimated_cost_cents:    2,
///         requested_capabilities:  vec![],
///         risk_flags:              vec![],
///         idempotency_key:         "acq-001".into(),
///     })
///     .await;
/// println!("granted: {}", response.granted);
/// # }
/// ```
#[derive(Debug)]
pub struct GovernorClient {
    config: ClientConfig,
    socket: PathBuf,
    fallback: FallbackPolicy,
    /// Locally granted lease ids and their expiry.
    local_leases: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl GovernorClient {
    /// Client for the socket derived from `config.channel_name`.
    pub fn new(config: ClientConfig) -> Self {
        let socket = socket_path(&config.channel_name);
        Self::with_socket_path(config, socket)
    }

    /// Client for an explicit socket path.
    pub fn with_socket_path(config: ClientConfig, socket: impl Into<PathBuf>) -> Self {
        let fallback = FallbackPolicy::new(config.fallback.clone());
        Self {
            config,
            socket: socket.into(),
            fallback,
            local_leases: Mutex::new(HashMap::new()),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    pub fn fallback_mode(&self) -> FallbackMode {
        self.fallback.mode()
    }

    /// Locally granted leases not yet released or expired.
    pub fn local_lease_count(&self) -> usize {
        let now = Utc::now();
        self.local_leases().values().filter(|expires_at| **expires_at > now).count()
    }

    // -----------------------------------------------------------------------
    // Acquire
    // -----------------------------------------------------------------------

    pub async fn acquire(&self, request: &AcquireLeaseRequest) -> AcquireLeaseResponse {
        self.acquire_with_cancel(request, &CancellationToken::new()).await
    }

    /// Acquire a lease.  Cancellation is honoured only until the request has
    /// been sent.
    pub async fn acquire_with_cancel(
        &self,
        request: &AcquireLeaseRequest,
        cancel: &CancellationToken,
    ) -> AcquireLeaseResponse {
        match self.round_trip::<_, AcquireLeaseResponse>(Command::Acquire, request, cancel).await {
            Ok(Ok(response)) => response,
            Ok(Err(server_error)) => {
                warn!(error = %server_error, key = %request.idempotency_key, "governor rejected acquire");
                AcquireLeaseResponse::denied(
                    DenialReason::GovernorError,
                    Some(format!("Governor rejected the request: {server_error}")),
                    None,
                    &request.idempotency_key,
                )
            }
            Err(ClientError::Cancelled) => AcquireLeaseResponse::denied(
                DenialReason::Cancelled,
                Some("Request was cancelled before it reached the governor.".into()),
                None,
                &request.idempotency_key,
            ),
            Err(error) if error.after_delivery() => {
                warn!(%error, key = %request.idempotency_key, "acquire delivered but unanswered");
                AcquireLeaseResponse::denied(
                    DenialReason::GovernorError,
                    Some(format!(
                        "The governor received the request but its answer was lost ({error}); \
                         retry with the same idempotency key to replay the decision."
                    )),
                    None,
                    &request.idempotency_key,
                )
            }
            Err(error) => self.acquire_locally(request, &error),
        }
    }

    fn acquire_locally(&self, request: &AcquireLeaseRequest, cause: &ClientError) -> AcquireLeaseResponse {
        let now = Utc::now();
        let response = self.fallback.evaluate(request, now);
        warn!(
            error = %cause,
            mode = %self.fallback.mode(),
            granted = response.granted,
            reason = response.denied_reason.map(DenialReason::as_str),
            "governor unreachable; decided locally"
        );

        if let (Some(lease_id), Some(expires_at)) = (&response.lease_id, response.expires_at_utc) {
            let mut leases = self.local_leases();
            leases.retain(|_, expiry| *expiry > now);
            leases.insert(lease_id.clone(), expires_at);
        }
        response
    }

    // -----------------------------------------------------------------------
    // Release
    // -----------------------------------------------------------------------

    pub async fn release(&self, request: &ReleaseLeaseRequest) -> ReleaseLeaseResponse {
        self.release_with_cancel(request, &CancellationToken::new()).await
    }

    /// Release a lease.  Local leases are resolved without the service.
    pub async fn release_with_cancel(
        &self,
        request: &ReleaseLeaseRequest,
        cancel: &CancellationToken,
    ) -> ReleaseLeaseResponse {
        if is_local_lease(&request.lease_id) {
            return self.release_locally(request);
        }

        match self.round_trip::<_, ReleaseLeaseResponse>(Command::Release, request, cancel).await {
            Ok(Ok(response)) => response,
            Ok(Err(server_error)) => {
                warn!(error = %server_error, lease_id = %request.lease_id, "governor rejected release");
                ReleaseLeaseResponse::not_found(
                    Some(format!("Governor rejected the release: {server_error}")),
                    &request.idempotency_key,
                )
            }
            Err(ClientError::Cancelled) => ReleaseLeaseResponse::not_found(
                Some("Release was cancelled before it reached the governor; retry with the same idempotency key.".into()),
                &request.idempotency_key,
            ),
            Err(error) if error.after_delivery() => {
                warn!(%error, lease_id = %request.lease_id, "release delivered but unanswered");
                ReleaseLeaseResponse::not_found(
                    Some(format!(
                        "The governor received the release but its answer was lost ({error}); \
                         retry with the same idempotency key to learn the outcome."
                    )),
                    &request.idempotency_key,
                )
            }
            Err(error) => {
                warn!(%error, lease_id = %request.lease_id, "governor unreachable; release not delivered");
                ReleaseLeaseResponse::not_found(
                    Some("Governor unreachable; retry the release with the same idempotency key once the service is reachable.".into()),
                    &request.idempotency_key,
                )
            }
        }
    }

    fn release_locally(&self, request: &ReleaseLeaseRequest) -> ReleaseLeaseResponse {
        if self.local_leases().remove(&request.lease_id).is_some() {
            debug!(lease_id = %request.lease_id, "local lease released");
            return ReleaseLeaseResponse::recorded(&request.idempotency_key);
        }
        ReleaseLeaseResponse::not_found(
            Some("Local lease is unknown or already released; no further action is needed.".into()),
            &request.idempotency_key,
        )
    }

    // -----------------------------------------------------------------------
    // Transport
    // -----------------------------------------------------------------------

    /// One framed request/response exchange on a fresh connection.
    ///
    /// `Ok(Err(message))` is a failure envelope from a reachable service.  A
    /// request counts as delivered once its frame has been flushed; failures
    /// after that point are reported with [`ClientError::after_delivery`].
    async fn round_trip<Req, Resp>(
        &self,
        command: Command,
        request: &Req,
        cancel: &CancellationToken,
    ) -> Result<Result<Resp, String>, ClientError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let envelope = RequestEnvelope::new(command, request)?;

        let connect_timeout = self.config.connect_timeout();
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            connected = tokio::time::timeout(connect_timeout, UnixStream::connect(&self.socket)) => match connected {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => return Err(ClientError::Connect { path: self.socket.clone(), source }),
                Err(_) => return Err(ClientError::ConnectTimeout(connect_timeout)),
            },
        };
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        let request_timeout = self.config.request_timeout();
        let deadline = tokio::time::Instant::now() + request_timeout;
        let mut framed = Framed::new(stream, FrameCodec::new());

        match tokio::time::timeout_at(deadline, send_json(&mut framed, &envelope)).await {
            Ok(sent) => sent?,
            Err(_) => return Err(TransportError::Io(io::ErrorKind::TimedOut.into()).into()),
        }

        // Past this point the service may act on the request, so the exchange
        // runs to completion and never falls back.
        let response = match tokio::time::timeout_at(deadline, recv_json::<_, ResponseEnvelope>(&mut framed)).await {
            Ok(Ok(Some(response))) => response,
            Ok(Ok(None)) => return Err(ClientError::NoResponse),
            Ok(Err(error)) => return Err(ClientError::BadResponse(error)),
            Err(_) => return Err(ClientError::RequestTimeout(request_timeout)),
        };

        debug!(command = %command, success = response.success, "governor answered");
        response
            .into_payload()
            .map_err(|error| ClientError::BadResponse(TransportError::Protocol(error)))
    }

    fn local_leases(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.local_leases.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model_governor_core::config::FallbackConfig;
    use model_governor_core::types::{ActionType, Classification, Outcome};

    fn unreachable_client(mode: FallbackMode) -> (tempfile::TempDir, GovernorClient) {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            connect_timeout_ms: 100,
            fallback: FallbackConfig {
                mode,
                ..FallbackConfig::default()
            },
            ..ClientConfig::default()
        };
        let client = GovernorClient::with_socket_path(config, dir.path().join("absent.sock"));
        (dir, client)
    }

    fn request(key: &str) -> AcquireLeaseRequest {
        AcquireLeaseRequest {
            actor_id: "agent".into(),
            workspace_id: "ws".into(),
            action_type: ActionType::ChatCompletion,
            model_id: "m".into(),
            provider_id: "p".into(),
            estimated_prompt_tokens: 10,
            max_output_tokens: 100,
            estimated_cost_cents: 1,
            requested_capabilities: vec![],
            risk_flags: vec![],
            idempotency_key: key.into(),
        }
    }

    #[tokio::test]
    async fn local_lease_is_released_without_the_service() {
        let (_dir, client) = unreachable_client(FallbackMode::Dev);
        let grant = client.acquire(&request("k1")).await;
        let lease_id = grant.lease_id.unwrap();
        assert_eq!(client.local_lease_count(), 1);

        let release = ReleaseLeaseRequest::zeroed(&lease_id, Outcome::Success, "r1");
        assert_eq!(client.release(&release).await.classification, Classification::Recorded);
        assert_eq!(client.local_lease_count(), 0);

        let again = ReleaseLeaseRequest::zeroed(&lease_id, Outcome::Success, "r2");
        assert_eq!(client.release(&again).await.classification, Classification::LeaseNotFound);
    }

    #[tokio::test]
    async fn server_lease_release_degrades_to_not_found() {
        let (_dir, client) = unreachable_client(FallbackMode::Dev);
        let release = ReleaseLeaseRequest::zeroed("lease-123", Outcome::Success, "r1");
        let response = client.release(&release).await;
        assert_eq!(response.classification, Classification::LeaseNotFound);
        assert!(response.recommendation.unwrap().contains("retry"));
    }

    #[tokio::test]
    async fn local_lease_past_its_ttl_still_releases_as_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            connect_timeout_ms: 100,
            fallback: FallbackConfig {
                local_lease_ttl_ms: 1,
                ..FallbackConfig::default()
            },
            ..ClientConfig::default()
        };
        let client = GovernorClient::with_socket_path(config, dir.path().join("absent.sock"));

        let lease_id = client.acquire(&request("k1")).await.lease_id.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let release = ReleaseLeaseRequest::zeroed(&lease_id, Outcome::Success, "r1");
        assert_eq!(client.release(&release).await.classification, Classification::Recorded);
    }

    #[tokio::test]
    async fn unanswered_request_is_not_decided_locally() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("silent.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        let silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::new());
            let received: Option<RequestEnvelope> = recv_json(&mut framed).await.unwrap();
            assert!(received.is_some());
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let config = ClientConfig {
            connect_timeout_ms: 200,
            request_timeout_ms: 100,
            ..ClientConfig::default()
        };
        let client = GovernorClient::with_socket_path(config, &socket);

        let response = client.acquire(&request("k1")).await;
        assert!(!response.granted);
        assert_eq!(response.denied_reason, Some(DenialReason::GovernorError));
        assert!(response.recommendation.unwrap().contains("same idempotency key"));
        assert_eq!(client.local_lease_count(), 0);
        silent.abort();
    }

    #[tokio::test]
    async fn cancelled_acquire_does_not_fall_back() {
        let (_dir, client) = unreachable_client(FallbackMode::Dev);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let response = client.acquire_with_cancel(&request("k1"), &cancel).await;
        assert_eq!(response.denied_reason, Some(DenialReason::Cancelled));
        assert_eq!(client.local_lease_count(), 0);
    }
}
