// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! End-to-end tests over a real Unix socket.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use model_governor_core::async_governor::AsyncLeaseGovernor;
use model_governor_core::audit::{AuditDecision, InMemoryAuditSink};
use model_governor_core::config::{ClientConfig, FallbackConfig, FallbackMode, GovernorConfig};
use model_governor_core::governor::LeaseGovernor;
use model_governor_core::policy::{PolicySnapshot, PolicyStore};
use model_governor_core::protocol::{Command, RequestEnvelope, ResponseEnvelope, MAX_FRAME_SIZE};
use model_governor_core::types::{
    AcquireLeaseRequest, AcquireLeaseResponse, ActionType, Classification, DenialReason, Outcome,
    ReleaseLeaseRequest,
};
use model_governor_std::transport::{recv_json, send_json, FrameCodec};
use model_governor_std::{run_governed, GovernedCallError, GovernorClient, PipeServer, Usage};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

const POLICY: &str = r#"{
    "maxInFlight": 1,
    "dailyBudgetCents": 100,
    "allowedModels": ["small-model"],
    "allowedCapabilities": { "ChatCompletion": ["read"], "ToolCall": ["read", "search"] },
    "riskRequiresApproval": ["pii"]
}"#;

struct Running {
    _dir: tempfile::TempDir,
    socket: PathBuf,
    governor: Arc<LeaseGovernor>,
    audit: Arc<InMemoryAuditSink>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap();
        assert!(!self.socket.exists());
    }
}

async fn start(policy_json: &str) -> Running {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("governor.sock");
    let audit = Arc::new(InMemoryAuditSink::new());
    let governor = Arc::new(LeaseGovernor::new(
        GovernorConfig::default(),
        Arc::new(PolicyStore::new(PolicySnapshot::from_json(policy_json).unwrap())),
        audit.clone(),
    ));

    let server = PipeServer::bind(&socket, AsyncLeaseGovernor::new(governor.clone()), 16).unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(server.serve(shutdown.clone()));

    Running {
        _dir: dir,
        socket,
        governor,
        audit,
        shutdown,
        handle,
    }
}

fn client(socket: &Path, mode: FallbackMode) -> GovernorClient {
    let config = ClientConfig {
        connect_timeout_ms: 200,
        fallback: FallbackConfig {
            mode,
            ..FallbackConfig::default()
        },
        ..ClientConfig::default()
    };
    GovernorClient::with_socket_path(config, socket)
}

fn acquire(key: &str) -> AcquireLeaseRequest {
    AcquireLeaseRequest {
        actor_id: "agent-1".into(),
        workspace_id: "ws-1".into(),
        action_type: ActionType::ChatCompletion,
        model_id: "small-model".into(),
        provider_id: "provider".into(),
        estimated_prompt_tokens: 100,
        max_output_tokens: 200,
        estimated_cost_cents: 10,
        requested_capabilities: vec!["read".into()],
        risk_flags: vec![],
        idempotency_key: key.into(),
    }
}

// ---------------------------------------------------------------------------
// Server round trips
// ---------------------------------------------------------------------------

#[tokio::test]
async fn acquire_and_release_round_trip() {
    let running = start(POLICY).await;
    let client = client(&running.socket, FallbackMode::Dev);

    let first = client.acquire(&acquire("k1")).await;
    assert!(first.granted);
    let lease_id = first.lease_id.clone().unwrap();
    assert!(lease_id.starts_with("lease-"));

    let second = client.acquire(&acquire("k2")).await;
    assert_eq!(second.denied_reason, Some(DenialReason::ConcurrencyLimitReached));

    // Replay over the wire returns the stored response verbatim.
    assert_eq!(client.acquire(&acquire("k1")).await, first);

    let mut release = ReleaseLeaseRequest::zeroed(&lease_id, Outcome::Success, "r1");
    release.actual_cost_cents = 7;
    let released = client.release(&release).await;
    assert_eq!(released.classification, Classification::Recorded);
    assert_eq!(client.release(&release).await, released);

    assert_eq!(running.governor.in_flight_count(), 0);
    assert_eq!(running.governor.ledger_snapshot().consumed_cents, 7);
    assert_eq!(running.audit.count(AuditDecision::Granted), 1);
    assert_eq!(running.audit.count(AuditDecision::Denied), 1);
    assert_eq!(running.audit.count(AuditDecision::Released), 1);

    running.stop().await;
}

#[tokio::test]
async fn concurrent_clients_never_exceed_max_in_flight() {
    let running = start(&POLICY.replace("\"maxInFlight\": 1", "\"maxInFlight\": 5").replace("100,", "1000,")).await;
    let client = Arc::new(client(&running.socket, FallbackMode::Dev));

    let tasks: Vec<_> = (0..24)
        .map(|index| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.acquire(&acquire(&format!("c{index}"))).await })
        })
        .collect();

    let mut granted = 0;
    for task in tasks {
        let response = task.await.unwrap();
        if response.granted {
            assert!(response.lease_id.unwrap().starts_with("lease-"));
            granted += 1;
        } else {
            assert_eq!(response.denied_reason, Some(DenialReason::ConcurrencyLimitReached));
        }
    }
    assert_eq!(granted, 5);
    assert_eq!(running.governor.in_flight_count(), 5);
    assert_eq!(client.local_lease_count(), 0);

    running.stop().await;
}

async fn connect_raw(socket: &Path) -> Framed<UnixStream, FrameCodec> {
    Framed::new(UnixStream::connect(socket).await.unwrap(), FrameCodec::new())
}

async fn next_response(framed: &mut Framed<UnixStream, FrameCodec>) -> Option<ResponseEnvelope> {
    recv_json(framed).await.unwrap()
}

#[tokio::test]
async fn protocol_errors_keep_the_connection_open() {
    let running = start(POLICY).await;
    let mut framed = connect_raw(&running.socket).await;

    let unknown = RequestEnvelope {
        command: "Renew".into(),
        payload_json: "{}".into(),
    };
    send_json(&mut framed, &unknown).await.unwrap();
    assert!(!next_response(&mut framed).await.unwrap().success);

    framed.send(Bytes::from_static(b"{ not json")).await.unwrap();
    assert!(!next_response(&mut framed).await.unwrap().success);

    let valid = RequestEnvelope::new(Command::Acquire, &acquire("k1")).unwrap();
    send_json(&mut framed, &valid).await.unwrap();
    let response = next_response(&mut framed).await.unwrap();
    let body: AcquireLeaseResponse = response.into_payload().unwrap().unwrap();
    assert!(body.granted);

    drop(framed);
    running.stop().await;
}

#[tokio::test]
async fn oversized_frame_gets_a_failure_and_the_connection_survives() {
    let running = start(POLICY).await;
    let mut stream = UnixStream::connect(&running.socket).await.unwrap();

    let len = MAX_FRAME_SIZE + 1;
    stream.write_all(&(len as u32).to_be_bytes()).await.unwrap();
    stream.write_all(&vec![b' '; len]).await.unwrap();

    let mut framed = Framed::new(stream, FrameCodec::new());
    let failure = next_response(&mut framed).await.unwrap();
    assert!(!failure.success);
    assert!(failure.error.unwrap().contains("exceeds the maximum"));

    let valid = RequestEnvelope::new(Command::Acquire, &acquire("k1")).unwrap();
    send_json(&mut framed, &valid).await.unwrap();
    let body: AcquireLeaseResponse = next_response(&mut framed).await.unwrap().into_payload().unwrap().unwrap();
    assert!(body.granted);

    drop(framed);
    running.stop().await;
}

#[tokio::test]
async fn unskippable_header_gets_a_failure_then_close() {
    let running = start(POLICY).await;
    let mut stream = UnixStream::connect(&running.socket).await.unwrap();
    stream.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

    let mut framed = Framed::new(stream, FrameCodec::new());
    let failure = next_response(&mut framed).await.unwrap();
    assert!(!failure.success);
    assert!(next_response(&mut framed).await.is_none());

    running.stop().await;
}

#[tokio::test]
async fn invalid_request_maps_to_governor_error_denial() {
    let running = start(POLICY).await;
    let client = client(&running.socket, FallbackMode::Dev);

    let mut request = acquire("k1");
    request.actor_id = String::new();
    let response = client.acquire(&request).await;
    assert_eq!(response.denied_reason, Some(DenialReason::GovernorError));
    assert!(response.recommendation.unwrap().contains("actorId"));
    assert_eq!(client.local_lease_count(), 0);

    running.stop().await;
}

// ---------------------------------------------------------------------------
// Fallback with no server
// ---------------------------------------------------------------------------

fn missing_socket() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("nobody-listening.sock");
    (dir, socket)
}

#[tokio::test]
async fn dev_fallback_grants_bounded_and_denies_risky() {
    let (_dir, socket) = missing_socket();
    let client = client(&socket, FallbackMode::Dev);

    let bounded = client.acquire(&acquire("k1")).await;
    assert!(bounded.granted);
    assert!(bounded.lease_id.as_deref().unwrap().starts_with("local-"));

    let mut risky = acquire("k2");
    risky.requested_capabilities.push("network-write".into());
    let denied = client.acquire(&risky).await;
    assert_eq!(denied.denied_reason, Some(DenialReason::FallbackRiskyCapability));

    let release = ReleaseLeaseRequest::zeroed(bounded.lease_id.as_deref().unwrap(), Outcome::Success, "r1");
    assert_eq!(client.release(&release).await.classification, Classification::Recorded);
}

#[tokio::test]
async fn prod_fallback_allows_only_small_chat_completions() {
    let (_dir, socket) = missing_socket();
    let client = client(&socket, FallbackMode::Prod);

    assert!(client.acquire(&acquire("k1")).await.granted);

    let mut tool = acquire("k2");
    tool.action_type = ActionType::ToolCall;
    tool.max_output_tokens = 1;
    assert_eq!(
        client.acquire(&tool).await.denied_reason,
        Some(DenialReason::FallbackActionNotAllowed)
    );

    let mut large = acquire("k3");
    large.max_output_tokens = 2_000;
    assert_eq!(
        client.acquire(&large).await.denied_reason,
        Some(DenialReason::FallbackOutputCapExceeded)
    );
}

// ---------------------------------------------------------------------------
// Governed calls
// ---------------------------------------------------------------------------

#[tokio::test]
async fn governed_call_releases_with_actual_usage() {
    let running = start(POLICY).await;
    let client = Arc::new(client(&running.socket, FallbackMode::Dev));

    let value = run_governed(&client, &acquire("g1"), |grant| async move {
        assert!(grant.granted);
        Ok::<_, std::io::Error>(("answer", Usage { cost_cents: 4, output_tokens: 20, ..Usage::default() }))
    })
    .await
    .unwrap();

    assert_eq!(value, "answer");
    assert_eq!(running.governor.in_flight_count(), 0);
    assert_eq!(running.governor.ledger_snapshot().consumed_cents, 4);

    running.stop().await;
}

#[tokio::test]
async fn governed_call_releases_when_work_fails() {
    let running = start(POLICY).await;
    let client = Arc::new(client(&running.socket, FallbackMode::Dev));

    let result: Result<(), _> = run_governed(&client, &acquire("g1"), |_grant| async {
        Err::<((), Usage), _>(std::io::Error::other("provider timed out"))
    })
    .await;

    let error = result.unwrap_err();
    assert!(error.denial_reason().is_none());
    assert_eq!(error.into_work_error().unwrap().to_string(), "provider timed out");
    assert_eq!(running.governor.in_flight_count(), 0);

    let released = running
        .audit
        .events()
        .into_iter()
        .find(|event| event.decision == AuditDecision::Released)
        .unwrap();
    assert_eq!(released.outcome, Some(Outcome::Error));
    assert_eq!(released.actual_cost_cents, Some(0));

    running.stop().await;
}

#[tokio::test]
async fn denied_governed_call_never_runs_work() {
    let running = start(POLICY).await;
    let client = Arc::new(client(&running.socket, FallbackMode::Dev));

    let mut request = acquire("g1");
    request.model_id = "huge-model".into();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let result = run_governed(&client, &request, |_grant| async move {
        flag.store(true, Ordering::SeqCst);
        Ok::<((), Usage), std::io::Error>(((), Usage::default()))
    })
    .await;
    assert!(!ran.load(Ordering::SeqCst));

    match result {
        Err(GovernedCallError::Denied { reason, recommendation, .. }) => {
            assert_eq!(reason, DenialReason::ModelNotAllowed);
            assert!(recommendation.is_some());
        }
        other => panic!("unexpected result: {other:?}"),
    }

    running.stop().await;
}

#[tokio::test]
async fn dropped_governed_call_releases_as_unknown() {
    let running = start(POLICY).await;
    let client = Arc::new(client(&running.socket, FallbackMode::Dev));

    let call = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            run_governed(&client, &acquire("g1"), |_grant| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<((), Usage), std::io::Error>(((), Usage::default()))
            })
            .await
        })
    };

    for _ in 0..200 {
        if running.governor.in_flight_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(running.governor.in_flight_count(), 1);

    call.abort();
    let _ = call.await;

    for _ in 0..200 {
        if running.governor.in_flight_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(running.governor.in_flight_count(), 0);
    let released = running
        .audit
        .events()
        .into_iter()
        .find(|event| event.decision == AuditDecision::Released)
        .unwrap();
    assert_eq!(released.outcome, Some(Outcome::Unknown));

    running.stop().await;
}
