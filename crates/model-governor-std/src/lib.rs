// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! # model-governor-std
//!
//! Tokio runtime pieces for `model-governor-core`: the Unix-socket service,
//! the client with local fallback, the governed-call wrapper, the JSON-lines
//! audit file and policy hot reload.
//!
//! ## Architecture
//!
//! ```text
//! model-governord
//!   └── run_service
//!         ├── PolicyStore + PolicyWatcher   - hot reload by polling
//!         ├── JsonLinesAuditSink            - append-only audit file
//!         ├── AsyncLeaseGovernor (+sweeper) - shared decision state
//!         └── PipeServer                    - framed JSON over a Unix socket
//!
//! agent process
//!   └── run_governed ── GovernorClient ──socket──▶ PipeServer
//!                            └── FallbackPolicy when the socket is unreachable
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use model_governor_core::config::ClientConfig;
//! use model_governor_core::types::{AcquireLeaseRequest, ActionType};
//! use model_governor_std::{run_governed, GovernorClient, Usage};
//!
//! # async fn call_model(_prompt: &str) -> Result<String, std::io::Error> { Ok(String::new()) }
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Arc::new(GovernorClient::new(ClientConfig::default()));
//! let request = AcquireLeaseRequest {
//!     actor_id:                "agent-001".into(),
//!     workspace_id:            "research".into(),
//!     action_type:             ActionType::ChatCompletion,
//!     model_id:                "small-model".into(),
//!     provider_id:             "provider".into(),
//!     estimated_prompt_tokens: 400,
//!     max_output_tokens:       200,
//!     estimated_cost_cents:    3,
//!     requested_capabilities:  vec!["read".into()],
//!     risk_flags:              vec![],
//!     idempotency_key:         "call-001".into(),
//! };
//!
//! let answer = run_governed(&client, &request, |_grant| async {
//!     let text = call_model("hello").await?;
//!     Ok::<_, std::io::Error>((text, Usage { cost_cents: 2, ..Usage::default() }))
//! })
//! .await?;
//! # let _ = answer;
//! # Ok(())
//! # }
//! ```

pub mod audit_file;
pub mod channel;
pub mod client;
pub mod governed;
pub mod policy_watch;
pub mod server;
pub mod service;
pub mod transport;

pub use audit_file::JsonLinesAuditSink;
pub use client::GovernorClient;
pub use governed::{run_governed, GovernedCallError, LeaseGuard, Usage};
pub use policy_watch::PolicyWatcher;
pub use server::PipeServer;
pub use service::run_service;
