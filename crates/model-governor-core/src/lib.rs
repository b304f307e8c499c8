// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! # model-governor-core
//!
//! Lease-based admission control for AI model calls.
//!
//! Before an agent makes a model call it asks the governor for a **lease**.
//! The governor checks concurrency, the daily budget and the current policy,
//! then grants or denies.  When the call finishes the agent releases the lease
//! and reports what it actually cost.  Leases that are never released expire
//! and their reservation flows back to the budget.
//!
//! This crate holds everything that does not need an executor or a socket:
//! the data model, the policy engine, the governor state machine, the wire
//! envelopes and the local fallback policy.  The IPC server, the client and the
//! governed-call wrapper live in `model-governor-std`.
//!
//! ## Architecture
//!
//! ```text
//! LeaseGovernor
//!   ├── PolicyStore        - current PolicySnapshot, swapped whole on reload
//!   ├── BudgetLedger       - reserved + consumed cents for the UTC day
//!   ├── in-flight leases   - lease id → Lease, swept on expiry
//!   ├── IdempotencyCache×2 - replayed Acquire / Release responses
//!   └── AuditSink          - one event per decision, in decision order
//!
//! FallbackPolicy           - local Dev / Prod decisions, no shared state
//! protocol                 - JSON envelopes + frame size limit
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use model_governor_core::{
//!     audit::InMemoryAuditSink,
//!     config::GovernorConfig,
//!     governor::LeaseGovernor,
//!     policy::{PolicySnapshot, PolicyStore},
//!     types::{AcquireLeaseRequest, ActionType, DenialReason},
//! };
//!
//! let policy = PolicySnapshot::from_json(r#"{
//!     "maxInFlight": 4,
//!     "dailyBudgetCents": 10,
//!     "allowedModels": ["small-model"],
//!     "allowedCapabilities": { "ChatCompletion": ["read"] }
//! }"#).unwrap();
//!
//! let governor = LeaseGovernor::new(
//!     GovernorConfig::default(),
//!     Arc::new(PolicyStore::new(policy)),
//!     Arc::new(InMemoryAuditSink::new()),
//! );
//!
//! let request = AcquireLeaseRequest {
//!     actor_id:                "agent-001".into(),
//!     workspace_id:            "research".into(),
//!     action_type:             ActionType::ChatCompletion,
//!     model_id:                "small-model".into(),
//!     provider_id:             "provider".into(),
//!     estimated_prompt_tokens: 400,
//!     max_output_tokens:       200,
//!     estimated_cost_cents:    11,
//!     requested_capabilities:  vec!["read".into()],
//!     risk_flags:              vec![],
//!     idempotency_key:         "acq-001".into(),
//! };
//! let response = governor.acquire(&request).unwrap();
//! assert!(!response.granted);
//! assert_eq!(response.denied_reason, Some(DenialReason::DailyBudgetExceeded));
//! ```

pub mod audit;
pub mod budget;
pub mod clock;
pub mod config;
pub mod error;
pub mod fallback;
pub mod governor;
pub mod idempotency;
pub mod policy;
pub mod protocol;
pub mod types;

#[cfg(feature = "async")]
pub mod async_governor;

#[cfg(feature = "config-loader")]
pub mod config_loader;

// Re-export the most commonly used items at the crate root so consumers can
// write `use model_governor_core::LeaseGovernor;` instead of the fully
// qualified path.
pub use audit::{AuditDecision, AuditEvent, AuditSink};
pub use error::{ConfigError, GovernorError, PolicyError, ProtocolError};
pub use fallback::FallbackPolicy;
pub use governor::LeaseGovernor;
pub use policy::{PolicySnapshot, PolicyStore};
pub use types::{
    AcquireLeaseRequest, AcquireLeaseResponse, ActionType, Classification, DenialReason, Outcome,
    ReleaseLeaseRequest, ReleaseLeaseResponse,
};

#[cfg(feature = "async")]
pub use async_governor::AsyncLeaseGovernor;
