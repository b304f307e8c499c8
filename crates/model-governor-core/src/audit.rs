// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Audit trail of lease lifecycle decisions.
//!
//! Every grant, denial, expiry and release produces exactly one
//! [`AuditEvent`].  Events are handed to an [`AuditSink`] in decision order.
//! The trail is **append-only**: sinks never edit or remove events.
//!
//! This crate ships [`InMemoryAuditSink`] for tests and embedding, and
//! [`TracingAuditSink`] which emits each event as a structured log line.  The
//! JSON-lines file sink lives in `model-governor-std`.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{wire_time, ActionType, Outcome};

/// Kind of lifecycle decision recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditDecision {
    Granted,
    Denied,
    Expired,
    Released,
}

/// One immutable audit record; serialised as a single JSON line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    #[serde(with = "wire_time")]
    pub timestamp: DateTime<Utc>,
    pub decision: AuditDecision,
    pub actor_id: String,
    pub workspace_id: String,
    pub action_type: Option<ActionType>,
    pub model_id: Option<String>,
    pub lease_id: Option<String>,
    /// Denial code, `granted`, `ttl_elapsed`, or `lease_not_found`.
    pub reason: String,
    pub outcome: Option<Outcome>,
    pub estimated_cost_cents: u64,
    pub actual_cost_cents: Option<u64>,
    pub actual_prompt_tokens: Option<u32>,
    pub actual_output_tokens: Option<u32>,
    pub idempotency_key: String,
}

/// Destination for audit events.
///
/// `record` is called while the governor holds its state lock, so events
/// arrive in decision order.  Implementations must not block on I/O; hand the
/// event off (e.g. to a channel) instead.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

// ---------------------------------------------------------------------------
// InMemoryAuditSink
// ---------------------------------------------------------------------------

/// Volatile sink that keeps every event in a `Vec`.
///
/// # Examples
///
/// ```rust
/// use model_governor_core::audit::{AuditDecision, AuditEvent, AuditSink, InMemoryAuditSink};
///
/// let sink = InMemoryAuditSink::new();
/// sink.record(AuditEvent {
///     timestamp:            chrono::Utc::now(),
///     decision:             AuditDecision::Denied,
///     actor_id:             "agent-1".into(),
///     workspace_id:         "ws".into(),
///     action_type:          None,
///     model_id:             None,
///     lease_id:             None,
///     reason:               "model_not_allowed".into(),
///     outcome:              None,
///     estimated_cost_cents: 5,
///     actual_cost_cents:    None,
///     actual_prompt_tokens: None,
///     actual_output_tokens: None,
///     idempotency_key:      "k".into(),
/// });
/// assert_eq!(sink.count(AuditDecision::Denied), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event recorded so far, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of events with the given decision.
    pub fn count(&self, decision: AuditDecision) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|event| event.decision == decision)
            .count()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

// ---------------------------------------------------------------------------
// TracingAuditSink
// ---------------------------------------------------------------------------

/// Sink that writes each event to the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        info!(
            target: "audit",
            decision = ?event.decision,
            actor = %event.actor_id,
            workspace = %event.workspace_id,
            lease = event.lease_id.as_deref().unwrap_or("-"),
            reason = %event.reason,
            estimated_cents = event.estimated_cost_cents,
            actual_cents = event.actual_cost_cents,
            "lease decision"
        );
    }
}
