// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Shared data types used by the governor, the wire protocol and the client.
//!
//! Wire types derive [`serde::Serialize`] / [`serde::Deserialize`] with
//! `camelCase` keys.  Field declaration order **is** the wire key order, so
//! fields must never be reordered: two implementations that serialise the same
//! values must produce byte-identical JSON.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Closed set of model-call kinds.
///
/// Used both to look up the allowed capabilities in a policy snapshot and to
/// restrict what the client may grant in Prod fallback mode.
///
/// # Examples
///
/// ```rust
/// use model_governor_core::types::ActionType;
///
/// let action: ActionType = "ToolCall".parse().unwrap();
/// assert_eq!(action, ActionType::ToolCall);
/// assert_eq!(ActionType::ChatCompletion.as_str(), "ChatCompletion");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    /// A read-only chat / text completion.
    ChatCompletion,
    /// A call in which the model may invoke tools.
    ToolCall,
    /// An embedding request.
    Embedding,
}

impl ActionType {
    /// Every variant, in declaration order.
    pub const ALL: [ActionType; 3] = [
        ActionType::ChatCompletion,
        ActionType::ToolCall,
        ActionType::Embedding,
    ];

    /// Stable wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::ChatCompletion => "ChatCompletion",
            ActionType::ToolCall       => "ToolCall",
            ActionType::Embedding      => "Embedding",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ActionType::ALL
            .into_iter()
            .find(|action| action.as_str() == value)
            .ok_or_else(|| format!("unknown action type '{value}'"))
    }
}

/// How the governed work finished, as reported on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Error,
    Unknown,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("Success"),
            Outcome::Error   => f.write_str("Error"),
            Outcome::Unknown => f.write_str("Unknown"),
        }
    }
}

/// Result classification of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    /// The lease was in flight and its usage has been posted.
    Recorded,
    /// No in-flight lease matched: never existed, already released, or expired.
    LeaseNotFound,
}

/// Reason code carried by a denied acquire.
///
/// The first five codes come from the governor; the rest are produced by the
/// client when it decides locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    ConcurrencyLimitReached,
    DailyBudgetExceeded,
    ModelNotAllowed,
    CapabilityNotAllowed,
    RiskRequiresApproval,
    FallbackRiskyCapability,
    FallbackOutputCapExceeded,
    FallbackActionNotAllowed,
    GovernorError,
    Cancelled,
}

impl DenialReason {
    /// Stable snake_case reason code.
    pub fn as_str(self) -> &'static str {
        match self {
            DenialReason::ConcurrencyLimitReached   => "concurrency_limit_reached",
            DenialReason::DailyBudgetExceeded       => "daily_budget_exceeded",
            DenialReason::ModelNotAllowed           => "model_not_allowed",
            DenialReason::CapabilityNotAllowed      => "capability_not_allowed",
            DenialReason::RiskRequiresApproval      => "risk_requires_approval",
            DenialReason::FallbackRiskyCapability   => "fallback_risky_capability",
            DenialReason::FallbackOutputCapExceeded => "fallback_output_cap_exceeded",
            DenialReason::FallbackActionNotAllowed  => "fallback_action_not_allowed",
            DenialReason::GovernorError             => "governor_error",
            DenialReason::Cancelled                 => "cancelled",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Acquire
// ---------------------------------------------------------------------------

/// Request to reserve a concurrency slot and budget for one model call.
///
/// # Examples
///
/// ```rust
/// use model_governor_core::types::{AcquireLeaseRequest, ActionType};
///
/// let request = AcquireLeaseRequest {
///     actor_id:                "agent-7".into(),
///     workspace_id:            "ws-1".into(),
///     action_type:             ActionType::ChatCompletion,
///     model_id:                "small-model".into(),
///     provider_id:             "provider-a".into(),
///     estimated_prompt_tokens: 100,
///     max_output_tokens:       200,
///     estimated_cost_cents:    3,
///     requested_capabilities:  vec![],
///     risk_flags:              vec![],
///     idempotency_key:         "k1".into(),
/// };
/// let json = serde_json::to_string(&request).unwrap();
/// assert!(json.starts_with(r#"{"actorId":"agent-7","workspaceId":"ws-1""#));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireLeaseRequest {
    pub actor_id: String,
    pub workspace_id: String,
    pub action_type: ActionType,
    pub model_id: String,
    pub provider_id: String,
    pub estimated_prompt_tokens: u32,
    pub max_output_tokens: u32,
    pub estimated_cost_cents: u64,
    pub requested_capabilities: Vec<String>,
    pub risk_flags: Vec<String>,
    pub idempotency_key: String,
}

/// Answer to an [`AcquireLeaseRequest`].
///
/// Optional fields serialise as `null` rather than being omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireLeaseResponse {
    pub granted: bool,
    pub lease_id: Option<String>,
    #[serde(with = "wire_time::option")]
    pub expires_at_utc: Option<DateTime<Utc>>,
    pub constraints: Vec<String>,
    pub denied_reason: Option<DenialReason>,
    pub recommendation: Option<String>,
    pub retry_after_ms: Option<u64>,
    pub idempotency_key: String,
}

impl AcquireLeaseResponse {
    /// Build a granted response.
    pub fn granted(
        lease_id: String,
        expires_at: DateTime<Utc>,
        constraints: Vec<String>,
        recommendation: Option<String>,
        idempotency_key: &str,
    ) -> Self {
        Self {
            granted: true,
            lease_id: Some(lease_id),
            expires_at_utc: Some(expires_at),
            constraints,
            denied_reason: None,
            recommendation,
            retry_after_ms: None,
            idempotency_key: idempotency_key.into(),
        }
    }

    /// Build a denied response.
    pub fn denied(
        reason: DenialReason,
        recommendation: Option<String>,
        retry_after_ms: Option<u64>,
        idempotency_key: &str,
    ) -> Self {
        Self {
            granted: false,
            lease_id: None,
            expires_at_utc: None,
            constraints: Vec::new(),
            denied_reason: Some(reason),
            recommendation,
            retry_after_ms,
            idempotency_key: idempotency_key.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Release
// ---------------------------------------------------------------------------

/// Request to return a lease and report the call's actual usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseLeaseRequest {
    pub lease_id: String,
    pub actual_prompt_tokens: u32,
    pub actual_output_tokens: u32,
    pub actual_cost_cents: u64,
    pub tool_calls_count: u32,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub outcome: Outcome,
    pub idempotency_key: String,
}

impl ReleaseLeaseRequest {
    /// A release reporting an error outcome with all usage counters zeroed.
    pub fn failed(lease_id: &str, idempotency_key: &str) -> Self {
        Self::zeroed(lease_id, Outcome::Error, idempotency_key)
    }

    /// A release with the given outcome and all usage counters zeroed.
    pub fn zeroed(lease_id: &str, outcome: Outcome, idempotency_key: &str) -> Self {
        Self {
            lease_id: lease_id.into(),
            actual_prompt_tokens: 0,
            actual_output_tokens: 0,
            actual_cost_cents: 0,
            tool_calls_count: 0,
            bytes_in: 0,
            bytes_out: 0,
            outcome,
            idempotency_key: idempotency_key.into(),
        }
    }
}

/// Answer to a [`ReleaseLeaseRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseLeaseResponse {
    pub classification: Classification,
    pub recommendation: Option<String>,
    pub idempotency_key: String,
}

impl ReleaseLeaseResponse {
    pub fn recorded(idempotency_key: &str) -> Self {
        Self {
            classification: Classification::Recorded,
            recommendation: None,
            idempotency_key: idempotency_key.into(),
        }
    }

    pub fn not_found(recommendation: Option<String>, idempotency_key: &str) -> Self {
        Self {
            classification: Classification::LeaseNotFound,
            recommendation,
            idempotency_key: idempotency_key.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// A time-bounded admission grant held in the governor's in-flight table.
///
/// Leases are created by a grant and only ever removed (released or expired);
/// they are never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub lease_id: String,
    pub actor_id: String,
    pub workspace_id: String,
    pub action_type: ActionType,
    pub model_id: String,
    pub reserved_cents: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub idempotency_key: String,
}

impl Lease {
    /// A lease is expired once `now` has reached its expiry time.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ---------------------------------------------------------------------------
// Wire timestamps
// ---------------------------------------------------------------------------

/// RFC 3339 UTC timestamps with exactly millisecond precision and a `Z`
/// suffix, e.g. `2026-01-01T00:00:00.300Z`.
pub mod wire_time {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Render `timestamp` in the wire format.
    pub fn format(timestamp: &DateTime<Utc>) -> String {
        timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Parse any RFC 3339 timestamp into UTC.
    pub fn parse(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(raw).map(|parsed| parsed.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    /// Same format for `Option<DateTime<Utc>>`; `None` is `null`.
    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(timestamp) => serializer.serialize_str(&super::format(timestamp)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => super::parse(&raw).map(Some).map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn action_type_parses_every_wire_name() {
        for action in ActionType::ALL {
            assert_eq!(action.as_str().parse::<ActionType>(), Ok(action));
        }
        assert!("chat-completion".parse::<ActionType>().is_err());
    }

    #[test]
    fn denial_reason_serialises_as_snake_case_code() {
        let json = serde_json::to_string(&DenialReason::DailyBudgetExceeded).unwrap();
        assert_eq!(json, r#""daily_budget_exceeded""#);
        assert_eq!(DenialReason::FallbackOutputCapExceeded.as_str(), "fallback_output_cap_exceeded");
    }

    #[test]
    fn denied_response_keeps_null_fields_on_the_wire() {
        let response = AcquireLeaseResponse::denied(
            DenialReason::ModelNotAllowed,
            None,
            None,
            "k9",
        );
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(
            json,
            r#"{"granted":false,"leaseId":null,"expiresAtUtc":null,"constraints":[],"deniedReason":"model_not_allowed","recommendation":null,"retryAfterMs":null,"idempotencyKey":"k9"}"#
        );
    }

    #[test]
    fn granted_response_uses_millisecond_timestamps() {
        let expires = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
            + chrono::Duration::milliseconds(300);
        let response = AcquireLeaseResponse::granted(
            "lease-1".into(),
            expires,
            vec!["ttlMs:300".into()],
            None,
            "k1",
        );
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""expiresAtUtc":"2026-03-01T12:00:00.300Z""#));

        let parsed: AcquireLeaseResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, response);
    }

    #[test]
    fn lease_expires_at_its_deadline() {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let lease = Lease {
            lease_id: "lease-1".into(),
            actor_id: "a".into(),
            workspace_id: "w".into(),
            action_type: ActionType::ChatCompletion,
            model_id: "m".into(),
            reserved_cents: 5,
            created_at: created,
            expires_at: created + chrono::Duration::seconds(1),
            idempotency_key: "k".into(),
        };
        assert!(!lease.is_expired(created));
        assert!(lease.is_expired(created + chrono::Duration::seconds(1)));
    }
}
