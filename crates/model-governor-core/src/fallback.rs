// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Local admission decisions for when the governor service is unreachable.
//!
//! A client that cannot reach the service must still answer Acquire.  The
//! [`FallbackPolicy`] decides locally, with no shared state and no budget
//! accounting, according to the configured [`FallbackMode`]:
//!
//! | Check                               | Dev  | Prod |
//! |-------------------------------------|------|------|
//! | risky capability requested          | deny | deny |
//! | action other than ChatCompletion    |  –   | deny |
//! | `maxOutputTokens` above mode cap    | deny | deny |
//!
//! Local grants carry a `local-` lease id so that a later Release can be
//! resolved without contacting the service.

use chrono::{DateTime, Duration, Utc};
use hashbrown::HashSet;
use uuid::Uuid;

use crate::config::{FallbackConfig, FallbackMode};
use crate::types::{AcquireLeaseRequest, AcquireLeaseResponse, ActionType, DenialReason};

/// Prefix of every lease id issued locally.
pub const LOCAL_LEASE_PREFIX: &str = "local-";

/// Whether `lease_id` was issued by a [`FallbackPolicy`].
pub fn is_local_lease(lease_id: &str) -> bool {
    lease_id.starts_with(LOCAL_LEASE_PREFIX)
}

/// Stateless local decision maker.
///
/// # Examples
///
/// ```rust
/// use model_governor_core::{
///     config::{FallbackConfig, FallbackMode},
///     fallback::{is_local_lease, FallbackPolicy},
///     types::{AcquireLeaseRequest, ActionType, DenialReason},
/// };
///
/// let policy = FallbackPolicy::new(FallbackConfig {
///     mode: FallbackMode::Prod,
///     ..FallbackConfig::default()
/// });
///
/// let mut request = AcquireLeaseRequest {
///     actor_id:                "agent-1".into(),
///     workspace_id:            "ws".into(),
///     action_type:             ActionType::ToolCall,
///     model_id:                "small-model".into(),
///     provider_id:             "provider".into(),
///     estimated_prompt_tokens: 10,
///     max_output_tokens:       64,
///     estimated_cost_cents:    1,
///     requested_capabilities:  vec![],
///     risk_flags:              vec![],
///     idempotency_key:         "k".into(),
/// };
/// let denied = policy.evaluate(&request, chrono::Utc::now());
/// assert_eq!(denied.denied_reason, Some(DenialReason::FallbackActionNotAllowed));
///
/// request.action_type = ActionType::ChatCompletion;
/// let granted = policy.evaluate(&request, chrono::Utc::now());
/// assert!(is_local_lease(granted.lease_id.as_deref().unwrap()));
/// ```
#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    mode: FallbackMode,
    risky: HashSet<String>,
    output_cap: u32,
    lease_ttl: Duration,
    lease_ttl_ms: u64,
}

impl FallbackPolicy {
    pub fn new(config: FallbackConfig) -> Self {
        let output_cap = match config.mode {
            FallbackMode::Dev => config.dev_max_output_tokens,
            FallbackMode::Prod => config.prod_max_output_tokens,
        };
        Self {
            mode: config.mode,
            risky: config.risky_capabilities.into_iter().collect(),
            output_cap,
            lease_ttl: Duration::milliseconds(i64::try_from(config.local_lease_ttl_ms).unwrap_or(i64::MAX)),
            lease_ttl_ms: config.local_lease_ttl_ms,
        }
    }

    pub fn mode(&self) -> FallbackMode {
        self.mode
    }

    pub fn output_cap(&self) -> u32 {
        self.output_cap
    }

    /// Decide `request` locally.
    pub fn evaluate(&self, request: &AcquireLeaseRequest, now: DateTime<Utc>) -> AcquireLeaseResponse {
        if let Some(capability) = request
            .requested_capabilities
            .iter()
            .find(|capability| self.risky.contains(capability.as_str()))
        {
            return self.deny(
                request,
                DenialReason::FallbackRiskyCapability,
                format!("Capability '{capability}' is not granted while the governor is unreachable; retry once it is back."),
            );
        }

        if self.mode == FallbackMode::Prod && request.action_type != ActionType::ChatCompletion {
            return self.deny(
                request,
                DenialReason::FallbackActionNotAllowed,
                format!(
                    "{} is not allowed while the governor is unreachable; only read-only ChatCompletion calls proceed.",
                    request.action_type
                ),
            );
        }

        if request.max_output_tokens > self.output_cap {
            return self.deny(
                request,
                DenialReason::FallbackOutputCapExceeded,
                format!(
                    "maxOutputTokens {} exceeds the {} fallback cap of {}; lower it to proceed.",
                    request.max_output_tokens, self.mode, self.output_cap
                ),
            );
        }

        let lease_id = format!("{LOCAL_LEASE_PREFIX}{}", Uuid::new_v4());
        AcquireLeaseResponse::granted(
            lease_id,
            now + self.lease_ttl,
            vec![
                format!("fallback:{}", self.mode),
                format!("ttlMs:{}", self.lease_ttl_ms),
                format!("maxOutputTokens:{}", self.output_cap),
            ],
            Some("Governor unreachable; granted locally without budget accounting.".into()),
            &request.idempotency_key,
        )
    }

    fn deny(&self, request: &AcquireLeaseRequest, reason: DenialReason, recommendation: String) -> AcquireLeaseResponse {
        AcquireLeaseResponse::denied(reason, Some(recommendation), None, &request.idempotency_key)
    }
}
