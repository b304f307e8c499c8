// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Lease governor: the admission state machine.
//!
//! [`LeaseGovernor`] owns the in-flight lease table, the budget ledger and
//! both idempotency caches inside **one** mutex.  Each Acquire or Release runs
//! its read-check-write sequence as a single critical section, so the
//! in-flight count, the ledger and the caches can never disagree with each
//! other, however many connections call concurrently.  Decisions are pure
//! in-memory work; the only side effect under the lock is handing audit
//! events to the [`AuditSink`], which preserves their order.
//!
//! ## Acquire order
//!
//! 1. **Replay**: a known idempotency key returns its stored response.
//! 2. **Sweep**: expired leases are removed and their reservations returned.
//! 3. **Concurrency**: deny when the in-flight count is at `maxInFlight`.
//! 4. **Budget**: deny when reserved + consumed + estimate > daily budget.
//! 5. **Model**: deny when the model is not allowed.
//! 6. **Capability**: deny when any capability is not allowed for the action.
//! 7. **Risk**: deny when any risk flag requires approval.
//! 8. **Grant**: reserve, insert the lease, audit, store, return.
//!
//! Denials are stored under the idempotency key exactly like grants.
//!
//! ## Release
//!
//! A release removes the lease and posts the *actual* cost in place of the
//! reservation.  A lease that is unknown, already released or already expired
//! yields [`Classification::LeaseNotFound`]; this is an expected outcome for a
//! caller whose lease outlived its TTL, not a fault.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::{AuditDecision, AuditEvent, AuditSink};
use crate::budget::{BudgetLedger, LedgerSnapshot};
use crate::clock::{Clock, SystemClock};
use crate::config::GovernorConfig;
use crate::error::GovernorError;
use crate::idempotency::IdempotencyCache;
use crate::policy::{PolicySnapshot, PolicyStore};
use crate::types::{
    AcquireLeaseRequest, AcquireLeaseResponse, DenialReason, Lease, ReleaseLeaseRequest,
    ReleaseLeaseResponse,
};

/// Prefix of every lease id issued by the governor.
pub const LEASE_ID_PREFIX: &str = "lease-";

/// Admission governor shared by every connection.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use model_governor_core::{
///     audit::InMemoryAuditSink,
///     config::GovernorConfig,
///     governor::LeaseGovernor,
///     policy::{PolicySnapshot, PolicyStore},
///     types::{AcquireLeaseRequest, ActionType, Classification, Outcome, ReleaseLeaseRequest},
/// };
///
/// let policy = PolicySnapshot::from_json(
///     r#"{"maxInFlight":1,"dailyBudgetCents":100,"allowedModels":["small-model"]}"#,
/// ).unwrap();
/// let governor = LeaseGovernor::new(
///     GovernorConfig::default(),
///     Arc::new(PolicyStore::new(policy)),
///     Arc::new(InMemoryAuditSink::new()),
/// );
///
/// let request = AcquireLeaseRequest {
///     actor_id:                "agent-1".into(),
///     workspace_id:            "ws".into(),
///     action_type:             ActionType::ChatCompletion,
///     model_id:                "small-model".into(),
///     provider_id:             "provider".into(),
///     estimated_prompt_tokens: 50,
///     max_output_tokens:       100,
///     estimated_cost_cents:    10,
///     requested_capabilities:  vec![],
///     risk_flags:              vec![],
///     idempotency_key:         "acq-1".into(),
/// };
/// let grant = governor.acquire(&request).unwrap();
/// assert!(grant.granted);
///
/// let mut release = ReleaseLeaseRequest::zeroed(grant.lease_id.as_deref().unwrap(), Outcome::Success, "rel-1");
/// release.actual_cost_cents = 8;
/// let released = governor.release(&release).unwrap();
/// assert_eq!(released.classification, Classification::Recorded);
/// assert_eq!(governor.ledger_snapshot().consumed_cents, 8);
/// ```
pub struct LeaseGovernor {
    config: GovernorConfig,
    policy: Arc<PolicyStore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    state: Mutex<GovernorState>,
}

/// Everything guarded by the governor lock.
struct GovernorState {
    in_flight: HashMap<String, Lease>,
    ledger: BudgetLedger,
    acquire_replies: IdempotencyCache<AcquireLeaseResponse>,
    release_replies: IdempotencyCache<ReleaseLeaseResponse>,
}

/// Why an acquire was refused, before it becomes a response.
struct Denial {
    reason: DenialReason,
    recommendation: Option<String>,
    retry_after_ms: Option<u64>,
}

impl Denial {
    fn new(reason: DenialReason, recommendation: String) -> Self {
        Self {
            reason,
            recommendation: Some(recommendation),
            retry_after_ms: None,
        }
    }

    fn retry_after(mut self, millis: u64) -> Self {
        self.retry_after_ms = Some(millis);
        self
    }
}

impl LeaseGovernor {
    /// Construct a governor on the system clock.
    pub fn new(config: GovernorConfig, policy: Arc<PolicyStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self::with_clock(config, policy, audit, Arc::new(SystemClock))
    }

    /// Construct a governor on an explicit clock.
    pub fn with_clock(
        config: GovernorConfig,
        policy: Arc<PolicyStore>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = GovernorState {
            in_flight: HashMap::new(),
            ledger: BudgetLedger::new(clock.now()),
            acquire_replies: IdempotencyCache::new(config.idempotency_capacity),
            release_replies: IdempotencyCache::new(config.idempotency_capacity),
        };
        Self {
            config,
            policy,
            audit,
            clock,
            state: Mutex::new(state),
        }
    }

    // -----------------------------------------------------------------------
    // Acquire
    // -----------------------------------------------------------------------

    /// Decide whether `request` may proceed.
    ///
    /// Returns `Err` only for a malformed request; every admission outcome,
    /// grant or denial, is an `Ok` response.
    pub fn acquire(&self, request: &AcquireLeaseRequest) -> Result<AcquireLeaseResponse, GovernorError> {
        validate_acquire(request)?;

        let mut state = self.lock_state();
        if let Some(previous) = state.acquire_replies.get(&request.idempotency_key) {
            debug!(key = %request.idempotency_key, "acquire replayed from idempotency cache");
            return Ok(previous.clone());
        }

        let now = self.clock.now();
        state.ledger.roll_over(now);
        self.sweep_locked(&mut state, now);

        let policy = self.policy.current();
        let response = match evaluate(&state, &policy, request, now) {
            Err(denial) => {
                info!(
                    actor = %request.actor_id,
                    reason = %denial.reason,
                    cost_cents = request.estimated_cost_cents,
                    "lease denied"
                );
                self.audit.record(acquire_event(request, now, AuditDecision::Denied, denial.reason.as_str(), None));
                AcquireLeaseResponse::denied(
                    denial.reason,
                    denial.recommendation,
                    denial.retry_after_ms,
                    &request.idempotency_key,
                )
            }
            Ok(()) => self.grant(&mut state, &policy, request, now),
        };

        state.acquire_replies.insert(&request.idempotency_key, response.clone());
        Ok(response)
    }

    fn grant(
        &self,
        state: &mut GovernorState,
        policy: &PolicySnapshot,
        request: &AcquireLeaseRequest,
        now: DateTime<Utc>,
    ) -> AcquireLeaseResponse {
        let lease_id = format!("{LEASE_ID_PREFIX}{}", Uuid::new_v4());
        let expires_at = now + self.config.lease_ttl();

        state.ledger.reserve(request.estimated_cost_cents);
        state.in_flight.insert(
            lease_id.clone(),
            Lease {
                lease_id: lease_id.clone(),
                actor_id: request.actor_id.clone(),
                workspace_id: request.workspace_id.clone(),
                action_type: request.action_type,
                model_id: request.model_id.clone(),
                reserved_cents: request.estimated_cost_cents,
                created_at: now,
                expires_at,
                idempotency_key: request.idempotency_key.clone(),
            },
        );

        let remaining = state.ledger.remaining(policy.daily_budget_cents);
        let constraints = vec![
            format!("ttlMs:{}", self.config.lease_ttl_ms),
            format!("budgetRemainingCents:{remaining}"),
        ];
        let recommendation = is_low_budget(remaining, policy.daily_budget_cents, self.config.low_budget_percent)
            .then(|| {
                format!(
                    "Less than {}% of today's budget remains ({remaining} cents); prefer cheaper models for subsequent calls.",
                    self.config.low_budget_percent
                )
            });

        info!(
            lease_id = %lease_id,
            actor = %request.actor_id,
            model = %request.model_id,
            cost_cents = request.estimated_cost_cents,
            in_flight = state.in_flight.len(),
            "lease granted"
        );
        self.audit.record(acquire_event(request, now, AuditDecision::Granted, "granted", Some(&lease_id)));

        AcquireLeaseResponse::granted(lease_id, expires_at, constraints, recommendation, &request.idempotency_key)
    }

    // -----------------------------------------------------------------------
    // Release
    // -----------------------------------------------------------------------

    /// Return a lease and post its actual usage.
    pub fn release(&self, request: &ReleaseLeaseRequest) -> Result<ReleaseLeaseResponse, GovernorError> {
        validate_release(request)?;

        let mut state = self.lock_state();
        if let Some(previous) = state.release_replies.get(&request.idempotency_key) {
            debug!(key = %request.idempotency_key, "release replayed from idempotency cache");
            return Ok(previous.clone());
        }

        let now = self.clock.now();
        state.ledger.roll_over(now);
        // An elapsed lease must read as not found even if no acquire swept it yet.
        self.sweep_locked(&mut state, now);

        let response = match state.in_flight.remove(&request.lease_id) {
            Some(lease) => {
                state.ledger.settle(lease.reserved_cents, request.actual_cost_cents);
                info!(
                    lease_id = %lease.lease_id,
                    outcome = %request.outcome,
                    reserved_cents = lease.reserved_cents,
                    actual_cents = request.actual_cost_cents,
                    "lease released"
                );
                self.audit.record(release_event(Some(&lease), request, now, &request.outcome.to_string()));
                ReleaseLeaseResponse::recorded(&request.idempotency_key)
            }
            None => {
                debug!(lease_id = %request.lease_id, "release for lease that is not in flight");
                self.audit.record(release_event(None, request, now, "lease_not_found"));
                ReleaseLeaseResponse::not_found(
                    Some("Lease is not in flight (never granted, already released, or expired); no further action is needed.".into()),
                    &request.idempotency_key,
                )
            }
        };

        state.release_replies.insert(&request.idempotency_key, response.clone());
        Ok(response)
    }

    // -----------------------------------------------------------------------
    // Expiry
    // -----------------------------------------------------------------------

    /// Reclaim every lease whose TTL has elapsed.  Returns how many were
    /// reclaimed.
    ///
    /// Acquire and Release already do this lazily; a background sweeper may
    /// call it on a timer as well.
    pub fn sweep_expired(&self) -> usize {
        let mut state = self.lock_state();
        let now = self.clock.now();
        self.sweep_locked(&mut state, now)
    }

    fn sweep_locked(&self, state: &mut GovernorState, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = state
            .in_flight
            .values()
            .filter(|lease| lease.is_expired(now))
            .map(|lease| lease.lease_id.clone())
            .collect();

        for lease_id in &expired {
            let Some(lease) = state.in_flight.remove(lease_id) else {
                continue;
            };
            state.ledger.release_reservation(lease.reserved_cents);
            info!(lease_id = %lease.lease_id, actor = %lease.actor_id, "lease expired");
            self.audit.record(AuditEvent {
                timestamp: now,
                decision: AuditDecision::Expired,
                actor_id: lease.actor_id,
                workspace_id: lease.workspace_id,
                action_type: Some(lease.action_type),
                model_id: Some(lease.model_id),
                lease_id: Some(lease.lease_id),
                reason: "ttl_elapsed".into(),
                outcome: None,
                estimated_cost_cents: lease.reserved_cents,
                actual_cost_cents: None,
                actual_prompt_tokens: None,
                actual_output_tokens: None,
                idempotency_key: lease.idempotency_key,
            });
        }
        expired.len()
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Leases currently in flight (expired-but-unswept ones included).
    pub fn in_flight_count(&self) -> usize {
        self.lock_state().in_flight.len()
    }

    pub fn ledger_snapshot(&self) -> LedgerSnapshot {
        self.lock_state().ledger.snapshot()
    }

    /// The policy snapshot decisions are currently made against.
    pub fn policy(&self) -> Arc<PolicySnapshot> {
        self.policy.current()
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, GovernorState> {
        // Decisions never panic half-way through a mutation, so a poisoned
        // lock still guards consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Decision helpers
// ---------------------------------------------------------------------------

/// Run checks 3–7 against the swept state.
fn evaluate(
    state: &GovernorState,
    policy: &PolicySnapshot,
    request: &AcquireLeaseRequest,
    now: DateTime<Utc>,
) -> Result<(), Denial> {
    let in_flight = state.in_flight.len();
    if in_flight >= policy.max_in_flight as usize {
        let soonest = state.in_flight.values().map(|lease| lease.expires_at).min();
        let mut denial = Denial::new(
            DenialReason::ConcurrencyLimitReached,
            format!(
                "{in_flight} of {} concurrent leases are in use; retry after one is released.",
                policy.max_in_flight
            ),
        );
        if let Some(soonest) = soonest {
            denial = denial.retry_after(millis_until(now, soonest));
        }
        return Err(denial);
    }

    if !state.ledger.can_reserve(request.estimated_cost_cents, policy.daily_budget_cents) {
        let remaining = state.ledger.remaining(policy.daily_budget_cents);
        return Err(Denial::new(
            DenialReason::DailyBudgetExceeded,
            format!(
                "Estimated cost of {} cents exceeds the {remaining} cents left in today's budget; switch to a cheaper model or lower maxOutputTokens.",
                request.estimated_cost_cents
            ),
        )
        .retry_after(millis_until(now, state.ledger.next_rollover())));
    }

    if !policy.is_model_allowed(&request.model_id) {
        let mut allowed: Vec<&str> = policy.allowed_models.iter().map(String::as_str).collect();
        allowed.sort_unstable();
        return Err(Denial::new(
            DenialReason::ModelNotAllowed,
            format!(
                "Model '{}' is not allowed; switch to one of: {}.",
                request.model_id,
                allowed.join(", ")
            ),
        ));
    }

    if let Some(capability) = request
        .requested_capabilities
        .iter()
        .find(|capability| !policy.is_capability_allowed(request.action_type, capability))
    {
        return Err(Denial::new(
            DenialReason::CapabilityNotAllowed,
            format!(
                "Capability '{capability}' is not allowed for {}; drop it from the request.",
                request.action_type
            ),
        ));
    }

    if let Some(flag) = request.risk_flags.iter().find(|flag| policy.requires_approval(flag)) {
        return Err(Denial::new(
            DenialReason::RiskRequiresApproval,
            format!("Risk flag '{flag}' requires manual approval before this call can run."),
        ));
    }

    Ok(())
}

fn is_low_budget(remaining: u64, limit: u64, percent: u8) -> bool {
    limit > 0 && u128::from(remaining) * 100 < u128::from(limit) * u128::from(percent)
}

fn millis_until(now: DateTime<Utc>, then: DateTime<Utc>) -> u64 {
    u64::try_from((then - now).num_milliseconds()).unwrap_or(0)
}

fn validate_acquire(request: &AcquireLeaseRequest) -> Result<(), GovernorError> {
    require("actorId", &request.actor_id)?;
    require("workspaceId", &request.workspace_id)?;
    require("modelId", &request.model_id)?;
    require("idempotencyKey", &request.idempotency_key)
}

fn validate_release(request: &ReleaseLeaseRequest) -> Result<(), GovernorError> {
    require("leaseId", &request.lease_id)?;
    require("idempotencyKey", &request.idempotency_key)
}

fn require(field: &'static str, value: &str) -> Result<(), GovernorError> {
    if value.trim().is_empty() {
        return Err(GovernorError::InvalidRequest { field });
    }
    Ok(())
}

fn acquire_event(
    request: &AcquireLeaseRequest,
    now: DateTime<Utc>,
    decision: AuditDecision,
    reason: &str,
    lease_id: Option<&str>,
) -> AuditEvent {
    AuditEvent {
        timestamp: now,
        decision,
        actor_id: request.actor_id.clone(),
        workspace_id: request.workspace_id.clone(),
        action_type: Some(request.action_type),
        model_id: Some(request.model_id.clone()),
        lease_id: lease_id.map(str::to_owned),
        reason: reason.into(),
        outcome: None,
        estimated_cost_cents: request.estimated_cost_cents,
        actual_cost_cents: None,
        actual_prompt_tokens: None,
        actual_output_tokens: None,
        idempotency_key: request.idempotency_key.clone(),
    }
}

fn release_event(
    lease: Option<&Lease>,
    request: &ReleaseLeaseRequest,
    now: DateTime<Utc>,
    reason: &str,
) -> AuditEvent {
    AuditEvent {
        timestamp: now,
        decision: AuditDecision::Released,
        actor_id: lease.map(|lease| lease.actor_id.clone()).unwrap_or_default(),
        workspace_id: lease.map(|lease| lease.workspace_id.clone()).unwrap_or_default(),
        action_type: lease.map(|lease| lease.action_type),
        model_id: lease.map(|lease| lease.model_id.clone()),
        lease_id: Some(request.lease_id.clone()),
        reason: reason.into(),
        outcome: Some(request.outcome),
        estimated_cost_cents: lease.map_or(0, |lease| lease.reserved_cents),
        actual_cost_cents: Some(request.actual_cost_cents),
        actual_prompt_tokens: Some(request.actual_prompt_tokens),
        actual_output_tokens: Some(request.actual_output_tokens),
        idempotency_key: request.idempotency_key.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::clock::ManualClock;
    use crate::types::{ActionType, Classification, Outcome};
    use chrono::{Duration, TimeZone};

    struct Harness {
        governor: LeaseGovernor,
        clock: Arc<ManualClock>,
        audit: Arc<InMemoryAuditSink>,
        policy: Arc<PolicyStore>,
    }

    fn harness(policy_json: &str, ttl_ms: u64) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap()));
        let audit = Arc::new(InMemoryAuditSink::new());
        let policy = Arc::new(PolicyStore::new(PolicySnapshot::from_json(policy_json).unwrap()));
        let config = GovernorConfig {
            lease_ttl_ms: ttl_ms,
            ..GovernorConfig::default()
        };
        let governor = LeaseGovernor::with_clock(config, policy.clone(), audit.clone(), clock.clone());
        Harness { governor, clock, audit, policy }
    }

    fn policy(max_in_flight: u32, budget: u64) -> String {
        format!(
            r#"{{"maxInFlight":{max_in_flight},"dailyBudgetCents":{budget},
                "allowedModels":["small-model","large-model"],
                "allowedCapabilities":{{"ChatCompletion":["read"],"ToolCall":["read","search"]}},
                "riskRequiresApproval":["pii"]}}"#
        )
    }

    fn acquire(key: &str, cost: u64) -> AcquireLeaseRequest {
        AcquireLeaseRequest {
            actor_id: "agent-1".into(),
            workspace_id: "ws-1".into(),
            action_type: ActionType::ChatCompletion,
            model_id: "small-model".into(),
            provider_id: "provider-a".into(),
            estimated_prompt_tokens: 100,
            max_output_tokens: 200,
            estimated_cost_cents: cost,
            requested_capabilities: vec![],
            risk_flags: vec![],
            idempotency_key: key.into(),
        }
    }

    fn release(lease_id: &str, key: &str, actual: u64) -> ReleaseLeaseRequest {
        let mut request = ReleaseLeaseRequest::zeroed(lease_id, Outcome::Success, key);
        request.actual_cost_cents = actual;
        request.actual_prompt_tokens = 90;
        request.actual_output_tokens = 150;
        request
    }

    #[test]
    fn second_acquire_is_denied_at_concurrency_limit() {
        let h = harness(&policy(1, 1_000), 30_000);

        let first = h.governor.acquire(&acquire("k1", 10)).unwrap();
        assert!(first.granted);
        assert!(first.lease_id.as_deref().unwrap().starts_with(LEASE_ID_PREFIX));

        let second = h.governor.acquire(&acquire("k2", 10)).unwrap();
        assert!(!second.granted);
        assert_eq!(second.denied_reason, Some(DenialReason::ConcurrencyLimitReached));
        assert_eq!(second.retry_after_ms, Some(30_000));
        assert_eq!(h.governor.in_flight_count(), 1);
    }

    #[test]
    fn over_budget_request_recommends_switching_models() {
        let h = harness(&policy(4, 10), 30_000);

        let response = h.governor.acquire(&acquire("k1", 11)).unwrap();
        assert!(!response.granted);
        assert_eq!(response.denied_reason, Some(DenialReason::DailyBudgetExceeded));
        assert!(response.recommendation.unwrap().contains("cheaper model"));
        // 10:00 → next UTC midnight.
        assert_eq!(response.retry_after_ms, Some(14 * 60 * 60 * 1000));
        assert_eq!(h.governor.ledger_snapshot().reserved_cents, 0);
    }

    #[test]
    fn reservation_exactly_filling_the_budget_is_admitted() {
        let h = harness(&policy(4, 10), 30_000);
        let response = h.governor.acquire(&acquire("k1", 10)).unwrap();
        assert!(response.granted);
        assert!(response.constraints.contains(&"budgetRemainingCents:0".to_string()));
        assert!(response.recommendation.is_some());

        let next = h.governor.acquire(&acquire("k2", 1)).unwrap();
        assert_eq!(next.denied_reason, Some(DenialReason::DailyBudgetExceeded));
    }

    #[test]
    fn denial_checks_run_in_order() {
        let h = harness(&policy(4, 1_000), 30_000);

        let mut request = acquire("model", 1);
        request.model_id = "huge-model".into();
        request.requested_capabilities = vec!["exec".into()];
        let response = h.governor.acquire(&request).unwrap();
        assert_eq!(response.denied_reason, Some(DenialReason::ModelNotAllowed));
        assert!(response.recommendation.unwrap().contains("large-model, small-model"));

        let mut request = acquire("capability", 1);
        request.requested_capabilities = vec!["read".into(), "search".into()];
        request.risk_flags = vec!["pii".into()];
        let response = h.governor.acquire(&request).unwrap();
        assert_eq!(response.denied_reason, Some(DenialReason::CapabilityNotAllowed));

        let mut request = acquire("tool", 1);
        request.action_type = ActionType::ToolCall;
        request.requested_capabilities = vec!["search".into()];
        request.risk_flags = vec!["low".into(), "pii".into()];
        let response = h.governor.acquire(&request).unwrap();
        assert_eq!(response.denied_reason, Some(DenialReason::RiskRequiresApproval));

        assert_eq!(h.audit.count(AuditDecision::Denied), 3);
        assert_eq!(h.governor.in_flight_count(), 0);
    }

    #[test]
    fn replayed_acquire_returns_original_without_new_reservation() {
        let h = harness(&policy(4, 1_000), 30_000);

        let first = h.governor.acquire(&acquire("k1", 25)).unwrap();
        let replay = h.governor.acquire(&acquire("k1", 25)).unwrap();

        assert_eq!(first, replay);
        assert_eq!(h.governor.in_flight_count(), 1);
        assert_eq!(h.governor.ledger_snapshot().reserved_cents, 25);
        assert_eq!(h.audit.count(AuditDecision::Granted), 1);
    }

    #[test]
    fn replayed_denial_is_not_reevaluated() {
        let h = harness(&policy(1, 1_000), 30_000);
        let held = h.governor.acquire(&acquire("held", 1)).unwrap();
        let denied = h.governor.acquire(&acquire("k2", 1)).unwrap();
        assert!(!denied.granted);

        h.governor
            .release(&release(held.lease_id.as_deref().unwrap(), "r-held", 1))
            .unwrap();

        // Capacity is free again, but the key already has an answer.
        let replay = h.governor.acquire(&acquire("k2", 1)).unwrap();
        assert_eq!(replay, denied);
        assert_eq!(h.governor.in_flight_count(), 0);
    }

    #[test]
    fn release_posts_actual_cost_and_frees_the_slot() {
        let h = harness(&policy(1, 100), 30_000);
        let grant = h.governor.acquire(&acquire("k1", 40)).unwrap();
        let lease_id = grant.lease_id.unwrap();

        let response = h.governor.release(&release(&lease_id, "r1", 55)).unwrap();
        assert_eq!(response.classification, Classification::Recorded);

        let ledger = h.governor.ledger_snapshot();
        assert_eq!(ledger.reserved_cents, 0);
        assert_eq!(ledger.consumed_cents, 55);
        assert_eq!(h.governor.in_flight_count(), 0);

        // Consumed budget stays spent: 45 left.
        assert!(!h.governor.acquire(&acquire("k2", 46)).unwrap().granted);
        assert!(h.governor.acquire(&acquire("k3", 45)).unwrap().granted);
    }

    #[test]
    fn replayed_release_does_not_double_post() {
        let h = harness(&policy(2, 100), 30_000);
        let lease_id = h.governor.acquire(&acquire("k1", 10)).unwrap().lease_id.unwrap();

        let first = h.governor.release(&release(&lease_id, "r1", 10)).unwrap();
        let replay = h.governor.release(&release(&lease_id, "r1", 10)).unwrap();
        assert_eq!(first, replay);
        assert_eq!(replay.classification, Classification::Recorded);
        assert_eq!(h.governor.ledger_snapshot().consumed_cents, 10);

        // A new key for the same lease finds nothing in flight.
        let again = h.governor.release(&release(&lease_id, "r2", 10)).unwrap();
        assert_eq!(again.classification, Classification::LeaseNotFound);
        assert_eq!(h.governor.ledger_snapshot().consumed_cents, 10);
    }

    #[test]
    fn expired_capacity_is_reclaimed_on_next_acquire() {
        let h = harness(&policy(1, 1_000), 300);

        let first = h.governor.acquire(&acquire("ttl1", 10)).unwrap();
        assert!(first.granted);

        h.clock.advance(Duration::milliseconds(1_400));
        let second = h.governor.acquire(&acquire("ttl2", 10)).unwrap();
        assert!(second.granted);

        assert_eq!(h.audit.count(AuditDecision::Expired), 1);
        assert_eq!(h.governor.ledger_snapshot().reserved_cents, 10);
        assert_eq!(h.governor.ledger_snapshot().consumed_cents, 0);
    }

    #[test]
    fn expired_lease_is_not_releasable() {
        let h = harness(&policy(1, 1_000), 300);
        let lease_id = h.governor.acquire(&acquire("k1", 10)).unwrap().lease_id.unwrap();

        h.clock.advance(Duration::milliseconds(300));
        let response = h.governor.release(&release(&lease_id, "r1", 10)).unwrap();

        assert_eq!(response.classification, Classification::LeaseNotFound);
        assert_eq!(h.governor.in_flight_count(), 0);
        assert_eq!(h.governor.ledger_snapshot().consumed_cents, 0);
        assert_eq!(h.audit.count(AuditDecision::Expired), 1);
        assert_eq!(h.audit.count(AuditDecision::Released), 1);
    }

    #[test]
    fn sweep_expired_reclaims_without_an_acquire() {
        let h = harness(&policy(3, 1_000), 1_000);
        h.governor.acquire(&acquire("k1", 5)).unwrap();
        h.clock.advance(Duration::milliseconds(500));
        h.governor.acquire(&acquire("k2", 5)).unwrap();

        h.clock.advance(Duration::milliseconds(600));
        assert_eq!(h.governor.sweep_expired(), 1);
        assert_eq!(h.governor.in_flight_count(), 1);
        assert_eq!(h.governor.ledger_snapshot().reserved_cents, 5);
    }

    #[test]
    fn unknown_lease_release_is_audited() {
        let h = harness(&policy(1, 10), 1_000);
        let response = h.governor.release(&release("lease-missing", "r1", 3)).unwrap();
        assert_eq!(response.classification, Classification::LeaseNotFound);

        let events = h.audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, "lease_not_found");
        assert_eq!(events[0].lease_id.as_deref(), Some("lease-missing"));
    }

    #[test]
    fn policy_swap_applies_to_the_next_decision() {
        let h = harness(&policy(1, 1_000), 30_000);
        assert!(h.governor.acquire(&acquire("k1", 1)).unwrap().granted);
        assert!(!h.governor.acquire(&acquire("k2", 1)).unwrap().granted);

        h.policy.reload_from_str(&policy(2, 1_000)).unwrap();
        assert!(h.governor.acquire(&acquire("k3", 1)).unwrap().granted);
        assert_eq!(h.governor.policy().max_in_flight, 2);
    }

    #[test]
    fn consumed_budget_resets_at_utc_midnight() {
        let h = harness(&policy(2, 100), 30_000);
        let lease_id = h.governor.acquire(&acquire("k1", 100)).unwrap().lease_id.unwrap();
        h.governor.release(&release(&lease_id, "r1", 100)).unwrap();
        assert!(!h.governor.acquire(&acquire("k2", 1)).unwrap().granted);

        h.clock.set(Utc.with_ymd_and_hms(2026, 6, 2, 0, 0, 1).unwrap());
        assert!(h.governor.acquire(&acquire("k3", 100)).unwrap().granted);
    }

    #[test]
    fn malformed_requests_are_errors_not_denials() {
        let h = harness(&policy(1, 10), 1_000);
        let mut request = acquire("", 1);
        assert_eq!(
            h.governor.acquire(&request),
            Err(GovernorError::InvalidRequest { field: "idempotencyKey" })
        );
        request.idempotency_key = "k".into();
        request.actor_id = "  ".into();
        assert_eq!(
            h.governor.acquire(&request),
            Err(GovernorError::InvalidRequest { field: "actorId" })
        );
        assert!(h.audit.events().is_empty());
    }

    #[test]
    fn concurrent_acquires_never_exceed_limits() {
        let h = harness(&policy(3, 50), 60_000);
        let governor = Arc::new(h.governor);

        let handles: Vec<_> = (0..16)
            .map(|index| {
                let governor = Arc::clone(&governor);
                std::thread::spawn(move || {
                    governor.acquire(&acquire(&format!("k{index}"), 10)).unwrap()
                })
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|response| response.granted)
            .count();

        assert_eq!(granted, 3);
        assert_eq!(governor.in_flight_count(), 3);
        assert_eq!(governor.ledger_snapshot().reserved_cents, 30);
    }
}
