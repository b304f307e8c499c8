// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Governed model calls: acquire, run, always release.
//!
//! [`run_governed`] acquires a lease, runs the caller's work only if the lease
//! was granted, and releases the lease on every exit path.  A [`LeaseGuard`]
//! owns the lease while the work runs; if the work panics or the future is
//! dropped mid-flight, the guard's `Drop` spawns a release with
//! [`Outcome::Unknown`] so the slot is not held until TTL expiry.
//!
//! ```text
//! acquire ──denied──▶ Err(Denied)           work never runs
//!    │
//!  granted
//!    │
//!  work ──Ok((value, usage))──▶ release(Success, usage) ──▶ Ok(value)
//!    ├───Err(e)───────────────▶ release(Error, zeroed)  ──▶ Err(Work(e))
//!    └───panic / drop─────────▶ release(Unknown, zeroed) (spawned)
//! ```

use std::future::Future;
use std::sync::Arc;

use model_governor_core::types::{
    AcquireLeaseRequest, AcquireLeaseResponse, DenialReason, Outcome, ReleaseLeaseRequest, ReleaseLeaseResponse,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::client::GovernorClient;

/// What the work actually consumed; reported on release.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub output_tokens: u32,
    pub cost_cents: u64,
    pub tool_calls: u32,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Failure of a governed call.
#[derive(Debug, Error)]
pub enum GovernedCallError<E> {
    /// The lease was denied; the work did not run.
    #[error("model call denied: {reason}")]
    Denied {
        reason: DenialReason,
        recommendation: Option<String>,
        retry_after_ms: Option<u64>,
    },

    /// The work ran and failed; its lease has been released.
    #[error("governed work failed: {0}")]
    Work(E),
}

impl<E> GovernedCallError<E> {
    pub fn denial_reason(&self) -> Option<DenialReason> {
        match self {
            GovernedCallError::Denied { reason, .. } => Some(*reason),
            GovernedCallError::Work(_) => None,
        }
    }

    pub fn into_work_error(self) -> Option<E> {
        match self {
            GovernedCallError::Work(error) => Some(error),
            GovernedCallError::Denied { .. } => None,
        }
    }
}

/// Acquire a lease for `request`, run `work`, and release the lease.
///
/// `work` receives the grant (lease id, expiry, constraints) and returns its
/// value together with the [`Usage`] to report.  The release uses the
/// idempotency key `<acquire key>:release`, so retrying the whole governed
/// call with the same request replays both halves.
///
/// # Errors
///
/// [`GovernedCallError::Denied`] when the lease is refused, or
/// [`GovernedCallError::Work`] carrying the work's own error after the lease
/// has been released with [`Outcome::Error`].
pub async fn run_governed<T, E, F, Fut>(
    client: &Arc<GovernorClient>,
    request: &AcquireLeaseRequest,
    work: F,
) -> Result<T, GovernedCallError<E>>
where
    F: FnOnce(AcquireLeaseResponse) -> Fut,
    Fut: Future<Output = Result<(T, Usage), E>>,
{
    let grant = client.acquire(request).await;
    let lease_id = match (&grant.lease_id, grant.granted) {
        (Some(lease_id), true) => lease_id.clone(),
        _ => {
            return Err(GovernedCallError::Denied {
                reason: grant.denied_reason.unwrap_or(DenialReason::GovernorError),
                recommendation: grant.recommendation,
                retry_after_ms: grant.retry_after_ms,
            });
        }
    };

    let guard = LeaseGuard::new(
        Arc::clone(client),
        lease_id,
        format!("{}:release", request.idempotency_key),
    );

    match work(grant).await {
        Ok((value, usage)) => {
            guard.release(Outcome::Success, usage).await;
            Ok(value)
        }
        Err(error) => {
            guard.release(Outcome::Error, Usage::default()).await;
            Err(GovernedCallError::Work(error))
        }
    }
}

// ---------------------------------------------------------------------------
// LeaseGuard
// ---------------------------------------------------------------------------

/// Owns a granted lease until it is released.
///
/// Dropping an unreleased guard spawns a release with [`Outcome::Unknown`] on
/// the current Tokio runtime.  Outside a runtime the lease is left to expire.
#[derive(Debug)]
pub struct LeaseGuard {
    client: Arc<GovernorClient>,
    lease_id: Option<String>,
    release_key: String,
}

impl LeaseGuard {
    pub fn new(client: Arc<GovernorClient>, lease_id: String, release_key: String) -> Self {
        Self {
            client,
            lease_id: Some(lease_id),
            release_key,
        }
    }

    pub fn lease_id(&self) -> Option<&str> {
        self.lease_id.as_deref()
    }

    /// Release now, reporting `outcome` and `usage`.
    pub async fn release(mut self, outcome: Outcome, usage: Usage) -> Option<ReleaseLeaseResponse> {
        let lease_id = self.lease_id.take()?;
        let request = release_request(&lease_id, outcome, usage, &self.release_key);
        let response = self.client.release(&request).await;
        debug!(
            lease_id = %lease_id,
            outcome = %outcome,
            classification = ?response.classification,
            "governed call released its lease"
        );
        Some(response)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(lease_id) = self.lease_id.take() else {
            return;
        };
        let request = release_request(&lease_id, Outcome::Unknown, Usage::default(), &self.release_key);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(lease_id = %lease_id, "governed call ended without releasing; releasing as unknown");
                let client = Arc::clone(&self.client);
                runtime.spawn(async move {
                    client.release(&request).await;
                });
            }
            Err(_) => warn!(lease_id = %lease_id, "no runtime to release lease; it will expire"),
        }
    }
}

fn release_request(lease_id: &str, outcome: Outcome, usage: Usage, key: &str) -> ReleaseLeaseRequest {
    ReleaseLeaseRequest {
        lease_id: lease_id.to_owned(),
        actual_prompt_tokens: usage.prompt_tokens,
        actual_output_tokens: usage.output_tokens,
        actual_cost_cents: usage.cost_cents,
        tool_calls_count: usage.tool_calls,
        bytes_in: usage.bytes_in,
        bytes_out: usage.bytes_out,
        outcome,
        idempotency_key: key.to_owned(),
    }
}
