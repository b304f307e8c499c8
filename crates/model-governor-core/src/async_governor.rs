// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Async front end for the lease governor, backed by Tokio.
//!
//! This module is only compiled when the `async` feature flag is enabled:
//!
//! ```toml
//! [dependencies]
//! model-governor-core = { version = "0.1", features = ["async"] }
//! ```
//!
//! # Design
//!
//! Governor decisions are short, allocation-light critical sections that never
//! await, so [`AsyncLeaseGovernor`] calls straight into the shared
//! [`LeaseGovernor`] from the calling task.  What the async layer adds is
//! cancellation: every entry point takes a [`CancellationToken`] and returns
//! [`GovernorError::Cancelled`] **before** touching governor state when the
//! token has already fired.  Once a decision starts it runs to completion, so
//! a cancelled caller never observes a half-applied mutation.
//!
//! The background sweeper ([`AsyncLeaseGovernor::spawn_sweeper`]) reclaims
//! expired leases on a timer for deployments where Acquire traffic is too
//! sparse to rely on the lazy sweep alone.
//!
//! # Example
//!
//! ```rust,no_run
//! # #[cfg(feature = "async")]
//! # {
//! use std::sync::Arc;
//! use model_governor_core::{
//!     async_governor::AsyncLeaseGovernor,
//!     audit::TracingAuditSink,
//!     config::GovernorConfig,
//!     governor::LeaseGovernor,
//!     policy::PolicyStore,
//!     types::{AcquireLeaseRequest, ActionType},
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let policy = Arc::new(PolicyStore::load_file("policy.json").unwrap());
//!     let governor = AsyncLeaseGovernor::new(Arc::new(LeaseGovernor::new(
//!         GovernorConfig::default(),
//!         policy,
//!         Arc::new(TracingAuditSink),
//!     )));
//!
//!     let request = AcquireLeaseRequest {
//!         actor_id:                "agent-001".into(),
//!         workspace_id:            "ops".into(),
//!         action_type:             ActionType::ChatCompletion,
//!         model_id:                "small-model".into(),
//!         provider_id:             "provider".into(),
//!         estimated_prompt_tokens: 120,
//!         max_output_tokens:       256,
//!         estimated_cost_cents:    3,
//!         requested_capabilities:  vec!["read".into()],
//!         risk_flags:              vec![],
//!         idempotency_key:         "acq-001".into(),
//!     };
//!     let response = governor.acquire(&request, &CancellationToken::new()).await.unwrap();
//!     println!("granted: {}", response.granted);
//! }
//! # }
//! ```

#![cfg(feature = "async")]

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::GovernorError;
use crate::governor::LeaseGovernor;
use crate::types::{AcquireLeaseRequest, AcquireLeaseResponse, ReleaseLeaseRequest, ReleaseLeaseResponse};

// ---------------------------------------------------------------------------
// AsyncLeaseGovernor
// ---------------------------------------------------------------------------

/// Cancellation-aware handle to a shared [`LeaseGovernor`].
///
/// Cheap to clone; every clone drives the same governor.
#[derive(Clone)]
pub struct AsyncLeaseGovernor {
    inner: Arc<LeaseGovernor>,
}

impl AsyncLeaseGovernor {
    pub fn new(governor: Arc<LeaseGovernor>) -> Self {
        Self { inner: governor }
    }

    /// The shared synchronous governor.
    pub fn governor(&self) -> &Arc<LeaseGovernor> {
        &self.inner
    }

    /// Acquire a lease unless `cancel` has already fired.
    pub async fn acquire(
        &self,
        request: &AcquireLeaseRequest,
        cancel: &CancellationToken,
    ) -> Result<AcquireLeaseResponse, GovernorError> {
        if cancel.is_cancelled() {
            debug!(key = %request.idempotency_key, "acquire cancelled before evaluation");
            return Err(GovernorError::Cancelled);
        }
        self.inner.acquire(request)
    }

    /// Release a lease unless `cancel` has already fired.
    pub async fn release(
        &self,
        request: &ReleaseLeaseRequest,
        cancel: &CancellationToken,
    ) -> Result<ReleaseLeaseResponse, GovernorError> {
        if cancel.is_cancelled() {
            debug!(key = %request.idempotency_key, "release cancelled before evaluation");
            return Err(GovernorError::Cancelled);
        }
        self.inner.release(request)
    }

    // -----------------------------------------------------------------------
    // Background sweeper
    // -----------------------------------------------------------------------

    /// Sweep expired leases every `interval` until `cancel` fires.
    pub async fn run_sweeper(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let reclaimed = self.inner.sweep_expired();
                    if reclaimed > 0 {
                        debug!(reclaimed, "background sweep reclaimed expired leases");
                    }
                }
            }
        }
        debug!("lease sweeper stopped");
    }

    /// Spawn [`run_sweeper`](Self::run_sweeper) onto the current runtime.
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let governor = self.clone();
        tokio::spawn(async move { governor.run_sweeper(interval, cancel).await })
    }
}
