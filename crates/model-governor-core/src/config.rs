// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Configuration for the governor, its service, and its clients.
//!
//! Every struct has sensible defaults so that `Default::default()` is always a
//! valid starting point, and every field is optional in TOML.  Limits that the
//! policy document owns (max in-flight, daily budget, allow-lists) are **not**
//! configured here; they are read from the current policy snapshot.

use std::path::PathBuf;
use std::time::Duration;

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_CHANNEL_NAME: &str = "model-governor";

// ---------------------------------------------------------------------------
// GovernorConfig
// ---------------------------------------------------------------------------

/// Tuning for the [`LeaseGovernor`](crate::governor::LeaseGovernor).
///
/// # Examples
///
/// ```rust
/// use model_governor_core::config::GovernorConfig;
///
/// let config = GovernorConfig {
///     lease_ttl_ms: 300,
///     ..GovernorConfig::default()
/// };
/// assert_eq!(config.lease_ttl().num_milliseconds(), 300);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// How long a granted lease lives before it is reclaimed.
    pub lease_ttl_ms: u64,
    /// Maximum keys retained per idempotency cache (acquire and release).
    pub idempotency_capacity: usize,
    /// When set, expired leases are also swept on this interval instead of
    /// only lazily during Acquire.
    pub sweep_interval_ms: Option<u64>,
    /// A grant leaving less than this percentage of the daily budget carries a
    /// cheaper-model recommendation.
    pub low_budget_percent: u8,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms:         30_000,
            idempotency_capacity: 10_000,
            sweep_interval_ms:    None,
            low_budget_percent:   10,
        }
    }
}

impl GovernorConfig {
    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.lease_ttl_ms).unwrap_or(i64::MAX))
    }
}

// ---------------------------------------------------------------------------
// Fallback
// ---------------------------------------------------------------------------

/// Local admission policy used by the client when the service is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackMode {
    /// Permissive but bounded.
    #[default]
    Dev,
    /// Read-only chat completions under a small output cap.
    Prod,
}

impl fmt::Display for FallbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackMode::Dev  => f.write_str("dev"),
            FallbackMode::Prod => f.write_str("prod"),
        }
    }
}

impl FromStr for FallbackMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dev"  => Ok(FallbackMode::Dev),
            "prod" => Ok(FallbackMode::Prod),
            other => Err(ConfigError::ParseField {
                field: "fallback.mode".into(),
                value: other.into(),
                reason: "expected one of: dev, prod".into(),
            }),
        }
    }
}

/// Settings for [`FallbackPolicy`](crate::fallback::FallbackPolicy).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub mode: FallbackMode,
    /// Capabilities never granted locally, in either mode.
    pub risky_capabilities: Vec<String>,
    /// Output-token cap for Dev mode.
    pub dev_max_output_tokens: u32,
    /// Output-token cap for Prod mode read-only completions.
    pub prod_max_output_tokens: u32,
    /// Lifetime reported on locally granted leases.
    pub local_lease_ttl_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            mode:                   FallbackMode::Dev,
            risky_capabilities:     default_risky_capabilities(),
            dev_max_output_tokens:  4096,
            prod_max_output_tokens: 1024,
            local_lease_ttl_ms:     60_000,
        }
    }
}

fn default_risky_capabilities() -> Vec<String> {
    ["network-write", "file-write", "exec"].map(String::from).to_vec()
}

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

/// Settings for the IPC client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub channel_name: String,
    /// Bound on connecting; a missing service degrades to fallback after this.
    pub connect_timeout_ms: u64,
    /// Bound on one request/response round trip once connected.
    pub request_timeout_ms: u64,
    pub fallback: FallbackConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channel_name:       DEFAULT_CHANNEL_NAME.into(),
            connect_timeout_ms: 500,
            request_timeout_ms: 5_000,
            fallback:           FallbackConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// ServiceConfig
// ---------------------------------------------------------------------------

/// Settings for the governor daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub channel_name: String,
    /// JSON policy document; the initial load must succeed.
    pub policy_path: PathBuf,
    /// JSON-lines audit file.  When absent, audit events go to the log.
    pub audit_path: Option<PathBuf>,
    /// Poll interval for policy hot reload; `None` disables reloading.
    pub policy_reload_interval_ms: Option<u64>,
    /// Concurrent connections accepted before new ones wait.
    pub max_connections: usize,
    pub governor: GovernorConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            channel_name:              DEFAULT_CHANNEL_NAME.into(),
            policy_path:               PathBuf::from("policy.json"),
            audit_path:                None,
            policy_reload_interval_ms: Some(1_000),
            max_connections:           64,
            governor:                  GovernorConfig::default(),
        }
    }
}
