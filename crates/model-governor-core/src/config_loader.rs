// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Configuration loader for the governor service and its clients.
//!
//! Supports two load strategies, usually layered:
//!
//! 1. **TOML file**: [`load_service_config`] / [`load_client_config`] read
//!    and deserialise a TOML file.  Missing keys keep their defaults.
//! 2. **Environment variables**: [`apply_service_env`] / [`apply_client_env`]
//!    overlay `MODEL_GOVERNOR_`-prefixed variables on top of a loaded (or
//!    default) config.  [`service_config_from_env`] and
//!    [`client_config_from_env`] start from defaults.
//!
//! Every loader validates the result before returning it.
//!
//! # File format (service)
//!
//! ```toml
//! channel_name              = "model-governor"
//! policy_path               = "/etc/model-governor/policy.json"
//! audit_path                = "/var/log/model-governor/audit.jsonl"
//! policy_reload_interval_ms = 1000
//! max_connections           = 64
//!
//! [governor]
//! lease_ttl_ms         = 30000
//! idempotency_capacity = 10000
//! sweep_interval_ms    = 5000
//! ```
//!
//! # Environment variables
//!
//! | Variable                                | Applies to | Type    |
//! |-----------------------------------------|------------|---------|
//! | `MODEL_GOVERNOR_CHANNEL`                | both       | string  |
//! | `MODEL_GOVERNOR_LEASE_TTL_MS`           | service    | integer |
//! | `MODEL_GOVERNOR_POLICY_PATH`            | service    | path    |
//! | `MODEL_GOVERNOR_AUDIT_PATH`             | service    | path    |
//! | `MODEL_GOVERNOR_FALLBACK_MODE`          | client     | dev/prod|
//! | `MODEL_GOVERNOR_DEV_MAX_OUTPUT_TOKENS`  | client     | integer |
//! | `MODEL_GOVERNOR_PROD_MAX_OUTPUT_TOKENS` | client     | integer |
//! | `MODEL_GOVERNOR_CONNECT_TIMEOUT_MS`     | client     | integer |

#![cfg(feature = "config-loader")]

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::DeserializeOwned;

use crate::config::{ClientConfig, FallbackMode, ServiceConfig};
use crate::error::ConfigError;

pub const ENV_CHANNEL: &str = "MODEL_GOVERNOR_CHANNEL";
pub const ENV_LEASE_TTL_MS: &str = "MODEL_GOVERNOR_LEASE_TTL_MS";
pub const ENV_POLICY_PATH: &str = "MODEL_GOVERNOR_POLICY_PATH";
pub const ENV_AUDIT_PATH: &str = "MODEL_GOVERNOR_AUDIT_PATH";
pub const ENV_FALLBACK_MODE: &str = "MODEL_GOVERNOR_FALLBACK_MODE";
pub const ENV_DEV_MAX_OUTPUT_TOKENS: &str = "MODEL_GOVERNOR_DEV_MAX_OUTPUT_TOKENS";
pub const ENV_PROD_MAX_OUTPUT_TOKENS: &str = "MODEL_GOVERNOR_PROD_MAX_OUTPUT_TOKENS";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "MODEL_GOVERNOR_CONNECT_TIMEOUT_MS";

// ---------------------------------------------------------------------------
// TOML loaders
// ---------------------------------------------------------------------------

/// Load a [`ServiceConfig`] from a TOML file.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, does not match the
/// schema, or holds an out-of-range value.
///
/// # Example
///
/// ```rust,no_run
/// use model_governor_core::config_loader::load_service_config;
///
/// let config = load_service_config("/etc/model-governor/service.toml").unwrap();
/// println!("policy: {}", config.policy_path.display());
/// ```
pub fn load_service_config(path: impl AsRef<Path>) -> Result<ServiceConfig, ConfigError> {
    let config: ServiceConfig = load_toml(path.as_ref())?;
    validate_service(&config)?;
    Ok(config)
}

/// Load a [`ClientConfig`] from a TOML file.
pub fn load_client_config(path: impl AsRef<Path>) -> Result<ClientConfig, ConfigError> {
    let config: ClientConfig = load_toml(path.as_ref())?;
    validate_client(&config)?;
    Ok(config)
}

fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.display().to_string(),
        source,
    })?;
    Ok(toml::from_str::<T>(&content)?)
}

// ---------------------------------------------------------------------------
// Environment overlays
// ---------------------------------------------------------------------------

/// Build a [`ServiceConfig`] from defaults plus `MODEL_GOVERNOR_*` variables.
pub fn service_config_from_env() -> Result<ServiceConfig, ConfigError> {
    let mut config = ServiceConfig::default();
    apply_service_env(&mut config)?;
    Ok(config)
}

/// Build a [`ClientConfig`] from defaults plus `MODEL_GOVERNOR_*` variables.
pub fn client_config_from_env() -> Result<ClientConfig, ConfigError> {
    let mut config = ClientConfig::default();
    apply_client_env(&mut config)?;
    Ok(config)
}

/// Overlay process environment variables onto `config`.
pub fn apply_service_env(config: &mut ServiceConfig) -> Result<(), ConfigError> {
    apply_service_vars(config, |key| std::env::var(key).ok())
}

/// Overlay process environment variables onto `config`.
pub fn apply_client_env(config: &mut ClientConfig) -> Result<(), ConfigError> {
    apply_client_vars(config, |key| std::env::var(key).ok())
}

/// Overlay variables resolved by `lookup` onto `config`, then validate.
///
/// Unset variables leave the field untouched.
pub fn apply_service_vars(
    config: &mut ServiceConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(channel) = lookup(ENV_CHANNEL) {
        config.channel_name = channel;
    }
    if let Some(ttl) = parse_var::<u64>(&lookup, ENV_LEASE_TTL_MS)? {
        config.governor.lease_ttl_ms = ttl;
    }
    if let Some(path) = lookup(ENV_POLICY_PATH) {
        config.policy_path = PathBuf::from(path);
    }
    if let Some(path) = lookup(ENV_AUDIT_PATH) {
        config.audit_path = Some(PathBuf::from(path));
    }
    validate_service(config)
}

/// Overlay variables resolved by `lookup` onto `config`, then validate.
pub fn apply_client_vars(
    config: &mut ClientConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(channel) = lookup(ENV_CHANNEL) {
        config.channel_name = channel;
    }
    if let Some(mode) = lookup(ENV_FALLBACK_MODE) {
        config.fallback.mode = FallbackMode::from_str(&mode).map_err(|_| ConfigError::ParseField {
            field: ENV_FALLBACK_MODE.into(),
            value: mode,
            reason: "expected one of: dev, prod".into(),
        })?;
    }
    if let Some(cap) = parse_var::<u32>(&lookup, ENV_DEV_MAX_OUTPUT_TOKENS)? {
        config.fallback.dev_max_output_tokens = cap;
    }
    if let Some(cap) = parse_var::<u32>(&lookup, ENV_PROD_MAX_OUTPUT_TOKENS)? {
        config.fallback.prod_max_output_tokens = cap;
    }
    if let Some(timeout) = parse_var::<u64>(&lookup, ENV_CONNECT_TIMEOUT_MS)? {
        config.connect_timeout_ms = timeout;
    }
    validate_client(config)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_service(config: &ServiceConfig) -> Result<(), ConfigError> {
    require_non_empty("channel_name", &config.channel_name)?;
    require_positive("governor.lease_ttl_ms", config.governor.lease_ttl_ms)?;
    require_positive("governor.idempotency_capacity", config.governor.idempotency_capacity as u64)?;
    require_positive("max_connections", config.max_connections as u64)?;
    if let Some(interval) = config.governor.sweep_interval_ms {
        require_positive("governor.sweep_interval_ms", interval)?;
    }
    if let Some(interval) = config.policy_reload_interval_ms {
        require_positive("policy_reload_interval_ms", interval)?;
    }
    if config.governor.low_budget_percent > 100 {
        return Err(ConfigError::InvalidRange {
            field: "governor.low_budget_percent".into(),
            value: config.governor.low_budget_percent.to_string(),
            reason: "must be in range 0-100".into(),
        });
    }
    Ok(())
}

fn validate_client(config: &ClientConfig) -> Result<(), ConfigError> {
    require_non_empty("channel_name", &config.channel_name)?;
    require_positive("connect_timeout_ms", config.connect_timeout_ms)?;
    require_positive("request_timeout_ms", config.request_timeout_ms)?;
    require_positive("fallback.local_lease_ttl_ms", config.fallback.local_lease_ttl_ms)
}

fn require_positive(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidRange {
            field: field.into(),
            value: "0".into(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(())
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::InvalidRange {
            field: field.into(),
            value: value.into(),
            reason: "must not be empty".into(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|source| ConfigError::ParseField {
            field: key.to_owned(),
            value: raw,
            reason: source.to_string(),
        }),
        None => Ok(None),
    }
}
