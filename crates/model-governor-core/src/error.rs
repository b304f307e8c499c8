// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Error types.
//!
//! Admission denials are **not** errors: they are ordinary
//! [`AcquireLeaseResponse`](crate::types::AcquireLeaseResponse) values.  The
//! types here cover malformed input, policy documents that fail to parse, wire
//! protocol violations, and configuration problems.

use thiserror::Error;

/// Failure of a governor entry point before any state was touched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GovernorError {
    /// A required request field was empty.
    #[error("invalid request: field '{field}' must not be empty")]
    InvalidRequest { field: &'static str },

    /// The caller cancelled before the governor mutated any state.
    #[error("request cancelled before admission")]
    Cancelled,
}

/// Failure to load or validate a policy document.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy file \"{path}\": {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("policy lists capabilities for unknown action type '{0}'")]
    UnknownActionType(String),
}

/// Wire protocol violation.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {size} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("response envelope reported success without a payload")]
    MissingPayload,
}

/// Failure to load configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file \"{path}\": {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[cfg(feature = "config-loader")]
    #[error("failed to parse TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("field \"{field}\": cannot parse \"{value}\": {reason}")]
    ParseField {
        field: String,
        value: String,
        reason: String,
    },

    #[error("field \"{field}\": value \"{value}\" out of range: {reason}")]
    InvalidRange {
        field: String,
        value: String,
        reason: String,
    },
}
