// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Wire protocol: JSON envelopes and length-prefixed framing.
//!
//! A request envelope carries a command name and the command's payload as a
//! JSON *string*; a response envelope carries a success flag plus either the
//! payload string or an error string:
//!
//! ```text
//! {"command":"Acquire","payloadJson":"{\"actorId\":...}"}
//! {"success":true,"payloadJson":"{\"granted\":true,...}","error":null}
//! ```
//!
//! On the byte stream every envelope is preceded by its length as a 4-byte
//! big-endian unsigned integer, capped at [`MAX_FRAME_SIZE`].  The transport's
//! own message boundaries are never relied upon.  The async codec lives in
//! `model-governor-std`.

use core::fmt;
use core::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Length of the frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest envelope accepted on the wire (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// Commands and envelopes
// ---------------------------------------------------------------------------

/// Commands understood by the governor service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Acquire,
    Release,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Acquire => "Acquire",
            Command::Release => "Release",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Acquire" => Ok(Command::Acquire),
            "Release" => Ok(Command::Release),
            other => Err(ProtocolError::UnknownCommand(other.into())),
        }
    }
}

/// Client → server envelope.
///
/// `command` stays a plain string so that an unknown command still decodes
/// and can be answered with a failure envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub command: String,
    pub payload_json: String,
}

impl RequestEnvelope {
    /// Wrap `payload` for `command`.
    pub fn new<T: Serialize>(command: Command, payload: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            command: command.as_str().into(),
            payload_json: encode(payload)?,
        })
    }

    /// Parse the command name.
    pub fn command(&self) -> Result<Command, ProtocolError> {
        self.command.parse()
    }

    /// Decode the payload string.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        decode(&self.payload_json)
    }
}

/// Server → client envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub success: bool,
    pub payload_json: Option<String>,
    pub error: Option<String>,
}

impl ResponseEnvelope {
    /// Successful envelope carrying `payload`.
    pub fn ok<T: Serialize>(payload: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            success: true,
            payload_json: Some(encode(payload)?),
            error: None,
        })
    }

    /// Failure envelope carrying `error`.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload_json: None,
            error: Some(error.into()),
        }
    }

    /// Decode the payload of a successful envelope.
    ///
    /// Returns `Ok(Err(message))` for a failure envelope so callers can tell a
    /// server-side rejection apart from a corrupt response.
    pub fn into_payload<T: DeserializeOwned>(self) -> Result<Result<T, String>, ProtocolError> {
        if !self.success {
            return Ok(Err(self.error.unwrap_or_else(|| "unspecified server error".into())));
        }
        let payload = self.payload_json.ok_or(ProtocolError::MissingPayload)?;
        decode(&payload).map(Ok)
    }
}

// ---------------------------------------------------------------------------
// Canonical JSON
// ---------------------------------------------------------------------------

/// Serialise `value` to compact JSON.
///
/// Key order is the field declaration order of the type, so the output is
/// byte-stable for identical input.
pub fn encode<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(value)?)
}

/// Deserialise `raw` JSON into `T`.
pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(raw)?)
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Reject lengths above [`MAX_FRAME_SIZE`].
pub fn check_frame_len(size: usize) -> Result<(), ProtocolError> {
    if size > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge { size, max: MAX_FRAME_SIZE });
    }
    Ok(())
}
