//! Shared types for the dispatch layer.
//!
//! Wire frames exchanged with the engine, and the per-call envelope and
//! decoded result handed to callers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::DispatchError;
use super::registry::{Command, Platform};

// ─── Wire payload ────────────────────────────────────────────────────────────

/// An opaque payload tagged with the type it was packed from.
///
/// Mirrors protobuf's `Any`: an empty `type_url` means nothing was packed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypedPayload {
    #[serde(default)]
    pub type_url: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub value: serde_json::Value,
}

impl TypedPayload {
    pub fn new(type_url: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            type_url: type_url.into(),
            value,
        }
    }

    /// The empty payload (no type tag).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.type_url.is_empty()
    }
}

/// Response status returned by the engine. Code `0` is success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

impl Status {
    pub const OK: i32 = 0;

    pub fn ok() -> Self {
        Self {
            code: Self::OK,
            message: String::new(),
        }
    }

    pub fn failed(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == Self::OK
    }
}

/// Status plus opaque payload, as produced by the transport.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenericResponse {
    pub status: Status,
    pub payload: TypedPayload,
}

// ─── Frames ──────────────────────────────────────────────────────────────────

/// One request frame on the wire (one JSON object per line).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Vec<TypedPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// One response frame on the wire, matched to its request by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResponse {
    pub id: u64,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub payload: TypedPayload,
}

impl From<WireResponse> for GenericResponse {
    fn from(frame: WireResponse) -> Self {
        GenericResponse {
            status: frame.status,
            payload: frame.payload,
        }
    }
}

// ─── Call envelope ───────────────────────────────────────────────────────────

/// Everything one call needs: what to run, with which arguments, and where.
#[derive(Debug, Clone, PartialEq)]
pub struct CallEnvelope {
    pub command: Command,
    pub params: Vec<serde_json::Value>,
    /// Overrides the dispatcher's default timeout.
    pub timeout: Option<Duration>,
    /// Overrides the dispatcher's bound platform.
    pub platform: Option<Platform>,
}

impl CallEnvelope {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            params: Vec::new(),
            timeout: None,
            platform: None,
        }
    }

    pub fn with_params(mut self, params: Vec<serde_json::Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_param(mut self, param: impl Into<serde_json::Value>) -> Self {
        self.params.push(param.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }
}

// ─── Decoded response ────────────────────────────────────────────────────────

/// Result of a completed call: the engine's status and the decoded payload.
///
/// A non-OK status is an application-level failure, returned as data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedResponse {
    pub command: Command,
    pub platform: Platform,
    pub method: String,
    pub status: Status,
    pub payload: serde_json::Value,
    pub execution_time_ms: u64,
}

impl DecodedResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_ok()
    }

    /// The payload, or `DispatchError::Application` if the remote operation failed.
    pub fn into_payload(self) -> Result<serde_json::Value, DispatchError> {
        if self.status.is_ok() {
            Ok(self.payload)
        } else {
            Err(DispatchError::Application {
                code: self.status.code,
                message: self.status.message,
            })
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
