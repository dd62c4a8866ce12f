//! Dispatch error types.

use std::fmt;

use thiserror::Error;

use super::registry::{Command, Platform};

/// Which part of the transport gave up on a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    /// The endpoint could not be reached (refused, bad address, connect timeout).
    Connect,
    /// Reading or writing the socket failed mid-call.
    Io,
    /// The channel was already closed when the call was submitted.
    Closed,
    /// No response arrived before the call deadline.
    Timeout,
    /// The peer sent something that is not a valid response frame.
    Protocol,
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connect => "connect",
            Self::Io => "io",
            Self::Closed => "closed",
            Self::Timeout => "timeout",
            Self::Protocol => "protocol",
        };
        f.write_str(label)
    }
}

/// Errors that can occur while dispatching a remote command.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No method name is registered for this command on this platform.
    #[error("command '{command}' is not supported on platform '{platform}'")]
    UnsupportedCommand {
        command: Command,
        platform: Platform,
    },

    /// Connection refused, socket failure, malformed frame, or timeout.
    #[error("rpc transport error for '{address}' ({kind}): {reason}")]
    RpcTransport {
        address: String,
        kind: TransportFailure,
        reason: String,
    },

    /// The payload carried a type tag (or shape) the decoder cannot handle.
    #[error("cannot unmarshal payload '{type_url}': {reason}")]
    Unmarshal {
        type_url: String,
        reason: String,
    },

    /// The calling thread cannot host an execution context.
    #[error("execution context unavailable: {reason}")]
    ContextUnavailable {
        reason: String,
    },

    /// The execution context was torn down while the call was pending.
    #[error("call '{method}' was cancelled before completion")]
    Cancelled {
        method: String,
    },

    /// The remote operation reported failure in its response status.
    ///
    /// Dispatch never returns this on its own; it is produced by
    /// `DecodedResponse::into_payload` when the caller asks for it.
    #[error("remote operation failed [{code}]: {message}")]
    Application {
        code: i32,
        message: String,
    },
}

impl DispatchError {
    pub(crate) fn transport(
        address: &str,
        kind: TransportFailure,
        reason: impl Into<String>,
    ) -> Self {
        DispatchError::RpcTransport {
            address: address.to_string(),
            kind,
            reason: reason.into(),
        }
    }

    pub(crate) fn unmarshal(type_url: &str, reason: impl Into<String>) -> Self {
        DispatchError::Unmarshal {
            type_url: type_url.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Only transport failures qualify: a retry acquires a fresh channel.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::RpcTransport { .. })
    }

    /// Whether the channel that produced this error must be dropped from the pool.
    ///
    /// A timeout alone says nothing about the channel; the dispatcher checks
    /// the channel's own health in that case.
    pub fn invalidates_channel(&self) -> bool {
        matches!(
            self,
            DispatchError::RpcTransport { kind, .. } if *kind != TransportFailure::Timeout
        )
    }

    /// The transport failure kind, if this is a transport error.
    pub fn transport_failure(&self) -> Option<TransportFailure> {
        match self {
            DispatchError::RpcTransport { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
