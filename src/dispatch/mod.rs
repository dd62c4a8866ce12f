//! Dispatch — command routing and connection management for remote engine hosts.
//!
//! This module handles:
//! - Mapping abstract commands to per-platform remote method names
//! - Pooling one live channel per engine address, shared across threads
//! - A per-thread execution context that drives calls to completion
//! - Marshalling between tagged wire payloads and `serde_json::Value`
//! - The dispatcher that ties these together for one call
//!
//! Automation code builds one [`ConnectionPool`] and one [`CommandRegistry`]
//! at startup and hands clones of a [`Dispatcher`] to whichever threads need it.

pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod marshal;
pub mod pool;
pub mod registry;
pub mod transport;
pub mod types;
pub mod unity;

// Re-exports for convenience
pub use context::{ExecutionContext, PendingCall};
pub use dispatcher::{CallState, Dispatcher, DEFAULT_CALL_TIMEOUT};
pub use errors::{DispatchError, TransportFailure};
pub use marshal::{Marshaller, WireType, WireValue};
pub use pool::{ChannelHandle, ChannelStats, ConnectionPool};
pub use registry::{Command, CommandRegistry, Platform, RegistryBuilder};
pub use transport::{Connector, TcpConnector, Transport};
pub use types::{CallEnvelope, DecodedResponse, GenericResponse, Status, TypedPayload};
pub use unity::{ProjectInfo, UnityEditor};
