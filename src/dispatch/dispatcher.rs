//! Command dispatcher — the entry point automation code calls.
//!
//! One call walks a fixed lifecycle:
//!
//! ```text
//! Idle → ChannelAcquired → CallInFlight → {Completed | Failed} → Released
//! ```
//!
//! Release is tied to a `ChannelLease` guard, so it runs on every exit path:
//! early returns, panics, and futures dropped mid-flight.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;

use super::context::ExecutionContext;
use super::errors::{DispatchError, TransportFailure};
use super::marshal::Marshaller;
use super::pool::{ChannelHandle, ConnectionPool};
use super::registry::{Command, CommandRegistry, Platform};
use super::transport::saturating_millis;
use super::types::{CallEnvelope, DecodedResponse};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for one remote call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Call lifecycle ──────────────────────────────────────────────────────────

/// Where a call is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    ChannelAcquired,
    CallInFlight,
    Completed,
    Failed,
    Released,
}

/// Tracks and logs state transitions for one call.
struct CallTrace {
    command: Command,
    state: CallState,
}

impl CallTrace {
    fn new(command: Command) -> Self {
        Self {
            command,
            state: CallState::Idle,
        }
    }

    fn advance(&mut self, next: CallState) {
        tracing::debug!(
            command = %self.command,
            from = ?self.state,
            to = ?next,
            "call state"
        );
        self.state = next;
    }

    fn fail(&mut self, err: DispatchError) -> DispatchError {
        self.advance(CallState::Failed);
        err
    }
}

/// A channel checked out of the pool. Dropping it releases the channel.
struct ChannelLease {
    pool: Arc<ConnectionPool>,
    handle: Arc<ChannelHandle>,
    command: Command,
}

impl ChannelLease {
    fn acquire(pool: &Arc<ConnectionPool>, address: &str, command: Command) -> Result<Self, DispatchError> {
        let handle = pool.acquire(address)?;
        Ok(Self {
            pool: Arc::clone(pool),
            handle,
            command,
        })
    }

    fn handle(&self) -> &ChannelHandle {
        &self.handle
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        self.pool.release(&self.handle);
        tracing::debug!(command = %self.command, to = ?CallState::Released, "call state");
    }
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

/// Issues commands to one engine endpoint on behalf of one platform.
///
/// Cheap to clone; the registry and pool are shared.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<CommandRegistry>,
    pool: Arc<ConnectionPool>,
    platform: Platform,
    address: String,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<CommandRegistry>,
        pool: Arc<ConnectionPool>,
        platform: Platform,
        address: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            pool,
            platform,
            address: address.into(),
            default_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Set the timeout used when a call does not carry its own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    // ─── Blocking API ────────────────────────────────────────────────────

    /// Dispatch a command and block until it completes.
    ///
    /// Runs on the calling thread's execution context. `platform` and
    /// `timeout` override the dispatcher's defaults for this call only.
    pub fn dispatch(
        &self,
        command: Command,
        params: Vec<serde_json::Value>,
        platform: Option<Platform>,
        timeout: Option<Duration>,
    ) -> Result<DecodedResponse, DispatchError> {
        self.call(CallEnvelope {
            command,
            params,
            timeout,
            platform,
        })
    }

    /// Blocking form of [`call_async`](Self::call_async).
    pub fn call(&self, envelope: CallEnvelope) -> Result<DecodedResponse, DispatchError> {
        let context = ExecutionContext::current()?;
        context.run(self.call_async(envelope))?
    }

    /// Run several calls concurrently on this thread's context.
    ///
    /// Results come back in input order; one failure does not cancel the rest.
    pub fn call_batch(
        &self,
        envelopes: Vec<CallEnvelope>,
    ) -> Result<Vec<Result<DecodedResponse, DispatchError>>, DispatchError> {
        let context = ExecutionContext::current()?;
        context.run(join_all(envelopes.into_iter().map(|e| self.call_async(e))))
    }

    // ─── Async API ───────────────────────────────────────────────────────

    /// Same as [`dispatch`](Self::dispatch), for callers already inside a runtime.
    pub async fn dispatch_async(
        &self,
        command: Command,
        params: Vec<serde_json::Value>,
        platform: Option<Platform>,
        timeout: Option<Duration>,
    ) -> Result<DecodedResponse, DispatchError> {
        self.call_async(CallEnvelope {
            command,
            params,
            timeout,
            platform,
        })
        .await
    }

    /// Drive one call through its full lifecycle.
    ///
    /// Steps:
    /// 1. Resolve the method name and acquire a channel
    /// 2. Encode params and submit the call
    /// 3. Decode the payload; a failed status is logged and returned as data
    /// 4. On transport failure, drop the channel from the pool
    pub async fn call_async(&self, envelope: CallEnvelope) -> Result<DecodedResponse, DispatchError> {
        let start = Instant::now();
        let command = envelope.command;
        let platform = envelope.platform.unwrap_or(self.platform);
        let mut trace = CallTrace::new(command);

        // 1. Idle → ChannelAcquired
        let method = self
            .registry
            .resolve(command, platform)
            .map_err(|e| trace.fail(e))?
            .to_string();
        let lease = ChannelLease::acquire(&self.pool, &self.address, command)
            .map_err(|e| trace.fail(e))?;
        trace.advance(CallState::ChannelAcquired);

        // 2. ChannelAcquired → CallInFlight
        let params = Marshaller::encode_params(&envelope.params);
        let timeout = envelope.timeout.unwrap_or(self.default_timeout);
        trace.advance(CallState::CallInFlight);

        let outcome = tokio::time::timeout(
            timeout,
            lease.handle().transport().call(&method, params, Some(timeout)),
        )
        .await;

        // 3./4. CallInFlight → Completed | Failed
        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                if e.invalidates_channel() {
                    self.pool.invalidate_handle(lease.handle());
                }
                tracing::warn!(
                    command = %command,
                    method = %method,
                    address = %self.address,
                    error = %e,
                    "remote call failed"
                );
                return Err(trace.fail(e));
            }
            Err(_) => {
                let timeout_ms = saturating_millis(timeout);
                // A slow call alone is not a broken channel.
                if !lease.handle().is_usable() {
                    self.pool.invalidate_handle(lease.handle());
                }
                tracing::warn!(
                    command = %command,
                    method = %method,
                    address = %self.address,
                    timeout_ms,
                    "remote call timed out"
                );
                return Err(trace.fail(DispatchError::transport(
                    &self.address,
                    TransportFailure::Timeout,
                    format!("'{method}' timed out after {timeout_ms}ms"),
                )));
            }
        };

        let payload = Marshaller::decode(&response.payload).map_err(|e| trace.fail(e))?;

        if !response.status.is_ok() {
            tracing::error!(
                command = %command,
                method = %method,
                code = response.status.code,
                message = %response.status.message,
                params = ?envelope.params,
                "remote operation reported failure"
            );
        }
        trace.advance(CallState::Completed);

        Ok(DecodedResponse {
            command,
            platform,
            method,
            status: response.status,
            payload,
            execution_time_ms: saturating_millis(start.elapsed()),
        })
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("platform", &self.platform)
            .field("address", &self.address)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
