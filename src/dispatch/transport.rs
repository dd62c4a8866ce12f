//! Line-delimited JSON transport over TCP.
//!
//! Handles low-level communication with the engine's RPC endpoint:
//! - Writing one `WireRequest` per line
//! - Reading `WireResponse` lines and routing them to the waiting caller by `id`
//! - Marking the connection unusable once the socket fails
//!
//! Sockets live on the connector's own I/O runtime. Callers on any thread (and
//! any runtime) talk to the connection task through `mpsc` / `oneshot`
//! channels, so a connection opened by one thread keeps working while that
//! thread is idle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::errors::{DispatchError, TransportFailure};
use super::types::{GenericResponse, TypedPayload, WireRequest, WireResponse};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default time allowed for the TCP connect.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Worker threads on the connector's own I/O runtime.
const IO_WORKER_THREADS: usize = 2;

/// How often the connection task drops replies nobody is waiting for.
const PENDING_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// A live, multiplexed call/response connection to one endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue one call and wait for its response.
    ///
    /// Many calls may be in flight at once on the same transport.
    async fn call(
        &self,
        method: &str,
        params: Vec<TypedPayload>,
        timeout: Option<Duration>,
    ) -> Result<GenericResponse, DispatchError>;

    /// Whether the connection can still carry calls.
    fn is_usable(&self) -> bool;

    /// Close the connection. Pending calls fail with `TransportFailure::Closed`.
    fn close(&self);
}

/// Opens transports. Called by the pool under its lock, so it must not block
/// on network I/O.
pub trait Connector: Send + Sync {
    fn open(&self, address: &str) -> Result<Arc<dyn Transport>, DispatchError>;
}

/// Check that `address` looks like `host:port` with a numeric port.
pub fn validate_address(address: &str) -> Result<(), DispatchError> {
    let invalid = |reason: &str| {
        DispatchError::transport(address, TransportFailure::Connect, format!("invalid address: {reason}"))
    };
    if address.parse::<SocketAddr>().is_ok() {
        return Ok(());
    }
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected host:port"))?;
    if host.is_empty() {
        return Err(invalid("empty host"));
    }
    port.parse::<u16>()
        .map(|_| ())
        .map_err(|_| invalid("port must be a number between 0 and 65535"))
}

// ─── TcpConnector ────────────────────────────────────────────────────────────

/// Opens [`TcpTransport`]s whose socket tasks run on a dedicated runtime.
pub struct TcpConnector {
    handle: Handle,
    /// Taken on drop.
    runtime: Option<Runtime>,
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Build a connector with its own multi-threaded I/O runtime.
    pub fn new() -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(IO_WORKER_THREADS)
            .thread_name("engine-pipe-io")
            .enable_all()
            .build()?;
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Connector for TcpConnector {
    fn open(&self, address: &str) -> Result<Arc<dyn Transport>, DispatchError> {
        validate_address(address)?;
        let transport = TcpTransport::spawn(&self.handle, address, self.connect_timeout);
        Ok(Arc::new(transport))
    }
}

impl Drop for TcpConnector {
    fn drop(&mut self) {
        // Dropping a runtime from inside another runtime panics.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

// ─── TcpTransport ────────────────────────────────────────────────────────────

type Reply = oneshot::Sender<Result<GenericResponse, DispatchError>>;

/// A call waiting to be written by the connection task.
struct Outbound {
    request: WireRequest,
    reply: Reply,
}

/// Shared liveness flag plus why the connection died.
#[derive(Default)]
struct ConnectionState {
    closed: AtomicBool,
    failure: Mutex<Option<(TransportFailure, String)>>,
    /// Size of the connection task's pending map, published after each change.
    pending: AtomicUsize,
}

impl ConnectionState {
    /// First failure wins; later ones are consequences of it.
    fn mark_closed(&self, kind: TransportFailure, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.failure.lock() {
            slot.get_or_insert_with(|| (kind, reason.to_string()));
        }
    }

    fn failure(&self) -> (TransportFailure, String) {
        self.failure
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .unwrap_or_else(|| (TransportFailure::Closed, "connection closed".into()))
    }
}

/// Multiplexed JSON-RPC connection to one `host:port`.
pub struct TcpTransport {
    address: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: Arc<ConnectionState>,
    task: JoinHandle<()>,
}

impl TcpTransport {
    /// Start the connection task on `handle`. Connecting happens in the
    /// background; calls submitted meanwhile are queued.
    pub fn spawn(handle: &Handle, address: &str, connect_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(ConnectionState::default());
        let task = handle.spawn(run_connection(
            address.to_string(),
            connect_timeout,
            rx,
            Arc::clone(&state),
        ));
        Self {
            address: address.to_string(),
            outbound: tx,
            state,
            task,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Requests written but not yet answered or abandoned by their caller.
    pub fn pending_calls(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> DispatchError {
        let (kind, reason) = self.state.failure();
        DispatchError::transport(&self.address, kind, reason)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(
        &self,
        method: &str,
        params: Vec<TypedPayload>,
        timeout: Option<Duration>,
    ) -> Result<GenericResponse, DispatchError> {
        if !self.is_usable() {
            return Err(self.closed_error());
        }

        let request = WireRequest {
            id: next_request_id(),
            method: method.to_string(),
            params,
            timeout_ms: timeout.map(saturating_millis),
        };
        let (reply, response) = oneshot::channel();

        self.outbound
            .send(Outbound { request, reply })
            .map_err(|_| self.closed_error())?;

        response.await.map_err(|_| self.closed_error())?
    }

    fn is_usable(&self) -> bool {
        !self.state.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.state.mark_closed(TransportFailure::Closed, "closed by pool");
        self.task.abort();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ─── Connection task ─────────────────────────────────────────────────────────

/// Owns the socket: connects, then interleaves writes of queued requests
/// with reads of responses until either side fails.
async fn run_connection(
    address: String,
    connect_timeout: Duration,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    state: Arc<ConnectionState>,
) {
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            fail_queued(&address, &mut outbound, &state, TransportFailure::Connect, &format!("connect failed: {e}"));
            return;
        }
        Err(_) => {
            let reason = format!("connect timed out after {}ms", connect_timeout.as_millis());
            fail_queued(&address, &mut outbound, &state, TransportFailure::Connect, &reason);
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    tracing::debug!(address = %address, "channel connected");

    let (read_half, mut writer) = stream.into_split();
    // `next_line` is cancel-safe, so a write winning the select loses no input.
    let mut lines = BufReader::new(read_half).lines();
    let mut pending: HashMap<u64, Reply> = HashMap::new();
    let mut sweep = tokio::time::interval(PENDING_SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let failure: (TransportFailure, String) = loop {
        tokio::select! {
            _ = sweep.tick() => {
                // A caller that timed out dropped its receiver; its late reply has nowhere to go.
                let before = pending.len();
                pending.retain(|_, reply| !reply.is_closed());
                if pending.len() != before {
                    tracing::debug!(address = %address, dropped = before - pending.len(), "dropped abandoned requests");
                    state.pending.store(pending.len(), Ordering::SeqCst);
                }
            }
            msg = outbound.recv() => {
                let Some(Outbound { request, reply }) = msg else {
                    // Every sender is gone: the transport was dropped.
                    break (TransportFailure::Closed, "transport dropped".into());
                };
                let mut json = match serde_json::to_string(&request) {
                    Ok(json) => json,
                    Err(e) => {
                        let _ = reply.send(Err(DispatchError::transport(
                            &address,
                            TransportFailure::Protocol,
                            format!("failed to serialize request: {e}"),
                        )));
                        continue;
                    }
                };
                json.push('\n');
                pending.insert(request.id, reply);
                state.pending.store(pending.len(), Ordering::SeqCst);
                if let Err(e) = writer.write_all(json.as_bytes()).await {
                    break (TransportFailure::Io, format!("failed to write request: {e}"));
                }
                if let Err(e) = writer.flush().await {
                    break (TransportFailure::Io, format!("failed to flush request: {e}"));
                }
            }
            read = lines.next_line() => {
                let line = match read {
                    Ok(Some(line)) => line,
                    Ok(None) => break (TransportFailure::Io, "engine closed the connection".into()),
                    Err(e) => break (TransportFailure::Io, format!("failed to read response: {e}")),
                };
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    match serde_json::from_str::<WireResponse>(trimmed) {
                        Ok(frame) => match pending.remove(&frame.id) {
                            // The caller may have timed out and gone away.
                            Some(reply) => {
                                state.pending.store(pending.len(), Ordering::SeqCst);
                                let _ = reply.send(Ok(frame.into()));
                            }
                            None => tracing::debug!(address = %address, id = frame.id, "dropping response for unknown request"),
                        },
                        Err(e) => tracing::warn!(address = %address, error = %e, "skipping malformed response line"),
                    }
                }
            }
        }
    };

    let (kind, reason) = failure;
    tracing::warn!(address = %address, reason = %reason, "channel closed");
    state.mark_closed(kind, &reason);
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(DispatchError::transport(&address, kind, reason.clone())));
    }
    state.pending.store(0, Ordering::SeqCst);
    fail_queued(&address, &mut outbound, &state, kind, &reason);
}

/// Mark the connection dead and fail everything still queued.
fn fail_queued(
    address: &str,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    state: &ConnectionState,
    kind: TransportFailure,
    reason: &str,
) {
    state.mark_closed(kind, reason);
    outbound.close();
    while let Ok(Outbound { reply, .. }) = outbound.try_recv() {
        let _ = reply.send(Err(DispatchError::transport(address, kind, reason)));
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
