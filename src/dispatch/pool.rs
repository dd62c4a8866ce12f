//! Connection pool — one live channel per endpoint address.
//!
//! The pool is the only cross-thread mutable state in the dispatch layer.
//! Every lookup, insert, and removal happens under a single lock, and channels
//! are opened while that lock is held, so two threads racing on a new address
//! end up sharing the one channel the winner opened.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::errors::DispatchError;
use super::transport::{Connector, TcpConnector, Transport};

// ─── ChannelHandle ───────────────────────────────────────────────────────────

/// A pooled connection to one address.
pub struct ChannelHandle {
    id: Uuid,
    address: String,
    transport: Arc<dyn Transport>,
    created_at: DateTime<Utc>,
    /// Leases currently out. Diagnostic only.
    in_use: AtomicUsize,
    /// Leases ever handed out. Diagnostic only.
    acquisitions: AtomicU64,
}

impl ChannelHandle {
    fn new(address: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            id: Uuid::new_v4(),
            address: address.to_string(),
            transport,
            created_at: Utc::now(),
            in_use: AtomicUsize::new(0),
            acquisitions: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_usable(&self) -> bool {
        self.transport.is_usable()
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    fn lease(&self) {
        self.in_use.fetch_add(1, Ordering::Relaxed);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    fn unlease(&self) {
        let _ = self
            .in_use
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("created_at", &self.created_at)
            .field("usable", &self.is_usable())
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// Point-in-time view of one pooled channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub id: Uuid,
    pub address: String,
    pub created_at: DateTime<Utc>,
    pub usable: bool,
    pub in_use: usize,
    pub acquisitions: u64,
}

// ─── ConnectionPool ──────────────────────────────────────────────────────────

/// Process-wide table of `address → channel`.
///
/// Construct once at startup and share as `Arc<ConnectionPool>`; tests build
/// their own with a fake [`Connector`].
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    channels: Mutex<HashMap<String, Arc<ChannelHandle>>>,
    /// Channels ever opened by this pool.
    opened: AtomicU64,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            channels: Mutex::new(HashMap::new()),
            opened: AtomicU64::new(0),
        }
    }

    /// Pool backed by a [`TcpConnector`] with its own I/O runtime.
    pub fn tcp() -> std::io::Result<Self> {
        Ok(Self::new(Arc::new(TcpConnector::new()?)))
    }

    /// The table stays consistent even if a holder panicked: every mutation
    /// is a single insert or remove.
    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<ChannelHandle>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the channel for `address`, opening one if none is usable.
    pub fn acquire(&self, address: &str) -> Result<Arc<ChannelHandle>, DispatchError> {
        let mut table = self.table();

        if let Some(existing) = table.get(address) {
            if existing.is_usable() {
                existing.lease();
                return Ok(Arc::clone(existing));
            }
            tracing::info!(address, channel = %existing.id(), "replacing unusable channel");
            if let Some(stale) = table.remove(address) {
                stale.transport().close();
            }
        }

        let transport = self.connector.open(address)?;
        let handle = Arc::new(ChannelHandle::new(address, transport));
        handle.lease();
        table.insert(address.to_string(), Arc::clone(&handle));
        self.opened.fetch_add(1, Ordering::Relaxed);

        tracing::info!(address, channel = %handle.id(), "opened channel");
        Ok(handle)
    }

    /// Hand a channel back. The connection stays open for reuse.
    pub fn release(&self, handle: &ChannelHandle) {
        handle.unlease();
        tracing::trace!(address = handle.address(), in_use = handle.in_use(), "released channel");
    }

    /// Close and forget the channel for `address`. Returns whether one existed.
    pub fn invalidate(&self, address: &str) -> bool {
        let removed = self.table().remove(address);
        match removed {
            Some(handle) => {
                handle.transport().close();
                tracing::warn!(address, channel = %handle.id(), "invalidated channel");
                true
            }
            None => false,
        }
    }

    /// Like [`invalidate`](Self::invalidate), but only if the pooled entry is
    /// still `handle`; a replacement opened by another caller is left alone.
    pub fn invalidate_handle(&self, handle: &ChannelHandle) -> bool {
        let mut table = self.table();
        let matches = table
            .get(handle.address())
            .is_some_and(|current| current.id() == handle.id());
        if matches {
            table.remove(handle.address());
        }
        drop(table);

        handle.transport().close();
        if matches {
            tracing::warn!(address = handle.address(), channel = %handle.id(), "invalidated channel");
        }
        matches
    }

    /// Whether a usable channel for `address` is pooled.
    pub fn contains_usable(&self, address: &str) -> bool {
        self.table().get(address).is_some_and(|h| h.is_usable())
    }

    /// Number of pooled channels, usable or not.
    pub fn channel_count(&self) -> usize {
        self.table().len()
    }

    /// Channels ever opened by this pool.
    pub fn opened_count(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    /// Snapshot of every pooled channel, sorted by address.
    pub fn stats(&self) -> Vec<ChannelStats> {
        let mut stats: Vec<ChannelStats> = self
            .table()
            .values()
            .map(|h| ChannelStats {
                id: h.id(),
                address: h.address().to_string(),
                created_at: h.created_at(),
                usable: h.is_usable(),
                in_use: h.in_use(),
                acquisitions: h.acquisitions(),
            })
            .collect();
        stats.sort_by(|a, b| a.address.cmp(&b.address));
        stats
    }

    /// Close every channel and empty the pool.
    pub fn close_all(&self) {
        let drained: Vec<Arc<ChannelHandle>> = self.table().drain().map(|(_, h)| h).collect();
        for handle in &drained {
            handle.transport().close();
        }
        if !drained.is_empty() {
            tracing::info!(closed = drained.len(), "closed all channels");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Barrier;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::dispatch::transport::validate_address;
    use crate::dispatch::types::{GenericResponse, TypedPayload};

    /// In-memory transport that can be told to break.
    #[derive(Default)]
    pub(crate) struct FakeTransport {
        pub closed: AtomicBool,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn call(
            &self,
            _method: &str,
            _params: Vec<TypedPayload>,
            _timeout: Option<Duration>,
        ) -> Result<GenericResponse, DispatchError> {
            Ok(GenericResponse::default())
        }

        fn is_usable(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Counts how many transports it opened.
    #[derive(Default)]
    pub(crate) struct CountingConnector {
        pub opened: AtomicUsize,
    }

    impl Connector for CountingConnector {
        fn open(&self, address: &str) -> Result<Arc<dyn Transport>, DispatchError> {
            validate_address(address)?;
            self.opened.fetch_add(1, Ordering::SeqCst);
            // Widen the race window for concurrent acquires.
            std::thread::sleep(Duration::from_millis(5));
            Ok(Arc::new(FakeTransport::default()))
        }
    }

    fn pool() -> (Arc<CountingConnector>, ConnectionPool) {
        let connector = Arc::new(CountingConnector::default());
        let pool = ConnectionPool::new(Arc::clone(&connector) as Arc<dyn Connector>);
        (connector, pool)
    }

    #[test]
    fn test_acquire_reuses_channel() {
        let (connector, pool) = pool();
        let a = pool.acquire("127.0.0.1:50061").unwrap();
        let b = pool.acquire("127.0.0.1:50061").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
        assert_eq!(a.in_use(), 2);
        assert_eq!(pool.channel_count(), 1);
    }

    #[test]
    fn test_distinct_addresses_get_distinct_channels() {
        let (connector, pool) = pool();
        let a = pool.acquire("127.0.0.1:50061").unwrap();
        let b = pool.acquire("127.0.0.1:50062").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
        let addresses: Vec<String> = pool.stats().into_iter().map(|s| s.address).collect();
        assert_eq!(addresses, vec!["127.0.0.1:50061", "127.0.0.1:50062"]);
    }

    #[test]
    fn test_concurrent_acquire_creates_one_channel() {
        let (connector, pool) = pool();
        let pool = Arc::new(pool);
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    pool.acquire("127.0.0.1:50061").unwrap()
                })
            })
            .collect();

        let channels: Vec<Arc<ChannelHandle>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        for channel in &channels[1..] {
            assert!(Arc::ptr_eq(&channels[0], channel));
        }
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.opened_count(), 1);
    }

    #[test]
    fn test_release_keeps_channel_open() {
        let (_, pool) = pool();
        let channel = pool.acquire("127.0.0.1:50061").unwrap();
        pool.release(&channel);
        pool.release(&channel);
        assert_eq!(channel.in_use(), 0);
        assert!(channel.is_usable());
        assert!(pool.contains_usable("127.0.0.1:50061"));
    }

    #[test]
    fn test_invalidate_then_acquire_yields_new_handle() {
        let (connector, pool) = pool();
        let first = pool.acquire("127.0.0.1:50061").unwrap();
        assert!(pool.invalidate("127.0.0.1:50061"));
        assert!(!first.is_usable());
        assert!(!pool.contains_usable("127.0.0.1:50061"));

        let second = pool.acquire("127.0.0.1:50061").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(first.id(), second.id());
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
        assert!(!pool.invalidate("127.0.0.1:9"));
    }

    #[test]
    fn test_unusable_entry_is_replaced_on_acquire() {
        let (connector, pool) = pool();
        let first = pool.acquire("127.0.0.1:50061").unwrap();
        first.transport().close();

        let second = pool.acquire("127.0.0.1:50061").unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
        assert_eq!(pool.channel_count(), 1);
    }

    #[test]
    fn test_invalidate_handle_spares_replacement() {
        let (_, pool) = pool();
        let stale = pool.acquire("127.0.0.1:50061").unwrap();
        pool.invalidate("127.0.0.1:50061");
        let fresh = pool.acquire("127.0.0.1:50061").unwrap();

        assert!(!pool.invalidate_handle(&stale));
        assert!(pool.contains_usable("127.0.0.1:50061"));
        assert!(pool.invalidate_handle(&fresh));
        assert_eq!(pool.channel_count(), 0);
    }

    #[test]
    fn test_bad_address_leaves_pool_empty() {
        let (connector, pool) = pool();
        let err = pool.acquire("no-port-here").unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(pool.channel_count(), 0);
        assert_eq!(connector.opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_close_all() {
        let (_, pool) = pool();
        let a = pool.acquire("127.0.0.1:50061").unwrap();
        let b = pool.acquire("127.0.0.1:50062").unwrap();
        pool.close_all();
        assert_eq!(pool.channel_count(), 0);
        assert!(!a.is_usable());
        assert!(!b.is_usable());
    }
}
