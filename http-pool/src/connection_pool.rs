//! Thread-safe HTTP/1 connection pool for a single host.
//!
//! The pool owns a fixed number of slots. Each slot is either empty (capacity
//! reserved, nothing connected yet) or holds an idle connection. Acquiring
//! takes a slot, turning an empty one into a fresh unconnected [`Connection`];
//! releasing puts the connection back without waiting.
//!
//! Blocking pools wait for a slot when all of them are checked out, so at most
//! `capacity` connections are ever in use. Non-blocking pools open an overflow
//! connection instead; overflow connections are dropped on release when there
//! is no room for them.
//!
//! A connection is reachable from exactly one caller between acquire and
//! release, so there is no per-connection lock.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::Config;
use crate::error::Error;
use crate::slots::{Slot, Slots};
use crate::transport::{HttpTransport, Transport};
use crate::types::HostAddress;

/// A connection handle checked out of a pool.
///
/// The socket is opened lazily by the first exchange. A handle that took a
/// pool slot gives that slot back as an empty one when it is dropped without
/// being released, so a cancelled request does not shrink the pool.
pub struct Connection<S> {
    id: u64,
    pub(crate) stream: Option<S>,
    /// Set while a slot-backed handle is checked out. Overflow handles and
    /// handles resting in the pool have none.
    home: Option<Arc<Slots<Connection<S>>>>,
}

impl<S> Connection<S> {
    fn new(id: u64) -> Self {
        Self {
            id,
            stream: None,
            home: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Whether this handle occupies one of the pool's slots.
    pub fn is_pooled(&self) -> bool {
        self.home.is_some()
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        if let Some(slots) = self.home.take() {
            tracing::debug!(
                connection = self.id,
                "Connection dropped while checked out, freeing its slot"
            );
            let _ = slots.put(Slot::Empty);
        }
    }
}

/// Advisory counters. Updated with relaxed ordering, so they may lag slightly
/// under contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub connections_created: u64,
    pub requests_served: u64,
    pub idle_slots: usize,
    pub capacity: usize,
}

pub(crate) struct Inner<T: Transport> {
    pub(crate) address: HostAddress,
    pub(crate) timeout: Option<Duration>,
    pub(crate) block: bool,
    pub(crate) transport: T,
    slots: Arc<Slots<Connection<T::Stream>>>,
    connections_created: AtomicU64,
    pub(crate) requests_served: AtomicU64,
}

/// Connection pool for one host. Cloning is cheap and shares the pool.
pub struct ConnectionPool<T: Transport = HttpTransport> {
    pub(crate) inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl ConnectionPool<HttpTransport> {
    pub fn new(config: Config) -> Self {
        Self::with_transport(config, HttpTransport)
    }

    /// Pool for the host of `url`, e.g. `http://host:1234/x`.
    pub fn from_url(url: &str, timeout: Option<Duration>, capacity: usize) -> Result<Self, Error> {
        let mut config = Config::from_url(url)?.with_capacity(capacity);
        config.timeout = timeout;
        Ok(Self::new(config))
    }
}

impl<T: Transport> ConnectionPool<T> {
    pub fn with_transport(config: Config, transport: T) -> Self {
        let address = config.address();

        let capacity = if config.capacity == 0 {
            tracing::warn!(host = %address, "Pool capacity of 0 requested, using 1");
            1
        } else {
            config.capacity
        };

        tracing::debug!(
            host = %address,
            capacity,
            block = config.block,
            timeout = ?config.timeout,
            "Created connection pool"
        );

        Self {
            inner: Arc::new(Inner {
                address,
                timeout: config.timeout,
                block: config.block,
                transport,
                slots: Arc::new(Slots::new(capacity)),
                connections_created: AtomicU64::new(0),
                requests_served: AtomicU64::new(0),
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.address.host
    }

    pub fn port(&self) -> Option<u16> {
        self.inner.address.port
    }

    pub fn address(&self) -> &HostAddress {
        &self.inner.address
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    pub fn capacity(&self) -> usize {
        self.inner.slots.capacity()
    }

    pub fn is_blocking(&self) -> bool {
        self.inner.block
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            connections_created: self.inner.connections_created.load(Ordering::Relaxed),
            requests_served: self.inner.requests_served.load(Ordering::Relaxed),
            idle_slots: self.inner.slots.len(),
            capacity: self.capacity(),
        }
    }

    /// Get a connection, reusing a pooled one if available.
    ///
    /// A blocking pool waits up to `timeout` (forever if `None`) for a slot
    /// and fails with [`Error::AcquireTimeout`]. A non-blocking pool never
    /// waits and ignores `timeout`.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<Connection<T::Stream>, Error> {
        let slot = if self.inner.block {
            let slot = match timeout {
                Some(timeout) => tokio::time::timeout(timeout, self.inner.slots.take())
                    .await
                    .map_err(|_| Error::AcquireTimeout { timeout })?,
                None => self.inner.slots.take().await,
            };
            Some(slot)
        } else {
            self.inner.slots.try_take()
        };

        let mut conn = match slot {
            Some(Slot::Occupied(conn)) => {
                tracing::trace!(
                    host = %self.inner.address,
                    connection = conn.id(),
                    "Reusing pooled connection"
                );
                conn
            }
            Some(Slot::Empty) => self.new_connection(),
            None => {
                tracing::debug!(
                    host = %self.inner.address,
                    "Pool exhausted, opening overflow connection"
                );
                return Ok(self.new_connection());
            }
        };

        conn.home = Some(self.inner.slots.clone());
        Ok(conn)
    }

    fn new_connection(&self) -> Connection<T::Stream> {
        let created = self
            .inner
            .connections_created
            .fetch_add(1, Ordering::Relaxed)
            + 1;

        tracing::debug!(
            host = %self.inner.address,
            connection = created,
            "Starting new HTTP connection"
        );

        Connection::new(created)
    }

    /// Return a connection for reuse.
    ///
    /// If the pool is already full the connection is dropped. This only
    /// happens with overflow connections or racing acquisitions; a new one is
    /// created on demand later.
    pub fn release(&self, mut conn: Connection<T::Stream>) {
        // Resting connections must not point back at the pool that holds them.
        conn.home = None;

        if let Err(slot) = self.inner.slots.put(Slot::Occupied(conn)) {
            let id = slot.into_inner().map(|conn| conn.id());
            tracing::warn!(
                host = %self.inner.address,
                connection = ?id,
                "Connection pool is full, discarding connection"
            );
        }
    }

    /// Close a connection that must not be reused. A slot-backed connection
    /// gives its slot back as an empty one, an overflow connection just goes
    /// away.
    pub async fn discard(&self, mut conn: Connection<T::Stream>) {
        tracing::debug!(
            host = %self.inner.address,
            connection = conn.id(),
            pooled = conn.is_pooled(),
            "Discarding connection"
        );

        if let Some(stream) = conn.stream.take() {
            self.inner.transport.close(stream).await;
        }

        // Dropping frees the slot, if it holds one.
        drop(conn);
    }
}
