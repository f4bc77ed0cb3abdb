//! Per-endpoint connection pooling
//!
//! A [`ConnectionPool`] bounds the number of live connections to one endpoint
//! with a semaphore. Each [`PooledConnection`] owns a permit; dropping it (or
//! passing it to [`ConnectionPool::release`]) returns a healthy connection to
//! the idle set and frees the permit, so concurrent callers never share a
//! connection. With a bound of one, callers serialize on a single connection.

use crate::connection::{Connection, TlsConnector};
use crate::endpoint::Endpoint;
use crate::error::{ConnectError, ConnectErrorKind};
use crate::{Error, Result};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Snapshot of a pool's occupancy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    /// Endpoint served by the pool
    pub endpoint: Endpoint,
    /// Connections waiting in the idle set
    pub idle: usize,
    /// Permits currently held (connections checked out or being established)
    pub in_use: usize,
    /// Upper bound on connections
    pub max_size: usize,
    /// Whether the pool has been closed
    pub closed: bool,
}

struct PoolInner {
    endpoint: Endpoint,
    connector: TlsConnector,
    idle: Mutex<Vec<Connection>>,
    semaphore: Arc<Semaphore>,
    max_size: usize,
    acquire_timeout: Duration,
    closed: AtomicBool,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, Vec<Connection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn return_connection(&self, conn: Connection) {
        if self.closed.load(Ordering::Acquire) {
            tracing::debug!(endpoint = %self.endpoint, id = conn.id(), "pool closed, dropping connection");
            crate::metrics::counters::pool_discarded(crate::metrics::labels::DISCARD_CLOSED);
            return;
        }
        if !conn.is_alive() {
            tracing::debug!(endpoint = %self.endpoint, id = conn.id(), "discarding broken connection");
            crate::metrics::counters::pool_discarded(crate::metrics::labels::DISCARD_BROKEN);
            return;
        }

        let mut idle = self.idle();
        if idle.len() < self.max_size {
            idle.push(conn);
        }
    }
}

/// A bounded pool of connections to a single endpoint
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.inner.endpoint)
            .field("max_size", &self.inner.max_size)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl ConnectionPool {
    /// Create a pool for `endpoint`
    ///
    /// The bound and the acquire timeout come from the connector's options
    /// (`max_pool_size` and `connect_timeout`).
    pub fn new(endpoint: Endpoint, connector: TlsConnector) -> Self {
        let max_size = connector.options().max_pool_size.max(1);
        let acquire_timeout = connector.options().connect_timeout;

        Self {
            inner: Arc::new(PoolInner {
                endpoint,
                connector,
                idle: Mutex::new(Vec::new()),
                semaphore: Arc::new(Semaphore::new(max_size)),
                max_size,
                acquire_timeout,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Endpoint served by this pool
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Check out a connection
    ///
    /// Reuses an idle connection when one is available, otherwise establishes
    /// a new one. Waits while the pool is at its bound.
    ///
    /// # Errors
    ///
    /// * [`ConnectErrorKind::Timeout`] if no connection is ready within the
    ///   timeout, counting both the wait for a free slot and connecting
    /// * [`Error::Pool`] if the pool is closed
    /// * any connect error when a new connection cannot be established
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }

        // One deadline covers both the wait for a permit and any new connection
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + inner.acquire_timeout;
        let permit = match tokio::time::timeout_at(
            deadline,
            inner.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(self.closed_error()),
            Err(_) => {
                crate::metrics::counters::pool_timeout();
                return Err(self.timeout_error("no pooled connection available"));
            }
        };
        crate::metrics::histograms::pool_wait_duration(started.elapsed().as_millis() as u64);

        loop {
            let candidate = inner.idle().pop();
            match candidate {
                Some(conn) if conn.is_alive() => {
                    tracing::trace!(endpoint = %inner.endpoint, id = conn.id(), "reusing idle connection");
                    return Ok(self.wrap(conn, permit));
                }
                Some(conn) => {
                    tracing::debug!(endpoint = %inner.endpoint, id = conn.id(), "dropping dead idle connection");
                    crate::metrics::counters::pool_discarded(crate::metrics::labels::DISCARD_BROKEN);
                }
                None => break,
            }
        }

        // The permit is held while connecting, so the bound covers in-flight attempts too
        match tokio::time::timeout_at(deadline, inner.connector.connect(&inner.endpoint)).await {
            Ok(conn) => Ok(self.wrap(conn?, permit)),
            Err(_) => {
                crate::metrics::counters::pool_timeout();
                Err(self.timeout_error("no connection established"))
            }
        }
    }

    fn timeout_error(&self, what: &str) -> Error {
        ConnectError::new(
            self.inner.endpoint.clone(),
            self.inner.connector.mode(),
            ConnectErrorKind::Timeout,
            format!("{} within {:?}", what, self.inner.acquire_timeout),
        )
        .into()
    }

    fn wrap(&self, conn: Connection, permit: OwnedSemaphorePermit) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            _permit: permit,
        }
    }

    fn closed_error(&self) -> Error {
        Error::Pool(format!("pool for {} is closed", self.inner.endpoint))
    }

    /// Return a connection to the pool
    ///
    /// Broken connections are discarded instead of rejoining the idle set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Pool`] if the connection was checked out from a
    /// different pool. The connection then goes back to the pool it came from.
    pub fn release(&self, conn: PooledConnection) -> Result<()> {
        if !Arc::ptr_eq(&conn.pool, &self.inner) {
            let owner = conn.pool.endpoint.clone();
            return Err(Error::Pool(format!(
                "connection from pool {} released into pool {}",
                owner, self.inner.endpoint
            )));
        }
        drop(conn);
        Ok(())
    }

    /// Drop all idle connections, returning how many were dropped
    ///
    /// Checked-out connections are unaffected.
    pub fn clear(&self) -> usize {
        let drained: Vec<Connection> = self.inner.idle().drain(..).collect();
        if !drained.is_empty() {
            tracing::debug!(endpoint = %self.inner.endpoint, count = drained.len(), "cleared idle connections");
        }
        drained.len()
    }

    /// Close the pool
    ///
    /// Pending and future acquires fail; connections still checked out are
    /// dropped when they are released.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.semaphore.close();
        self.clear();
        tracing::debug!(endpoint = %self.inner.endpoint, "pool closed");
    }

    /// Whether the pool has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Current occupancy
    pub fn status(&self) -> PoolStatus {
        let closed = self.is_closed();
        let in_use = if closed {
            0
        } else {
            self.inner.max_size - self.inner.semaphore.available_permits()
        };
        PoolStatus {
            endpoint: self.inner.endpoint.clone(),
            idle: self.inner.idle().len(),
            in_use,
            max_size: self.inner.max_size,
            closed,
        }
    }
}

/// A connection checked out of a [`ConnectionPool`]
///
/// Dereferences to [`Connection`]. Returned to its pool on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    // Released after `conn` has been returned (fields drop in declaration order after Drop::drop)
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Endpoint of the owning pool
    pub fn pool_endpoint(&self) -> &Endpoint {
        &self.pool.endpoint
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("pool", &self.pool.endpoint)
            .finish()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only taken in Drop
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection accessed after release"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection accessed after release"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_connection(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{CertificateBundle, ConnectionOptions};
    use crate::test_support::MockServer;

    fn pool(endpoint: Endpoint, max_pool_size: usize) -> ConnectionPool {
        let options = ConnectionOptions::builder()
            .tls(false)
            .max_pool_size(max_pool_size)
            .connect_timeout(Duration::from_millis(500))
            .build();
        let connector = TlsConnector::new(&CertificateBundle::empty(), options).unwrap();
        ConnectionPool::new(endpoint, connector)
    }

    #[tokio::test]
    async fn test_acquire_and_reuse() {
        let server = MockServer::primary().await;
        let endpoint = server.endpoint();
        let pool = pool(endpoint, 4);

        let conn = pool.acquire().await.unwrap();
        let id = conn.id();
        assert!(conn.is_alive());
        assert_eq!(pool.status().in_use, 1);
        pool.release(conn).unwrap();

        let status = pool.status();
        assert_eq!(status.idle, 1);
        assert_eq!(status.in_use, 0);

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.id(), id);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_get_distinct_connections() {
        let server = MockServer::primary().await;
        let endpoint = server.endpoint();
        let pool = pool(endpoint, 4);

        let (a, b) = tokio::join!(pool.acquire(), pool.acquire());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.status().in_use, 2);
    }

    #[tokio::test]
    async fn test_single_connection_pool_serializes() {
        let server = MockServer::primary().await;
        let endpoint = server.endpoint();
        let pool = pool(endpoint, 1);

        let first = pool.acquire().await.unwrap();
        let first_id = first.id();

        // Second acquire must wait while the first is held
        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(blocked.is_err());

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| c.id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);

        let second_id = waiter.await.unwrap().unwrap();
        assert_eq!(second_id, first_id);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let server = MockServer::primary().await;
        let endpoint = server.endpoint();
        let pool = pool(endpoint, 1);

        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.connect_kind(), Some(ConnectErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_acquire_timeout_covers_wait_and_connect() {
        // Accepts connections and never answers the negotiation preamble
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        let silent = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                open.push(socket);
            }
        });

        let options = ConnectionOptions::builder()
            .tls(false)
            .max_pool_size(1)
            .connect_timeout(Duration::from_millis(400))
            .build();
        let connector = TlsConnector::new(&CertificateBundle::empty(), options).unwrap();
        let pool = ConnectionPool::new(endpoint, connector);

        // Occupy the only slot for most of the timeout
        let held = pool.inner.semaphore.clone().acquire_owned().await.unwrap();
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            drop(held);
        });

        let started = Instant::now();
        let err = pool.acquire().await.unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err.connect_kind(), Some(ConnectErrorKind::Timeout));
        assert!(elapsed >= Duration::from_millis(350), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(600), "{:?}", elapsed);
        assert_eq!(pool.status().in_use, 0);

        releaser.await.unwrap();
        silent.abort();
    }

    #[tokio::test]
    async fn test_broken_connection_is_discarded() {
        let server = MockServer::primary().await;
        let endpoint = server.endpoint();
        let pool = pool(endpoint, 2);

        let mut conn = pool.acquire().await.unwrap();
        let id = conn.id();
        conn.mark_broken();
        pool.release(conn).unwrap();
        assert_eq!(pool.status().idle, 0);

        let fresh = pool.acquire().await.unwrap();
        assert_ne!(fresh.id(), id);
    }

    #[tokio::test]
    async fn test_release_into_foreign_pool_is_rejected() {
        let server = MockServer::primary().await;
        let endpoint = server.endpoint();
        let pool_a = pool(endpoint.clone(), 2);
        let pool_b = pool(endpoint, 2);

        let conn = pool_a.acquire().await.unwrap();
        let err = pool_b.release(conn).unwrap_err();
        assert!(matches!(err, Error::Pool(_)));

        assert_eq!(pool_b.status().idle, 0);
        assert_eq!(pool_b.status().in_use, 0);
        // Went home instead
        assert_eq!(pool_a.status().idle, 1);
        assert_eq!(pool_a.status().in_use, 0);
    }

    #[tokio::test]
    async fn test_clear_and_close() {
        let server = MockServer::primary().await;
        let endpoint = server.endpoint();
        let pool = pool(endpoint, 2);

        let conn = pool.acquire().await.unwrap();
        drop(conn);
        assert_eq!(pool.clear(), 1);
        assert_eq!(pool.status().idle, 0);

        let held = pool.acquire().await.unwrap();
        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await, Err(Error::Pool(_))));

        drop(held);
        assert_eq!(pool.status().idle, 0);
    }

    #[tokio::test]
    async fn test_status_command_through_pool() {
        let server = MockServer::primary().await;
        let endpoint = server.endpoint();
        let pool = pool(endpoint, 1);

        let mut conn = pool.acquire().await.unwrap();
        let status = conn.status().await.unwrap();
        assert!(status.is_primary);
        assert!(conn.is_alive());
    }
}
