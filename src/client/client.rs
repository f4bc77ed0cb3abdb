//! Client implementation

use super::connection_string::ConnectionInfo;
use super::options::{ClientOptions, ResolvedOptions};
use super::read_preference::ReadPreference;
use crate::connection::{TlsConnector, ValidationMode};
use crate::endpoint::Endpoint;
use crate::error::{ConnectError, ConnectErrorKind, TopologyError};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::protocol::ServerStatus;
use crate::topology::{TopologyEvent, TopologyMonitor};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::Instrument;

type Pools = Arc<Mutex<HashMap<Endpoint, ConnectionPool>>>;

fn lock(pools: &Pools) -> MutexGuard<'_, HashMap<Endpoint, ConnectionPool>> {
    pools.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a standalone server or replica set
///
/// Cheap to clone; clones share pools and the topology monitor.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    info: ConnectionInfo,
    connector: TlsConnector,
    pools: Pools,
    topology: Option<TopologyMonitor>,
    read_preference: ReadPreference,
    selection_timeout: Duration,
    standalone_primary: Option<Endpoint>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(watcher) = self
            .watcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("hosts", &self.inner.info.hosts)
            .field("mode", &self.inner.connector.mode())
            .field("read_preference", &self.inner.read_preference)
            .field("replica_set", &self.inner.topology.is_some())
            .finish()
    }
}

impl Client {
    /// Connect using a connection string and options
    ///
    /// A single host without a replica-set name is connected directly. Several
    /// hosts, or a replica-set name given by the `replicaSet` parameter or by
    /// [`ClientOptions`], start a topology monitor and connect to a member
    /// matching the read preference.
    ///
    /// A non-retriable failure (certificate, hostname or protocol) recorded
    /// against a member ends the initial connect early when no member matches
    /// the read preference. After connecting, selection keeps waiting for the
    /// monitor instead.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # async fn example() -> docwire::Result<()> {
    /// use docwire::{Client, ClientOptions};
    ///
    /// // Standalone, plaintext
    /// let client = Client::connect("mongodb://localhost:27017/app", ClientOptions::default()).await?;
    ///
    /// // Replica set over TLS with a client certificate
    /// let options = ClientOptions::builder()
    ///     .ssl_ca_path("/etc/docwire/ca.pem")
    ///     .ssl_cert_path("/etc/docwire/client.pem")
    ///     .build();
    /// let client = Client::connect(
    ///     "mongodb://db1:27017,db2:27017/app?ssl=true&replicaSet=rs",
    ///     options,
    /// )
    /// .await?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// * [`Error::Config`] for a malformed URI or options
    /// * [`Error::Certificate`] if certificate material cannot be loaded
    /// * [`ConnectErrorKind::ConfigInvalid`] if TLS validation is requested without a CA
    /// * [`Error::Connect`] or [`Error::Topology`] if no suitable member answers
    pub async fn connect(uri: &str, options: ClientOptions) -> Result<Self> {
        let info = ConnectionInfo::parse(uri)?;
        let resolved = options.resolve(&info);
        let mode = resolved.connection.effective_mode();
        let first = info
            .hosts
            .first()
            .cloned()
            .ok_or_else(|| Error::Config("connection string names no hosts".into()))?;

        let bundle = if resolved.connection.tls {
            options.certificate_bundle()?
        } else {
            crate::connection::CertificateBundle::empty()
        };
        let connector =
            TlsConnector::new(&bundle, resolved.connection.clone()).map_err(|e| match e {
                Error::Config(msg) => Error::Connect(ConnectError::new(
                    first.clone(),
                    mode,
                    ConnectErrorKind::ConfigInvalid,
                    msg,
                )),
                other => other,
            })?;

        let span = tracing::info_span!("client_connect", hosts = info.hosts.len(), mode = %mode);
        // A set name from either the URI or the options selects replica-set mode
        if info.hosts.len() > 1 || resolved.monitor.set_name.is_some() {
            Self::connect_replica_set(info, connector, resolved)
                .instrument(span)
                .await
        } else {
            Self::connect_standalone(info, first, connector, resolved)
                .instrument(span)
                .await
        }
    }

    async fn connect_standalone(
        info: ConnectionInfo,
        endpoint: Endpoint,
        connector: TlsConnector,
        resolved: ResolvedOptions,
    ) -> Result<Self> {
        let pool = ConnectionPool::new(endpoint.clone(), connector.clone());
        let conn = pool.acquire().await?;
        let standalone_primary = conn.server_status().is_primary.then(|| endpoint.clone());
        drop(conn);

        let pools: Pools = Arc::new(Mutex::new(HashMap::from([(endpoint.clone(), pool)])));
        tracing::info!(endpoint = %endpoint, "connected to standalone server");

        Ok(Self {
            inner: Arc::new(ClientInner {
                info,
                connector,
                pools,
                topology: None,
                read_preference: resolved.read_preference,
                selection_timeout: resolved.server_selection_timeout,
                standalone_primary,
                watcher: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    async fn connect_replica_set(
        info: ConnectionInfo,
        connector: TlsConnector,
        resolved: ResolvedOptions,
    ) -> Result<Self> {
        let monitor =
            TopologyMonitor::start(info.hosts.clone(), connector.clone(), resolved.monitor.clone());
        let pools: Pools = Arc::new(Mutex::new(HashMap::new()));

        let target = match select_server(
            &monitor,
            resolved.read_preference,
            resolved.server_selection_timeout,
            Selection::FailFast,
        )
        .await
        {
            Ok(target) => target,
            Err(e) => {
                monitor.close().await;
                return Err(e);
            }
        };

        let pool = ConnectionPool::new(target.clone(), connector.clone());
        if let Err(e) = pool.acquire().await {
            monitor.close().await;
            return Err(e);
        }
        lock(&pools).insert(target.clone(), pool);

        let watcher = tokio::spawn(clear_unreachable(monitor.subscribe(), pools.clone()));
        tracing::info!(endpoint = %target, read_preference = %resolved.read_preference, "connected to replica set");

        Ok(Self {
            inner: Arc::new(ClientInner {
                info,
                connector,
                pools,
                topology: Some(monitor),
                read_preference: resolved.read_preference,
                selection_timeout: resolved.server_selection_timeout,
                standalone_primary: None,
                watcher: Mutex::new(Some(watcher)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Pool("client is closed".into()));
        }
        Ok(())
    }

    fn pool_for(&self, endpoint: &Endpoint) -> ConnectionPool {
        lock(&self.inner.pools)
            .entry(endpoint.clone())
            .or_insert_with(|| ConnectionPool::new(endpoint.clone(), self.inner.connector.clone()))
            .clone()
    }

    /// Check out a connection to a member matching the read preference
    ///
    /// Waits up to the server selection timeout for such a member.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.ensure_open()?;
        let target = match &self.inner.topology {
            Some(monitor) => {
                select_server(
                    monitor,
                    self.inner.read_preference,
                    self.inner.selection_timeout,
                    Selection::Wait,
                )
                .await?
            }
            None => self.inner.info.hosts[0].clone(),
        };
        self.pool_for(&target).acquire().await
    }

    /// Check out a connection to a specific member
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `endpoint` is not part of this client's topology.
    pub async fn acquire_from(&self, endpoint: &Endpoint) -> Result<PooledConnection> {
        self.ensure_open()?;
        let known = match &self.inner.topology {
            Some(monitor) => monitor.snapshot().server(endpoint).is_some(),
            None => self.inner.info.hosts.contains(endpoint),
        };
        if !known {
            return Err(Error::Config(format!(
                "{} is not part of this client's topology",
                endpoint
            )));
        }
        self.pool_for(endpoint).acquire().await
    }

    /// Issue a status command on a pooled connection
    pub async fn status(&self) -> Result<ServerStatus> {
        let mut conn = self.acquire().await?;
        conn.status().await
    }

    /// Current primary
    ///
    /// For a standalone server this is the server itself if it reported
    /// itself primary when connecting.
    pub fn current_primary(&self) -> Option<Endpoint> {
        match &self.inner.topology {
            Some(monitor) => monitor.current_primary(),
            None => self.inner.standalone_primary.clone(),
        }
    }

    /// Topology monitor (replica sets only)
    pub fn topology(&self) -> Option<&TopologyMonitor> {
        self.inner.topology.as_ref()
    }

    /// Seed endpoints from the connection string
    pub fn hosts(&self) -> &[Endpoint] {
        &self.inner.info.hosts
    }

    /// Database named in the connection string
    pub fn database(&self) -> Option<&str> {
        self.inner.info.database.as_deref()
    }

    /// Validation mode in effect
    pub fn mode(&self) -> ValidationMode {
        self.inner.connector.mode()
    }

    /// Read preference in effect
    pub fn read_preference(&self) -> ReadPreference {
        self.inner.read_preference
    }

    /// Pool for `endpoint`, if one has been created
    pub fn pool(&self, endpoint: &Endpoint) -> Option<ConnectionPool> {
        lock(&self.inner.pools).get(endpoint).cloned()
    }

    /// Stop monitoring and close every pool
    ///
    /// Connections still checked out are dropped when released.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let watcher = self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        if let Some(monitor) = &self.inner.topology {
            monitor.close().await;
        }
        let pools: Vec<ConnectionPool> = lock(&self.inner.pools).drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.close();
        }
        tracing::info!("client closed");
    }
}

/// How server selection treats members that failed with a non-retriable error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection {
    /// Initial connect: give up on a fatal error once no member matches
    FailFast,
    /// Steady state: wait out failures while the monitor keeps probing
    Wait,
}

/// Wait for a member matching `preference`
async fn select_server(
    monitor: &TopologyMonitor,
    preference: ReadPreference,
    timeout: Duration,
    selection: Selection,
) -> Result<Endpoint> {
    let selected = monitor
        .wait_until(timeout, |state| {
            if let Some(endpoint) = preference.select(state) {
                return Some(Ok(endpoint));
            }
            match selection {
                Selection::FailFast => state.fatal_connect_error().cloned().map(Err),
                Selection::Wait => None,
            }
        })
        .await?;

    match selected {
        Some(Ok(endpoint)) => Ok(endpoint),
        Some(Err(fatal)) => Err(Error::Connect(fatal)),
        None => {
            let snapshot = monitor.snapshot();
            let err = match preference {
                ReadPreference::Primary => TopologyError::NoPrimary {
                    set_name: snapshot.set_name().map(str::to_owned),
                },
                other => TopologyError::NoSuitableServer(other.to_string()),
            };
            Err(err.into())
        }
    }
}

/// Drop idle connections to members the monitor marks unreachable
async fn clear_unreachable(
    mut events: tokio::sync::broadcast::Receiver<TopologyEvent>,
    pools: Pools,
) {
    loop {
        match events.recv().await {
            Ok(TopologyEvent::Unreachable { endpoint, .. }) => {
                let pool = lock(&pools).get(&endpoint).cloned();
                if let Some(pool) = pool {
                    let cleared = pool.clear();
                    tracing::debug!(endpoint = %endpoint, cleared, "cleared pool of unreachable member");
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "topology event receiver lagged");
            }
            Err(RecvError::Closed) => return,
        }
    }
}
