//! Background replica-set monitor
//!
//! One task owns the working [`TopologyState`]. Each round it probes every
//! due member in parallel over a dedicated monitoring connection, applies the
//! outcomes in completion order and publishes one snapshot through a `watch`
//! channel. Readers only ever see whole snapshots.

use super::description::{ProbeFailure, ServerRole, TopologyState};
use super::events::TopologyEvent;
use crate::connection::{Connection, TlsConnector, ValidationMode};
use crate::endpoint::Endpoint;
use crate::error::{ConnectError, ConnectErrorKind, TopologyError};
use crate::protocol::ServerStatus;
use crate::{Error, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;

/// Smoothing factor for round-trip times
const RTT_ALPHA: f64 = 0.2;

const EVENT_CAPACITY: usize = 64;

/// Default interval between probe rounds
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);

/// Monitor settings
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between probe rounds (default: 10 seconds)
    pub heartbeat: Duration,
    /// Bound on connect plus status reply for one probe (default: 5 seconds)
    pub probe_timeout: Duration,
    /// First retry delay for an unreachable member (default: 500ms)
    pub min_backoff: Duration,
    /// Upper bound on the retry delay (default: 30 seconds)
    pub max_backoff: Duration,
    /// Replica-set name members must report, if any
    pub set_name: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat: DEFAULT_HEARTBEAT,
            probe_timeout: Duration::from_secs(5),
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            set_name: None,
        }
    }
}

impl MonitorConfig {
    /// Retry delay after `failures` consecutive failed probes, with jitter
    fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        let delay = self
            .min_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        delay.mul_f64(rand::thread_rng().gen_range(0.8..=1.0))
    }
}

/// Handle to a running topology monitor
///
/// Dropping the handle stops the background task.
pub struct TopologyMonitor {
    state: watch::Receiver<Arc<TopologyState>>,
    events: broadcast::Sender<TopologyEvent>,
    check: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    mode: ValidationMode,
}

impl std::fmt::Debug for TopologyMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyMonitor")
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl TopologyMonitor {
    /// Start monitoring `seeds`
    ///
    /// Must be called from within a Tokio runtime. The first probe round
    /// starts immediately.
    pub fn start(
        seeds: impl IntoIterator<Item = Endpoint>,
        connector: TlsConnector,
        config: MonitorConfig,
    ) -> Self {
        let initial = TopologyState::new(config.set_name.clone(), seeds);
        let (state_tx, state_rx) = watch::channel(Arc::new(initial.clone()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let check = Arc::new(Notify::new());
        let mode = connector.mode();

        let worker = Monitor {
            connector: Arc::new(connector),
            config,
            state: initial,
            members: HashMap::new(),
            publisher: state_tx,
            events: events.clone(),
        };
        let task = tokio::spawn(worker.run(check.clone(), shutdown_rx));

        Self {
            state: state_rx,
            events,
            check,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
            mode,
        }
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<TopologyState> {
        self.state.borrow().clone()
    }

    /// Current primary, if any
    pub fn current_primary(&self) -> Option<Endpoint> {
        self.state.borrow().primary().map(|s| s.endpoint.clone())
    }

    /// Subscribe to topology events
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }

    /// Start a probe round without waiting for the heartbeat
    pub fn request_check(&self) {
        self.check.notify_one();
    }

    /// Wait until `select` returns a value for some published snapshot
    ///
    /// Returns `Ok(None)` if `timeout` elapses first.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::Closed`] if the monitor stops while waiting.
    pub async fn wait_until<T>(
        &self,
        timeout: Duration,
        mut select: impl FnMut(&TopologyState) -> Option<T>,
    ) -> Result<Option<T>> {
        let mut rx = self.state.clone();
        let wait = async {
            loop {
                let found = select(&rx.borrow_and_update());
                if let Some(value) = found {
                    return Ok(value);
                }
                if rx.changed().await.is_err() {
                    return Err(Error::Topology(TopologyError::Closed));
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(value)) => Ok(Some(value)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    /// Wait until a primary is known
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::NoPrimary`] if none is elected within `timeout`.
    pub async fn wait_for_primary(&self, timeout: Duration) -> Result<Endpoint> {
        let found = self
            .wait_until(timeout, |state| state.primary().map(|s| s.endpoint.clone()))
            .await?;
        found.ok_or_else(|| {
            Error::Topology(TopologyError::NoPrimary {
                set_name: self.state.borrow().set_name().map(str::to_owned),
            })
        })
    }

    /// Wait until `endpoint` settles into a role different from its current one
    ///
    /// Transient roles (`unknown`, `probing`) never end the wait. Role change
    /// events are observed individually, so a change that is reverted within
    /// one probe round still ends the wait.
    ///
    /// # Errors
    ///
    /// * [`Error::Config`] if `endpoint` is not a member
    /// * [`ConnectErrorKind::Timeout`] if the role does not change within `timeout`
    /// * [`TopologyError::Closed`] if the monitor stops while waiting
    pub async fn wait_for_role_change(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<ServerRole> {
        let mut events = self.events.subscribe();
        let mut state = self.state.clone();
        let initial = state
            .borrow_and_update()
            .role_of(endpoint)
            .ok_or_else(|| Error::Config(format!("{} is not a replica-set member", endpoint)))?;
        let changed = |role: ServerRole| (role.is_settled() && role != initial).then_some(role);

        let wait = async {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(TopologyEvent::RoleChanged { endpoint: member, to, .. })
                            if &member == endpoint =>
                        {
                            if let Some(role) = changed(to) {
                                return Ok(role);
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            let current = state.borrow().role_of(endpoint);
                            if let Some(role) = current.and_then(changed) {
                                return Ok(role);
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(Error::Topology(TopologyError::Closed))
                        }
                    },
                    published = state.changed() => {
                        if published.is_err() {
                            return Err(Error::Topology(TopologyError::Closed));
                        }
                        let current = state.borrow_and_update().role_of(endpoint);
                        if let Some(role) = current.and_then(changed) {
                            return Ok(role);
                        }
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::Connect(ConnectError::new(
                endpoint.clone(),
                self.mode,
                ConnectErrorKind::Timeout,
                format!("role stayed {} for {:?}", initial, timeout),
            ))),
        }
    }

    /// Stop the monitor and close its monitoring connections
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Per-member bookkeeping private to the monitor task
#[derive(Default)]
struct Member {
    conn: Option<Connection>,
    failures: u32,
    retry_at: Option<Instant>,
}

struct ProbeResult {
    endpoint: Endpoint,
    conn: Option<Connection>,
    outcome: std::result::Result<(ServerStatus, Duration), ProbeFailure>,
}

struct Monitor {
    connector: Arc<TlsConnector>,
    config: MonitorConfig,
    state: TopologyState,
    members: HashMap<Endpoint, Member>,
    publisher: watch::Sender<Arc<TopologyState>>,
    events: broadcast::Sender<TopologyEvent>,
}

impl Monitor {
    async fn run(mut self, check: Arc<Notify>, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(members = self.state.servers().count(), "topology monitor started");

        loop {
            let discovered = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                discovered = self.round() => discovered,
            };

            // Probe newly discovered members right away
            if discovered {
                continue;
            }

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = check.notified() => {}
                _ = tokio::time::sleep(self.config.heartbeat) => {}
            }
        }

        for (_, member) in self.members.drain() {
            if let Some(conn) = member.conn {
                let _ = conn.close().await;
            }
        }
        tracing::debug!("topology monitor stopped");
    }

    /// Run one probe round; returns whether new members were discovered
    async fn round(&mut self) -> bool {
        let now = Instant::now();
        let mut probes = FuturesUnordered::new();
        let mut marked_probing = false;

        let due: Vec<Endpoint> = self
            .state
            .servers()
            .map(|s| s.endpoint.clone())
            .filter(|ep| {
                self.members
                    .get(ep)
                    .and_then(|m| m.retry_at)
                    .map_or(true, |at| at <= now)
            })
            .collect();

        for endpoint in due {
            let conn = self.members.entry(endpoint.clone()).or_default().conn.take();
            if let Some(desc) = self.state.server_mut(&endpoint) {
                if desc.role == ServerRole::Unknown {
                    desc.role = ServerRole::Probing;
                    marked_probing = true;
                }
            }
            probes.push(probe(
                self.connector.clone(),
                endpoint,
                conn,
                self.config.probe_timeout,
            ));
        }

        if marked_probing {
            self.publish();
        }

        let mut discovered = false;
        while let Some(result) = probes.next().await {
            discovered |= self.apply(result);
        }

        self.state.advance_round();
        self.publish();
        discovered
    }

    fn publish(&self) {
        self.publisher.send_replace(Arc::new(self.state.clone()));
    }

    fn emit(&self, event: TopologyEvent) {
        tracing::debug!(?event, "topology event");
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Fold one probe outcome into the working state
    fn apply(&mut self, result: ProbeResult) -> bool {
        let ProbeResult {
            endpoint,
            conn,
            outcome,
        } = result;

        let outcome = outcome.and_then(|(status, rtt)| self.check_set_name(&endpoint, status, rtt));
        match outcome {
            Ok((status, rtt)) => {
                let member = self.members.entry(endpoint.clone()).or_default();
                member.conn = conn;
                member.failures = 0;
                member.retry_at = None;
                self.record_success(&endpoint, &status, rtt);
                self.discover(&status)
            }
            Err(failure) => {
                let member = self.members.entry(endpoint.clone()).or_default();
                member.conn = None;
                member.failures += 1;
                let delay = self.config.backoff(member.failures);
                member.retry_at = Some(Instant::now() + delay);
                tracing::debug!(endpoint = %endpoint, error = %failure, retry_in = ?delay, "probe failed");
                self.record_failure(&endpoint, failure);
                false
            }
        }
    }

    fn check_set_name(
        &self,
        endpoint: &Endpoint,
        status: ServerStatus,
        rtt: Duration,
    ) -> std::result::Result<(ServerStatus, Duration), ProbeFailure> {
        match (&self.config.set_name, &status.set_name) {
            (Some(expected), actual) if actual.as_ref() != Some(expected) => {
                Err(ProbeFailure::Topology(TopologyError::SetNameMismatch {
                    endpoint: endpoint.clone(),
                    expected: expected.clone(),
                    actual: actual.clone().unwrap_or_default(),
                }))
            }
            _ => Ok((status, rtt)),
        }
    }

    fn record_success(&mut self, endpoint: &Endpoint, status: &ServerStatus, rtt: Duration) {
        crate::metrics::counters::probe_completed(crate::metrics::labels::PROBE_OK);
        crate::metrics::histograms::probe_rtt(rtt.as_millis() as u64);

        let role = if status.is_primary {
            ServerRole::Primary
        } else {
            ServerRole::Secondary
        };

        // Most recent probe wins; any other primary waits for reconfirmation
        if role == ServerRole::Primary {
            let stale: Vec<Endpoint> = self
                .state
                .servers()
                .filter(|s| s.role == ServerRole::Primary && &s.endpoint != endpoint)
                .map(|s| s.endpoint.clone())
                .collect();
            for other in stale {
                tracing::info!(demoted = %other, primary = %endpoint, "two primaries reported, demoting older");
                self.set_role(&other, ServerRole::Secondary);
            }
        }

        if let Some(desc) = self.state.server_mut(endpoint) {
            desc.round_trip_time = Some(match desc.round_trip_time {
                Some(prev) => prev.mul_f64(1.0 - RTT_ALPHA) + rtt.mul_f64(RTT_ALPHA),
                None => rtt,
            });
            desc.set_name = status.set_name.clone();
            desc.error = None;
            desc.last_update = Some(Instant::now());
        }
        self.set_role(endpoint, role);
    }

    fn record_failure(&mut self, endpoint: &Endpoint, failure: ProbeFailure) {
        crate::metrics::counters::probe_completed(crate::metrics::labels::PROBE_FAILED);
        let message = failure.to_string();

        let newly_unreachable = match self.state.server_mut(endpoint) {
            Some(desc) => {
                desc.error = Some(failure);
                desc.last_update = Some(Instant::now());
                desc.role != ServerRole::Unreachable
            }
            None => false,
        };

        if newly_unreachable {
            self.set_role(endpoint, ServerRole::Unreachable);
            self.emit(TopologyEvent::Unreachable {
                endpoint: endpoint.clone(),
                error: message,
            });
        }
    }

    fn set_role(&mut self, endpoint: &Endpoint, role: ServerRole) {
        let Some(desc) = self.state.server_mut(endpoint) else {
            return;
        };
        let previous = desc.role;
        if previous == role {
            return;
        }
        desc.role = role;

        tracing::info!(endpoint = %endpoint, from = %previous, to = %role, "member role changed");
        crate::metrics::counters::role_changed(role.as_str());
        self.emit(TopologyEvent::RoleChanged {
            endpoint: endpoint.clone(),
            from: previous,
            to: role,
        });
        if previous == ServerRole::Unreachable && role.is_available() {
            self.emit(TopologyEvent::Joined {
                endpoint: endpoint.clone(),
                role,
            });
        }
        if role == ServerRole::Primary {
            self.emit(TopologyEvent::PrimaryElected {
                endpoint: endpoint.clone(),
            });
        }
    }

    /// Add members named in a status reply's host list
    fn discover(&mut self, status: &ServerStatus) -> bool {
        let mut found = false;
        for host in &status.hosts {
            let endpoint: Endpoint = match host.parse() {
                Ok(ep) => ep,
                Err(e) => {
                    tracing::debug!(host = %host, error = %e, "ignoring unparsable member address");
                    continue;
                }
            };
            if self.state.contains(&endpoint) {
                continue;
            }
            tracing::info!(endpoint = %endpoint, "discovered replica-set member");
            self.state.insert(endpoint.clone());
            self.emit(TopologyEvent::Discovered { endpoint });
            found = true;
        }
        found
    }
}

/// Probe one member, reusing its monitoring connection when it is still alive
async fn probe(
    connector: Arc<TlsConnector>,
    endpoint: Endpoint,
    conn: Option<Connection>,
    timeout: Duration,
) -> ProbeResult {
    let started = Instant::now();
    let attempt = async {
        let mut conn = match conn {
            Some(conn) if conn.is_alive() => conn,
            _ => connector.connect(&endpoint).await.map_err(|e| match e {
                Error::Connect(e) => ProbeFailure::Connect(e),
                other => ProbeFailure::Status(other.to_string()),
            })?,
        };
        let status = conn
            .status()
            .await
            .map_err(|e| ProbeFailure::Status(e.to_string()))?;
        Ok((conn, status))
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok((conn, status))) => ProbeResult {
            endpoint,
            conn: Some(conn),
            outcome: Ok((status, started.elapsed())),
        },
        Ok(Err(failure)) => ProbeResult {
            endpoint,
            conn: None,
            outcome: Err(failure),
        },
        Err(_) => ProbeResult {
            endpoint,
            conn: None,
            outcome: Err(ProbeFailure::Timeout(timeout)),
        },
    }
}
