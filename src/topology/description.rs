//! Member descriptions and topology snapshots

use crate::endpoint::Endpoint;
use crate::error::{ConnectError, TopologyError};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Role of a replica-set member as seen by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerRole {
    /// Not probed yet
    Unknown,
    /// First probe in flight
    Probing,
    /// Accepts writes
    Primary,
    /// Replicates from the primary
    Secondary,
    /// Last probe failed or timed out
    Unreachable,
}

impl ServerRole {
    /// Whether a probe has produced an outcome for this member
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Primary | Self::Secondary | Self::Unreachable)
    }

    /// Whether the member can serve connections
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Primary | Self::Secondary)
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Probing => "probing",
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Unreachable => "unreachable",
        }
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a probe failed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeFailure {
    /// Monitoring connection could not be established
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Member answered but is not part of the expected replica set
    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// No status reply within the probe timeout
    #[error("no status reply within {0:?}")]
    Timeout(Duration),

    /// Status command failed on an established connection
    #[error("status probe failed: {0}")]
    Status(String),
}

impl ProbeFailure {
    /// Whether probing again may succeed without a configuration change
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Connect(e) => e.kind.is_retriable(),
            Self::Topology(_) => false,
            Self::Timeout(_) | Self::Status(_) => true,
        }
    }
}

/// What the monitor knows about one member
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescription {
    /// Member address
    pub endpoint: Endpoint,
    /// Current role
    pub role: ServerRole,
    /// Smoothed probe round-trip time
    pub round_trip_time: Option<Duration>,
    /// Replica-set name reported by the member
    pub set_name: Option<String>,
    /// Most recent probe failure, cleared by the next success
    pub error: Option<ProbeFailure>,
    /// When the last probe outcome was recorded
    pub last_update: Option<Instant>,
}

impl ServerDescription {
    /// A member that has not been probed
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            role: ServerRole::Unknown,
            round_trip_time: None,
            set_name: None,
            error: None,
            last_update: None,
        }
    }
}

/// Immutable view of the replica set
///
/// Published by the monitor once per probe round. At most one member holds
/// [`ServerRole::Primary`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologyState {
    set_name: Option<String>,
    servers: BTreeMap<Endpoint, ServerDescription>,
    round: u64,
}

impl TopologyState {
    /// Create a state with every seed in [`ServerRole::Unknown`]
    pub fn new(set_name: Option<String>, seeds: impl IntoIterator<Item = Endpoint>) -> Self {
        let servers = seeds
            .into_iter()
            .map(|ep| (ep.clone(), ServerDescription::new(ep)))
            .collect();
        Self {
            set_name,
            servers,
            round: 0,
        }
    }

    /// Expected replica-set name
    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    /// Number of completed probe rounds
    pub fn round(&self) -> u64 {
        self.round
    }

    /// All members, ordered by endpoint
    pub fn servers(&self) -> impl Iterator<Item = &ServerDescription> {
        self.servers.values()
    }

    /// Description of one member
    pub fn server(&self, endpoint: &Endpoint) -> Option<&ServerDescription> {
        self.servers.get(endpoint)
    }

    /// Role of one member
    pub fn role_of(&self, endpoint: &Endpoint) -> Option<ServerRole> {
        self.servers.get(endpoint).map(|s| s.role)
    }

    /// The current primary
    pub fn primary(&self) -> Option<&ServerDescription> {
        self.servers.values().find(|s| s.role == ServerRole::Primary)
    }

    /// Members currently in the secondary role
    pub fn secondaries(&self) -> impl Iterator<Item = &ServerDescription> {
        self.servers
            .values()
            .filter(|s| s.role == ServerRole::Secondary)
    }

    /// Members able to serve connections
    pub fn available(&self) -> impl Iterator<Item = &ServerDescription> {
        self.servers.values().filter(|s| s.role.is_available())
    }

    /// Whether every member has a probe outcome
    pub fn is_settled(&self) -> bool {
        self.servers.values().all(|s| s.role.is_settled())
    }

    /// First non-retriable connect failure recorded for any member
    pub fn fatal_connect_error(&self) -> Option<&ConnectError> {
        self.servers.values().find_map(|s| match &s.error {
            Some(ProbeFailure::Connect(e)) if !e.kind.is_retriable() => Some(e),
            _ => None,
        })
    }

    pub(crate) fn contains(&self, endpoint: &Endpoint) -> bool {
        self.servers.contains_key(endpoint)
    }

    pub(crate) fn insert(&mut self, endpoint: Endpoint) {
        self.servers
            .entry(endpoint.clone())
            .or_insert_with(|| ServerDescription::new(endpoint));
    }

    pub(crate) fn server_mut(&mut self, endpoint: &Endpoint) -> Option<&mut ServerDescription> {
        self.servers.get_mut(endpoint)
    }

    pub(crate) fn advance_round(&mut self) {
        self.round += 1;
    }
}
