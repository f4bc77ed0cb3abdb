//! Error types

use crate::connection::ValidationMode;
use crate::endpoint::Endpoint;
use crate::protocol::ErrorReply;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed URI or options
    #[error("configuration error: {0}")]
    Config(String),

    /// Certificate material could not be loaded or is inconsistent
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    /// No viable connection could be established to an endpoint
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Replica-set topology condition
    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// Pool misuse or closed pool
    #[error("pool error: {0}")]
    Pool(String),

    /// Malformed frame or unexpected message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered a command with an error reply
    #[error("server rejected {command}: {reply}")]
    ServerRejected {
        /// Command the server refused
        command: &'static str,
        /// Reply as sent by the server
        reply: ErrorReply,
    },

    /// Peer closed the connection
    #[error("connection closed")]
    ConnectionClosed,

    /// Invalid connection state transition
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state description
        expected: String,
        /// Actual state description
        actual: String,
    },

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the caller may reasonably retry the operation (possibly with backoff)
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Connect(e) => e.kind.is_retriable(),
            Error::Topology(TopologyError::NoPrimary { .. }) => true,
            Error::Io(_) | Error::ConnectionClosed => true,
            _ => false,
        }
    }

    /// The connect error kind, if this is a connect error
    pub fn connect_kind(&self) -> Option<ConnectErrorKind> {
        match self {
            Error::Connect(e) => Some(e.kind),
            _ => None,
        }
    }
}

/// Certificate store failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CertificateError {
    /// A referenced file could not be read
    #[error("failed to read certificate file '{}': {reason}", .path.display())]
    Unreadable {
        /// Offending path
        path: PathBuf,
        /// Underlying I/O error text
        reason: String,
    },

    /// Content is not valid PEM or contains malformed items
    #[error("invalid PEM in {source_name}: {reason}")]
    InvalidPem {
        /// Path or description of the source
        source_name: String,
        /// Parse failure detail
        reason: String,
    },

    /// A CA or certificate source contained no certificates
    #[error("no certificates found in {0}")]
    NoCertificates(String),

    /// A client certificate was supplied without a private key
    #[error("client certificate supplied without a private key")]
    MissingKey,

    /// A private key was supplied without a client certificate
    #[error("private key supplied without a client certificate")]
    MissingCertificate,

    /// The private key does not belong to the client certificate
    #[error("private key does not match the client certificate")]
    KeyMismatch,

    /// Key is encrypted and no passphrase was supplied
    #[error("private key is encrypted but no passphrase was supplied")]
    PassphraseRequired,

    /// Key could not be decrypted or loaded
    #[error("unable to load private key: {0}")]
    InvalidKey(String),
}

/// Classification of connect failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectErrorKind {
    /// Peer rejected the handshake (e.g. client certificate refused)
    HandshakeFailed,
    /// Peer certificate does not chain to a trusted CA
    ChainInvalid,
    /// Peer certificate is not valid for the requested host
    HostnameMismatch,
    /// Client and endpoint disagree about TLS
    ProtocolMismatch,
    /// Bounded wait elapsed
    Timeout,
    /// Options are inconsistent for the requested mode
    ConfigInvalid,
    /// Transport-level failure (refused, reset, unreachable)
    Network,
}

impl ConnectErrorKind {
    /// Timeouts and network failures may be retried; validation failures may not
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Network)
    }

    /// Stable lowercase label (used in metrics and logs)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HandshakeFailed => "handshake_failed",
            Self::ChainInvalid => "chain_invalid",
            Self::HostnameMismatch => "hostname_mismatch",
            Self::ProtocolMismatch => "protocol_mismatch",
            Self::Timeout => "timeout",
            Self::ConfigInvalid => "config_invalid",
            Self::Network => "network",
        }
    }
}

impl std::fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure to establish a connection to one endpoint
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("connect to {endpoint} failed [{kind}, validation={mode}]: {detail}")]
pub struct ConnectError {
    /// Target endpoint
    pub endpoint: Endpoint,
    /// Validation mode in effect
    pub mode: ValidationMode,
    /// Failure classification
    pub kind: ConnectErrorKind,
    /// Underlying cause
    pub detail: String,
}

impl ConnectError {
    /// Create a connect error
    pub fn new(
        endpoint: Endpoint,
        mode: ValidationMode,
        kind: ConnectErrorKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            endpoint,
            mode,
            kind,
            detail: detail.into(),
        }
    }
}

/// Topology conditions surfaced to callers
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopologyError {
    /// No member currently holds the primary role
    #[error("no primary available{}", fmt_set_name(.set_name))]
    NoPrimary {
        /// Replica-set name, if known
        set_name: Option<String>,
    },

    /// No member matches the requested read preference
    #[error("no server available for read preference {0}")]
    NoSuitableServer(String),

    /// A member reported a different replica-set name
    #[error("{endpoint} reports replica set '{actual}', expected '{expected}'")]
    SetNameMismatch {
        /// Member endpoint
        endpoint: Endpoint,
        /// Configured set name
        expected: String,
        /// Reported set name
        actual: String,
    },

    /// The monitor has been shut down
    #[error("topology monitor closed")]
    Closed,
}

fn fmt_set_name(set_name: &Option<String>) -> String {
    match set_name {
        Some(name) => format!(" in replica set '{}'", name),
        None => String::new(),
    }
}
