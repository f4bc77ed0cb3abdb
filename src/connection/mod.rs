//! Connection management
//!
//! This module handles:
//! * Certificate material loading
//! * Transport abstraction (plain TCP vs TLS)
//! * Connection lifecycle (negotiation, handshake, hello, status)
//! * State machine enforcement
//! * TLS configuration and server identity validation

mod certs;
mod conn;
mod state;
mod tls;
mod transport;

pub use certs::{CertificateBundle, CertificatePaths};
pub use conn::{
    connect, Connection, ConnectionOptions, ConnectionOptionsBuilder, Health, TlsConnector,
    ValidationResult, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_POOL_SIZE,
};
pub use state::ConnectionState;
pub use tls::{
    fingerprint, parse_server_name, HostnameCheck, PeerIdentity, ServerIdentityCheck, TlsConfig,
    TlsConfigBuilder, ValidationMode,
};
pub use transport::Transport;
