//! Protocol message types

use serde::{Deserialize, Serialize};

/// Negotiation preamble sent before anything else on a fresh socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRequest {
    /// Client wants to upgrade to TLS
    Tls,
    /// Client wants to stay in plaintext
    Plaintext,
}

/// Server's single-byte answer to the negotiation preamble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationResponse {
    /// TLS handshake follows
    AcceptTls,
    /// Server does not offer TLS
    TlsUnavailable,
    /// Plaintext accepted
    AcceptPlaintext,
    /// Server only accepts TLS
    TlsRequired,
}

/// Frontend message (client → server)
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendMessage {
    /// Initial hello carrying client metadata
    Hello(ClientMetadata),

    /// Status probe (heartbeat)
    Status,

    /// Terminate message
    Terminate,
}

/// Backend message (server → client)
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    /// Server status (reply to hello and status)
    Status(ServerStatus),

    /// Error reply
    Error(ErrorReply),
}

/// Client metadata sent in the hello message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetadata {
    /// Client library name
    pub driver: String,
    /// Client library version
    pub version: String,
    /// Protocol version
    pub protocol_version: i32,
    /// Replica set the client expects, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_set: Option<String>,
}

impl Default for ClientMetadata {
    fn default() -> Self {
        Self {
            driver: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: super::constants::PROTOCOL_VERSION,
            replica_set: None,
        }
    }
}

/// Server status document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerStatus {
    /// This member is the primary
    pub is_primary: bool,
    /// This member is a secondary
    pub secondary: bool,
    /// Replica-set name (absent for standalone servers)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_name: Option<String>,
    /// Members known to this server (`host:port`)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    /// Primary as seen by this server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,
    /// This server's own address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub me: Option<String>,
}

/// Error reply fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorReply {
    /// Numeric error code
    pub code: i32,
    /// Human-readable message
    pub message: String,
}

impl std::fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}
