//! Core connection type and connector

use super::certs::CertificateBundle;
use super::state::ConnectionState;
use super::tls::{classify_tls_error, HostnameCheck, PeerIdentity, TlsConfig, ValidationMode};
use super::transport::Transport;
use crate::endpoint::Endpoint;
use crate::error::{ConnectError, ConnectErrorKind};
use crate::protocol::{
    decode_message, decode_negotiation_response, encode_message, encode_negotiation,
    BackendMessage, ClientMetadata, FrontendMessage, NegotiationRequest, NegotiationResponse,
    ServerStatus,
};
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::Instrument;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Default bound on connections per endpoint
pub const DEFAULT_MAX_POOL_SIZE: usize = 100;

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection options
///
/// Immutable for the lifetime of the connections created with them.
/// Use `ConnectionOptions::builder()` to override defaults.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Whether to negotiate TLS (default: true)
    pub tls: bool,
    /// Server certificate validation mode (default: validate-ca-and-hostname)
    pub validation: ValidationMode,
    /// Hostname comparison strategy
    pub hostname_check: HostnameCheck,
    /// Maximum connections per endpoint, at least 1 (default: 100)
    pub max_pool_size: usize,
    /// Bound on connect and pool acquire waits (default: 10 seconds)
    pub connect_timeout: Duration,
    /// Replica set announced in the hello message
    pub replica_set: Option<String>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            tls: true,
            validation: ValidationMode::default(),
            hostname_check: HostnameCheck::Default,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            replica_set: None,
        }
    }
}

impl ConnectionOptions {
    /// Create a builder for connection options
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let options = ConnectionOptions::builder()
    ///     .validation(ValidationMode::ValidateCa)
    ///     .max_pool_size(1)
    ///     .connect_timeout(Duration::from_secs(2))
    ///     .build();
    /// ```
    pub fn builder() -> ConnectionOptionsBuilder {
        ConnectionOptionsBuilder {
            options: ConnectionOptions::default(),
        }
    }

    /// Plaintext options (no TLS)
    pub fn plaintext() -> Self {
        Self {
            tls: false,
            ..Default::default()
        }
    }

    /// Validation mode as it applies to this connection (plaintext counts as `skip`)
    pub fn effective_mode(&self) -> ValidationMode {
        if self.tls {
            self.validation
        } else {
            ValidationMode::Skip
        }
    }
}

/// Builder for [`ConnectionOptions`]
#[derive(Debug, Clone)]
pub struct ConnectionOptionsBuilder {
    options: ConnectionOptions,
}

impl ConnectionOptionsBuilder {
    /// Enable or disable TLS
    pub fn tls(mut self, enabled: bool) -> Self {
        self.options.tls = enabled;
        self
    }

    /// Set the validation mode
    pub fn validation(mut self, mode: ValidationMode) -> Self {
        self.options.validation = mode;
        self
    }

    /// Set the hostname comparison strategy
    pub fn hostname_check(mut self, check: HostnameCheck) -> Self {
        self.options.hostname_check = check;
        self
    }

    /// Set the per-endpoint pool bound (values below 1 are raised to 1)
    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.options.max_pool_size = size.max(1);
        self
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, duration: Duration) -> Self {
        self.options.connect_timeout = duration;
        self
    }

    /// Announce a replica set name in the hello message
    pub fn replica_set(mut self, name: impl Into<String>) -> Self {
        self.options.replica_set = Some(name.into());
        self
    }

    /// Build the options
    pub fn build(self) -> ConnectionOptions {
        self.options
    }
}

/// Outcome of server certificate validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    /// The peer certificate was verified (chain, and hostname if requested)
    Passed,
    /// No verification took place (`skip` mode or plaintext)
    Skipped,
}

/// Connection health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// Usable
    Alive,
    /// The channel failed; the connection must be discarded
    Broken,
}

/// Server connection
pub struct Connection {
    id: u64,
    endpoint: Endpoint,
    transport: Option<Transport>,
    state: ConnectionState,
    read_buf: BytesMut,
    validation: ValidationResult,
    health: Health,
    server_status: ServerStatus,
    peer_identity: Option<PeerIdentity>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("validation", &self.validation)
            .field("health", &self.health)
            .field("transport", &self.transport)
            .finish()
    }
}

impl Connection {
    fn new(endpoint: Endpoint, transport: Transport) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            transport: Some(transport),
            state: ConnectionState::Initial,
            read_buf: BytesMut::with_capacity(8192),
            validation: ValidationResult::Skipped,
            health: Health::Alive,
            server_status: ServerStatus::default(),
            peer_identity: None,
        }
    }

    /// Process-unique connection id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Endpoint this connection is attached to
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Certificate validation outcome
    pub fn validation(&self) -> ValidationResult {
        self.validation
    }

    /// Current health
    pub fn health(&self) -> Health {
        self.health
    }

    /// Whether the connection is usable
    pub fn is_alive(&self) -> bool {
        self.health == Health::Alive && self.state == ConnectionState::Ready
    }

    /// Mark the connection unusable; the pool will discard it on release
    pub fn mark_broken(&mut self) {
        self.health = Health::Broken;
    }

    /// Whether the channel is TLS-encrypted
    pub fn is_encrypted(&self) -> bool {
        self.transport.as_ref().is_some_and(Transport::is_encrypted)
    }

    /// Server status from the most recent hello or status reply
    pub fn server_status(&self) -> &ServerStatus {
        &self.server_status
    }

    /// Identity of the server certificate (TLS only)
    pub fn peer_identity(&self) -> Option<&PeerIdentity> {
        self.peer_identity.as_ref()
    }

    /// Send the negotiation preamble and read the server's answer
    async fn negotiate(&mut self, request: NegotiationRequest) -> Result<NegotiationResponse> {
        self.state.transition(ConnectionState::Negotiating)?;

        let preamble = encode_negotiation(request);
        let transport = self.transport_mut()?;
        transport.write_all(&preamble).await?;
        transport.flush().await?;

        let byte = transport.read_u8().await.map_err(|e| match e {
            Error::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            other => other,
        })?;
        let response = decode_negotiation_response(byte)?;
        tracing::debug!(?request, ?response, "negotiation complete");
        Ok(response)
    }

    /// Upgrade to TLS (state must be `Negotiating`)
    async fn handshake(&mut self, tls: &TlsConfig) -> Result<()> {
        self.state.transition(ConnectionState::Handshaking)?;

        let transport = self.transport.take().ok_or(Error::ConnectionClosed)?;
        let upgraded = transport.upgrade_to_tls(tls, self.endpoint.host()).await?;
        self.peer_identity = upgraded.peer_identity();
        self.transport = Some(upgraded);
        self.validation = if tls.mode().checks_chain() {
            ValidationResult::Passed
        } else {
            ValidationResult::Skipped
        };
        tracing::debug!(mode = %tls.mode(), "TLS handshake complete");
        Ok(())
    }

    /// Exchange hello / status reply
    async fn hello(&mut self, metadata: ClientMetadata) -> Result<()> {
        self.state.transition(ConnectionState::AwaitingHello)?;
        self.send_message(&FrontendMessage::Hello(metadata)).await?;

        match self.receive_message().await? {
            BackendMessage::Status(status) => {
                self.server_status = status;
                self.state.transition(ConnectionState::Ready)?;
                Ok(())
            }
            BackendMessage::Error(reply) => Err(Error::ServerRejected {
                command: "hello",
                reply,
            }),
        }
    }

    /// Issue a status command and return the reply
    ///
    /// Any transport or protocol failure marks the connection broken.
    pub async fn status(&mut self) -> Result<ServerStatus> {
        if self.state != ConnectionState::Ready {
            return Err(Error::InvalidState {
                expected: ConnectionState::Ready.to_string(),
                actual: self.state.to_string(),
            });
        }
        self.state.transition(ConnectionState::CommandInProgress)?;

        let result = async {
            self.send_message(&FrontendMessage::Status).await?;
            match self.receive_message().await? {
                BackendMessage::Status(status) => Ok(status),
                BackendMessage::Error(reply) => Err(Error::ServerRejected {
                    command: "status",
                    reply,
                }),
            }
        }
        .await;

        match result {
            Ok(status) => {
                self.server_status = status.clone();
                self.state.transition(ConnectionState::Ready)?;
                Ok(status)
            }
            Err(e) => {
                self.mark_broken();
                self.state.transition(ConnectionState::Closed)?;
                Err(e)
            }
        }
    }

    fn transport_mut(&mut self) -> Result<&mut Transport> {
        self.transport.as_mut().ok_or(Error::ConnectionClosed)
    }

    /// Send a frontend message
    async fn send_message(&mut self, msg: &FrontendMessage) -> Result<()> {
        let buf = encode_message(msg)?;
        let transport = self.transport_mut()?;
        transport.write_all(&buf).await?;
        transport.flush().await?;
        Ok(())
    }

    /// Receive a backend message
    async fn receive_message(&mut self) -> Result<BackendMessage> {
        loop {
            match decode_message(&mut self.read_buf) {
                Ok((msg, consumed)) => {
                    self.read_buf.advance(consumed);
                    return Ok(msg);
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {}
                Err(e) => return Err(Error::Protocol(e.to_string())),
            }

            // Need more data
            let transport = self
                .transport
                .as_mut()
                .ok_or(Error::ConnectionClosed)?;
            let n = transport.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    /// Close the connection
    pub async fn close(mut self) -> Result<()> {
        self.state.transition(ConnectionState::Closed)?;
        let _ = self.send_message(&FrontendMessage::Terminate).await;
        if let Some(transport) = self.transport.as_mut() {
            transport.shutdown().await?;
        }
        Ok(())
    }
}

/// Establishes validated connections to endpoints
///
/// Holds the compiled TLS configuration so every connection made through one
/// connector uses the same certificate material and validation mode.
#[derive(Debug, Clone)]
pub struct TlsConnector {
    options: ConnectionOptions,
    tls: Option<TlsConfig>,
}

impl TlsConnector {
    /// Create a connector from a certificate bundle and options
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if TLS is enabled with a validating mode but the
    /// bundle carries no CA certificates, or if rustls rejects the client identity.
    pub fn new(bundle: &CertificateBundle, options: ConnectionOptions) -> Result<Self> {
        let tls = if options.tls {
            Some(
                TlsConfig::builder()
                    .mode(options.validation)
                    .hostname_check(options.hostname_check.clone())
                    .build(bundle)?,
            )
        } else {
            None
        };

        Ok(Self { options, tls })
    }

    /// Options this connector was built with
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Validation mode in effect
    pub fn mode(&self) -> ValidationMode {
        self.options.effective_mode()
    }

    /// Connect to an endpoint, bounded by the connect timeout
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] classifying the failure. A timed-out attempt
    /// is abandoned and its partial connection dropped.
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<Connection> {
        let mode = self.mode();
        let mode_label = crate::metrics::labels::mode(mode);
        crate::metrics::counters::connect_attempted(mode_label);
        let started = Instant::now();

        let attempt = self
            .establish(endpoint)
            .instrument(tracing::info_span!("connect", endpoint = %endpoint, mode = %mode));

        let result = match tokio::time::timeout(self.options.connect_timeout, attempt).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err((kind, detail))) => Err(ConnectError::new(endpoint.clone(), mode, kind, detail)),
            Err(_) => Err(ConnectError::new(
                endpoint.clone(),
                mode,
                ConnectErrorKind::Timeout,
                format!("no connection within {:?}", self.options.connect_timeout),
            )),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(conn) => {
                crate::metrics::counters::connect_succeeded(mode_label);
                crate::metrics::histograms::connect_duration(mode_label, elapsed_ms);
                tracing::info!(endpoint = %endpoint, id = conn.id(), elapsed_ms, "connection established");
                Ok(conn)
            }
            Err(e) => {
                crate::metrics::counters::connect_failed(mode_label, e.kind.as_str());
                tracing::warn!(error = %e, "connection failed");
                Err(e.into())
            }
        }
    }

    async fn establish(
        &self,
        endpoint: &Endpoint,
    ) -> std::result::Result<Connection, (ConnectErrorKind, String)> {
        let transport = Transport::connect_tcp(endpoint)
            .await
            .map_err(|e| (network_kind(&e), e.to_string()))?;
        let mut conn = Connection::new(endpoint.clone(), transport);

        let request = if self.tls.is_some() {
            NegotiationRequest::Tls
        } else {
            NegotiationRequest::Plaintext
        };
        // Only an answer that contradicts the request is a mismatch; a hang-up is a network failure
        let response = conn.negotiate(request).await.map_err(|e| match e {
            Error::ConnectionClosed => (
                ConnectErrorKind::Network,
                "endpoint closed the connection during negotiation".to_string(),
            ),
            Error::Io(ref io) => (network_kind_io(io), e.to_string()),
            other => (ConnectErrorKind::ProtocolMismatch, other.to_string()),
        })?;

        match (&self.tls, response) {
            (Some(tls), NegotiationResponse::AcceptTls) => {
                conn.handshake(tls).await.map_err(|e| match e {
                    Error::Io(ref io) => (classify_tls_error(io), e.to_string()),
                    Error::Config(msg) => (ConnectErrorKind::ConfigInvalid, msg),
                    other => (ConnectErrorKind::HandshakeFailed, other.to_string()),
                })?;
            }
            (None, NegotiationResponse::AcceptPlaintext) => {
                tracing::debug!("endpoint accepted plaintext");
            }
            (Some(_), other) => {
                return Err((
                    ConnectErrorKind::ProtocolMismatch,
                    format!("TLS requested but endpoint answered {:?}", other),
                ))
            }
            (None, other) => {
                return Err((
                    ConnectErrorKind::ProtocolMismatch,
                    format!("plaintext requested but endpoint answered {:?}", other),
                ))
            }
        }

        let metadata = ClientMetadata {
            replica_set: self.options.replica_set.clone(),
            ..Default::default()
        };
        let encrypted = conn.is_encrypted();
        conn.hello(metadata).await.map_err(|e| match e {
            // Client certificate rejections under TLS 1.3 surface after the handshake
            Error::Io(ref io) if encrypted => (classify_tls_error(io), e.to_string()),
            Error::Io(ref io) => (network_kind_io(io), e.to_string()),
            Error::ConnectionClosed if encrypted => (
                ConnectErrorKind::HandshakeFailed,
                "server closed the connection after the TLS handshake".to_string(),
            ),
            Error::ConnectionClosed => (ConnectErrorKind::Network, e.to_string()),
            Error::ServerRejected { .. } => (ConnectErrorKind::HandshakeFailed, e.to_string()),
            other => (ConnectErrorKind::ProtocolMismatch, other.to_string()),
        })?;

        Ok(conn)
    }
}

fn network_kind(err: &Error) -> ConnectErrorKind {
    match err {
        Error::Io(io) => network_kind_io(io),
        _ => ConnectErrorKind::Network,
    }
}

fn network_kind_io(err: &io::Error) -> ConnectErrorKind {
    match err.kind() {
        io::ErrorKind::TimedOut => ConnectErrorKind::Timeout,
        _ => ConnectErrorKind::Network,
    }
}

/// Connect to one endpoint with the given material and options
///
/// Convenience wrapper around [`TlsConnector`]. Configuration problems are
/// reported as [`ConnectErrorKind::ConfigInvalid`].
pub async fn connect(
    endpoint: &Endpoint,
    bundle: &CertificateBundle,
    options: ConnectionOptions,
) -> Result<Connection> {
    let mode = options.effective_mode();
    let connector = TlsConnector::new(bundle, options).map_err(|e| match e {
        Error::Config(msg) => Error::Connect(ConnectError::new(
            endpoint.clone(),
            mode,
            ConnectErrorKind::ConfigInvalid,
            msg,
        )),
        other => other,
    })?;
    connector.connect(endpoint).await
}
