#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

//! In-process replica-set members for integration tests
//!
//! Every member speaks the negotiation preamble and answers hello / status
//! frames with a status document the test can change at any time. TLS
//! members use a throwaway PKI generated with rcgen.

use bytes::{Buf, BytesMut};
use docwire::protocol::{
    decode_frontend_message, decode_negotiation, encode_backend_message,
    encode_negotiation_response, BackendMessage, FrontendMessage, NegotiationRequest,
    NegotiationResponse, ServerStatus,
};
use docwire::Endpoint;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;
use tokio::time::Duration;
use tokio_rustls::TlsAcceptor;

/// Host every test member listens on
pub const LOCALHOST: &str = "127.0.0.1";

/// A certificate authority able to issue server and client certificates
pub struct Pki {
    name: String,
    cert: Certificate,
    key: KeyPair,
}

/// An issued certificate with its private key
#[derive(Clone)]
pub struct Identity {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: CertificateDer<'static>,
    pub key_der: Vec<u8>,
}

impl Identity {
    /// Certificate and key concatenated in one PEM document
    pub fn combined_pem(&self) -> String {
        format!("{}{}", self.cert_pem, self.key_pem)
    }
}

impl Pki {
    pub fn new(name: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();
        Self {
            name: name.to_string(),
            cert,
            key,
        }
    }

    pub fn ca_pem(&self) -> String {
        self.cert.pem()
    }

    pub fn ca_der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    /// Server certificate valid for the given SAN entries
    pub fn server(&self, sans: &[&str]) -> Identity {
        let names: Vec<String> = sans.iter().map(|s| s.to_string()).collect();
        let mut params = CertificateParams::new(names).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{} server", self.name));
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        self.issue(params)
    }

    /// Server certificate valid for [`LOCALHOST`]
    pub fn localhost(&self) -> Identity {
        self.server(&[LOCALHOST, "localhost"])
    }

    /// Server certificate for [`LOCALHOST`] that expired long ago
    pub fn expired_localhost(&self) -> Identity {
        let mut params =
            CertificateParams::new(vec![LOCALHOST.to_string(), "localhost".to_string()]).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{} expired", self.name));
        params.not_before = rcgen::date_time_ymd(1999, 1, 1);
        params.not_after = rcgen::date_time_ymd(2000, 1, 1);
        self.issue(params)
    }

    /// Client certificate with the given common name
    pub fn client(&self, common_name: &str) -> Identity {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        self.issue(params)
    }

    fn issue(&self, params: CertificateParams) -> Identity {
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        Identity {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            cert_der: cert.der().clone(),
            key_der: key.serialize_der(),
        }
    }
}

/// Build a server TLS configuration, optionally requiring client certificates
/// issued by `client_ca`
pub fn server_config(identity: &Identity, client_ca: Option<&Pki>) -> Arc<ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .unwrap();

    let builder = match client_ca {
        Some(ca) => {
            let mut roots = RootCertStore::empty();
            roots.add(ca.ca_der()).unwrap();
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .unwrap();
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let key = PrivateKeyDer::try_from(identity.key_der.clone()).unwrap();
    Arc::new(
        builder
            .with_single_cert(vec![identity.cert_der.clone()], key)
            .unwrap(),
    )
}

/// What a member answers to the negotiation preamble
#[derive(Clone)]
pub enum Negotiation {
    /// Accept TLS, refuse plaintext
    Tls(Arc<ServerConfig>),
    /// Accept plaintext, refuse TLS
    Plaintext,
}

/// A replica-set member (or standalone server) bound to an ephemeral port
pub struct TestServer {
    endpoint: Endpoint,
    negotiation: Negotiation,
    status: Arc<Mutex<ServerStatus>>,
    handshakes: Arc<AtomicUsize>,
    tasks: Arc<Mutex<Vec<AbortHandle>>>,
}

impl TestServer {
    pub async fn start(negotiation: Negotiation, status: ServerStatus) -> Self {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let endpoint = Endpoint::new(LOCALHOST, listener.local_addr().unwrap().port());
        let server = Self {
            endpoint,
            negotiation,
            status: Arc::new(Mutex::new(status)),
            handshakes: Arc::new(AtomicUsize::new(0)),
            tasks: Arc::new(Mutex::new(Vec::new())),
        };
        server.accept(listener);
        server
    }

    /// TLS standalone server answering as a primary
    pub async fn tls(config: Arc<ServerConfig>) -> Self {
        Self::start(Negotiation::Tls(config), primary_status()).await
    }

    /// Plaintext standalone server answering as a primary
    pub async fn plaintext() -> Self {
        Self::start(Negotiation::Plaintext, primary_status()).await
    }

    fn accept(&self, listener: TcpListener) {
        let negotiation = self.negotiation.clone();
        let status = self.status.clone();
        let handshakes = self.handshakes.clone();
        let tasks = self.tasks.clone();
        let acceptor = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let handle = tokio::spawn(handle(
                    socket,
                    negotiation.clone(),
                    status.clone(),
                    handshakes.clone(),
                ));
                tasks.lock().unwrap().push(handle.abort_handle());
            }
        });
        self.tasks.lock().unwrap().push(acceptor.abort_handle());
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    /// `host:port` as it appears in a connection URI
    pub fn address(&self) -> String {
        self.endpoint.to_string()
    }

    pub fn set_status(&self, status: ServerStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Completed TLS handshakes since start
    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    /// Stop accepting and drop every open connection
    pub fn stop(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Listen again on the same port after [`TestServer::stop`]
    pub async fn restart(&self) {
        for _ in 0..100 {
            if let Ok(listener) = TcpListener::bind((LOCALHOST, self.endpoint.port())).await {
                self.accept(listener);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("could not rebind {}", self.endpoint);
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Status of a standalone primary
pub fn primary_status() -> ServerStatus {
    ServerStatus {
        is_primary: true,
        ..Default::default()
    }
}

/// Status of a replica-set member
pub fn member_status(set_name: &str, primary: bool, hosts: &[Endpoint]) -> ServerStatus {
    ServerStatus {
        is_primary: primary,
        secondary: !primary,
        set_name: Some(set_name.to_string()),
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        ..Default::default()
    }
}

/// Comma-separated `host:port` list for a connection URI
pub fn seed_list(servers: &[&TestServer]) -> String {
    servers
        .iter()
        .map(|s| s.address())
        .collect::<Vec<_>>()
        .join(",")
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

async fn handle(
    mut socket: TcpStream,
    negotiation: Negotiation,
    status: Arc<Mutex<ServerStatus>>,
    handshakes: Arc<AtomicUsize>,
) {
    let mut preamble = [0u8; 8];
    if socket.read_exact(&mut preamble).await.is_err() {
        return;
    }
    let Ok(request) = decode_negotiation(&preamble) else {
        return;
    };

    let answer = match (&negotiation, request) {
        (Negotiation::Tls(_), NegotiationRequest::Tls) => NegotiationResponse::AcceptTls,
        (Negotiation::Tls(_), NegotiationRequest::Plaintext) => NegotiationResponse::TlsRequired,
        (Negotiation::Plaintext, NegotiationRequest::Tls) => NegotiationResponse::TlsUnavailable,
        (Negotiation::Plaintext, NegotiationRequest::Plaintext) => {
            NegotiationResponse::AcceptPlaintext
        }
    };
    if socket
        .write_all(&[encode_negotiation_response(answer)])
        .await
        .is_err()
    {
        return;
    }

    match (answer, negotiation) {
        (NegotiationResponse::AcceptTls, Negotiation::Tls(config)) => {
            let Ok(stream) = TlsAcceptor::from(config).accept(socket).await else {
                return;
            };
            handshakes.fetch_add(1, Ordering::SeqCst);
            serve(stream, status).await;
        }
        (NegotiationResponse::AcceptPlaintext, _) => serve(socket, status).await,
        _ => {}
    }
}

async fn serve<S>(mut stream: S, status: Arc<Mutex<ServerStatus>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    loop {
        match decode_frontend_message(&mut buf) {
            Ok((msg, consumed)) => {
                buf.advance(consumed);
                match msg {
                    FrontendMessage::Terminate => return,
                    FrontendMessage::Hello(_) | FrontendMessage::Status => {
                        let current = status.lock().unwrap().clone();
                        let reply =
                            encode_backend_message(&BackendMessage::Status(current)).unwrap();
                        if stream.write_all(&reply).await.is_err() || stream.flush().await.is_err()
                        {
                            return;
                        }
                    }
                }
            }
            Err(_) => {
                if stream.read_buf(&mut buf).await.unwrap_or(0) == 0 {
                    return;
                }
            }
        }
    }
}
