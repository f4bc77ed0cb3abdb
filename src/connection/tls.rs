//! TLS configuration and server identity validation.
//!
//! Three validation modes are supported:
//!
//! * [`ValidationMode::Skip`]: no chain or hostname checks
//! * [`ValidationMode::ValidateCa`]: the chain must verify against the bundle's CAs
//! * [`ValidationMode::ValidateCaAndHostname`]: chain plus hostname, where the
//!   hostname comparison can be replaced by a caller-supplied [`ServerIdentityCheck`]
//!
//! Session resumption is disabled so every handshake is a full handshake and
//! the server certificate is verified (and any hostname hook invoked) exactly
//! once per connection.

use super::certs::CertificateBundle;
use crate::error::ConnectErrorKind;
use crate::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::Resumption;
use rustls::crypto::CryptoProvider;
use rustls::server::ParsedCertificate;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use sha2::Digest;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Server certificate validation mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ValidationMode {
    /// Complete the handshake without inspecting the peer certificate
    Skip,
    /// Peer chain must verify against the trusted CAs; hostname is not checked
    ValidateCa,
    /// Chain and hostname are both verified
    #[default]
    ValidateCaAndHostname,
}

impl ValidationMode {
    /// Whether the peer chain is verified
    pub fn checks_chain(&self) -> bool {
        !matches!(self, Self::Skip)
    }

    /// Whether the peer hostname is verified
    pub fn checks_hostname(&self) -> bool {
        matches!(self, Self::ValidateCaAndHostname)
    }
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skip => write!(f, "skip"),
            Self::ValidateCa => write!(f, "validate-ca"),
            Self::ValidateCaAndHostname => write!(f, "validate-ca-and-hostname"),
        }
    }
}

impl std::str::FromStr for ValidationMode {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "skip" => Ok(Self::Skip),
            "validate-ca" => Ok(Self::ValidateCa),
            "validate-ca-and-hostname" => Ok(Self::ValidateCaAndHostname),
            _ => Err(Error::Config(format!(
                "invalid validation mode '{}': expected skip, validate-ca, or validate-ca-and-hostname",
                s
            ))),
        }
    }
}

/// Caller-supplied server identity check
///
/// When installed through [`HostnameCheck::Custom`], the result replaces the
/// default SAN/subject comparison. It runs after the chain has been verified.
pub trait ServerIdentityCheck: Send + Sync {
    /// Accept (`Ok`) or reject (`Err(reason)`) the peer for `host`
    fn check(&self, host: &str, peer: &PeerIdentity) -> std::result::Result<(), String>;
}

impl<F> ServerIdentityCheck for F
where
    F: Fn(&str, &PeerIdentity) -> std::result::Result<(), String> + Send + Sync,
{
    fn check(&self, host: &str, peer: &PeerIdentity) -> std::result::Result<(), String> {
        self(host, peer)
    }
}

/// Hostname comparison strategy
#[derive(Clone, Default)]
pub enum HostnameCheck {
    /// Match the requested host against the certificate's SAN entries
    #[default]
    Default,
    /// Delegate the decision to a caller-supplied hook
    Custom(Arc<dyn ServerIdentityCheck>),
}

impl HostnameCheck {
    /// Wrap a hook
    pub fn custom(check: impl ServerIdentityCheck + 'static) -> Self {
        Self::Custom(Arc::new(check))
    }

    /// Wrap a closure
    pub fn from_fn<F>(check: F) -> Self
    where
        F: Fn(&str, &PeerIdentity) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(check))
    }
}

impl fmt::Debug for HostnameCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("HostnameCheck::Default"),
            Self::Custom(_) => f.write_str("HostnameCheck::Custom(<hook>)"),
        }
    }
}

/// Identity presented by the server's leaf certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Distinguished name of the subject
    pub subject: String,
    /// Subject common name, if present
    pub common_name: Option<String>,
    /// DNS names from the subject alternative name extension
    pub dns_names: Vec<String>,
    /// IP addresses from the subject alternative name extension
    pub ip_addresses: Vec<IpAddr>,
    /// SHA-256 fingerprint of the DER certificate (lowercase hex, colon separated)
    pub fingerprint: String,
    /// Expiry as a unix timestamp
    pub not_after: i64,
}

impl PeerIdentity {
    /// Parse identity fields from a DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Protocol(format!("unparsable peer certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_ascii_lowercase()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            ip_addresses.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(Self {
            subject: cert.subject().to_string(),
            common_name,
            dns_names,
            ip_addresses,
            fingerprint: fingerprint(der),
            not_after: cert.validity().not_after.timestamp(),
        })
    }

    /// Whether the certificate's SAN entries cover `host`
    ///
    /// Supports a single left-most wildcard label for DNS names.
    pub fn covers_host(&self, host: &str) -> bool {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.ip_addresses.contains(&ip);
        }

        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.dns_names.iter().any(|name| match name.strip_prefix("*.") {
            Some(suffix) => host
                .split_once('.')
                .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
            None => *name == host,
        })
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

/// SHA-256 fingerprint of a DER certificate
pub fn fingerprint(der: &[u8]) -> String {
    sha2::Sha256::digest(der)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// The crypto provider used for every TLS configuration in the crate (ring)
pub fn crypto_provider() -> Arc<CryptoProvider> {
    static PROVIDER: OnceLock<Arc<CryptoProvider>> = OnceLock::new();
    PROVIDER
        .get_or_init(|| Arc::new(rustls::crypto::ring::default_provider()))
        .clone()
}

/// Certificate verifier implementing the three validation modes
struct ModeVerifier {
    mode: ValidationMode,
    roots: Arc<RootCertStore>,
    hostname: HostnameCheck,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for ModeVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModeVerifier")
            .field("mode", &self.mode)
            .field("roots", &self.roots.len())
            .field("hostname", &self.hostname)
            .finish()
    }
}

impl ServerCertVerifier for ModeVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if !self.mode.checks_chain() {
            return Ok(ServerCertVerified::assertion());
        }

        let cert = ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;

        if !self.mode.checks_hostname() {
            return Ok(ServerCertVerified::assertion());
        }

        match &self.hostname {
            HostnameCheck::Default => rustls::client::verify_server_name(&cert, server_name)?,
            HostnameCheck::Custom(hook) => {
                let host = server_name.to_str();
                let identity = PeerIdentity::from_der(end_entity.as_ref()).map_err(|_| {
                    rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding)
                })?;
                if let Err(reason) = hook.check(&host, &identity) {
                    tracing::warn!(host = %host, reason = %reason, "server identity check rejected peer");
                    return Err(rustls::Error::InvalidCertificate(
                        rustls::CertificateError::NotValidForName,
                    ));
                }
            }
        }

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// TLS configuration for encrypted connections.
///
/// # Examples
///
/// ```ignore
/// use docwire::connection::{CertificateBundle, CertificatePaths, TlsConfig, ValidationMode};
///
/// let bundle = CertificateBundle::load(&CertificatePaths::with_ca("/etc/docwire/ca.pem"), None)?;
/// let tls = TlsConfig::builder()
///     .mode(ValidationMode::ValidateCa)
///     .build(&bundle)?;
/// ```
#[derive(Clone)]
pub struct TlsConfig {
    mode: ValidationMode,
    hostname: HostnameCheck,
    client_identity: bool,
    client_config: Arc<ClientConfig>,
}

impl TlsConfig {
    /// Create a new TLS configuration builder.
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::default()
    }

    /// Get the rustls ClientConfig for this TLS configuration.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }

    /// Validation mode in effect
    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    /// Whether a client certificate is presented during the handshake
    pub fn presents_client_identity(&self) -> bool {
        self.client_identity
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("mode", &self.mode)
            .field("hostname", &self.hostname)
            .field("client_identity", &self.client_identity)
            .field("client_config", &"<ClientConfig>")
            .finish()
    }
}

/// Builder for TLS configuration.
#[derive(Debug, Default)]
pub struct TlsConfigBuilder {
    mode: ValidationMode,
    hostname: HostnameCheck,
}

impl TlsConfigBuilder {
    /// Set the validation mode (default: `validate-ca-and-hostname`)
    pub fn mode(mut self, mode: ValidationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the hostname comparison strategy (only used by `validate-ca-and-hostname`)
    pub fn hostname_check(mut self, check: HostnameCheck) -> Self {
        self.hostname = check;
        self
    }

    /// Build the TLS configuration from a certificate bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if a validating mode is requested without any CA
    /// certificates, or if the client identity is rejected by rustls.
    pub fn build(self, bundle: &CertificateBundle) -> Result<TlsConfig> {
        let roots = bundle.root_store();
        if self.mode.checks_chain() && roots.is_empty() {
            return Err(Error::Config(format!(
                "validation mode '{}' requires at least one CA certificate",
                self.mode
            )));
        }

        let provider = crypto_provider();
        let verifier = ModeVerifier {
            mode: self.mode,
            roots: Arc::new(roots),
            hostname: self.hostname.clone(),
            provider: provider.clone(),
        };

        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Config(format!("TLS protocol configuration: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier));

        let mut config = match (bundle.client_chain(), bundle.private_key()) {
            (Some(chain), Some(key)) => builder
                .with_client_auth_cert(chain.to_vec(), key.clone_key())
                .map_err(|e| Error::Config(format!("client certificate rejected: {}", e)))?,
            _ => builder.with_no_client_auth(),
        };
        config.resumption = Resumption::disabled();

        Ok(TlsConfig {
            mode: self.mode,
            hostname: self.hostname,
            client_identity: bundle.has_client_identity(),
            client_config: Arc::new(config),
        })
    }
}

/// Parse server name from a hostname or IP literal for TLS SNI.
///
/// # Errors
///
/// Returns an error if the hostname is not a valid DNS name or IP address.
pub fn parse_server_name(hostname: &str) -> Result<ServerName<'static>> {
    let hostname = hostname.trim_end_matches('.');

    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return Ok(ServerName::from(ip));
    }

    if hostname.is_empty() || hostname.len() > 253 {
        return Err(Error::Config(format!(
            "Invalid hostname for TLS: '{}'",
            hostname
        )));
    }

    ServerName::try_from(hostname.to_string())
        .map_err(|_| Error::Config(format!("Invalid hostname for TLS: '{}'", hostname)))
}

/// Map a handshake or post-handshake I/O error to a connect error kind
pub(crate) fn classify_tls_error(err: &io::Error) -> ConnectErrorKind {
    let tls = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());

    if let Some(tls) = tls {
        return match tls {
            rustls::Error::InvalidCertificate(rustls::CertificateError::NotValidForName)
            | rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForNameContext { .. },
            ) => ConnectErrorKind::HostnameMismatch,
            rustls::Error::InvalidCertificate(_) => ConnectErrorKind::ChainInvalid,
            _ => ConnectErrorKind::HandshakeFailed,
        };
    }

    match err.kind() {
        // Peer hung up mid-handshake: it refused us
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => ConnectErrorKind::HandshakeFailed,
        io::ErrorKind::TimedOut => ConnectErrorKind::Timeout,
        _ => ConnectErrorKind::Network,
    }
}
