//! Client options and their resolution against a parsed URI

use super::connection_string::ConnectionInfo;
use super::read_preference::ReadPreference;
use crate::connection::{
    CertificateBundle, CertificatePaths, ConnectionOptions, HostnameCheck, ServerIdentityCheck,
    ValidationMode, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_POOL_SIZE,
};
use crate::topology::{MonitorConfig, DEFAULT_HEARTBEAT};
use crate::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

/// Default bound on waiting for a member matching the read preference
pub const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Caller-supplied client configuration
///
/// Every field that is set overrides the corresponding connection string
/// parameter. Certificate material is given either as PEM bytes or as file
/// paths, not a mix of both.
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// Negotiate TLS (overrides `ssl=` in the URI)
    pub ssl: Option<bool>,
    /// `false` disables certificate validation entirely
    pub ssl_validate: Option<bool>,
    /// Explicit validation mode (takes precedence over `ssl_validate`)
    pub validation: Option<ValidationMode>,
    /// CA certificates as PEM
    pub ssl_ca: Vec<Vec<u8>>,
    /// Client certificate chain as PEM (may include the key)
    pub ssl_cert: Option<Vec<u8>>,
    /// Client private key as PEM
    pub ssl_key: Option<Vec<u8>>,
    /// Passphrase for an encrypted client key
    pub ssl_pass: Option<Zeroizing<String>>,
    /// Certificate material on disk
    pub certificate_paths: CertificatePaths,
    /// Replaces the default hostname comparison
    pub check_server_identity: Option<Arc<dyn ServerIdentityCheck>>,
    /// Member selection preference
    pub read_preference: Option<ReadPreference>,
    /// Expected replica-set name
    pub replica_set: Option<String>,
    /// Per-endpoint connection bound
    pub max_pool_size: Option<usize>,
    /// Connect timeout
    pub connect_timeout: Option<Duration>,
    /// Interval between topology probes
    pub heartbeat_frequency: Option<Duration>,
    /// Bound on waiting for a suitable member
    pub server_selection_timeout: Option<Duration>,
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("ssl", &self.ssl)
            .field("ssl_validate", &self.ssl_validate)
            .field("validation", &self.validation)
            .field("ssl_ca", &format_args!("{} source(s)", self.ssl_ca.len()))
            .field("ssl_cert", &self.ssl_cert.is_some())
            .field("ssl_key", &self.ssl_key.as_ref().map(|_| "<redacted>"))
            .field("ssl_pass", &self.ssl_pass.as_ref().map(|_| "<redacted>"))
            .field("certificate_paths", &self.certificate_paths)
            .field("check_server_identity", &self.check_server_identity.is_some())
            .field("read_preference", &self.read_preference)
            .field("replica_set", &self.replica_set)
            .field("max_pool_size", &self.max_pool_size)
            .field("connect_timeout", &self.connect_timeout)
            .field("heartbeat_frequency", &self.heartbeat_frequency)
            .field("server_selection_timeout", &self.server_selection_timeout)
            .finish()
    }
}

/// Effective settings after merging URI and options
#[derive(Debug, Clone)]
pub(crate) struct ResolvedOptions {
    pub connection: ConnectionOptions,
    pub monitor: MonitorConfig,
    pub read_preference: ReadPreference,
    pub server_selection_timeout: Duration,
}

impl ClientOptions {
    /// Create a builder for client options
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let options = ClientOptions::builder()
    ///     .ssl(true)
    ///     .ssl_ca_path("/etc/docwire/ca.pem")
    ///     .ssl_cert_path("/etc/docwire/client.pem")
    ///     .read_preference(ReadPreference::Nearest)
    ///     .build();
    /// ```
    pub fn builder() -> ClientOptionsBuilder {
        ClientOptionsBuilder {
            options: ClientOptions::default(),
        }
    }

    fn has_pem_material(&self) -> bool {
        !self.ssl_ca.is_empty() || self.ssl_cert.is_some() || self.ssl_key.is_some()
    }

    fn has_path_material(&self) -> bool {
        let paths = &self.certificate_paths;
        !paths.ca.is_empty() || paths.cert.is_some() || paths.key.is_some()
    }

    /// Load the certificate bundle described by these options
    ///
    /// # Errors
    ///
    /// * [`Error::Config`] if PEM bytes and paths are mixed
    /// * [`Error::Certificate`] if the material cannot be loaded
    pub fn certificate_bundle(&self) -> Result<CertificateBundle> {
        let passphrase = self.ssl_pass.as_ref().map(|p| p.as_str());
        match (self.has_pem_material(), self.has_path_material()) {
            (true, true) => Err(Error::Config(
                "certificate material must be given either as PEM bytes or as paths, not both"
                    .into(),
            )),
            (true, false) => {
                let ca: Vec<&[u8]> = self.ssl_ca.iter().map(Vec::as_slice).collect();
                CertificateBundle::from_pem(
                    &ca,
                    self.ssl_cert.as_deref(),
                    self.ssl_key.as_deref(),
                    passphrase,
                )
            }
            (false, true) => CertificateBundle::load(&self.certificate_paths, passphrase),
            (false, false) => Ok(CertificateBundle::empty()),
        }
    }

    /// Merge with the URI; options win
    pub(crate) fn resolve(&self, info: &ConnectionInfo) -> ResolvedOptions {
        let tls = self.ssl.or(info.ssl).unwrap_or(false);
        let validation = self
            .validation
            .or(match self.ssl_validate {
                Some(false) => Some(ValidationMode::Skip),
                Some(true) => Some(ValidationMode::ValidateCaAndHostname),
                None => None,
            })
            .or(info.validation)
            .unwrap_or_default();
        let hostname_check = match &self.check_server_identity {
            Some(hook) => HostnameCheck::Custom(hook.clone()),
            None => HostnameCheck::Default,
        };
        let replica_set = self.replica_set.clone().or_else(|| info.replica_set.clone());
        let connect_timeout = self
            .connect_timeout
            .or(info.connect_timeout)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        let connection = ConnectionOptions {
            tls,
            validation,
            hostname_check,
            max_pool_size: self
                .max_pool_size
                .or(info.max_pool_size)
                .unwrap_or(DEFAULT_MAX_POOL_SIZE)
                .max(1),
            connect_timeout,
            replica_set: replica_set.clone(),
        };

        let monitor = MonitorConfig {
            heartbeat: self
                .heartbeat_frequency
                .or(info.heartbeat_frequency)
                .unwrap_or(DEFAULT_HEARTBEAT),
            probe_timeout: connect_timeout,
            set_name: replica_set,
            ..Default::default()
        };

        ResolvedOptions {
            connection,
            monitor,
            read_preference: self
                .read_preference
                .or(info.read_preference)
                .unwrap_or_default(),
            server_selection_timeout: self
                .server_selection_timeout
                .or(info.server_selection_timeout)
                .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT),
        }
    }
}

/// Builder for [`ClientOptions`]
#[derive(Debug, Clone)]
pub struct ClientOptionsBuilder {
    options: ClientOptions,
}

impl ClientOptionsBuilder {
    /// Enable or disable TLS
    pub fn ssl(mut self, enabled: bool) -> Self {
        self.options.ssl = Some(enabled);
        self
    }

    /// `false` accepts any server certificate
    pub fn ssl_validate(mut self, validate: bool) -> Self {
        self.options.ssl_validate = Some(validate);
        self
    }

    /// Set the validation mode explicitly
    pub fn validation(mut self, mode: ValidationMode) -> Self {
        self.options.validation = Some(mode);
        self
    }

    /// Add a CA bundle given as PEM
    pub fn ssl_ca(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.options.ssl_ca.push(pem.into());
        self
    }

    /// Set the client certificate chain as PEM
    pub fn ssl_cert(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.options.ssl_cert = Some(pem.into());
        self
    }

    /// Set the client private key as PEM
    pub fn ssl_key(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.options.ssl_key = Some(pem.into());
        self
    }

    /// Passphrase for an encrypted client key
    pub fn ssl_pass(mut self, passphrase: impl Into<String>) -> Self {
        self.options.ssl_pass = Some(Zeroizing::new(passphrase.into()));
        self
    }

    /// Add a CA bundle file
    pub fn ssl_ca_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.certificate_paths.ca.push(path.into());
        self
    }

    /// Client certificate file (may also hold the key)
    pub fn ssl_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.certificate_paths.cert = Some(path.into());
        self
    }

    /// Client key file
    pub fn ssl_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.certificate_paths.key = Some(path.into());
        self
    }

    /// Install a server identity hook in place of the default hostname check
    pub fn check_server_identity(mut self, check: impl ServerIdentityCheck + 'static) -> Self {
        self.options.check_server_identity = Some(Arc::new(check));
        self
    }

    /// Set the read preference
    pub fn read_preference(mut self, preference: ReadPreference) -> Self {
        self.options.read_preference = Some(preference);
        self
    }

    /// Set the expected replica-set name
    pub fn replica_set(mut self, name: impl Into<String>) -> Self {
        self.options.replica_set = Some(name.into());
        self
    }

    /// Set the per-endpoint pool bound
    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.options.max_pool_size = Some(size);
        self
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = Some(timeout);
        self
    }

    /// Set the topology probe interval
    pub fn heartbeat_frequency(mut self, interval: Duration) -> Self {
        self.options.heartbeat_frequency = Some(interval);
        self
    }

    /// Set the server selection timeout
    pub fn server_selection_timeout(mut self, timeout: Duration) -> Self {
        self.options.server_selection_timeout = Some(timeout);
        self
    }

    /// Build the options
    pub fn build(self) -> ClientOptions {
        self.options
    }
}
