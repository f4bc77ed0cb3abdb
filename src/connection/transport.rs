//! Transport abstraction (plain TCP vs TLS-encrypted TCP)

use super::tls::{parse_server_name, PeerIdentity, TlsConfig};
use crate::endpoint::Endpoint;
use crate::{Error, Result};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Transport layer: plain or TLS-encrypted TCP
#[allow(clippy::large_enum_variant)]
pub enum Transport {
    /// Plain TCP connection
    Plain(TcpStream),
    /// TLS-encrypted TCP connection
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Plain(_) => f.write_str("Transport::Plain(TcpStream)"),
            Transport::Tls(_) => f.write_str("Transport::Tls(TlsStream)"),
        }
    }
}

impl Transport {
    /// Connect via plain TCP
    pub async fn connect_tcp(endpoint: &Endpoint) -> Result<Self> {
        let stream = TcpStream::connect((endpoint.host(), endpoint.port())).await?;
        stream.set_nodelay(true)?;
        Ok(Transport::Plain(stream))
    }

    /// Write all bytes to the stream
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            Transport::Plain(stream) => stream.write_all(buf).await?,
            Transport::Tls(stream) => stream.write_all(buf).await?,
        }
        Ok(())
    }

    /// Flush the stream
    pub async fn flush(&mut self) -> Result<()> {
        match self {
            Transport::Plain(stream) => stream.flush().await?,
            Transport::Tls(stream) => stream.flush().await?,
        }
        Ok(())
    }

    /// Read into buffer
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize> {
        let n = match self {
            Transport::Plain(stream) => stream.read_buf(buf).await?,
            Transport::Tls(stream) => stream.read_buf(buf).await?,
        };
        Ok(n)
    }

    /// Read a single byte (negotiation response)
    pub async fn read_u8(&mut self) -> Result<u8> {
        let byte = match self {
            Transport::Plain(stream) => stream.read_u8().await?,
            Transport::Tls(stream) => stream.read_u8().await?,
        };
        Ok(byte)
    }

    /// Upgrade a plain TCP transport to TLS after negotiation.
    ///
    /// Consumes `self` and returns a new `Transport` with a TLS-encrypted stream.
    /// Handshake failures are returned as [`Error::Io`] carrying the rustls error.
    pub async fn upgrade_to_tls(self, tls_config: &TlsConfig, hostname: &str) -> Result<Self> {
        match self {
            Transport::Plain(tcp_stream) => {
                let server_name = parse_server_name(hostname)?;
                let connector = tokio_rustls::TlsConnector::from(tls_config.client_config());
                let tls_stream = connector.connect(server_name, tcp_stream).await?;
                Ok(Transport::Tls(tls_stream))
            }
            Transport::Tls(_) => Err(Error::Config(
                "transport is already TLS-encrypted".into(),
            )),
        }
    }

    /// Shutdown the stream
    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            Transport::Plain(stream) => stream.shutdown().await?,
            Transport::Tls(stream) => stream.shutdown().await?,
        }
        Ok(())
    }

    /// Whether the transport is encrypted
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// DER bytes of the server's leaf certificate (TLS only)
    pub fn peer_certificate(&self) -> Option<Vec<u8>> {
        match self {
            Transport::Plain(_) => None,
            Transport::Tls(stream) => {
                let (_tcp, conn) = stream.get_ref();
                let certs = conn.peer_certificates()?;
                Some(certs.first()?.as_ref().to_vec())
            }
        }
    }

    /// Identity of the server's leaf certificate (TLS only)
    pub fn peer_identity(&self) -> Option<PeerIdentity> {
        let der = self.peer_certificate()?;
        match PeerIdentity::from_der(&der) {
            Ok(identity) => Some(identity),
            Err(e) => {
                tracing::debug!(error = %e, "could not parse peer certificate");
                None
            }
        }
    }
}
