//! docwire: TLS-secured connection core for replica-set document databases
//!
//! The crate covers everything between a connection URI and a usable,
//! validated channel:
//!
//! * certificate material loading ([`connection::CertificateBundle`])
//! * TLS negotiation with three validation modes ([`connection::TlsConnector`])
//! * per-endpoint connection pooling ([`pool::ConnectionPool`])
//! * replica-set role tracking ([`topology::TopologyMonitor`])
//! * a facade tying them together ([`Client`])
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> docwire::Result<()> {
//! use docwire::{Client, ClientOptions};
//!
//! let options = ClientOptions::builder()
//!     .ssl_ca_path("/etc/docwire/ca.pem")
//!     .build();
//!
//! let client = Client::connect(
//!     "mongodb://db1:27017,db2:27017,db3:27017/app?ssl=true&replicaSet=rs",
//!     options,
//! )
//! .await?;
//!
//! println!("primary: {:?}", client.current_primary());
//! client.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod client;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod topology;

#[cfg(test)]
mod test_support;

pub use client::{Client, ClientOptions, ReadPreference};
pub use endpoint::Endpoint;
pub use error::{
    CertificateError, ConnectError, ConnectErrorKind, Error, Result, TopologyError,
};
