//! Server endpoint addressing

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Default server port when a host is given without one
pub const DEFAULT_PORT: u16 = 27017;

/// A server address (host + port)
///
/// Endpoints are immutable once constructed and compare by host (case-insensitive,
/// normalized to lowercase) and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint from host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host: String = host.into();
        let host = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();
        Self { host, port }
    }

    /// Host name or IP literal (without brackets)
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port
    pub fn port(&self) -> u16 {
        self.port
    }

    fn is_ipv6_literal(&self) -> bool {
        self.host.contains(':')
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6_literal() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Config("empty host in endpoint".into()));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| Error::Config(format!("unterminated IPv6 literal in '{}'", s)))?;
            if host.is_empty() {
                return Err(Error::Config(format!("empty host in endpoint '{}'", s)));
            }
            let port = match after {
                "" => DEFAULT_PORT,
                p => parse_port(p.strip_prefix(':').ok_or_else(|| {
                    Error::Config(format!("unexpected characters after IPv6 literal in '{}'", s))
                })?)?,
            };
            return Ok(Self::new(host, port));
        }

        match s.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => Err(Error::Config(format!(
                "IPv6 endpoint '{}' must be enclosed in brackets",
                s
            ))),
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(Error::Config(format!("empty host in endpoint '{}'", s)));
                }
                Ok(Self::new(host, parse_port(port)?))
            }
            None => Ok(Self::new(s, DEFAULT_PORT)),
        }
    }
}

fn parse_port(port: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(Error::Config(format!("invalid port '{}'", port))),
        Ok(p) => Ok(p),
    }
}
