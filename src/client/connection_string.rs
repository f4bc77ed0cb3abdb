//! Connection string parsing
//!
//! Supports the format:
//! * mongodb://host[:port][,host[:port]...][/database][?options]
//!
//! Recognized options (names are case-insensitive):
//! * `ssl` / `tls`: negotiate TLS (`true`/`false`)
//! * `replicaSet`: expected replica-set name
//! * `maxPoolSize`: per-endpoint connection bound
//! * `connectTimeoutMS`, `heartbeatFrequencyMS`, `serverSelectionTimeoutMS`
//! * `readPreference`: `primary`, `primaryPreferred`, `secondary`,
//!   `secondaryPreferred` or `nearest`
//! * `tlsAllowInvalidCertificates`, `tlsAllowInvalidHostnames`: relax validation

use super::read_preference::ReadPreference;
use crate::connection::ValidationMode;
use crate::endpoint::Endpoint;
use crate::{Error, Result};
use std::time::Duration;

/// URI scheme
pub const SCHEME: &str = "mongodb://";

/// Parsed connection info
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionInfo {
    /// Seed endpoints, in URI order with duplicates removed
    pub hosts: Vec<Endpoint>,
    /// Database name
    pub database: Option<String>,
    /// TLS requested (`ssl` or `tls` parameter)
    pub ssl: Option<bool>,
    /// Validation mode implied by the `tlsAllowInvalid*` parameters
    pub validation: Option<ValidationMode>,
    /// Replica-set name
    pub replica_set: Option<String>,
    /// Per-endpoint pool bound
    pub max_pool_size: Option<usize>,
    /// Connect timeout
    pub connect_timeout: Option<Duration>,
    /// Interval between topology probes
    pub heartbeat_frequency: Option<Duration>,
    /// Bound on waiting for a suitable member
    pub server_selection_timeout: Option<Duration>,
    /// Member selection preference
    pub read_preference: Option<ReadPreference>,
}

/// Iterate over `key=value` pairs of a query string
fn query_pairs(query_string: &str) -> impl Iterator<Item = (&str, &str)> {
    query_string
        .trim_start_matches('?')
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
}

/// Extract a query parameter value from a query string
fn parse_query_param(query_string: &str, param: &str) -> Option<String> {
    if query_string.is_empty() {
        return None;
    }

    query_pairs(query_string)
        .find(|(key, _)| key.eq_ignore_ascii_case(param))
        .map(|(_, value)| value.to_string())
}

const KNOWN_PARAMS: &[&str] = &[
    "ssl",
    "tls",
    "replicaSet",
    "maxPoolSize",
    "connectTimeoutMS",
    "heartbeatFrequencyMS",
    "serverSelectionTimeoutMS",
    "readPreference",
    "tlsAllowInvalidCertificates",
    "tlsAllowInvalidHostnames",
];

fn parse_bool(param: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(Error::Config(format!(
            "invalid value '{}' for {}: expected true or false",
            value, param
        ))),
    }
}

fn parse_millis(param: &str, value: &str) -> Result<Duration> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| Error::Config(format!("invalid value '{}' for {}", value, param)))
}

impl ConnectionInfo {
    /// Parse connection string
    pub fn parse(s: &str) -> Result<Self> {
        let rest = s.strip_prefix(SCHEME).ok_or_else(|| {
            Error::Config(format!("connection string must start with {}", SCHEME))
        })?;

        if rest.contains('@') {
            return Err(Error::Config(
                "credentials in the connection string are not supported".into(),
            ));
        }

        // Split off query string before parsing hosts/database
        let (rest, query_string) = match rest.find('?') {
            Some(q_pos) => rest.split_at(q_pos),
            None => (rest, ""),
        };

        let (host_list, database) = match rest.split_once('/') {
            Some((hosts, db)) if !db.is_empty() => (hosts, Some(db.to_string())),
            Some((hosts, _)) => (hosts, None),
            None => (rest, None),
        };

        let mut hosts: Vec<Endpoint> = Vec::new();
        for host in host_list.split(',') {
            let endpoint: Endpoint = host.parse()?;
            if !hosts.contains(&endpoint) {
                hosts.push(endpoint);
            }
        }

        let mut info = Self {
            hosts,
            database,
            ..Default::default()
        };
        info.apply_query(query_string)?;
        Ok(info)
    }

    fn apply_query(&mut self, query_string: &str) -> Result<()> {
        for (key, _) in query_pairs(query_string) {
            if !KNOWN_PARAMS.iter().any(|k| k.eq_ignore_ascii_case(key)) {
                tracing::warn!(option = key, "ignoring unsupported connection string option");
            }
        }

        let ssl = parse_query_param(query_string, "ssl")
            .map(|v| parse_bool("ssl", &v))
            .transpose()?;
        let tls = parse_query_param(query_string, "tls")
            .map(|v| parse_bool("tls", &v))
            .transpose()?;
        self.ssl = match (ssl, tls) {
            (Some(a), Some(b)) if a != b => {
                return Err(Error::Config("conflicting values for ssl and tls".into()))
            }
            (a, b) => a.or(b),
        };

        let invalid_certs = parse_query_param(query_string, "tlsAllowInvalidCertificates")
            .map(|v| parse_bool("tlsAllowInvalidCertificates", &v))
            .transpose()?;
        let invalid_hosts = parse_query_param(query_string, "tlsAllowInvalidHostnames")
            .map(|v| parse_bool("tlsAllowInvalidHostnames", &v))
            .transpose()?;
        self.validation = match (invalid_certs, invalid_hosts) {
            (Some(true), _) => Some(ValidationMode::Skip),
            (_, Some(true)) => Some(ValidationMode::ValidateCa),
            (None, None) => None,
            _ => Some(ValidationMode::ValidateCaAndHostname),
        };

        self.replica_set = parse_query_param(query_string, "replicaSet").filter(|s| !s.is_empty());

        self.max_pool_size = match parse_query_param(query_string, "maxPoolSize") {
            Some(v) => match v.parse::<usize>() {
                Ok(n) if n >= 1 => Some(n),
                _ => {
                    return Err(Error::Config(format!(
                        "invalid value '{}' for maxPoolSize: expected a positive integer",
                        v
                    )))
                }
            },
            None => None,
        };

        self.connect_timeout = parse_query_param(query_string, "connectTimeoutMS")
            .map(|v| parse_millis("connectTimeoutMS", &v))
            .transpose()?;
        self.heartbeat_frequency = parse_query_param(query_string, "heartbeatFrequencyMS")
            .map(|v| parse_millis("heartbeatFrequencyMS", &v))
            .transpose()?;
        self.server_selection_timeout = parse_query_param(query_string, "serverSelectionTimeoutMS")
            .map(|v| parse_millis("serverSelectionTimeoutMS", &v))
            .transpose()?;
        self.read_preference = parse_query_param(query_string, "readPreference")
            .map(|v| v.parse())
            .transpose()?;

        Ok(())
    }

    /// Whether the target is a replica set (several seeds or a set name)
    pub fn is_replica_set(&self) -> bool {
        self.hosts.len() > 1 || self.replica_set.is_some()
    }
}
