//! Read preference and server selection

use crate::endpoint::Endpoint;
use crate::topology::{ServerDescription, TopologyState};
use crate::{Error, Result};
use rand::seq::SliceRandom;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Members whose round-trip time is within this window of the fastest are equally "near"
pub const LATENCY_WINDOW: Duration = Duration::from_millis(15);

/// Which replica-set member a client connects to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ReadPreference {
    /// Only the primary
    #[default]
    Primary,
    /// The primary, or a secondary while none is elected
    PrimaryPreferred,
    /// Only secondaries
    Secondary,
    /// A secondary, or the primary when no secondary answers
    SecondaryPreferred,
    /// Any available member within the latency window
    Nearest,
}

impl ReadPreference {
    /// Pick a member from `state`, or `None` if none qualifies yet
    pub fn select(&self, state: &TopologyState) -> Option<Endpoint> {
        let primary = || state.primary().map(|s| s.endpoint.clone());
        let secondary = || pick_random(state.secondaries().collect());

        match self {
            Self::Primary => primary(),
            Self::PrimaryPreferred => primary().or_else(secondary),
            Self::Secondary => secondary(),
            Self::SecondaryPreferred => secondary().or_else(primary),
            Self::Nearest => nearest(state),
        }
    }

    /// URI spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::PrimaryPreferred => "primaryPreferred",
            Self::Secondary => "secondary",
            Self::SecondaryPreferred => "secondaryPreferred",
            Self::Nearest => "nearest",
        }
    }
}

fn pick_random(candidates: Vec<&ServerDescription>) -> Option<Endpoint> {
    candidates
        .choose(&mut rand::thread_rng())
        .map(|s| s.endpoint.clone())
}

fn nearest(state: &TopologyState) -> Option<Endpoint> {
    let available: Vec<&ServerDescription> = state.available().collect();
    let fastest = available.iter().filter_map(|s| s.round_trip_time).min()?;
    let window = fastest + LATENCY_WINDOW;
    pick_random(
        available
            .into_iter()
            .filter(|s| s.round_trip_time.is_some_and(|rtt| rtt <= window))
            .collect(),
    )
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadPreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "primarypreferred" => Ok(Self::PrimaryPreferred),
            "secondary" => Ok(Self::Secondary),
            "secondarypreferred" => Ok(Self::SecondaryPreferred),
            "nearest" => Ok(Self::Nearest),
            _ => Err(Error::Config(format!("invalid read preference '{}'", s))),
        }
    }
}
