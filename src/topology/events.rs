//! Topology change notifications

use super::description::ServerRole;
use crate::endpoint::Endpoint;

/// Event published by the monitor as member roles change
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyEvent {
    /// A member was learned from another member's host list
    Discovered {
        /// New member
        endpoint: Endpoint,
    },

    /// A member moved from one role to another
    RoleChanged {
        /// Member
        endpoint: Endpoint,
        /// Previous role
        from: ServerRole,
        /// New role
        to: ServerRole,
    },

    /// A previously unreachable member answered again
    Joined {
        /// Member
        endpoint: Endpoint,
        /// Role it reported
        role: ServerRole,
    },

    /// A member stopped answering
    Unreachable {
        /// Member
        endpoint: Endpoint,
        /// Probe failure text
        error: String,
    },

    /// A member became primary
    PrimaryElected {
        /// New primary
        endpoint: Endpoint,
    },
}

impl TopologyEvent {
    /// Member the event is about
    pub fn endpoint(&self) -> &Endpoint {
        match self {
            Self::Discovered { endpoint }
            | Self::RoleChanged { endpoint, .. }
            | Self::Joined { endpoint, .. }
            | Self::Unreachable { endpoint, .. }
            | Self::PrimaryElected { endpoint } => endpoint,
        }
    }
}
