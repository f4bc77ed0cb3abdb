//! Connection state machine

use crate::{Error, Result};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial state (TCP connected, nothing sent)
    Initial,

    /// Negotiation preamble sent, awaiting the server's answer
    Negotiating,

    /// TLS handshake in progress
    Handshaking,

    /// Hello sent, awaiting the server status reply
    AwaitingHello,

    /// Ready for commands
    Ready,

    /// Status command in progress
    CommandInProgress,

    /// Closed
    Closed,
}

impl ConnectionState {
    /// Check if transition is valid
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Initial, Negotiating)
                | (Negotiating, Handshaking)
                | (Negotiating, AwaitingHello)
                | (Handshaking, AwaitingHello)
                | (AwaitingHello, Ready)
                | (Ready, CommandInProgress)
                | (CommandInProgress, Ready)
                | (_, Closed)
        )
    }

    /// Transition to new state
    pub fn transition(&mut self, next: ConnectionState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidState {
                expected: format!("valid transition from {:?}", self),
                actual: format!("{:?}", next),
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Negotiating => write!(f, "negotiating"),
            Self::Handshaking => write!(f, "handshaking"),
            Self::AwaitingHello => write!(f, "awaiting_hello"),
            Self::Ready => write!(f, "ready"),
            Self::CommandInProgress => write!(f, "command_in_progress"),
            Self::Closed => write!(f, "closed"),
        }
    }
}
