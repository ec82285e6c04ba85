//! Error types for the ICE connectivity-check engine
//!
//! Pair-level problems (timeouts, ICMP errors, connect failures) are normally
//! absorbed into the pair state machine and never reach the caller. The
//! variants below are what surfaces from public operations and from the
//! collaborator traits in [`crate::transport`].

use std::net::SocketAddr;

use thiserror::Error;

use crate::pair::CandidatePairState;

/// Result type for ICE operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the ICE agent
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Operation not valid in the current agent state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Rejected candidate pair state transition
    #[error("Invalid pair state transition: {from} -> {to}")]
    InvalidTransition {
        from: CandidatePairState,
        to: CandidatePairState,
    },

    /// Remote candidate data could not be decoded or is unusable
    #[error("Malformed remote candidates: {reason}")]
    MalformedCandidates { reason: String },

    /// Message transport failure
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// ICMP destination unreachable reported for a destination
    #[error("ICMP destination unreachable: {destination}")]
    IcmpUnreachable { destination: SocketAddr },

    /// TCP connect attempt did not complete in time
    #[error("Connect to {destination} timed out after {millis}ms")]
    ConnectTimeout { destination: SocketAddr, millis: u64 },

    /// No candidate pair could be formed from the supplied candidates
    #[error("No candidate pairs could be formed")]
    NoCandidatePairs,

    /// Connectivity checks failed for every stream
    #[error("Connectivity checks failed: {reason}")]
    CheckFailed { reason: String },

    /// The agent has been closed
    #[error("ICE agent closed")]
    Closed,

    /// Candidate serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a malformed candidates error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedCandidates {
            reason: reason.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a check failure error
    pub fn check_failed(reason: impl Into<String>) -> Self {
        Self::CheckFailed {
            reason: reason.into(),
        }
    }

    /// Whether this error means the destination is unreachable at the ICMP level
    pub fn is_icmp_unreachable(&self) -> bool {
        matches!(self, Self::IcmpUnreachable { .. })
    }
}
