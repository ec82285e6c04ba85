//! Connectivity-check messages
//!
//! These are the decoded forms of STUN Binding requests and responses carrying
//! the ICE attributes (PRIORITY, USE-CANDIDATE, ICE-CONTROLLING,
//! ICE-CONTROLLED, XOR-MAPPED-ADDRESS, ERROR-CODE). Encoding them on the wire
//! is the message transport's job.

use std::net::SocketAddr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::candidate::TransportType;
use crate::config::IceRole;

/// ERROR-CODE for a role conflict (RFC 8445 section 7.3.1.1)
pub const ROLE_CONFLICT: u16 = 487;

/// ERROR-CODE for a malformed or unacceptable request
pub const BAD_REQUEST: u16 = 400;

/// 96-bit transaction id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub [u8; 12]);

impl TransactionId {
    /// Generate a random transaction id
    pub fn random() -> Self {
        let mut id = [0u8; 12];
        rand::thread_rng().fill(&mut id);
        Self(id)
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// ICE-CONTROLLING / ICE-CONTROLLED attribute with the sender's tie-breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleAttribute {
    /// Sender believes it is controlling
    Controlling(u64),

    /// Sender believes it is controlled
    Controlled(u64),
}

impl RoleAttribute {
    /// Tie-breaker carried by the attribute
    pub fn tie_breaker(&self) -> u64 {
        match self {
            Self::Controlling(tb) | Self::Controlled(tb) => *tb,
        }
    }

    /// Whether the sender claims the controlling role
    pub fn is_controlling(&self) -> bool {
        matches!(self, Self::Controlling(_))
    }

    /// Role the sender claims
    pub fn role(&self) -> IceRole {
        match self {
            Self::Controlling(_) => IceRole::Controlling,
            Self::Controlled(_) => IceRole::Controlled,
        }
    }
}

/// Binding request used as a connectivity check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRequest {
    /// Transaction id, identical across retransmissions
    pub transaction_id: TransactionId,

    /// PRIORITY: the priority a peer-reflexive candidate learned from this
    /// request would have
    pub priority: u32,

    /// USE-CANDIDATE flag
    pub use_candidate: bool,

    /// Sender's role claim
    pub role: RoleAttribute,
}

/// Payload of a binding response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    /// Success carrying the mapped (source) address of the request
    Success { mapped_address: SocketAddr },

    /// Error response with ERROR-CODE
    Error { code: u16, reason: String },
}

/// Binding response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingResponse {
    /// Transaction id copied from the request
    pub transaction_id: TransactionId,

    /// Response payload
    pub kind: ResponseKind,
}

impl BindingResponse {
    /// Create a success response echoing `mapped_address`
    pub fn success(transaction_id: TransactionId, mapped_address: SocketAddr) -> Self {
        Self {
            transaction_id,
            kind: ResponseKind::Success { mapped_address },
        }
    }

    /// Create an error response
    pub fn error(transaction_id: TransactionId, code: u16, reason: impl Into<String>) -> Self {
        Self {
            transaction_id,
            kind: ResponseKind::Error {
                code,
                reason: reason.into(),
            },
        }
    }

    /// Create a 487 Role Conflict response
    pub fn role_conflict(transaction_id: TransactionId) -> Self {
        Self::error(transaction_id, ROLE_CONFLICT, "Role Conflict")
    }

    /// Whether this is a role-conflict error response
    pub fn is_role_conflict(&self) -> bool {
        matches!(self.kind, ResponseKind::Error { code: ROLE_CONFLICT, .. })
    }
}

/// Message body delivered to the agent by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckMessage {
    /// Inbound request
    Request(BindingRequest),

    /// Inbound response
    Response(BindingResponse),
}

/// A decoded message together with the 5-tuple it arrived on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Local address the packet was received on
    pub local: SocketAddr,

    /// Source address of the packet
    pub remote: SocketAddr,

    /// Transport it arrived over
    pub transport: TransportType,

    /// Decoded message
    pub message: CheckMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_ids_are_random() {
        assert_ne!(TransactionId::random(), TransactionId::random());
        assert_eq!(TransactionId([0xab; 12]).to_string(), "ab".repeat(12));
    }

    #[test]
    fn test_role_conflict_response() {
        let id = TransactionId::random();
        let response = BindingResponse::role_conflict(id);
        assert!(response.is_role_conflict());
        assert!(!BindingResponse::error(id, BAD_REQUEST, "Bad Request").is_role_conflict());
        assert!(
            !BindingResponse::success(id, "10.0.0.1:5000".parse().unwrap()).is_role_conflict()
        );
    }

    #[test]
    fn test_role_attribute() {
        assert_eq!(RoleAttribute::Controlled(9).tie_breaker(), 9);
        assert!(RoleAttribute::Controlling(1).is_controlling());
        assert!(!RoleAttribute::Controlled(1).is_controlling());
    }
}
