use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::foundation::compute_foundation;
use crate::priority::{DEFAULT_LOCAL_PREFERENCE, candidate_priority};

/// Component id used by every candidate (single-component streams)
pub const DEFAULT_COMPONENT: u16 = 1;

/// ICE candidate types (RFC 8445)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateType {
    /// Host candidate
    Host,

    /// Server reflexive candidate (STUN)
    ServerReflexive,

    /// Peer reflexive candidate
    PeerReflexive,

    /// Relay candidate (TURN)
    Relayed,
}

impl CandidateType {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relayed => "relay",
        }
    }

    /// Type preference (RFC 8445 section 5.1.2.2)
    pub fn preference(&self) -> u32 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relayed => 0,
        }
    }
}

impl std::fmt::Display for CandidateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    /// UDP
    Udp,

    /// TCP, actively opening connections
    TcpActive,

    /// TCP, accepting connections
    TcpPassive,

    /// TCP simultaneous-open
    TcpSimultaneousOpen,
}

impl TransportType {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::TcpActive => "tcp-act",
            Self::TcpPassive => "tcp-pass",
            Self::TcpSimultaneousOpen => "tcp-so",
        }
    }

    /// Whether this side opens the TCP connection before checking
    pub fn opens_connection(&self) -> bool {
        matches!(self, Self::TcpActive | Self::TcpSimultaneousOpen)
    }

    /// Transport the peer uses on the other end of a connection of this transport
    pub fn peer_transport(&self) -> TransportType {
        match self {
            Self::Udp => Self::Udp,
            Self::TcpActive => Self::TcpPassive,
            Self::TcpPassive => Self::TcpActive,
            Self::TcpSimultaneousOpen => Self::TcpSimultaneousOpen,
        }
    }

    /// Whether a local candidate of this transport can check a remote one of `remote`
    pub fn pairs_with(&self, remote: TransportType) -> bool {
        matches!(
            (self, remote),
            (Self::Udp, Self::Udp)
                | (Self::TcpActive, Self::TcpPassive)
                | (Self::TcpPassive, Self::TcpActive)
                | (Self::TcpSimultaneousOpen, Self::TcpSimultaneousOpen)
        )
    }
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One local or remote transport endpoint.
///
/// Candidates are plain values. The only field that changes after creation is
/// `controlling`, which is re-stamped when the agent's role flips.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    /// Transport address
    pub address: SocketAddr,

    /// Transport protocol
    pub transport: TransportType,

    /// Candidate type
    pub candidate_type: CandidateType,

    /// Base address: the address itself for host and relayed candidates,
    /// the underlying host address for reflexive ones
    pub base: SocketAddr,

    /// STUN or TURN server the candidate was obtained from
    pub related_server: Option<SocketAddr>,

    /// Foundation (equivalence class)
    pub foundation: u32,

    /// Priority
    pub priority: u32,

    /// Component id
    pub component: u16,

    /// Whether the owning side was controlling when the candidate was created
    pub controlling: bool,
}

impl Candidate {
    fn build(
        candidate_type: CandidateType,
        transport: TransportType,
        address: SocketAddr,
        base: SocketAddr,
        related_server: Option<SocketAddr>,
        controlling: bool,
    ) -> Self {
        Self {
            address,
            transport,
            candidate_type,
            base,
            related_server,
            foundation: compute_foundation(candidate_type, base.ip(), transport, related_server),
            priority: candidate_priority(candidate_type, DEFAULT_LOCAL_PREFERENCE, DEFAULT_COMPONENT),
            component: DEFAULT_COMPONENT,
            controlling,
        }
    }

    /// Create a host candidate
    pub fn host(address: SocketAddr, transport: TransportType, controlling: bool) -> Self {
        Self::build(CandidateType::Host, transport, address, address, None, controlling)
    }

    /// Create a server reflexive candidate learned from `stun_server`
    pub fn server_reflexive(
        address: SocketAddr,
        base: SocketAddr,
        stun_server: SocketAddr,
        transport: TransportType,
        controlling: bool,
    ) -> Self {
        Self::build(
            CandidateType::ServerReflexive,
            transport,
            address,
            base,
            Some(stun_server),
            controlling,
        )
    }

    /// Create a relayed candidate allocated on `turn_server`
    pub fn relayed(
        address: SocketAddr,
        turn_server: SocketAddr,
        transport: TransportType,
        controlling: bool,
    ) -> Self {
        Self::build(
            CandidateType::Relayed,
            transport,
            address,
            address,
            Some(turn_server),
            controlling,
        )
    }

    /// Create a peer reflexive candidate discovered during checks.
    ///
    /// The priority is taken from the PRIORITY value of the request that
    /// revealed the address rather than computed.
    pub fn peer_reflexive(
        address: SocketAddr,
        base: SocketAddr,
        transport: TransportType,
        priority: u32,
        component: u16,
        controlling: bool,
    ) -> Self {
        let mut candidate = Self::build(
            CandidateType::PeerReflexive,
            transport,
            address,
            base,
            None,
            controlling,
        );
        candidate.priority = priority;
        candidate.component = component;
        candidate
    }

    /// Recompute the priority with a different local preference
    pub fn with_local_preference(mut self, local_preference: u16) -> Self {
        self.priority = candidate_priority(self.candidate_type, local_preference, self.component);
        self
    }

    /// Is the address IPv4?
    pub fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    /// Whether both candidates are in the same address family
    pub fn same_family(&self, other: &Candidate) -> bool {
        self.address.is_ipv4() == other.address.is_ipv4()
    }

    /// Whether `addr` and `transport` identify this candidate
    pub fn matches(&self, addr: SocketAddr, transport: TransportType) -> bool {
        self.address == addr && self.transport == transport
    }
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} (base {})",
            self.candidate_type, self.transport, self.address, self.base
        )
    }
}
