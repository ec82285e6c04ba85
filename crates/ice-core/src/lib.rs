//! ICE (Interactive Connectivity Establishment) connectivity checks for NAT traversal.
//!
//! This crate runs the connectivity-check phase of RFC 8445 for one media
//! stream: it pairs local and remote candidates, paces binding checks over the
//! pairs, handles role conflicts and peer reflexive discovery, and nominates
//! the pair media should flow on.
//!
//! Candidate gathering, wire encoding of check messages and the sockets
//! themselves live outside this crate, behind the [`MessageTransport`],
//! [`CandidateCodec`] and [`ChannelEstablisher`] traits.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rvoip_ice_core::prelude::*;
//!
//! # async fn run(transport: Arc<dyn MessageTransport>, local: Vec<Candidate>, remote: Vec<Candidate>) -> Result<()> {
//! let config = IceConfig::builder().role(IceRole::Controlling).build()?;
//! let (agent, _events) = IceAgent::new(config, transport)?;
//!
//! agent.start(local, remote)?;
//! let selected = agent.wait_for_completion().await?;
//! println!("media flows {} -> {}", selected.local.address, selected.remote.address);
//! # Ok(())
//! # }
//! ```

// Error handling
pub mod error;

// Configuration
pub mod config;

// Candidates, priorities and foundations
pub mod candidate;
pub mod foundation;
pub mod priority;

// Check messages and the collaborator seams
pub mod message;
pub mod transport;

// Pairs and check lists
pub mod checklist;
pub mod pair;
pub mod stream;

// Transactions and scheduling
pub mod scheduler;
pub mod transaction;

// Role conflicts
pub mod conflict;

// ICE agent
pub mod agent;

// Public exports
pub use agent::{IceAgent, IceAgentEvent, IceAgentState};
pub use candidate::{Candidate, CandidateType, TransportType};
pub use checklist::CheckListState;
pub use config::{IceConfig, IceConfigBuilder, IceRole};
pub use error::{Error, Result};
pub use message::{
    BindingRequest, BindingResponse, CheckMessage, InboundMessage, ResponseKind, RoleAttribute,
    TransactionId,
};
pub use pair::{CandidatePairState, SelectedPair};
pub use transport::{CandidateCodec, ChannelEstablisher, JsonCandidateCodec, MessageTransport};

/// Re-export of common types and functions
pub mod prelude {
    pub use super::{
        Candidate, CandidateCodec, CandidateType, ChannelEstablisher, Error, IceAgent,
        IceAgentEvent, IceAgentState, IceConfig, IceRole, InboundMessage, JsonCandidateCodec,
        MessageTransport, Result, SelectedPair, TransportType,
    };
}

/// ICE protocol constants
pub mod constants {
    /// Error code for a role conflict (RFC 8445 section 7.3.1.1)
    pub const ROLE_CONFLICT: u16 = crate::message::ROLE_CONFLICT;

    /// Highest local preference
    pub const MAX_LOCAL_PREFERENCE: u16 = crate::priority::DEFAULT_LOCAL_PREFERENCE;

    /// Default component id
    pub const DEFAULT_COMPONENT: u16 = crate::candidate::DEFAULT_COMPONENT;
}
