//! Collaborator interfaces
//!
//! The check engine does not own sockets, codecs or candidate gathering. It
//! talks to the outside world through the traits in this module:
//!
//! - [`MessageTransport`] sends encoded requests and responses; inbound
//!   traffic is fed back through [`crate::IceAgent::handle_message`].
//! - [`CandidateCodec`] turns candidate lists into bytes for the signalling
//!   channel and back.
//! - [`ChannelEstablisher`] receives the selected pair once the agent completes.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::candidate::{Candidate, TransportType};
use crate::error::{Error, Result};
use crate::message::{BindingRequest, BindingResponse};
use crate::pair::SelectedPair;

/// Sends check messages on behalf of the agent
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Send a request from the local base address to `remote`.
    ///
    /// Implementations report ICMP destination-unreachable conditions they
    /// observe at send time as [`Error::IcmpUnreachable`].
    async fn send_request(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        transport: TransportType,
        request: &BindingRequest,
    ) -> Result<()>;

    /// Send a response from `local` back to `remote`
    async fn send_response(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        transport: TransportType,
        response: &BindingResponse,
    ) -> Result<()>;

    /// Prepare a connection-oriented channel before the first request.
    ///
    /// Only called for tcp-active and tcp-so local candidates; the agent bounds
    /// it with the configured connect timeout.
    async fn connect(
        &self,
        _local: SocketAddr,
        _remote: SocketAddr,
        _transport: TransportType,
    ) -> Result<()> {
        Ok(())
    }
}

/// Serializes candidates for the signalling channel
pub trait CandidateCodec: Send + Sync {
    /// Encode local candidates
    fn encode(&self, candidates: &[Candidate]) -> Result<Bytes>;

    /// Decode the peer's candidates, stamping them with the peer's role
    fn decode(&self, data: &[u8], remote_controlling: bool) -> Result<Vec<Candidate>>;
}

/// Takes over the selected pair once checks complete
#[async_trait]
pub trait ChannelEstablisher: Send + Sync {
    /// Build the application channel over the selected pair
    async fn establish(&self, pair: &SelectedPair) -> Result<()>;
}

/// JSON candidate codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCandidateCodec;

impl CandidateCodec for JsonCandidateCodec {
    fn encode(&self, candidates: &[Candidate]) -> Result<Bytes> {
        let encoded = serde_json::to_vec(candidates)?;
        Ok(Bytes::from(encoded))
    }

    fn decode(&self, data: &[u8], remote_controlling: bool) -> Result<Vec<Candidate>> {
        let mut candidates: Vec<Candidate> =
            serde_json::from_slice(data).map_err(|e| Error::malformed(e.to_string()))?;

        if candidates.is_empty() {
            return Err(Error::malformed("no candidates offered"));
        }

        for candidate in &mut candidates {
            if candidate.component == 0 {
                return Err(Error::malformed(format!(
                    "candidate {} has component id 0",
                    candidate.address
                )));
            }
            candidate.controlling = remote_controlling;
        }

        Ok(candidates)
    }
}
