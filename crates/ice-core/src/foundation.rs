//! Foundation computation
//!
//! Two candidates share a foundation when they have the same type, base IP,
//! transport and (for reflexive and relayed candidates) the same server.
//!
//! The value is the first four bytes (big-endian) of a SHA-256 digest over
//! `type "/" base-octets "/" transport [ "/" server-octets server-port ]`,
//! where the names are the lowercase forms from `as_str()` and the port is
//! big-endian. The output is identical across builds and platforms. Distinct
//! inputs may collide with negligible probability.

use std::net::{IpAddr, SocketAddr};

use sha2::{Digest, Sha256};

use crate::candidate::{CandidateType, TransportType};

fn update_ip(hasher: &mut Sha256, ip: IpAddr) {
    match ip {
        IpAddr::V4(v4) => hasher.update(v4.octets()),
        IpAddr::V6(v6) => hasher.update(v6.octets()),
    }
}

/// Compute the foundation for a candidate
pub fn compute_foundation(
    candidate_type: CandidateType,
    base: IpAddr,
    transport: TransportType,
    related_server: Option<SocketAddr>,
) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(candidate_type.as_str().as_bytes());
    hasher.update(b"/");
    update_ip(&mut hasher, base);
    hasher.update(b"/");
    hasher.update(transport.as_str().as_bytes());
    match (candidate_type, related_server) {
        (CandidateType::ServerReflexive | CandidateType::Relayed, Some(server)) => {
            hasher.update(b"/");
            update_ip(&mut hasher, server.ip());
            hasher.update(server.port().to_be_bytes());
        }
        _ => {}
    }
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Foundation of a pair: both candidate foundations joined
pub fn pair_foundation(local: u32, remote: u32) -> String {
    format!("{local}:{remote}")
}
