//! Candidate and candidate-pair priority formulas (RFC 8445 sections 5.1.2 and 6.1.2.3)

use crate::candidate::CandidateType;

/// Local preference used when the host has a single interface
pub const DEFAULT_LOCAL_PREFERENCE: u16 = 65535;

/// Compute candidate priority
///
/// `priority = 2^24 * type_pref + 2^8 * local_pref + (256 - component_id)`
pub fn candidate_priority(candidate_type: CandidateType, local_preference: u16, component: u16) -> u32 {
    let component = u32::from(component.clamp(1, 256));
    (candidate_type.preference() << 24) | (u32::from(local_preference) << 8) | (256 - component)
}

/// Compute pair priority from the controlling side's candidate priority `g`
/// and the controlled side's `d`
///
/// `pair = 2^32 * MIN(G,D) + 2 * MAX(G,D) + (G > D ? 1 : 0)`
pub fn pair_priority(g: u32, d: u32) -> u64 {
    let (g, d) = (u128::from(g), u128::from(d));
    let value = (1u128 << 32) * g.min(d) + 2 * g.max(d) + u128::from(g > d);
    u64::try_from(value).unwrap_or(u64::MAX)
}

/// Pair priority as seen by an agent whose local candidate has `local`
/// priority and whose peer's has `remote`
pub fn pair_priority_for_role(local: u32, remote: u32, local_controlling: bool) -> u64 {
    if local_controlling {
        pair_priority(local, remote)
    } else {
        pair_priority(remote, local)
    }
}
