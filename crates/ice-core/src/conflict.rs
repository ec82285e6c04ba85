//! Role-conflict detection and repair (RFC 8445 section 7.3.1.1)
//!
//! Both agents compare tie-breakers the same way, so the agent with the larger
//! tie-breaker always ends up controlling:
//!
//! | local role   | request claims | local tb vs remote tb | result                   |
//! |--------------|----------------|-----------------------|--------------------------|
//! | controlling  | controlling    | greater               | reject with 487          |
//! | controlling  | controlling    | less                  | switch to controlled     |
//! | controlled   | controlled     | greater               | switch to controlling    |
//! | controlled   | controlled     | less                  | reject with 487          |
//! | any          | same claim     | equal                 | reject (loopback)        |

use crate::config::IceRole;
use crate::message::RoleAttribute;

/// What to do with an inbound request after the role check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleResolution {
    /// Roles agree
    NoConflict,

    /// Switch to the given role, recompute priorities and keep processing
    SwitchRole(IceRole),

    /// Keep our role and answer with 487 Role Conflict
    RejectConflict,

    /// Identical tie-breakers: the request is our own, reject it
    RejectLoopback,
}

/// Compare an inbound role claim with our own role
pub fn resolve_role_conflict(local_role: IceRole, local_tie_breaker: u64, claim: RoleAttribute) -> RoleResolution {
    if claim.is_controlling() != local_role.is_controlling() {
        return RoleResolution::NoConflict;
    }

    let remote_tie_breaker = claim.tie_breaker();
    if local_tie_breaker == remote_tie_breaker {
        return RoleResolution::RejectLoopback;
    }

    let local_wins = local_tie_breaker > remote_tie_breaker;
    match (local_role, local_wins) {
        (IceRole::Controlling, true) => RoleResolution::RejectConflict,
        (IceRole::Controlling, false) => RoleResolution::SwitchRole(IceRole::Controlled),
        (IceRole::Controlled, true) => RoleResolution::SwitchRole(IceRole::Controlling),
        (IceRole::Controlled, false) => RoleResolution::RejectConflict,
    }
}

/// Role to adopt after our request claiming `sent` was rejected with 487
pub fn role_after_rejection(sent: RoleAttribute) -> IceRole {
    sent.role().flipped()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_conflict_when_roles_differ() {
        assert_eq!(
            resolve_role_conflict(IceRole::Controlling, 5, RoleAttribute::Controlled(9)),
            RoleResolution::NoConflict
        );
        assert_eq!(
            resolve_role_conflict(IceRole::Controlled, 5, RoleAttribute::Controlling(9)),
            RoleResolution::NoConflict
        );
    }

    #[test]
    fn test_lower_controlling_tie_breaker_flips() {
        // Local B=5 believes controlling, remote A=9 claims controlling
        assert_eq!(
            resolve_role_conflict(IceRole::Controlling, 5, RoleAttribute::Controlling(9)),
            RoleResolution::SwitchRole(IceRole::Controlled)
        );
        // Remote A=9 receiving B's controlling claim keeps its role and rejects
        assert_eq!(
            resolve_role_conflict(IceRole::Controlling, 9, RoleAttribute::Controlling(5)),
            RoleResolution::RejectConflict
        );
    }

    #[test]
    fn test_controlled_conflict_promotes_larger_tie_breaker() {
        assert_eq!(
            resolve_role_conflict(IceRole::Controlled, 9, RoleAttribute::Controlled(5)),
            RoleResolution::SwitchRole(IceRole::Controlling)
        );
        assert_eq!(
            resolve_role_conflict(IceRole::Controlled, 5, RoleAttribute::Controlled(9)),
            RoleResolution::RejectConflict
        );
    }

    #[test]
    fn test_equal_tie_breakers_are_loopback() {
        assert_eq!(
            resolve_role_conflict(IceRole::Controlling, 7, RoleAttribute::Controlling(7)),
            RoleResolution::RejectLoopback
        );
    }

    #[test]
    fn test_role_after_rejection() {
        assert_eq!(role_after_rejection(RoleAttribute::Controlling(1)), IceRole::Controlled);
        assert_eq!(role_after_rejection(RoleAttribute::Controlled(1)), IceRole::Controlling);
    }
}
