//! Candidate pairs and their state machine
//!
//! ```text
//!             triggered / unfreeze
//!   Frozen ───────────────────────▶ Waiting ──▶ InProgress ──▶ Succeeded
//!                                     ▲  ▲          │
//!                                     │  └──────────┤ (triggered check cancels
//!                                     │             │  the outstanding transaction)
//!                                     │             ▼
//!                                     └──────────  Failed
//!                                   triggered retry
//! ```
//!
//! All mutable pair data sits behind one lock per pair so that the success
//! path and the inbound triggered-check path never interleave halfway through
//! an update.

use std::net::SocketAddr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::candidate::{Candidate, TransportType};
use crate::error::{Error, Result};
use crate::foundation::pair_foundation;
use crate::priority::pair_priority_for_role;
use crate::transaction::TransactionHandle;

/// Candidate pair state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidatePairState {
    /// Initial state (blocked by foundation grouping)
    Frozen,

    /// Waiting for its turn
    Waiting,

    /// Transaction outstanding
    InProgress,

    /// Check succeeded
    Succeeded,

    /// Check failed
    Failed,
}

impl CandidatePairState {
    /// Whether moving from `self` to `to` is allowed
    pub fn can_transition_to(self, to: CandidatePairState) -> bool {
        use CandidatePairState::*;
        match (self, to) {
            (from, to) if from == to => true,
            (_, Waiting) => true,
            (Waiting, InProgress) => true,
            (InProgress, Succeeded) | (InProgress, Failed) => true,
            // A response that outlived its cancelled transaction
            (Waiting, Succeeded) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for CandidatePairState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frozen => write!(f, "frozen"),
            Self::Waiting => write!(f, "waiting"),
            Self::InProgress => write!(f, "in-progress"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Identity of a pair within a check list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub local: SocketAddr,
    pub local_transport: TransportType,
    pub remote: SocketAddr,
}

/// The pair handed to the application once checks complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedPair {
    /// Local candidate
    pub local: Candidate,

    /// Remote candidate
    pub remote: Candidate,

    /// Pair priority at selection time
    pub priority: u64,
}

/// What an inbound request does to an existing pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    /// The pair must be queued as a triggered check
    Enqueue,

    /// The pair already succeeded; nothing to do
    AlreadySucceeded,
}

#[derive(Debug)]
struct PairInner {
    state: CandidatePairState,
    priority: u64,
    nominated: bool,
    use_candidate: bool,
    nominate_on_success: bool,
    transaction: Option<TransactionHandle>,
}

/// A (local, remote) candidate pair
#[derive(Debug)]
pub struct CandidatePair {
    local: Candidate,
    remote: Candidate,
    foundation: String,
    inner: Mutex<PairInner>,
}

impl CandidatePair {
    /// Create a frozen pair
    pub fn new(local: Candidate, remote: Candidate, local_controlling: bool) -> Self {
        let priority = pair_priority_for_role(local.priority, remote.priority, local_controlling);
        let foundation = pair_foundation(local.foundation, remote.foundation);
        Self {
            local,
            remote,
            foundation,
            inner: Mutex::new(PairInner {
                state: CandidatePairState::Frozen,
                priority,
                nominated: false,
                use_candidate: false,
                nominate_on_success: false,
                transaction: None,
            }),
        }
    }

    /// Local candidate
    pub fn local(&self) -> &Candidate {
        &self.local
    }

    /// Remote candidate
    pub fn remote(&self) -> &Candidate {
        &self.remote
    }

    /// Pair foundation
    pub fn foundation(&self) -> &str {
        &self.foundation
    }

    /// Component id shared by both candidates
    pub fn component(&self) -> u16 {
        self.local.component
    }

    /// Identity within the check list
    pub fn key(&self) -> PairKey {
        PairKey {
            local: self.local.address,
            local_transport: self.local.transport,
            remote: self.remote.address,
        }
    }

    /// Current state
    pub fn state(&self) -> CandidatePairState {
        self.inner.lock().state
    }

    /// Current priority
    pub fn priority(&self) -> u64 {
        self.inner.lock().priority
    }

    /// Whether the pair has been nominated
    pub fn is_nominated(&self) -> bool {
        self.inner.lock().nominated
    }

    /// Whether the last request for this pair carried USE-CANDIDATE
    pub fn use_candidate(&self) -> bool {
        self.inner.lock().use_candidate
    }

    /// Whether a nomination is waiting for this pair's check to succeed
    pub fn nominate_on_success(&self) -> bool {
        self.inner.lock().nominate_on_success
    }

    /// Id of the outstanding transaction, if any
    pub fn transaction_id(&self) -> Option<crate::message::TransactionId> {
        self.inner.lock().transaction.as_ref().map(|h| h.id())
    }

    /// Move to `to`, returning the previous state
    pub fn transition(&self, to: CandidatePairState) -> Result<CandidatePairState> {
        let mut inner = self.inner.lock();
        Self::transition_locked(&mut inner, to, self)
    }

    fn transition_locked(
        inner: &mut PairInner,
        to: CandidatePairState,
        pair: &CandidatePair,
    ) -> Result<CandidatePairState> {
        let from = inner.state;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }
        if from != to {
            trace!(pair = %pair, "Pair state {} -> {}", from, to);
        }
        inner.state = to;
        Ok(from)
    }

    /// Recompute the priority after a role change
    pub fn recompute_priority(&self, local_controlling: bool) {
        let priority =
            pair_priority_for_role(self.local.priority, self.remote.priority, local_controlling);
        self.inner.lock().priority = priority;
    }

    /// Begin a check with `handle` as the pair's transaction.
    ///
    /// Frozen and failed pairs pass through Waiting first; an in-progress pair
    /// has its current transaction cancelled. Returns false when the pair has
    /// already succeeded and needs no check.
    pub fn start_check(&self, handle: TransactionHandle, use_candidate: bool) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.state {
            CandidatePairState::Succeeded => return Ok(false),
            CandidatePairState::Waiting => {}
            CandidatePairState::InProgress => {
                if let Some(previous) = inner.transaction.take() {
                    previous.cancel();
                }
                Self::transition_locked(&mut inner, CandidatePairState::Waiting, self)?;
            }
            CandidatePairState::Frozen | CandidatePairState::Failed => {
                Self::transition_locked(&mut inner, CandidatePairState::Waiting, self)?;
            }
        }
        Self::transition_locked(&mut inner, CandidatePairState::InProgress, self)?;
        inner.use_candidate = use_candidate;
        inner.transaction = Some(handle);
        Ok(true)
    }

    /// React to an inbound request for this pair
    pub fn prepare_triggered(&self) -> Result<TriggerAction> {
        let mut inner = self.inner.lock();
        match inner.state {
            CandidatePairState::Succeeded => Ok(TriggerAction::AlreadySucceeded),
            CandidatePairState::InProgress => {
                if let Some(previous) = inner.transaction.take() {
                    previous.cancel();
                }
                Self::transition_locked(&mut inner, CandidatePairState::Waiting, self)?;
                Ok(TriggerAction::Enqueue)
            }
            CandidatePairState::Frozen | CandidatePairState::Waiting | CandidatePairState::Failed => {
                Self::transition_locked(&mut inner, CandidatePairState::Waiting, self)?;
                Ok(TriggerAction::Enqueue)
            }
        }
    }

    /// Record a successful check. A success that arrives after its
    /// transaction was superseded still counts; any newer transaction is
    /// cancelled. Returns false if the pair had already succeeded.
    pub fn mark_succeeded(&self, transaction: Option<crate::message::TransactionId>) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.state == CandidatePairState::Succeeded {
            return Ok(false);
        }
        if let Some(current) = inner.transaction.take() {
            if Some(current.id()) != transaction {
                current.cancel();
            }
        }
        if matches!(inner.state, CandidatePairState::Frozen | CandidatePairState::Failed) {
            Self::transition_locked(&mut inner, CandidatePairState::Waiting, self)?;
        }
        Self::transition_locked(&mut inner, CandidatePairState::Succeeded, self)?;
        Ok(true)
    }

    /// Record a failed check for `transaction`. Ignored (returns false) when a
    /// newer transaction owns the pair or the pair is no longer in progress.
    pub fn mark_failed(&self, transaction: crate::message::TransactionId) -> Result<bool> {
        let mut inner = self.inner.lock();
        let owns = inner.transaction.as_ref().map(|h| h.id()) == Some(transaction);
        if !owns || inner.state != CandidatePairState::InProgress {
            return Ok(false);
        }
        inner.transaction = None;
        Self::transition_locked(&mut inner, CandidatePairState::Failed, self)?;
        Ok(true)
    }

    /// Return an in-progress pair to Waiting after a role-conflict error so it
    /// can be retried. Returns false when `transaction` no longer owns the pair.
    pub fn requeue_after_conflict(&self, transaction: crate::message::TransactionId) -> Result<bool> {
        let mut inner = self.inner.lock();
        let owns = inner.transaction.as_ref().map(|h| h.id()) == Some(transaction);
        if !owns {
            return Ok(false);
        }
        inner.transaction = None;
        Self::transition_locked(&mut inner, CandidatePairState::Waiting, self)?;
        Ok(true)
    }

    /// Nominate the pair. Returns true only the first time.
    pub fn nominate(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.nominated {
            return false;
        }
        inner.nominated = true;
        inner.nominate_on_success = false;
        true
    }

    /// Nominate if already succeeded, otherwise remember to nominate when the
    /// pair's own check succeeds. Returns true if nominated now.
    pub fn nominate_or_defer(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.nominated {
            return false;
        }
        if inner.state == CandidatePairState::Succeeded {
            inner.nominated = true;
            inner.nominate_on_success = false;
            true
        } else {
            inner.nominate_on_success = true;
            false
        }
    }

    /// Consume a deferred nomination
    pub fn take_nominate_on_success(&self) -> bool {
        std::mem::take(&mut self.inner.lock().nominate_on_success)
    }

    /// Cancel the outstanding transaction, if any
    pub fn cancel_transaction(&self) {
        if let Some(handle) = self.inner.lock().transaction.take() {
            handle.cancel();
        }
    }

    /// Snapshot for the application
    pub fn to_selected(&self) -> SelectedPair {
        SelectedPair {
            local: self.local.clone(),
            remote: self.remote.clone(),
            priority: self.priority(),
        }
    }
}

impl std::fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} -> {}/{}",
            self.local.address, self.local.candidate_type, self.remote.address, self.remote.candidate_type
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TransactionId;

    fn pair() -> CandidatePair {
        let local = Candidate::host("10.0.0.1:5000".parse().unwrap(), TransportType::Udp, true);
        let remote = Candidate::host("10.0.0.2:5000".parse().unwrap(), TransportType::Udp, false);
        CandidatePair::new(local, remote, true)
    }

    #[test]
    fn test_new_pair_is_frozen_with_joined_foundation() {
        let p = pair();
        assert_eq!(p.state(), CandidatePairState::Frozen);
        assert_eq!(
            p.foundation(),
            format!("{}:{}", p.local().foundation, p.remote().foundation)
        );
        assert_eq!(p.component(), p.remote().component);
    }

    #[test]
    fn test_frozen_cannot_jump_to_in_progress() {
        let p = pair();
        assert!(matches!(
            p.transition(CandidatePairState::InProgress),
            Err(Error::InvalidTransition { .. })
        ));
        assert_eq!(p.state(), CandidatePairState::Frozen);
    }

    #[test]
    fn test_start_check_passes_through_waiting() {
        let p = pair();
        let handle = TransactionHandle::new(TransactionId::random());
        assert!(p.start_check(handle.clone(), false).unwrap());
        assert_eq!(p.state(), CandidatePairState::InProgress);
        assert_eq!(p.transaction_id(), Some(handle.id()));
    }

    #[test]
    fn test_restart_cancels_previous_transaction() {
        let p = pair();
        let first = TransactionHandle::new(TransactionId::random());
        let second = TransactionHandle::new(TransactionId::random());
        p.start_check(first.clone(), false).unwrap();
        p.start_check(second.clone(), false).unwrap();

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(p.transaction_id(), Some(second.id()));
    }

    #[test]
    fn test_triggered_on_in_progress_cancels_and_waits() {
        let p = pair();
        let handle = TransactionHandle::new(TransactionId::random());
        p.start_check(handle.clone(), false).unwrap();

        assert_eq!(p.prepare_triggered().unwrap(), TriggerAction::Enqueue);
        assert!(handle.is_cancelled());
        assert_eq!(p.state(), CandidatePairState::Waiting);
        assert_eq!(p.transaction_id(), None);
    }

    #[test]
    fn test_failed_pair_can_be_retried() {
        let p = pair();
        let handle = TransactionHandle::new(TransactionId::random());
        p.start_check(handle.clone(), false).unwrap();
        assert!(p.mark_failed(handle.id()).unwrap());
        assert_eq!(p.state(), CandidatePairState::Failed);

        assert_eq!(p.prepare_triggered().unwrap(), TriggerAction::Enqueue);
        assert_eq!(p.state(), CandidatePairState::Waiting);
    }

    #[test]
    fn test_stale_failure_is_ignored() {
        let p = pair();
        let old = TransactionHandle::new(TransactionId::random());
        let new = TransactionHandle::new(TransactionId::random());
        p.start_check(old.clone(), false).unwrap();
        p.start_check(new.clone(), false).unwrap();

        assert!(!p.mark_failed(old.id()).unwrap());
        assert_eq!(p.state(), CandidatePairState::InProgress);
    }

    #[test]
    fn test_succeeded_pair_ignores_triggers() {
        let p = pair();
        let handle = TransactionHandle::new(TransactionId::random());
        p.start_check(handle.clone(), true).unwrap();
        assert!(p.mark_succeeded(Some(handle.id())).unwrap());
        assert!(!p.mark_succeeded(Some(handle.id())).unwrap());

        assert_eq!(p.prepare_triggered().unwrap(), TriggerAction::AlreadySucceeded);
        assert!(!p.start_check(TransactionHandle::new(TransactionId::random()), false).unwrap());
        assert!(p.use_candidate());
    }

    #[test]
    fn test_deferred_nomination_fires_once() {
        let p = pair();
        let handle = TransactionHandle::new(TransactionId::random());
        p.start_check(handle.clone(), false).unwrap();

        assert!(!p.nominate_or_defer());
        assert!(p.nominate_on_success());

        p.mark_succeeded(Some(handle.id())).unwrap();
        assert!(p.take_nominate_on_success());
        assert!(p.nominate());
        assert!(!p.take_nominate_on_success());
        assert!(!p.nominate());
    }

    #[test]
    fn test_priority_recomputed_on_role_change() {
        let local = Candidate::host("10.0.0.1:5000".parse().unwrap(), TransportType::Udp, true)
            .with_local_preference(100);
        let remote = Candidate::host("10.0.0.2:5000".parse().unwrap(), TransportType::Udp, false);
        let p = CandidatePair::new(local, remote, true);
        let controlling = p.priority();

        p.recompute_priority(false);
        assert_ne!(p.priority(), controlling);
        assert_eq!(p.priority() & 1, 1);
        assert_eq!(controlling & 1, 0);
    }
}
