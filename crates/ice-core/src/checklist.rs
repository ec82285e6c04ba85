//! Check list construction and bookkeeping
//!
//! # Building
//!
//! [`form_pairs`] crosses every local candidate with every remote candidate
//! and keeps a pair only when the component ids match, both addresses belong
//! to the same family and the transports can talk to each other. Pairs whose
//! local side is server reflexive are dropped outright: the host candidate
//! they are based on is always present and checks the same path. The result
//! is sorted by descending priority and de-duplicated.
//!
//! [`CheckList::new`] then unfreezes one pair per foundation: the one with the
//! lowest component id, ties broken by higher priority.
//!
//! # Scheduling order
//!
//! [`CheckList::next_pair`] picks, in order: the highest-priority triggered
//! check, the highest-priority Waiting pair, the highest-priority Frozen pair
//! (unfrozen on the spot).

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::candidate::{Candidate, CandidateType, TransportType};
use crate::pair::{CandidatePair, CandidatePairState, PairKey};

/// List-level state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckListState {
    /// Checks are running
    Running,

    /// A nominated pair exists for every component
    Completed,

    /// No pair can succeed any more
    Failed,
}

impl std::fmt::Display for CheckListState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Form, prune and sort pairs from the two candidate sets
pub fn form_pairs(
    local: &[Candidate],
    remote: &[Candidate],
    local_controlling: bool,
) -> Vec<Arc<CandidatePair>> {
    let mut pairs: Vec<Arc<CandidatePair>> = Vec::new();

    for l in local {
        if l.candidate_type == CandidateType::ServerReflexive {
            trace!(candidate = %l, "Pruning server reflexive local candidate");
            continue;
        }
        for r in remote {
            if l.component != r.component || !l.same_family(r) || !l.transport.pairs_with(r.transport) {
                continue;
            }
            pairs.push(Arc::new(CandidatePair::new(l.clone(), r.clone(), local_controlling)));
        }
    }

    pairs.sort_by(|a, b| b.priority().cmp(&a.priority()));

    let mut seen = std::collections::HashSet::new();
    pairs.retain(|p| seen.insert(p.key()));
    pairs
}

/// Move the first pair of each foundation group to Waiting
fn unfreeze_initial(pairs: &[Arc<CandidatePair>]) {
    let mut leaders: HashMap<&str, &Arc<CandidatePair>> = HashMap::new();
    for pair in pairs {
        leaders
            .entry(pair.foundation())
            .and_modify(|leader| {
                let better = pair.component() < leader.component()
                    || (pair.component() == leader.component() && pair.priority() > leader.priority());
                if better {
                    *leader = pair;
                }
            })
            .or_insert(pair);
    }
    for leader in leaders.values() {
        if leader.state() == CandidatePairState::Frozen {
            let _ = leader.transition(CandidatePairState::Waiting);
        }
    }
}

/// Ordered pairs of one stream, its triggered-check queue and its valid set
pub struct CheckList {
    pairs: RwLock<Vec<Arc<CandidatePair>>>,
    triggered: Mutex<VecDeque<Arc<CandidatePair>>>,
    valid: RwLock<Vec<Arc<CandidatePair>>>,
    state: Mutex<CheckListState>,
    triggered_notify: Notify,
}

impl CheckList {
    /// Create a check list from formed pairs and unfreeze one per foundation
    pub fn new(pairs: Vec<Arc<CandidatePair>>) -> Self {
        unfreeze_initial(&pairs);
        debug!(pairs = pairs.len(), "Check list built");
        Self {
            pairs: RwLock::new(pairs),
            triggered: Mutex::new(VecDeque::new()),
            valid: RwLock::new(Vec::new()),
            state: Mutex::new(CheckListState::Running),
            triggered_notify: Notify::new(),
        }
    }

    /// List state
    pub fn state(&self) -> CheckListState {
        *self.state.lock()
    }

    /// Set the list state, returning the previous one
    pub fn set_state(&self, state: CheckListState) -> CheckListState {
        std::mem::replace(&mut *self.state.lock(), state)
    }

    /// Snapshot of the ordinary pairs in priority order
    pub fn pairs(&self) -> Vec<Arc<CandidatePair>> {
        self.pairs.read().clone()
    }

    /// Number of ordinary pairs
    pub fn len(&self) -> usize {
        self.pairs.read().len()
    }

    /// Whether the list has no pairs
    pub fn is_empty(&self) -> bool {
        self.pairs.read().is_empty()
    }

    /// Snapshot of the triggered-check queue
    pub fn triggered(&self) -> Vec<Arc<CandidatePair>> {
        self.triggered.lock().iter().cloned().collect()
    }

    /// Pick the next pair to check. The flag is true for triggered checks.
    pub fn next_pair(&self) -> Option<(Arc<CandidatePair>, bool)> {
        if let Some(pair) = self.pop_triggered() {
            return Some((pair, true));
        }

        let pairs = self.pairs.read();
        if let Some(pair) = pairs.iter().find(|p| p.state() == CandidatePairState::Waiting) {
            return Some((pair.clone(), false));
        }
        for pair in pairs.iter() {
            if pair.state() == CandidatePairState::Frozen
                && pair.transition(CandidatePairState::Waiting).is_ok()
            {
                trace!(pair = %pair, "Unfroze pair for scheduling");
                return Some((pair.clone(), false));
            }
        }
        None
    }

    fn pop_triggered(&self) -> Option<Arc<CandidatePair>> {
        let mut queue = self.triggered.lock();
        let mut best: Option<(usize, u64)> = None;
        for (i, pair) in queue.iter().enumerate() {
            let priority = pair.priority();
            if best.is_none_or(|(_, p)| priority > p) {
                best = Some((i, priority));
            }
        }
        best.and_then(|(i, _)| queue.remove(i))
    }

    /// Queue a triggered check; a pair is queued at most once
    pub fn enqueue_triggered(&self, pair: Arc<CandidatePair>) -> bool {
        {
            let mut queue = self.triggered.lock();
            if queue.iter().any(|p| Arc::ptr_eq(p, &pair)) {
                return false;
            }
            trace!(pair = %pair, "Queued triggered check");
            queue.push_back(pair);
        }
        self.triggered_notify.notify_one();
        true
    }

    /// Wait until a triggered check is queued
    pub async fn triggered_available(&self) {
        self.triggered_notify.notified().await
    }

    /// Add a pair to the ordinary list, keeping priority order
    pub fn add_pair(&self, pair: Arc<CandidatePair>) -> bool {
        let mut pairs = self.pairs.write();
        if pairs.iter().any(|p| p.key() == pair.key()) {
            return false;
        }
        let priority = pair.priority();
        let at = pairs.partition_point(|p| p.priority() >= priority);
        pairs.insert(at, pair);
        true
    }

    /// Find a pair by its local address/transport and remote address
    pub fn find_pair(
        &self,
        local: SocketAddr,
        local_transport: TransportType,
        remote: SocketAddr,
    ) -> Option<Arc<CandidatePair>> {
        let key = PairKey {
            local,
            local_transport,
            remote,
        };
        self.pairs
            .read()
            .iter()
            .chain(self.valid.read().iter())
            .find(|p| p.key() == key)
            .cloned()
    }

    /// Recompute priorities of every pair after a role change and re-sort
    pub fn recompute_priorities(&self, local_controlling: bool) {
        let mut pairs = self.pairs.write();
        for pair in pairs.iter() {
            pair.recompute_priority(local_controlling);
        }
        pairs.sort_by(|a, b| b.priority().cmp(&a.priority()));
        drop(pairs);

        for pair in self.triggered.lock().iter() {
            pair.recompute_priority(local_controlling);
        }
        for pair in self.valid.read().iter() {
            pair.recompute_priority(local_controlling);
        }
    }

    /// Add a pair to the valid set. Adding the same pair twice has no effect.
    pub fn add_valid(&self, pair: Arc<CandidatePair>) -> bool {
        let mut valid = self.valid.write();
        if valid.iter().any(|p| Arc::ptr_eq(p, &pair) || p.key() == pair.key()) {
            return false;
        }
        debug!(pair = %pair, "Pair added to valid list");
        valid.push(pair);
        true
    }

    /// Snapshot of the valid set
    pub fn valid_pairs(&self) -> Vec<Arc<CandidatePair>> {
        self.valid.read().clone()
    }

    /// Nominated valid pairs, highest priority first
    pub fn nominated_pairs(&self) -> Vec<Arc<CandidatePair>> {
        let mut nominated: Vec<_> = self
            .valid
            .read()
            .iter()
            .filter(|p| p.is_nominated())
            .cloned()
            .collect();
        nominated.sort_by(|a, b| b.priority().cmp(&a.priority()));
        nominated
    }

    /// Unfreeze the frozen pairs of `foundation`, optionally skipping one component
    pub fn unfreeze_foundation(&self, foundation: &str, skip_component: Option<u16>) -> usize {
        let mut unfrozen = 0;
        for pair in self.pairs.read().iter() {
            if pair.foundation() == foundation
                && Some(pair.component()) != skip_component
                && pair.state() == CandidatePairState::Frozen
                && pair.transition(CandidatePairState::Waiting).is_ok()
            {
                unfrozen += 1;
            }
        }
        unfrozen
    }

    /// Whether every pair has failed and nothing is left to try
    pub fn all_failed(&self) -> bool {
        let pairs = self.pairs.read();
        self.triggered.lock().is_empty()
            && self.valid.read().is_empty()
            && pairs.iter().all(|p| p.state() == CandidatePairState::Failed)
    }

    /// Cancel every outstanding transaction and drop queued triggered checks
    pub fn cancel_all(&self) {
        self.triggered.lock().clear();
        for pair in self.pairs.read().iter().chain(self.valid.read().iter()) {
            pair.cancel_transaction();
        }
        self.triggered_notify.notify_one();
    }
}
