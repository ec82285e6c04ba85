//! Media stream: the candidates, check list and completion state of one stream

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::candidate::{Candidate, TransportType};
use crate::checklist::{CheckList, CheckListState, form_pairs};
use crate::error::{Error, Result};
use crate::pair::CandidatePair;

/// One media stream of the session
pub struct MediaStream {
    name: String,
    local_candidates: RwLock<Vec<Candidate>>,
    remote_candidates: RwLock<Vec<Candidate>>,
    components: BTreeSet<u16>,
    checklist: CheckList,
}

impl MediaStream {
    /// Build the stream and its check list.
    ///
    /// Fails with [`Error::NoCandidatePairs`] when no pair can be formed.
    pub fn new(
        name: impl Into<String>,
        local: Vec<Candidate>,
        remote: Vec<Candidate>,
        local_controlling: bool,
    ) -> Result<Self> {
        let name = name.into();
        let pairs = form_pairs(&local, &remote, local_controlling);
        if pairs.is_empty() {
            return Err(Error::NoCandidatePairs);
        }
        let components = pairs.iter().map(|p| p.component()).collect();
        debug!(
            stream = %name,
            local = local.len(),
            remote = remote.len(),
            pairs = pairs.len(),
            "Created media stream"
        );

        Ok(Self {
            name,
            local_candidates: RwLock::new(local),
            remote_candidates: RwLock::new(remote),
            components,
            checklist: CheckList::new(pairs),
        })
    }

    /// Stream name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The stream's check list
    pub fn checklist(&self) -> &CheckList {
        &self.checklist
    }

    /// List state
    pub fn state(&self) -> CheckListState {
        self.checklist.state()
    }

    /// Snapshot of local candidates
    pub fn local_candidates(&self) -> Vec<Candidate> {
        self.local_candidates.read().clone()
    }

    /// Snapshot of remote candidates
    pub fn remote_candidates(&self) -> Vec<Candidate> {
        self.remote_candidates.read().clone()
    }

    /// Local candidate with this address and transport
    pub fn find_local(&self, addr: SocketAddr, transport: TransportType) -> Option<Candidate> {
        self.local_candidates
            .read()
            .iter()
            .find(|c| c.matches(addr, transport))
            .cloned()
    }

    /// Remote candidate at `addr` that a local candidate of `local_transport` can talk to
    pub fn find_remote(&self, addr: SocketAddr, local_transport: TransportType) -> Option<Candidate> {
        self.remote_candidates
            .read()
            .iter()
            .find(|c| c.address == addr && local_transport.pairs_with(c.transport))
            .cloned()
    }

    /// Register a local candidate discovered during checks
    pub fn add_local_candidate(&self, candidate: Candidate) {
        let mut local = self.local_candidates.write();
        if !local.iter().any(|c| c.matches(candidate.address, candidate.transport)) {
            debug!(stream = %self.name, candidate = %candidate, "Added local candidate");
            local.push(candidate);
        }
    }

    /// Register a remote candidate discovered during checks
    pub fn add_remote_candidate(&self, candidate: Candidate) {
        let mut remote = self.remote_candidates.write();
        if !remote.iter().any(|c| c.matches(candidate.address, candidate.transport)) {
            debug!(stream = %self.name, candidate = %candidate, "Added remote candidate");
            remote.push(candidate);
        }
    }

    /// Re-stamp candidates and recompute pair priorities after a role flip
    pub fn set_controlling(&self, local_controlling: bool) {
        for candidate in self.local_candidates.write().iter_mut() {
            candidate.controlling = local_controlling;
        }
        for candidate in self.remote_candidates.write().iter_mut() {
            candidate.controlling = !local_controlling;
        }
        self.checklist.recompute_priorities(local_controlling);
    }

    /// Whether a nominated pair exists for every component
    pub fn has_nominated_all_components(&self) -> bool {
        let nominated: BTreeSet<u16> = self
            .checklist
            .nominated_pairs()
            .iter()
            .map(|p| p.component())
            .collect();
        self.components.is_subset(&nominated)
    }

    /// Highest-priority nominated pair
    pub fn selected_pair(&self) -> Option<Arc<CandidatePair>> {
        self.checklist.nominated_pairs().into_iter().next()
    }

    /// Re-evaluate the list state. Returns the new state if it changed.
    pub fn update_state(&self) -> Option<CheckListState> {
        if self.checklist.state() != CheckListState::Running {
            return None;
        }

        let next = if self.has_nominated_all_components() {
            CheckListState::Completed
        } else if self.checklist.all_failed() {
            CheckListState::Failed
        } else {
            return None;
        };

        self.checklist.set_state(next);
        info!(stream = %self.name, state = %next, "Check list finished");
        Some(next)
    }

    /// Stop all checks of this stream
    pub fn close(&self) {
        if self.checklist.state() == CheckListState::Running {
            self.checklist.set_state(CheckListState::Failed);
        }
        self.checklist.cancel_all();
    }
}
