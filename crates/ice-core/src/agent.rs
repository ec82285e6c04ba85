use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::candidate::{Candidate, CandidateType, TransportType};
use crate::checklist::CheckListState;
use crate::config::{IceConfig, IceRole};
use crate::conflict::{RoleResolution, resolve_role_conflict, role_after_rejection};
use crate::error::{Error, Result};
use crate::message::{
    BAD_REQUEST, BindingRequest, BindingResponse, CheckMessage, InboundMessage, ROLE_CONFLICT,
    ResponseKind, RoleAttribute, TransactionId,
};
use crate::pair::{CandidatePair, CandidatePairState, SelectedPair, TriggerAction};
use crate::priority::candidate_priority;
use crate::scheduler::{CheckExecutor, spawn_scheduler};
use crate::stream::MediaStream;
use crate::transaction::{
    CheckTransaction, RetransmitSchedule, TransactionHandle, TransactionOutcome, TransactionTable,
};
use crate::transport::{CandidateCodec, ChannelEstablisher, MessageTransport};

/// ICE agent state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceAgentState {
    /// Checks are running
    Running,

    /// Every stream has a nominated pair
    Completed,

    /// Every stream failed, or the agent was closed before completing
    Failed,
}

impl std::fmt::Display for IceAgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// ICE agent events
#[derive(Debug, Clone)]
pub enum IceAgentEvent {
    /// State change
    StateChange(IceAgentState),

    /// Role changed after a conflict
    RoleChanged(IceRole),

    /// Peer reflexive candidate discovered
    PeerReflexiveCandidate {
        /// true for a local candidate, false for a remote one
        local: bool,
        candidate: Candidate,
    },

    /// A pair was nominated
    PairNominated(SelectedPair),

    /// Selected pair after completion
    SelectedPairChange(SelectedPair),

    /// The channel establisher failed for the selected pair
    ChannelError(String),

    /// The agent failed
    Failed { reason: String },
}

/// Bounded set of recently processed request transaction ids
#[derive(Debug)]
struct RecentRequests {
    capacity: usize,
    order: VecDeque<TransactionId>,
    seen: HashSet<TransactionId>,
}

impl RecentRequests {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Returns false if the id was already recorded
    fn insert(&mut self, id: TransactionId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

/// Request answered before the check list existed, applied once it does
#[derive(Debug, Clone)]
struct EarlyRequest {
    local: SocketAddr,
    remote: SocketAddr,
    transport: TransportType,
    request: BindingRequest,
}

/// ICE agent: owns the role, the tie-breaker, the stream and the outcome
pub struct IceAgent {
    id: Uuid,
    config: IceConfig,
    role: RwLock<IceRole>,
    tie_breaker: u64,
    streams: RwLock<Vec<Arc<MediaStream>>>,
    state_tx: watch::Sender<IceAgentState>,
    failure: Mutex<Option<String>>,
    transactions: TransactionTable,
    transport: Arc<dyn MessageTransport>,
    establisher: Mutex<Option<Arc<dyn ChannelEstablisher>>>,
    event_tx: Mutex<Option<mpsc::Sender<IceAgentEvent>>>,
    recent_requests: Mutex<RecentRequests>,
    early_requests: Mutex<VecDeque<EarlyRequest>>,
    started: AtomicBool,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    me: Weak<IceAgent>,
}

impl IceAgent {
    /// Create a new ICE agent with a random tie-breaker
    pub fn new(
        config: IceConfig,
        transport: Arc<dyn MessageTransport>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<IceAgentEvent>)> {
        Self::with_tie_breaker(config, transport, rand::random::<u64>())
    }

    /// Create a new ICE agent with a fixed tie-breaker
    pub fn with_tie_breaker(
        config: IceConfig,
        transport: Arc<dyn MessageTransport>,
        tie_breaker: u64,
    ) -> Result<(Arc<Self>, mpsc::Receiver<IceAgentEvent>)> {
        config.validate()?;

        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);
        let (state_tx, _) = watch::channel(IceAgentState::Running);
        let (shutdown_tx, _) = watch::channel(false);
        let id = Uuid::new_v4();

        debug!(agent = %id, role = %config.initial_role, tie_breaker, "Creating ICE agent");

        let agent = Arc::new_cyclic(|me| Self {
            id,
            role: RwLock::new(config.initial_role),
            tie_breaker,
            streams: RwLock::new(Vec::new()),
            state_tx,
            failure: Mutex::new(None),
            transactions: TransactionTable::new(),
            transport,
            establisher: Mutex::new(None),
            event_tx: Mutex::new(Some(event_tx)),
            recent_requests: Mutex::new(RecentRequests::new(config.seen_request_cache_size)),
            early_requests: Mutex::new(VecDeque::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            me: me.clone(),
            config,
        });

        Ok((agent, event_rx))
    }

    /// Agent identifier used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Configuration
    pub fn config(&self) -> &IceConfig {
        &self.config
    }

    /// Current role
    pub fn role(&self) -> IceRole {
        *self.role.read()
    }

    /// Session tie-breaker
    pub fn tie_breaker(&self) -> u64 {
        self.tie_breaker
    }

    /// Current state
    pub fn state(&self) -> IceAgentState {
        *self.state_tx.borrow()
    }

    /// Failure reason once FAILED
    pub fn failure_reason(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Whether [`IceAgent::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Set the collaborator that takes over the selected pair
    pub fn set_channel_establisher(&self, establisher: Arc<dyn ChannelEstablisher>) {
        *self.establisher.lock() = Some(establisher);
    }

    /// The media stream, once started
    pub fn stream(&self) -> Option<Arc<MediaStream>> {
        self.streams.read().first().cloned()
    }

    fn streams(&self) -> Vec<Arc<MediaStream>> {
        self.streams.read().clone()
    }

    /// Local candidates, including discovered peer reflexive ones
    pub fn local_candidates(&self) -> Vec<Candidate> {
        self.stream().map(|s| s.local_candidates()).unwrap_or_default()
    }

    /// Remote candidates, including discovered peer reflexive ones
    pub fn remote_candidates(&self) -> Vec<Candidate> {
        self.stream().map(|s| s.remote_candidates()).unwrap_or_default()
    }

    /// Number of transactions waiting for a response
    pub fn pending_transactions(&self) -> usize {
        self.transactions.len()
    }

    /// Every nominated pair, highest priority first
    pub fn nominated_pairs(&self) -> Vec<SelectedPair> {
        let mut pairs: Vec<Arc<CandidatePair>> = self
            .streams()
            .iter()
            .flat_map(|s| s.checklist().nominated_pairs())
            .collect();
        pairs.sort_by(|a, b| b.priority().cmp(&a.priority()));
        pairs.iter().map(|p| p.to_selected()).collect()
    }

    /// Highest-priority nominated pair
    pub fn selected_pair(&self) -> Option<SelectedPair> {
        self.nominated_pairs().into_iter().next()
    }

    /// Build the check list and start the scheduler.
    ///
    /// Local candidates are stamped with the current role. Requests the peer
    /// sent before this call are applied to the new check list first. Fails
    /// the agent when no pair can be formed.
    pub fn start(&self, local: Vec<Candidate>, remote: Vec<Candidate>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::invalid_state("connectivity checks already started"));
        }

        let controlling = self.role().is_controlling();
        let local: Vec<Candidate> = local
            .into_iter()
            .map(|mut c| {
                c.controlling = controlling;
                c
            })
            .collect();

        let stream = match MediaStream::new("stream-0", local, remote, controlling) {
            Ok(stream) => Arc::new(stream),
            Err(e) => {
                self.fail(e.to_string());
                return Err(e);
            }
        };

        let (active_streams, early) = {
            let mut early = self.early_requests.lock();
            let mut streams = self.streams.write();
            streams.push(stream.clone());
            (streams.len(), early.drain(..).collect::<Vec<_>>())
        };
        let ta = self.config.ta(active_streams);

        for early in early {
            let id = early.request.transaction_id;
            if !self.recent_requests.lock().insert(id) {
                continue;
            }
            debug!(agent = %self.id, transaction = %id, remote = %early.remote, "Applying early request");
            if let Err(e) = self.apply_request(&stream, early.local, early.remote, early.transport, &early.request) {
                warn!(agent = %self.id, transaction = %id, error = %e, "Cannot apply early request");
            }
        }

        info!(
            agent = %self.id,
            role = %self.role(),
            pairs = stream.checklist().len(),
            ta_ms = ta.as_millis() as u64,
            "Starting connectivity checks"
        );

        let mut tasks = self.tasks.lock();
        tasks.push(spawn_scheduler(
            self.me.clone(),
            stream,
            ta,
            self.shutdown_tx.subscribe(),
        ));
        if let Some(limit) = self.config.check_timeout {
            tasks.push(self.spawn_watchdog(limit));
        }

        Ok(())
    }

    /// Decode the peer's candidates with `codec` and start checks.
    ///
    /// Undecodable candidate data fails the whole agent.
    pub fn start_with_remote_data(
        &self,
        local: Vec<Candidate>,
        remote_data: &[u8],
        codec: &dyn CandidateCodec,
    ) -> Result<()> {
        let remote_controlling = !self.role().is_controlling();
        match codec.decode(remote_data, remote_controlling) {
            Ok(remote) => self.start(local, remote),
            Err(e) => {
                error!(agent = %self.id, error = %e, "Cannot decode remote candidates");
                self.fail(e.to_string());
                Err(e)
            }
        }
    }

    /// Wait until the agent is COMPLETED or FAILED
    pub async fn wait_for_completion(&self) -> Result<SelectedPair> {
        let mut state_rx = self.state_tx.subscribe();
        let state = *state_rx
            .wait_for(|s| *s != IceAgentState::Running)
            .await
            .map_err(|_| Error::Closed)?;

        match state {
            IceAgentState::Completed => self
                .selected_pair()
                .ok_or_else(|| Error::invalid_state("completed without a nominated pair")),
            IceAgentState::Failed => Err(Error::check_failed(
                self.failure_reason().unwrap_or_else(|| "unknown".to_string()),
            )),
            IceAgentState::Running => Err(Error::invalid_state("agent still running")),
        }
    }

    /// Feed an inbound request or response from the message transport
    pub async fn handle_message(&self, message: InboundMessage) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        match message.message {
            CheckMessage::Request(request) => {
                self.handle_request(message.local, message.remote, message.transport, request)
                    .await
            }
            CheckMessage::Response(response) => {
                let id = response.transaction_id;
                if !self.transactions.deliver(response) {
                    trace!(agent = %self.id, transaction = %id, "Dropping uncorrelated response");
                }
                Ok(())
            }
        }
    }

    /// ICMP destination unreachable for packets sent from `local` to `remote`.
    /// Returns the number of transactions aborted.
    pub fn handle_icmp_unreachable(&self, local: SocketAddr, remote: SocketAddr) -> usize {
        let aborted = self.transactions.deliver_icmp(local, remote);
        debug!(agent = %self.id, %local, %remote, aborted, "ICMP unreachable");
        aborted
    }

    /// Close the agent, cancelling every outstanding transaction. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(agent = %self.id, "Closing ICE agent");

        self.fail("agent closed");
        self.release_resources();

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.event_tx.lock() = None;

        Ok(())
    }

    fn role_attribute(&self, role: IceRole) -> RoleAttribute {
        match role {
            IceRole::Controlling => RoleAttribute::Controlling(self.tie_breaker),
            IceRole::Controlled => RoleAttribute::Controlled(self.tie_breaker),
        }
    }

    fn emit_event(&self, event: IceAgentEvent) {
        let event_tx = self.event_tx.lock().clone();
        if let Some(tx) = event_tx {
            if let Err(e) = tx.try_send(event) {
                debug!(agent = %self.id, "Dropping event: {}", e);
            }
        }
    }

    /// Move out of RUNNING. Returns false when already terminal.
    fn transition_state(&self, next: IceAgentState) -> bool {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == IceAgentState::Running && next != IceAgentState::Running {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            info!(agent = %self.id, "ICE agent state changed: {} -> {}", IceAgentState::Running, next);
            self.emit_event(IceAgentEvent::StateChange(next));
        }
        changed
    }

    fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.state() != IceAgentState::Running {
            return;
        }
        self.failure.lock().get_or_insert_with(|| reason.clone());
        if !self.transition_state(IceAgentState::Failed) {
            return;
        }
        warn!(agent = %self.id, reason = %reason, "ICE agent failed");
        self.emit_event(IceAgentEvent::Failed { reason });
        self.release_resources();
    }

    fn release_resources(&self) {
        self.shutdown_tx.send_replace(true);
        for stream in self.streams() {
            stream.close();
        }
        self.transactions.clear();
    }

    fn switch_role(&self, role: IceRole) {
        {
            let mut current = self.role.write();
            if *current == role {
                return;
            }
            *current = role;
        }
        info!(agent = %self.id, role = %role, "Switched role, recomputing pair priorities");
        for stream in self.streams() {
            stream.set_controlling(role.is_controlling());
        }
        self.emit_event(IceAgentEvent::RoleChanged(role));
    }

    fn spawn_watchdog(&self, limit: Duration) -> JoinHandle<()> {
        let agent = self.me.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(limit) => {
                    if let Some(agent) = agent.upgrade() {
                        agent.fail(format!(
                            "no nominated pair after {}ms",
                            limit.as_millis()
                        ));
                    }
                }
                _ = shutdown.changed() => {}
            }
        })
    }

    async fn process_outcome(
        &self,
        stream: &Arc<MediaStream>,
        pair: &Arc<CandidatePair>,
        request: &BindingRequest,
        outcome: TransactionOutcome,
    ) {
        if self.is_closed() {
            return;
        }
        let id = request.transaction_id;

        match outcome {
            TransactionOutcome::Success(response) => match response.kind {
                ResponseKind::Success { mapped_address } => {
                    self.process_success(stream, pair, request, mapped_address);
                }
                ResponseKind::Error {
                    code: ROLE_CONFLICT,
                    ..
                } => {
                    self.process_role_conflict_response(stream, pair, request);
                }
                ResponseKind::Error { code, reason } => {
                    debug!(agent = %self.id, pair = %pair, code, reason = %reason, "Check rejected");
                    self.fail_pair(pair, id);
                }
            },
            TransactionOutcome::Timeout => {
                debug!(agent = %self.id, pair = %pair, "Check timed out");
                self.fail_pair(pair, id);
            }
            TransactionOutcome::IcmpError => {
                debug!(agent = %self.id, pair = %pair, "Check failed with ICMP error");
                self.fail_pair(pair, id);
            }
            TransactionOutcome::ConnectFailed(error) => {
                debug!(agent = %self.id, pair = %pair, error = %error, "Check connect failed");
                self.fail_pair(pair, id);
            }
            TransactionOutcome::Cancelled => {
                trace!(agent = %self.id, pair = %pair, "Check cancelled");
            }
        }

        self.update_states().await;
    }

    fn fail_pair(&self, pair: &CandidatePair, id: TransactionId) {
        if let Err(e) = pair.mark_failed(id) {
            warn!(agent = %self.id, pair = %pair, error = %e, "Cannot mark pair failed");
        }
    }

    fn process_success(
        &self,
        stream: &Arc<MediaStream>,
        pair: &Arc<CandidatePair>,
        request: &BindingRequest,
        mapped: SocketAddr,
    ) {
        let transport = pair.local().transport;
        let controlling = self.role().is_controlling();

        let local = match stream.find_local(mapped, transport) {
            Some(candidate) => candidate,
            None => {
                let candidate = Candidate::peer_reflexive(
                    mapped,
                    pair.local().base,
                    transport,
                    request.priority,
                    pair.component(),
                    controlling,
                );
                info!(agent = %self.id, candidate = %candidate, "Discovered peer reflexive local candidate");
                stream.add_local_candidate(candidate.clone());
                self.emit_event(IceAgentEvent::PeerReflexiveCandidate {
                    local: true,
                    candidate: candidate.clone(),
                });
                candidate
            }
        };

        let valid = if local.matches(pair.local().address, transport) {
            pair.clone()
        } else if let Some(existing) =
            stream
                .checklist()
                .find_pair(local.address, transport, pair.remote().address)
        {
            existing
        } else {
            Arc::new(CandidatePair::new(local, pair.remote().clone(), controlling))
        };

        if let Err(e) = pair.mark_succeeded(Some(request.transaction_id)) {
            warn!(agent = %self.id, pair = %pair, error = %e, "Cannot mark pair succeeded");
        }
        if !Arc::ptr_eq(&valid, pair) {
            if let Err(e) = valid.mark_succeeded(None) {
                warn!(agent = %self.id, pair = %valid, error = %e, "Cannot mark valid pair succeeded");
            }
        }
        stream.checklist().add_valid(valid.clone());
        debug!(agent = %self.id, pair = %pair, valid = %valid, "Check succeeded");

        let aggressive = request.use_candidate && request.role.is_controlling() && self.role().is_controlling();
        let deferred = pair.take_nominate_on_success() | valid.take_nominate_on_success();
        if (aggressive || deferred) && valid.nominate() {
            info!(agent = %self.id, pair = %valid, deferred, "Nominated pair");
            self.emit_event(IceAgentEvent::PairNominated(valid.to_selected()));
        }

        self.unfreeze_foundation(stream, pair);
    }

    fn process_role_conflict_response(
        &self,
        stream: &Arc<MediaStream>,
        pair: &Arc<CandidatePair>,
        request: &BindingRequest,
    ) {
        let corrected = role_after_rejection(request.role);
        info!(agent = %self.id, pair = %pair, role = %corrected, "Peer reported role conflict");
        self.switch_role(corrected);

        match pair.requeue_after_conflict(request.transaction_id) {
            Ok(true) => {
                stream.checklist().enqueue_triggered(pair.clone());
            }
            Ok(false) => {
                trace!(agent = %self.id, pair = %pair, "Pair already rescheduled");
            }
            Err(e) => {
                warn!(agent = %self.id, pair = %pair, error = %e, "Cannot requeue pair");
            }
        }
    }

    /// Unfreeze pairs of the same foundation: other components of the
    /// originating stream, every component of sibling streams
    fn unfreeze_foundation(&self, origin: &Arc<MediaStream>, pair: &CandidatePair) {
        for stream in self.streams() {
            let skip = Arc::ptr_eq(&stream, origin).then(|| pair.component());
            let unfrozen = stream.checklist().unfreeze_foundation(pair.foundation(), skip);
            if unfrozen > 0 {
                debug!(
                    agent = %self.id,
                    stream = %stream.name(),
                    foundation = %pair.foundation(),
                    unfrozen,
                    "Unfroze pairs"
                );
            }
        }
    }

    async fn handle_request(
        &self,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        transport: TransportType,
        request: BindingRequest,
    ) -> Result<()> {
        let id = request.transaction_id;

        match resolve_role_conflict(self.role(), self.tie_breaker, request.role) {
            RoleResolution::NoConflict => {}
            RoleResolution::SwitchRole(role) => {
                info!(agent = %self.id, %remote_addr, role = %role, "Role conflict, switching role");
                self.switch_role(role);
            }
            RoleResolution::RejectConflict => {
                debug!(agent = %self.id, %remote_addr, "Role conflict, keeping role and rejecting");
                return self
                    .transport
                    .send_response(local_addr, remote_addr, transport, &BindingResponse::role_conflict(id))
                    .await;
            }
            RoleResolution::RejectLoopback => {
                warn!(agent = %self.id, %remote_addr, "Request carries our own tie-breaker, rejecting");
                let response = BindingResponse::error(id, BAD_REQUEST, "Identical tie-breaker");
                return self
                    .transport
                    .send_response(local_addr, remote_addr, transport, &response)
                    .await;
            }
        }

        if let Err(e) = self
            .transport
            .send_response(
                local_addr,
                remote_addr,
                transport,
                &BindingResponse::success(id, remote_addr),
            )
            .await
        {
            warn!(agent = %self.id, %remote_addr, error = %e, "Failed to send check response");
        }

        let stream = {
            let mut early = self.early_requests.lock();
            match self.stream() {
                Some(stream) => stream,
                None => {
                    if early.iter().any(|e| e.request.transaction_id == id) {
                        trace!(agent = %self.id, transaction = %id, "Retransmitted early request");
                        return Ok(());
                    }
                    if early.len() >= self.config.seen_request_cache_size {
                        early.pop_front();
                    }
                    debug!(agent = %self.id, %remote_addr, transaction = %id, "Request before checks started, keeping it");
                    early.push_back(EarlyRequest {
                        local: local_addr,
                        remote: remote_addr,
                        transport,
                        request,
                    });
                    return Ok(());
                }
            }
        };
        if stream.state() != CheckListState::Running {
            return Ok(());
        }

        if !self.recent_requests.lock().insert(id) {
            trace!(agent = %self.id, transaction = %id, "Retransmitted request, already processed");
            return Ok(());
        }

        self.apply_request(&stream, local_addr, remote_addr, transport, &request)?;
        self.update_states().await;
        Ok(())
    }

    /// Learn the source, trigger a check on the pair and honour USE-CANDIDATE
    fn apply_request(
        &self,
        stream: &Arc<MediaStream>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        transport: TransportType,
        request: &BindingRequest,
    ) -> Result<()> {
        let Some(local) = stream.find_local(local_addr, transport) else {
            warn!(agent = %self.id, %local_addr, "Request on unknown local address");
            return Ok(());
        };

        let remote = match stream.find_remote(remote_addr, transport) {
            Some(candidate) => candidate,
            None => {
                let candidate = Candidate::peer_reflexive(
                    remote_addr,
                    remote_addr,
                    transport.peer_transport(),
                    request.priority,
                    local.component,
                    !self.role().is_controlling(),
                );
                info!(agent = %self.id, candidate = %candidate, "Discovered peer reflexive remote candidate");
                stream.add_remote_candidate(candidate.clone());
                self.emit_event(IceAgentEvent::PeerReflexiveCandidate {
                    local: false,
                    candidate: candidate.clone(),
                });
                candidate
            }
        };

        let pair = match stream.checklist().find_pair(local.address, transport, remote.address) {
            Some(pair) => {
                match pair.prepare_triggered() {
                    Ok(TriggerAction::Enqueue) => {
                        stream.checklist().enqueue_triggered(pair.clone());
                    }
                    Ok(TriggerAction::AlreadySucceeded) => {}
                    Err(e) => {
                        warn!(agent = %self.id, pair = %pair, error = %e, "Cannot trigger check");
                    }
                }
                pair
            }
            None => {
                let pair = Arc::new(CandidatePair::new(local, remote, self.role().is_controlling()));
                pair.transition(CandidatePairState::Waiting)?;
                // Checked from both the triggered queue and the ordinary list
                stream.checklist().add_pair(pair.clone());
                stream.checklist().enqueue_triggered(pair.clone());
                debug!(agent = %self.id, pair = %pair, "Created pair from inbound request");
                pair
            }
        };

        if request.use_candidate && !self.role().is_controlling() {
            if pair.nominate_or_defer() {
                stream.checklist().add_valid(pair.clone());
                info!(agent = %self.id, pair = %pair, "Nominated pair on peer request");
                self.emit_event(IceAgentEvent::PairNominated(pair.to_selected()));
            } else {
                debug!(agent = %self.id, pair = %pair, "Nomination deferred until check succeeds");
            }
        }

        Ok(())
    }

    async fn update_states(&self) {
        let streams = self.streams();
        if streams.is_empty() || self.state() != IceAgentState::Running {
            return;
        }

        for stream in &streams {
            stream.update_state();
        }

        if streams.iter().all(|s| s.state() == CheckListState::Completed) {
            self.complete(&streams).await;
        } else if streams.iter().all(|s| s.state() == CheckListState::Failed) {
            self.fail("connectivity checks failed for every stream");
        }
    }

    async fn complete(&self, streams: &[Arc<MediaStream>]) {
        let Some(selected) = self.selected_pair() else {
            return;
        };
        if !self.transition_state(IceAgentState::Completed) {
            return;
        }

        info!(
            agent = %self.id,
            local = %selected.local,
            remote = %selected.remote,
            "Connectivity established"
        );

        self.shutdown_tx.send_replace(true);
        for stream in streams {
            stream.checklist().cancel_all();
        }
        self.emit_event(IceAgentEvent::SelectedPairChange(selected.clone()));

        let establisher = self.establisher.lock().clone();
        if let Some(establisher) = establisher {
            if let Err(e) = establisher.establish(&selected).await {
                error!(agent = %self.id, error = %e, "Failed to establish channel on selected pair");
                self.emit_event(IceAgentEvent::ChannelError(e.to_string()));
            }
        }
    }
}

impl CheckExecutor for IceAgent {
    fn execute_check(self: Arc<Self>, stream: Arc<MediaStream>, pair: Arc<CandidatePair>, triggered: bool) {
        if self.is_closed() {
            return;
        }

        let role = self.role();
        let id = TransactionId::random();
        let handle = TransactionHandle::new(id);
        let use_candidate = role.is_controlling();

        match pair.start_check(handle.clone(), use_candidate) {
            Ok(true) => {}
            Ok(false) => {
                trace!(agent = %self.id, pair = %pair, "Pair already succeeded, skipping check");
                return;
            }
            Err(e) => {
                warn!(agent = %self.id, pair = %pair, error = %e, "Cannot start check");
                return;
            }
        }

        let request = BindingRequest {
            transaction_id: id,
            priority: candidate_priority(
                CandidateType::PeerReflexive,
                self.config.local_preference,
                pair.component(),
            ),
            use_candidate,
            role: self.role_attribute(role),
        };
        let transaction = CheckTransaction {
            request: request.clone(),
            local: pair.local().base,
            remote: pair.remote().address,
            transport: pair.local().transport,
            schedule: RetransmitSchedule::from_config(&self.config),
            connect_timeout: self.config.tcp_connect_timeout(pair.remote().address),
            handle,
        };

        debug!(
            agent = %self.id,
            pair = %pair,
            transaction = %id,
            triggered,
            use_candidate,
            "Starting connectivity check"
        );

        tokio::spawn(async move {
            let outcome = transaction
                .run(self.transport.as_ref(), &self.transactions)
                .await;
            self.process_outcome(&stream, &pair, &request, outcome).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct CapturingTransport {
        requests: Mutex<Vec<(SocketAddr, SocketAddr, BindingRequest)>>,
        responses: Mutex<Vec<(SocketAddr, SocketAddr, BindingResponse)>>,
    }

    #[async_trait]
    impl MessageTransport for CapturingTransport {
        async fn send_request(
            &self,
            local: SocketAddr,
            remote: SocketAddr,
            _transport: TransportType,
            request: &BindingRequest,
        ) -> Result<()> {
            self.requests.lock().push((local, remote, request.clone()));
            Ok(())
        }

        async fn send_response(
            &self,
            local: SocketAddr,
            remote: SocketAddr,
            _transport: TransportType,
            response: &BindingResponse,
        ) -> Result<()> {
            self.responses.lock().push((local, remote, response.clone()));
            Ok(())
        }
    }

    const LOCAL: &str = "10.0.0.1:5000";
    const REMOTE: &str = "10.0.0.2:5000";

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn agent(role: IceRole, tie_breaker: u64) -> (Arc<IceAgent>, Arc<CapturingTransport>) {
        let transport = Arc::new(CapturingTransport::default());
        let config = IceConfig::builder().role(role).build().unwrap();
        let (agent, _events) = IceAgent::with_tie_breaker(config, transport.clone(), tie_breaker).unwrap();
        (agent, transport)
    }

    fn start(agent: &IceAgent) {
        agent
            .start(
                vec![Candidate::host(addr(LOCAL), TransportType::Udp, true)],
                vec![Candidate::host(addr(REMOTE), TransportType::Udp, false)],
            )
            .unwrap();
    }

    fn request(role: RoleAttribute, use_candidate: bool) -> InboundMessage {
        InboundMessage {
            local: addr(LOCAL),
            remote: addr(REMOTE),
            transport: TransportType::Udp,
            message: CheckMessage::Request(BindingRequest {
                transaction_id: TransactionId::random(),
                priority: 1_862_270_975,
                use_candidate,
                role,
            }),
        }
    }

    #[test]
    fn test_recent_requests_evicts_oldest() {
        let mut recent = RecentRequests::new(2);
        let (a, b, c) = (TransactionId::random(), TransactionId::random(), TransactionId::random());
        assert!(recent.insert(a));
        assert!(!recent.insert(a));
        assert!(recent.insert(b));
        assert!(recent.insert(c));
        assert!(recent.insert(a));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lower_tie_breaker_switches_to_controlled() {
        let (agent, transport) = agent(IceRole::Controlling, 5);
        start(&agent);

        agent
            .handle_message(request(RoleAttribute::Controlling(9), false))
            .await
            .unwrap();

        assert_eq!(agent.role(), IceRole::Controlled);
        let responses = transport.responses.lock();
        assert!(matches!(responses[0].2.kind, ResponseKind::Success { .. }));
        // Priorities were recomputed as controlled
        let pair = agent.stream().unwrap().checklist().pairs()[0].clone();
        assert_eq!(
            pair.priority(),
            crate::priority::pair_priority_for_role(pair.local().priority, pair.remote().priority, false)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_higher_tie_breaker_rejects_with_role_conflict() {
        let (agent, transport) = agent(IceRole::Controlling, 9);
        start(&agent);

        agent
            .handle_message(request(RoleAttribute::Controlling(5), false))
            .await
            .unwrap();

        assert_eq!(agent.role(), IceRole::Controlling);
        assert!(transport.responses.lock()[0].2.is_role_conflict());
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_tie_breakers_rejected_as_loopback() {
        let (agent, transport) = agent(IceRole::Controlling, 7);
        start(&agent);

        agent
            .handle_message(request(RoleAttribute::Controlling(7), false))
            .await
            .unwrap();

        let responses = transport.responses.lock();
        assert!(matches!(
            responses[0].2.kind,
            ResponseKind::Error { code: BAD_REQUEST, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_source_creates_peer_reflexive_remote() {
        let (agent, transport) = agent(IceRole::Controlled, 1);
        start(&agent);

        let mut inbound = request(RoleAttribute::Controlling(2), false);
        inbound.remote = addr("10.0.0.2:6000");
        agent.handle_message(inbound).await.unwrap();

        let remote = agent.remote_candidates();
        let prflx = remote
            .iter()
            .find(|c| c.address == addr("10.0.0.2:6000"))
            .unwrap();
        assert_eq!(prflx.candidate_type, CandidateType::PeerReflexive);
        assert_eq!(prflx.priority, 1_862_270_975);

        let stream = agent.stream().unwrap();
        let pair = stream
            .checklist()
            .find_pair(addr(LOCAL), TransportType::Udp, addr("10.0.0.2:6000"))
            .unwrap();
        assert!(stream.checklist().triggered().iter().any(|p| Arc::ptr_eq(p, &pair)) || pair.state() == CandidatePairState::InProgress);
        assert_eq!(stream.checklist().len(), 2);

        let responses = transport.responses.lock();
        assert_eq!(
            responses[0].2.kind,
            ResponseKind::Success {
                mapped_address: addr("10.0.0.2:6000")
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmitted_request_answered_but_processed_once() {
        let (agent, transport) = agent(IceRole::Controlled, 1);
        start(&agent);

        let inbound = request(RoleAttribute::Controlling(2), true);
        agent.handle_message(inbound.clone()).await.unwrap();
        agent.handle_message(inbound).await.unwrap();

        assert_eq!(transport.responses.lock().len(), 2);
        let pair = agent.stream().unwrap().checklist().pairs()[0].clone();
        assert!(pair.nominate_on_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_before_start_applied_on_start() {
        let (agent, transport) = agent(IceRole::Controlled, 1);

        let inbound = request(RoleAttribute::Controlling(2), true);
        agent.handle_message(inbound.clone()).await.unwrap();
        agent.handle_message(inbound).await.unwrap();

        // Answered both times, nothing to apply it to yet
        assert_eq!(transport.responses.lock().len(), 2);
        assert!(agent.stream().is_none());

        start(&agent);

        let stream = agent.stream().unwrap();
        let pair = stream.checklist().pairs()[0].clone();
        assert!(pair.nominate_on_success());
        assert_eq!(pair.state(), CandidatePairState::Waiting);
        let triggered = stream.checklist().triggered();
        assert_eq!(triggered.len(), 1);
        assert!(Arc::ptr_eq(&triggered[0], &pair));
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_request_from_unknown_source_learns_candidate() {
        let (agent, _transport) = agent(IceRole::Controlled, 1);

        let mut inbound = request(RoleAttribute::Controlling(2), false);
        inbound.remote = addr("10.0.0.2:6000");
        agent.handle_message(inbound).await.unwrap();
        assert!(agent.remote_candidates().is_empty());

        start(&agent);

        let prflx = agent
            .remote_candidates()
            .into_iter()
            .find(|c| c.address == addr("10.0.0.2:6000"))
            .unwrap();
        assert_eq!(prflx.candidate_type, CandidateType::PeerReflexive);
        assert_eq!(agent.stream().unwrap().checklist().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_nomination_fires_once_on_success() {
        let transport = Arc::new(CapturingTransport::default());
        let config = IceConfig::builder().role(IceRole::Controlled).build().unwrap();
        let (agent, mut events) = IceAgent::with_tie_breaker(config, transport.clone(), 1).unwrap();
        start(&agent);

        // Ordinary check in flight
        sleep(Duration::from_millis(10)).await;
        let pair = agent.stream().unwrap().checklist().pairs()[0].clone();
        assert_eq!(pair.state(), CandidatePairState::InProgress);
        let first = transport.requests.lock()[0].2.transaction_id;

        agent
            .handle_message(request(RoleAttribute::Controlling(2), true))
            .await
            .unwrap();
        assert!(pair.nominate_on_success());
        assert!(!pair.is_nominated());

        // The triggered check goes out on the next pulse
        sleep(Duration::from_millis(250)).await;
        let second = transport.requests.lock().last().unwrap().2.transaction_id;
        assert_ne!(first, second);

        agent
            .handle_message(InboundMessage {
                local: addr(LOCAL),
                remote: addr(REMOTE),
                transport: TransportType::Udp,
                message: CheckMessage::Response(BindingResponse::success(second, addr(LOCAL))),
            })
            .await
            .unwrap();
        sleep(Duration::from_millis(10)).await;

        assert!(pair.is_nominated());
        assert_eq!(agent.state(), IceAgentState::Completed);

        // A repeated nomination request changes nothing
        agent
            .handle_message(request(RoleAttribute::Controlling(2), true))
            .await
            .unwrap();

        let mut nominated = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, IceAgentEvent::PairNominated(_)) {
                nominated += 1;
            }
        }
        assert_eq!(nominated, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_remote_data_fails_agent() {
        let (agent, _transport) = agent(IceRole::Controlling, 1);
        let result = agent.start_with_remote_data(
            vec![Candidate::host(addr(LOCAL), TransportType::Udp, true)],
            b"{ nope",
            &crate::transport::JsonCandidateCodec,
        );

        assert!(matches!(result, Err(Error::MalformedCandidates { .. })));
        assert_eq!(agent.state(), IceAgentState::Failed);
        assert!(agent.wait_for_completion().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent_and_cancels_transactions() {
        let (agent, transport) = agent(IceRole::Controlling, 1);
        start(&agent);

        // Let the first check go out
        sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.requests.lock().len(), 1);
        assert_eq!(agent.pending_transactions(), 1);

        agent.close().await.unwrap();
        agent.close().await.unwrap();

        assert!(agent.is_closed());
        assert_eq!(agent.state(), IceAgentState::Failed);
        assert_eq!(agent.pending_transactions(), 0);
        assert!(matches!(
            agent.handle_message(request(RoleAttribute::Controlled(2), false)).await,
            Err(Error::Closed)
        ));

        sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.requests.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_checks_fail_agent() {
        let (agent, transport) = agent(IceRole::Controlling, 1);
        start(&agent);

        let result = agent.wait_for_completion().await;
        assert!(matches!(result, Err(Error::CheckFailed { .. })));
        assert_eq!(agent.state(), IceAgentState::Failed);
        assert_eq!(transport.requests.lock().len(), 7);
    }
}
