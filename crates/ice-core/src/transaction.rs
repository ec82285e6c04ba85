//! Connectivity-check transactions
//!
//! A transaction sends one [`BindingRequest`] and retransmits it with the same
//! transaction id until a response arrives, the retry budget runs out, an ICMP
//! error is reported, or the transaction is cancelled.
//!
//! # Retransmission schedule
//!
//! Send `i` happens at cumulative time `t_i = 2 * t_{i-1} + RTO` with `t_0 = 0`.
//! For an RTO of 100ms and 7 sends:
//!
//! ```text
//! send:   1    2     3     4     5      6      7
//! at:     0   100   300   700  1500   3100   6300 ms   then idle 1600ms -> Timeout
//! ```
//!
//! # Correlation
//!
//! Every outstanding transaction registers a one-shot channel in the agent's
//! [`TransactionTable`]. The inbound dispatcher resolves a response by
//! removing the entry and sending on it, so the first delivery wins and later
//! duplicates find nothing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Notify, oneshot};
use tokio::time::{sleep, timeout};
use tracing::{debug, trace, warn};

use crate::candidate::TransportType;
use crate::config::IceConfig;
use crate::error::Error;
use crate::message::{BindingRequest, BindingResponse, TransactionId};
use crate::transport::MessageTransport;

/// Send offsets and waits for one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitSchedule {
    rto: Duration,
    sends: u32,
    final_wait: Duration,
}

impl RetransmitSchedule {
    /// Create a schedule
    pub fn new(rto: Duration, sends: u32, final_wait: Duration) -> Self {
        Self {
            rto,
            sends: sends.max(1),
            final_wait,
        }
    }

    /// Schedule described by the agent configuration
    pub fn from_config(config: &IceConfig) -> Self {
        Self::new(config.rto, config.max_request_sends, config.final_response_wait)
    }

    /// Cumulative time of each send, relative to the first
    pub fn send_offsets(&self) -> Vec<Duration> {
        let mut offsets = Vec::with_capacity(self.sends as usize);
        let mut at = Duration::ZERO;
        offsets.push(at);
        for _ in 1..self.sends {
            at = at.saturating_mul(2).saturating_add(self.rto);
            offsets.push(at);
        }
        offsets
    }

    /// How long to wait after each send before the next one (the last entry
    /// is the final idle wait)
    pub fn waits(&self) -> Vec<Duration> {
        let offsets = self.send_offsets();
        let mut waits: Vec<Duration> = offsets
            .windows(2)
            .map(|w| w[1].saturating_sub(w[0]))
            .collect();
        waits.push(self.final_wait);
        waits
    }

    /// Time from the first send until a timeout is declared
    pub fn total(&self) -> Duration {
        self.waits()
            .into_iter()
            .fold(Duration::ZERO, |total, wait| total.saturating_add(wait))
    }
}

#[derive(Debug, Default)]
struct CancelSignal {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Handle used to cancel an outstanding transaction
#[derive(Debug, Clone)]
pub struct TransactionHandle {
    id: TransactionId,
    signal: Arc<CancelSignal>,
}

impl TransactionHandle {
    /// Create a handle for a new transaction
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            signal: Arc::new(CancelSignal::default()),
        }
    }

    /// Transaction id
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Stop further retransmissions and report `Cancelled` unless a response
    /// is already available
    pub fn cancel(&self) {
        if !self.signal.cancelled.swap(true, Ordering::SeqCst) {
            trace!(transaction = %self.id, "Cancelling transaction");
            self.signal.notify.notify_one();
        }
    }

    /// Whether cancel has been requested
    pub fn is_cancelled(&self) -> bool {
        self.signal.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.signal.notify.notified().await;
    }
}

/// What the dispatcher delivers to a waiting transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionReply {
    /// A response with the matching transaction id
    Response(BindingResponse),

    /// ICMP destination unreachable for the transaction's destination
    IcmpUnreachable,
}

/// Result of running a transaction
#[derive(Debug)]
pub enum TransactionOutcome {
    /// A response (success or error) was correlated
    Success(BindingResponse),

    /// No response after the full retry budget
    Timeout,

    /// Cancelled before any response arrived
    Cancelled,

    /// ICMP error, aborted without further retransmission
    IcmpError,

    /// TCP connect attempt failed or timed out
    ConnectFailed(Error),
}

struct PendingTransaction {
    local: SocketAddr,
    remote: SocketAddr,
    reply_tx: oneshot::Sender<TransactionReply>,
}

/// Transaction id -> waiting transaction, shared by all channels of an agent
#[derive(Default)]
pub struct TransactionTable {
    pending: DashMap<TransactionId, PendingTransaction>,
}

impl TransactionTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transaction and get the receiver its reply arrives on
    pub fn register(
        &self,
        id: TransactionId,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> oneshot::Receiver<TransactionReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingTransaction {
                local,
                remote,
                reply_tx,
            },
        );
        reply_rx
    }

    /// Deliver a response. Returns false when no transaction is waiting for it.
    pub fn deliver(&self, response: BindingResponse) -> bool {
        match self.pending.remove(&response.transaction_id) {
            Some((id, pending)) => {
                trace!(transaction = %id, "Correlated response");
                pending.reply_tx.send(TransactionReply::Response(response)).is_ok()
            }
            None => {
                trace!(transaction = %response.transaction_id, "No transaction waiting for response");
                false
            }
        }
    }

    /// Deliver an ICMP error to every transaction sent from `local` to
    /// `remote`. Returns how many were woken.
    pub fn deliver_icmp(&self, local: SocketAddr, remote: SocketAddr) -> usize {
        let ids: Vec<TransactionId> = self
            .pending
            .iter()
            .filter(|entry| entry.local == local && entry.remote == remote)
            .map(|entry| *entry.key())
            .collect();

        let mut woken = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                if pending.reply_tx.send(TransactionReply::IcmpUnreachable).is_ok() {
                    woken += 1;
                }
            }
        }
        woken
    }

    /// Forget a transaction
    pub fn remove(&self, id: &TransactionId) {
        self.pending.remove(id);
    }

    /// Number of outstanding transactions
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether there are no outstanding transactions
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every waiting transaction; their receivers observe cancellation
    pub fn clear(&self) {
        self.pending.clear();
    }
}

/// One connectivity check exchange
pub struct CheckTransaction {
    /// Request to send
    pub request: BindingRequest,

    /// Local base address to send from
    pub local: SocketAddr,

    /// Destination
    pub remote: SocketAddr,

    /// Transport of the local candidate
    pub transport: TransportType,

    /// Retransmission schedule
    pub schedule: RetransmitSchedule,

    /// Connect timeout for TCP transports
    pub connect_timeout: Duration,

    /// Cancellation handle
    pub handle: TransactionHandle,
}

impl CheckTransaction {
    /// Run the exchange to completion
    pub async fn run(
        self,
        transport: &dyn MessageTransport,
        table: &TransactionTable,
    ) -> TransactionOutcome {
        let id = self.request.transaction_id;

        if self.transport.opens_connection() {
            match timeout(
                self.connect_timeout,
                transport.connect(self.local, self.remote, self.transport),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(transaction = %id, remote = %self.remote, error = %e, "Connect failed");
                    return TransactionOutcome::ConnectFailed(Error::transport(format!(
                        "connect to {} failed: {e}",
                        self.remote
                    )));
                }
                Err(_) => {
                    debug!(transaction = %id, remote = %self.remote, "Connect timed out");
                    return TransactionOutcome::ConnectFailed(Error::ConnectTimeout {
                        destination: self.remote,
                        millis: self.connect_timeout.as_millis() as u64,
                    });
                }
            }
        }

        let mut reply_rx = table.register(id, self.local, self.remote);
        let outcome = self.send_loop(transport, &mut reply_rx).await;
        table.remove(&id);
        outcome
    }

    async fn send_loop(
        &self,
        transport: &dyn MessageTransport,
        reply_rx: &mut oneshot::Receiver<TransactionReply>,
    ) -> TransactionOutcome {
        let id = self.request.transaction_id;
        let waits = self.schedule.waits();
        let sends = waits.len();

        for (attempt, wait) in waits.into_iter().enumerate() {
            if let Some(outcome) = Self::poll_reply(reply_rx) {
                return outcome;
            }
            if self.handle.is_cancelled() {
                return Self::resolve_cancelled(reply_rx);
            }

            trace!(transaction = %id, attempt = attempt + 1, remote = %self.remote, "Sending check request");
            if let Err(e) = transport
                .send_request(self.local, self.remote, self.transport, &self.request)
                .await
            {
                if e.is_icmp_unreachable() {
                    debug!(transaction = %id, remote = %self.remote, "ICMP unreachable on send");
                    return TransactionOutcome::IcmpError;
                }
                warn!(transaction = %id, error = %e, "Failed to send check request");
            }

            let last = attempt + 1 == sends;
            tokio::select! {
                biased;
                reply = &mut *reply_rx => {
                    return match reply {
                        Ok(TransactionReply::Response(response)) => TransactionOutcome::Success(response),
                        Ok(TransactionReply::IcmpUnreachable) => TransactionOutcome::IcmpError,
                        Err(_) => TransactionOutcome::Cancelled,
                    };
                }
                _ = self.handle.cancelled() => {
                    return Self::resolve_cancelled(reply_rx);
                }
                _ = sleep(wait) => {
                    if last {
                        trace!(transaction = %id, "Final wait elapsed");
                    }
                }
            }
        }

        Self::poll_reply(reply_rx).unwrap_or(TransactionOutcome::Timeout)
    }

    fn poll_reply(reply_rx: &mut oneshot::Receiver<TransactionReply>) -> Option<TransactionOutcome> {
        match reply_rx.try_recv() {
            Ok(TransactionReply::Response(response)) => Some(TransactionOutcome::Success(response)),
            Ok(TransactionReply::IcmpUnreachable) => Some(TransactionOutcome::IcmpError),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(TransactionOutcome::Cancelled),
        }
    }

    /// A response that is already waiting beats the cancellation
    fn resolve_cancelled(reply_rx: &mut oneshot::Receiver<TransactionReply>) -> TransactionOutcome {
        match reply_rx.try_recv() {
            Ok(TransactionReply::Response(response)) => TransactionOutcome::Success(response),
            _ => TransactionOutcome::Cancelled,
        }
    }
}
