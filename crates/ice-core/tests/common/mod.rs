//! In-memory network shared by the integration tests
//!
//! Every agent is attached at one or more addresses. Packets are delivered by
//! spawning a task that feeds the destination agent, so no agent is re-entered
//! while it is sending. A NAT binding rewrites the source of packets leaving an
//! internal address and routes packets sent to the public address back in.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use rvoip_ice_core::{
    BindingRequest, BindingResponse, CheckMessage, Error, IceAgent, IceAgentEvent, InboundMessage,
    MessageTransport, Result, TransportType,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

struct Endpoint {
    agent: Weak<IceAgent>,
    internal: SocketAddr,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: HashMap<SocketAddr, Endpoint>,
    nat: HashMap<SocketAddr, SocketAddr>,
    unreachable: HashSet<SocketAddr>,
    late_icmp: HashSet<SocketAddr>,
    requests: Vec<(SocketAddr, SocketAddr)>,
}

#[derive(Default)]
pub struct Network {
    inner: Mutex<NetworkInner>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transport(self: &Arc<Self>) -> Arc<dyn MessageTransport> {
        Arc::new(LoopbackTransport {
            network: self.clone(),
        })
    }

    /// Make `agent` reachable at `address`
    pub fn attach(&self, address: SocketAddr, agent: &Arc<IceAgent>) {
        self.inner.lock().endpoints.insert(
            address,
            Endpoint {
                agent: Arc::downgrade(agent),
                internal: address,
            },
        );
    }

    /// Put `agent` behind a NAT binding `internal` <-> `public`
    pub fn attach_behind_nat(&self, internal: SocketAddr, public: SocketAddr, agent: &Arc<IceAgent>) {
        let mut inner = self.inner.lock();
        inner.endpoints.insert(
            public,
            Endpoint {
                agent: Arc::downgrade(agent),
                internal,
            },
        );
        inner.nat.insert(internal, public);
    }

    /// Sends to `address` fail immediately with an ICMP error
    pub fn set_unreachable(&self, address: SocketAddr) {
        self.inner.lock().unreachable.insert(address);
    }

    /// Sends to `address` succeed but an ICMP error is reported afterwards
    pub fn set_late_icmp(&self, address: SocketAddr) {
        self.inner.lock().late_icmp.insert(address);
    }

    /// Number of requests sent to `address`
    pub fn requests_to(&self, address: SocketAddr) -> usize {
        self.inner
            .lock()
            .requests
            .iter()
            .filter(|(_, to)| *to == address)
            .count()
    }

    fn public_source(&self, local: SocketAddr) -> SocketAddr {
        self.inner.lock().nat.get(&local).copied().unwrap_or(local)
    }

    fn route(&self, destination: SocketAddr) -> Option<(Arc<IceAgent>, SocketAddr)> {
        let inner = self.inner.lock();
        let endpoint = inner.endpoints.get(&destination)?;
        Some((endpoint.agent.upgrade()?, endpoint.internal))
    }

    fn agent_at(&self, internal: SocketAddr) -> Option<Arc<IceAgent>> {
        self.inner
            .lock()
            .endpoints
            .values()
            .find(|e| e.internal == internal)
            .and_then(|e| e.agent.upgrade())
    }

    fn deliver(&self, local: SocketAddr, remote: SocketAddr, transport: TransportType, message: CheckMessage) {
        let source = self.public_source(local);
        let Some((agent, internal)) = self.route(remote) else {
            return;
        };
        tokio::spawn(async move {
            let _ = agent
                .handle_message(InboundMessage {
                    local: internal,
                    remote: source,
                    transport: transport.peer_transport(),
                    message,
                })
                .await;
        });
    }
}

struct LoopbackTransport {
    network: Arc<Network>,
}

#[async_trait]
impl MessageTransport for LoopbackTransport {
    async fn send_request(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        transport: TransportType,
        request: &BindingRequest,
    ) -> Result<()> {
        let (unreachable, late_icmp) = {
            let mut inner = self.network.inner.lock();
            inner.requests.push((local, remote));
            (inner.unreachable.contains(&remote), inner.late_icmp.contains(&remote))
        };

        if unreachable {
            return Err(Error::IcmpUnreachable { destination: remote });
        }
        if late_icmp {
            if let Some(sender) = self.network.agent_at(local) {
                tokio::spawn(async move {
                    sender.handle_icmp_unreachable(local, remote);
                });
            }
            return Ok(());
        }

        self.network
            .deliver(local, remote, transport, CheckMessage::Request(request.clone()));
        Ok(())
    }

    async fn send_response(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        transport: TransportType,
        response: &BindingResponse,
    ) -> Result<()> {
        self.network
            .deliver(local, remote, transport, CheckMessage::Response(response.clone()));
        Ok(())
    }
}

/// Every event currently queued
pub fn drain_events(events: &mut mpsc::Receiver<IceAgentEvent>) -> Vec<IceAgentEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
