//! In-process network used to run several nodes inside one test.
//!
//! Every endpoint is addressed by the `SocketAddr` its node advertises, so the
//! registry and dispatcher behave exactly as they do on a real network.
//! Envelopes still pass through the codec, which keeps payload limits and
//! decode failures in play.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::transport::{Inbound, Transport};
use crate::error::{Error, Result};
use crate::protocol::{decode, encode, Envelope};

const ENDPOINT_QUEUE: usize = 256;

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<SocketAddr, mpsc::Sender<Inbound>>,
    isolated: HashSet<SocketAddr>,
    silenced: HashSet<SocketAddr>,
}

/// Shared switchboard. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint and get its sending half plus its inbox.
    pub fn attach(
        &self,
        addr: SocketAddr,
        max_payload: usize,
    ) -> (MemoryTransport, mpsc::Receiver<Inbound>) {
        let (tx, rx) = mpsc::channel(ENDPOINT_QUEUE);
        self.state.lock().endpoints.insert(addr, tx);
        let transport = MemoryTransport {
            network: self.clone(),
            local: addr,
            max_payload,
        };
        (transport, rx)
    }

    pub fn detach(&self, addr: SocketAddr) {
        let mut state = self.state.lock();
        state.endpoints.remove(&addr);
        state.isolated.remove(&addr);
        state.silenced.remove(&addr);
    }

    /// Cut an endpoint off: nothing it sends arrives, nothing reaches it.
    pub fn isolate(&self, addr: SocketAddr) {
        self.state.lock().isolated.insert(addr);
    }

    /// Silently lose everything an endpoint sends while still delivering to
    /// it, like a peer that hangs without closing its sockets.
    pub fn silence(&self, addr: SocketAddr) {
        self.state.lock().silenced.insert(addr);
    }

    pub fn heal(&self, addr: SocketAddr) {
        let mut state = self.state.lock();
        state.isolated.remove(&addr);
        state.silenced.remove(&addr);
    }

    fn is_silenced(&self, addr: SocketAddr) -> bool {
        self.state.lock().silenced.contains(&addr)
    }

    /// Deliver raw bytes as if they arrived from `source`.
    pub async fn inject(&self, source: SocketAddr, target: SocketAddr, bytes: &[u8]) -> Result<()> {
        let envelope = decode(bytes, usize::MAX)?;
        let tx = self.route(source, target)?;
        tx.send(Inbound { envelope, source })
            .await
            .map_err(|_| Error::Transport(format!("{}: endpoint closed", target)))
    }

    fn route(&self, source: SocketAddr, target: SocketAddr) -> Result<mpsc::Sender<Inbound>> {
        let state = self.state.lock();
        if state.isolated.contains(&source) || state.isolated.contains(&target) {
            return Err(Error::Transport(format!("{}: unreachable", target)));
        }
        state
            .endpoints
            .get(&target)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("{}: connection refused", target)))
    }

    fn broadcast_targets(&self, source: SocketAddr) -> Vec<(SocketAddr, mpsc::Sender<Inbound>)> {
        let state = self.state.lock();
        if state.isolated.contains(&source) {
            return Vec::new();
        }
        state
            .endpoints
            .iter()
            .filter(|(addr, _)| !state.isolated.contains(addr))
            .map(|(addr, tx)| (*addr, tx.clone()))
            .collect()
    }
}

/// One node's handle onto a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: SocketAddr,
    max_payload: usize,
}

impl MemoryTransport {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn wire(&self, envelope: &Envelope) -> Result<Envelope> {
        let frame = encode(envelope, self.max_payload)?;
        Ok(decode(&frame, self.max_payload)?)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn broadcast(&self, envelope: &Envelope) -> Result<()> {
        let envelope = self.wire(envelope)?;
        if self.network.is_silenced(self.local) {
            return Ok(());
        }
        // Broadcast loops back to the sender, as UDP broadcast does.
        for (_, tx) in self.network.broadcast_targets(self.local) {
            let _ = tx
                .send(Inbound {
                    envelope: envelope.clone(),
                    source: self.local,
                })
                .await;
        }
        Ok(())
    }

    async fn send_to(&self, addr: SocketAddr, envelope: &Envelope) -> Result<()> {
        let envelope = self.wire(envelope)?;
        let tx = self.network.route(self.local, addr)?;
        if self.network.is_silenced(self.local) {
            return Ok(());
        }
        tx.send(Inbound {
            envelope,
            source: self.local,
        })
        .await
        .map_err(|_| Error::Transport(format!("{}: endpoint closed", addr)))
    }
}
