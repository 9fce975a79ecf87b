//! Shared state for one running node.
//!
//! A `NodeContext` is built once per node and handed to the dispatcher, the
//! coordinator and the public `Node` handle. It owns the registry and session
//! table; nothing here is process-global, so several nodes can share a test.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::clock::Clock;
use crate::collaborators::Collaborators;
use crate::config::Settings;
use crate::executor::{ExecutionContract, TaskExecutor};
use crate::net::Transport;
use crate::protocol::{
    DiscoveryPayload, Envelope, EnvelopeBuilder, HandshakePayload, HeartbeatPayload, MessageType,
};
use crate::registry::AgentRegistry;
use crate::sessions::SessionTable;
use crate::sysload;

pub struct NodeContext {
    pub agent_id: String,
    pub hostname: String,
    /// Unicast port advertised in discovery and handshakes.
    pub port: u16,
    pub capabilities: Vec<String>,
    pub settings: Settings,
    pub registry: AgentRegistry,
    pub sessions: SessionTable,
    pub transport: Arc<dyn Transport>,
    pub clock: Arc<dyn Clock>,
    pub executor: Arc<dyn TaskExecutor>,
    pub contract: ExecutionContract,
    pub collaborators: Collaborators,
    pub cancel: CancellationToken,
    pub tasks: TaskTracker,
}

impl NodeContext {
    pub fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Envelope from this node, stamped with the current time.
    pub fn envelope(&self, message_type: MessageType) -> EnvelopeBuilder {
        EnvelopeBuilder::new(message_type, &self.agent_id).timestamp(self.now())
    }

    /// Current local load, as reported to peers.
    pub fn local_load(&self) -> HeartbeatPayload {
        HeartbeatPayload {
            queue_depth: self.sessions.processing_count(),
            cpu_load: sysload::cpu_load_percent(),
            memory_usage: sysload::memory_usage_percent(),
        }
    }

    pub fn discovery_payload(&self) -> DiscoveryPayload {
        DiscoveryPayload {
            hostname: self.hostname.clone(),
            port: self.port,
            capabilities: self.capabilities.clone(),
        }
    }

    pub fn handshake_payload(&self, ack: bool) -> HandshakePayload {
        let load = self.local_load();
        HandshakePayload {
            hostname: self.hostname.clone(),
            port: self.port,
            capabilities: self.capabilities.clone(),
            queue_depth: load.queue_depth,
            cpu_load: load.cpu_load,
            memory_usage: load.memory_usage,
            ack,
        }
    }

    /// Unicast send whose failure is logged and swallowed. Transport errors
    /// never take the node down; liveness sorts out dead peers.
    pub async fn send_logged(&self, addr: SocketAddr, envelope: &Envelope) -> bool {
        match self.transport.send_to(addr, envelope).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    peer = %envelope.recipient_id,
                    %addr,
                    "Failed to send {}: {}",
                    envelope.message_type,
                    e
                );
                false
            }
        }
    }

    pub fn notify(&self, message: &str) {
        self.collaborators.notifier.status(message);
    }
}
