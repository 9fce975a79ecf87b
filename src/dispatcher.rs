//! Inbound message dispatcher.
//!
//! Routes each decoded envelope to the handler for its type. Handlers only
//! touch the registry and session table under their own short-lived locks.
//! Replies and task execution run on tracked workers, so a slow or dead peer
//! never holds up the envelopes queued behind it.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::context::NodeContext;
use crate::error::ProtocolError;
use crate::executor::execute_with_contract;
use crate::net::Inbound;
use crate::protocol::{
    CapabilityQueryPayload, CapabilityReport, DiscoveryPayload, Envelope, HandshakePayload,
    HeartbeatPayload, MessageType, TaskOutcome,
};
use crate::registry::{AgentUpdate, HandshakeOutcome};
use crate::sessions::{Completion, InboundAccept, SessionKind};

pub struct Dispatcher {
    ctx: Arc<NodeContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Consume the inbox until the node is cancelled or the listener goes
    /// away.
    pub async fn run(self, mut inbox: mpsc::Receiver<Inbound>) {
        loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                inbound = inbox.recv() => match inbound {
                    Some(inbound) => self.dispatch(inbound).await,
                    None => break,
                },
            }
        }
        debug!("Dispatcher stopped");
    }

    pub async fn dispatch(&self, inbound: Inbound) {
        let Inbound { envelope, source } = inbound;

        // Our own broadcasts loop back.
        if envelope.sender_id == self.ctx.agent_id {
            trace!("Ignoring own {}", envelope.message_type);
            return;
        }
        if !envelope.is_for(&self.ctx.agent_id) {
            debug!(
                sender = %envelope.sender_id,
                recipient = %envelope.recipient_id,
                "Ignoring {} addressed elsewhere",
                envelope.message_type
            );
            return;
        }

        trace!(sender = %envelope.sender_id, %source, "Received {}", envelope.message_type);

        match envelope.message_type {
            MessageType::Discovery => self.on_discovery(&envelope, source),
            MessageType::Handshake => self.on_handshake(&envelope, source),
            MessageType::Heartbeat => self.on_heartbeat(&envelope),
            MessageType::TaskRequest => self.on_task_request(&envelope),
            MessageType::TaskResponse => self.on_task_response(&envelope),
            MessageType::CapabilityQuery => self.on_capability_query(&envelope),
            MessageType::CapabilityResponse => self.on_capability_response(&envelope),
            MessageType::Shutdown => self.on_shutdown(&envelope),
            MessageType::Coordination => {
                self.ctx.registry.mark_seen(&envelope.sender_id, self.ctx.now());
                debug!(sender = %envelope.sender_id, "Coordination message: {}", envelope.payload);
            }
        }
    }

    fn on_discovery(&self, envelope: &Envelope, source: SocketAddr) {
        let payload: DiscoveryPayload = match envelope.payload_as() {
            Ok(p) => p,
            Err(e) => return self.reject(envelope, e),
        };

        let update = AgentUpdate::at(self.ctx.now(), envelope.timestamp)
            .endpoint(source.ip(), payload.port)
            .hostname(payload.hostname)
            .capabilities(payload.capabilities);

        if self
            .ctx
            .registry
            .observe_discovery(&envelope.sender_id, update)
            .is_none()
        {
            warn!(
                "Agent registry full ({} agents), ignoring discovery from {}",
                self.ctx.settings.max_agents, envelope.sender_id
            );
            return;
        }

        // Every discovery is answered, even from peers we already know, so
        // visibility is always mutual.
        let reply = match self
            .ctx
            .envelope(MessageType::Handshake)
            .to(&envelope.sender_id)
            .json(&self.ctx.handshake_payload(false))
            .and_then(|b| b.build())
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Could not build handshake: {}", e);
                return;
            }
        };

        let peer = SocketAddr::new(source.ip(), payload.port);
        let agent_id = envelope.sender_id.clone();
        let ctx = Arc::clone(&self.ctx);
        self.ctx.tasks.spawn(async move {
            if ctx.send_logged(peer, &reply).await && ctx.registry.mark_connecting(&agent_id) {
                debug!("Handshake sent to {}, awaiting reply", agent_id);
            }
        });
    }

    fn on_handshake(&self, envelope: &Envelope, source: SocketAddr) {
        let payload: HandshakePayload = match envelope.payload_as() {
            Ok(p) => p,
            Err(e) => return self.reject(envelope, e),
        };

        let sender = envelope.sender_id.as_str();
        let was_live = self
            .ctx
            .registry
            .get(sender)
            .is_some_and(|r| r.status.is_live());

        let update = AgentUpdate::at(self.ctx.now(), envelope.timestamp)
            .endpoint(source.ip(), payload.port)
            .hostname(payload.hostname.clone())
            .capabilities(payload.capabilities.clone())
            .load(payload.queue_depth, payload.cpu_load, payload.memory_usage);

        match self.ctx.registry.observe_handshake(sender, update) {
            HandshakeOutcome::Connected(record) => {
                if !was_live {
                    info!(
                        agent = sender,
                        host = %record.hostname,
                        "Connected ({} capabilities)",
                        record.capabilities.len()
                    );
                    self.ctx.notify(&format!("Connected to agent {}", sender));
                }
                if !payload.ack {
                    self.acknowledge(sender, SocketAddr::new(source.ip(), payload.port));
                }
            }
            HandshakeOutcome::Ignored(record) => {
                debug!(
                    agent = sender,
                    status = record.status.as_str(),
                    "Ignoring stale or unwelcome handshake"
                );
            }
            HandshakeOutcome::Contradiction(_) => {
                warn!(agent = sender, "Handshake claims previously denied capabilities");
                self.ctx.notify(&format!(
                    "Agent {} sent contradictory capabilities, marked as error",
                    sender
                ));
            }
            HandshakeOutcome::Rejected => {
                warn!(
                    "Agent registry full ({} agents), ignoring handshake from {}",
                    self.ctx.settings.max_agents, sender
                );
            }
        }
    }

    fn acknowledge(&self, agent_id: &str, addr: SocketAddr) {
        let ack = self
            .ctx
            .envelope(MessageType::Handshake)
            .to(agent_id)
            .json(&self.ctx.handshake_payload(true))
            .and_then(|b| b.build());
        match ack {
            Ok(ack) => self.reply(addr, ack),
            Err(e) => warn!("Could not build handshake ack: {}", e),
        }
    }

    /// Send off the dispatch loop; failures are logged by `send_logged`.
    fn reply(&self, addr: SocketAddr, envelope: Envelope) {
        let ctx = Arc::clone(&self.ctx);
        self.ctx.tasks.spawn(async move {
            ctx.send_logged(addr, &envelope).await;
        });
    }

    fn on_heartbeat(&self, envelope: &Envelope) {
        let payload: HeartbeatPayload = match envelope.payload_as() {
            Ok(p) => p,
            Err(e) => return self.reject(envelope, e),
        };

        let now = self.ctx.now();
        let latency = (now - envelope.timestamp).max(0) as u64;
        let update = AgentUpdate::at(now, envelope.timestamp)
            .load(payload.queue_depth, payload.cpu_load, payload.memory_usage)
            .latency(latency);

        match self.ctx.registry.observe_heartbeat(&envelope.sender_id, update) {
            Some(record) => trace!(
                agent = %record.agent_id,
                status = record.status.as_str(),
                queue = record.queue_depth,
                "Heartbeat"
            ),
            None => debug!("Heartbeat from unknown agent {}", envelope.sender_id),
        }
    }

    fn on_task_request(&self, envelope: &Envelope) {
        let requester = envelope.sender_id.clone();
        let Some(addr) = self
            .ctx
            .registry
            .get(&requester)
            .and_then(|r| r.socket_addr())
        else {
            warn!(
                "Task request {} from unknown agent {}, no address to reply to",
                envelope.session_id, requester
            );
            return;
        };

        let now = self.ctx.now();
        self.ctx.registry.mark_seen(&requester, now);

        let session_id = envelope.session_id.clone();
        let description = envelope.payload.clone();
        match self.ctx.sessions.accept_inbound(
            &session_id,
            &requester,
            &self.ctx.agent_id,
            &description,
            now,
        ) {
            InboundAccept::Duplicate => {
                debug!("Duplicate task request {} from {}", session_id, requester);
            }
            InboundAccept::Full => {
                warn!("Task table full, refusing {} from {}", session_id, requester);
                let outcome = TaskOutcome::Error {
                    message: format!(
                        "task table full ({} active sessions)",
                        self.ctx.settings.max_active_sessions
                    ),
                };
                let ctx = Arc::clone(&self.ctx);
                self.ctx.tasks.spawn(async move {
                    send_outcome(&ctx, &requester, addr, &session_id, outcome).await;
                });
            }
            InboundAccept::Accepted => {
                info!(session = %session_id, "Executing task from {}", requester);
                let ctx = Arc::clone(&self.ctx);
                self.ctx.tasks.spawn(async move {
                    let outcome = match execute_with_contract(
                        Arc::clone(&ctx.executor),
                        &description,
                        &ctx.contract,
                    )
                    .await
                    {
                        Ok(output) => TaskOutcome::Ok { output },
                        Err(e) => TaskOutcome::Error {
                            message: e.to_string(),
                        },
                    };
                    let recorded = match &outcome {
                        TaskOutcome::Ok { output } => output.clone(),
                        TaskOutcome::Error { message } => message.clone(),
                    };
                    ctx.sessions.finish_inbound(&session_id, &recorded, ctx.now());
                    send_outcome(&ctx, &requester, addr, &session_id, outcome).await;
                });
            }
        }
    }

    fn on_task_response(&self, envelope: &Envelope) {
        if let Err(e) = envelope.payload_as::<TaskOutcome>() {
            return self.reject(envelope, e);
        }
        let now = self.ctx.now();
        self.ctx.registry.mark_seen(&envelope.sender_id, now);

        let completion = self.ctx.sessions.complete(
            &envelope.session_id,
            SessionKind::Task,
            &envelope.sender_id,
            &envelope.payload,
            now,
        );
        log_completion(envelope, completion);
    }

    fn on_capability_query(&self, envelope: &Envelope) {
        let query: CapabilityQueryPayload = match envelope.payload_as() {
            Ok(q) => q,
            Err(e) => return self.reject(envelope, e),
        };
        let Some(addr) = self
            .ctx
            .registry
            .get(&envelope.sender_id)
            .and_then(|r| r.socket_addr())
        else {
            warn!("Capability query from unknown agent {}", envelope.sender_id);
            return;
        };
        self.ctx.registry.mark_seen(&envelope.sender_id, self.ctx.now());

        let report = CapabilityReport::answer(&self.ctx.capabilities, &query);
        let response = self
            .ctx
            .envelope(MessageType::CapabilityResponse)
            .to(&envelope.sender_id)
            .session(&envelope.session_id)
            .json(&report)
            .and_then(|b| b.build());
        match response {
            Ok(response) => self.reply(addr, response),
            Err(e) => warn!("Could not build capability response: {}", e),
        }
    }

    fn on_capability_response(&self, envelope: &Envelope) {
        let report: CapabilityReport = match envelope.payload_as() {
            Ok(r) => r,
            Err(e) => return self.reject(envelope, e),
        };
        let now = self.ctx.now();
        let completion = self.ctx.sessions.complete(
            &envelope.session_id,
            SessionKind::CapabilityQuery,
            &envelope.sender_id,
            &envelope.payload,
            now,
        );
        if completion == Completion::Delivered {
            self.ctx.registry.apply_capability_report(
                &envelope.sender_id,
                report.capabilities.into_iter().collect(),
                report.denied.into_iter().collect::<BTreeSet<_>>(),
                now,
            );
        }
        log_completion(envelope, completion);
    }

    fn on_shutdown(&self, envelope: &Envelope) {
        if self.ctx.registry.mark_offline(&envelope.sender_id) {
            info!(agent = %envelope.sender_id, "Peer shut down");
            self.ctx
                .notify(&format!("Agent {} went offline (shutdown)", envelope.sender_id));
        }
    }

    /// A well-formed envelope with an unreadable payload: the sender is
    /// misbehaving and goes to Error until it rediscovers.
    fn reject(&self, envelope: &Envelope, e: ProtocolError) {
        warn!(
            sender = %envelope.sender_id,
            "Malformed {} payload: {}",
            envelope.message_type,
            e
        );
        if self.ctx.registry.mark_error(&envelope.sender_id) {
            self.ctx.notify(&format!(
                "Agent {} sent a malformed {}, marked as error",
                envelope.sender_id, envelope.message_type
            ));
        }
    }
}

/// Send a task outcome back to the requester. Results that do not fit in one
/// envelope are replaced by an error outcome.
async fn send_outcome(
    ctx: &NodeContext,
    requester: &str,
    addr: SocketAddr,
    session_id: &str,
    outcome: TaskOutcome,
) {
    let build = |outcome: &TaskOutcome| {
        ctx.envelope(MessageType::TaskResponse)
            .to(requester)
            .session(session_id)
            .json(outcome)
            .and_then(|b| b.build())
    };

    let max = ctx.settings.max_payload_bytes;
    let response = match build(&outcome) {
        Ok(env) if env.check_payload(max).is_ok() => Ok(env),
        Ok(env) => build(&TaskOutcome::Error {
            message: format!(
                "result too large: {} bytes (max {})",
                env.payload.len(),
                max
            ),
        }),
        Err(e) => Err(e),
    };

    match response {
        Ok(response) => {
            if ctx.send_logged(addr, &response).await {
                debug!(session = session_id, "Task response sent to {}", requester);
            }
        }
        Err(e) => warn!(session = session_id, "Could not build task response: {}", e),
    }
}

fn log_completion(envelope: &Envelope, completion: Completion) {
    let session = envelope.session_id.as_str();
    let sender = envelope.sender_id.as_str();
    match completion {
        Completion::Delivered => debug!(session, "{} from {} delivered", envelope.message_type, sender),
        Completion::Duplicate => debug!(session, "Duplicate {} from {}", envelope.message_type, sender),
        Completion::Late => info!(session, "Discarding late {} from {}", envelope.message_type, sender),
        Completion::Unknown => debug!(session, "{} for unknown session from {}", envelope.message_type, sender),
        Completion::NotAwaited | Completion::Misdirected => warn!(
            session,
            "Unexpected {} from {} ({:?})", envelope.message_type, sender, completion
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::collaborators::{Collaborators, MemoryHealthDisplay, MemoryNotifier};
    use crate::config::Settings;
    use crate::error::Result;
    use crate::executor::{EchoExecutor, ExecutionContract};
    use crate::net::{MemoryNetwork, MemoryTransport, Transport};
    use crate::protocol::{EnvelopeBuilder, MessageType};
    use crate::registry::{AgentRegistry, AgentStatus};
    use crate::sessions::SessionTable;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    struct Harness {
        dispatcher: Dispatcher,
        ctx: Arc<NodeContext>,
        clock: ManualClock,
        notifier: MemoryNotifier,
        peer_inbox: mpsc::Receiver<Inbound>,
    }

    /// Delivery to `slow_port` takes `delay`; everything else is immediate.
    struct SlowPort {
        inner: MemoryTransport,
        slow_port: u16,
        delay: Duration,
    }

    #[async_trait]
    impl Transport for SlowPort {
        async fn broadcast(&self, envelope: &Envelope) -> Result<()> {
            self.inner.broadcast(envelope).await
        }

        async fn send_to(&self, addr: SocketAddr, envelope: &Envelope) -> Result<()> {
            if addr.port() == self.slow_port {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.send_to(addr, envelope).await
        }
    }

    fn harness() -> Harness {
        harness_with(|transport| Arc::new(transport))
    }

    fn harness_with(wrap: impl FnOnce(MemoryTransport) -> Arc<dyn Transport>) -> Harness {
        let net = MemoryNetwork::new();
        let (transport, _inbox) = net.attach(addr(1), 8192);
        let (_peer, peer_inbox) = net.attach(addr(2), 8192);
        let clock = ManualClock::new(1_000_000);
        let notifier = MemoryNotifier::default();
        let settings = Settings::default();
        let ctx = Arc::new(NodeContext {
            agent_id: "a1".to_string(),
            hostname: "host-a1".to_string(),
            port: 1,
            capabilities: vec!["text-generation".to_string()],
            registry: AgentRegistry::new(settings.busy_queue_threshold, settings.max_agents),
            sessions: SessionTable::new(settings.max_active_sessions),
            settings,
            transport: wrap(transport),
            clock: Arc::new(clock.clone()),
            executor: Arc::new(EchoExecutor::new("a1")),
            contract: ExecutionContract::default(),
            collaborators: Collaborators {
                health: Arc::new(MemoryHealthDisplay::default()),
                notifier: Arc::new(notifier.clone()),
            },
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });
        Harness {
            dispatcher: Dispatcher::new(Arc::clone(&ctx)),
            ctx,
            clock,
            notifier,
            peer_inbox,
        }
    }

    fn from_peer(envelope: Envelope) -> Inbound {
        Inbound {
            envelope,
            source: addr(2),
        }
    }

    fn discovery(ts: i64) -> Envelope {
        EnvelopeBuilder::new(MessageType::Discovery, "a2")
            .timestamp(ts)
            .json(&DiscoveryPayload {
                hostname: "host-a2".to_string(),
                port: 2,
                capabilities: vec!["file-analysis".to_string()],
            })
            .unwrap()
            .build()
            .unwrap()
    }

    fn handshake(ts: i64, caps: &[&str], ack: bool) -> Envelope {
        EnvelopeBuilder::new(MessageType::Handshake, "a2")
            .to("a1")
            .timestamp(ts)
            .json(&HandshakePayload {
                hostname: "host-a2".to_string(),
                port: 2,
                capabilities: caps.iter().map(|c| c.to_string()).collect(),
                queue_depth: 0,
                cpu_load: 1.0,
                memory_usage: 2.0,
                ack,
            })
            .unwrap()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn discovery_is_always_answered_with_handshake() {
        let mut h = harness();
        h.dispatcher.dispatch(from_peer(discovery(1))).await;

        let reply = h.peer_inbox.recv().await.unwrap().envelope;
        assert_eq!(reply.message_type, MessageType::Handshake);
        assert_eq!(reply.recipient_id, "a2");
        let payload: HandshakePayload = reply.payload_as().unwrap();
        assert!(!payload.ack);
        assert_eq!(payload.port, 1);

        let record = h.ctx.registry.get("a2").unwrap();
        assert_eq!(record.status, AgentStatus::Connecting);
        assert_eq!(record.socket_addr(), Some(addr(2)));
    }

    #[tokio::test]
    async fn handshake_goes_online_and_is_acknowledged_once() {
        let mut h = harness();
        h.dispatcher
            .dispatch(from_peer(handshake(1, &["file-analysis"], false)))
            .await;

        assert_eq!(h.ctx.registry.get("a2").unwrap().status, AgentStatus::Online);
        assert!(h.notifier.contains("Connected to agent a2"));
        let ack = h.peer_inbox.recv().await.unwrap().envelope;
        assert!(ack.payload_as::<HandshakePayload>().unwrap().ack);

        h.clock.advance(std::time::Duration::from_millis(5));
        h.dispatcher
            .dispatch(from_peer(handshake(2, &["file-analysis"], true)))
            .await;
        assert!(h.peer_inbox.try_recv().is_err());
        assert_eq!(h.notifier.messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_peer_does_not_hold_up_replies() {
        let mut h = harness_with(|inner| {
            Arc::new(SlowPort {
                inner,
                slow_port: 7,
                delay: Duration::from_secs(3),
            })
        });
        let started = tokio::time::Instant::now();

        // Four peers advertising a port nobody answers on.
        for (i, id) in ["p1", "p2", "p3", "p4"].into_iter().enumerate() {
            let discovery = EnvelopeBuilder::new(MessageType::Discovery, id)
                .timestamp(i as i64 + 1)
                .json(&DiscoveryPayload {
                    hostname: format!("host-{}", id),
                    port: 7,
                    capabilities: vec!["terminal".to_string()],
                })
                .unwrap()
                .build()
                .unwrap();
            h.dispatcher.dispatch(from_peer(discovery)).await;
        }
        h.dispatcher
            .dispatch(from_peer(handshake(5, &["file-analysis"], false)))
            .await;

        let ack = h.peer_inbox.recv().await.unwrap().envelope;
        assert!(ack.payload_as::<HandshakePayload>().unwrap().ack);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(h.ctx.registry.get("a2").unwrap().status, AgentStatus::Online);

        // The slow handshakes still go out (and fail) in the background.
        h.ctx.tasks.close();
        h.ctx.tasks.wait().await;
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(h.ctx.registry.get("p1").unwrap().status, AgentStatus::Discovering);
    }

    #[tokio::test]
    async fn own_broadcasts_and_foreign_mail_are_ignored() {
        let h = harness();
        let own = EnvelopeBuilder::new(MessageType::Shutdown, "a1").build().unwrap();
        h.dispatcher.dispatch(from_peer(own)).await;

        let foreign = EnvelopeBuilder::new(MessageType::Heartbeat, "a2")
            .to("a9")
            .text("{}")
            .build()
            .unwrap();
        h.dispatcher.dispatch(from_peer(foreign)).await;
        assert!(h.ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_updates_metrics_and_latency() {
        let h = harness();
        h.dispatcher
            .dispatch(from_peer(handshake(999_000, &["file-analysis"], true)))
            .await;

        let heartbeat = EnvelopeBuilder::new(MessageType::Heartbeat, "a2")
            .to("a1")
            .timestamp(999_990)
            .json(&HeartbeatPayload {
                queue_depth: 7,
                cpu_load: 50.0,
                memory_usage: 60.0,
            })
            .unwrap()
            .build()
            .unwrap();
        h.clock.advance(std::time::Duration::from_millis(1));
        h.dispatcher.dispatch(from_peer(heartbeat)).await;

        let record = h.ctx.registry.get("a2").unwrap();
        assert_eq!(record.queue_depth, 7);
        assert_eq!(record.status, AgentStatus::Busy);
        assert_eq!(record.latency_ms, 11);
    }

    #[tokio::test]
    async fn malformed_payload_from_known_agent_is_error() {
        let mut h = harness();
        h.dispatcher
            .dispatch(from_peer(handshake(1, &["file-analysis"], true)))
            .await;

        let broken = EnvelopeBuilder::new(MessageType::Heartbeat, "a2")
            .to("a1")
            .timestamp(2)
            .text("not json")
            .build()
            .unwrap();
        h.dispatcher.dispatch(from_peer(broken)).await;
        assert_eq!(h.ctx.registry.get("a2").unwrap().status, AgentStatus::Error);

        // Only a fresh discovery recovers it.
        h.dispatcher.dispatch(from_peer(discovery(3))).await;
        let reply = h.peer_inbox.recv().await.unwrap().envelope;
        assert_eq!(reply.message_type, MessageType::Handshake);
        assert_eq!(
            h.ctx.registry.get("a2").unwrap().status,
            AgentStatus::Connecting
        );
    }

    #[tokio::test]
    async fn task_request_is_executed_once() {
        let mut h = harness();
        h.dispatcher
            .dispatch(from_peer(handshake(1, &["file-analysis"], true)))
            .await;

        let request = EnvelopeBuilder::new(MessageType::TaskRequest, "a2")
            .to("a1")
            .session("s-1")
            .timestamp(2)
            .text("explain X")
            .build()
            .unwrap();
        h.dispatcher.dispatch(from_peer(request.clone())).await;
        h.dispatcher.dispatch(from_peer(request)).await;

        let response = h.peer_inbox.recv().await.unwrap().envelope;
        assert_eq!(response.message_type, MessageType::TaskResponse);
        assert_eq!(response.session_id, "s-1");
        assert_eq!(
            response.payload_as::<TaskOutcome>().unwrap(),
            TaskOutcome::Ok {
                output: "Task processed by a1: explain X".to_string()
            }
        );

        h.ctx.tasks.close();
        h.ctx.tasks.wait().await;
        assert!(h.peer_inbox.try_recv().is_err());
        assert_eq!(h.ctx.sessions.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_marks_sender_offline() {
        let h = harness();
        h.dispatcher
            .dispatch(from_peer(handshake(1, &["file-analysis"], true)))
            .await;
        let notice = EnvelopeBuilder::new(MessageType::Shutdown, "a2")
            .to("a1")
            .build()
            .unwrap();
        h.dispatcher.dispatch(from_peer(notice)).await;

        assert_eq!(h.ctx.registry.get("a2").unwrap().status, AgentStatus::Offline);
        assert!(h.notifier.contains("went offline"));
    }

    #[tokio::test]
    async fn capability_query_is_answered() {
        let mut h = harness();
        h.dispatcher
            .dispatch(from_peer(handshake(1, &["file-analysis"], true)))
            .await;
        let query = EnvelopeBuilder::new(MessageType::CapabilityQuery, "a2")
            .to("a1")
            .session("q-1")
            .json(&CapabilityQueryPayload {
                requested: vec!["text-generation".to_string(), "terminal".to_string()],
            })
            .unwrap()
            .build()
            .unwrap();
        h.dispatcher.dispatch(from_peer(query)).await;

        let response = h.peer_inbox.recv().await.unwrap().envelope;
        assert_eq!(response.message_type, MessageType::CapabilityResponse);
        assert_eq!(response.session_id, "q-1");
        let report: CapabilityReport = response.payload_as().unwrap();
        assert_eq!(report.capabilities, vec!["text-generation".to_string()]);
        assert_eq!(report.denied, vec!["terminal".to_string()]);
    }
}
