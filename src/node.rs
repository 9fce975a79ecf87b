//! A running mesh node and the operations callers use: task submission,
//! capability queries, status reports and shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::collaborators::Collaborators;
use crate::config::{validate_settings, Settings};
use crate::context::NodeContext;
use crate::coordinator::Coordinator;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, ProtocolError, Result};
use crate::executor::{self, ExecutionContract, TaskExecutor};
use crate::net::{Inbound, Listener, NetTransport, Transport};
use crate::protocol::{CapabilityQueryPayload, CapabilityReport, MessageType, TaskOutcome};
use crate::registry::{AgentRecord, AgentRegistry};
use crate::sessions::{CompletionReceiver, SessionKind, SessionTable, TaskSession};

const INBOX_CAPACITY: usize = 1024;
const REPORTED_SESSIONS: usize = 10;

/// Successful result of [`Node::submit_task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub session_id: String,
    pub agent_id: String,
    pub output: String,
}

/// Generate a process-unique agent id: `agentmesh-<hostname>-<uuid>`.
pub fn generate_agent_id(hostname: &str) -> String {
    format!("agentmesh-{}-{}", hostname, uuid::Uuid::new_v4())
}

pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Builder for a [`Node`].
pub struct NodeBuilder {
    settings: Settings,
    agent_id: Option<String>,
    hostname: Option<String>,
    clock: Option<Arc<dyn Clock>>,
    executor: Option<Arc<dyn TaskExecutor>>,
    collaborators: Collaborators,
}

impl NodeBuilder {
    pub fn agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    /// Bind the real network sockets and start the node.
    ///
    /// Failing to bind is the one fatal error a node has.
    pub async fn bind(self) -> Result<Node> {
        validate_settings(&self.settings)?;

        let listener = Listener::bind(&self.settings).await?;
        let port = listener.local_port()?;
        let transport = Arc::new(NetTransport::new(&self.settings).await?);

        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let node = self.start(transport, inbox, port)?;
        node.ctx.tasks.spawn(listener.run(
            tx,
            node.ctx.cancel.clone(),
            node.ctx.tasks.clone(),
        ));

        info!(
            "Listening on {}:{} (discovery on UDP {})",
            node.ctx.settings.bind_address, port, node.ctx.settings.discovery_port
        );
        Ok(node)
    }

    /// Start the node over any transport. `inbox` carries decoded inbound
    /// envelopes; `port` is the unicast port advertised to peers.
    pub fn start(
        self,
        transport: Arc<dyn Transport>,
        inbox: mpsc::Receiver<Inbound>,
        port: u16,
    ) -> Result<Node> {
        validate_settings(&self.settings)?;

        let hostname = self.hostname.unwrap_or_else(local_hostname);
        let agent_id = self
            .agent_id
            .or_else(|| self.settings.agent_id.clone())
            .unwrap_or_else(|| generate_agent_id(&hostname));
        let executor = self
            .executor
            .unwrap_or_else(|| executor::from_config(&self.settings.executor, &agent_id));
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));

        let capabilities: Vec<String> = self
            .settings
            .capabilities
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        let ctx = Arc::new(NodeContext {
            agent_id,
            hostname,
            port,
            capabilities,
            registry: AgentRegistry::new(
                self.settings.busy_queue_threshold,
                self.settings.max_agents,
            ),
            sessions: SessionTable::new(self.settings.max_active_sessions),
            contract: ExecutionContract::from(&self.settings.executor),
            settings: self.settings,
            transport,
            clock,
            executor,
            collaborators: self.collaborators,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        ctx.tasks
            .spawn(Dispatcher::new(Arc::clone(&ctx)).run(inbox));
        ctx.tasks.spawn(Coordinator::new(Arc::clone(&ctx)).run());

        info!(
            agent = %ctx.agent_id,
            executor = ctx.executor.name(),
            "Node started with capabilities: {}",
            ctx.capabilities.join(", ")
        );
        ctx.notify(&format!("Agent {} online", ctx.agent_id));

        Ok(Node { ctx })
    }
}

/// Handle to a running node.
pub struct Node {
    ctx: Arc<NodeContext>,
}

impl Node {
    pub fn builder(settings: Settings) -> NodeBuilder {
        NodeBuilder {
            settings,
            agent_id: None,
            hostname: None,
            clock: None,
            executor: None,
            collaborators: Collaborators::default(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.ctx.agent_id
    }

    pub fn port(&self) -> u16 {
        self.ctx.port
    }

    pub fn settings(&self) -> &Settings {
        &self.ctx.settings
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.ctx.registry
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.ctx.sessions
    }

    pub fn agents(&self) -> Vec<AgentRecord> {
        self.ctx.registry.snapshot()
    }

    pub fn is_running(&self) -> bool {
        !self.ctx.cancel.is_cancelled()
    }

    /// Run one coordination cycle now, outside the periodic schedule.
    pub async fn run_cycle(&self) {
        Coordinator::new(Arc::clone(&self.ctx)).cycle().await;
    }

    /// Hand a task to the least-loaded online agent having every capability
    /// in `required`, and wait for its result.
    ///
    /// Fails fast with [`Error::NoAgentsAvailable`] when nobody qualifies.
    /// Returns [`Error::Timeout`] when no response arrives within the task
    /// timeout; the task is not reassigned.
    pub async fn submit_task(&self, description: &str, required: &[String]) -> Result<TaskResult> {
        self.ensure_running()?;

        let max = self.ctx.settings.max_payload_bytes;
        if description.len() > max {
            return Err(ProtocolError::PayloadTooLarge {
                size: description.len(),
                max,
            }
            .into());
        }

        let target = self
            .ctx
            .registry
            .list_online(required)
            .into_iter()
            .next()
            .ok_or(Error::NoAgentsAvailable)?;
        let addr = target
            .socket_addr()
            .ok_or_else(|| Error::UnknownAgent(target.agent_id.clone()))?;

        let (session_id, completion) = self.ctx.sessions.open(
            SessionKind::Task,
            description,
            &target.agent_id,
            self.ctx.now(),
        )?;

        let request = self
            .ctx
            .envelope(MessageType::TaskRequest)
            .to(&target.agent_id)
            .session(&session_id)
            .text(description)
            .build()?;

        self.ctx.registry.increment_queue(&target.agent_id);
        if let Err(e) = self.ctx.transport.send_to(addr, &request).await {
            self.ctx.registry.decrement_queue(&target.agent_id);
            self.ctx.sessions.consume(&session_id);
            return Err(e);
        }
        info!(
            session = %session_id,
            "Task assigned to {} (queue {})",
            target.agent_id,
            target.queue_depth
        );

        let waited = self.ctx.settings.task_timeout();
        let payload = self.await_completion(&session_id, completion, waited).await?;

        match serde_json::from_str::<TaskOutcome>(&payload)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?
        {
            TaskOutcome::Ok { output } => Ok(TaskResult {
                session_id,
                agent_id: target.agent_id,
                output,
            }),
            TaskOutcome::Error { message } => Err(Error::Remote {
                agent_id: target.agent_id,
                message,
            }),
        }
    }

    /// Ask one agent for its current capability set. `requested` names the
    /// capabilities the caller cares about; those the agent lacks come back
    /// as denied and are remembered in the registry.
    pub async fn query_capabilities(
        &self,
        agent_id: &str,
        requested: &[String],
    ) -> Result<CapabilityReport> {
        self.ensure_running()?;

        let addr = self
            .ctx
            .registry
            .get(agent_id)
            .and_then(|r| r.socket_addr())
            .ok_or_else(|| Error::UnknownAgent(agent_id.to_string()))?;

        let (session_id, completion) = self.ctx.sessions.open(
            SessionKind::CapabilityQuery,
            "capability query",
            agent_id,
            self.ctx.now(),
        )?;

        let query = self
            .ctx
            .envelope(MessageType::CapabilityQuery)
            .to(agent_id)
            .session(&session_id)
            .json(&CapabilityQueryPayload {
                requested: requested.to_vec(),
            })?
            .build()?;

        if let Err(e) = self.ctx.transport.send_to(addr, &query).await {
            self.ctx.sessions.consume(&session_id);
            return Err(e);
        }

        let waited = self.ctx.settings.capability_timeout();
        let payload = self.await_completion(&session_id, completion, waited).await?;
        serde_json::from_str(&payload).map_err(|e| ProtocolError::Malformed(e.to_string()).into())
    }

    /// Wait for a session's completion signal, bounded by `waited`. The
    /// session is consumed on success and left TimedOut otherwise.
    async fn await_completion(
        &self,
        session_id: &str,
        completion: CompletionReceiver,
        waited: Duration,
    ) -> Result<String> {
        match tokio::time::timeout(waited, completion).await {
            Ok(Ok(payload)) => {
                self.ctx.sessions.consume(session_id);
                Ok(payload)
            }
            _ => match self.ctx.sessions.expire(session_id, self.ctx.now()) {
                // The response landed between the deadline and the expiry.
                Some(payload) => Ok(payload),
                None => {
                    warn!(session = session_id, "Timed out after {}ms", waited.as_millis());
                    Err(Error::Timeout {
                        session_id: session_id.to_string(),
                        waited,
                    })
                }
            },
        }
    }

    /// Human-readable view of the mesh from this node.
    pub fn status_report(&self) -> String {
        let now = self.ctx.now();
        let mut out = String::new();

        out.push_str("=== Agent Mesh Status ===\n");
        out.push_str(&format!(
            "Local agent: {} ({}:{})\n",
            self.ctx.agent_id, self.ctx.hostname, self.ctx.port
        ));
        out.push_str(&format!(
            "Capabilities: {}\n",
            self.ctx.capabilities.join(", ")
        ));

        let agents = self.ctx.registry.snapshot();
        out.push_str(&format!("\nKnown agents: {}\n", agents.len()));
        for agent in &agents {
            let seen = if agent.last_seen > 0 {
                format!("{}s ago", ((now - agent.last_seen).max(0)) / 1000)
            } else {
                "never".to_string()
            };
            out.push_str(&format!(
                "  {:<40} {:<11} seen {:<8} queue {:<3} cpu {:>5.1}% mem {:>5.1}% latency {}ms\n",
                agent.agent_id,
                agent.status.as_str(),
                seen,
                agent.queue_depth,
                agent.cpu_load,
                agent.memory_usage,
                agent.latency_ms
            ));
        }

        let active: Vec<TaskSession> = self
            .ctx
            .sessions
            .snapshot()
            .into_iter()
            .filter(|s| !s.status.is_final())
            .collect();
        out.push_str(&format!("\nActive sessions: {}\n", active.len()));
        for session in active.iter().take(REPORTED_SESSIONS) {
            let started = chrono::DateTime::from_timestamp_millis(session.created_at)
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_default();
            out.push_str(&format!(
                "  {} {:<10} {} -> {} {}\n",
                started,
                session.status.as_str(),
                session.session_id,
                session.assigned_agent_id,
                truncate(&session.description, 48)
            ));
        }

        out
    }

    /// Stop both loops, tell live peers we are leaving, and wait for workers
    /// up to the configured grace period.
    pub async fn shutdown(&self) {
        if self.ctx.cancel.is_cancelled() {
            return;
        }
        info!(agent = %self.ctx.agent_id, "Shutting down");
        self.ctx.cancel.cancel();

        let peers = self.ctx.registry.live_endpoints();
        for (agent_id, addr) in peers {
            let notice = self
                .ctx
                .envelope(MessageType::Shutdown)
                .to(&agent_id)
                .text("shutdown")
                .build();
            match notice {
                Ok(notice) => {
                    if let Err(e) = self.ctx.transport.send_to(addr, &notice).await {
                        debug!("Shutdown notice to {} failed: {}", agent_id, e);
                    }
                }
                Err(e) => warn!("Could not build shutdown notice: {}", e),
            }
        }

        self.ctx.tasks.close();
        let grace = self.ctx.settings.shutdown_grace();
        if tokio::time::timeout(grace, self.ctx.tasks.wait()).await.is_err() {
            warn!(
                "{} tasks still running after {}ms grace period",
                self.ctx.tasks.len(),
                grace.as_millis()
            );
        }
        self.ctx.notify(&format!("Agent {} stopped", self.ctx.agent_id));
    }

    fn ensure_running(&self) -> Result<()> {
        if self.ctx.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // Without an explicit shutdown the loops would outlive the handle.
        self.ctx.cancel.cancel();
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_embeds_hostname() {
        let a = generate_agent_id("box");
        let b = generate_agent_id("box");
        assert!(a.starts_with("agentmesh-box-"));
        assert_ne!(a, b);
    }

    #[test]
    fn truncate_marks_cut_text() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 4), "abcd...");
    }
}
