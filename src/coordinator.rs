//! Periodic coordination loop.
//!
//! Each cycle: broadcast discovery, sweep stale agents to Offline, fan out
//! heartbeats to live peers, publish health snapshots, and drop old sessions.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::collaborators::HealthSnapshot;
use crate::context::NodeContext;
use crate::protocol::MessageType;

pub struct Coordinator {
    ctx: Arc<NodeContext>,
}

impl Coordinator {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Run cycles every discovery interval until cancelled. The first cycle
    /// runs immediately.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.ctx.settings.discovery_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Coordination loop started (every {}s)",
            self.ctx.settings.discovery_interval_seconds
        );

        loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                _ = ticker.tick() => self.cycle().await,
            }
        }
        debug!("Coordination loop stopped");
    }

    pub async fn cycle(&self) {
        self.broadcast_discovery().await;
        self.sweep();
        self.send_heartbeats().await;
        self.publish_health();
        self.collect_sessions();
    }

    async fn broadcast_discovery(&self) {
        let envelope = match self
            .ctx
            .envelope(MessageType::Discovery)
            .json(&self.ctx.discovery_payload())
            .and_then(|b| b.build())
        {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Could not build discovery: {}", e);
                return;
            }
        };
        if let Err(e) = self.ctx.transport.broadcast(&envelope).await {
            warn!("Discovery broadcast failed: {}", e);
        }
    }

    fn sweep(&self) {
        let expired = self
            .ctx
            .registry
            .expire_stale(self.ctx.now(), self.ctx.settings.liveness_timeout());
        for agent_id in expired {
            info!(agent = %agent_id, "Agent went offline (no contact)");
            self.ctx.notify(&format!("Agent {} offline", agent_id));
        }
    }

    async fn send_heartbeats(&self) {
        let endpoints = self.ctx.registry.live_endpoints();
        if endpoints.is_empty() {
            return;
        }

        let load = self.ctx.local_load();
        let mut sends = JoinSet::new();
        for (agent_id, addr) in endpoints {
            let envelope = match self
                .ctx
                .envelope(MessageType::Heartbeat)
                .to(&agent_id)
                .json(&load)
                .and_then(|b| b.build())
            {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Could not build heartbeat for {}: {}", agent_id, e);
                    continue;
                }
            };
            let ctx = Arc::clone(&self.ctx);
            // One slow peer must not hold up the others.
            sends.spawn(async move { ctx.send_logged(addr, &envelope).await });
        }

        let total = sends.len();
        let mut delivered = 0;
        while let Some(result) = sends.join_next().await {
            if matches!(result, Ok(true)) {
                delivered += 1;
            }
        }
        debug!("Heartbeat sent to {}/{} peers", delivered, total);
    }

    fn publish_health(&self) {
        let snapshots: Vec<HealthSnapshot> = self
            .ctx
            .registry
            .snapshot()
            .iter()
            .map(HealthSnapshot::from)
            .collect();
        self.ctx.collaborators.health.update(&snapshots);
    }

    fn collect_sessions(&self) {
        let retention = self.ctx.settings.task_timeout() + self.ctx.settings.session_grace();
        let removed = self.ctx.sessions.purge(self.ctx.now(), retention);
        if removed > 0 {
            debug!("Dropped {} finished sessions", removed);
        }
    }
}
