//! Outbound hooks the node reports through: a health display fed once per
//! coordination cycle, and a status notifier for human-readable events.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::registry::AgentRecord;

/// Per-agent health as shown to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub agent_id: String,
    pub online: bool,
    pub latency_ms: u64,
    pub cpu_load: f32,
    pub memory_usage: f32,
    pub queue_depth: u32,
    pub last_seen: i64,
}

impl From<&AgentRecord> for HealthSnapshot {
    fn from(record: &AgentRecord) -> Self {
        Self {
            agent_id: record.agent_id.clone(),
            online: record.status.is_live(),
            latency_ms: record.latency_ms,
            cpu_load: record.cpu_load,
            memory_usage: record.memory_usage,
            queue_depth: record.queue_depth,
            last_seen: record.last_seen,
        }
    }
}

pub trait HealthDisplay: Send + Sync {
    fn update(&self, snapshots: &[HealthSnapshot]);
}

pub trait StatusNotifier: Send + Sync {
    fn status(&self, message: &str);
}

/// Emits status messages as structured log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl StatusNotifier for TracingNotifier {
    fn status(&self, message: &str) {
        tracing::info!(target: "agentmesh::status", "{}", message);
    }
}

/// Logs a one-line summary per agent at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHealthDisplay;

impl HealthDisplay for LogHealthDisplay {
    fn update(&self, snapshots: &[HealthSnapshot]) {
        for s in snapshots {
            tracing::debug!(
                target: "agentmesh::health",
                agent = %s.agent_id,
                online = s.online,
                latency_ms = s.latency_ms,
                cpu = s.cpu_load,
                mem = s.memory_usage,
                queue = s.queue_depth,
                "health"
            );
        }
    }
}

/// Keeps every status message; used by tests and embedders that poll.
#[derive(Debug, Default, Clone)]
pub struct MemoryNotifier {
    messages: Arc<Mutex<Vec<String>>>,
}

impl MemoryNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages.lock().iter().any(|m| m.contains(needle))
    }
}

impl StatusNotifier for MemoryNotifier {
    fn status(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }
}

/// Keeps the most recent health update.
#[derive(Debug, Default, Clone)]
pub struct MemoryHealthDisplay {
    latest: Arc<Mutex<Vec<HealthSnapshot>>>,
}

impl MemoryHealthDisplay {
    pub fn latest(&self) -> Vec<HealthSnapshot> {
        self.latest.lock().clone()
    }
}

impl HealthDisplay for MemoryHealthDisplay {
    fn update(&self, snapshots: &[HealthSnapshot]) {
        *self.latest.lock() = snapshots.to_vec();
    }
}

/// The pair of hooks a node is built with.
#[derive(Clone)]
pub struct Collaborators {
    pub health: Arc<dyn HealthDisplay>,
    pub notifier: Arc<dyn StatusNotifier>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            health: Arc::new(LogHealthDisplay),
            notifier: Arc::new(TracingNotifier),
        }
    }
}
