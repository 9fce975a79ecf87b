//! Agent registry and liveness state machine.
//!
//! One [`AgentRecord`] per peer id, created on first contact and updated in
//! place afterwards. Records are never removed: an agent that goes quiet is
//! moved to [`AgentStatus::Offline`] and simply stops being a load-balancing
//! candidate.
//!
//! ```text
//! Discovering --handshake sent--> Connecting --handshake/heartbeat--> Online <--> Busy
//!      ^                                                                 |
//!      +------------------- discovery ---- Offline <---- silence --------+
//! any state --malformed/contradictory--> Error --discovery--> Discovering
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Liveness state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Discovering,
    Connecting,
    Online,
    Busy,
    Offline,
    Error,
}

impl AgentStatus {
    /// Online or Busy: reachable and receiving heartbeats.
    pub fn is_live(self) -> bool {
        matches!(self, AgentStatus::Online | AgentStatus::Busy)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Discovering => "DISCOVERING",
            AgentStatus::Connecting => "CONNECTING",
            AgentStatus::Online => "ONLINE",
            AgentStatus::Busy => "BUSY",
            AgentStatus::Offline => "OFFLINE",
            AgentStatus::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A known peer agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub hostname: String,
    pub address: Option<IpAddr>,
    pub port: u16,
    pub status: AgentStatus,
    /// Local receipt time of the last applied message (unix ms)
    pub last_seen: i64,
    /// Sender timestamp of the last applied message (unix ms, peer clock)
    pub last_sent_at: i64,
    pub capabilities: BTreeSet<String>,
    /// Capabilities the agent explicitly said it does not provide
    pub denied_capabilities: BTreeSet<String>,
    pub queue_depth: u32,
    pub cpu_load: f32,
    pub memory_usage: f32,
    pub latency_ms: u64,
}

impl AgentRecord {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            hostname: String::new(),
            address: None,
            port: 0,
            status: AgentStatus::Discovering,
            last_seen: 0,
            last_sent_at: 0,
            capabilities: BTreeSet::new(),
            denied_capabilities: BTreeSet::new(),
            queue_depth: 0,
            cpu_load: 0.0,
            memory_usage: 0.0,
            latency_ms: 0,
        }
    }

    /// Advertised unicast endpoint, once known.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.address {
            Some(ip) if self.port != 0 => Some(SocketAddr::new(ip, self.port)),
            _ => None,
        }
    }

    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }
}

/// Field changes carried by one inbound message.
#[derive(Debug, Clone, Default)]
pub struct AgentUpdate {
    pub seen_at: i64,
    pub sent_at: i64,
    pub hostname: Option<String>,
    pub address: Option<IpAddr>,
    pub port: Option<u16>,
    pub capabilities: Option<BTreeSet<String>>,
    pub queue_depth: Option<u32>,
    pub cpu_load: Option<f32>,
    pub memory_usage: Option<f32>,
    pub latency_ms: Option<u64>,
    pub status: Option<AgentStatus>,
}

impl AgentUpdate {
    /// An update observed locally at `seen_at`, stamped `sent_at` by its sender.
    pub fn at(seen_at: i64, sent_at: i64) -> Self {
        Self {
            seen_at,
            sent_at,
            ..Self::default()
        }
    }

    pub fn endpoint(mut self, address: IpAddr, port: u16) -> Self {
        self.address = Some(address);
        self.port = Some(port);
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = Some(caps.into_iter().map(Into::into).collect());
        self
    }

    pub fn load(mut self, queue_depth: u32, cpu_load: f32, memory_usage: f32) -> Self {
        self.queue_depth = Some(queue_depth);
        self.cpu_load = Some(cpu_load);
        self.memory_usage = Some(memory_usage);
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }

    pub fn status(mut self, status: AgentStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// What a handshake did to the sender's record.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeOutcome {
    /// Record is now Online or Busy.
    Connected(AgentRecord),
    /// Ignored: older than what we already applied, or agent in Error.
    Ignored(AgentRecord),
    /// Handshake contradicted earlier statements; record moved to Error.
    Contradiction(AgentRecord),
    /// Registry is full and the agent is new.
    Rejected,
}

/// Mutex-guarded map of known peers.
pub struct AgentRegistry {
    agents: Mutex<HashMap<String, AgentRecord>>,
    busy_threshold: u32,
    capacity: usize,
}

impl AgentRegistry {
    pub fn new(busy_threshold: u32, capacity: usize) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            busy_threshold,
            capacity,
        }
    }

    /// Create or update a record. Idempotent; updates older than the record
    /// are ignored and the current record is returned unchanged.
    ///
    /// Returns `None` only when the agent is new and the registry is full.
    pub fn upsert(&self, agent_id: &str, update: AgentUpdate) -> Option<AgentRecord> {
        let mut agents = self.agents.lock();
        let record = self.entry(&mut agents, agent_id)?;
        if is_stale(record, &update) {
            return Some(record.clone());
        }
        let status = update.status;
        apply(record, update);
        if let Some(status) = status {
            record.status = status;
        }
        settle_load_status(record, self.busy_threshold);
        Some(record.clone())
    }

    /// Refresh `last_seen` without touching anything else.
    pub fn mark_seen(&self, agent_id: &str, now: i64) -> bool {
        let mut agents = self.agents.lock();
        match agents.get_mut(agent_id) {
            Some(record) if now >= record.last_seen => {
                record.last_seen = now;
                true
            }
            _ => false,
        }
    }

    /// Apply a Discovery from `agent_id`.
    ///
    /// New, Offline and Error records (re)enter Discovering; live records keep
    /// their status. A fresh discovery clears earlier capability denials.
    ///
    /// For Offline and Error records the sender stamp is not compared: a
    /// restarted peer may stamp from an earlier clock.
    pub fn observe_discovery(&self, agent_id: &str, update: AgentUpdate) -> Option<AgentRecord> {
        let mut agents = self.agents.lock();
        let record = self.entry(&mut agents, agent_id)?;
        if matches!(record.status, AgentStatus::Offline | AgentStatus::Error) {
            record.last_sent_at = record.last_sent_at.min(update.sent_at);
        }
        if is_stale(record, &update) {
            return Some(record.clone());
        }
        apply(record, update);
        if matches!(record.status, AgentStatus::Offline | AgentStatus::Error) {
            record.status = AgentStatus::Discovering;
            record.denied_capabilities.clear();
        }
        Some(record.clone())
    }

    /// We replied to a discovery with a handshake and are awaiting the ack.
    pub fn mark_connecting(&self, agent_id: &str) -> bool {
        let mut agents = self.agents.lock();
        match agents.get_mut(agent_id) {
            Some(record) if record.status == AgentStatus::Discovering => {
                record.status = AgentStatus::Connecting;
                true
            }
            _ => false,
        }
    }

    /// Apply a Handshake from `agent_id`.
    pub fn observe_handshake(&self, agent_id: &str, update: AgentUpdate) -> HandshakeOutcome {
        let mut agents = self.agents.lock();
        let Some(record) = self.entry(&mut agents, agent_id) else {
            return HandshakeOutcome::Rejected;
        };
        if is_stale(record, &update) || record.status == AgentStatus::Error {
            return HandshakeOutcome::Ignored(record.clone());
        }

        let contradicts = update
            .capabilities
            .as_ref()
            .is_some_and(|caps| caps.iter().any(|c| record.denied_capabilities.contains(c)));
        if contradicts {
            record.last_seen = update.seen_at;
            record.status = AgentStatus::Error;
            return HandshakeOutcome::Contradiction(record.clone());
        }

        apply(record, update);
        if !record.status.is_live() {
            record.status = AgentStatus::Online;
        }
        settle_load_status(record, self.busy_threshold);
        HandshakeOutcome::Connected(record.clone())
    }

    /// Apply a Heartbeat. Unknown agents are not created.
    ///
    /// Metrics and `last_seen` always update; the status only moves from
    /// Discovering/Connecting to Online, or between Online and Busy.
    pub fn observe_heartbeat(&self, agent_id: &str, update: AgentUpdate) -> Option<AgentRecord> {
        let mut agents = self.agents.lock();
        let record = agents.get_mut(agent_id)?;
        if is_stale(record, &update) {
            return Some(record.clone());
        }
        apply(record, update);
        if matches!(
            record.status,
            AgentStatus::Discovering | AgentStatus::Connecting
        ) {
            record.status = AgentStatus::Online;
        }
        settle_load_status(record, self.busy_threshold);
        Some(record.clone())
    }

    /// Record a capability report (from a capability response).
    pub fn apply_capability_report(
        &self,
        agent_id: &str,
        capabilities: BTreeSet<String>,
        denied: BTreeSet<String>,
        seen_at: i64,
    ) -> Option<AgentRecord> {
        let mut agents = self.agents.lock();
        let record = agents.get_mut(agent_id)?;
        record.capabilities = capabilities;
        record.denied_capabilities.extend(denied);
        record.last_seen = record.last_seen.max(seen_at);
        Some(record.clone())
    }

    /// Immediately mark an agent Offline (shutdown notice).
    pub fn mark_offline(&self, agent_id: &str) -> bool {
        self.set_status(agent_id, AgentStatus::Offline)
    }

    /// Mark an agent Error; only a fresh discovery recovers it.
    pub fn mark_error(&self, agent_id: &str) -> bool {
        self.set_status(agent_id, AgentStatus::Error)
    }

    fn set_status(&self, agent_id: &str, status: AgentStatus) -> bool {
        let mut agents = self.agents.lock();
        match agents.get_mut(agent_id) {
            Some(record) if record.status != status => {
                record.status = status;
                true
            }
            _ => false,
        }
    }

    /// Optimistically bump the local view of an agent's queue after assigning
    /// it a task. The next heartbeat overwrites it.
    pub fn increment_queue(&self, agent_id: &str) -> Option<u32> {
        let mut agents = self.agents.lock();
        let record = agents.get_mut(agent_id)?;
        record.queue_depth = record.queue_depth.saturating_add(1);
        settle_load_status(record, self.busy_threshold);
        Some(record.queue_depth)
    }

    /// Undo [`increment_queue`](Self::increment_queue) for a task that never
    /// reached the agent.
    pub fn decrement_queue(&self, agent_id: &str) -> Option<u32> {
        let mut agents = self.agents.lock();
        let record = agents.get_mut(agent_id)?;
        record.queue_depth = record.queue_depth.saturating_sub(1);
        settle_load_status(record, self.busy_threshold);
        Some(record.queue_depth)
    }

    /// Online agents having every capability in `required`, least loaded first,
    /// ties broken by agent id.
    pub fn list_online(&self, required: &[String]) -> Vec<AgentRecord> {
        let agents = self.agents.lock();
        let mut candidates: Vec<AgentRecord> = agents
            .values()
            .filter(|r| r.status == AgentStatus::Online && r.has_capabilities(required))
            .cloned()
            .collect();
        drop(agents);

        candidates.sort_by(|a, b| {
            a.queue_depth
                .cmp(&b.queue_depth)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        candidates
    }

    /// Move live agents silent for longer than `timeout` to Offline.
    pub fn expire_stale(&self, now: i64, timeout: Duration) -> BTreeSet<String> {
        let limit = timeout.as_millis() as i64;
        let mut agents = self.agents.lock();
        let mut expired = BTreeSet::new();
        for record in agents.values_mut() {
            if record.status.is_live() && now - record.last_seen > limit {
                record.status = AgentStatus::Offline;
                expired.insert(record.agent_id.clone());
            }
        }
        expired
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.lock().get(agent_id).cloned()
    }

    /// Copy of every record, ordered by agent id.
    pub fn snapshot(&self) -> Vec<AgentRecord> {
        let mut records: Vec<AgentRecord> = self.agents.lock().values().cloned().collect();
        records.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        records
    }

    /// Endpoints of all Online/Busy agents.
    pub fn live_endpoints(&self) -> Vec<(String, SocketAddr)> {
        let mut endpoints: Vec<(String, SocketAddr)> = self
            .agents
            .lock()
            .values()
            .filter(|r| r.status.is_live())
            .filter_map(|r| r.socket_addr().map(|addr| (r.agent_id.clone(), addr)))
            .collect();
        endpoints.sort();
        endpoints
    }

    pub fn len(&self) -> usize {
        self.agents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry<'a>(
        &self,
        agents: &'a mut HashMap<String, AgentRecord>,
        agent_id: &str,
    ) -> Option<&'a mut AgentRecord> {
        if !agents.contains_key(agent_id) {
            if agents.len() >= self.capacity {
                tracing::warn!(
                    agent_id,
                    capacity = self.capacity,
                    "Agent registry full, ignoring new agent"
                );
                return None;
            }
            agents.insert(agent_id.to_string(), AgentRecord::new(agent_id));
        }
        agents.get_mut(agent_id)
    }
}

fn is_stale(record: &AgentRecord, update: &AgentUpdate) -> bool {
    update.seen_at < record.last_seen || update.sent_at < record.last_sent_at
}

fn apply(record: &mut AgentRecord, update: AgentUpdate) {
    record.last_seen = update.seen_at;
    record.last_sent_at = update.sent_at;
    if let Some(hostname) = update.hostname {
        record.hostname = hostname;
    }
    if let Some(address) = update.address {
        record.address = Some(address);
    }
    if let Some(port) = update.port {
        record.port = port;
    }
    if let Some(capabilities) = update.capabilities {
        record.capabilities = capabilities;
    }
    if let Some(depth) = update.queue_depth {
        record.queue_depth = depth;
    }
    if let Some(cpu) = update.cpu_load {
        record.cpu_load = cpu;
    }
    if let Some(mem) = update.memory_usage {
        record.memory_usage = mem;
    }
    if let Some(latency) = update.latency_ms {
        record.latency_ms = latency;
    }
}

fn settle_load_status(record: &mut AgentRecord, busy_threshold: u32) {
    if record.status.is_live() {
        record.status = if record.queue_depth >= busy_threshold {
            AgentStatus::Busy
        } else {
            AgentStatus::Online
        };
    }
}
