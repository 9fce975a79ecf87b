//! Message types and typed payloads for the mesh protocol.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Message type classification.
///
/// Serialized as an integer. Value 5 is unused (a retired status-update type)
/// and is rejected like any other unknown value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum MessageType {
    /// Broadcast announcement of a node and its capabilities
    Discovery,
    /// Unicast reply to discovery, carrying capabilities and load
    Handshake,
    /// Work item submitted to a peer
    TaskRequest,
    /// Result of a work item, correlated by session id
    TaskResponse,
    /// Periodic load report to online peers
    Heartbeat,
    /// Ask a peer for its current capability set
    CapabilityQuery,
    /// Answer to a capability query
    CapabilityResponse,
    /// Reserved for coordination extensions; accepted and ignored
    Coordination,
    /// Best-effort notice that the sender is going away
    Shutdown,
}

impl MessageType {
    pub fn code(self) -> i64 {
        match self {
            MessageType::Discovery => 1,
            MessageType::Handshake => 2,
            MessageType::TaskRequest => 3,
            MessageType::TaskResponse => 4,
            MessageType::Heartbeat => 6,
            MessageType::CapabilityQuery => 7,
            MessageType::CapabilityResponse => 8,
            MessageType::Coordination => 9,
            MessageType::Shutdown => 10,
        }
    }

    /// Whether envelopes of this type carry a session id.
    pub fn is_correlated(self) -> bool {
        matches!(
            self,
            MessageType::TaskRequest
                | MessageType::TaskResponse
                | MessageType::CapabilityQuery
                | MessageType::CapabilityResponse
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Discovery => "discovery",
            MessageType::Handshake => "handshake",
            MessageType::TaskRequest => "task_request",
            MessageType::TaskResponse => "task_response",
            MessageType::Heartbeat => "heartbeat",
            MessageType::CapabilityQuery => "capability_query",
            MessageType::CapabilityResponse => "capability_response",
            MessageType::Coordination => "coordination",
            MessageType::Shutdown => "shutdown",
        }
    }
}

impl TryFrom<i64> for MessageType {
    type Error = ProtocolError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(MessageType::Discovery),
            2 => Ok(MessageType::Handshake),
            3 => Ok(MessageType::TaskRequest),
            4 => Ok(MessageType::TaskResponse),
            6 => Ok(MessageType::Heartbeat),
            7 => Ok(MessageType::CapabilityQuery),
            8 => Ok(MessageType::CapabilityResponse),
            9 => Ok(MessageType::Coordination),
            10 => Ok(MessageType::Shutdown),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

impl From<MessageType> for i64 {
    fn from(t: MessageType) -> Self {
        t.code()
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discovery announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryPayload {
    pub hostname: String,
    /// Unicast port the sender listens on
    pub port: u16,
    pub capabilities: Vec<String>,
}

/// Handshake, sent in reply to discovery and acknowledged once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakePayload {
    pub hostname: String,
    pub port: u16,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub queue_depth: u32,
    #[serde(default)]
    pub cpu_load: f32,
    #[serde(default)]
    pub memory_usage: f32,
    /// Set on the reply to a handshake; an ack is never answered.
    #[serde(default)]
    pub ack: bool,
}

/// Periodic load report.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub queue_depth: u32,
    pub cpu_load: f32,
    pub memory_usage: f32,
}

/// Result of a remote task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Ok { output: String },
    Error { message: String },
}

/// Capability query. An empty `requested` list asks for everything.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityQueryPayload {
    #[serde(default)]
    pub requested: Vec<String>,
}

/// Capability answer: the full set, plus the requested capabilities the
/// responder does not provide.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityReport {
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub denied: Vec<String>,
}

impl CapabilityReport {
    /// Answer `query` from the local capability list.
    pub fn answer(local: &[String], query: &CapabilityQueryPayload) -> Self {
        let denied = query
            .requested
            .iter()
            .filter(|c| !local.contains(c))
            .cloned()
            .collect();
        Self {
            capabilities: local.to_vec(),
            denied,
        }
    }
}
