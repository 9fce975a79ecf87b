//! Wire envelope with session correlation.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::types::MessageType;
use crate::error::ProtocolError;

/// Message envelope exchanged between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Sender agent ID
    #[serde(rename = "sender")]
    pub sender_id: String,
    /// Recipient agent ID (empty for broadcast)
    #[serde(rename = "recipient", default)]
    pub recipient_id: String,
    /// Correlation ID for request/response pairs (empty when unused)
    #[serde(rename = "session", default)]
    pub session_id: String,
    /// Creation timestamp (unix ms, sender clock)
    pub timestamp: i64,
    #[serde(default)]
    pub payload: String,
}

impl Envelope {
    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_empty()
    }

    /// Whether this envelope is addressed to `agent_id` (broadcasts match everyone).
    pub fn is_for(&self, agent_id: &str) -> bool {
        self.is_broadcast() || self.recipient_id == agent_id
    }

    /// Parse the payload as a typed JSON document.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_str(&self.payload).map_err(|e| {
            ProtocolError::Malformed(format!("{} payload: {}", self.message_type, e))
        })
    }

    /// Check the payload against a size limit.
    pub fn check_payload(&self, max: usize) -> Result<(), ProtocolError> {
        let size = self.payload.len();
        if size > max {
            return Err(ProtocolError::PayloadTooLarge { size, max });
        }
        Ok(())
    }
}

/// Builder for creating envelopes with fluent API.
pub struct EnvelopeBuilder {
    message_type: MessageType,
    sender_id: String,
    recipient_id: String,
    session_id: String,
    timestamp: i64,
    payload: String,
}

impl EnvelopeBuilder {
    /// Start building an envelope of `message_type` from an agent.
    pub fn new(message_type: MessageType, sender_id: impl Into<String>) -> Self {
        Self {
            message_type,
            sender_id: sender_id.into(),
            recipient_id: String::new(),
            session_id: String::new(),
            timestamp: 0,
            payload: String::new(),
        }
    }

    /// Address to a single agent.
    pub fn to(mut self, agent_id: impl Into<String>) -> Self {
        self.recipient_id = agent_id.into();
        self
    }

    /// Set the correlation ID.
    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn timestamp(mut self, ms: i64) -> Self {
        self.timestamp = ms;
        self
    }

    /// Set a free-text payload.
    pub fn text(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Set a JSON payload.
    pub fn json<T: Serialize>(mut self, payload: &T) -> Result<Self, ProtocolError> {
        self.payload = serde_json::to_string(payload)
            .map_err(|e| ProtocolError::Malformed(format!("unencodable payload: {}", e)))?;
        Ok(self)
    }

    /// Build the envelope.
    pub fn build(self) -> Result<Envelope, ProtocolError> {
        if self.sender_id.is_empty() {
            return Err(ProtocolError::Malformed("sender is required".to_string()));
        }
        if self.message_type.is_correlated() && self.session_id.is_empty() {
            return Err(ProtocolError::Malformed(format!(
                "{} requires a session id",
                self.message_type
            )));
        }

        Ok(Envelope {
            message_type: self.message_type,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            session_id: self.session_id,
            timestamp: self.timestamp,
            payload: self.payload,
        })
    }
}

/// Fresh, process-unique session id.
pub fn generate_session_id() -> String {
    ulid::Ulid::new().to_string()
}
