//! Agent mesh protocol.
//!
//! This module defines the wire protocol spoken between agents:
//! - Typed envelopes with session correlation
//! - Message types with stable integer codes
//! - JSON payload documents per message type
//! - A bounded JSON codec

pub mod codec;
pub mod envelope;
pub mod types;

pub use codec::{decode, encode};
pub use envelope::{generate_session_id, Envelope, EnvelopeBuilder};
pub use types::{
    CapabilityQueryPayload, CapabilityReport, DiscoveryPayload, HandshakePayload,
    HeartbeatPayload, MessageType, TaskOutcome,
};
