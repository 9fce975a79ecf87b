//! JSON codec for envelopes.
//!
//! One envelope per datagram or per TCP connection, encoded as a single JSON
//! object:
//!
//! ```text
//! { "type": <int>, "sender": <string>, "recipient": <string>,
//!   "session": <string>, "timestamp": <int64>, "payload": <string> }
//! ```

use serde::Deserialize;

use super::envelope::Envelope;
use super::types::MessageType;
use crate::error::ProtocolError;

/// Encode an envelope, rejecting oversized payloads before they hit the wire.
pub fn encode(envelope: &Envelope, max_payload: usize) -> Result<Vec<u8>, ProtocolError> {
    envelope.check_payload(max_payload)?;
    serde_json::to_vec(envelope)
        .map_err(|e| ProtocolError::Malformed(format!("encode failed: {}", e)))
}

/// Same field layout as [`Envelope`], with the type left as a raw integer so
/// unknown values surface as [`ProtocolError::UnknownType`].
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    message_type: i64,
    sender: String,
    #[serde(default)]
    recipient: String,
    #[serde(default)]
    session: String,
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    payload: String,
}

/// Decode and validate an inbound frame.
pub fn decode(bytes: &[u8], max_payload: usize) -> Result<Envelope, ProtocolError> {
    let raw: RawEnvelope =
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let message_type = MessageType::try_from(raw.message_type)?;

    if raw.sender.is_empty() {
        return Err(ProtocolError::Malformed("empty sender".to_string()));
    }
    if message_type.is_correlated() && raw.session.is_empty() {
        return Err(ProtocolError::Malformed(format!(
            "{} without session id",
            message_type
        )));
    }

    let envelope = Envelope {
        message_type,
        sender_id: raw.sender,
        recipient_id: raw.recipient,
        session_id: raw.session,
        timestamp: raw.timestamp,
        payload: raw.payload,
    };
    envelope.check_payload(max_payload)?;
    Ok(envelope)
}
