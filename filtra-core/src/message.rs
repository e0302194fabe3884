//! Wire protocol: the envelope and payload schemas carried over UDP.
//!
//! Each datagram holds one UTF-8 JSON serialization of an [`Envelope`].
//! Binary fields (`payload`, `image_bytes`) are base64-encoded so the
//! datagram stays text-safe end to end.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FiltraError;

/// Literal success marker carried in [`MessageKind::Ack`] payloads.
pub const ACK_PAYLOAD: &[u8] = b"OK";

// ── base64 payload fields ────────────────────────────────────────

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

// ── MessageKind ──────────────────────────────────────────────────

/// The four message kinds exchanged between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Client → dispatcher → worker: filter this image.
    FilterRequest,
    /// Worker → dispatcher → client: the filtered result.
    FilterResponse,
    /// Worker → dispatcher: registration handshake.
    WorkerRegister,
    /// Dispatcher → worker: registration confirmation.
    Ack,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── Envelope ─────────────────────────────────────────────────────

/// The outer message wrapper sent as one datagram.
///
/// Immutable once constructed, except that the receive loop stamps
/// `sender_ip` / `sender_port` with the observed datagram source, so
/// handlers always see the real origin address regardless of what the
/// sender claimed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    /// Opaque payload bytes; base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Fresh unique token per envelope. Not used for correlation.
    pub message_id: String,
    pub sender_ip: String,
    pub sender_port: u16,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Envelope {
    /// Build a new envelope with a fresh `message_id` and timestamp.
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            payload,
            message_id: Uuid::new_v4().to_string(),
            sender_ip: String::new(),
            sender_port: 0,
            timestamp: epoch_millis(),
        }
    }

    /// Stamp the sender fields (used by clients announcing their reply port).
    pub fn with_sender(mut self, ip: impl Into<String>, port: u16) -> Self {
        self.sender_ip = ip.into();
        self.sender_port = port;
        self
    }

    /// Serialize to UTF-8 JSON bytes for transmission.
    pub fn encode(&self) -> Result<Vec<u8>, FiltraError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from received datagram bytes.
    pub fn decode(data: &[u8]) -> Result<Self, FiltraError> {
        Ok(serde_json::from_slice(data)?)
    }
}

// ── ImageTask ────────────────────────────────────────────────────

/// Payload of `FilterRequest` and `FilterResponse` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageTask {
    /// Image file bytes (PNG/JPEG/…); base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub image_bytes: Vec<u8>,
    pub filename: String,
    pub width: u32,
    pub height: u32,
    /// Source format name, informational ("png", "jpeg", …).
    pub format: String,
    /// Client-minted token correlating the request with its response
    /// across both network legs.
    pub task_id: String,
    /// Set only on the response leg: the listening port of the worker
    /// that produced the result. The datagram's own source port may
    /// differ from the worker's registered port, so the dispatcher
    /// must not rely on it.
    pub origin_worker_port: u16,
}

impl ImageTask {
    /// Build a request-leg task with a fresh `task_id`.
    pub fn new(
        image_bytes: Vec<u8>,
        filename: impl Into<String>,
        width: u32,
        height: u32,
        format: impl Into<String>,
    ) -> Self {
        Self {
            image_bytes,
            filename: filename.into(),
            width,
            height,
            format: format.into(),
            task_id: Uuid::new_v4().to_string(),
            origin_worker_port: 0,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FiltraError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, FiltraError> {
        Ok(serde_json::from_slice(data)?)
    }
}

// ── WorkerAnnounce ───────────────────────────────────────────────

/// Payload of `WorkerRegister` envelopes: where the worker listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAnnounce {
    pub ip: String,
    pub port: u16,
}

impl WorkerAnnounce {
    pub fn encode(&self) -> Result<Vec<u8>, FiltraError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, FiltraError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let env = Envelope::new(MessageKind::FilterRequest, vec![1, 2, 3, 255]);
        let bytes = env.encode().unwrap();
        let back = Envelope::decode(&bytes).unwrap();

        assert_eq!(back.kind, MessageKind::FilterRequest);
        assert_eq!(back.payload, vec![1, 2, 3, 255]);
        assert_eq!(back.message_id, env.message_id);
        assert_eq!(back.timestamp, env.timestamp);
    }

    #[test]
    fn payload_is_text_safe_on_the_wire() {
        let env = Envelope::new(MessageKind::Ack, vec![0x00, 0xFF, 0x80]);
        let bytes = env.encode().unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();

        // base64, not a JSON number array
        assert!(text.contains("\"payload\":\"AP+A\""));
    }

    #[test]
    fn kind_names_on_the_wire() {
        for (kind, name) in [
            (MessageKind::FilterRequest, "FilterRequest"),
            (MessageKind::FilterResponse, "FilterResponse"),
            (MessageKind::WorkerRegister, "WorkerRegister"),
            (MessageKind::Ack, "Ack"),
        ] {
            let env = Envelope::new(kind, Vec::new());
            let text = String::from_utf8(env.encode().unwrap()).unwrap();
            assert!(text.contains(name), "missing {name} in {text}");
        }
    }

    #[test]
    fn fresh_message_ids() {
        let a = Envelope::new(MessageKind::Ack, Vec::new());
        let b = Envelope::new(MessageKind::Ack, Vec::new());
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(Envelope::decode(b"not json at all").is_err());
        assert!(Envelope::decode(b"{\"kind\":\"Nonsense\"}").is_err());
    }

    #[test]
    fn image_task_roundtrip() {
        let task = ImageTask::new(vec![9, 8, 7], "cat.png", 640, 480, "png");
        let bytes = task.encode().unwrap();
        let back = ImageTask::decode(&bytes).unwrap();

        assert_eq!(back.filename, "cat.png");
        assert_eq!(back.width, 640);
        assert_eq!(back.height, 480);
        assert_eq!(back.task_id, task.task_id);
        assert_eq!(back.origin_worker_port, 0);
        assert_eq!(back.image_bytes, vec![9, 8, 7]);
    }

    #[test]
    fn worker_announce_roundtrip() {
        let ann = WorkerAnnounce {
            ip: "127.0.0.1".into(),
            port: 9100,
        };
        let back = WorkerAnnounce::decode(&ann.encode().unwrap()).unwrap();
        assert_eq!(back.ip, "127.0.0.1");
        assert_eq!(back.port, 9100);
    }
}
