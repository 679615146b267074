//! Messages exchanged over the upload connection.

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Server to client message.
///
/// Serialized as `{"type": "progress", "value": 42}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Integer percentage, 0 to 100.
    Progress(u8),
    /// Retrieval reference of the stored object. Terminal.
    Success(String),
    /// Human-readable failure reason. Terminal.
    Error(String),
}

impl ServerMessage {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }

    pub fn to_json(&self) -> String {
        // Serializing this enum cannot fail: it holds only strings and integers.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// JSON envelope for a chunk sent as a text frame: `{"bytes": "<base64>"}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkEnvelope {
    pub bytes: String,
}

impl ChunkEnvelope {
    pub fn encode(data: &[u8]) -> Self {
        Self {
            bytes: base64::engine::general_purpose::STANDARD.encode(data),
        }
    }

    /// Parse a text frame and decode its payload.
    pub fn decode_frame(text: &str) -> crate::Result<Bytes> {
        let envelope: ChunkEnvelope = serde_json::from_str(text)
            .map_err(|e| crate::Error::InvalidEnvelope(e.to_string()))?;
        base64::engine::general_purpose::STANDARD
            .decode(envelope.bytes.as_bytes())
            .map(Bytes::from)
            .map_err(|e| crate::Error::InvalidEnvelope(format!("invalid base64: {e}")))
    }
}
