//! Media unit framing: the plaintext structure that gets encrypted as a whole
//! and carried base64-encoded inside a `session`/`content` envelope.
//!
//! Pure data — no I/O.

use serde::{Deserialize, Serialize};

use super::roster::Medium;

// ---------------------------------------------------------------------------
// MediaUnit
// ---------------------------------------------------------------------------

/// One audio frame, video frame chunk, or chat line.
///
/// The whole unit is serialized, encrypted under the call key, and only then
/// wrapped in the outer envelope, so nothing here is visible on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaUnit {
    pub medium: Medium,
    /// Per-medium monotonic sequence number of the sender.
    pub seq: u64,
    /// The call-wide random value distributed at handshake time. Units whose
    /// session nonce does not match the receiver's are foreign or stale and
    /// are dropped before any further processing.
    pub session_nonce: u64,
    /// Fresh random value per unit; receivers remember the last few to detect
    /// replays.
    pub packet_nonce: u64,
    /// Sender's directory name.
    pub source: String,
    /// Send time, microseconds since the Unix epoch. Drives the receiver's
    /// latency estimate.
    pub timestamp_us: u64,
    #[serde(with = "payload_b64")]
    pub payload: Vec<u8>,
}

impl MediaUnit {
    /// Serialized size proxy used by the bitrate estimator.
    pub fn wire_len(&self) -> usize {
        self.payload.len()
    }
}

// ---------------------------------------------------------------------------
// Frame errors
// ---------------------------------------------------------------------------

/// Why an incoming content envelope was dropped. All of these are silent on
/// the wire: no error is ever signaled back to the sender.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("payload is not valid base64")]
    Base64(#[from] base64::DecodeError),
    #[error("ciphertext too short")]
    Truncated,
    #[error("authentication failed")]
    Crypto,
    #[error("unit is not valid JSON: {0}")]
    Codec(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// base64 payload (de)serialization
// ---------------------------------------------------------------------------

mod payload_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_round_trip_preserves_payload() {
        let unit = MediaUnit {
            medium: Medium::Video,
            seq: 17,
            session_nonce: 0xD00D,
            packet_nonce: 42,
            source: "alice".into(),
            timestamp_us: 1_700_000_000_000_000,
            payload: vec![0, 1, 2, 255, 254],
        };
        let json = serde_json::to_string(&unit).unwrap();
        // Payload travels as a base64 string, not a JSON array.
        assert!(json.contains("\"payload\":\"AAEC//4=\""));
        let back: MediaUnit = serde_json::from_str(&json).unwrap();
        assert_eq!(back, unit);
    }
}
