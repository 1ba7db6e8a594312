//! Mesh wire format.
//!
//! Frames are JSON; bodies above the compression threshold may be gzipped
//! and carried base64-encoded when that actually saves space. Decompression
//! is transparent on receive.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{Read, Write};
use uuid::Uuid;

use crate::counter::CounterUpdate;
use crate::envelope::now_ms;
use crate::sync::ConfigUpdate;

/// Shared adapter state replicated via `state_sync`. Larger timestamp wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SharedState {
    pub cursor_position: i64,
    pub last_msg_id: Option<String>,
    pub timestamp: i64,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            cursor_position: 0,
            last_msg_id: None,
            timestamp: now_ms(),
        }
    }
}

/// Typed frame body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum FrameBody {
    /// Application message relayed between sidecars.
    Message(Value),
    CounterUpdate(CounterUpdate),
    ConfigUpdate(ConfigUpdate),
    StateSync(SharedState),
    Heartbeat { timestamp: i64 },
    /// Acknowledges receipt of the idempotent frame `message_id`.
    Ack { message_id: String },
}

impl FrameBody {
    /// The kind string used for priority lookup and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::CounterUpdate(_) => "counter_update",
            Self::ConfigUpdate(_) => "config_update",
            Self::StateSync(_) => "state_sync",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Ack { .. } => "ack",
        }
    }
}

/// One frame on the mesh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireFrame {
    pub message_id: String,
    pub source_id: String,
    pub idempotent: bool,
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: FrameBody,
}

impl WireFrame {
    pub fn new(source_id: &str, idempotent: bool, body: FrameBody) -> Self {
        Self {
            message_id: format!(
                "{source_id}-{}-{}",
                &Uuid::new_v4().to_string()[..8],
                now_ms()
            ),
            source_id: source_id.to_string(),
            idempotent,
            timestamp: now_ms(),
            body,
        }
    }

    pub fn ack_for(source_id: &str, message_id: &str) -> Self {
        Self::new(
            source_id,
            false,
            FrameBody::Ack {
                message_id: message_id.to_string(),
            },
        )
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }
}

// ─── Compression ──────────────────────────────────────────────────────────────

/// Wrapper for a gzipped frame. The `compressed` tag distinguishes it from
/// a plain frame on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CompressedFrame {
    compressed: bool,
    /// Base64 of the gzipped frame JSON.
    data: String,
    original_size: usize,
    compressed_size: usize,
}

/// Result of encoding a frame for the wire.
pub struct Encoded {
    pub text: String,
    /// `(original, compressed)` byte sizes when gzip was used.
    pub compression: Option<(usize, usize)>,
}

/// Serialize a frame, gzipping when enabled, above the threshold, and
/// actually worth it (at least 10% smaller after base64 overhead).
pub fn encode_frame(
    frame: &WireFrame,
    enable_compression: bool,
    threshold: usize,
) -> serde_json::Result<Encoded> {
    let plain = serde_json::to_string(frame)?;
    if !enable_compression || plain.len() < threshold {
        return Ok(Encoded {
            text: plain,
            compression: None,
        });
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let gz = match encoder
        .write_all(plain.as_bytes())
        .and_then(|()| encoder.finish())
    {
        Ok(gz) => gz,
        // A gzip failure just means we send the plain frame.
        Err(_) => {
            return Ok(Encoded {
                text: plain,
                compression: None,
            })
        }
    };

    let data = BASE64.encode(&gz);
    if data.len() >= plain.len() * 9 / 10 {
        return Ok(Encoded {
            text: plain,
            compression: None,
        });
    }

    let wrapper = CompressedFrame {
        compressed: true,
        compressed_size: data.len(),
        original_size: plain.len(),
        data,
    };
    Ok(Encoded {
        compression: Some((wrapper.original_size, wrapper.compressed_size)),
        text: serde_json::to_string(&wrapper)?,
    })
}

/// Parse a frame, transparently inflating the compressed wrapper.
pub fn decode_frame(text: &str) -> Result<WireFrame, DecodeError> {
    if let Ok(wrapper) = serde_json::from_str::<CompressedFrame>(text) {
        if wrapper.compressed {
            let gz = BASE64.decode(&wrapper.data).map_err(|_| DecodeError::Base64)?;
            let mut decoder = GzDecoder::new(gz.as_slice());
            let mut plain = String::new();
            decoder
                .read_to_string(&mut plain)
                .map_err(|_| DecodeError::Gzip)?;
            return serde_json::from_str(&plain).map_err(DecodeError::Json);
        }
    }
    serde_json::from_str(text).map_err(DecodeError::Json)
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid base64 in compressed frame")]
    Base64,
    #[error("gzip inflate failed")]
    Gzip,
    #[error("invalid frame json: {0}")]
    Json(#[from] serde_json::Error),
}
