//! Envelope items: typed headers, payload views, and framing metadata

use std::io::Read;

use bytes::Bytes;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EnvelopeError, EnvelopeResult};

/// Declared type of an envelope item.
///
/// The ingestion format is open-ended: item types unknown to this harness
/// are carried through as [`ItemType::Other`] rather than rejected, since
/// an SDK under test may legitimately emit newer item kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ItemType {
    /// Error or message event. Error events carry no `type` field in their
    /// payload; transactions do.
    Event,
    Transaction,
    Session,
    Sessions,
    Attachment,
    ClientReport,
    Profile,
    ReplayEvent,
    ReplayRecording,
    CheckIn,
    /// StatsD-style metrics line protocol (plain text, not JSON).
    Statsd,
    Log,
    Span,
    Feedback,
    /// Forward-compatibility passthrough for unrecognized item types.
    Other(String),
}

impl ItemType {
    pub fn as_str(&self) -> &str {
        match self {
            ItemType::Event => "event",
            ItemType::Transaction => "transaction",
            ItemType::Session => "session",
            ItemType::Sessions => "sessions",
            ItemType::Attachment => "attachment",
            ItemType::ClientReport => "client_report",
            ItemType::Profile => "profile",
            ItemType::ReplayEvent => "replay_event",
            ItemType::ReplayRecording => "replay_recording",
            ItemType::CheckIn => "check_in",
            ItemType::Statsd => "statsd",
            ItemType::Log => "log",
            ItemType::Span => "span",
            ItemType::Feedback => "feedback",
            ItemType::Other(s) => s,
        }
    }

    /// Whether this item's payload is declared to be JSON on the wire.
    pub fn is_json(&self) -> bool {
        matches!(
            self,
            ItemType::Event
                | ItemType::Transaction
                | ItemType::Session
                | ItemType::Sessions
                | ItemType::ClientReport
                | ItemType::Profile
                | ItemType::ReplayEvent
                | ItemType::CheckIn
                | ItemType::Log
                | ItemType::Span
                | ItemType::Feedback
        )
    }

    /// Whether this item's payload is a plain text line protocol.
    pub fn is_text(&self) -> bool {
        matches!(self, ItemType::Statsd)
    }

    /// Whether this item's payload must be treated as raw bytes.
    /// Replay recordings in particular may be gzip-compressed rrweb data.
    pub fn is_binary(&self) -> bool {
        !self.is_json() && !self.is_text()
    }
}

impl From<String> for ItemType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "event" => ItemType::Event,
            "transaction" => ItemType::Transaction,
            "session" => ItemType::Session,
            "sessions" => ItemType::Sessions,
            "attachment" => ItemType::Attachment,
            "client_report" => ItemType::ClientReport,
            "profile" => ItemType::Profile,
            "replay_event" => ItemType::ReplayEvent,
            "replay_recording" => ItemType::ReplayRecording,
            "check_in" => ItemType::CheckIn,
            "statsd" => ItemType::Statsd,
            "log" => ItemType::Log,
            "span" => ItemType::Span,
            "feedback" => ItemType::Feedback,
            _ => ItemType::Other(s),
        }
    }
}

impl From<ItemType> for String {
    fn from(ty: ItemType) -> Self {
        ty.as_str().to_string()
    }
}

impl std::fmt::Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item header line preceding each payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemHeader {
    #[serde(rename = "type")]
    pub ty: ItemType,

    /// Payload byte length. When present, the payload is exactly this many
    /// raw bytes (binary-safe); when absent, the payload is one
    /// newline-terminated line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    /// Passthrough for header keys this harness does not model.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ItemHeader {
    pub fn new(ty: ItemType) -> Self {
        Self {
            ty,
            length: None,
            content_type: None,
            filename: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Typed view of an item payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemPayload {
    Json(Value),
    Text(String),
    Binary(Bytes),
}

/// One decoded `(item header, payload)` pair.
///
/// `raw` holds the exact payload bytes as framed on the wire and is
/// authoritative for re-encoding; `payload` is the decoded view.
#[derive(Debug, Clone)]
pub struct EnvelopeItem {
    pub header: ItemHeader,
    pub raw: Bytes,
    pub payload: ItemPayload,
}

impl EnvelopeItem {
    /// Decode a payload according to the declared item type.
    pub(crate) fn decode(header: ItemHeader, raw: Bytes) -> EnvelopeResult<Self> {
        let payload = if header.ty.is_json() {
            let value: Value = serde_json::from_slice(&raw).map_err(|e| {
                EnvelopeError::Decode(format!(
                    "item of type '{}' declared JSON payload but failed to parse: {}",
                    header.ty, e
                ))
            })?;
            ItemPayload::Json(value)
        } else if header.ty.is_text() {
            let text = std::str::from_utf8(&raw).map_err(|e| {
                EnvelopeError::Decode(format!(
                    "item of type '{}' declared text payload but is not UTF-8: {}",
                    header.ty, e
                ))
            })?;
            ItemPayload::Text(text.to_string())
        } else {
            ItemPayload::Binary(raw.clone())
        };

        Ok(Self { header, raw, payload })
    }

    /// JSON payload, if this item decoded as JSON.
    pub fn json(&self) -> Option<&Value> {
        match &self.payload {
            ItemPayload::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Text payload, if this item decoded as text.
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            ItemPayload::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Exact payload bytes as framed on the wire.
    pub fn bytes(&self) -> &Bytes {
        &self.raw
    }

    /// Payload bytes with gzip transparently undone.
    ///
    /// Replay recording items are gzip-compressed once they exceed the
    /// SDK's compression threshold; earlier segments may be plain. Bytes
    /// without the gzip magic pass through unchanged.
    pub fn decompressed(&self) -> EnvelopeResult<Bytes> {
        if self.raw.len() >= 2 && self.raw[0] == 0x1f && self.raw[1] == 0x8b {
            let mut out = Vec::new();
            GzDecoder::new(self.raw.as_ref())
                .read_to_end(&mut out)
                .map_err(|e| {
                    EnvelopeError::Decode(format!("gzip payload failed to decompress: {}", e))
                })?;
            Ok(Bytes::from(out))
        } else {
            Ok(self.raw.clone())
        }
    }
}
