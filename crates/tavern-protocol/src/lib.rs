// SPDX-License-Identifier: MIT OR Apache-2.0
//! tavern-protocol
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Wire format for the tabletop session broker.
//!
//! Every frame on the wire is one JSON [`Envelope`] (or a
//! [`BatchEnvelope`](batch::BatchEnvelope) container). The envelope carries
//! a closed [`MessageType`] tag, an open `data` object whose schema is
//! determined by the tag, and the sequencing metadata used for ordering and
//! deduplication. The same schema is used on every transport; WebSocket
//! text frames carry one envelope each, and a newline-delimited variant
//! serves legacy raw-TCP connections.

pub mod batch;
pub mod dedup;
pub mod router;
mod types;

pub use self::batch::{BatchEnvelope, BatchItemResult};
pub use self::dedup::DedupWindow;
pub use self::router::Router;
pub use self::types::{MessageType, UnknownMessageType};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::BufRead;
use std::str::FromStr;
use thiserror::Error;

use tavern_error::{ErrorCode, TavernError};

/// Protocol version stamped on every envelope.
pub const PROTOCOL_VERSION: &str = "0.1";

/// Default envelope priority (normal).
pub const PRIORITY_NORMAL: u8 = 5;
/// High envelope priority.
pub const PRIORITY_HIGH: u8 = 2;
/// Critical envelope priority.
pub const PRIORITY_CRITICAL: u8 = 0;

/// Seconds since the Unix epoch as a float, the wire timestamp format.
pub fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Generate a fresh 16-hex-char client identifier.
pub fn generate_client_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// Errors arising from encoding/decoding or protocol-level violations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON serialization or deserialization failure.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame parsed as JSON but its `type` tag is not in the enumeration.
    #[error(transparent)]
    UnknownType(#[from] UnknownMessageType),

    /// Underlying I/O error (newline-delimited stream decoding).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A protocol-level invariant was violated.
    #[error("protocol violation: {0}")]
    Violation(String),
}

impl ProtocolError {
    /// The wire error code a peer should receive for this failure.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            Self::Json(_) | Self::UnknownType(_) | Self::Violation(_) => {
                ErrorCode::MalformedMessage
            }
            Self::Io(_) => ErrorCode::IoError,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Mirror of the wire object used for tolerant decoding.
///
/// Unknown fields are ignored for forward compatibility; missing optional
/// fields take their protocol defaults on conversion into [`Envelope`].
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Map<String, Value>>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    timestamp: Option<f64>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    priority: Option<u8>,
    #[serde(default)]
    sequence_id: Option<u64>,
}

/// The unit of communication.
///
/// # Examples
///
/// ```
/// use tavern_protocol::{Envelope, MessageType, WireCodec};
/// use serde_json::json;
///
/// let ping = Envelope::new(MessageType::Ping);
/// let text = WireCodec::encode(&ping).unwrap();
/// assert!(text.contains("\"type\":\"ping\""));
///
/// let decoded = WireCodec::decode(&text).unwrap();
/// assert_eq!(decoded.kind, MessageType::Ping);
/// assert_eq!(decoded.version, "0.1");
/// assert_eq!(decoded.priority, 5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "RawEnvelope")]
pub struct Envelope {
    /// Message tag; determines the schema of `data`.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Open payload object; `{}` when the message carries no payload.
    pub data: Map<String, Value>,
    /// Sender identifier (16 hex chars), absent on server-originated frames.
    pub client_id: Option<String>,
    /// Seconds since epoch, set at construction when the sender omits it.
    pub timestamp: f64,
    /// Protocol version string.
    pub version: String,
    /// 0 critical, 2 high, 5 normal.
    pub priority: u8,
    /// Optional ordering/deduplication sequence number.
    pub sequence_id: Option<u64>,
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = UnknownMessageType;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        Ok(Self {
            kind: MessageType::from_str(&raw.kind)?,
            data: raw.data.unwrap_or_default(),
            client_id: raw.client_id,
            timestamp: raw.timestamp.unwrap_or_else(now_epoch),
            version: raw.version.unwrap_or_else(|| PROTOCOL_VERSION.to_string()),
            priority: raw.priority.unwrap_or(PRIORITY_NORMAL),
            sequence_id: raw.sequence_id,
        })
    }
}

impl Envelope {
    /// Create an envelope with an empty payload and default metadata.
    pub fn new(kind: MessageType) -> Self {
        Self::with_data(kind, Map::new())
    }

    /// Create an envelope with the given payload object.
    pub fn with_data(kind: MessageType, data: Map<String, Value>) -> Self {
        Self {
            kind,
            data,
            client_id: None,
            timestamp: now_epoch(),
            version: PROTOCOL_VERSION.to_string(),
            priority: PRIORITY_NORMAL,
            sequence_id: None,
        }
    }

    /// Create an envelope from any JSON-object-shaped payload.
    ///
    /// # Panics
    ///
    /// Panics if `data` does not serialize to a JSON object; payloads are
    /// objects by protocol contract, so this only trips on programmer error.
    pub fn from_payload(kind: MessageType, data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(Value::Object(map)) => Self::with_data(kind, map),
            _ => panic!("envelope payload must serialize to a JSON object"),
        }
    }

    /// A `pong` reply carrying the current server timestamp.
    pub fn pong() -> Self {
        let mut data = Map::new();
        data.insert("timestamp".into(), now_epoch().into());
        Self::with_data(MessageType::Pong, data)
    }

    /// An `error` envelope with the stable code and a human message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::failure(&code.report(message.into()))
    }

    /// An `error` envelope carrying a full failure report, including its
    /// diagnostic notes and rendered cause.
    pub fn failure(report: &TavernError) -> Self {
        Self::with_data(MessageType::Error, report.to_payload())
    }

    /// A `success` acknowledgement with an optional payload.
    pub fn success(data: Map<String, Value>) -> Self {
        Self::with_data(MessageType::Success, data)
    }

    /// Set the sender id.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set the ordering sequence number.
    pub fn with_sequence(mut self, sequence_id: u64) -> Self {
        self.sequence_id = Some(sequence_id);
        self
    }

    /// Set the priority (clamped to 0..=9).
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(9);
        self
    }

    /// Fetch a string field from the payload.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Fetch an unsigned integer field from the payload.
    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(Value::as_u64)
    }

    /// Fetch a nested object field from the payload.
    pub fn object_field(&self, key: &str) -> Option<&Map<String, Value>> {
        self.data.get(key).and_then(Value::as_object)
    }
}

// ---------------------------------------------------------------------------
// Frames and codec
// ---------------------------------------------------------------------------

/// One decoded transport frame: a single envelope or a batch container.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A single message.
    Single(Envelope),
    /// A batch of messages processed in list order.
    Batch(BatchEnvelope),
}

/// Stateless codec for the JSON wire format.
#[derive(Debug, Clone, Copy)]
pub struct WireCodec;

impl WireCodec {
    /// Serialize an [`Envelope`] to a JSON string (one per transport frame).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Json`] if the envelope cannot be serialized.
    pub fn encode(msg: &Envelope) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(msg)?)
    }

    /// Serialize an [`Envelope`] as a newline-terminated JSON line, the
    /// legacy framing for raw TCP connections.
    pub fn encode_line(msg: &Envelope) -> Result<String, ProtocolError> {
        let mut s = Self::encode(msg)?;
        s.push('\n');
        Ok(s)
    }

    /// Deserialize a single envelope.
    ///
    /// Unknown JSON fields are ignored; an unknown `type` tag fails with
    /// [`ProtocolError::UnknownType`].
    pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
        match serde_json::from_str::<Envelope>(text) {
            Ok(env) => Ok(env),
            // serde folds the UnknownMessageType display into a custom
            // error; re-parse the tag to classify it precisely.
            Err(e) => {
                if let Ok(raw) = serde_json::from_str::<RawEnvelope>(text)
                    && let Err(unknown) = MessageType::from_str(&raw.kind)
                {
                    return Err(ProtocolError::UnknownType(unknown));
                }
                Err(ProtocolError::Json(e))
            }
        }
    }

    /// Deserialize a transport frame, dispatching on the `type` tag.
    pub fn decode_frame(text: &str) -> Result<Frame, ProtocolError> {
        let probe: Value = serde_json::from_str(text)?;
        let tag = probe
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Violation("frame has no type tag".into()))?;
        if tag == MessageType::Batch.as_str() {
            Ok(Frame::Batch(serde_json::from_value(probe)?))
        } else {
            Self::decode(text).map(Frame::Single)
        }
    }

    /// Return a lazy iterator decoding newline-delimited envelopes from
    /// `reader`, skipping blank lines.
    pub fn decode_stream(
        reader: impl BufRead,
    ) -> impl Iterator<Item = Result<Envelope, ProtocolError>> {
        reader.lines().filter_map(|line_result| match line_result {
            Err(e) => Some(Err(ProtocolError::Io(e))),
            Ok(line) => {
                if line.trim().is_empty() {
                    None
                } else {
                    Some(Self::decode(line.trim()))
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Version negotiation helpers
// ---------------------------------------------------------------------------

/// Parse a version string of the form `"MAJOR.MINOR"` into `(MAJOR, MINOR)`.
///
/// Returns `None` if the string does not match the expected format.
#[must_use]
pub fn parse_version(version: &str) -> Option<(u32, u32)> {
    let (major_str, minor_str) = version.split_once('.')?;
    let major = major_str.parse::<u32>().ok()?;
    let minor = minor_str.parse::<u32>().ok()?;
    Some((major, minor))
}

/// Two versions are compatible when they share the same major component.
///
/// Returns `false` if either string cannot be parsed.
#[must_use]
pub fn is_compatible_version(their_version: &str, our_version: &str) -> bool {
    match (parse_version(their_version), parse_version(our_version)) {
        (Some((their_major, _)), Some((our_major, _))) => their_major == our_major,
        _ => false,
    }
}
