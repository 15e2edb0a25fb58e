// SPDX-License-Identifier: MIT OR Apache-2.0
//! Batch framing: many envelopes in one transport frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Envelope, ProtocolError, now_epoch};

/// Maximum number of messages allowed in a single batch frame.
pub const MAX_BATCH_LEN: usize = 1000;

/// Discriminator for the batch container, fixed to `"batch"` on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum BatchTag {
    #[default]
    Batch,
}

/// Container frame holding a sequence of envelopes.
///
/// Messages are processed in list order; an individual message that fails
/// to decode or to process does not abort the rest of the batch. Inner
/// messages are kept as raw JSON so one malformed entry cannot poison the
/// container — [`BatchEnvelope::decode_messages`] surfaces per-item results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEnvelope {
    #[serde(rename = "type")]
    tag: BatchTag,
    /// Raw inner messages, in processing order.
    pub messages: Vec<Value>,
    /// Batch sequence number.
    #[serde(default)]
    pub seq: u64,
    /// Seconds since epoch.
    #[serde(default = "now_epoch")]
    pub timestamp: f64,
}

impl BatchEnvelope {
    /// Build a batch frame from already-typed envelopes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Violation`] when the batch is empty or
    /// exceeds [`MAX_BATCH_LEN`]; [`ProtocolError::Json`] if an envelope
    /// cannot be serialized.
    pub fn from_envelopes(messages: &[Envelope], seq: u64) -> Result<Self, ProtocolError> {
        if messages.is_empty() {
            return Err(ProtocolError::Violation("batch is empty".into()));
        }
        if messages.len() > MAX_BATCH_LEN {
            return Err(ProtocolError::Violation(format!(
                "batch has {} messages, max is {MAX_BATCH_LEN}",
                messages.len()
            )));
        }
        let messages = messages
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            tag: BatchTag::Batch,
            messages,
            seq,
            timestamp: now_epoch(),
        })
    }

    /// Decode every inner message, one result per entry, in list order.
    pub fn decode_messages(&self) -> Vec<Result<Envelope, ProtocolError>> {
        self.messages
            .iter()
            .map(|raw| serde_json::from_value::<Envelope>(raw.clone()).map_err(ProtocolError::Json))
            .collect()
    }

    /// Number of inner messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the batch carries no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Outcome for a single message within a processed batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchItemResult {
    /// Zero-based index of the message in the original batch.
    pub index: usize,
    /// Whether the message was applied.
    pub success: bool,
    /// Failure description when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The reply envelope produced by the handler, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<Envelope>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MessageType, WireCodec};

    #[test]
    fn round_trip_preserves_order() {
        let msgs = vec![
            Envelope::new(MessageType::Ping),
            Envelope::new(MessageType::TableListRequest),
            Envelope::new(MessageType::Pong),
        ];
        let batch = BatchEnvelope::from_envelopes(&msgs, 7).unwrap();
        let text = serde_json::to_string(&batch).unwrap();
        assert!(text.contains("\"type\":\"batch\""));

        let back: BatchEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back.seq, 7);
        let decoded: Vec<_> = back
            .decode_messages()
            .into_iter()
            .map(|r| r.unwrap().kind)
            .collect();
        assert_eq!(
            decoded,
            vec![
                MessageType::Ping,
                MessageType::TableListRequest,
                MessageType::Pong
            ]
        );
    }

    #[test]
    fn malformed_inner_message_does_not_poison_the_rest() {
        let text = r#"{
            "type": "batch",
            "messages": [
                {"type": "ping", "data": {}},
                {"type": "definitely_not_real", "data": {}},
                {"type": "pong", "data": {}}
            ],
            "seq": 1
        }"#;
        let batch: BatchEnvelope = serde_json::from_str(text).unwrap();
        let results = batch.decode_messages();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }

    #[test]
    fn empty_and_oversized_batches_rejected() {
        assert!(BatchEnvelope::from_envelopes(&[], 0).is_err());
        let too_many = vec![Envelope::new(MessageType::Ping); MAX_BATCH_LEN + 1];
        assert!(BatchEnvelope::from_envelopes(&too_many, 0).is_err());
    }

    #[test]
    fn decode_frame_classifies_batches() {
        let batch =
            BatchEnvelope::from_envelopes(&[Envelope::new(MessageType::Ping)], 0).unwrap();
        let text = serde_json::to_string(&batch).unwrap();
        match WireCodec::decode_frame(&text).unwrap() {
            crate::Frame::Batch(b) => assert_eq!(b.len(), 1),
            crate::Frame::Single(_) => panic!("expected batch frame"),
        }

        let single = WireCodec::encode(&Envelope::new(MessageType::Ping)).unwrap();
        assert!(matches!(
            WireCodec::decode_frame(&single).unwrap(),
            crate::Frame::Single(_)
        ));
    }
}
