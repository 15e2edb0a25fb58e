// SPDX-License-Identifier: MIT OR Apache-2.0
//! The uniform outcome type returned by every action-layer operation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tavern_error::ErrorCode;
use tavern_table::TableError;

/// Outcome of a validated mutation or query.
///
/// Failures embed the stable wire code under `data.error` so protocol
/// layers can forward the result into a response payload verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Whether the operation was applied.
    pub success: bool,
    /// Human-readable summary.
    pub message: String,
    /// Operation-specific payload (authoritative positions, versions, ...).
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl ActionResult {
    /// A successful result with no payload.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Map::new(),
        }
    }

    /// A successful result carrying a payload.
    pub fn ok_with(message: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
        }
    }

    /// A failed result tagged with its wire code.
    pub fn err(code: ErrorCode, message: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("error".into(), code.as_str().into());
        Self {
            success: false,
            message: message.into(),
            data,
        }
    }

    /// Attach one payload entry.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// The wire code of a failed result, if present and recognised.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.data
            .get("error")
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_value(Value::String(s.to_string())).ok())
    }
}

impl From<TableError> for ActionResult {
    fn from(err: TableError) -> Self {
        ActionResult::err(err.wire_code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tavern_table::Position;

    #[test]
    fn err_embeds_wire_code() {
        let result = ActionResult::err(ErrorCode::TargetOccupied, "cell taken");
        assert!(!result.success);
        assert_eq!(result.data["error"], "target_occupied");
        assert_eq!(result.error_code(), Some(ErrorCode::TargetOccupied));
    }

    #[test]
    fn table_error_converts() {
        let result: ActionResult = TableError::OutOfBounds(Position(9, 9), 5, 5).into();
        assert_eq!(result.error_code(), Some(ErrorCode::BoundsViolation));
        assert!(result.message.contains("(9, 9)"));
    }

    #[test]
    fn with_field_accumulates_payload() {
        let result = ActionResult::ok("moved").with_field("version", 5);
        assert_eq!(result.data["version"], 5);
        assert!(result.error_code().is_none());
    }
}
