// SPDX-License-Identifier: MIT OR Apache-2.0
//! Wire error codes and failure reports for the tavern broker.
//!
//! [`ErrorCode`] is the stable, machine-readable snake_case tag that lands
//! in `error.data.error` or a `*_response.data.error` field. A code alone
//! is often enough; when a handler wants to ship diagnostics with it, it
//! starts a [`TavernError`] report off the code and appends rendered notes:
//!
//! ```
//! use tavern_error::ErrorCode;
//!
//! let report = ErrorCode::TargetOccupied
//!     .report("cell (5,6) is taken")
//!     .note("layer", "tokens");
//! assert_eq!(report.to_payload()["error"], "target_occupied");
//! ```
//!
//! Reports render everything eagerly (notes and cause become strings at
//! build time), so they are cheap to clone, order-stable on the wire, and
//! never drag a live error chain across task boundaries.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Wire-format and framing errors.
    Protocol,
    /// Permission and policy failures.
    Permission,
    /// A referenced table, sprite, asset, or character is missing.
    Lookup,
    /// Grid placement failures (bounds, occupancy).
    Placement,
    /// Optimistic character-version failures.
    Character,
    /// Asset content-hash failures.
    Asset,
    /// Transport and storage failures.
    Transport,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCategory {
    /// Lowercase name used in logs and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Protocol => "protocol",
            Self::Permission => "permission",
            Self::Lookup => "lookup",
            Self::Placement => "placement",
            Self::Character => "character",
            Self::Asset => "asset",
            Self::Transport => "transport",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `snake_case` string that is part of the
/// wire contract and guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // -- Protocol --
    /// JSON parse failure, unknown message type, or missing required field.
    MalformedMessage,

    // -- Permission --
    /// Caller lacks control of the entity or ownership of the character.
    Unauthorized,
    /// Caller exceeded a policy-layer rate limit.
    RateLimited,

    // -- Lookup --
    /// Table, sprite, asset, or character does not exist.
    NotFound,

    // -- Placement --
    /// Position lies outside the table bounds.
    BoundsViolation,
    /// Move destination cell is already occupied on that layer.
    TargetOccupied,

    // -- Character --
    /// Optimistic `expected_version` did not match the current version.
    VersionConflict,

    // -- Asset --
    /// Content hash does not match the asset id or the expected xxhash.
    HashMismatch,
    /// Local cache ingest verification failed after copy.
    CopyMismatch,

    // -- Transport --
    /// Transport or storage failure.
    IoError,
    /// The session is shutting down or already closed.
    SessionClosed,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MalformedMessage => ErrorCategory::Protocol,

            Self::Unauthorized | Self::RateLimited => ErrorCategory::Permission,

            Self::NotFound => ErrorCategory::Lookup,

            Self::BoundsViolation | Self::TargetOccupied => ErrorCategory::Placement,

            Self::VersionConflict => ErrorCategory::Character,

            Self::HashMismatch | Self::CopyMismatch => ErrorCategory::Asset,

            Self::IoError | Self::SessionClosed => ErrorCategory::Transport,

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"target_occupied"`), exactly as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedMessage => "malformed_message",
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate_limited",
            Self::NotFound => "not_found",
            Self::BoundsViolation => "bounds_violation",
            Self::TargetOccupied => "target_occupied",
            Self::VersionConflict => "version_conflict",
            Self::HashMismatch => "hash_mismatch",
            Self::CopyMismatch => "copy_mismatch",
            Self::IoError => "io_error",
            Self::SessionClosed => "session_closed",
            Self::Internal => "internal",
        }
    }

    /// Whether the session should stay open after reporting this error.
    ///
    /// Every code in the taxonomy is recoverable today; the method exists
    /// so policy layers can tighten `rate_limited` / `session_closed`
    /// handling without touching call sites.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::SessionClosed)
    }

    /// Start a failure report carrying this code.
    pub fn report(self, message: impl fmt::Display) -> TavernError {
        TavernError {
            code: self,
            message: message.to_string(),
            notes: Vec::new(),
            cause: None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TavernError
// ---------------------------------------------------------------------------

/// A failure report ready to cross the wire.
///
/// Built with [`ErrorCode::report`]; diagnostics are appended as rendered
/// key/value notes whose insertion order is preserved, and an optional
/// cause is captured as text via [`TavernError::caused_by`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TavernError {
    code: ErrorCode,
    message: String,
    notes: Vec<(String, String)>,
    cause: Option<String>,
}

impl TavernError {
    /// The wire code this report carries.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Human-readable summary.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Shorthand for `self.code().category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Append a diagnostic note, rendered immediately.
    pub fn note(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.notes.push((key.into(), value.to_string()));
        self
    }

    /// Record the underlying cause as text.
    ///
    /// Capturing the rendering instead of the error value keeps reports
    /// `Clone + Send` without bounds on what produced them.
    pub fn caused_by(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    /// The recorded notes, in insertion order.
    pub fn notes(&self) -> &[(String, String)] {
        &self.notes
    }

    /// The rendered cause, if one was recorded.
    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    /// Project the report into a wire payload.
    ///
    /// Shape: `{ "error": <code>, "message": <text>, "detail": { .. },
    /// "cause": <text> }`, with `detail` and `cause` present only when
    /// non-empty. The map drops straight into an `error` envelope or a
    /// `*_response` body.
    pub fn to_payload(&self) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("error".into(), self.code.as_str().into());
        payload.insert("message".into(), self.message.clone().into());
        if !self.notes.is_empty() {
            let detail: Map<String, Value> = self
                .notes
                .iter()
                .map(|(key, value)| (key.clone(), Value::from(value.clone())))
                .collect();
            payload.insert("detail".into(), Value::Object(detail));
        }
        if let Some(cause) = &self.cause {
            payload.insert("cause".into(), cause.clone().into());
        }
        payload
    }
}

impl fmt::Display for TavernError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        for (key, value) in &self.notes {
            write!(f, " {key}={value}")?;
        }
        if let Some(cause) = &self.cause {
            write!(f, " (caused by {cause})")?;
        }
        Ok(())
    }
}

impl std::error::Error for TavernError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
