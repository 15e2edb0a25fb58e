// SPDX-License-Identifier: MIT OR Apache-2.0
//! tavern-io
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Asynchronous blob and storage I/O behind an operation book.
//!
//! The owner of an [`IoBook`] (the client main loop, or a session task)
//! starts operations and receives [`IoCompletion`] records by draining
//! [`IoBook::process_completed_operations`] — workers never touch the table
//! model or the asset cache, preserving single-threaded ownership of
//! authoritative state. Downloads verify an `expected_hash` incrementally
//! and report `hash_valid` in their completion record.

mod book;

pub use self::book::IoBook;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Timeout for presigned-URL downloads.
pub const DOWNLOAD_TIMEOUT_SECS: u64 = 30;
/// Timeout for presigned-URL uploads.
pub const UPLOAD_TIMEOUT_SECS: u64 = 60;

/// Generate a fresh 8-hex-char operation identifier.
pub fn generate_operation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// What kind of work an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// HTTP GET of a presigned URL to disk.
    Download,
    /// HTTP PUT of local bytes to a presigned URL.
    Upload,
    /// Read a file from managed storage.
    StorageLoad,
    /// Write a file into managed storage.
    StorageSave,
    /// Copy an external file into managed storage.
    ExternalImport,
}

impl OperationKind {
    /// Stable name used in completion records and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Upload => "upload",
            Self::StorageLoad => "storage_load",
            Self::StorageSave => "storage_save",
            Self::ExternalImport => "external_import",
        }
    }
}

/// Completion record published by a finished operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoCompletion {
    /// The operation this record concludes.
    pub operation_id: String,
    /// What the operation did.
    pub kind: OperationKind,
    /// Whether it succeeded.
    pub success: bool,
    /// Failure description when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Local file involved, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    /// Remote URL involved, for download/upload kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Bytes transferred or read.
    #[serde(default)]
    pub size: u64,
    /// xxhash64 hex digest of the bytes, when computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Verification verdict for downloads given an `expected_hash`;
    /// `None` when no expectation was supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_valid: Option<bool>,
    /// Loaded bytes for `storage_load` operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    /// Caller-supplied context echoed back verbatim.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl IoCompletion {
    pub(crate) fn failure(
        operation_id: String,
        kind: OperationKind,
        error: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            operation_id,
            kind,
            success: false,
            error: Some(error.into()),
            file_path: None,
            url: None,
            size: 0,
            hash: None,
            hash_valid: None,
            data: None,
            metadata,
        }
    }
}
