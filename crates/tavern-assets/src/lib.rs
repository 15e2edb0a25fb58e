// SPDX-License-Identifier: MIT OR Apache-2.0
//! tavern-assets
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Content-addressed local asset store.
//!
//! An asset's identity is derived from its bytes: the xxhash64 hex digest
//! is the integrity tag and its first 16 characters are the canonical
//! `asset_id`. The cache keeps one JSON registry file (rewritten atomically
//! through a temp file), a `<id[0..2]>/<id>_<filename>` directory layout,
//! and two secondary indices (`xxhash -> asset_id`, `path -> asset_id`)
//! that are rebuilt at startup and maintained on every mutation.

mod cache;
mod record;

pub use self::cache::{AssetCache, CleanupReport};
pub use self::record::{AssetRecord, AssetSource, CacheStats};

use std::io::Read;
use std::path::Path;

use xxhash_rust::xxh64::Xxh64;

/// Length of a canonical asset id in hex characters.
pub const ASSET_ID_LEN: usize = 16;

/// Seconds since the Unix epoch as a float, the registry timestamp format.
pub fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// xxhash64 hex digest of a byte slice, zero-padded to 16 characters.
pub fn xxh64_hex(bytes: &[u8]) -> String {
    format!("{:016x}", xxhash_rust::xxh64::xxh64(bytes, 0))
}

/// xxhash64 hex digest of a file, streamed in 8 KiB chunks.
pub fn xxh64_hex_file(path: &Path) -> std::io::Result<String> {
    let mut hasher = Xxh64::new(0);
    let mut file = std::fs::File::open(path)?;
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:016x}", hasher.digest()))
}

/// Canonical asset id for a byte slice: the first 16 hex chars of its
/// xxhash64 digest.
pub fn asset_id_for(bytes: &[u8]) -> String {
    let mut hex = xxh64_hex(bytes);
    hex.truncate(ASSET_ID_LEN);
    hex
}

/// Derive the canonical asset id from a full integrity tag.
pub fn asset_id_from_hash(xxhash: &str) -> String {
    xxhash.chars().take(ASSET_ID_LEN).collect()
}

/// Failures of cache operations.
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    /// Filesystem failure.
    #[error("asset cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The registry file could not be decoded.
    #[error("corrupt asset registry: {0}")]
    CorruptRegistry(#[from] serde_json::Error),

    /// The copy landed in the cache with different bytes than the source.
    #[error("cache copy verification failed: expected {expected}, got {actual}")]
    CopyMismatch {
        /// Hash of the source file.
        expected: String,
        /// Hash of the cached copy.
        actual: String,
    },

    /// No registry entry for that asset id.
    #[error("asset '{0}' not found in cache")]
    NotFound(String),
}

impl AssetError {
    /// The wire error code for this failure.
    pub fn wire_code(&self) -> tavern_error::ErrorCode {
        match self {
            Self::Io(_) => tavern_error::ErrorCode::IoError,
            Self::CorruptRegistry(_) => tavern_error::ErrorCode::IoError,
            Self::CopyMismatch { .. } => tavern_error::ErrorCode::CopyMismatch,
            Self::NotFound(_) => tavern_error::ErrorCode::NotFound,
        }
    }
}
