// SPDX-License-Identifier: MIT OR Apache-2.0
//! Registry records and cache statistics.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How an asset entered the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetSource {
    /// Ingested from a local file before upload.
    Upload,
    /// Fetched from the blob store.
    Download,
}

/// One registry row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    /// Canonical content-derived id.
    pub asset_id: String,
    /// Original filename.
    pub filename: String,
    /// Where the bytes live on disk.
    pub local_path: PathBuf,
    /// Size in bytes at registration time.
    pub file_size: u64,
    /// Full xxhash64 hex integrity tag.
    pub xxhash: String,
    /// Secondary sha256 digest, recorded for upload ingests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Seconds since epoch at registration.
    pub cached_at: f64,
    /// Ingest path.
    pub source: AssetSource,
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub cache_hits: u64,
    /// Upload ingests registered.
    pub uploads_registered: u64,
    /// Download completions registered.
    pub downloads_registered: u64,
    /// Integrity verifications run.
    pub verifications: u64,
    /// Verifications that found corrupted bytes.
    pub verification_failures: u64,
    /// Ingests deduplicated against existing content.
    pub dedup_hits: u64,
}
