// SPDX-License-Identifier: MIT OR Apache-2.0
//! The on-disk cache and its JSON registry.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::{AssetError, AssetRecord, AssetSource, CacheStats, now_epoch, xxh64_hex_file};

/// Summary of a [`AssetCache::cleanup`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Registry rows removed.
    pub removed: usize,
    /// Bytes freed on disk.
    pub freed_bytes: u64,
}

/// Content-addressed local asset store.
///
/// Layout: `<cache_dir>/<asset_id[0..2]>/<asset_id>_<filename>` for cached
/// bytes and `<cache_dir>/asset_registry.json` for the registry, which is
/// rewritten atomically (temp file then rename) on every mutation.
pub struct AssetCache {
    cache_dir: PathBuf,
    registry_path: PathBuf,
    registry: HashMap<String, AssetRecord>,
    hash_to_asset: HashMap<String, String>,
    path_to_asset: HashMap<PathBuf, String>,
    stats: CacheStats,
}

impl AssetCache {
    /// Open (or create) a cache rooted at `cache_dir`.
    ///
    /// Loads the registry if present and rebuilds both secondary indices.
    pub fn open(cache_dir: impl Into<PathBuf>) -> Result<Self, AssetError> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        let registry_path = cache_dir.join("asset_registry.json");
        let registry: HashMap<String, AssetRecord> = if registry_path.exists() {
            let bytes = std::fs::read(&registry_path)?;
            match serde_json::from_slice(&bytes) {
                Ok(registry) => registry,
                Err(e) => {
                    warn!(path = %registry_path.display(), error = %e, "unreadable asset registry, starting empty");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        let mut cache = Self {
            cache_dir,
            registry_path,
            registry,
            hash_to_asset: HashMap::new(),
            path_to_asset: HashMap::new(),
            stats: CacheStats::default(),
        };
        cache.rebuild_indices();
        info!(
            cache_dir = %cache.cache_dir.display(),
            assets = cache.registry.len(),
            "asset cache opened"
        );
        Ok(cache)
    }

    fn rebuild_indices(&mut self) {
        self.hash_to_asset.clear();
        self.path_to_asset.clear();
        for (asset_id, record) in &self.registry {
            self.hash_to_asset
                .insert(record.xxhash.clone(), asset_id.clone());
            self.path_to_asset
                .insert(record.local_path.clone(), asset_id.clone());
        }
        debug!(entries = self.hash_to_asset.len(), "hash index rebuilt");
    }

    /// Where an asset's bytes land inside the cache tree.
    pub fn cache_path_for(&self, asset_id: &str, filename: &str) -> PathBuf {
        let subdir = if asset_id.len() >= 2 {
            &asset_id[..2]
        } else {
            "misc"
        };
        self.cache_dir
            .join(subdir)
            .join(format!("{asset_id}_{filename}"))
    }

    fn save_registry(&self) -> Result<(), AssetError> {
        let bytes = serde_json::to_vec_pretty(&self.registry)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.cache_dir)?;
        tmp.write_all(&bytes)?;
        tmp.persist(&self.registry_path)
            .map_err(|e| AssetError::Io(e.error))?;
        Ok(())
    }

    // -- lookups ------------------------------------------------------------

    /// Whether the asset is registered and its file exists.
    pub fn is_cached(&self, asset_id: &str) -> bool {
        self.registry
            .get(asset_id)
            .is_some_and(|r| r.local_path.exists())
    }

    /// Local path of a cached asset.
    pub fn cached_path(&mut self, asset_id: &str) -> Option<PathBuf> {
        if self.is_cached(asset_id) {
            self.stats.cache_hits += 1;
            self.registry.get(asset_id).map(|r| r.local_path.clone())
        } else {
            None
        }
    }

    /// Registry record for an asset.
    pub fn record(&self, asset_id: &str) -> Option<&AssetRecord> {
        self.registry.get(asset_id)
    }

    /// Find a cached asset by content hash, dropping stale index entries.
    pub fn find_by_hash(&mut self, xxhash: &str) -> Option<String> {
        let asset_id = self.hash_to_asset.get(xxhash)?.clone();
        if self.is_cached(&asset_id) {
            Some(asset_id)
        } else {
            warn!(%asset_id, "hash index points at missing file, dropping entry");
            self.hash_to_asset.remove(xxhash);
            None
        }
    }

    /// Find a cached asset by its on-disk path, dropping stale entries.
    pub fn find_by_path(&mut self, path: &Path) -> Option<String> {
        let asset_id = self.path_to_asset.get(path)?.clone();
        if self.is_cached(&asset_id) {
            Some(asset_id)
        } else {
            self.path_to_asset.remove(path);
            None
        }
    }

    /// Registered asset ids in sorted order.
    pub fn asset_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.registry.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Counters plus current totals.
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Total bytes currently on disk for registered assets.
    pub fn total_size(&self) -> u64 {
        self.registry
            .values()
            .filter_map(|r| std::fs::metadata(&r.local_path).ok())
            .map(|m| m.len())
            .sum()
    }

    // -- ingestion ----------------------------------------------------------

    /// Register a file that is about to be (or was) uploaded.
    ///
    /// If the content already sits in the cache under another id, the
    /// existing record is duplicated under `asset_id` pointing at the same
    /// stored file; otherwise the source is copied into the cache tree and
    /// the copy is re-hashed, failing with [`AssetError::CopyMismatch`] on
    /// disagreement.
    pub fn register_uploaded_asset(
        &mut self,
        asset_id: &str,
        source_path: &Path,
        filename: &str,
    ) -> Result<AssetRecord, AssetError> {
        let source_hash = xxh64_hex_file(source_path)?;

        if let Some(existing_id) = self.find_by_hash(&source_hash) {
            let existing = self.registry[&existing_id].clone();
            info!(
                asset_id,
                existing = existing_id,
                xxhash = source_hash,
                "content already cached, deduplicating"
            );
            let record = AssetRecord {
                asset_id: asset_id.to_string(),
                source: AssetSource::Upload,
                cached_at: now_epoch(),
                ..existing
            };
            self.insert_record(record.clone())?;
            self.stats.dedup_hits += 1;
            self.stats.uploads_registered += 1;
            return Ok(record);
        }

        let cache_path = self.cache_path_for(asset_id, filename);
        if let Some(parent) = cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source_path, &cache_path)?;

        let cached_hash = xxh64_hex_file(&cache_path)?;
        if cached_hash != source_hash {
            let _ = std::fs::remove_file(&cache_path);
            return Err(AssetError::CopyMismatch {
                expected: source_hash,
                actual: cached_hash,
            });
        }
        let bytes = std::fs::read(&cache_path)?;
        let sha256 = format!("{:x}", Sha256::digest(&bytes));

        let record = AssetRecord {
            asset_id: asset_id.to_string(),
            filename: filename.to_string(),
            local_path: cache_path,
            file_size: bytes.len() as u64,
            xxhash: cached_hash,
            sha256: Some(sha256),
            cached_at: now_epoch(),
            source: AssetSource::Upload,
        };
        self.insert_record(record.clone())?;
        self.stats.uploads_registered += 1;
        info!(%asset_id, %filename, "uploaded asset registered");
        Ok(record)
    }

    /// Register a file that finished downloading at `path`.
    pub fn register_downloaded_asset(
        &mut self,
        asset_id: &str,
        path: &Path,
    ) -> Result<AssetRecord, AssetError> {
        if !path.exists() {
            return Err(AssetError::NotFound(asset_id.to_string()));
        }
        let xxhash = xxh64_hex_file(path)?;
        let file_size = std::fs::metadata(path)?.len();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| asset_id.to_string());

        let record = AssetRecord {
            asset_id: asset_id.to_string(),
            filename,
            local_path: path.to_path_buf(),
            file_size,
            xxhash,
            sha256: None,
            cached_at: now_epoch(),
            source: AssetSource::Download,
        };
        self.insert_record(record.clone())?;
        self.stats.downloads_registered += 1;
        info!(%asset_id, size = file_size, "downloaded asset registered");
        Ok(record)
    }

    fn insert_record(&mut self, record: AssetRecord) -> Result<(), AssetError> {
        self.hash_to_asset
            .insert(record.xxhash.clone(), record.asset_id.clone());
        self.path_to_asset
            .insert(record.local_path.clone(), record.asset_id.clone());
        self.registry.insert(record.asset_id.clone(), record);
        self.save_registry()
    }

    // -- verification and removal -------------------------------------------

    /// Recompute the cached file's hash against the stored integrity tag.
    pub fn verify(&mut self, asset_id: &str) -> Result<bool, AssetError> {
        let record = self
            .registry
            .get(asset_id)
            .ok_or_else(|| AssetError::NotFound(asset_id.to_string()))?;
        self.stats.verifications += 1;
        let current = xxh64_hex_file(&record.local_path)?;
        let valid = current == record.xxhash;
        if !valid {
            self.stats.verification_failures += 1;
            warn!(
                asset_id,
                stored = record.xxhash,
                current,
                "cached asset failed verification"
            );
        }
        Ok(valid)
    }

    /// Remove an asset: file (unless shared by a deduplicated entry),
    /// registry row, and both index entries.
    pub fn remove(&mut self, asset_id: &str) -> Result<(), AssetError> {
        let record = self
            .registry
            .remove(asset_id)
            .ok_or_else(|| AssetError::NotFound(asset_id.to_string()))?;

        let shared = self
            .registry
            .values()
            .any(|r| r.local_path == record.local_path);
        if !shared && record.local_path.exists() {
            std::fs::remove_file(&record.local_path)?;
        }
        // The indices may point at a surviving duplicate; only drop entries
        // that still reference the removed id.
        if self.hash_to_asset.get(&record.xxhash) == Some(&record.asset_id) {
            self.hash_to_asset.remove(&record.xxhash);
            if let Some(survivor) = self
                .registry
                .values()
                .find(|r| r.xxhash == record.xxhash)
            {
                self.hash_to_asset
                    .insert(record.xxhash.clone(), survivor.asset_id.clone());
            }
        }
        if self.path_to_asset.get(&record.local_path) == Some(&record.asset_id) {
            self.path_to_asset.remove(&record.local_path);
            if let Some(survivor) = self
                .registry
                .values()
                .find(|r| r.local_path == record.local_path)
            {
                self.path_to_asset
                    .insert(record.local_path.clone(), survivor.asset_id.clone());
            }
        }
        self.save_registry()?;
        debug!(%asset_id, "asset removed from cache");
        Ok(())
    }

    /// Age-then-size cleanup.
    ///
    /// First removes every entry older than `max_age_days`; if the total
    /// size still exceeds `max_size_mb`, evicts oldest-first until the
    /// budget holds.
    pub fn cleanup(&mut self, max_age_days: u64, max_size_mb: u64) -> Result<CleanupReport, AssetError> {
        let now = now_epoch();
        let max_age_secs = max_age_days as f64 * 24.0 * 3600.0;
        let max_size_bytes = max_size_mb * 1024 * 1024;
        let mut report = CleanupReport::default();

        let expired: Vec<String> = self
            .registry
            .values()
            .filter(|r| now - r.cached_at > max_age_secs)
            .map(|r| r.asset_id.clone())
            .collect();
        for asset_id in expired {
            report.freed_bytes += self
                .registry
                .get(&asset_id)
                .map(|r| r.file_size)
                .unwrap_or(0);
            self.remove(&asset_id)?;
            report.removed += 1;
        }

        let mut total = self.total_size();
        if total > max_size_bytes {
            let mut by_age: Vec<(String, f64, u64)> = self
                .registry
                .values()
                .map(|r| (r.asset_id.clone(), r.cached_at, r.file_size))
                .collect();
            by_age.sort_by(|a, b| a.1.total_cmp(&b.1));
            for (asset_id, _, size) in by_age {
                if total <= max_size_bytes {
                    break;
                }
                self.remove(&asset_id)?;
                report.removed += 1;
                report.freed_bytes += size;
                total = total.saturating_sub(size);
            }
        }

        if report.removed > 0 {
            info!(
                removed = report.removed,
                freed_mb = report.freed_bytes / 1024 / 1024,
                "cache cleanup finished"
            );
        }
        Ok(report)
    }
}

impl std::fmt::Debug for AssetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetCache")
            .field("cache_dir", &self.cache_dir)
            .field("assets", &self.registry.len())
            .finish()
    }
}
