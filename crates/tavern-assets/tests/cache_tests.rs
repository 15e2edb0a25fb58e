// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cache behavior: ingestion, dedup, verification, cleanup, persistence.

use std::fs;
use std::path::PathBuf;

use tavern_assets::{AssetCache, AssetSource, asset_id_for, xxh64_hex};

struct Fixture {
    _dir: tempfile::TempDir,
    cache_root: PathBuf,
    staging: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cache_root = dir.path().join("cache");
        let staging = dir.path().join("staging");
        fs::create_dir_all(&staging).unwrap();
        Self {
            _dir: dir,
            cache_root,
            staging,
        }
    }

    fn cache(&self) -> AssetCache {
        AssetCache::open(&self.cache_root).unwrap()
    }

    fn stage(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.staging.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }
}

#[test]
fn upload_ingest_copies_into_sharded_layout() {
    let fx = Fixture::new();
    let mut cache = fx.cache();
    let bytes = b"a goblin portrait";
    let asset_id = asset_id_for(bytes);
    let source = fx.stage("goblin.png", bytes);

    let record = cache
        .register_uploaded_asset(&asset_id, &source, "goblin.png")
        .unwrap();

    assert_eq!(record.asset_id, asset_id);
    assert_eq!(record.xxhash, xxh64_hex(bytes));
    assert_eq!(record.source, AssetSource::Upload);
    assert!(record.sha256.is_some());
    let expected_path = fx
        .cache_root
        .join(&asset_id[..2])
        .join(format!("{asset_id}_goblin.png"));
    assert_eq!(record.local_path, expected_path);
    assert!(cache.is_cached(&asset_id));
    assert!(cache.verify(&asset_id).unwrap());
}

#[test]
fn identical_bytes_deduplicate_to_one_stored_file() {
    let fx = Fixture::new();
    let mut cache = fx.cache();
    let bytes = b"shared texture bytes";
    let first_id = asset_id_for(bytes);

    let first = cache
        .register_uploaded_asset(&first_id, &fx.stage("f1.png", bytes), "f1.png")
        .unwrap();
    // A second upload of the same content under a different intended id
    // must not duplicate the stored file.
    let second = cache
        .register_uploaded_asset("aaaabbbbccccdddd", &fx.stage("f2.png", bytes), "f2.png")
        .unwrap();

    assert_eq!(second.local_path, first.local_path);
    assert_eq!(second.xxhash, first.xxhash);
    assert_eq!(cache.stats().dedup_hits, 1);

    // Exactly one file on disk under the shard dirs.
    let stored: Vec<_> = walk_files(&fx.cache_root)
        .into_iter()
        .filter(|p| p.file_name().unwrap() != "asset_registry.json")
        .collect();
    assert_eq!(stored.len(), 1);

    // Removing one registry row keeps the shared bytes for the other.
    cache.remove("aaaabbbbccccdddd").unwrap();
    assert!(cache.is_cached(&first_id));
    assert_eq!(cache.find_by_hash(&xxh64_hex(bytes)), Some(first_id));
}

#[test]
fn downloaded_assets_register_in_place() {
    let fx = Fixture::new();
    let mut cache = fx.cache();
    let bytes = b"downloaded map";
    let path = fx.stage("map.jpg", bytes);
    let asset_id = asset_id_for(bytes);

    let record = cache.register_downloaded_asset(&asset_id, &path).unwrap();
    assert_eq!(record.source, AssetSource::Download);
    assert_eq!(record.local_path, path);
    assert_eq!(record.file_size, bytes.len() as u64);
    assert!(cache.verify(&asset_id).unwrap());
}

#[test]
fn verification_detects_tampering() {
    let fx = Fixture::new();
    let mut cache = fx.cache();
    let bytes = b"pristine";
    let asset_id = asset_id_for(bytes);
    cache
        .register_uploaded_asset(&asset_id, &fx.stage("a.bin", bytes), "a.bin")
        .unwrap();

    let stored = cache.record(&asset_id).unwrap().local_path.clone();
    fs::write(&stored, b"tampered").unwrap();

    assert!(!cache.verify(&asset_id).unwrap());
    assert_eq!(cache.stats().verification_failures, 1);
}

#[test]
fn registry_survives_reopen() {
    let fx = Fixture::new();
    let bytes = b"durable";
    let asset_id = asset_id_for(bytes);
    {
        let mut cache = fx.cache();
        cache
            .register_uploaded_asset(&asset_id, &fx.stage("d.bin", bytes), "d.bin")
            .unwrap();
    }
    let mut reopened = fx.cache();
    assert!(reopened.is_cached(&asset_id));
    // Secondary indices are rebuilt at startup.
    assert_eq!(
        reopened.find_by_hash(&xxh64_hex(bytes)),
        Some(asset_id.clone())
    );
    let path = reopened.record(&asset_id).unwrap().local_path.clone();
    assert_eq!(reopened.find_by_path(&path), Some(asset_id));
}

#[test]
fn cleanup_enforces_age_then_size() {
    let fx = Fixture::new();
    let mut cache = fx.cache();

    // Three 1 MiB assets.
    let payloads: Vec<Vec<u8>> = (0u8..3).map(|i| vec![i; 1024 * 1024]).collect();
    let ids: Vec<String> = payloads.iter().map(|p| asset_id_for(p)).collect();
    for (i, payload) in payloads.iter().enumerate() {
        let name = format!("blob{i}.bin");
        cache
            .register_uploaded_asset(&ids[i], &fx.stage(&name, payload), &name)
            .unwrap();
    }

    // Budget of 2 MiB with no age limit triggers oldest-first eviction of
    // exactly one asset.
    let report = cache.cleanup(3650, 2).unwrap();
    assert_eq!(report.removed, 1);
    let remaining: usize = ids.iter().filter(|id| cache.is_cached(id)).count();
    assert_eq!(remaining, 2);
    assert!(cache.total_size() <= 2 * 1024 * 1024);

    // An age limit of zero days clears everything that remains.
    let report = cache.cleanup(0, 1024).unwrap();
    assert_eq!(report.removed, 2);
    assert_eq!(cache.total_size(), 0);
    for id in &ids {
        assert!(!cache.is_cached(id));
        assert!(cache.record(id).is_none());
    }
}

#[test]
fn registry_file_is_valid_json_after_ingest() {
    let fx = Fixture::new();
    let mut cache = fx.cache();
    let bytes = b"stable content";
    let asset_id = asset_id_for(bytes);
    cache
        .register_uploaded_asset(&asset_id, &fx.stage("s.bin", bytes), "s.bin")
        .unwrap();

    let registry = fx.cache_root.join("asset_registry.json");
    let parsed: serde_json::Value =
        serde_json::from_slice(&fs::read(&registry).unwrap()).unwrap();
    assert!(parsed.as_object().unwrap().contains_key(&asset_id));
}

fn walk_files(root: &PathBuf) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.clone()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out
}
