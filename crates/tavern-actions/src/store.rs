// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persistence seams: the save/load contract the action layer calls.
//!
//! The relational layer behind these traits is an external collaborator;
//! the broker ships a JSON-file implementation for standalone servers and
//! an in-memory one for tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tavern_table::TableSave;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::Character;

/// Failures crossing the persistence seam.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Stored JSON could not be decoded.
    #[error("corrupt stored record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Save/load contract for tables.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Persist one table projection.
    async fn save_table(&self, session: &str, save: &TableSave) -> Result<(), StoreError>;
    /// Load every stored table of a session.
    async fn load_tables(&self, session: &str) -> Result<Vec<TableSave>, StoreError>;
    /// Delete a stored table.
    async fn delete_table(&self, session: &str, table_id: &Uuid) -> Result<(), StoreError>;
}

/// Save/load contract for characters.
#[async_trait]
pub trait CharacterStore: Send + Sync {
    /// Persist one character.
    async fn save_character(&self, session: &str, character: &Character) -> Result<(), StoreError>;
    /// Load every stored character of a session.
    async fn load_characters(&self, session: &str) -> Result<Vec<Character>, StoreError>;
    /// Delete a stored character.
    async fn delete_character(&self, session: &str, character_id: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// JSON file store
// ---------------------------------------------------------------------------

/// File-per-record JSON store under `<root>/<session>/`.
///
/// Writes go to a `.tmp` sibling first and are renamed into place, so a
/// crash mid-write never leaves a truncated record behind.
#[derive(Debug, Clone)]
pub struct JsonStore {
    root: PathBuf,
}

impl JsonStore {
    /// Store rooted at `root`; directories are created lazily on write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn table_path(&self, session: &str, table_id: &Uuid) -> PathBuf {
        self.root
            .join(session)
            .join("tables")
            .join(format!("{table_id}.json"))
    }

    fn character_path(&self, session: &str, character_id: &str) -> PathBuf {
        self.root
            .join(session)
            .join("characters")
            .join(format!("{character_id}.json"))
    }

    async fn write_atomic(path: &PathBuf, bytes: Vec<u8>) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_dir_json<T: serde::de::DeserializeOwned>(
        dir: PathBuf,
    ) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<T>(&bytes) {
                Ok(record) => out.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping corrupt record");
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl TableStore for JsonStore {
    async fn save_table(&self, session: &str, save: &TableSave) -> Result<(), StoreError> {
        let table_id = save.table_id.unwrap_or_default();
        let path = self.table_path(session, &table_id);
        let bytes = serde_json::to_vec_pretty(save)?;
        Self::write_atomic(&path, bytes).await?;
        debug!(session, table = %save.name, path = %path.display(), "table saved");
        Ok(())
    }

    async fn load_tables(&self, session: &str) -> Result<Vec<TableSave>, StoreError> {
        Self::read_dir_json(self.root.join(session).join("tables")).await
    }

    async fn delete_table(&self, session: &str, table_id: &Uuid) -> Result<(), StoreError> {
        match fs::remove_file(self.table_path(session, table_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CharacterStore for JsonStore {
    async fn save_character(&self, session: &str, character: &Character) -> Result<(), StoreError> {
        let path = self.character_path(session, &character.character_id);
        let bytes = serde_json::to_vec_pretty(character)?;
        Self::write_atomic(&path, bytes).await
    }

    async fn load_characters(&self, session: &str) -> Result<Vec<Character>, StoreError> {
        Self::read_dir_json(self.root.join(session).join("characters")).await
    }

    async fn delete_character(&self, session: &str, character_id: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.character_path(session, character_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Volatile store for tests and persistence-less servers.
///
/// Counts writes so tests can assert on save batching.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<(String, Uuid), TableSave>>,
    characters: Mutex<HashMap<(String, String), Character>>,
    table_saves: Mutex<u64>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total `save_table` calls observed.
    pub fn table_save_count(&self) -> u64 {
        *self.table_saves.lock().expect("poisoned")
    }

    /// Number of stored tables across sessions.
    pub fn stored_table_count(&self) -> usize {
        self.tables.lock().expect("poisoned").len()
    }
}

#[async_trait]
impl TableStore for MemoryStore {
    async fn save_table(&self, session: &str, save: &TableSave) -> Result<(), StoreError> {
        let table_id = save.table_id.unwrap_or_default();
        self.tables
            .lock()
            .expect("poisoned")
            .insert((session.to_string(), table_id), save.clone());
        *self.table_saves.lock().expect("poisoned") += 1;
        Ok(())
    }

    async fn load_tables(&self, session: &str) -> Result<Vec<TableSave>, StoreError> {
        Ok(self
            .tables
            .lock()
            .expect("poisoned")
            .iter()
            .filter(|((s, _), _)| s == session)
            .map(|(_, save)| save.clone())
            .collect())
    }

    async fn delete_table(&self, session: &str, table_id: &Uuid) -> Result<(), StoreError> {
        self.tables
            .lock()
            .expect("poisoned")
            .remove(&(session.to_string(), *table_id));
        Ok(())
    }
}

#[async_trait]
impl CharacterStore for MemoryStore {
    async fn save_character(&self, session: &str, character: &Character) -> Result<(), StoreError> {
        self.characters.lock().expect("poisoned").insert(
            (session.to_string(), character.character_id.clone()),
            character.clone(),
        );
        Ok(())
    }

    async fn load_characters(&self, session: &str) -> Result<Vec<Character>, StoreError> {
        Ok(self
            .characters
            .lock()
            .expect("poisoned")
            .iter()
            .filter(|((s, _), _)| s == session)
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn delete_character(&self, session: &str, character_id: &str) -> Result<(), StoreError> {
        self.characters
            .lock()
            .expect("poisoned")
            .remove(&(session.to_string(), character_id.to_string()));
        Ok(())
    }
}
