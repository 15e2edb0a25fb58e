// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persisted table projection and the wire snapshot format.
//!
//! The persisted schema groups entities by layer with stringified entity
//! ids as keys:
//!
//! ```json
//! {
//!   "name": "demo", "width": 20, "height": 20,
//!   "layers": { "tokens": { "1": { ... } } },
//!   "fog_rectangles": { "hide": [], "reveal": [] },
//!   "metadata": { "version": "1.0", "entity_count": 1,
//!                 "next_entity_id": 2, "created_timestamp": 1700000000.0 }
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::{Entity, FogRectangles, Layer, Table, TableError};

/// Schema version stamped into table save metadata.
pub const SAVE_VERSION: &str = "1.0";

/// Bookkeeping block of a table save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveMetadata {
    /// Save schema version.
    pub version: String,
    /// Entity count at save time.
    pub entity_count: usize,
    /// Arena counter to restore.
    pub next_entity_id: u32,
    /// Seconds since epoch at save time.
    pub created_timestamp: f64,
}

/// Round-trippable JSON projection of a [`Table`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSave {
    /// Table identity; regenerated when absent in legacy saves.
    #[serde(default)]
    pub table_id: Option<Uuid>,
    /// Display name.
    pub name: String,
    /// Width in cells.
    pub width: u32,
    /// Height in cells.
    pub height: u32,
    /// Entities grouped by layer, keyed by stringified entity id.
    pub layers: BTreeMap<Layer, BTreeMap<String, Entity>>,
    /// Fog-of-war state.
    #[serde(default)]
    pub fog_rectangles: FogRectangles,
    /// Save bookkeeping.
    pub metadata: SaveMetadata,
}

/// Wire snapshot sent in `new_table_response` / `table_response` payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSnapshot {
    /// Table identity.
    pub table_id: Uuid,
    /// Display name.
    pub name: String,
    /// Width in cells.
    pub width: u32,
    /// Height in cells.
    pub height: u32,
    /// Entities grouped by layer, keyed by stringified entity id.
    pub layers: BTreeMap<Layer, BTreeMap<String, Entity>>,
    /// Fog-of-war state.
    pub fog_rectangles: FogRectangles,
}

fn layered_entities(table: &Table) -> BTreeMap<Layer, BTreeMap<String, Entity>> {
    let mut layers: BTreeMap<Layer, BTreeMap<String, Entity>> =
        Layer::ALL.iter().map(|l| (*l, BTreeMap::new())).collect();
    for entity in table.entities() {
        layers
            .entry(entity.layer)
            .or_default()
            .insert(entity.entity_id.to_string(), entity.clone());
    }
    layers
}

impl Table {
    /// Project the table into its persisted form.
    pub fn to_save(&self) -> TableSave {
        TableSave {
            table_id: Some(self.table_id),
            name: self.name.clone(),
            width: self.width,
            height: self.height,
            layers: layered_entities(self),
            fog_rectangles: self.fog_rectangles.clone(),
            metadata: SaveMetadata {
                version: SAVE_VERSION.to_string(),
                entity_count: self.entity_count(),
                next_entity_id: self.next_entity_id(),
                created_timestamp: std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs_f64(),
            },
        }
    }

    /// Project the table into the wire snapshot embedded in responses.
    pub fn to_snapshot(&self) -> TableSnapshot {
        TableSnapshot {
            table_id: self.table_id,
            name: self.name.clone(),
            width: self.width,
            height: self.height,
            layers: layered_entities(self),
            fog_rectangles: self.fog_rectangles.clone(),
        }
    }

    /// Rebuild a table from its persisted form.
    ///
    /// Entities with out-of-bounds positions are dropped with a warning;
    /// the arena counter resumes at `max(entity_id) + 1` so reloaded tables
    /// keep allocating dense ids.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::InvalidTable`] when the stored name or
    /// dimensions are unusable.
    pub fn from_save(save: TableSave) -> Result<Self, TableError> {
        let table_id = save.table_id.unwrap_or_else(Uuid::new_v4);
        let mut table = Table::with_id(table_id, save.name, save.width, save.height)?;
        table.fog_rectangles = save.fog_rectangles;

        for (layer, entities) in save.layers {
            for (key, mut entity) in entities {
                if let Ok(parsed) = key.parse::<u32>()
                    && parsed != entity.entity_id
                {
                    warn!(key = %key, entity_id = entity.entity_id, "save key disagrees with entity id, trusting entity");
                }
                entity.layer = layer;
                if !table.is_valid_position(entity.position) {
                    warn!(
                        table = %table.name,
                        entity_id = entity.entity_id,
                        position = %entity.position,
                        "dropping entity with out-of-bounds position"
                    );
                    continue;
                }
                table.insert_loaded_entity(entity);
            }
        }
        // Trust the stored counter when it is ahead of what we derived;
        // ids of dropped entities must not be reused.
        if save.metadata.next_entity_id > table.next_entity_id() {
            table.bump_next_entity_id(save.metadata.next_entity_id);
        }
        Ok(table)
    }
}
