// SPDX-License-Identifier: MIT OR Apache-2.0
//! The per-session action facade: every validated mutation flows through
//! here, on the session's own task.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tavern_error::ErrorCode;
use tavern_table::{
    EntityDescriptor, FogKind, FogRect, Position, Table, TableSnapshot,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    ActionResult, Character, CharacterRegistry, CharacterStore, CharacterUpdateError,
    SaveScheduler, TableRegistry, TableStore, TokenStats,
};

/// Authoritative state and persistence plumbing for one session.
///
/// All methods take `&mut self`; the owning session task serialises access,
/// so no internal locking is needed. Persistence is the only suspension
/// point: mutations mark tables dirty on the [`SaveScheduler`] and the
/// session loop drains due saves, while critical operations (table
/// create/delete, character save/delete/update) flush immediately.
pub struct SessionActions {
    session: String,
    tables: TableRegistry,
    characters: CharacterRegistry,
    table_store: Arc<dyn TableStore>,
    character_store: Arc<dyn CharacterStore>,
    saves: SaveScheduler,
}

impl SessionActions {
    /// Facade for `session` over the given persistence seams.
    pub fn new(
        session: impl Into<String>,
        table_store: Arc<dyn TableStore>,
        character_store: Arc<dyn CharacterStore>,
        save_debounce: Duration,
    ) -> Self {
        Self {
            session: session.into(),
            tables: TableRegistry::new(),
            characters: CharacterRegistry::new(),
            table_store,
            character_store,
            saves: SaveScheduler::new(save_debounce),
        }
    }

    /// Session code this facade serves.
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Hydrate tables and characters from the stores.
    pub async fn load(&mut self) -> usize {
        let mut loaded = 0;
        match self.table_store.load_tables(&self.session).await {
            Ok(saves) => {
                for save in saves {
                    match Table::from_save(save) {
                        Ok(table) => {
                            self.tables.insert(table);
                            loaded += 1;
                        }
                        Err(e) => warn!(session = %self.session, error = %e, "skipping unloadable table"),
                    }
                }
            }
            Err(e) => warn!(session = %self.session, error = %e, "table hydration failed"),
        }
        match self.character_store.load_characters(&self.session).await {
            Ok(characters) => {
                for character in characters {
                    self.characters.upsert(character);
                }
            }
            Err(e) => warn!(session = %self.session, error = %e, "character hydration failed"),
        }
        info!(session = %self.session, tables = self.tables.len(), characters = self.characters.len(), "session state hydrated");
        loaded
    }

    // -- table lifecycle ----------------------------------------------------

    /// Create a table and persist it immediately.
    pub async fn create_table(&mut self, name: &str, width: u32, height: u32) -> ActionResult {
        let table = match Table::new(name, width, height) {
            Ok(table) => table,
            Err(e) => return e.into(),
        };
        let snapshot = table.to_snapshot();
        let save = table.to_save();
        self.tables.insert(table);
        if let Err(e) = self.table_store.save_table(&self.session, &save).await {
            warn!(session = %self.session, error = %e, "table create save failed");
        }
        info!(session = %self.session, table = %name, width, height, "table created");
        ActionResult::ok(format!("table '{name}' created")).with_field(
            "table_data",
            serde_json::to_value(&snapshot).unwrap_or(Value::Null),
        )
    }

    /// Delete a table and remove its stored record immediately.
    pub async fn delete_table(&mut self, table_id: &Uuid) -> ActionResult {
        let Some(table) = self.tables.remove(table_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("table {table_id} not found"));
        };
        self.saves.cancel(table_id);
        if let Err(e) = self.table_store.delete_table(&self.session, table_id).await {
            warn!(session = %self.session, error = %e, "table delete failed in store");
        }
        info!(session = %self.session, table = %table.name, "table deleted");
        ActionResult::ok(format!("table '{}' deleted", table.name))
            .with_field("table_id", table_id.to_string())
    }

    /// Resolve a wire reference (UUID string or display name) to a table id.
    pub fn resolve_table_id(&self, reference: &str) -> Option<Uuid> {
        if let Ok(id) = Uuid::parse_str(reference) {
            if self.tables.get(&id).is_some() {
                return Some(id);
            }
        }
        self.tables.id_for_name(reference)
    }

    /// Wire snapshot of one table.
    pub fn table_snapshot(&self, table_id: &Uuid) -> Option<TableSnapshot> {
        self.tables.get(table_id).map(Table::to_snapshot)
    }

    /// Sorted table names.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.names()
    }

    /// Read access for protocol handlers.
    pub fn tables(&self) -> &TableRegistry {
        &self.tables
    }

    /// Read access to the character registry.
    pub fn characters(&self) -> &CharacterRegistry {
        &self.characters
    }

    // -- sprite mutations ---------------------------------------------------

    fn permission_denied(&self, table_id: &Uuid, sprite_id: &Uuid, user_id: &str) -> Option<ActionResult> {
        let table = self.tables.get(table_id)?;
        let entity = table.find_entity_by_sprite(sprite_id)?;
        if !entity.is_controlled_by(user_id) {
            return Some(ActionResult::err(
                ErrorCode::Unauthorized,
                format!("user '{user_id}' does not control sprite {sprite_id}"),
            ));
        }
        if let Some(character_id) = &entity.character_id
            && let Some(character) = self.characters.get(character_id)
            && !character.is_owned_by(user_id)
        {
            return Some(ActionResult::err(
                ErrorCode::Unauthorized,
                format!("user '{user_id}' does not own character '{character_id}'"),
            ));
        }
        None
    }

    /// Create a sprite (entity) on a table.
    pub fn create_sprite(&mut self, table_id: &Uuid, descriptor: EntityDescriptor) -> ActionResult {
        let Some(table) = self.tables.get_mut(table_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("table {table_id} not found"));
        };
        match table.add_entity(descriptor) {
            Ok(entity) => {
                let payload = serde_json::to_value(entity).unwrap_or(Value::Null);
                let sprite_id = entity.sprite_id.to_string();
                self.saves.mark_dirty(*table_id);
                ActionResult::ok("sprite created")
                    .with_field("sprite_id", sprite_id)
                    .with_field("sprite", payload)
            }
            Err(e) => e.into(),
        }
    }

    /// Move a sprite with permission and occupancy checks.
    ///
    /// On any rejection the result carries the authoritative `position`
    /// so the caller can reconcile the mover.
    pub fn move_sprite(
        &mut self,
        table_id: &Uuid,
        sprite_id: &Uuid,
        to: Position,
        user_id: &str,
    ) -> ActionResult {
        if let Some(denied) = self.permission_denied(table_id, sprite_id, user_id) {
            return self.attach_authoritative_position(table_id, sprite_id, denied);
        }
        let Some(table) = self.tables.get_mut(table_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("table {table_id} not found"));
        };
        let Some(entity_id) = table.entity_id_for_sprite(sprite_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("sprite {sprite_id} not found"));
        };
        match table.move_entity(entity_id, to, None) {
            Ok(()) => {
                self.saves.mark_dirty(*table_id);
                debug!(session = %self.session, %sprite_id, to = %to, "sprite moved");
                ActionResult::ok("sprite moved")
            }
            Err(e) => {
                let failed: ActionResult = e.into();
                self.attach_authoritative_position(table_id, sprite_id, failed)
            }
        }
    }

    fn attach_authoritative_position(
        &self,
        table_id: &Uuid,
        sprite_id: &Uuid,
        result: ActionResult,
    ) -> ActionResult {
        let position = self
            .tables
            .get(table_id)
            .and_then(|t| t.find_entity_by_sprite(sprite_id))
            .map(|e| e.position);
        match position {
            Some(p) => result.with_field(
                "position",
                serde_json::to_value(p).unwrap_or(Value::Null),
            ),
            None => result,
        }
    }

    /// Scale a sprite.
    pub fn scale_sprite(
        &mut self,
        table_id: &Uuid,
        sprite_id: &Uuid,
        scale_x: f32,
        scale_y: f32,
        user_id: &str,
    ) -> ActionResult {
        if let Some(denied) = self.permission_denied(table_id, sprite_id, user_id) {
            return denied;
        }
        let Some(table) = self.tables.get_mut(table_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("table {table_id} not found"));
        };
        let Some(entity_id) = table.entity_id_for_sprite(sprite_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("sprite {sprite_id} not found"));
        };
        match table.scale_entity(entity_id, scale_x, scale_y) {
            Ok(()) => {
                self.saves.mark_dirty(*table_id);
                ActionResult::ok("sprite scaled")
            }
            Err(e) => e.into(),
        }
    }

    /// Rotate a sprite.
    pub fn rotate_sprite(
        &mut self,
        table_id: &Uuid,
        sprite_id: &Uuid,
        rotation: f32,
        user_id: &str,
    ) -> ActionResult {
        if let Some(denied) = self.permission_denied(table_id, sprite_id, user_id) {
            return denied;
        }
        let Some(table) = self.tables.get_mut(table_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("table {table_id} not found"));
        };
        let Some(entity_id) = table.entity_id_for_sprite(sprite_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("sprite {sprite_id} not found"));
        };
        match table.rotate_entity(entity_id, rotation) {
            Ok(()) => {
                self.saves.mark_dirty(*table_id);
                ActionResult::ok("sprite rotated")
            }
            Err(e) => e.into(),
        }
    }

    /// Remove a sprite.
    pub fn delete_sprite(&mut self, table_id: &Uuid, sprite_id: &Uuid, user_id: &str) -> ActionResult {
        if let Some(denied) = self.permission_denied(table_id, sprite_id, user_id) {
            return denied;
        }
        let Some(table) = self.tables.get_mut(table_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("table {table_id} not found"));
        };
        let Some(entity_id) = table.entity_id_for_sprite(sprite_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("sprite {sprite_id} not found"));
        };
        match table.remove_entity(entity_id) {
            Ok(_) => {
                self.saves.mark_dirty(*table_id);
                ActionResult::ok("sprite removed")
            }
            Err(e) => e.into(),
        }
    }

    /// Apply a view update (`table_scale` / `table_move`).
    pub fn update_table_view(&mut self, table_id: &Uuid, updates: &Map<String, Value>) -> ActionResult {
        let Some(table) = self.tables.get_mut(table_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("table {table_id} not found"));
        };
        if let Some(scale) = updates.get("scale").and_then(Value::as_object) {
            let sx = scale.get("x").and_then(Value::as_f64).unwrap_or(1.0) as f32;
            let sy = scale.get("y").and_then(Value::as_f64).unwrap_or(1.0) as f32;
            table.set_view_scale(sx, sy);
        }
        if let Some(position) = updates.get("position").and_then(Value::as_object) {
            let x = position.get("x").and_then(Value::as_f64).unwrap_or(0.0) as f32;
            let y = position.get("y").and_then(Value::as_f64).unwrap_or(0.0) as f32;
            table.set_view_position(x, y);
        }
        self.saves.mark_dirty(*table_id);
        ActionResult::ok("table view updated")
    }

    /// Append a fog rectangle.
    pub fn push_fog(&mut self, table_id: &Uuid, kind: FogKind, rect: FogRect) -> ActionResult {
        let Some(table) = self.tables.get_mut(table_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("table {table_id} not found"));
        };
        table.push_fog(kind, rect);
        self.saves.mark_dirty(*table_id);
        ActionResult::ok("fog updated")
    }

    // -- characters ----------------------------------------------------------

    /// Save (create or replace) a character; flushes immediately.
    pub async fn save_character(&mut self, character: Character) -> ActionResult {
        let character_id = character.character_id.clone();
        if let Err(e) = self
            .character_store
            .save_character(&self.session, &character)
            .await
        {
            warn!(session = %self.session, error = %e, "character save failed");
            return ActionResult::err(ErrorCode::IoError, "character save failed");
        }
        self.characters.upsert(character);
        ActionResult::ok("character saved").with_field("character_id", character_id)
    }

    /// Load one character from the registry.
    pub fn load_character(&self, character_id: &str) -> ActionResult {
        match self.characters.get(character_id) {
            Some(character) => ActionResult::ok("character loaded").with_field(
                "character",
                serde_json::to_value(character).unwrap_or(Value::Null),
            ),
            None => ActionResult::err(
                ErrorCode::NotFound,
                format!("character '{character_id}' not found"),
            ),
        }
    }

    /// Sorted character ids.
    pub fn list_characters(&self) -> ActionResult {
        let mut ids: Vec<&str> = self.characters.ids().collect();
        ids.sort_unstable();
        ActionResult::ok("characters listed")
            .with_field("characters", serde_json::to_value(ids).unwrap_or(Value::Null))
    }

    /// Delete a character; flushes immediately.
    pub async fn delete_character(&mut self, character_id: &str, user_id: &str) -> ActionResult {
        match self.characters.get(character_id) {
            None => {
                return ActionResult::err(
                    ErrorCode::NotFound,
                    format!("character '{character_id}' not found"),
                );
            }
            Some(character) if !character.is_owned_by(user_id) => {
                return ActionResult::err(
                    ErrorCode::Unauthorized,
                    format!("user '{user_id}' does not own character '{character_id}'"),
                );
            }
            Some(_) => {}
        }
        self.characters.remove(character_id);
        if let Err(e) = self
            .character_store
            .delete_character(&self.session, character_id)
            .await
        {
            warn!(session = %self.session, error = %e, "character delete failed in store");
        }
        ActionResult::ok("character deleted").with_field("character_id", character_id)
    }

    /// Versioned delta update with character-to-token stat sync.
    ///
    /// On success the new version is returned under `data.version`, the
    /// update is persisted immediately, and any `hp`/`max_hp`/`ac` values
    /// are mirrored onto every entity bound to the character across the
    /// session's tables.
    pub async fn update_character(
        &mut self,
        character_id: &str,
        updates: &Map<String, Value>,
        user_id: &str,
        expected_version: Option<u64>,
    ) -> ActionResult {
        let updated = match self
            .characters
            .apply_update(character_id, updates, user_id, expected_version)
        {
            Ok(character) => character.clone(),
            Err(CharacterUpdateError::NotFound(id)) => {
                return ActionResult::err(ErrorCode::NotFound, format!("character '{id}' not found"));
            }
            Err(e @ CharacterUpdateError::NotOwner { .. }) => {
                return ActionResult::err(ErrorCode::Unauthorized, e.to_string());
            }
            Err(e @ CharacterUpdateError::VersionConflict { .. }) => {
                return ActionResult::err(ErrorCode::VersionConflict, e.to_string());
            }
        };

        let stats = TokenStats::from_updates(updates);
        if !stats.is_empty() {
            let synced = self.sync_character_stats_to_tokens(character_id, stats);
            debug!(session = %self.session, character = %character_id, synced, "token stats synced");
        }

        if let Err(e) = self
            .character_store
            .save_character(&self.session, &updated)
            .await
        {
            warn!(session = %self.session, error = %e, "character update save failed");
        }

        ActionResult::ok("character updated").with_field("version", updated.version)
    }

    /// Mirror token stats onto every bound entity; returns how many
    /// entities changed and marks their tables dirty.
    fn sync_character_stats_to_tokens(&mut self, character_id: &str, stats: TokenStats) -> usize {
        let mut synced = 0;
        let mut dirty = Vec::new();
        for table in self.tables.iter_mut() {
            let mut touched = false;
            for entity in table.entities_with_character_mut(character_id) {
                if let Some(hp) = stats.hp {
                    entity.hp = Some(hp);
                }
                if let Some(max_hp) = stats.max_hp {
                    entity.max_hp = Some(max_hp);
                }
                if let Some(ac) = stats.ac {
                    entity.ac = Some(ac);
                }
                synced += 1;
                touched = true;
            }
            if touched {
                dirty.push(table.table_id);
            }
        }
        for table_id in dirty {
            self.saves.mark_dirty(table_id);
        }
        synced
    }

    // -- persistence --------------------------------------------------------

    /// Save every table whose debounce deadline has passed.
    pub async fn process_due_saves(&mut self) -> usize {
        let due = self.saves.take_due();
        self.save_tables(due).await
    }

    /// Drain every pending save regardless of deadline (shutdown path).
    pub async fn flush_all_pending_saves(&mut self) -> usize {
        let pending = self.saves.take_all();
        self.save_tables(pending).await
    }

    async fn save_tables(&mut self, ids: Vec<Uuid>) -> usize {
        let mut saved = 0;
        for table_id in ids {
            let Some(save) = self.tables.get(&table_id).map(Table::to_save) else {
                continue;
            };
            match self.table_store.save_table(&self.session, &save).await {
                Ok(()) => saved += 1,
                Err(e) => warn!(session = %self.session, %table_id, error = %e, "batched save failed"),
            }
        }
        saved
    }

    /// Earliest pending save deadline, for the session loop's timer.
    pub fn next_save_deadline(&self) -> Option<tokio::time::Instant> {
        self.saves.next_deadline()
    }

    /// Whether any save is pending.
    pub fn has_pending_saves(&self) -> bool {
        !self.saves.is_idle()
    }
}
