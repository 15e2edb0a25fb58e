// SPDX-License-Identifier: MIT OR Apache-2.0
//! Local mutations over the client's table projection.
//!
//! Every operation takes a `to_server` flag: user-initiated calls pass
//! `true` and emit the matching request after the optimistic local apply;
//! inbound reconciliation passes `false` and never re-emits, which is what
//! keeps server echoes from looping back out.

use serde_json::json;
use tavern_actions::{ActionResult, TableRegistry};
use tavern_error::ErrorCode;
use tavern_protocol::MessageType;
use tavern_table::{
    Entity, EntityDescriptor, Position, SAVE_VERSION, SaveMetadata, Table, TableError,
    TableSnapshot,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::session::ClientSession;

/// Rebuild a [`Table`] from the wire snapshot embedded in responses.
pub fn table_from_snapshot(snapshot: TableSnapshot) -> Result<Table, TableError> {
    Table::from_save(tavern_table::TableSave {
        table_id: Some(snapshot.table_id),
        name: snapshot.name,
        width: snapshot.width,
        height: snapshot.height,
        layers: snapshot.layers,
        fog_rectangles: snapshot.fog_rectangles,
        metadata: SaveMetadata {
            version: SAVE_VERSION.to_string(),
            entity_count: 0,
            next_entity_id: 0,
            created_timestamp: 0.0,
        },
    })
}

/// The client's materialized projection of session state.
pub struct ClientActions {
    tables: TableRegistry,
}

impl Default for ClientActions {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientActions {
    /// Empty projection.
    pub fn new() -> Self {
        Self {
            tables: TableRegistry::new(),
        }
    }

    /// Read access to the local tables.
    pub fn tables(&self) -> &TableRegistry {
        &self.tables
    }

    /// Replace or insert a table received from the server.
    pub fn upsert_table(&mut self, table: Table) {
        debug!(table = %table.name, entities = table.entity_count(), "table reconciled");
        self.tables.insert(table);
    }

    /// Drop a table the server deleted.
    pub fn remove_table(&mut self, table_id: &Uuid) {
        self.tables.remove(table_id);
    }

    /// Create a sprite locally; with `to_server` also request it remotely.
    ///
    /// The sprite id is allocated client-side so the server's mirror and
    /// later broadcasts refer to the same identity.
    pub fn create_sprite(
        &mut self,
        session: &ClientSession,
        table_id: &Uuid,
        mut descriptor: EntityDescriptor,
        to_server: bool,
    ) -> ActionResult {
        let sprite_id = *descriptor.sprite_id.get_or_insert_with(Uuid::new_v4);
        let Some(table) = self.tables.get_mut(table_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("table {table_id} not found"));
        };
        let created = match table.add_entity(descriptor.clone()) {
            Ok(entity) => entity.clone(),
            Err(e) => return e.into(),
        };
        if to_server {
            session.send_payload(
                MessageType::SpriteCreate,
                json!({
                    "table_id": table_id.to_string(),
                    "sprite_id": sprite_id.to_string(),
                    "name": created.name,
                    "position": { "x": created.position.x(), "y": created.position.y() },
                    "layer": created.layer.as_str(),
                    "texture_path": created.texture_path,
                    "character_id": created.character_id,
                    "controlled_by": created.controlled_by,
                }),
            );
        }
        ActionResult::ok("sprite created").with_field("sprite_id", sprite_id.to_string())
    }

    /// Apply a sprite received in a broadcast (always `to_server = false`
    /// semantics: no emit).
    pub fn apply_remote_sprite(&mut self, table_id: &Uuid, entity: Entity) -> ActionResult {
        let Some(table) = self.tables.get_mut(table_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("table {table_id} not found"));
        };
        if table.find_entity_by_sprite(&entity.sprite_id).is_some() {
            return ActionResult::ok("sprite already present");
        }
        let mut descriptor = EntityDescriptor::at(entity.position);
        descriptor.name = Some(entity.name);
        descriptor.layer = Some(entity.layer);
        descriptor.texture_path = entity.texture_path;
        descriptor.sprite_id = Some(entity.sprite_id);
        descriptor.character_id = entity.character_id;
        descriptor.controlled_by = entity.controlled_by;
        match table.add_entity(descriptor) {
            Ok(_) => ActionResult::ok("sprite reconciled"),
            Err(e) => e.into(),
        }
    }

    /// Move a sprite locally; with `to_server` also send the move request.
    pub fn move_sprite(
        &mut self,
        session: &ClientSession,
        table_id: &Uuid,
        sprite_id: &Uuid,
        to: Position,
        to_server: bool,
    ) -> ActionResult {
        let Some(table) = self.tables.get_mut(table_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("table {table_id} not found"));
        };
        let Some(entity_id) = table.entity_id_for_sprite(sprite_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("sprite {sprite_id} not found"));
        };
        let from = table
            .entity(entity_id)
            .map(|e| e.position)
            .unwrap_or(Position(0, 0));
        let applied = table.move_entity(entity_id, to, None);

        if to_server {
            // The request goes out even when the optimistic apply failed
            // locally; the server stays authoritative either way.
            session.send_payload(
                MessageType::SpriteMove,
                json!({
                    "table_id": table_id.to_string(),
                    "sprite_id": sprite_id.to_string(),
                    "from": { "x": from.x(), "y": from.y() },
                    "to": { "x": to.x(), "y": to.y() },
                }),
            );
        }
        match applied {
            Ok(()) => ActionResult::ok("sprite moved"),
            Err(e) => e.into(),
        }
    }

    /// Overwrite a sprite's position with the server's authoritative one.
    pub fn force_position(&mut self, table_id: &Uuid, sprite_id: &Uuid, position: Position) {
        let Some(table) = self.tables.get_mut(table_id) else {
            return;
        };
        let Some(entity_id) = table.entity_id_for_sprite(sprite_id) else {
            return;
        };
        if let Err(e) = table.move_entity(entity_id, position, None) {
            warn!(%sprite_id, %position, error = %e, "reconciliation move failed");
        }
    }

    /// Scale a sprite locally; with `to_server` also send the request.
    pub fn scale_sprite(
        &mut self,
        session: &ClientSession,
        table_id: &Uuid,
        sprite_id: &Uuid,
        scale_x: f32,
        scale_y: f32,
        to_server: bool,
    ) -> ActionResult {
        let Some(table) = self.tables.get_mut(table_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("table {table_id} not found"));
        };
        let Some(entity_id) = table.entity_id_for_sprite(sprite_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("sprite {sprite_id} not found"));
        };
        if let Err(e) = table.scale_entity(entity_id, scale_x, scale_y) {
            return e.into();
        }
        if to_server {
            session.send_payload(
                MessageType::SpriteScale,
                json!({
                    "table_id": table_id.to_string(),
                    "sprite_id": sprite_id.to_string(),
                    "scale_x": scale_x,
                    "scale_y": scale_y,
                }),
            );
        }
        ActionResult::ok("sprite scaled")
    }

    /// Rotate a sprite locally; with `to_server` also send the request.
    pub fn rotate_sprite(
        &mut self,
        session: &ClientSession,
        table_id: &Uuid,
        sprite_id: &Uuid,
        rotation: f32,
        to_server: bool,
    ) -> ActionResult {
        let Some(table) = self.tables.get_mut(table_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("table {table_id} not found"));
        };
        let Some(entity_id) = table.entity_id_for_sprite(sprite_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("sprite {sprite_id} not found"));
        };
        if let Err(e) = table.rotate_entity(entity_id, rotation) {
            return e.into();
        }
        if to_server {
            session.send_payload(
                MessageType::SpriteRotate,
                json!({
                    "table_id": table_id.to_string(),
                    "sprite_id": sprite_id.to_string(),
                    "rotation": rotation,
                }),
            );
        }
        ActionResult::ok("sprite rotated")
    }

    /// Remove a sprite locally; with `to_server` also send the request.
    pub fn delete_sprite(
        &mut self,
        session: &ClientSession,
        table_id: &Uuid,
        sprite_id: &Uuid,
        to_server: bool,
    ) -> ActionResult {
        let Some(table) = self.tables.get_mut(table_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("table {table_id} not found"));
        };
        let Some(entity_id) = table.entity_id_for_sprite(sprite_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("sprite {sprite_id} not found"));
        };
        if let Err(e) = table.remove_entity(entity_id) {
            return e.into();
        }
        if to_server {
            session.send_payload(
                MessageType::SpriteRemove,
                json!({
                    "table_id": table_id.to_string(),
                    "sprite_id": sprite_id.to_string(),
                }),
            );
        }
        ActionResult::ok("sprite removed")
    }

    /// Apply a view update; with `to_server` also send the matching message.
    pub fn update_table_view(
        &mut self,
        session: &ClientSession,
        table_id: &Uuid,
        kind: MessageType,
        updates: &serde_json::Map<String, serde_json::Value>,
        to_server: bool,
    ) -> ActionResult {
        let Some(table) = self.tables.get_mut(table_id) else {
            return ActionResult::err(ErrorCode::NotFound, format!("table {table_id} not found"));
        };
        if let Some(scale) = updates.get("scale").and_then(serde_json::Value::as_object) {
            let sx = scale.get("x").and_then(serde_json::Value::as_f64).unwrap_or(1.0) as f32;
            let sy = scale.get("y").and_then(serde_json::Value::as_f64).unwrap_or(1.0) as f32;
            table.set_view_scale(sx, sy);
        }
        if let Some(position) = updates.get("position").and_then(serde_json::Value::as_object) {
            let x = position.get("x").and_then(serde_json::Value::as_f64).unwrap_or(0.0) as f32;
            let y = position.get("y").and_then(serde_json::Value::as_f64).unwrap_or(0.0) as f32;
            table.set_view_position(x, y);
        }
        if to_server {
            let mut data = updates.clone();
            data.insert("table_id".into(), table_id.to_string().into());
            session.send(kind, data);
        }
        ActionResult::ok("table view updated")
    }

    /// Mirror broadcast character stats onto locally bound tokens.
    pub fn sync_character_stats(
        &mut self,
        character_id: &str,
        stats: tavern_actions::TokenStats,
    ) -> usize {
        let mut synced = 0;
        for table in self.tables.iter_mut() {
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
            }
        }
        synced
    }
}
