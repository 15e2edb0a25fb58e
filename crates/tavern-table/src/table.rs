// SPDX-License-Identifier: MIT OR Apache-2.0
//! The authoritative table: layered occupancy grid plus entity arena.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tavern_error::ErrorCode;
use tracing::debug;
use uuid::Uuid;

use crate::{Entity, EntityDescriptor, EntityId, Layer, Position};

/// Failures from table mutations.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TableError {
    /// Table dimensions must be positive and the name non-empty.
    #[error("invalid table parameters: {0}")]
    InvalidTable(String),

    /// No entity with that id.
    #[error("entity {0} not found")]
    EntityNotFound(EntityId),

    /// No entity with that sprite id.
    #[error("sprite {0} not found")]
    SpriteNotFound(Uuid),

    /// Position outside `[0,width) x [0,height)`.
    #[error("position {0} outside {1}x{2} table")]
    OutOfBounds(Position, u32, u32),

    /// Move destination already holds another entity on that layer.
    #[error("cell {0} on layer {1} is occupied")]
    TargetOccupied(Position, Layer),
}

impl TableError {
    /// The wire error code for this failure.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            Self::InvalidTable(_) => ErrorCode::MalformedMessage,
            Self::EntityNotFound(_) | Self::SpriteNotFound(_) => ErrorCode::NotFound,
            Self::OutOfBounds(..) => ErrorCode::BoundsViolation,
            Self::TargetOccupied(..) => ErrorCode::TargetOccupied,
        }
    }
}

/// An axis-aligned fog rectangle, `[[x1, y1], [x2, y2]]` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FogRect(pub (f32, f32), pub (f32, f32));

/// Which fog list a rectangle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FogKind {
    /// Adds fog over an area.
    Hide,
    /// Punches a hole in the fog.
    Reveal,
}

/// The `hide`/`reveal` rectangle lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FogRectangles {
    /// Areas hidden from players.
    #[serde(default)]
    pub hide: Vec<FogRect>,
    /// Areas revealed to players.
    #[serde(default)]
    pub reveal: Vec<FogRect>,
}

/// Pan/zoom/visibility state mirrored to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    /// Pan offset.
    pub position: (f32, f32),
    /// Zoom factors.
    pub scale: (f32, f32),
    /// Per-layer visibility toggles.
    pub layer_visibility: BTreeMap<Layer, bool>,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            position: (0.0, 0.0),
            scale: (1.0, 1.0),
            layer_visibility: Layer::ALL.iter().map(|l| (*l, true)).collect(),
        }
    }
}

/// A virtual table: a `width x height` cell grid with one occupancy plane
/// per [`Layer`], a dense entity arena, and a sprite-id secondary index.
///
/// Mutations keep three structures consistent:
/// - `entities[eid].position/layer` agrees with every grid cell holding `eid`
/// - `sprite_to_entity[e.sprite_id] == e.entity_id` for every entity
/// - occupied cells are inside the bounds
#[derive(Debug, Clone)]
pub struct Table {
    /// Globally unique table identity.
    pub table_id: Uuid,
    /// Display name, unique within a session.
    pub name: String,
    /// Width in cells.
    pub width: u32,
    /// Height in cells.
    pub height: u32,
    /// View state mirrored to clients.
    pub view: ViewState,
    /// Fog-of-war rectangles.
    pub fog_rectangles: FogRectangles,

    entities: BTreeMap<EntityId, Entity>,
    next_entity_id: EntityId,
    sprite_to_entity: HashMap<Uuid, EntityId>,
    grid: HashMap<Layer, Vec<Vec<Option<EntityId>>>>,
}

impl Table {
    /// Create an empty table.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::InvalidTable`] for an empty name or zero
    /// dimension.
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Result<Self, TableError> {
        Self::with_id(Uuid::new_v4(), name, width, height)
    }

    /// Create an empty table with a pre-assigned id (used by load paths).
    pub fn with_id(
        table_id: Uuid,
        name: impl Into<String>,
        width: u32,
        height: u32,
    ) -> Result<Self, TableError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(TableError::InvalidTable("name cannot be empty".into()));
        }
        if width == 0 || height == 0 {
            return Err(TableError::InvalidTable(format!(
                "dimensions must be positive, got {width}x{height}"
            )));
        }
        let grid = Layer::ALL
            .iter()
            .map(|layer| {
                (
                    *layer,
                    vec![vec![None; width as usize]; height as usize],
                )
            })
            .collect();
        Ok(Self {
            table_id,
            name,
            width,
            height,
            view: ViewState::default(),
            fog_rectangles: FogRectangles::default(),
            entities: BTreeMap::new(),
            next_entity_id: 1,
            sprite_to_entity: HashMap::new(),
            grid,
        })
    }

    /// Whether `position` lies inside the table bounds.
    pub fn is_valid_position(&self, position: Position) -> bool {
        position.x() < self.width && position.y() < self.height
    }

    fn cell(&self, layer: Layer, position: Position) -> Option<EntityId> {
        self.grid[&layer][position.y() as usize][position.x() as usize]
    }

    fn set_cell(&mut self, layer: Layer, position: Position, value: Option<EntityId>) {
        if let Some(plane) = self.grid.get_mut(&layer) {
            plane[position.y() as usize][position.x() as usize] = value;
        }
    }

    /// Add an entity, allocating the next dense id.
    ///
    /// An occupied destination cell is tolerated: the newcomer takes over
    /// the cell index and the previous occupant stays un-indexed until it
    /// moves. (Moves, in contrast, reject occupied destinations.)
    ///
    /// # Errors
    ///
    /// Returns [`TableError::OutOfBounds`] when the position is outside the
    /// table.
    pub fn add_entity(&mut self, descriptor: EntityDescriptor) -> Result<&Entity, TableError> {
        let position = descriptor.position;
        if !self.is_valid_position(position) {
            return Err(TableError::OutOfBounds(position, self.width, self.height));
        }
        let layer = descriptor.layer.unwrap_or(Layer::Tokens);
        let entity_id = self.next_entity_id;
        let sprite_id = descriptor.sprite_id.unwrap_or_else(Uuid::new_v4);
        let entity = Entity {
            entity_id,
            sprite_id,
            name: descriptor
                .name
                .unwrap_or_else(|| "Unnamed Entity".to_string()),
            position,
            layer,
            texture_path: descriptor.texture_path,
            scale_x: 1.0,
            scale_y: 1.0,
            rotation: 0.0,
            character_id: descriptor.character_id,
            controlled_by: descriptor.controlled_by,
            hp: None,
            max_hp: None,
            ac: None,
            aura_radius: None,
        };
        debug!(
            table = %self.name,
            entity_id,
            sprite = %sprite_id,
            %position,
            %layer,
            "added entity"
        );
        self.entities.insert(entity_id, entity);
        self.sprite_to_entity.insert(sprite_id, entity_id);
        self.set_cell(layer, position, Some(entity_id));
        self.next_entity_id += 1;
        Ok(&self.entities[&entity_id])
    }

    /// Move an entity, optionally changing its layer.
    ///
    /// The move is atomic: every check runs before any mutation, so a
    /// failed move leaves the grid and the entity untouched.
    ///
    /// # Errors
    ///
    /// [`TableError::EntityNotFound`], [`TableError::OutOfBounds`], or
    /// [`TableError::TargetOccupied`] when the destination cell holds a
    /// different entity.
    pub fn move_entity(
        &mut self,
        entity_id: EntityId,
        new_position: Position,
        new_layer: Option<Layer>,
    ) -> Result<(), TableError> {
        let (old_position, old_layer) = {
            let entity = self
                .entities
                .get(&entity_id)
                .ok_or(TableError::EntityNotFound(entity_id))?;
            (entity.position, entity.layer)
        };
        if !self.is_valid_position(new_position) {
            return Err(TableError::OutOfBounds(
                new_position,
                self.width,
                self.height,
            ));
        }
        let target_layer = new_layer.unwrap_or(old_layer);
        if let Some(occupant) = self.cell(target_layer, new_position)
            && occupant != entity_id
        {
            return Err(TableError::TargetOccupied(new_position, target_layer));
        }

        // Clear the source cell only if it still points at us; an add over
        // the same cell may have taken it over.
        if self.cell(old_layer, old_position) == Some(entity_id) {
            self.set_cell(old_layer, old_position, None);
        }
        self.set_cell(target_layer, new_position, Some(entity_id));
        if let Some(entity) = self.entities.get_mut(&entity_id) {
            entity.position = new_position;
            entity.layer = target_layer;
        }
        debug!(table = %self.name, entity_id, %new_position, layer = %target_layer, "moved entity");
        Ok(())
    }

    /// Remove an entity, clearing its grid cell and sprite index entry.
    pub fn remove_entity(&mut self, entity_id: EntityId) -> Result<Entity, TableError> {
        let entity = self
            .entities
            .remove(&entity_id)
            .ok_or(TableError::EntityNotFound(entity_id))?;
        if self.cell(entity.layer, entity.position) == Some(entity_id) {
            self.set_cell(entity.layer, entity.position, None);
        }
        self.sprite_to_entity.remove(&entity.sprite_id);
        debug!(table = %self.name, entity_id, sprite = %entity.sprite_id, "removed entity");
        Ok(entity)
    }

    /// Set an entity's scale factors.
    pub fn scale_entity(
        &mut self,
        entity_id: EntityId,
        scale_x: f32,
        scale_y: f32,
    ) -> Result<(), TableError> {
        let entity = self
            .entities
            .get_mut(&entity_id)
            .ok_or(TableError::EntityNotFound(entity_id))?;
        entity.scale_x = scale_x;
        entity.scale_y = scale_y;
        Ok(())
    }

    /// Set an entity's rotation in degrees.
    pub fn rotate_entity(&mut self, entity_id: EntityId, rotation: f32) -> Result<(), TableError> {
        let entity = self
            .entities
            .get_mut(&entity_id)
            .ok_or(TableError::EntityNotFound(entity_id))?;
        entity.rotation = rotation;
        Ok(())
    }

    /// Look up an entity by id.
    pub fn entity(&self, entity_id: EntityId) -> Option<&Entity> {
        self.entities.get(&entity_id)
    }

    /// Mutable entity access for the action layer.
    pub fn entity_mut(&mut self, entity_id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&entity_id)
    }

    /// O(1) lookup through the sprite index.
    pub fn find_entity_by_sprite(&self, sprite_id: &Uuid) -> Option<&Entity> {
        self.sprite_to_entity
            .get(sprite_id)
            .and_then(|id| self.entities.get(id))
    }

    /// Entity id behind a sprite id.
    pub fn entity_id_for_sprite(&self, sprite_id: &Uuid) -> Option<EntityId> {
        self.sprite_to_entity.get(sprite_id).copied()
    }

    /// The entity occupying `position`, searching one layer or all in
    /// stacking order.
    pub fn entity_at(&self, position: Position, layer: Option<Layer>) -> Option<&Entity> {
        if !self.is_valid_position(position) {
            return None;
        }
        let layers: &[Layer] = match &layer {
            Some(l) => std::slice::from_ref(l),
            None => Layer::ALL,
        };
        layers
            .iter()
            .find_map(|l| self.cell(*l, position))
            .and_then(|id| self.entities.get(&id))
    }

    /// Every entity inside the inclusive rectangle, optionally restricted
    /// to one layer. Corners are clamped to the table bounds.
    pub fn entities_in_area(
        &self,
        top_left: Position,
        bottom_right: Position,
        layer: Option<Layer>,
    ) -> Vec<&Entity> {
        let x1 = top_left.x().min(self.width - 1);
        let y1 = top_left.y().min(self.height - 1);
        let x2 = bottom_right.x().min(self.width - 1);
        let y2 = bottom_right.y().min(self.height - 1);
        self.entities
            .values()
            .filter(|e| layer.is_none_or(|l| e.layer == l))
            .filter(|e| {
                let Position(x, y) = e.position;
                x >= x1 && x <= x2 && y >= y1 && y <= y2
            })
            .collect()
    }

    /// Iterate all entities in id order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Mutable iteration over entities bound to `character_id`.
    pub fn entities_with_character_mut(
        &mut self,
        character_id: &str,
    ) -> impl Iterator<Item = &mut Entity> {
        self.entities
            .values_mut()
            .filter(move |e| e.character_id.as_deref() == Some(character_id))
    }

    /// Number of entities on the table.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Next id the arena will allocate (exposed for persistence metadata).
    pub fn next_entity_id(&self) -> EntityId {
        self.next_entity_id
    }

    /// Append a fog rectangle.
    pub fn push_fog(&mut self, kind: FogKind, rect: FogRect) {
        match kind {
            FogKind::Hide => self.fog_rectangles.hide.push(rect),
            FogKind::Reveal => self.fog_rectangles.reveal.push(rect),
        }
    }

    /// Drop all fog rectangles.
    pub fn clear_fog(&mut self) {
        self.fog_rectangles = FogRectangles::default();
    }

    /// Update the view pan offset.
    pub fn set_view_position(&mut self, x: f32, y: f32) {
        self.view.position = (x, y);
    }

    /// Update the view zoom factors.
    pub fn set_view_scale(&mut self, sx: f32, sy: f32) {
        self.view.scale = (sx, sy);
    }

    /// Toggle a layer's visibility.
    pub fn set_layer_visibility(&mut self, layer: Layer, visible: bool) {
        self.view.layer_visibility.insert(layer, visible);
    }

    /// Advance the arena counter during load so dropped ids are not reused.
    pub(crate) fn bump_next_entity_id(&mut self, next: EntityId) {
        self.next_entity_id = self.next_entity_id.max(next);
    }

    /// Restore internal indices after a bulk load. Used by the save module.
    pub(crate) fn insert_loaded_entity(&mut self, entity: Entity) {
        let entity_id = entity.entity_id;
        self.sprite_to_entity.insert(entity.sprite_id, entity_id);
        self.set_cell(entity.layer, entity.position, Some(entity_id));
        self.next_entity_id = self.next_entity_id.max(entity_id + 1);
        self.entities.insert(entity_id, entity);
    }
}
