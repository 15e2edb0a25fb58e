// SPDX-License-Identifier: MIT OR Apache-2.0
//! Placed table entities and their token bindings.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Layer;

/// Dense per-table entity identifier, monotonically allocated.
pub type EntityId = u32;

/// A grid cell coordinate.
///
/// Serialises as a `[x, y]` pair to match the persisted table schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position(pub u32, pub u32);

impl Position {
    /// Column.
    pub fn x(&self) -> u32 {
        self.0
    }

    /// Row.
    pub fn y(&self) -> u32 {
        self.1
    }
}

impl From<(u32, u32)> for Position {
    fn from((x, y): (u32, u32)) -> Self {
        Self(x, y)
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.0, self.1)
    }
}

/// A placed object: position, layer, visual transform, and an optional
/// binding to a character sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Dense per-table id.
    pub entity_id: EntityId,
    /// Render identity, stable across table save/load.
    pub sprite_id: Uuid,
    /// Display name.
    pub name: String,
    /// Grid cell.
    pub position: Position,
    /// Occupancy layer.
    pub layer: Layer,
    /// Texture path or asset reference, if any.
    #[serde(default)]
    pub texture_path: Option<String>,
    /// Horizontal scale factor.
    #[serde(default = "default_scale")]
    pub scale_x: f32,
    /// Vertical scale factor.
    #[serde(default = "default_scale")]
    pub scale_y: f32,
    /// Rotation in degrees.
    #[serde(default)]
    pub rotation: f32,

    // -- token binding --
    /// Bound character sheet, if this entity is a character token.
    #[serde(default)]
    pub character_id: Option<String>,
    /// User ids allowed to control this entity.
    #[serde(default)]
    pub controlled_by: BTreeSet<String>,
    /// Current hit points.
    #[serde(default)]
    pub hp: Option<i32>,
    /// Maximum hit points.
    #[serde(default)]
    pub max_hp: Option<i32>,
    /// Armor class.
    #[serde(default)]
    pub ac: Option<i32>,
    /// Aura radius in cells, if the token projects one.
    #[serde(default)]
    pub aura_radius: Option<f32>,
}

fn default_scale() -> f32 {
    1.0
}

impl Entity {
    /// Whether `user_id` may mutate this entity.
    ///
    /// An entity nobody claims is open to everyone; once `controlled_by`
    /// is non-empty, only listed users qualify. Character ownership is
    /// checked separately by the action layer.
    pub fn is_controlled_by(&self, user_id: &str) -> bool {
        self.controlled_by.is_empty() || self.controlled_by.contains(user_id)
    }
}

/// Input for creating an entity.
///
/// The table allocates `entity_id`; `sprite_id` may be supplied by a client
/// that already rendered the sprite, otherwise a fresh one is generated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityDescriptor {
    /// Display name; defaults to "Unnamed Entity".
    #[serde(default)]
    pub name: Option<String>,
    /// Grid cell.
    pub position: Position,
    /// Target layer; defaults to [`Layer::Tokens`].
    #[serde(default)]
    pub layer: Option<Layer>,
    /// Texture path or asset reference.
    #[serde(default)]
    pub texture_path: Option<String>,
    /// Pre-assigned render identity.
    #[serde(default)]
    pub sprite_id: Option<Uuid>,
    /// Bound character sheet.
    #[serde(default)]
    pub character_id: Option<String>,
    /// Users allowed to control the entity.
    #[serde(default)]
    pub controlled_by: BTreeSet<String>,
}

impl EntityDescriptor {
    /// Descriptor at a position with every other field defaulted.
    pub fn at(position: impl Into<Position>) -> Self {
        Self {
            position: position.into(),
            ..Self::default()
        }
    }

    /// Set the display name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the target layer.
    pub fn on_layer(mut self, layer: Layer) -> Self {
        self.layer = Some(layer);
        self
    }

    /// Set the texture path.
    pub fn textured(mut self, path: impl Into<String>) -> Self {
        self.texture_path = Some(path.into());
        self
    }

    /// Bind to a character sheet.
    pub fn bound_to(mut self, character_id: impl Into<String>) -> Self {
        self.character_id = Some(character_id.into());
        self
    }

    /// Grant control to a user.
    pub fn controlled_by(mut self, user_id: impl Into<String>) -> Self {
        self.controlled_by.insert(user_id.into());
        self
    }
}

impl Default for Position {
    fn default() -> Self {
        Self(0, 0)
    }
}
