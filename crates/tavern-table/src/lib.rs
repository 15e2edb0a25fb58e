// SPDX-License-Identifier: MIT OR Apache-2.0
//! tavern-table
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The authoritative virtual-table model: a 2D cell grid with one
//! occupancy plane per layer, a dense entity arena, a sprite-id secondary
//! index, fog-of-war rectangles, and a round-trippable JSON projection.
//!
//! Other crates refer to entities by `(table_id, entity_id)` or by
//! `sprite_id`; entities never point back at their table. The server holds
//! the authoritative instance, every client holds a reconciled projection
//! built from the same types.

mod entity;
mod layer;
mod save;
mod table;

pub use self::entity::{Entity, EntityDescriptor, EntityId, Position};
pub use self::layer::{Layer, UnknownLayer};
pub use self::save::{SAVE_VERSION, SaveMetadata, TableSave, TableSnapshot};
pub use self::table::{FogKind, FogRect, FogRectangles, Table, TableError, ViewState};
