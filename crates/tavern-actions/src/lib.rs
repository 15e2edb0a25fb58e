// SPDX-License-Identifier: MIT OR Apache-2.0
//! tavern-actions
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The action layer between protocol handlers and the table model: every
//! mutation is validated here (permissions, bounds, occupancy, optimistic
//! character versions) and returns a uniform [`ActionResult`], while
//! persistence is debounced per table and flushed immediately for critical
//! operations.
//!
//! The per-session entry point is [`SessionActions`]; the persistence
//! seams it calls are the [`TableStore`] / [`CharacterStore`] traits.

mod actions;
mod character;
mod registry;
mod result;
mod scheduler;
mod store;

pub use self::actions::SessionActions;
pub use self::character::{
    Character, CharacterRegistry, CharacterUpdateError, TokenStats,
};
pub use self::registry::TableRegistry;
pub use self::result::ActionResult;
pub use self::scheduler::SaveScheduler;
pub use self::store::{CharacterStore, JsonStore, MemoryStore, StoreError, TableStore};
