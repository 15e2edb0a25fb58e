// SPDX-License-Identifier: MIT OR Apache-2.0
//! Character sheets with optimistic versioning.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A stored character sheet.
///
/// The sheet body is schemaless; the broker only interprets the token
/// stat fields (`hp`, `max_hp`, `ac`) it mirrors onto bound entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    /// Stable identifier, unique within a session.
    pub character_id: String,
    /// Display name.
    pub name: String,
    /// Owning user; `None` leaves the character open to every caller.
    #[serde(default)]
    pub owner_user_id: Option<String>,
    /// Optimistic version counter, incremented on every accepted update.
    #[serde(default)]
    pub version: u64,
    /// Schemaless sheet body.
    #[serde(default)]
    pub sheet: Map<String, Value>,
}

impl Character {
    /// A fresh character at version 0.
    pub fn new(character_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            character_id: character_id.into(),
            name: name.into(),
            owner_user_id: None,
            version: 0,
            sheet: Map::new(),
        }
    }

    /// Whether `user_id` may update this character.
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        match &self.owner_user_id {
            Some(owner) => owner == user_id,
            None => true,
        }
    }
}

/// The token stat subset a character update may carry.
///
/// Updates nest stats either at the top level or under a `stats` object;
/// both shapes are accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenStats {
    /// Hit points.
    pub hp: Option<i32>,
    /// Maximum hit points.
    pub max_hp: Option<i32>,
    /// Armor class.
    pub ac: Option<i32>,
}

impl TokenStats {
    /// Extract the token stat subset from an update payload.
    pub fn from_updates(updates: &Map<String, Value>) -> Self {
        fn pick(map: &Map<String, Value>, key: &str) -> Option<i32> {
            map.get(key).and_then(Value::as_i64).map(|v| v as i32)
        }
        let nested = updates.get("stats").and_then(Value::as_object);
        let get = |key: &str| pick(updates, key).or_else(|| nested.and_then(|m| pick(m, key)));
        Self {
            hp: get("hp"),
            max_hp: get("max_hp"),
            ac: get("ac"),
        }
    }

    /// Whether any stat is present.
    pub fn is_empty(&self) -> bool {
        self.hp.is_none() && self.max_hp.is_none() && self.ac.is_none()
    }
}

/// Failure modes of a versioned character update.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CharacterUpdateError {
    /// No character with that id.
    #[error("character '{0}' not found")]
    NotFound(String),
    /// Caller does not own the character.
    #[error("user '{user_id}' does not own character '{character_id}'")]
    NotOwner {
        /// Denied caller.
        user_id: String,
        /// Target character.
        character_id: String,
    },
    /// `expected_version` did not match the current version.
    #[error("version conflict on '{character_id}': expected {expected}, current {current}")]
    VersionConflict {
        /// Target character.
        character_id: String,
        /// Version the caller based its update on.
        expected: u64,
        /// Version actually stored.
        current: u64,
    },
}

/// In-memory authoritative character registry for one session.
#[derive(Debug, Default)]
pub struct CharacterRegistry {
    characters: HashMap<String, Character>,
}

impl CharacterRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a character wholesale (save path).
    pub fn upsert(&mut self, character: Character) {
        self.characters
            .insert(character.character_id.clone(), character);
    }

    /// Look up a character.
    pub fn get(&self, character_id: &str) -> Option<&Character> {
        self.characters.get(character_id)
    }

    /// Remove a character, returning it if present.
    pub fn remove(&mut self, character_id: &str) -> Option<Character> {
        self.characters.remove(character_id)
    }

    /// Character ids in arbitrary order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.characters.keys().map(String::as_str)
    }

    /// Number of characters.
    pub fn len(&self) -> usize {
        self.characters.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }

    /// Apply a delta update under optimistic versioning.
    ///
    /// With `expected_version = Some(v)`, the update succeeds only while
    /// the stored version is still `v`; on success the version becomes
    /// `v + 1`. `None` skips the check (last writer wins). Update keys are
    /// shallow-merged into the sheet.
    ///
    /// Returns the updated character (borrowed) on success.
    pub fn apply_update(
        &mut self,
        character_id: &str,
        updates: &Map<String, Value>,
        user_id: &str,
        expected_version: Option<u64>,
    ) -> Result<&Character, CharacterUpdateError> {
        let character = self
            .characters
            .get_mut(character_id)
            .ok_or_else(|| CharacterUpdateError::NotFound(character_id.to_string()))?;
        if !character.is_owned_by(user_id) {
            return Err(CharacterUpdateError::NotOwner {
                user_id: user_id.to_string(),
                character_id: character_id.to_string(),
            });
        }
        if let Some(expected) = expected_version
            && expected != character.version
        {
            return Err(CharacterUpdateError::VersionConflict {
                character_id: character_id.to_string(),
                expected,
                current: character.version,
            });
        }
        for (key, value) in updates {
            character.sheet.insert(key.clone(), value.clone());
        }
        character.version += 1;
        Ok(&*character)
    }

    /// Apply a server-authoritative update without ownership or version
    /// checks (the client reconciliation path).
    ///
    /// With `version = Some(v)` the stored version is overwritten with the
    /// server's; otherwise it increments. Returns false when the character
    /// is unknown.
    pub fn force_update(
        &mut self,
        character_id: &str,
        updates: &Map<String, Value>,
        version: Option<u64>,
    ) -> bool {
        let Some(character) = self.characters.get_mut(character_id) else {
            return false;
        };
        for (key, value) in updates {
            character.sheet.insert(key.clone(), value.clone());
        }
        match version {
            Some(version) => character.version = version,
            None => character.version += 1,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn updates(json: Value) -> Map<String, Value> {
        json.as_object().unwrap().clone()
    }

    #[test]
    fn update_bumps_version_by_exactly_one() {
        let mut registry = CharacterRegistry::new();
        registry.upsert(Character::new("char-123", "Mira"));

        let updated = registry
            .apply_update("char-123", &updates(json!({"hp": 30})), "alice", Some(0))
            .unwrap();
        assert_eq!(updated.version, 1);
        assert_eq!(updated.sheet["hp"], 30);
    }

    #[test]
    fn stale_expected_version_conflicts() {
        let mut registry = CharacterRegistry::new();
        let mut c = Character::new("char-123", "Mira");
        c.version = 4;
        registry.upsert(c);

        // First writer on version 4 wins...
        registry
            .apply_update("char-123", &updates(json!({"hp": 30})), "a", Some(4))
            .unwrap();
        // ...the concurrent second writer loses.
        let err = registry
            .apply_update("char-123", &updates(json!({"hp": 10})), "b", Some(4))
            .unwrap_err();
        assert_eq!(
            err,
            CharacterUpdateError::VersionConflict {
                character_id: "char-123".into(),
                expected: 4,
                current: 5
            }
        );
        assert_eq!(registry.get("char-123").unwrap().sheet["hp"], 30);
    }

    #[test]
    fn missing_expected_version_skips_the_check() {
        let mut registry = CharacterRegistry::new();
        let mut c = Character::new("char-123", "Mira");
        c.version = 7;
        registry.upsert(c);
        let updated = registry
            .apply_update("char-123", &updates(json!({"ac": 18})), "a", None)
            .unwrap();
        assert_eq!(updated.version, 8);
    }

    #[test]
    fn ownership_is_enforced() {
        let mut registry = CharacterRegistry::new();
        let mut c = Character::new("char-123", "Mira");
        c.owner_user_id = Some("alice".into());
        registry.upsert(c);

        assert!(matches!(
            registry.apply_update("char-123", &Map::new(), "bob", None),
            Err(CharacterUpdateError::NotOwner { .. })
        ));
        assert!(registry.apply_update("char-123", &Map::new(), "alice", None).is_ok());
    }

    #[test]
    fn token_stats_extraction_handles_both_shapes() {
        let flat = TokenStats::from_updates(&updates(json!({"hp": 25, "ac": 20})));
        assert_eq!(flat.hp, Some(25));
        assert_eq!(flat.ac, Some(20));
        assert_eq!(flat.max_hp, None);

        let nested = TokenStats::from_updates(&updates(json!({"stats": {"max_hp": 44}})));
        assert_eq!(nested.max_hp, Some(44));

        assert!(TokenStats::from_updates(&updates(json!({"notes": "hi"}))).is_empty());
    }
}
