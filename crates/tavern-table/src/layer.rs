// SPDX-License-Identifier: MIT OR Apache-2.0
//! The fixed layer stack of a virtual table.

use serde::{Deserialize, Serialize};

/// A rendering/occupancy layer.
///
/// The set and order are fixed; every table carries all seven layers and
/// each entity lives on exactly one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// Background map imagery.
    Map,
    /// Player-visible tokens.
    Tokens,
    /// Game-master-only annotations.
    DungeonMaster,
    /// Light sources.
    Light,
    /// Elevation markers.
    Height,
    /// Movement blockers.
    Obstacles,
    /// Fog-of-war overlay.
    FogOfWar,
}

impl Layer {
    /// All layers in stacking order.
    pub const ALL: &'static [Layer] = &[
        Layer::Map,
        Layer::Tokens,
        Layer::DungeonMaster,
        Layer::Light,
        Layer::Height,
        Layer::Obstacles,
        Layer::FogOfWar,
    ];

    /// Stable wire/persistence name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Map => "map",
            Layer::Tokens => "tokens",
            Layer::DungeonMaster => "dungeon_master",
            Layer::Light => "light",
            Layer::Height => "height",
            Layer::Obstacles => "obstacles",
            Layer::FogOfWar => "fog_of_war",
        }
    }
}

impl std::str::FromStr for Layer {
    type Err = UnknownLayer;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "map" => Ok(Layer::Map),
            "tokens" => Ok(Layer::Tokens),
            "dungeon_master" => Ok(Layer::DungeonMaster),
            "light" => Ok(Layer::Light),
            "height" => Ok(Layer::Height),
            "obstacles" => Ok(Layer::Obstacles),
            "fog_of_war" => Ok(Layer::FogOfWar),
            other => Err(UnknownLayer(other.to_string())),
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a wire/persisted layer name is not in the fixed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLayer(pub String);

impl std::fmt::Display for UnknownLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown layer '{}'", self.0)
    }
}

impl std::error::Error for UnknownLayer {}
