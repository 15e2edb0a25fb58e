// SPDX-License-Identifier: MIT OR Apache-2.0
//! The closed enumeration of wire message types.

use serde::{Deserialize, Serialize};

/// Declares [`MessageType`] together with its stable wire tags.
///
/// The serde representation (`rename_all = "snake_case"`) and the literal
/// tags must agree; `types_match_serde_names` in the test suite iterates
/// [`MessageType::ALL`] to enforce that.
macro_rules! message_types {
    ($($(#[$meta:meta])* $variant:ident => $wire:literal,)*) => {
        /// A wire message tag.
        ///
        /// Decoding rejects tags outside this enumeration; senders of
        /// unknown tags receive a `malformed_message` error envelope.
        /// Extensions hang off [`Custom`](MessageType::Custom) rather than
        /// widening the enum.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum MessageType {
            $(
                $(#[$meta])*
                #[doc = concat!("Wire tag `", $wire, "`.")]
                $variant,
            )*
        }

        impl MessageType {
            /// Every message type, in declaration order.
            pub const ALL: &'static [MessageType] = &[$(Self::$variant,)*];

            /// Stable wire tag (e.g. `"sprite_move"`).
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $wire,)*
                }
            }
        }

        impl std::str::FromStr for MessageType {
            type Err = UnknownMessageType;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok(Self::$variant),)*
                    other => Err(UnknownMessageType(other.to_string())),
                }
            }
        }
    };
}

/// Returned when a wire tag is not part of the protocol enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMessageType(pub String);

impl std::fmt::Display for UnknownMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown message type '{}'", self.0)
    }
}

impl std::error::Error for UnknownMessageType {}

message_types! {
    // -- Core --
    /// Liveness probe; answered with [`Pong`](MessageType::Pong).
    Ping => "ping",
    /// Liveness reply carrying the server timestamp.
    Pong => "pong",
    /// Recoverable failure report; `data.error` holds the stable code.
    Error => "error",
    /// Loopback message used by conformance checks.
    Test => "test",
    /// Generic success acknowledgement.
    Success => "success",
    /// First message a client receives after joining a session.
    Welcome => "welcome",

    // -- Auth (handled by the external auth service; tags reserved) --
    AuthRegister => "auth_register",
    AuthLogin => "auth_login",
    AuthLogout => "auth_logout",
    AuthToken => "auth_token",
    AuthStatus => "auth_status",

    // -- Tables --
    NewTableRequest => "new_table_request",
    NewTableResponse => "new_table_response",
    TableRequest => "table_request",
    TableResponse => "table_response",
    TableData => "table_data",
    TableUpdate => "table_update",
    TableScale => "table_scale",
    TableMove => "table_move",
    TableListRequest => "table_list_request",
    TableListResponse => "table_list_response",
    TableDelete => "table_delete",

    // -- Players --
    PlayerAction => "player_action",
    PlayerActionResponse => "player_action_response",
    PlayerActionUpdate => "player_action_update",
    PlayerActionRemove => "player_action_remove",
    PlayerJoined => "player_joined",
    PlayerLeft => "player_left",
    PlayerReady => "player_ready",
    PlayerUnready => "player_unready",
    PlayerStatus => "player_status",
    PlayerListRequest => "player_list_request",
    PlayerListResponse => "player_list_response",
    PlayerKickRequest => "player_kick_request",
    PlayerKickResponse => "player_kick_response",
    PlayerBanRequest => "player_ban_request",
    PlayerBanResponse => "player_ban_response",
    ConnectionStatusRequest => "connection_status_request",
    ConnectionStatusResponse => "connection_status_response",

    // -- Sprites --
    SpriteRequest => "sprite_request",
    SpriteResponse => "sprite_response",
    SpriteData => "sprite_data",
    /// Derived mutation broadcast; `data.type` names the concrete change.
    SpriteUpdate => "sprite_update",
    SpriteRemove => "sprite_remove",
    SpriteCreate => "sprite_create",
    SpriteMove => "sprite_move",
    SpriteScale => "sprite_scale",
    SpriteRotate => "sprite_rotate",

    // -- Files (legacy transfer path) --
    FileRequest => "file_request",
    FileData => "file_data",

    // -- Assets --
    AssetUploadRequest => "asset_upload_request",
    AssetUploadResponse => "asset_upload_response",
    AssetUploadConfirm => "asset_upload_confirm",
    AssetDownloadRequest => "asset_download_request",
    AssetDownloadResponse => "asset_download_response",
    AssetListRequest => "asset_list_request",
    AssetListResponse => "asset_list_response",
    AssetDeleteRequest => "asset_delete_request",
    AssetDeleteResponse => "asset_delete_response",
    AssetHashCheck => "asset_hash_check",

    // -- Compendium sprite operations --
    CompendiumSpriteAdd => "compendium_sprite_add",
    CompendiumSpriteUpdate => "compendium_sprite_update",
    CompendiumSpriteRemove => "compendium_sprite_remove",

    // -- Compendium data lookups (served by extension handlers) --
    CompendiumSearch => "compendium_search",
    CompendiumSearchResponse => "compendium_search_response",
    CompendiumGetSpell => "compendium_get_spell",
    CompendiumGetSpellResponse => "compendium_get_spell_response",
    CompendiumGetClass => "compendium_get_class",
    CompendiumGetClassResponse => "compendium_get_class_response",
    CompendiumGetSubclasses => "compendium_get_subclasses",
    CompendiumGetSubclassesResponse => "compendium_get_subclasses_response",
    CompendiumGetClassFeatures => "compendium_get_class_features",
    CompendiumGetClassFeaturesResponse => "compendium_get_class_features_response",
    CompendiumGetEquipment => "compendium_get_equipment",
    CompendiumGetEquipmentResponse => "compendium_get_equipment_response",
    CompendiumSearchEquipment => "compendium_search_equipment",
    CompendiumSearchEquipmentResponse => "compendium_search_equipment_response",
    CompendiumGetMonster => "compendium_get_monster",
    CompendiumGetMonsterResponse => "compendium_get_monster_response",
    CompendiumGetStats => "compendium_get_stats",
    CompendiumGetStatsResponse => "compendium_get_stats_response",
    CompendiumGetCharacterData => "compendium_get_character_data",
    CompendiumGetCharacterDataResponse => "compendium_get_character_data_response",
    CompendiumGenerateTreasure => "compendium_generate_treasure",
    CompendiumGenerateTreasureResponse => "compendium_generate_treasure_response",

    // -- Characters --
    CharacterSaveRequest => "character_save_request",
    CharacterSaveResponse => "character_save_response",
    CharacterLoadRequest => "character_load_request",
    CharacterLoadResponse => "character_load_response",
    CharacterListRequest => "character_list_request",
    CharacterListResponse => "character_list_response",
    CharacterDeleteRequest => "character_delete_request",
    CharacterDeleteResponse => "character_delete_response",
    /// Delta character update with optimistic versioning.
    CharacterUpdate => "character_update",
    CharacterUpdateResponse => "character_update_response",

    // -- Batch --
    /// Container frame; see `BatchEnvelope`.
    Batch => "batch",

    // -- Extension point --
    Custom => "custom",
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
