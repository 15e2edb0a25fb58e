// SPDX-License-Identifier: MIT OR Apache-2.0
//! Server-side message handling: one handler per wire type, uniform output.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tavern_actions::{ActionResult, Character, SessionActions};
use tavern_assets::asset_id_from_hash;
use tavern_error::ErrorCode;
use tavern_protocol::{Envelope, MessageType, Router, now_epoch};
use tavern_table::{EntityDescriptor, Layer, Position};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::presign::BlobPresigner;

/// Who sent the frame, as registered at join time.
///
/// The roster identity is authoritative; payload-carried user ids are
/// ignored for permission checks.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// 16-hex-char connection id.
    pub client_id: String,
    /// Authenticated user id.
    pub user_id: String,
    /// Display name.
    pub username: String,
}

/// Roster row surfaced by player-admin handlers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlayerInfo {
    /// Connection id.
    pub client_id: String,
    /// Authenticated user id.
    pub user_id: String,
    /// Display name.
    pub username: String,
    /// Seconds since epoch at join.
    pub connected_at: f64,
    /// Seconds since epoch of the last inbound frame or ping.
    pub last_ping: f64,
}

/// What the broker should do with a handled message.
#[derive(Debug, Default)]
pub struct HandlerOutput {
    /// Envelope for the sender only.
    pub reply: Option<Envelope>,
    /// Derived mutation for every other client. Exactly one broadcast is
    /// emitted per accepted mutation; rejected mutations never broadcast.
    pub broadcast: Option<Envelope>,
    /// Client id to disconnect.
    pub kick: Option<String>,
    /// User id to ban from rejoining, with its current client id.
    pub ban: Option<String>,
}

impl HandlerOutput {
    fn reply(envelope: Envelope) -> Self {
        Self {
            reply: Some(envelope),
            ..Self::default()
        }
    }

    fn with_broadcast(mut self, envelope: Envelope) -> Self {
        self.broadcast = Some(envelope);
        self
    }

    fn none() -> Self {
        Self::default()
    }
}

/// An asset the session knows about.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionAsset {
    /// Canonical content id.
    pub asset_id: String,
    /// Original filename.
    pub filename: String,
    /// Size in bytes as declared at upload request.
    pub file_size: u64,
    /// Full integrity tag.
    pub xxhash: String,
    /// MIME type declared by the uploader.
    pub content_type: Option<String>,
    /// User who uploaded it.
    pub uploaded_by: String,
    /// Whether the upload was confirmed (visible to the session).
    pub confirmed: bool,
}

/// The per-session handler table.
///
/// Built-in handlers cover the core protocol; [`ServerProtocol::register_handler`]
/// hangs extensions (compendium lookups, `custom`) off the same dispatch.
pub struct ServerProtocol {
    presigner: Arc<dyn BlobPresigner>,
    assets: HashMap<String, SessionAsset>,
    extensions: Router<SessionActions>,
}

impl ServerProtocol {
    /// Protocol over the given presigner.
    pub fn new(presigner: Arc<dyn BlobPresigner>) -> Self {
        Self {
            presigner,
            assets: HashMap::new(),
            extensions: Router::new(),
        }
    }

    /// Register an extension handler for a message type the core does not
    /// implement (compendium data lookups, `custom`).
    pub fn register_handler<F>(&mut self, kind: MessageType, handler: F)
    where
        F: Fn(&mut SessionActions, &Envelope, Option<&str>) -> Option<Envelope>
            + Send
            + Sync
            + 'static,
    {
        self.extensions.register(kind, handler);
    }

    /// Assets confirmed visible to the session.
    pub fn confirmed_assets(&self) -> impl Iterator<Item = &SessionAsset> {
        self.assets.values().filter(|a| a.confirmed)
    }

    /// Handle one decoded envelope from `sender`.
    pub async fn handle(
        &mut self,
        actions: &mut SessionActions,
        roster: &[PlayerInfo],
        envelope: &Envelope,
        sender: &ClientIdentity,
    ) -> HandlerOutput {
        match envelope.kind {
            MessageType::Ping => HandlerOutput::reply(Envelope::pong()),
            MessageType::Pong => HandlerOutput::none(),
            MessageType::Test => HandlerOutput::reply(Envelope::success(envelope.data.clone())),

            MessageType::NewTableRequest => self.handle_new_table(actions, envelope).await,
            MessageType::TableRequest => self.handle_table_request(actions, envelope),
            MessageType::TableListRequest => HandlerOutput::reply(Envelope::from_payload(
                MessageType::TableListResponse,
                json!({ "tables": actions.table_names() }),
            )),
            MessageType::TableUpdate | MessageType::TableScale | MessageType::TableMove => {
                self.handle_table_view(actions, envelope)
            }
            MessageType::TableDelete => self.handle_table_delete(actions, envelope).await,

            MessageType::SpriteCreate => self.handle_sprite_create(actions, envelope),
            MessageType::SpriteMove => self.handle_sprite_move(actions, envelope, sender),
            MessageType::SpriteScale => self.handle_sprite_scale(actions, envelope, sender),
            MessageType::SpriteRotate => self.handle_sprite_rotate(actions, envelope, sender),
            MessageType::SpriteRemove => self.handle_sprite_remove(actions, envelope, sender),
            MessageType::SpriteRequest => self.handle_sprite_request(actions, envelope),

            MessageType::CharacterSaveRequest => {
                self.handle_character_save(actions, envelope, sender).await
            }
            MessageType::CharacterLoadRequest => {
                let character_id = envelope.str_field("character_id").unwrap_or_default();
                let result = actions.load_character(character_id);
                HandlerOutput::reply(response_from(
                    MessageType::CharacterLoadResponse,
                    result,
                ))
            }
            MessageType::CharacterListRequest => HandlerOutput::reply(response_from(
                MessageType::CharacterListResponse,
                actions.list_characters(),
            )),
            MessageType::CharacterDeleteRequest => {
                let character_id = envelope.str_field("character_id").unwrap_or_default();
                let result = actions.delete_character(character_id, &sender.user_id).await;
                HandlerOutput::reply(response_from(
                    MessageType::CharacterDeleteResponse,
                    result,
                ))
            }
            MessageType::CharacterUpdate => {
                self.handle_character_update(actions, envelope, sender).await
            }

            MessageType::AssetUploadRequest => self.handle_asset_upload_request(envelope, sender),
            MessageType::AssetUploadConfirm => self.handle_asset_upload_confirm(envelope),
            MessageType::AssetDownloadRequest => self.handle_asset_download_request(envelope),
            MessageType::AssetListRequest => HandlerOutput::reply(Envelope::from_payload(
                MessageType::AssetListResponse,
                json!({ "assets": self.confirmed_assets().collect::<Vec<_>>() }),
            )),
            MessageType::AssetDeleteRequest => {
                let asset_id = envelope.str_field("asset_id").unwrap_or_default().to_string();
                let removed = self.assets.remove(&asset_id).is_some();
                HandlerOutput::reply(Envelope::from_payload(
                    MessageType::AssetDeleteResponse,
                    json!({ "success": removed, "asset_id": asset_id }),
                ))
            }
            MessageType::AssetHashCheck => {
                let xxhash = envelope.str_field("xxhash").unwrap_or_default();
                let found = self
                    .assets
                    .values()
                    .find(|a| a.confirmed && a.xxhash == xxhash)
                    .map(|a| a.asset_id.clone());
                HandlerOutput::reply(Envelope::success(
                    json!({ "xxhash": xxhash, "asset_id": found })
                        .as_object()
                        .cloned()
                        .unwrap_or_default(),
                ))
            }

            MessageType::PlayerListRequest => HandlerOutput::reply(Envelope::from_payload(
                MessageType::PlayerListResponse,
                json!({ "players": roster }),
            )),
            MessageType::ConnectionStatusRequest => HandlerOutput::reply(Envelope::from_payload(
                MessageType::ConnectionStatusResponse,
                json!({
                    "connected_clients": roster.len(),
                    "client_ids": roster.iter().map(|p| p.client_id.clone()).collect::<Vec<_>>(),
                    "timestamp": now_epoch(),
                }),
            )),
            MessageType::PlayerKickRequest => self.handle_player_kick(roster, envelope),
            MessageType::PlayerBanRequest => self.handle_player_ban(roster, envelope),

            // Auth is terminated at the HTTP gateway before a socket ever
            // reaches a session.
            MessageType::AuthRegister
            | MessageType::AuthLogin
            | MessageType::AuthLogout
            | MessageType::AuthToken
            | MessageType::AuthStatus => HandlerOutput::reply(Envelope::error(
                ErrorCode::Unauthorized,
                "authentication is handled by the gateway, not the session",
            )),

            // Server-originated kinds echoing back from a confused client
            // are dropped rather than answered, avoiding error ping-pong.
            MessageType::Error | MessageType::Success | MessageType::Welcome => {
                HandlerOutput::none()
            }

            // Batch frames are unpacked by the broker before reaching here.
            MessageType::Batch => HandlerOutput::reply(Envelope::error(
                ErrorCode::MalformedMessage,
                "nested batch frames are not allowed",
            )),

            other => {
                if self.extensions.handles(other) {
                    let reply =
                        self.extensions
                            .dispatch(actions, envelope, Some(&sender.client_id));
                    HandlerOutput {
                        reply,
                        ..HandlerOutput::default()
                    }
                } else {
                    debug!(kind = %other, "no handler for message type");
                    HandlerOutput::reply(Envelope::error(
                        ErrorCode::MalformedMessage,
                        format!("no handler for message type '{other}'"),
                    ))
                }
            }
        }
    }

    // -- tables -------------------------------------------------------------

    async fn handle_new_table(
        &mut self,
        actions: &mut SessionActions,
        envelope: &Envelope,
    ) -> HandlerOutput {
        let name = envelope.str_field("table_name").unwrap_or("new table");
        let width = envelope.u64_field("width").unwrap_or(100) as u32;
        let height = envelope.u64_field("height").unwrap_or(100) as u32;
        let result = actions.create_table(name, width, height).await;
        HandlerOutput::reply(response_from(MessageType::NewTableResponse, result))
    }

    fn handle_table_request(
        &self,
        actions: &mut SessionActions,
        envelope: &Envelope,
    ) -> HandlerOutput {
        let reference = envelope
            .str_field("table_id")
            .or_else(|| envelope.str_field("name"))
            .unwrap_or_default();
        match actions
            .resolve_table_id(reference)
            .and_then(|id| actions.table_snapshot(&id))
        {
            Some(snapshot) => HandlerOutput::reply(Envelope::from_payload(
                MessageType::TableResponse,
                json!({ "table_data": snapshot }),
            )),
            None => HandlerOutput::reply(Envelope::error(
                ErrorCode::NotFound,
                format!("table '{reference}' not found"),
            )),
        }
    }

    fn handle_table_view(
        &self,
        actions: &mut SessionActions,
        envelope: &Envelope,
    ) -> HandlerOutput {
        let Some(table_id) = self.resolve_table(actions, envelope) else {
            return table_not_found(envelope);
        };
        let result = actions.update_table_view(&table_id, &envelope.data);
        if !result.success {
            return HandlerOutput::reply(result_error(result));
        }
        let mut data = envelope.data.clone();
        data.insert("table_id".into(), table_id.to_string().into());
        HandlerOutput::reply(Envelope::success(Map::new()))
            .with_broadcast(Envelope::with_data(envelope.kind, data))
    }

    async fn handle_table_delete(
        &mut self,
        actions: &mut SessionActions,
        envelope: &Envelope,
    ) -> HandlerOutput {
        let Some(table_id) = self.resolve_table(actions, envelope) else {
            return table_not_found(envelope);
        };
        let result = actions.delete_table(&table_id).await;
        if !result.success {
            return HandlerOutput::reply(result_error(result));
        }
        HandlerOutput::reply(Envelope::success(result.data.clone())).with_broadcast(
            Envelope::from_payload(
                MessageType::TableDelete,
                json!({ "table_id": table_id.to_string() }),
            ),
        )
    }

    fn resolve_table(&self, actions: &SessionActions, envelope: &Envelope) -> Option<Uuid> {
        envelope
            .str_field("table_id")
            .or_else(|| envelope.str_field("table_name"))
            .and_then(|reference| actions.resolve_table_id(reference))
    }

    // -- sprites ------------------------------------------------------------

    fn handle_sprite_create(
        &self,
        actions: &mut SessionActions,
        envelope: &Envelope,
    ) -> HandlerOutput {
        let Some(table_id) = self.resolve_table(actions, envelope) else {
            return table_not_found(envelope);
        };
        let Some(position) = xy_field(envelope, "position") else {
            return HandlerOutput::reply(Envelope::error(
                ErrorCode::MalformedMessage,
                "sprite_create requires a position",
            ));
        };
        let mut descriptor = EntityDescriptor::at(position);
        descriptor.name = envelope.str_field("name").map(str::to_string);
        descriptor.texture_path = envelope.str_field("texture_path").map(str::to_string);
        descriptor.character_id = envelope.str_field("character_id").map(str::to_string);
        descriptor.sprite_id = envelope
            .str_field("sprite_id")
            .and_then(|s| Uuid::parse_str(s).ok());
        if let Some(layer) = envelope.str_field("layer") {
            match layer.parse::<Layer>() {
                Ok(layer) => descriptor.layer = Some(layer),
                Err(e) => {
                    return HandlerOutput::reply(Envelope::error(
                        ErrorCode::MalformedMessage,
                        e.to_string(),
                    ));
                }
            }
        }
        if let Some(controllers) = envelope.data.get("controlled_by").and_then(Value::as_array) {
            descriptor.controlled_by = controllers
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }

        let result = actions.create_sprite(&table_id, descriptor);
        if !result.success {
            return HandlerOutput::reply(result_error(result));
        }
        let mut broadcast_data = result.data.clone();
        broadcast_data.insert("table_id".into(), table_id.to_string().into());
        HandlerOutput::reply(Envelope::success(result.data.clone())).with_broadcast(
            sprite_update("sprite_create", broadcast_data),
        )
    }

    fn handle_sprite_move(
        &self,
        actions: &mut SessionActions,
        envelope: &Envelope,
        sender: &ClientIdentity,
    ) -> HandlerOutput {
        let Some((table_id, sprite_id)) = self.sprite_target(actions, envelope) else {
            return sprite_not_found(envelope);
        };
        let Some(to) = xy_field(envelope, "to") else {
            return HandlerOutput::reply(Envelope::error(
                ErrorCode::MalformedMessage,
                "sprite_move requires a destination",
            ));
        };

        let result = actions.move_sprite(&table_id, &sprite_id, to, &sender.user_id);
        if result.success {
            let broadcast = sprite_update(
                "sprite_move",
                json!({
                    "sprite_id": sprite_id.to_string(),
                    "table_id": table_id.to_string(),
                    "to": { "x": to.x(), "y": to.y() },
                })
                .as_object()
                .cloned()
                .unwrap_or_default(),
            );
            HandlerOutput::reply(Envelope::success(Map::new())).with_broadcast(broadcast)
        } else {
            // Reconcile the sender with the authoritative position; other
            // clients never see the rejected move.
            HandlerOutput::reply(position_correction(&sprite_id, &result))
        }
    }

    fn handle_sprite_scale(
        &self,
        actions: &mut SessionActions,
        envelope: &Envelope,
        sender: &ClientIdentity,
    ) -> HandlerOutput {
        let Some((table_id, sprite_id)) = self.sprite_target(actions, envelope) else {
            return sprite_not_found(envelope);
        };
        let scale_x = f64_field(envelope, "scale_x").unwrap_or(1.0) as f32;
        let scale_y = f64_field(envelope, "scale_y").unwrap_or(1.0) as f32;
        let result = actions.scale_sprite(&table_id, &sprite_id, scale_x, scale_y, &sender.user_id);
        if !result.success {
            return HandlerOutput::reply(result_error(result));
        }
        HandlerOutput::reply(Envelope::success(Map::new())).with_broadcast(sprite_update(
            "sprite_scale",
            json!({
                "sprite_id": sprite_id.to_string(),
                "table_id": table_id.to_string(),
                "scale_x": scale_x,
                "scale_y": scale_y,
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        ))
    }

    fn handle_sprite_rotate(
        &self,
        actions: &mut SessionActions,
        envelope: &Envelope,
        sender: &ClientIdentity,
    ) -> HandlerOutput {
        let Some((table_id, sprite_id)) = self.sprite_target(actions, envelope) else {
            return sprite_not_found(envelope);
        };
        let rotation = f64_field(envelope, "rotation").unwrap_or(0.0) as f32;
        let result = actions.rotate_sprite(&table_id, &sprite_id, rotation, &sender.user_id);
        if !result.success {
            return HandlerOutput::reply(result_error(result));
        }
        HandlerOutput::reply(Envelope::success(Map::new())).with_broadcast(sprite_update(
            "sprite_rotate",
            json!({
                "sprite_id": sprite_id.to_string(),
                "table_id": table_id.to_string(),
                "rotation": rotation,
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        ))
    }

    fn handle_sprite_remove(
        &self,
        actions: &mut SessionActions,
        envelope: &Envelope,
        sender: &ClientIdentity,
    ) -> HandlerOutput {
        let Some((table_id, sprite_id)) = self.sprite_target(actions, envelope) else {
            return sprite_not_found(envelope);
        };
        let result = actions.delete_sprite(&table_id, &sprite_id, &sender.user_id);
        if !result.success {
            return HandlerOutput::reply(result_error(result));
        }
        HandlerOutput::reply(Envelope::success(Map::new())).with_broadcast(sprite_update(
            "sprite_remove",
            json!({
                "sprite_id": sprite_id.to_string(),
                "table_id": table_id.to_string(),
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        ))
    }

    fn handle_sprite_request(
        &self,
        actions: &mut SessionActions,
        envelope: &Envelope,
    ) -> HandlerOutput {
        let Some((table_id, sprite_id)) = self.sprite_target(actions, envelope) else {
            return sprite_not_found(envelope);
        };
        let entity = actions
            .tables()
            .get(&table_id)
            .and_then(|t| t.find_entity_by_sprite(&sprite_id))
            .cloned();
        match entity {
            Some(entity) => HandlerOutput::reply(Envelope::from_payload(
                MessageType::SpriteResponse,
                json!({ "table_id": table_id.to_string(), "sprite": entity }),
            )),
            None => sprite_not_found(envelope),
        }
    }

    fn sprite_target(
        &self,
        actions: &SessionActions,
        envelope: &Envelope,
    ) -> Option<(Uuid, Uuid)> {
        let table_id = self.resolve_table(actions, envelope)?;
        let sprite_id = envelope
            .str_field("sprite_id")
            .and_then(|s| Uuid::parse_str(s).ok())?;
        Some((table_id, sprite_id))
    }

    // -- characters ---------------------------------------------------------

    async fn handle_character_save(
        &mut self,
        actions: &mut SessionActions,
        envelope: &Envelope,
        sender: &ClientIdentity,
    ) -> HandlerOutput {
        let Some(body) = envelope.object_field("character") else {
            return HandlerOutput::reply(Envelope::error(
                ErrorCode::MalformedMessage,
                "character_save_request requires a character object",
            ));
        };
        let mut character: Character = match serde_json::from_value(Value::Object(body.clone())) {
            Ok(character) => character,
            Err(e) => {
                return HandlerOutput::reply(Envelope::error(
                    ErrorCode::MalformedMessage,
                    format!("unparsable character: {e}"),
                ));
            }
        };
        if character.owner_user_id.is_none() {
            character.owner_user_id = Some(sender.user_id.clone());
        }
        let result = actions.save_character(character).await;
        HandlerOutput::reply(response_from(MessageType::CharacterSaveResponse, result))
    }

    async fn handle_character_update(
        &mut self,
        actions: &mut SessionActions,
        envelope: &Envelope,
        sender: &ClientIdentity,
    ) -> HandlerOutput {
        let Some(character_id) = envelope.str_field("character_id") else {
            return HandlerOutput::reply(Envelope::from_payload(
                MessageType::CharacterUpdateResponse,
                json!({ "success": false, "error": ErrorCode::MalformedMessage.as_str() }),
            ));
        };
        let character_id = character_id.to_string();
        let updates = envelope.object_field("updates").cloned().unwrap_or_default();
        let expected_version = envelope.u64_field("version");

        let result = actions
            .update_character(&character_id, &updates, &sender.user_id, expected_version)
            .await;

        if result.success {
            let version = result.data.get("version").cloned().unwrap_or(Value::Null);
            let broadcast = Envelope::from_payload(
                MessageType::CharacterUpdate,
                json!({
                    "character_id": character_id,
                    "updates": updates,
                    "version": version.clone(),
                }),
            );
            HandlerOutput::reply(Envelope::from_payload(
                MessageType::CharacterUpdateResponse,
                json!({ "success": true, "version": version }),
            ))
            .with_broadcast(broadcast)
        } else {
            warn!(character = %character_id, error = ?result.data.get("error"), "character update rejected");
            HandlerOutput::reply(Envelope::from_payload(
                MessageType::CharacterUpdateResponse,
                json!({
                    "success": false,
                    "error": result.data.get("error").cloned().unwrap_or(Value::Null),
                }),
            ))
        }
    }

    // -- assets -------------------------------------------------------------

    fn handle_asset_upload_request(
        &mut self,
        envelope: &Envelope,
        sender: &ClientIdentity,
    ) -> HandlerOutput {
        let asset_id = envelope.str_field("asset_id").unwrap_or_default().to_string();
        let xxhash = envelope.str_field("xxhash").unwrap_or_default().to_string();
        let filename = envelope
            .str_field("filename")
            .unwrap_or("asset.bin")
            .to_string();

        if asset_id.is_empty() || asset_id != asset_id_from_hash(&xxhash) {
            return HandlerOutput::reply(Envelope::from_payload(
                MessageType::AssetUploadResponse,
                json!({
                    "success": false,
                    "error": ErrorCode::HashMismatch.as_str(),
                    "asset_id": asset_id,
                }),
            ));
        }

        let presigned = self.presigner.presign_put(&asset_id, &filename, &xxhash);
        self.assets.insert(
            asset_id.clone(),
            SessionAsset {
                asset_id: asset_id.clone(),
                filename,
                file_size: envelope.u64_field("file_size").unwrap_or(0),
                xxhash,
                content_type: envelope.str_field("content_type").map(str::to_string),
                uploaded_by: sender.user_id.clone(),
                confirmed: false,
            },
        );
        HandlerOutput::reply(Envelope::from_payload(
            MessageType::AssetUploadResponse,
            json!({
                "success": true,
                "asset_id": asset_id,
                "upload_url": presigned.upload_url,
                "required_headers": presigned.required_headers,
                "expires_at": presigned.expires_at,
            }),
        ))
    }

    fn handle_asset_upload_confirm(&mut self, envelope: &Envelope) -> HandlerOutput {
        let asset_id = envelope.str_field("asset_id").unwrap_or_default();
        let succeeded = envelope
            .data
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !self.assets.contains_key(asset_id) {
            return HandlerOutput::reply(Envelope::error(
                ErrorCode::NotFound,
                format!("no pending upload for asset '{asset_id}'"),
            ));
        }
        if succeeded {
            if let Some(asset) = self.assets.get_mut(asset_id) {
                asset.confirmed = true;
            }
            HandlerOutput::reply(Envelope::success(
                json!({ "asset_id": asset_id })
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
            ))
        } else {
            // Client reported a failed transfer; forget the request.
            let error = envelope.str_field("error").unwrap_or("upload failed");
            warn!(%asset_id, %error, "upload confirm reported failure");
            self.assets.remove(asset_id);
            HandlerOutput::reply(Envelope::error(ErrorCode::IoError, error))
        }
    }

    fn handle_asset_download_request(&mut self, envelope: &Envelope) -> HandlerOutput {
        let asset_id = envelope.str_field("asset_id").unwrap_or_default();
        let Some(asset) = self.assets.get(asset_id).filter(|a| a.confirmed) else {
            return HandlerOutput::reply(Envelope::error(
                ErrorCode::NotFound,
                format!("asset '{asset_id}' is not available in this session"),
            ));
        };
        let presigned = self.presigner.presign_get(asset_id);
        HandlerOutput::reply(Envelope::from_payload(
            MessageType::AssetDownloadResponse,
            json!({
                "asset_id": asset.asset_id,
                "download_url": presigned.download_url,
                "xxhash": asset.xxhash,
                "expires_at": presigned.expires_at,
            }),
        ))
    }

    // -- roster admin -------------------------------------------------------

    fn handle_player_kick(&self, roster: &[PlayerInfo], envelope: &Envelope) -> HandlerOutput {
        let target = find_player(roster, envelope);
        match target {
            Some(player) => {
                let mut output = HandlerOutput::reply(Envelope::from_payload(
                    MessageType::PlayerKickResponse,
                    json!({ "success": true, "client_id": player.client_id }),
                ));
                output.kick = Some(player.client_id.clone());
                output
            }
            None => HandlerOutput::reply(Envelope::from_payload(
                MessageType::PlayerKickResponse,
                json!({ "success": false, "error": ErrorCode::NotFound.as_str() }),
            )),
        }
    }

    fn handle_player_ban(&self, roster: &[PlayerInfo], envelope: &Envelope) -> HandlerOutput {
        let target = find_player(roster, envelope);
        match target {
            Some(player) => {
                let mut output = HandlerOutput::reply(Envelope::from_payload(
                    MessageType::PlayerBanResponse,
                    json!({ "success": true, "user_id": player.user_id }),
                ));
                output.kick = Some(player.client_id.clone());
                output.ban = Some(player.user_id.clone());
                output
            }
            None => HandlerOutput::reply(Envelope::from_payload(
                MessageType::PlayerBanResponse,
                json!({ "success": false, "error": ErrorCode::NotFound.as_str() }),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

fn find_player<'r>(roster: &'r [PlayerInfo], envelope: &Envelope) -> Option<&'r PlayerInfo> {
    if let Some(client_id) = envelope.str_field("target_client_id") {
        return roster.iter().find(|p| p.client_id == client_id);
    }
    if let Some(user_id) = envelope.str_field("target_user_id") {
        return roster.iter().find(|p| p.user_id == user_id);
    }
    envelope
        .str_field("username")
        .and_then(|name| roster.iter().find(|p| p.username == name))
}

/// Parse an `{x, y}` object field into a grid position.
fn xy_field(envelope: &Envelope, key: &str) -> Option<Position> {
    let obj = envelope.object_field(key)?;
    let x = obj.get("x").and_then(Value::as_u64)?;
    let y = obj.get("y").and_then(Value::as_u64)?;
    Some(Position(x as u32, y as u32))
}

fn f64_field(envelope: &Envelope, key: &str) -> Option<f64> {
    envelope.data.get(key).and_then(Value::as_f64)
}

/// Build the derived `sprite_update` broadcast.
fn sprite_update(update_type: &str, data: Map<String, Value>) -> Envelope {
    let mut outer = Map::new();
    outer.insert("type".into(), update_type.into());
    outer.insert("data".into(), Value::Object(data));
    Envelope::with_data(MessageType::SpriteUpdate, outer)
}

/// Sender-only reconciliation for a rejected sprite move.
fn position_correction(sprite_id: &Uuid, result: &ActionResult) -> Envelope {
    let position = result
        .data
        .get("position")
        .and_then(Value::as_array)
        .and_then(|pair| {
            let x = pair.first().and_then(Value::as_u64)?;
            let y = pair.get(1).and_then(Value::as_u64)?;
            Some(json!({ "x": x, "y": y }))
        })
        .unwrap_or(Value::Null);
    let mut inner = Map::new();
    inner.insert("sprite_id".into(), sprite_id.to_string().into());
    inner.insert("position".into(), position);
    inner.insert(
        "reason".into(),
        result
            .data
            .get("error")
            .cloned()
            .unwrap_or_else(|| ErrorCode::TargetOccupied.as_str().into()),
    );
    sprite_update("position_correction", inner)
}

/// Convert an [`ActionResult`] into a typed response envelope, carrying the
/// payload on success and the error tag on failure.
fn response_from(kind: MessageType, result: ActionResult) -> Envelope {
    let mut data = result.data;
    data.insert("success".into(), result.success.into());
    if !result.success {
        data.entry("message")
            .or_insert_with(|| result.message.clone().into());
    }
    Envelope::with_data(kind, data)
}

fn result_error(result: ActionResult) -> Envelope {
    let code = result.error_code().unwrap_or(ErrorCode::Internal);
    Envelope::error(code, result.message)
}

fn table_not_found(envelope: &Envelope) -> HandlerOutput {
    let reference = envelope
        .str_field("table_id")
        .or_else(|| envelope.str_field("table_name"))
        .unwrap_or("<missing>");
    HandlerOutput::reply(Envelope::error(
        ErrorCode::NotFound,
        format!("table '{reference}' not found"),
    ))
}

fn sprite_not_found(envelope: &Envelope) -> HandlerOutput {
    let sprite = envelope.str_field("sprite_id").unwrap_or("<missing>");
    HandlerOutput::reply(Envelope::error(
        ErrorCode::NotFound,
        format!("sprite '{sprite}' not found"),
    ))
}
