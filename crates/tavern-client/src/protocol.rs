// SPDX-License-Identifier: MIT OR Apache-2.0
//! Inbound dispatch: the mirror image of the server's handler table.
//!
//! Every inbound mutation is applied to the local projection with
//! `to_server = false`, so reconciliation never re-emits the same change
//! back to the server.

use serde_json::{Map, Value, json};
use tavern_actions::{Character, CharacterRegistry, TokenStats};
use tavern_protocol::{BatchEnvelope, Envelope, MessageType, Router};
use tavern_table::{Entity, Position, TableSnapshot};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::actions::{ClientActions, table_from_snapshot};
use crate::assets::AssetCoordinator;
use crate::session::{ClientSession, Notice, SendFn};

/// The client-side protocol engine.
///
/// Owns the outbound session, the local table projection, the character
/// cache, and the asset coordinator. Feed inbound envelopes through
/// [`ClientProtocol::handle_envelope`] and drain asset I/O with
/// [`ClientProtocol::poll_io`] from the main loop.
pub struct ClientProtocol {
    session: ClientSession,
    actions: ClientActions,
    characters: CharacterRegistry,
    assets: AssetCoordinator,
    extensions: Router<ClientActions>,
    notices: mpsc::UnboundedSender<Notice>,
    available_tables: Vec<String>,
}

impl ClientProtocol {
    /// Protocol for `session_code`, emitting notices on the returned
    /// receiver.
    pub fn new(
        session_code: impl Into<String>,
        user_id: impl Into<String>,
        username: impl Into<String>,
        send: SendFn,
        assets: AssetCoordinator,
    ) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (notices, notices_rx) = mpsc::unbounded_channel();
        (
            Self {
                session: ClientSession::new(session_code, user_id, username, send),
                actions: ClientActions::new(),
                characters: CharacterRegistry::new(),
                assets,
                extensions: Router::new(),
                notices,
                available_tables: Vec::new(),
            },
            notices_rx,
        )
    }

    /// The outbound session identity.
    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    /// The local table projection.
    pub fn actions(&self) -> &ClientActions {
        &self.actions
    }

    /// The local character cache.
    pub fn characters(&self) -> &CharacterRegistry {
        &self.characters
    }

    /// Table names the server reported.
    pub fn available_tables(&self) -> &[String] {
        &self.available_tables
    }

    /// Whether an asset is registered and present in the local cache.
    pub fn cache_contains(&mut self, asset_id: &str) -> bool {
        self.assets.cache().is_cached(asset_id)
    }

    /// Register an extension handler (compendium lookups, `custom`).
    pub fn register_handler<F>(&mut self, kind: MessageType, handler: F)
    where
        F: Fn(&mut ClientActions, &Envelope, Option<&str>) -> Option<Envelope>
            + Send
            + Sync
            + 'static,
    {
        self.extensions.register(kind, handler);
    }

    fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }

    // -- outbound requests ---------------------------------------------------

    /// Ask for the table list.
    pub fn request_table_list(&self) {
        self.session.send(MessageType::TableListRequest, Map::new());
    }

    /// Ask for one table by name or id.
    pub fn request_table(&self, reference: &str) {
        self.session.send_payload(
            MessageType::TableRequest,
            json!({ "table_id": reference }),
        );
    }

    /// Ask the server to create a table.
    pub fn request_new_table(&self, name: &str, width: u32, height: u32) {
        self.session.send_payload(
            MessageType::NewTableRequest,
            json!({ "table_name": name, "width": width, "height": height }),
        );
    }

    /// User-initiated sprite move: optimistic local apply plus request.
    pub fn move_sprite(&mut self, table_id: &Uuid, sprite_id: &Uuid, to: Position) {
        self.actions
            .move_sprite(&self.session, table_id, sprite_id, to, true);
    }

    /// User-initiated sprite creation.
    pub fn create_sprite(
        &mut self,
        table_id: &Uuid,
        descriptor: tavern_table::EntityDescriptor,
    ) -> Option<Uuid> {
        let result = self
            .actions
            .create_sprite(&self.session, table_id, descriptor, true);
        result
            .data
            .get("sprite_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Versioned character update request.
    pub fn update_character(
        &self,
        character_id: &str,
        updates: Map<String, Value>,
        expected_version: u64,
    ) {
        self.session.send_payload(
            MessageType::CharacterUpdate,
            json!({
                "character_id": character_id,
                "updates": updates,
                "version": expected_version,
            }),
        );
    }

    /// Persist a character sheet on the server.
    pub fn save_character(&self, character: &Character) {
        self.session.send_payload(
            MessageType::CharacterSaveRequest,
            json!({ "character": character }),
        );
    }

    /// Fetch a character sheet; the response lands in the local cache.
    pub fn load_character(&self, character_id: &str) {
        self.session.send_payload(
            MessageType::CharacterLoadRequest,
            json!({ "character_id": character_id }),
        );
    }

    /// Ask for the session's character ids.
    pub fn list_characters(&self) {
        self.session
            .send(MessageType::CharacterListRequest, Map::new());
    }

    /// Delete a character sheet on the server.
    pub fn delete_character(&self, character_id: &str) {
        self.session.send_payload(
            MessageType::CharacterDeleteRequest,
            json!({ "character_id": character_id }),
        );
    }

    /// Start an asset upload.
    pub fn upload_asset(&mut self, path: &std::path::Path) {
        match self.assets.begin_upload(&self.session, path) {
            Ok(Some(notice)) => self.notify(notice),
            Ok(None) => {}
            Err(e) => self.notify(Notice::AssetFailed {
                asset_id: String::new(),
                reason: e.to_string(),
            }),
        }
    }

    /// Fetch an asset, serving from cache when possible.
    pub fn download_asset(&mut self, asset_id: &str) {
        match self.assets.request_download(&self.session, asset_id) {
            Ok(Some(notice)) => self.notify(notice),
            Ok(None) => {}
            Err(e) => self.notify(Notice::AssetFailed {
                asset_id: asset_id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    // -- io draining ---------------------------------------------------------

    /// Drain asset transfers; call from the main loop.
    pub fn poll_io(&mut self) -> Vec<tavern_io::IoCompletion> {
        let (notices, passthrough) = self.assets.poll(&self.session);
        for notice in notices {
            self.notify(notice);
        }
        passthrough
    }

    // -- inbound dispatch ----------------------------------------------------

    /// Apply one inbound envelope.
    pub fn handle_envelope(&mut self, envelope: &Envelope) {
        match envelope.kind {
            MessageType::Welcome => self.on_welcome(envelope),
            // Server keepalive; answering it is a liveness reply, not an
            // echoed mutation.
            MessageType::Ping => {
                let mut data = Map::new();
                data.insert("timestamp".into(), tavern_protocol::now_epoch().into());
                self.session.send(MessageType::Pong, data);
            }
            MessageType::Pong => debug!("pong received"),

            MessageType::NewTableResponse | MessageType::TableResponse => {
                self.on_table_payload(envelope.object_field("table_data"));
            }
            MessageType::TableData => {
                // Legacy servers send the snapshot at the top level.
                let payload = envelope
                    .object_field("table_data")
                    .unwrap_or(&envelope.data);
                self.on_table_payload(Some(payload));
            }
            MessageType::TableListResponse => {
                self.available_tables = envelope
                    .data
                    .get("tables")
                    .and_then(Value::as_array)
                    .map(|names| {
                        names
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
            }
            MessageType::TableUpdate | MessageType::TableScale | MessageType::TableMove => {
                if let Some(table_id) = self.table_ref(envelope) {
                    self.actions.update_table_view(
                        &self.session,
                        &table_id,
                        envelope.kind,
                        &envelope.data,
                        false,
                    );
                }
            }
            MessageType::TableDelete => {
                if let Some(table_id) = self.table_ref(envelope) {
                    self.actions.remove_table(&table_id);
                }
            }

            MessageType::SpriteUpdate => self.on_sprite_update(envelope),
            MessageType::SpriteData | MessageType::SpriteResponse => {
                self.on_sprite_payload(envelope);
            }

            MessageType::PlayerJoined | MessageType::PlayerLeft => {
                let username = envelope.str_field("username").unwrap_or("?").to_string();
                self.notify(Notice::Roster {
                    username,
                    joined: envelope.kind == MessageType::PlayerJoined,
                });
            }

            MessageType::CharacterUpdate => self.on_character_update(envelope),
            MessageType::CharacterUpdateResponse => {
                if envelope.data.get("success") == Some(&Value::Bool(false)) {
                    let code = envelope
                        .str_field("error")
                        .unwrap_or("character update failed")
                        .to_string();
                    self.notify(Notice::ServerError {
                        code,
                        message: "character update rejected".into(),
                    });
                }
            }
            MessageType::CharacterLoadResponse => {
                if let Some(body) = envelope.object_field("character")
                    && let Ok(character) =
                        serde_json::from_value::<Character>(Value::Object(body.clone()))
                {
                    self.characters.upsert(character);
                }
            }

            MessageType::AssetUploadResponse => {
                if let Some(notice) = self.assets.on_upload_response(&envelope.data) {
                    self.notify(notice);
                }
            }
            MessageType::AssetDownloadResponse => {
                if let Some(notice) = self.assets.on_download_response(&envelope.data) {
                    self.notify(notice);
                }
            }

            MessageType::Error => {
                let code = envelope.str_field("error").unwrap_or("internal").to_string();
                let message = envelope.str_field("message").unwrap_or_default().to_string();
                warn!(%code, %message, "server error");
                self.notify(Notice::ServerError { code, message });
            }

            MessageType::Batch => {
                if let Ok(batch) =
                    serde_json::from_value::<BatchEnvelope>(Value::Object(envelope.data.clone()))
                {
                    for inner in batch.decode_messages().into_iter().flatten() {
                        self.handle_envelope(&inner);
                    }
                }
            }

            other => {
                if self.extensions.handles(other) {
                    if let Some(reply) =
                        self.extensions
                            .dispatch(&mut self.actions, envelope, None)
                    {
                        self.session.send(reply.kind, reply.data);
                    }
                } else {
                    debug!(kind = %other, "ignoring unhandled message");
                }
            }
        }
    }

    fn on_welcome(&mut self, envelope: &Envelope) {
        if let Some(client_id) = envelope.str_field("client_id") {
            self.session.adopt_client_id(client_id);
        }
        let tables: Vec<String> = envelope
            .data
            .get("tables")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        self.available_tables = tables.clone();
        let session_code = envelope
            .str_field("session_code")
            .unwrap_or(&self.session.session_code)
            .to_string();
        self.notify(Notice::Connected {
            session_code,
            tables,
        });
    }

    fn on_table_payload(&mut self, payload: Option<&Map<String, Value>>) {
        let Some(payload) = payload else {
            return;
        };
        match serde_json::from_value::<TableSnapshot>(Value::Object(payload.clone())) {
            Ok(snapshot) => match table_from_snapshot(snapshot) {
                Ok(table) => self.actions.upsert_table(table),
                Err(e) => warn!(error = %e, "unusable table snapshot"),
            },
            Err(e) => warn!(error = %e, "undecodable table snapshot"),
        }
    }

    fn on_sprite_update(&mut self, envelope: &Envelope) {
        let update_type = envelope.str_field("type").unwrap_or_default().to_string();
        let Some(inner) = envelope.object_field("data").cloned() else {
            return;
        };
        let table_id = inner
            .get("table_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        let sprite_id = inner
            .get("sprite_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());

        match update_type.as_str() {
            "sprite_move" => {
                let (Some(table_id), Some(sprite_id), Some(to)) =
                    (table_id, sprite_id, xy(&inner, "to"))
                else {
                    return;
                };
                self.actions
                    .move_sprite(&self.session, &table_id, &sprite_id, to, false);
            }
            "position_correction" => {
                let Some(sprite_id) = sprite_id else { return };
                let position = xy(&inner, "position");
                if let (Some(table_id), Some(position)) = (self.any_table_with(&sprite_id), position)
                {
                    self.actions.force_position(&table_id, &sprite_id, position);
                }
                let reason = inner
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("rejected")
                    .to_string();
                self.notify(Notice::PositionCorrected {
                    sprite_id: sprite_id.to_string(),
                    position: position.map(|p| (p.x(), p.y())),
                    reason,
                });
            }
            "sprite_create" => {
                let Some(table_id) = table_id else { return };
                if let Some(entity) = inner
                    .get("sprite")
                    .cloned()
                    .and_then(|v| serde_json::from_value::<Entity>(v).ok())
                {
                    self.actions.apply_remote_sprite(&table_id, entity);
                }
            }
            "sprite_scale" => {
                let (Some(table_id), Some(sprite_id)) = (table_id, sprite_id) else {
                    return;
                };
                let sx = inner.get("scale_x").and_then(Value::as_f64).unwrap_or(1.0) as f32;
                let sy = inner.get("scale_y").and_then(Value::as_f64).unwrap_or(1.0) as f32;
                self.actions
                    .scale_sprite(&self.session, &table_id, &sprite_id, sx, sy, false);
            }
            "sprite_rotate" => {
                let (Some(table_id), Some(sprite_id)) = (table_id, sprite_id) else {
                    return;
                };
                let rotation = inner.get("rotation").and_then(Value::as_f64).unwrap_or(0.0) as f32;
                self.actions
                    .rotate_sprite(&self.session, &table_id, &sprite_id, rotation, false);
            }
            "sprite_remove" => {
                let (Some(table_id), Some(sprite_id)) = (table_id, sprite_id) else {
                    return;
                };
                self.actions
                    .delete_sprite(&self.session, &table_id, &sprite_id, false);
            }
            other => debug!(update_type = other, "ignoring unknown sprite update"),
        }
    }

    fn on_sprite_payload(&mut self, envelope: &Envelope) {
        let Some(table_id) = self.table_ref(envelope) else {
            return;
        };
        if let Some(entity) = envelope
            .data
            .get("sprite")
            .cloned()
            .and_then(|v| serde_json::from_value::<Entity>(v).ok())
        {
            self.actions.apply_remote_sprite(&table_id, entity);
        }
    }

    fn on_character_update(&mut self, envelope: &Envelope) {
        let Some(character_id) = envelope.str_field("character_id") else {
            return;
        };
        let character_id = character_id.to_string();
        let updates = envelope.object_field("updates").cloned().unwrap_or_default();
        let version = envelope.u64_field("version");

        // Reconcile the local sheet without ownership or version checks:
        // the server already arbitrated this write.
        if self.characters.get(&character_id).is_none() {
            self.characters
                .upsert(Character::new(character_id.clone(), character_id.clone()));
        }
        self.characters.force_update(&character_id, &updates, version);

        let stats = TokenStats::from_updates(&updates);
        if !stats.is_empty() {
            let synced = self.actions.sync_character_stats(&character_id, stats);
            debug!(character = %character_id, synced, "token stats reconciled");
        }
    }

    fn table_ref(&self, envelope: &Envelope) -> Option<Uuid> {
        envelope
            .str_field("table_id")
            .and_then(|s| Uuid::parse_str(s).ok())
            .or_else(|| {
                envelope
                    .str_field("table_name")
                    .and_then(|name| self.actions.tables().id_for_name(name))
            })
    }

    fn any_table_with(&self, sprite_id: &Uuid) -> Option<Uuid> {
        self.actions
            .tables()
            .iter()
            .find(|t| t.find_entity_by_sprite(sprite_id).is_some())
            .map(|t| t.table_id)
    }
}

fn xy(map: &Map<String, Value>, key: &str) -> Option<Position> {
    let obj = map.get(key)?.as_object()?;
    let x = obj.get("x").and_then(Value::as_u64)?;
    let y = obj.get("y").and_then(Value::as_u64)?;
    Some(Position(x as u32, y as u32))
}
