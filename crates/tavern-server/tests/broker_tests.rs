// SPDX-License-Identifier: MIT OR Apache-2.0
//! Broker behavior driven through the session handle, no sockets involved.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tavern_actions::MemoryStore;
use tavern_protocol::{Envelope, MessageType, WireCodec};
use tavern_server::{BrokerTiming, LocalPresigner, SessionBroker, SessionCommand, SessionHandle};
use tokio::sync::mpsc;

struct TestClient {
    client_id: String,
    rx: mpsc::UnboundedReceiver<String>,
}

impl TestClient {
    async fn join(session: &SessionHandle, client_id: &str, user_id: &str, name: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        assert!(
            session
                .send(SessionCommand::Join {
                    client_id: client_id.to_string(),
                    user_id: user_id.to_string(),
                    username: name.to_string(),
                    outbound: tx,
                })
                .await
        );
        let mut client = Self {
            client_id: client_id.to_string(),
            rx,
        };
        let welcome = client.recv().await;
        assert_eq!(welcome.kind, MessageType::Welcome);
        client
    }

    async fn recv(&mut self) -> Envelope {
        let text = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("broker dropped the client");
        WireCodec::decode(&text).expect("server sent undecodable frame")
    }

    /// Receive, skipping roster notifications and keepalive pings.
    async fn recv_non_system(&mut self) -> Envelope {
        loop {
            let envelope = self.recv().await;
            match envelope.kind {
                MessageType::PlayerJoined | MessageType::PlayerLeft | MessageType::Ping => {}
                _ => return envelope,
            }
        }
    }

    async fn send(&self, session: &SessionHandle, envelope: &Envelope) {
        let text = WireCodec::encode(envelope).unwrap();
        assert!(
            session
                .send(SessionCommand::Frame {
                    client_id: self.client_id.clone(),
                    text,
                })
                .await
        );
    }

    fn try_recv_kind(&mut self) -> Option<MessageType> {
        self.rx
            .try_recv()
            .ok()
            .map(|text| WireCodec::decode(&text).unwrap().kind)
    }
}

fn spawn_session(code: &str, timing: BrokerTiming) -> SessionHandle {
    let store = Arc::new(MemoryStore::new());
    let presigner = Arc::new(LocalPresigner::new("http://blobs.test", 900));
    SessionBroker::spawn(code, store.clone(), store, presigner, timing)
}

fn envelope(kind: MessageType, data: serde_json::Value) -> Envelope {
    Envelope::with_data(kind, data.as_object().cloned().unwrap_or_default())
}

async fn create_table(
    session: &SessionHandle,
    client: &mut TestClient,
    name: &str,
) -> (String, serde_json::Value) {
    client
        .send(
            session,
            &envelope(
                MessageType::NewTableRequest,
                json!({"table_name": name, "width": 20, "height": 20}),
            ),
        )
        .await;
    let response = client.recv_non_system().await;
    assert_eq!(response.kind, MessageType::NewTableResponse);
    assert_eq!(response.data["success"], true);
    let table_data = response.data["table_data"].clone();
    (table_data["table_id"].as_str().unwrap().to_string(), table_data)
}

async fn create_sprite(
    session: &SessionHandle,
    client: &mut TestClient,
    table_id: &str,
    x: u32,
    y: u32,
) -> String {
    client
        .send(
            session,
            &envelope(
                MessageType::SpriteCreate,
                json!({"table_id": table_id, "position": {"x": x, "y": y}}),
            ),
        )
        .await;
    let reply = client.recv_non_system().await;
    assert_eq!(reply.kind, MessageType::Success, "{reply:?}");
    reply.data["sprite_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn welcome_names_the_session_and_tables() {
    let session = spawn_session("s1", BrokerTiming::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    session
        .send(SessionCommand::Join {
            client_id: "aaaa000011112222".into(),
            user_id: "7".into(),
            username: "mira".into(),
            outbound: tx,
        })
        .await;
    let welcome = WireCodec::decode(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(welcome.kind, MessageType::Welcome);
    assert_eq!(welcome.data["session_code"], "s1");
    assert_eq!(welcome.data["client_id"], "aaaa000011112222");
    assert_eq!(welcome.data["username"], "mira");
    assert!(welcome.data["tables"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn table_create_then_list_includes_it() {
    let session = spawn_session("s1", BrokerTiming::default());
    let mut c1 = TestClient::join(&session, "c1c1c1c1c1c1c1c1", "1", "alice").await;

    let (_, table_data) = create_table(&session, &mut c1, "demo").await;
    assert_eq!(table_data["name"], "demo");
    assert!(table_data["table_id"].as_str().unwrap().len() >= 32);

    c1.send(&session, &envelope(MessageType::TableListRequest, json!({})))
        .await;
    let list = c1.recv_non_system().await;
    assert_eq!(list.kind, MessageType::TableListResponse);
    assert_eq!(list.data["tables"], json!(["demo"]));
}

#[tokio::test]
async fn rejected_move_corrects_only_the_sender() {
    let session = spawn_session("s1", BrokerTiming::default());
    let mut c1 = TestClient::join(&session, "c1c1c1c1c1c1c1c1", "1", "alice").await;
    let mut c2 = TestClient::join(&session, "c2c2c2c2c2c2c2c2", "2", "bob").await;

    let (table_id, _) = create_table(&session, &mut c1, "t").await;
    let sprite_a = create_sprite(&session, &mut c1, &table_id, 2, 3).await;
    let _sprite_b = create_sprite(&session, &mut c1, &table_id, 5, 6).await;

    // Drain C2's copies of the two sprite_create broadcasts.
    for _ in 0..2 {
        let update = c2.recv_non_system().await;
        assert_eq!(update.kind, MessageType::SpriteUpdate);
        assert_eq!(update.data["type"], "sprite_create");
    }

    c1.send(
        &session,
        &envelope(
            MessageType::SpriteMove,
            json!({
                "table_id": table_id,
                "sprite_id": sprite_a,
                "from": {"x": 2, "y": 3},
                "to": {"x": 5, "y": 6},
            }),
        ),
    )
    .await;

    let correction = c1.recv_non_system().await;
    assert_eq!(correction.kind, MessageType::SpriteUpdate);
    assert_eq!(correction.data["type"], "position_correction");
    let inner = &correction.data["data"];
    assert_eq!(inner["sprite_id"], json!(sprite_a));
    assert_eq!(inner["position"], json!({"x": 2, "y": 3}));
    assert_eq!(inner["reason"], "target_occupied");

    // No broadcast reached the other client.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(c2.try_recv_kind(), None);
}

#[tokio::test]
async fn accepted_move_fans_out_to_everyone_else() {
    let session = spawn_session("s1", BrokerTiming::default());
    let mut c1 = TestClient::join(&session, "c1c1c1c1c1c1c1c1", "1", "alice").await;
    let mut c2 = TestClient::join(&session, "c2c2c2c2c2c2c2c2", "2", "bob").await;
    let mut c3 = TestClient::join(&session, "c3c3c3c3c3c3c3c3", "3", "eve").await;

    let (table_id, _) = create_table(&session, &mut c1, "t").await;
    let sprite = create_sprite(&session, &mut c1, &table_id, 2, 3).await;
    // Drain the create broadcast at the observers.
    for client in [&mut c2, &mut c3] {
        let update = client.recv_non_system().await;
        assert_eq!(update.data["type"], "sprite_create");
    }

    c1.send(
        &session,
        &envelope(
            MessageType::SpriteMove,
            json!({
                "table_id": table_id,
                "sprite_id": sprite,
                "from": {"x": 2, "y": 3},
                "to": {"x": 3, "y": 3},
            }),
        ),
    )
    .await;
    let ack = c1.recv_non_system().await;
    assert_eq!(ack.kind, MessageType::Success);

    for client in [&mut c2, &mut c3] {
        let update = client.recv_non_system().await;
        assert_eq!(update.kind, MessageType::SpriteUpdate);
        assert_eq!(update.data["type"], "sprite_move");
        let inner = &update.data["data"];
        assert_eq!(inner["sprite_id"], json!(sprite));
        assert_eq!(inner["to"], json!({"x": 3, "y": 3}));
    }
    // The mover received only its ack, not its own broadcast.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(c1.try_recv_kind(), None);
}

#[tokio::test]
async fn malformed_frames_answer_errors_and_keep_the_session_open() {
    let session = spawn_session("s1", BrokerTiming::default());
    let mut c1 = TestClient::join(&session, "c1c1c1c1c1c1c1c1", "1", "alice").await;

    session
        .send(SessionCommand::Frame {
            client_id: c1.client_id.clone(),
            text: "{definitely not json".into(),
        })
        .await;
    let error = c1.recv_non_system().await;
    assert_eq!(error.kind, MessageType::Error);
    assert_eq!(error.data["error"], "malformed_message");
    // The failure report ships its diagnostics along.
    assert_eq!(error.data["detail"]["frame_bytes"], "20");
    assert!(error.data["cause"].as_str().is_some());

    c1.send(&session, &envelope(MessageType::Ping, json!({}))).await;
    assert_eq!(c1.recv_non_system().await.kind, MessageType::Pong);
}

#[tokio::test]
async fn duplicate_sequence_ids_are_dropped() {
    let session = spawn_session("s1", BrokerTiming::default());
    let mut c1 = TestClient::join(&session, "c1c1c1c1c1c1c1c1", "1", "alice").await;

    let mut ping = envelope(MessageType::Ping, json!({}));
    ping.client_id = Some(c1.client_id.clone());
    ping.sequence_id = Some(41);

    c1.send(&session, &ping).await;
    assert_eq!(c1.recv_non_system().await.kind, MessageType::Pong);

    c1.send(&session, &ping).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(c1.try_recv_kind(), None);
}

#[tokio::test]
async fn batch_processes_in_order_and_reports_per_item() {
    let session = spawn_session("s1", BrokerTiming::default());
    let mut c1 = TestClient::join(&session, "c1c1c1c1c1c1c1c1", "1", "alice").await;

    let batch = tavern_protocol::BatchEnvelope::from_envelopes(
        &[
            envelope(
                MessageType::NewTableRequest,
                json!({"table_name": "batched", "width": 10, "height": 10}),
            ),
            envelope(MessageType::TableRequest, json!({"table_id": "nope"})),
            envelope(MessageType::TableListRequest, json!({})),
        ],
        3,
    )
    .unwrap();
    session
        .send(SessionCommand::Frame {
            client_id: c1.client_id.clone(),
            text: serde_json::to_string(&batch).unwrap(),
        })
        .await;

    let summary = c1.recv_non_system().await;
    assert_eq!(summary.kind, MessageType::Success);
    assert_eq!(summary.data["batch_seq"], 3);
    let results = summary.data["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["success"], true);
    // The missing table fails its item without aborting the batch.
    assert_eq!(results[1]["success"], false);
    assert_eq!(results[2]["success"], true);
    let tables = &results[2]["reply"]["data"]["tables"];
    assert_eq!(tables, &json!(["batched"]));
}

#[tokio::test]
async fn stale_clients_are_reaped_within_one_interval() {
    let timing = BrokerTiming {
        keepalive: Duration::from_millis(50),
        reap_interval: Duration::from_millis(100),
        client_timeout: Duration::from_millis(200),
        save_debounce: Duration::from_millis(50),
    };
    let session = spawn_session("s1", timing);
    let mut quiet = TestClient::join(&session, "c1c1c1c1c1c1c1c1", "1", "alice").await;
    let mut chatty = TestClient::join(&session, "c2c2c2c2c2c2c2c2", "2", "bob").await;

    // Keep one client fresh; let the other go silent.
    for _ in 0..6 {
        chatty
            .send(&session, &envelope(MessageType::Ping, json!({})))
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    let stats = session.stats().await.unwrap();
    assert_eq!(stats.connected_clients, 1);
    assert_eq!(stats.players[0].client_id, chatty.client_id);

    // The broker dropped the reaped client's sender; after draining any
    // buffered keepalives the channel reports closed.
    while quiet.try_recv_kind().is_some() {}
    assert!(quiet.rx.recv().await.is_none());
}

#[tokio::test]
async fn kick_removes_and_notifies_the_target() {
    let session = spawn_session("s1", BrokerTiming::default());
    let mut admin = TestClient::join(&session, "c1c1c1c1c1c1c1c1", "1", "dm").await;
    let mut target = TestClient::join(&session, "c2c2c2c2c2c2c2c2", "2", "rowdy").await;

    admin
        .send(
            &session,
            &envelope(
                MessageType::PlayerKickRequest,
                json!({"target_client_id": target.client_id}),
            ),
        )
        .await;
    let response = admin.recv_non_system().await;
    assert_eq!(response.kind, MessageType::PlayerKickResponse);
    assert_eq!(response.data["success"], true);

    let notice = target.recv_non_system().await;
    assert_eq!(notice.kind, MessageType::Error);
    assert_eq!(notice.data["error"], "session_closed");
    assert!(target.rx.recv().await.is_none());

    let stats = session.stats().await.unwrap();
    assert_eq!(stats.connected_clients, 1);
}

#[tokio::test]
async fn banned_user_cannot_rejoin() {
    let session = spawn_session("s1", BrokerTiming::default());
    let mut admin = TestClient::join(&session, "c1c1c1c1c1c1c1c1", "1", "dm").await;
    let target = TestClient::join(&session, "c2c2c2c2c2c2c2c2", "666", "rowdy").await;
    drop(target);

    admin
        .send(
            &session,
            &envelope(
                MessageType::PlayerBanRequest,
                json!({"target_user_id": "666"}),
            ),
        )
        .await;
    let response = admin.recv_non_system().await;
    assert_eq!(response.kind, MessageType::PlayerBanResponse);
    assert_eq!(response.data["success"], true);

    // Rejoin under a fresh client id is denied.
    let (tx, mut rx) = mpsc::unbounded_channel();
    session
        .send(SessionCommand::Join {
            client_id: "c9c9c9c9c9c9c9c9".into(),
            user_id: "666".into(),
            username: "rowdy2".into(),
            outbound: tx,
        })
        .await;
    let denial = WireCodec::decode(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(denial.kind, MessageType::Error);
    assert_eq!(denial.data["error"], "unauthorized");
}

#[tokio::test]
async fn asset_upload_flow_presigns_and_confirms() {
    let session = spawn_session("s1", BrokerTiming::default());
    let mut c1 = TestClient::join(&session, "c1c1c1c1c1c1c1c1", "1", "alice").await;

    let xxhash = "cafe0123cafe0123";
    c1.send(
        &session,
        &envelope(
            MessageType::AssetUploadRequest,
            json!({
                "filename": "map.png",
                "file_size": 1234,
                "xxhash": xxhash,
                "asset_id": xxhash,
                "content_type": "image/png",
            }),
        ),
    )
    .await;
    let response = c1.recv_non_system().await;
    assert_eq!(response.kind, MessageType::AssetUploadResponse);
    assert_eq!(response.data["success"], true);
    assert!(response.data["upload_url"].as_str().unwrap().contains(xxhash));
    let headers = response.data["required_headers"].as_array().unwrap();
    assert!(headers.iter().any(|h| h[0] == "x-amz-meta-xxhash"));

    // Unconfirmed assets are not listed or downloadable.
    c1.send(&session, &envelope(MessageType::AssetListRequest, json!({})))
        .await;
    let listing = c1.recv_non_system().await;
    assert!(listing.data["assets"].as_array().unwrap().is_empty());

    c1.send(
        &session,
        &envelope(
            MessageType::AssetUploadConfirm,
            json!({"asset_id": xxhash, "xxhash": xxhash, "success": true}),
        ),
    )
    .await;
    assert_eq!(c1.recv_non_system().await.kind, MessageType::Success);

    c1.send(
        &session,
        &envelope(MessageType::AssetDownloadRequest, json!({"asset_id": xxhash})),
    )
    .await;
    let download = c1.recv_non_system().await;
    assert_eq!(download.kind, MessageType::AssetDownloadResponse);
    assert_eq!(download.data["xxhash"], xxhash);
    assert!(download.data["download_url"].as_str().unwrap().contains(xxhash));
}

#[tokio::test]
async fn asset_upload_request_rejects_mismatched_id() {
    let session = spawn_session("s1", BrokerTiming::default());
    let mut c1 = TestClient::join(&session, "c1c1c1c1c1c1c1c1", "1", "alice").await;

    c1.send(
        &session,
        &envelope(
            MessageType::AssetUploadRequest,
            json!({
                "filename": "map.png",
                "xxhash": "cafe0123cafe0123",
                "asset_id": "0000000000000000",
            }),
        ),
    )
    .await;
    let response = c1.recv_non_system().await;
    assert_eq!(response.kind, MessageType::AssetUploadResponse);
    assert_eq!(response.data["success"], false);
    assert_eq!(response.data["error"], "hash_mismatch");
}

#[tokio::test]
async fn character_update_conflicts_resolve_to_one_winner() {
    let session = spawn_session("s1", BrokerTiming::default());
    let mut c1 = TestClient::join(&session, "c1c1c1c1c1c1c1c1", "1", "alice").await;
    let mut c2 = TestClient::join(&session, "c2c2c2c2c2c2c2c2", "2", "bob").await;

    c1.send(
        &session,
        &envelope(
            MessageType::CharacterSaveRequest,
            json!({"character": {"character_id": "char-123", "name": "Mira", "version": 4, "owner_user_id": null}}),
        ),
    )
    .await;
    let saved = c1.recv_non_system().await;
    assert_eq!(saved.kind, MessageType::CharacterSaveResponse);

    // Two in-flight updates both based on version 4: exactly one wins.
    for hp in [30, 10] {
        c1.send(
            &session,
            &envelope(
                MessageType::CharacterUpdate,
                json!({"character_id": "char-123", "updates": {"hp": hp}, "version": 4}),
            ),
        )
        .await;
    }

    let first = c1.recv_non_system().await;
    assert_eq!(first.kind, MessageType::CharacterUpdateResponse);
    assert_eq!(first.data["success"], true);
    assert_eq!(first.data["version"], 5);

    let second = c1.recv_non_system().await;
    assert_eq!(second.kind, MessageType::CharacterUpdateResponse);
    assert_eq!(second.data["success"], false);
    assert_eq!(second.data["error"], "version_conflict");

    // Observers see exactly one derived update, for the accepted write.
    let seen = c2.recv_non_system().await;
    assert_eq!(seen.kind, MessageType::CharacterUpdate);
    assert_eq!(seen.data["version"], 5);
    assert_eq!(seen.data["updates"], json!({"hp": 30}));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(c2.try_recv_kind(), None);
}

#[tokio::test]
async fn character_save_defaults_owner_to_sender() {
    let session = spawn_session("s1", BrokerTiming::default());
    let mut owner = TestClient::join(&session, "c1c1c1c1c1c1c1c1", "alice", "alice").await;
    let mut other = TestClient::join(&session, "c2c2c2c2c2c2c2c2", "bob", "bob").await;

    owner
        .send(
            &session,
            &envelope(
                MessageType::CharacterSaveRequest,
                json!({"character": {"character_id": "char-9", "name": "Mira"}}),
            ),
        )
        .await;
    owner.recv_non_system().await;

    // A different user may not update the owned character.
    other
        .send(
            &session,
            &envelope(
                MessageType::CharacterUpdate,
                json!({"character_id": "char-9", "updates": {"hp": 1}}),
            ),
        )
        .await;
    let rejected = other.recv_non_system().await;
    assert_eq!(rejected.kind, MessageType::CharacterUpdateResponse);
    assert_eq!(rejected.data["success"], false);
    assert_eq!(rejected.data["error"], "unauthorized");
}
