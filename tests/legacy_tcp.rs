// SPDX-License-Identifier: MIT OR Apache-2.0
//! The newline-delimited legacy transport speaks the same envelopes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tavern_actions::MemoryStore;
use tavern_protocol::{Envelope, MessageType, now_epoch};
use tavern_server::{
    AppState, BrokerTiming, ConnectionManager, LocalPresigner, serve_legacy_tcp,
};

fn envelope(kind: MessageType, data: serde_json::Value) -> Envelope {
    Envelope::with_data(kind, data.as_object().cloned().unwrap_or_default())
}

async fn spawn_legacy_server() -> std::net::SocketAddr {
    let store = Arc::new(MemoryStore::new());
    let presigner = Arc::new(LocalPresigner::new("http://blobs.test", 900));
    let manager =
        ConnectionManager::new(store.clone(), store, presigner, BrokerTiming::default());
    let state = Arc::new(AppState {
        manager,
        started_at: now_epoch(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = serve_legacy_tcp(listener, state).await;
    });
    addr
}

#[tokio::test]
async fn attach_then_speak_the_same_protocol() {
    let addr = spawn_legacy_server().await;
    let mut transport = tavern_client::connect_tcp(&addr.to_string()).await.unwrap();

    (transport.send)(envelope(
        MessageType::AuthToken,
        json!({
            "session_code": "legacy",
            "client_id": "feedbeeffeedbeef",
            "user_id": "7",
            "username": "mira",
        }),
    ));

    let welcome = tokio::time::timeout(Duration::from_secs(5), transport.inbound.recv())
        .await
        .expect("no welcome")
        .expect("transport closed");
    assert_eq!(welcome.kind, MessageType::Welcome);
    assert_eq!(welcome.data["session_code"], "legacy");
    assert_eq!(welcome.data["client_id"], "feedbeeffeedbeef");

    (transport.send)(envelope(
        MessageType::NewTableRequest,
        json!({"table_name": "legacy-board", "width": 10, "height": 10}),
    ));
    let response = tokio::time::timeout(Duration::from_secs(5), transport.inbound.recv())
        .await
        .expect("no table response")
        .expect("transport closed");
    assert_eq!(response.kind, MessageType::NewTableResponse);
    assert_eq!(response.data["table_data"]["name"], "legacy-board");
}

#[tokio::test]
async fn attach_requires_auth_token_first() {
    let addr = spawn_legacy_server().await;
    let mut transport = tavern_client::connect_tcp(&addr.to_string()).await.unwrap();

    (transport.send)(envelope(MessageType::Ping, json!({})));
    let error = tokio::time::timeout(Duration::from_secs(5), transport.inbound.recv())
        .await
        .expect("no error reply")
        .expect("transport closed");
    assert_eq!(error.kind, MessageType::Error);
    assert_eq!(error.data["error"], "malformed_message");
    // The server hangs up after the bad handshake.
    let closed = tokio::time::timeout(Duration::from_secs(5), transport.inbound.recv())
        .await
        .expect("timed out waiting for close");
    assert!(closed.is_none());
}
