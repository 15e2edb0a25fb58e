// SPDX-License-Identifier: MIT OR Apache-2.0
//! REST observability endpoints next to the WebSocket endpoint.

mod common;

use common::{WsClient, envelope, spawn_server};
use serde_json::{Value, json};
use tavern_protocol::MessageType;
use tavern_server::BrokerTiming;

#[tokio::test]
async fn health_reports_protocol_version() {
    let addr = spawn_server(BrokerTiming::default()).await;
    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["protocol_version"], "0.1");
}

#[tokio::test]
async fn stats_reflect_live_sessions() {
    let addr = spawn_server(BrokerTiming::default()).await;

    let mut c1 = WsClient::join(addr, "alpha", "c1c1c1c1c1c1c1c1", "1", "alice").await;
    let _c2 = WsClient::join(addr, "alpha", "c2c2c2c2c2c2c2c2", "2", "bob").await;
    let _c3 = WsClient::join(addr, "beta", "c3c3c3c3c3c3c3c3", "3", "eve").await;

    c1.send(&envelope(
        MessageType::NewTableRequest,
        json!({"table_name": "demo", "width": 10, "height": 10}),
    ))
    .await;
    c1.recv_non_system().await;

    let body: Value = reqwest::get(format!("http://{addr}/stats"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total_sessions"], 2);
    let sessions = body["sessions"].as_array().unwrap();
    assert_eq!(sessions[0]["session_code"], "alpha");
    assert_eq!(sessions[0]["connected_clients"], 2);
    assert_eq!(sessions[0]["tables"], json!(["demo"]));
    assert_eq!(sessions[1]["session_code"], "beta");

    let alpha: Value = reqwest::get(format!("http://{addr}/stats/alpha"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let players = alpha["players"].as_array().unwrap();
    assert_eq!(players.len(), 2);
    assert!(players.iter().any(|p| p["username"] == "alice"));

    let missing = reqwest::get(format!("http://{addr}/stats/nowhere"))
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}
