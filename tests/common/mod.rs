// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared scaffolding for the end-to-end suite: a real server on an
//! ephemeral port and a raw WebSocket client speaking the wire protocol.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tavern_actions::MemoryStore;
use tavern_protocol::{Envelope, MessageType, WireCodec, now_epoch};
use tavern_server::{AppState, BrokerTiming, ConnectionManager, LocalPresigner, build_app};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// Boot a broker on an ephemeral port; returns its bound address.
pub async fn spawn_server(timing: BrokerTiming) -> SocketAddr {
    let store = Arc::new(MemoryStore::new());
    let presigner = Arc::new(LocalPresigner::new("http://blobs.test", 900));
    let manager = ConnectionManager::new(store.clone(), store, presigner, timing);
    let state = Arc::new(AppState {
        manager,
        started_at: now_epoch(),
    });
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// WebSocket URL for joining a session on the test server.
pub fn game_url(addr: SocketAddr, session: &str, client_id: &str, user: &str, name: &str) -> String {
    format!("ws://{addr}/ws/game/{session}?client_id={client_id}&user_id={user}&username={name}")
}

/// A raw protocol-speaking WebSocket client.
pub struct WsClient {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Connection id this client registered with.
    pub client_id: String,
}

impl WsClient {
    /// Connect and consume the welcome envelope.
    pub async fn join(addr: SocketAddr, session: &str, client_id: &str, user: &str, name: &str) -> Self {
        let (socket, _) = connect_async(game_url(addr, session, client_id, user, name))
            .await
            .expect("websocket connect");
        let mut client = Self {
            socket,
            client_id: client_id.to_string(),
        };
        let welcome = client.recv().await;
        assert_eq!(welcome.kind, MessageType::Welcome);
        assert_eq!(welcome.data["client_id"], client_id);
        client
    }

    /// Send one envelope.
    pub async fn send(&mut self, envelope: &Envelope) {
        let text = WireCodec::encode(envelope).unwrap();
        self.socket
            .send(WsMessage::Text(text.into()))
            .await
            .expect("send frame");
    }

    /// Receive the next envelope (5 s timeout).
    pub async fn recv(&mut self) -> Envelope {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.socket.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket closed")
                .expect("socket error");
            match frame {
                WsMessage::Text(text) => return WireCodec::decode(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    /// Receive the next envelope that is not roster noise or keepalive.
    pub async fn recv_non_system(&mut self) -> Envelope {
        loop {
            let envelope = self.recv().await;
            match envelope.kind {
                MessageType::PlayerJoined | MessageType::PlayerLeft | MessageType::Ping => {}
                _ => return envelope,
            }
        }
    }

    /// Send a raw text frame, bypassing the codec.
    pub async fn send_raw(&mut self, text: &str) {
        self.socket
            .send(WsMessage::Text(text.to_string().into()))
            .await
            .expect("send raw frame");
    }

    /// Drain frames until the server closes the socket; false on timeout.
    pub async fn wait_for_close(&mut self, window: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match tokio::time::timeout(remaining, self.socket.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(WsMessage::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }

    /// Assert no frame other than system noise arrives within `window`.
    pub async fn assert_silent(&mut self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return;
            }
            match tokio::time::timeout(remaining, self.socket.next()).await {
                Err(_) => return,
                Ok(Some(Ok(WsMessage::Text(text)))) => {
                    let envelope = WireCodec::decode(text.as_str()).unwrap();
                    match envelope.kind {
                        MessageType::PlayerJoined
                        | MessageType::PlayerLeft
                        | MessageType::Ping => continue,
                        other => panic!("expected silence, got {other}"),
                    }
                }
                Ok(_) => return,
            }
        }
    }
}

/// Envelope with an object payload, for terse test bodies.
pub fn envelope(kind: MessageType, data: serde_json::Value) -> Envelope {
    Envelope::with_data(kind, data.as_object().cloned().unwrap_or_default())
}
