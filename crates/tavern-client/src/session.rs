// SPDX-License-Identifier: MIT OR Apache-2.0
//! Outbound envelope stamping over an injected transport callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value};
use tavern_protocol::{Envelope, MessageType, generate_client_id};
use tracing::debug;

/// Transport callback: the protocol layer hands every outbound envelope to
/// this function and stays agnostic of the concrete transport (WebSocket,
/// newline-delimited TCP, long-poll webhook).
pub type SendFn = Arc<dyn Fn(Envelope) + Send + Sync>;

/// User-visible events surfaced by the protocol layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// Joined a session.
    Connected {
        /// Session code confirmed by the server.
        session_code: String,
        /// Tables available in the session.
        tables: Vec<String>,
    },
    /// The server rejected a move and restored the authoritative position.
    PositionCorrected {
        /// Affected sprite.
        sprite_id: String,
        /// Authoritative position as `[x, y]`, when known.
        position: Option<(u32, u32)>,
        /// Server-stated reason.
        reason: String,
    },
    /// An asset finished downloading (or was already cached) and verified.
    AssetReady {
        /// Canonical asset id.
        asset_id: String,
        /// Local path of the verified bytes.
        local_path: std::path::PathBuf,
    },
    /// An asset transfer failed.
    AssetFailed {
        /// Canonical asset id.
        asset_id: String,
        /// What went wrong.
        reason: String,
    },
    /// A player joined or left the session.
    Roster {
        /// Display name.
        username: String,
        /// True on join, false on leave.
        joined: bool,
    },
    /// Server-reported error.
    ServerError {
        /// Stable error code.
        code: String,
        /// Human-readable message.
        message: String,
    },
}

/// Identity and sequencing for one client connection.
///
/// Every outbound envelope is stamped with the session code, user identity,
/// client id, and a monotonically increasing sequence id before reaching
/// the transport callback.
pub struct ClientSession {
    /// Session code being joined.
    pub session_code: String,
    /// Authenticated user id.
    pub user_id: String,
    /// Display name.
    pub username: String,
    /// Connection id (16 hex chars).
    pub client_id: String,
    send: SendFn,
    sequence: AtomicU64,
}

impl ClientSession {
    /// Session stamping envelopes for `session_code` over `send`.
    pub fn new(
        session_code: impl Into<String>,
        user_id: impl Into<String>,
        username: impl Into<String>,
        send: SendFn,
    ) -> Self {
        Self {
            session_code: session_code.into(),
            user_id: user_id.into(),
            username: username.into(),
            client_id: generate_client_id(),
            send,
            sequence: AtomicU64::new(1),
        }
    }

    /// Adopt the client id assigned by the server's welcome.
    pub fn adopt_client_id(&mut self, client_id: impl Into<String>) {
        self.client_id = client_id.into();
    }

    /// Stamp and send an envelope.
    pub fn send(&self, kind: MessageType, mut data: Map<String, Value>) {
        data.entry("session_code")
            .or_insert_with(|| self.session_code.clone().into());
        data.entry("user_id")
            .or_insert_with(|| self.user_id.clone().into());
        data.entry("username")
            .or_insert_with(|| self.username.clone().into());
        let envelope = Envelope::with_data(kind, data)
            .with_client_id(self.client_id.clone())
            .with_sequence(self.sequence.fetch_add(1, Ordering::Relaxed));
        debug!(kind = %envelope.kind, seq = ?envelope.sequence_id, "sending");
        (self.send)(envelope);
    }

    /// Send a payload built from any serializable object.
    pub fn send_payload(&self, kind: MessageType, payload: impl serde::Serialize) {
        match serde_json::to_value(payload) {
            Ok(Value::Object(map)) => self.send(kind, map),
            _ => self.send(kind, Map::new()),
        }
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("session_code", &self.session_code)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .finish()
    }
}
