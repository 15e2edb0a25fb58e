// SPDX-License-Identifier: MIT OR Apache-2.0
//! The per-session broker: one actor task owning the session's clients,
//! authoritative state, keepalive, and reaping.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tavern_actions::{CharacterStore, SessionActions, TableStore};
use tavern_error::ErrorCode;
use tavern_protocol::{
    BatchItemResult, DedupWindow, Envelope, Frame, MessageType, WireCodec, now_epoch,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::presign::BlobPresigner;
use crate::protocol::{ClientIdentity, PlayerInfo, ServerProtocol};

/// Liveness and persistence intervals for one broker.
#[derive(Debug, Clone, Copy)]
pub struct BrokerTiming {
    /// Interval between server keepalive pings.
    pub keepalive: Duration,
    /// Interval between reaper sweeps.
    pub reap_interval: Duration,
    /// Age of `last_ping` beyond which a client is dead.
    pub client_timeout: Duration,
    /// Debounce window for batched table saves.
    pub save_debounce: Duration,
}

impl Default for BrokerTiming {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(20),
            reap_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(60),
            save_debounce: Duration::from_millis(300),
        }
    }
}

impl From<&tavern_config::TimingConfig> for BrokerTiming {
    fn from(timing: &tavern_config::TimingConfig) -> Self {
        Self {
            keepalive: Duration::from_secs(timing.keepalive_secs),
            reap_interval: Duration::from_secs(timing.reap_interval_secs),
            client_timeout: Duration::from_secs(timing.client_timeout_secs),
            save_debounce: Duration::from_millis(timing.save_debounce_ms),
        }
    }
}

/// Commands accepted by a broker task.
#[derive(Debug)]
pub enum SessionCommand {
    /// Register a client and send its welcome.
    Join {
        /// Connection id (16 hex chars).
        client_id: String,
        /// Authenticated user id.
        user_id: String,
        /// Display name.
        username: String,
        /// Encoded-frame sink feeding the client's transport.
        outbound: mpsc::UnboundedSender<String>,
    },
    /// An inbound text frame from a registered client.
    Frame {
        /// Sender connection id.
        client_id: String,
        /// Raw frame text.
        text: String,
    },
    /// Transport closed; deregister (idempotent).
    Leave {
        /// Connection id to drop.
        client_id: String,
    },
    /// Snapshot the session for observability endpoints.
    Stats {
        /// Reply channel.
        reply: oneshot::Sender<SessionStats>,
    },
    /// Flush pending saves and stop the task.
    Shutdown,
}

/// Observability snapshot of a session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionStats {
    /// Session code.
    pub session_code: String,
    /// Number of connected clients.
    pub connected_clients: usize,
    /// Table names owned by the session.
    pub tables: Vec<String>,
    /// Roster details.
    pub players: Vec<PlayerInfo>,
}

/// Cloneable handle to a running broker task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Session code this handle addresses.
    pub session_code: String,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Send a command, reporting whether the broker is still alive.
    pub async fn send(&self, command: SessionCommand) -> bool {
        self.tx.send(command).await.is_ok()
    }

    /// Fetch a stats snapshot; `None` when the broker is gone.
    pub async fn stats(&self) -> Option<SessionStats> {
        let (reply, rx) = oneshot::channel();
        if !self.send(SessionCommand::Stats { reply }).await {
            return None;
        }
        rx.await.ok()
    }
}

struct ClientConnection {
    outbound: mpsc::UnboundedSender<String>,
    info: PlayerInfo,
}

/// One broker owns one session. Inbound frames are processed sequentially
/// on this task, so the table model and action layer need no locking.
pub struct SessionBroker {
    session_code: String,
    actions: SessionActions,
    protocol: ServerProtocol,
    clients: HashMap<String, ClientConnection>,
    banned_users: HashSet<String>,
    dedup: DedupWindow,
    timing: BrokerTiming,
    rx: mpsc::Receiver<SessionCommand>,
}

impl SessionBroker {
    /// Spawn a broker task for `session_code` and return its handle.
    pub fn spawn(
        session_code: impl Into<String>,
        table_store: Arc<dyn TableStore>,
        character_store: Arc<dyn CharacterStore>,
        presigner: Arc<dyn BlobPresigner>,
        timing: BrokerTiming,
    ) -> SessionHandle {
        let session_code = session_code.into();
        let (tx, rx) = mpsc::channel(256);
        let handle = SessionHandle {
            session_code: session_code.clone(),
            tx,
        };
        let broker = SessionBroker {
            actions: SessionActions::new(
                session_code.clone(),
                table_store,
                character_store,
                timing.save_debounce,
            ),
            protocol: ServerProtocol::new(presigner),
            clients: HashMap::new(),
            banned_users: HashSet::new(),
            dedup: DedupWindow::default(),
            timing,
            rx,
            session_code,
        };
        tokio::spawn(broker.run());
        handle
    }

    #[instrument(skip(self), fields(session = %self.session_code))]
    async fn run(mut self) {
        self.actions.load().await;
        info!("session broker started");

        let mut keepalive = tokio::time::interval(self.timing.keepalive);
        let mut reaper = tokio::time::interval(self.timing.reap_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        reaper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let save_deadline = self.actions.next_save_deadline();
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(SessionCommand::Join { client_id, user_id, username, outbound }) => {
                        self.add_client(client_id, user_id, username, outbound);
                    }
                    Some(SessionCommand::Frame { client_id, text }) => {
                        self.handle_frame(client_id, text).await;
                    }
                    Some(SessionCommand::Leave { client_id }) => {
                        self.remove_client(&client_id, "disconnected");
                    }
                    Some(SessionCommand::Stats { reply }) => {
                        let _ = reply.send(self.stats());
                    }
                    Some(SessionCommand::Shutdown) | None => break,
                },
                _ = keepalive.tick() => self.broadcast_keepalive(),
                _ = reaper.tick() => self.reap_stale_clients(),
                _ = sleep_until_or_forever(save_deadline) => {
                    self.actions.process_due_saves().await;
                }
            }
        }

        let flushed = self.actions.flush_all_pending_saves().await;
        info!(flushed, "session broker stopped");
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            session_code: self.session_code.clone(),
            connected_clients: self.clients.len(),
            tables: self.actions.table_names(),
            players: self.roster(),
        }
    }

    fn roster(&self) -> Vec<PlayerInfo> {
        self.clients.values().map(|c| c.info.clone()).collect()
    }

    // -- membership ---------------------------------------------------------

    fn add_client(
        &mut self,
        client_id: String,
        user_id: String,
        username: String,
        outbound: mpsc::UnboundedSender<String>,
    ) {
        if self.banned_users.contains(&user_id) {
            warn!(client = %client_id, user = %user_id, "banned user rejected");
            let denial = Envelope::error(ErrorCode::Unauthorized, "user is banned from this session");
            if let Ok(text) = WireCodec::encode(&denial) {
                let _ = outbound.send(text);
            }
            return;
        }
        if self.clients.contains_key(&client_id) {
            warn!(client = %client_id, "client id already registered, replacing connection");
            self.remove_client(&client_id, "replaced");
        }

        let now = now_epoch();
        let info = PlayerInfo {
            client_id: client_id.clone(),
            user_id: user_id.clone(),
            username: username.clone(),
            connected_at: now,
            last_ping: now,
        };
        let welcome = Envelope::from_payload(
            MessageType::Welcome,
            json!({
                "client_id": client_id.clone(),
                "session_code": self.session_code,
                "user_id": user_id.clone(),
                "username": username.clone(),
                "tables": self.actions.table_names(),
            }),
        );
        self.clients
            .insert(client_id.clone(), ClientConnection { outbound, info });
        self.send_to(&client_id, &welcome);
        info!(client = %client_id, user = %user_id, username = %username, "client joined");

        let joined = Envelope::from_payload(
            MessageType::PlayerJoined,
            json!({ "client_id": client_id.clone(), "username": username }),
        );
        self.broadcast(&joined, Some(&client_id));
    }

    fn remove_client(&mut self, client_id: &str, reason: &str) {
        let Some(connection) = self.clients.remove(client_id) else {
            return;
        };
        self.dedup.forget_client(client_id);
        info!(client = %client_id, username = %connection.info.username, reason, "client removed");

        let left = Envelope::from_payload(
            MessageType::PlayerLeft,
            json!({
                "client_id": client_id,
                "username": connection.info.username,
                "reason": reason,
            }),
        );
        self.broadcast(&left, Some(client_id));
    }

    // -- frames -------------------------------------------------------------

    async fn handle_frame(&mut self, client_id: String, text: String) {
        if let Some(connection) = self.clients.get_mut(&client_id) {
            connection.info.last_ping = now_epoch();
        } else {
            warn!(client = %client_id, "frame from unregistered client");
            return;
        }

        match WireCodec::decode_frame(&text) {
            Ok(Frame::Single(envelope)) => {
                if let Some(reply) = self.process_envelope(envelope, &client_id).await {
                    self.send_to(&client_id, &reply);
                }
            }
            Ok(Frame::Batch(batch)) => {
                let mut results = Vec::with_capacity(batch.len());
                for (index, decoded) in batch.decode_messages().into_iter().enumerate() {
                    match decoded {
                        Ok(envelope) => {
                            let reply = self.process_envelope(envelope, &client_id).await;
                            let failed = reply
                                .as_ref()
                                .is_some_and(|r| r.kind == MessageType::Error);
                            results.push(BatchItemResult {
                                index,
                                success: !failed,
                                error: failed
                                    .then(|| describe_error(reply.as_ref()))
                                    .flatten(),
                                reply,
                            });
                        }
                        Err(e) => results.push(BatchItemResult {
                            index,
                            success: false,
                            error: Some(e.to_string()),
                            reply: None,
                        }),
                    }
                }
                let summary = Envelope::from_payload(
                    MessageType::Success,
                    json!({ "batch_seq": batch.seq, "results": results }),
                );
                self.send_to(&client_id, &summary);
            }
            Err(e) => {
                warn!(client = %client_id, error = %e, "undecodable frame");
                let report = e
                    .wire_code()
                    .report("frame could not be decoded")
                    .note("frame_bytes", text.len())
                    .caused_by(&e);
                self.send_to(&client_id, &Envelope::failure(&report));
            }
        }
    }

    async fn process_envelope(
        &mut self,
        envelope: Envelope,
        client_id: &str,
    ) -> Option<Envelope> {
        if self.dedup.observe(&envelope) {
            debug!(
                client = %client_id,
                sequence = ?envelope.sequence_id,
                "dropping duplicate envelope"
            );
            return None;
        }
        let identity = {
            let info = &self.clients.get(client_id)?.info;
            ClientIdentity {
                client_id: info.client_id.clone(),
                user_id: info.user_id.clone(),
                username: info.username.clone(),
            }
        };
        let roster = self.roster();
        let output = self
            .protocol
            .handle(&mut self.actions, &roster, &envelope, &identity)
            .await;

        if let Some(broadcast) = &output.broadcast {
            self.broadcast(broadcast, Some(client_id));
        }
        if let Some(user_id) = output.ban {
            info!(user = %user_id, "user banned from session");
            self.banned_users.insert(user_id);
        }
        if let Some(kicked) = output.kick {
            let notice = Envelope::error(ErrorCode::SessionClosed, "removed from session");
            self.send_to(&kicked, &notice);
            self.remove_client(&kicked, "kicked");
        }
        output.reply
    }

    // -- delivery -----------------------------------------------------------

    fn send_to(&mut self, client_id: &str, envelope: &Envelope) {
        let Ok(text) = WireCodec::encode(envelope) else {
            warn!(kind = %envelope.kind, "unencodable envelope");
            return;
        };
        let dead = match self.clients.get(client_id) {
            Some(connection) => connection.outbound.send(text).is_err(),
            None => false,
        };
        if dead {
            self.remove_client(client_id, "send failed");
        }
    }

    /// Fan out to every client except `exclude`; failed sends enqueue the
    /// client for removal and do not abort the rest.
    fn broadcast(&mut self, envelope: &Envelope, exclude: Option<&str>) {
        let Ok(text) = WireCodec::encode(envelope) else {
            warn!(kind = %envelope.kind, "unencodable broadcast");
            return;
        };
        let mut dead = Vec::new();
        let mut delivered = 0;
        for (client_id, connection) in &self.clients {
            if Some(client_id.as_str()) == exclude {
                continue;
            }
            if connection.outbound.send(text.clone()).is_err() {
                dead.push(client_id.clone());
            } else {
                delivered += 1;
            }
        }
        debug!(kind = %envelope.kind, delivered, "broadcast");
        for client_id in dead {
            self.remove_client(&client_id, "send failed");
        }
    }

    // -- liveness -----------------------------------------------------------

    fn broadcast_keepalive(&mut self) {
        if self.clients.is_empty() {
            return;
        }
        let ping = Envelope::from_payload(MessageType::Ping, json!({ "content": "ping" }));
        self.broadcast(&ping, None);
    }

    fn reap_stale_clients(&mut self) {
        let now = now_epoch();
        let timeout = self.timing.client_timeout.as_secs_f64();
        let stale: Vec<String> = self
            .clients
            .values()
            .filter(|c| now - c.info.last_ping > timeout)
            .map(|c| c.info.client_id.clone())
            .collect();
        for client_id in stale {
            info!(client = %client_id, "reaping stale client");
            self.remove_client(&client_id, "timed out");
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn describe_error(reply: Option<&Envelope>) -> Option<String> {
    reply
        .and_then(|r| r.data.get("message"))
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}
