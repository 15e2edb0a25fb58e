// SPDX-License-Identifier: MIT OR Apache-2.0
//! Top-level session registry: lazily creates brokers, routes sockets.

use std::collections::HashMap;
use std::sync::Arc;

use tavern_actions::{CharacterStore, TableStore};
use tokio::sync::RwLock;
use tracing::info;

use crate::broker::{BrokerTiming, SessionBroker, SessionCommand, SessionHandle, SessionStats};
use crate::presign::BlobPresigner;

/// Routes connections to per-session brokers, creating them on first use.
///
/// The map is the only cross-session shared state; each broker's state is
/// confined to its own task.
pub struct ConnectionManager {
    table_store: Arc<dyn TableStore>,
    character_store: Arc<dyn CharacterStore>,
    presigner: Arc<dyn BlobPresigner>,
    timing: BrokerTiming,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl ConnectionManager {
    /// Manager creating brokers over the given seams.
    pub fn new(
        table_store: Arc<dyn TableStore>,
        character_store: Arc<dyn CharacterStore>,
        presigner: Arc<dyn BlobPresigner>,
        timing: BrokerTiming,
    ) -> Self {
        Self {
            table_store,
            character_store,
            presigner,
            timing,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Handle for `session_code`, spawning its broker when absent or dead.
    pub async fn session(&self, session_code: &str) -> SessionHandle {
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(session_code) {
                return handle.clone();
            }
        }
        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(session_code) {
            return handle.clone();
        }
        info!(session = session_code, "creating session broker");
        let handle = SessionBroker::spawn(
            session_code,
            Arc::clone(&self.table_store),
            Arc::clone(&self.character_store),
            Arc::clone(&self.presigner),
            self.timing,
        );
        sessions.insert(session_code.to_string(), handle.clone());
        handle
    }

    /// Handle for an existing session only.
    pub async fn existing_session(&self, session_code: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(session_code).cloned()
    }

    /// Session codes currently running.
    pub async fn session_codes(&self) -> Vec<String> {
        let mut codes: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        codes.sort();
        codes
    }

    /// Stats snapshots for every live session.
    pub async fn all_stats(&self) -> Vec<SessionStats> {
        let handles: Vec<SessionHandle> =
            self.sessions.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(snapshot) = handle.stats().await {
                stats.push(snapshot);
            }
        }
        stats.sort_by(|a, b| a.session_code.cmp(&b.session_code));
        stats
    }

    /// Shut down one session, flushing its pending saves.
    pub async fn close_session(&self, session_code: &str) -> bool {
        let handle = self.sessions.write().await.remove(session_code);
        match handle {
            Some(handle) => handle.send(SessionCommand::Shutdown).await,
            None => false,
        }
    }

    /// Shut down every session (process exit path).
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = self.sessions.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            let _ = handle.send(SessionCommand::Shutdown).await;
        }
        info!("all session brokers stopped");
    }
}
