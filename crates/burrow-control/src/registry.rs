//! Session registry
//!
//! Maps an agent identity to its single live multiplexed control session.
//! A second registration for an online identity is rejected; the existing
//! session is never displaced. Each session has a watcher task that removes
//! the entry once the multiplexer reports the connection closed.

use burrow_transport::{BoxedStream, Multiplexer, StreamOpener, TransportError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("client {0} is not connected")]
    NotConnected(String),

    #[error("client {0} is online")]
    AlreadyOnline(String),

    #[error("failed to open stream: {0}")]
    Transport(#[from] TransportError),
}

/// One live control connection
#[derive(Clone)]
pub struct Session {
    pub identity: String,
    /// Distinguishes successive sessions of the same identity
    pub id: u64,
    pub connected_at: DateTime<Utc>,
    opener: Arc<dyn StreamOpener>,
    closed: CancellationToken,
}

impl Session {
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the underlying connection is gone.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub async fn close(&self) {
        self.opener.close().await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("id", &self.id)
            .field("connected_at", &self.connected_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    mux: Arc<dyn Multiplexer>,
    next_id: Arc<AtomicU64>,
}

impl SessionRegistry {
    pub fn new(mux: Arc<dyn Multiplexer>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            mux,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Registers `identity` over `conn`, starting the server side of the
    /// multiplexer. On rejection `conn` is dropped, closing it.
    pub async fn add_session(
        &self,
        identity: &str,
        conn: BoxedStream,
    ) -> Result<Session, RegistryError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(identity) {
            warn!(identity = %identity, "Rejecting duplicate session, client is online");
            return Err(RegistryError::AlreadyOnline(identity.to_string()));
        }

        // Only the gateway opens streams; inbound ones are discarded.
        let mux = self.mux.server(conn);
        let session = Session {
            identity: identity.to_string(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            connected_at: Utc::now(),
            opener: mux.opener,
            closed: mux.closed,
        };
        sessions.insert(identity.to_string(), session.clone());
        drop(sessions);

        info!(identity = %identity, session_id = session.id, "Session registered");
        tokio::spawn(watch_session(self.sessions.clone(), session.clone()));
        Ok(session)
    }

    /// Opens a new logical stream to `identity`'s agent.
    pub async fn get_stream(&self, identity: &str) -> Result<BoxedStream, RegistryError> {
        let opener = {
            let sessions = self.sessions.lock().await;
            match sessions.get(identity) {
                Some(session) => session.opener.clone(),
                None => return Err(RegistryError::NotConnected(identity.to_string())),
            }
        };
        Ok(opener.open_stream().await?)
    }

    pub async fn get(&self, identity: &str) -> Option<Session> {
        self.sessions.lock().await.get(identity).cloned()
    }

    pub async fn is_online(&self, identity: &str) -> bool {
        self.sessions.lock().await.contains_key(identity)
    }

    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Identities with a live session, sorted
    pub async fn online(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Closes every session. Entries are removed by their watchers.
    pub async fn close_all(&self) {
        let sessions: Vec<Session> = self.sessions.lock().await.values().cloned().collect();
        for session in sessions {
            session.close().await;
        }
    }
}

async fn watch_session(sessions: Arc<Mutex<HashMap<String, Session>>>, session: Session) {
    debug!(identity = %session.identity, session_id = session.id, "Watching session");
    session.closed().await;

    let mut sessions = sessions.lock().await;
    let current = sessions.get(&session.identity).map(|s| s.id);
    if current == Some(session.id) {
        sessions.remove(&session.identity);
        info!(identity = %session.identity, session_id = session.id, "Session closed, client offline");
    }
}
