//! UDP pseudo-sessions
//!
//! UDP has no connections, so a listener groups datagrams by remote address
//! and relays each group over one tunnel stream. A pseudo-session lives for
//! a fixed window from creation; traffic does not extend it. When the window
//! ends the stream is closed and the next datagram from that address starts
//! a fresh session.

use burrow_transport::conn::write_with_deadline;
use burrow_transport::{TransportResult, TunnelConn, CONTROL_WRITE_TIMEOUT};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::task_tracker::TaskTracker;

pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(20);

/// One remote address's relay stream
pub struct UdpSession {
    pub id: u64,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub created_at: DateTime<Utc>,
    writer: Mutex<WriteHalf<TunnelConn>>,
    closed: CancellationToken,
}

impl UdpSession {
    /// Writes one already-encoded datagram frame onto the stream.
    pub async fn write_frame(&self, frame: &[u8]) -> TransportResult<()> {
        let mut writer = self.writer.lock().await;
        write_with_deadline(&mut *writer, frame, CONTROL_WRITE_TIMEOUT).await
    }

    /// Cancelled when the session is removed; the stream reader watches it.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn close(&self) {
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        let _ = tokio::time::timeout(CONTROL_WRITE_TIMEOUT, writer.shutdown()).await;
    }
}

/// Per-listener table of live pseudo-sessions keyed by remote address
#[derive(Clone)]
pub struct UdpSessionTable {
    sessions: Arc<Mutex<HashMap<String, Arc<UdpSession>>>>,
    reapers: Arc<TaskTracker>,
    idle_timeout: Duration,
    next_id: Arc<AtomicU64>,
}

impl UdpSessionTable {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            reapers: Arc::new(TaskTracker::new()),
            idle_timeout,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub async fn get(&self, remote: &SocketAddr) -> Option<Arc<UdpSession>> {
        self.sessions.lock().await.get(&remote.to_string()).cloned()
    }

    /// Registers a session for `remote` and schedules its reaper.
    pub async fn add(
        &self,
        remote: SocketAddr,
        local: SocketAddr,
        writer: WriteHalf<TunnelConn>,
    ) -> Arc<UdpSession> {
        let session = Arc::new(UdpSession {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            remote_addr: remote,
            local_addr: local,
            created_at: Utc::now(),
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
        });

        let replaced = self
            .sessions
            .lock()
            .await
            .insert(remote.to_string(), session.clone());
        if let Some(old) = replaced {
            self.reapers.unregister(&reaper_key(&old));
            old.close().await;
        }

        let table = self.clone();
        let (key, id) = (remote.to_string(), session.id);
        let timeout = self.idle_timeout;
        // The window starts once the reaper is tracked, so expiry always
        // finds its own entry to complete.
        let (armed_tx, armed_rx) = oneshot::channel::<()>();
        let reaper = tokio::spawn(async move {
            if armed_rx.await.is_err() {
                return;
            }
            tokio::time::sleep(timeout).await;
            table.expire(&key, id).await;
        });
        self.reapers.register(reaper_key(&session), reaper);
        let _ = armed_tx.send(());

        debug!(remote = %remote, session_id = session.id, "UDP pseudo-session created");
        session
    }

    /// Removes `remote`'s session if it is still `id`, cancelling its reaper.
    pub async fn remove(&self, remote: &SocketAddr, id: u64) {
        let removed = self.take(&remote.to_string(), id).await;
        if let Some(session) = removed {
            self.reapers.unregister(&reaper_key(&session));
            session.close().await;
            debug!(remote = %remote, session_id = id, "UDP pseudo-session removed");
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Closes every session and cancels all reapers.
    pub async fn clear(&self) {
        let drained: Vec<Arc<UdpSession>> =
            self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        self.reapers.abort_all();
        for session in drained {
            session.close().await;
        }
    }

    async fn expire(&self, key: &str, id: u64) {
        // Runs on the reaper itself, which must not abort itself.
        if let Some(session) = self.take(key, id).await {
            self.reapers.complete(&reaper_key(&session));
            session.close().await;
            debug!(remote = %key, session_id = id, "UDP pseudo-session expired");
        }
    }

    async fn take(&self, key: &str, id: u64) -> Option<Arc<UdpSession>> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(key) {
            Some(session) if session.id == id => sessions.remove(key),
            _ => None,
        }
    }
}

fn reaper_key(session: &UdpSession) -> String {
    format!("{}#{}", session.remote_addr, session.id)
}
