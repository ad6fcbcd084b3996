//! Handle to a running public listener

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::counters::IoCounters;

/// Pause after a failed accept, so errors like EMFILE do not spin the loop
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Sleeps [`ACCEPT_RETRY_DELAY`]. Returns `false` if `shutdown` fires first.
pub async fn accept_backoff(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => true,
    }
}

/// Returned by a started TCP or UDP listener.
///
/// Closing stops the accept/receive loop and releases the socket; flows
/// already being forwarded drain on their own.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    stopped: CancellationToken,
    counters: Arc<IoCounters>,
}

impl ListenerHandle {
    pub fn new(local_addr: SocketAddr, counters: Arc<IoCounters>) -> Self {
        Self {
            local_addr,
            shutdown: CancellationToken::new(),
            stopped: CancellationToken::new(),
            counters,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn counters(&self) -> &Arc<IoCounters> {
        &self.counters
    }

    /// Watched by the serving loop
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancelled by the serving loop once its socket is dropped
    pub fn stopped_signal(&self) -> CancellationToken {
        self.stopped.clone()
    }

    /// Idempotent
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            debug!(addr = %self.local_addr, "Closing listener");
            self.shutdown.cancel();
        }
    }

    /// Close and wait until the socket has been released.
    pub async fn close_and_wait(&self) {
        self.close();
        self.stopped.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_is_idempotent_and_signals() {
        let handle = ListenerHandle::new("127.0.0.1:9".parse().unwrap(), Arc::new(IoCounters::new()));
        let shutdown = handle.shutdown_signal();
        let stopped = handle.stopped_signal();
        assert!(!handle.is_closed());

        tokio::spawn(async move {
            shutdown.cancelled().await;
            stopped.cancel();
        });

        handle.close();
        handle.close();
        handle.close_and_wait().await;
        assert!(handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_backoff() {
        let shutdown = CancellationToken::new();
        let started = tokio::time::Instant::now();
        assert!(accept_backoff(&shutdown).await);
        assert!(started.elapsed() >= ACCEPT_RETRY_DELAY);

        shutdown.cancel();
        let started = tokio::time::Instant::now();
        assert!(!accept_backoff(&shutdown).await);
        assert!(started.elapsed() < ACCEPT_RETRY_DELAY);
    }
}
