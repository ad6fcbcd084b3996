//! TCP tunnel server
//!
//! Every accepted public connection gets its own task: open a stream to the
//! rule's agent, send the preamble, then join the two legs and fold the byte
//! counts into the rule's counters.

use burrow_control::{
    accept_backoff, IoCounters, KeyStore, ListenerHandle, RegistryError, SessionRegistry,
};
use burrow_proto::TunnelRule;
use burrow_transport::{join, open_tunnel, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// TCP server errors
#[derive(Debug, Error)]
pub enum TcpServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("session error: {0}")]
    Registry(#[from] RegistryError),

    #[error("tunnel error: {0}")]
    Transport(#[from] TransportError),
}

/// Serves one TCP tunnel rule
pub struct TcpTunnelServer {
    rule: Arc<TunnelRule>,
    registry: SessionRegistry,
    keys: Arc<KeyStore>,
    counters: Arc<IoCounters>,
}

impl TcpTunnelServer {
    pub fn new(rule: TunnelRule, registry: SessionRegistry, keys: Arc<KeyStore>) -> Self {
        Self {
            rule: Arc::new(rule),
            registry,
            keys,
            counters: Arc::new(IoCounters::new()),
        }
    }

    /// Keep counting into existing counters, e.g. when a rule is rebound
    pub fn with_counters(mut self, counters: Arc<IoCounters>) -> Self {
        self.counters = counters;
        self
    }

    /// Bind the public address and start accepting in the background
    pub async fn start(self) -> Result<ListenerHandle, TcpServerError> {
        let bind_addr = self.rule.public_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| TcpServerError::BindError {
                address: self.rule.public_ip.clone(),
                port: self.rule.public_port,
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            identity = %self.rule.identity,
            rule_id = %self.rule.id,
            internal = %self.rule.descriptor().internal_addr(),
            "TCP tunnel listening on {}",
            local_addr
        );

        let handle = ListenerHandle::new(local_addr, self.counters.clone());
        tokio::spawn(self.accept_loop(
            listener,
            handle.shutdown_signal(),
            handle.stopped_signal(),
        ));
        Ok(handle)
    }

    async fn accept_loop(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
        stopped: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(rule_id = %self.rule.id, "TCP listener stopped");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        debug!("Accepted TCP connection from {}", peer_addr);
                        let rule = self.rule.clone();
                        let registry = self.registry.clone();
                        let keys = self.keys.clone();
                        let counters = self.counters.clone();
                        tokio::spawn(async move {
                            let served =
                                handle_connection(socket, peer_addr, rule, registry, keys, counters);
                            if let Err(e) = served.await {
                                warn!("Dropping TCP connection from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        if !accept_backoff(&shutdown).await {
                            break;
                        }
                    }
                }
            }
        }
        drop(listener);
        stopped.cancel();
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    rule: Arc<TunnelRule>,
    registry: SessionRegistry,
    keys: Arc<KeyStore>,
    counters: Arc<IoCounters>,
) -> Result<(), TcpServerError> {
    let stream = registry.get_stream(&rule.identity).await?;
    let key = rule.encrypt.then(|| keys.get(&rule.identity));
    let tunnel = open_tunnel(stream, key.as_ref(), &rule.descriptor()).await?;

    let stats = join(socket, tunnel).await;
    counters.add_input(stats.a_to_b);
    counters.add_output(stats.b_to_a);

    info!(
        identity = %rule.identity,
        peer = %peer_addr,
        bytes_in = stats.a_to_b,
        bytes_out = stats.b_to_a,
        "TCP flow closed"
    );
    Ok(())
}
