//! Control connection acceptor
//!
//! Agents dial in here. The first frame on a connection is the handshake;
//! a known identity gets a session in the registry, anything else is
//! dropped. There is no retry on this side.

use burrow_control::{accept_backoff, RegistryError, SessionRegistry};
use burrow_proto::{Handshake, ProtocolError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::manager::ListenerManager;

/// Interval of the online-session log when debug info is enabled
const DEBUG_INFO_INTERVAL: Duration = Duration::from_secs(4);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Failed to bind gateway on {address}: {reason}")]
    BindError { address: String, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[from] ProtocolError),

    #[error("unknown client identity: {0}")]
    UnknownIdentity(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Running control listener
pub struct Gateway {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Binds `bind_addr` and starts accepting agent connections.
    pub async fn start(
        bind_addr: &str,
        manager: Arc<ListenerManager>,
        debug_info: bool,
    ) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| GatewayError::BindError {
                address: bind_addr.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;
        info!("Gateway listening on {}", local_addr);

        let shutdown = CancellationToken::new();
        if debug_info {
            tokio::spawn(log_sessions(
                manager.registry().clone(),
                shutdown.clone(),
            ));
        }
        tokio::spawn(accept_loop(listener, manager, shutdown.clone()));

        Ok(Self {
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting. Registered sessions are left alone.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    manager: Arc<ListenerManager>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Gateway listener stopped");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, peer_addr)) => {
                    let manager = manager.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_agent(socket, peer_addr, manager).await {
                            warn!(peer_addr = %peer_addr, "Rejected agent connection: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept agent connection: {}", e);
                    if !accept_backoff(&shutdown).await {
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_agent(
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    manager: Arc<ListenerManager>,
) -> Result<(), GatewayError> {
    let handshake = Handshake::read_from(&mut socket).await?;
    let identity = handshake.identity;

    if !manager.check_identity_registered(&identity).await {
        return Err(GatewayError::UnknownIdentity(identity));
    }

    let session = manager
        .registry()
        .add_session(&identity, Box::new(socket))
        .await?;
    info!(
        identity = %identity,
        peer_addr = %peer_addr,
        session_id = session.id,
        "Agent connected"
    );
    Ok(())
}

async fn log_sessions(registry: SessionRegistry, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(DEBUG_INFO_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let online = registry.online().await;
                debug!(count = online.len(), sessions = ?online, "Online sessions");
            }
        }
    }
}
