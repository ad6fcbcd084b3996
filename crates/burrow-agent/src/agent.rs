//! Agent control loop
//!
//! Dials the gateway, announces the agent's identity and runs the client
//! side of the multiplexer. Every stream the gateway opens is served on its
//! own task. Losing the control connection, or failing to establish it,
//! waits a fixed delay and starts over until the agent is stopped.

use burrow_proto::{Handshake, ProtocolError};
use burrow_transport::conn::write_with_deadline;
use burrow_transport::{Multiplexer, TransportError, TunnelKey, CONTROL_WRITE_TIMEOUT};
use burrow_transport_yamux::YamuxMultiplexer;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::forwarder::handle_stream;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Errors that end one control connection
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Failed to connect to gateway {address}: {source}")]
    ConnectFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Handshake failed: {0}")]
    Handshake(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Control connection closed by gateway")]
    SessionClosed,
}

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identity announced in the handshake
    pub identity: String,

    /// Gateway control address (host:port)
    pub gateway_addr: String,

    /// Pre-provisioned key, required for encrypted rules
    pub key: Option<TunnelKey>,

    /// Wait between connection attempts
    pub reconnect_delay: Duration,
}

impl AgentConfig {
    pub fn new(identity: impl Into<String>, gateway_addr: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            gateway_addr: gateway_addr.into(),
            key: None,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn with_key(mut self, key: TunnelKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

pub struct Agent {
    config: AgentConfig,
    mux: Arc<dyn Multiplexer>,
    shutdown: CancellationToken,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            mux: Arc::new(YamuxMultiplexer::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Cancel to make [`Agent::run`] return
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Keeps a control connection up until stopped.
    pub async fn run(&self) {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match self.connect_once().await {
                Ok(()) => {}
                Err(e) => warn!(
                    identity = %self.config.identity,
                    attempt,
                    "Control connection lost: {}",
                    e
                ),
            }
            if self.shutdown.is_cancelled() {
                break;
            }

            info!(
                "Reconnecting in {:?}... (attempt {})",
                self.config.reconnect_delay,
                attempt + 1
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
        info!(identity = %self.config.identity, "Agent stopped");
    }

    /// One control connection, from dial to disconnect. Returns `Ok` only
    /// when stopped.
    pub async fn connect_once(&self) -> Result<(), AgentError> {
        let address = &self.config.gateway_addr;
        let mut socket = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            connected = TcpStream::connect(address) => connected.map_err(|source| {
                AgentError::ConnectFailed {
                    address: address.clone(),
                    source,
                }
            })?,
        };

        let hello = Handshake::new(self.config.identity.clone()).encode()?;
        write_with_deadline(&mut socket, &hello, CONTROL_WRITE_TIMEOUT).await?;

        let mut session = self.mux.client(Box::new(socket));
        info!(identity = %self.config.identity, gateway = %address, "Connected to gateway");

        loop {
            let stream = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    session.opener.close().await;
                    return Ok(());
                }
                accepted = session.incoming.accept_stream() => accepted,
            };
            let Some(stream) = stream else {
                return Err(AgentError::SessionClosed);
            };

            let key = self.config.key.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_stream(stream, key).await {
                    warn!("Flow failed: {}", e);
                }
            });
            debug!(identity = %self.config.identity, "Dispatched tunnel stream");
        }
    }
}
