//! Transport layer for burrow tunnels
//!
//! Everything that sits between a raw byte stream and the proxied payload:
//! the optional cipher wrapper, the per-flow preamble (encryption
//! negotiation followed by the tunnel descriptor), the counting byte join,
//! and the stream multiplexer abstraction the gateway and agent run on.

pub mod cipher;
pub mod conn;
pub mod join;
pub mod key;
pub mod mux;
pub mod preamble;

pub use cipher::CipherStream;
pub use conn::TunnelConn;
pub use join::{join, JoinStats};
pub use key::{KeyError, TunnelKey};
pub use mux::{MuxSession, Multiplexer, StreamAcceptor, StreamOpener};
pub use preamble::{accept_tunnel, open_tunnel};

use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Deadline applied to every control-message write
pub const CONTROL_WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// Any duplex byte stream a tunnel can run over
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased logical stream handed out by a multiplexer
pub type BoxedStream = Box<dyn TunnelIo>;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("protocol error: {0}")]
    Protocol(#[from] burrow_proto::ProtocolError),

    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("peer requested encryption but no key is provisioned")]
    MissingKey,

    #[error("multiplexer session closed")]
    SessionClosed,

    #[error("multiplexer error: {0}")]
    Mux(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;
