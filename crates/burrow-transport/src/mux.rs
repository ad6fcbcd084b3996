//! Stream multiplexer abstraction
//!
//! A multiplexer turns one reliable duplex connection into many logical
//! streams that either side may open. The gateway runs the server role on
//! each agent's control connection; the agent runs the client role.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{BoxedStream, TransportResult};

/// Opens logical streams over an established session.
/// Safe to call concurrently from many forwarding tasks.
#[async_trait]
pub trait StreamOpener: Send + Sync {
    async fn open_stream(&self) -> TransportResult<BoxedStream>;

    /// Tears the session down. Idempotent.
    async fn close(&self);
}

/// Yields streams opened by the remote side.
#[async_trait]
pub trait StreamAcceptor: Send {
    /// `None` once the session is closed.
    async fn accept_stream(&mut self) -> Option<BoxedStream>;
}

/// A running multiplexed session.
pub struct MuxSession {
    pub opener: Arc<dyn StreamOpener>,
    pub incoming: Box<dyn StreamAcceptor>,
    /// Cancelled exactly once when the underlying connection goes away.
    pub closed: CancellationToken,
}

/// Builds multiplexed sessions on top of raw connections.
pub trait Multiplexer: Send + Sync {
    fn server(&self, io: BoxedStream) -> MuxSession;

    fn client(&self, io: BoxedStream) -> MuxSession;
}
