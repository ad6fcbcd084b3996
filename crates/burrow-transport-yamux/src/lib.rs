//! Yamux multiplexer for burrow control connections
//!
//! Each session gets a driver task that keeps polling the yamux state
//! machine. Inbound streams are forwarded to the session's acceptor; when the
//! connection fails or either side closes, the session's `closed` token is
//! cancelled once and the raw connection is dropped.

use async_trait::async_trait;
use burrow_transport::{
    BoxedStream, MuxSession, Multiplexer, StreamAcceptor, StreamOpener, TransportError,
    TransportResult,
};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_yamux::session::SessionType;
use tokio_yamux::{Config, Control, Session};
use tracing::{debug, trace};

/// Keepalive tuning for a yamux session
#[derive(Debug, Clone)]
pub struct YamuxSettings {
    pub keepalive_interval: Duration,
    /// A write stalled for this long marks the connection dead.
    pub write_timeout: Duration,
}

impl Default for YamuxSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(1),
            write_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct YamuxMultiplexer {
    settings: YamuxSettings,
}

impl YamuxMultiplexer {
    pub fn new(settings: YamuxSettings) -> Self {
        Self { settings }
    }

    fn config(&self) -> Config {
        Config {
            enable_keepalive: true,
            keepalive_interval: self.settings.keepalive_interval,
            connection_write_timeout: self.settings.write_timeout,
            ..Config::default()
        }
    }

    fn start(&self, io: BoxedStream, mode: SessionType) -> MuxSession {
        let session = Session::new(io, self.config(), mode);
        let control = session.control();
        let closed = CancellationToken::new();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        tokio::spawn(drive(session, incoming_tx, closed.clone()));

        MuxSession {
            opener: Arc::new(YamuxOpener {
                control,
                closed: closed.clone(),
            }),
            incoming: Box::new(YamuxAcceptor { incoming_rx }),
            closed,
        }
    }
}

impl Multiplexer for YamuxMultiplexer {
    fn server(&self, io: BoxedStream) -> MuxSession {
        self.start(io, SessionType::Server)
    }

    fn client(&self, io: BoxedStream) -> MuxSession {
        self.start(io, SessionType::Client)
    }
}

async fn drive(
    mut session: Session<BoxedStream>,
    incoming_tx: mpsc::UnboundedSender<BoxedStream>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                debug!("Yamux session closed locally");
                break;
            }
            next = session.next() => match next {
                Some(Ok(stream)) => {
                    trace!("Inbound yamux stream");
                    // Nobody accepting on this side; the stream is dropped.
                    let _ = incoming_tx.send(Box::new(stream));
                }
                Some(Err(e)) => {
                    debug!("Yamux session error: {:?}", e);
                    break;
                }
                None => {
                    debug!("Yamux session ended by peer");
                    break;
                }
            }
        }
    }
    closed.cancel();
}

struct YamuxOpener {
    control: Control,
    closed: CancellationToken,
}

#[async_trait]
impl StreamOpener for YamuxOpener {
    async fn open_stream(&self) -> TransportResult<BoxedStream> {
        if self.closed.is_cancelled() {
            return Err(TransportError::SessionClosed);
        }
        let mut control = self.control.clone();
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::SessionClosed),
            opened = control.open_stream() => match opened {
                Ok(stream) => Ok(Box::new(stream) as BoxedStream),
                Err(e) => Err(TransportError::Mux(format!("{:?}", e))),
            },
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

struct YamuxAcceptor {
    incoming_rx: mpsc::UnboundedReceiver<BoxedStream>,
}

#[async_trait]
impl StreamAcceptor for YamuxAcceptor {
    async fn accept_stream(&mut self) -> Option<BoxedStream> {
        self.incoming_rx.recv().await
    }
}
