//! UDP tunnel server
//!
//! Datagrams are grouped by sender address into pseudo-sessions. The first
//! datagram from a new sender opens a tunnel stream and runs the preamble;
//! later datagrams within the session window reuse that stream. Replies from
//! the agent are read by a per-session task and sent back to the sender.

use burrow_control::{
    IoCounters, KeyStore, ListenerHandle, RegistryError, SessionRegistry, UdpSession,
    UdpSessionTable, DEFAULT_UDP_IDLE_TIMEOUT,
};
use burrow_proto::{TunnelRule, UdpDatagram};
use burrow_transport::{open_tunnel, TransportError, TunnelConn};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::ReadHalf;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One UDP datagram can carry at most this much
const RECV_BUFFER_SIZE: usize = 64 * 1024;

const REPLY_QUEUE_DEPTH: usize = 1024;

type Reply = (Bytes, SocketAddr);

#[derive(Debug, Error)]
pub enum UdpServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind UDP {address}:{port}: {reason}")]
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

/// Serves one UDP tunnel rule
pub struct UdpTunnelServer {
    rule: Arc<TunnelRule>,
    registry: SessionRegistry,
    keys: Arc<KeyStore>,
    counters: Arc<IoCounters>,
    idle_timeout: Duration,
}

impl UdpTunnelServer {
    pub fn new(rule: TunnelRule, registry: SessionRegistry, keys: Arc<KeyStore>) -> Self {
        Self {
            rule: Arc::new(rule),
            registry,
            keys,
            counters: Arc::new(IoCounters::new()),
            idle_timeout: DEFAULT_UDP_IDLE_TIMEOUT,
        }
    }

    pub fn with_counters(mut self, counters: Arc<IoCounters>) -> Self {
        self.counters = counters;
        self
    }

    /// Lifetime of each pseudo-session, counted from its creation
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub async fn start(self) -> Result<ListenerHandle, UdpServerError> {
        let socket = UdpSocket::bind(self.rule.public_addr())
            .await
            .map_err(|e| UdpServerError::BindError {
                address: self.rule.public_ip.clone(),
                port: self.rule.public_port,
                reason: e.to_string(),
            })?;
        let local_addr = socket.local_addr()?;

        info!(
            identity = %self.rule.identity,
            rule_id = %self.rule.id,
            internal = %self.rule.descriptor().internal_addr(),
            "UDP tunnel listening on {}",
            local_addr
        );

        let handle = ListenerHandle::new(local_addr, self.counters.clone());
        tokio::spawn(self.recv_loop(
            socket,
            local_addr,
            handle.shutdown_signal(),
            handle.stopped_signal(),
        ));
        Ok(handle)
    }

    /// Owns the socket. Replies from every pseudo-session come back through
    /// `replies_rx` so that dropping the socket here releases the port.
    async fn recv_loop(
        self,
        socket: UdpSocket,
        local_addr: SocketAddr,
        shutdown: CancellationToken,
        stopped: CancellationToken,
    ) {
        let table = UdpSessionTable::new(self.idle_timeout);
        let (replies_tx, mut replies_rx) = mpsc::channel::<Reply>(REPLY_QUEUE_DEPTH);
        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let (n, remote) = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some((payload, remote)) = replies_rx.recv() => {
                    match socket.send_to(&payload, remote).await {
                        Ok(sent) => self.counters.add_output(sent as u64),
                        Err(e) => warn!(remote = %remote, "UDP send failed: {}", e),
                    }
                    continue;
                }
                received = socket.recv_from(&mut buffer) => match received {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(rule_id = %self.rule.id, "UDP receive failed: {}", e);
                        continue;
                    }
                },
            };

            let session = match table.get(&remote).await {
                Some(session) => session,
                None => match self.open_session(remote, local_addr, &table, &replies_tx).await {
                    Ok(session) => session,
                    Err(e) => {
                        warn!(remote = %remote, "Dropping UDP datagram: {}", e);
                        continue;
                    }
                },
            };

            let frame = match UdpDatagram::encode_payload(&buffer[..n]) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(remote = %remote, "Dropping UDP datagram: {}", e);
                    continue;
                }
            };
            if let Err(e) = session.write_frame(&frame).await {
                warn!(remote = %remote, "UDP tunnel write failed: {}", e);
                table.remove(&remote, session.id).await;
                continue;
            }
            self.counters.add_input(n as u64);
        }

        debug!(rule_id = %self.rule.id, "UDP listener stopped");
        table.clear().await;
        drop(socket);
        stopped.cancel();
    }

    async fn open_session(
        &self,
        remote: SocketAddr,
        local_addr: SocketAddr,
        table: &UdpSessionTable,
        replies_tx: &mpsc::Sender<Reply>,
    ) -> Result<Arc<UdpSession>, UdpServerError> {
        let stream = self.registry.get_stream(&self.rule.identity).await?;
        let key = self.rule.encrypt.then(|| self.keys.get(&self.rule.identity));
        let conn = open_tunnel(stream, key.as_ref(), &self.rule.descriptor()).await?;

        let (reader, writer) = tokio::io::split(conn);
        let session = table.add(remote, local_addr, writer).await;
        tokio::spawn(relay_replies(
            reader,
            remote,
            session.id,
            session.closed_token(),
            table.clone(),
            replies_tx.clone(),
        ));

        info!(
            identity = %self.rule.identity,
            remote = %remote,
            session_id = session.id,
            "UDP pseudo-session opened"
        );
        Ok(session)
    }
}

/// Decodes datagram frames from the agent and queues them for `remote`
/// until the stream ends or the session is closed.
async fn relay_replies(
    mut reader: ReadHalf<TunnelConn>,
    remote: SocketAddr,
    session_id: u64,
    closed: CancellationToken,
    table: UdpSessionTable,
    replies_tx: mpsc::Sender<Reply>,
) {
    loop {
        let datagram = tokio::select! {
            _ = closed.cancelled() => break,
            read = UdpDatagram::read_from(&mut reader) => match read {
                Ok(datagram) => datagram,
                Err(e) => {
                    debug!(remote = %remote, "UDP reply stream ended: {}", e);
                    break;
                }
            },
        };

        if replies_tx.send((datagram.into_payload(), remote)).await.is_err() {
            // Listener is gone
            break;
        }
    }
    table.remove(&remote, session_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_proto::PublicProtocol;
    use burrow_transport::{accept_tunnel, Multiplexer};
    use burrow_transport_yamux::YamuxMultiplexer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    fn rule() -> TunnelRule {
        TunnelRule {
            id: "rule-udp".to_string(),
            identity: "agent1".to_string(),
            public_protocol: PublicProtocol::Udp,
            public_ip: "127.0.0.1".to_string(),
            public_port: 0,
            internal_ip: "127.0.0.1".to_string(),
            internal_port: 5353,
            encrypt: false,
        }
    }

    /// Registers "agent1" with an agent that echoes datagram frames and
    /// counts the flows it accepted.
    async fn echo_agent(registry: &SessionRegistry) -> Arc<AtomicUsize> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        registry
            .add_session("agent1", Box::new(server.unwrap().0))
            .await
            .unwrap();

        let flows = Arc::new(AtomicUsize::new(0));
        let counter = flows.clone();
        let mut session = YamuxMultiplexer::default().client(Box::new(client.unwrap()));
        tokio::spawn(async move {
            while let Some(stream) = session.incoming.accept_stream().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let (mut conn, desc) = accept_tunnel(stream, None).await.unwrap();
                    assert_eq!(desc.public_protocol, PublicProtocol::Udp);
                    while let Ok(d) = UdpDatagram::read_from(&mut conn).await {
                        let frame = d.encode().unwrap();
                        if conn.write_all(&frame).await.is_err() {
                            break;
                        }
                        let _ = conn.flush().await;
                    }
                });
            }
        });
        flows
    }

    async fn exchange(client: &UdpSocket, target: SocketAddr, payload: &[u8]) -> Vec<u8> {
        client.send_to(payload, target).await.unwrap();
        let mut buf = vec![0u8; 2048];
        let (n, from) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, target);
        buf.truncate(n);
        buf
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_datagrams_share_one_flow_until_expiry() {
        let registry = SessionRegistry::new(Arc::new(YamuxMultiplexer::default()));
        let flows = echo_agent(&registry).await;

        let handle = UdpTunnelServer::new(rule(), registry, Arc::new(KeyStore::new()))
            .with_idle_timeout(Duration::from_millis(500))
            .start()
            .await
            .unwrap();
        let target = handle.local_addr();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        assert_eq!(exchange(&client, target, b"one").await, b"one");
        assert_eq!(exchange(&client, target, b"two").await, b"two");
        assert_eq!(flows.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(exchange(&client, target, b"three").await, b"three");
        assert_eq!(flows.load(Ordering::SeqCst), 2);

        // "one" + "two" + "three" in each direction
        timeout(Duration::from_secs(5), async {
            while handle.counters().input() != 11 || handle.counters().output() != 11 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("counters should settle");
        handle.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remotes_get_separate_flows() {
        let registry = SessionRegistry::new(Arc::new(YamuxMultiplexer::default()));
        let flows = echo_agent(&registry).await;

        let handle = UdpTunnelServer::new(rule(), registry, Arc::new(KeyStore::new()))
            .start()
            .await
            .unwrap();
        let target = handle.local_addr();

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(exchange(&a, target, b"from-a").await, b"from-a");
        assert_eq!(exchange(&b, target, b"from-b").await, b"from-b");
        assert_eq!(exchange(&a, target, b"again-a").await, b"again-a");
        assert_eq!(flows.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_offline_agent_drops_datagrams() {
        let registry = SessionRegistry::new(Arc::new(YamuxMultiplexer::default()));
        let handle = UdpTunnelServer::new(rule(), registry, Arc::new(KeyStore::new()))
            .start()
            .await
            .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"lost", handle.local_addr()).await.unwrap();
        let mut buf = [0u8; 16];
        let reply = timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
        assert!(reply.is_err());
        assert_eq!(handle.counters().input(), 0);
    }

    #[tokio::test]
    async fn test_close_releases_port() {
        let registry = SessionRegistry::new(Arc::new(YamuxMultiplexer::default()));
        let handle = UdpTunnelServer::new(rule(), registry, Arc::new(KeyStore::new()))
            .start()
            .await
            .unwrap();
        let addr = handle.local_addr();

        timeout(Duration::from_secs(5), handle.close_and_wait())
            .await
            .unwrap();
        UdpSocket::bind(addr).await.expect("port should be released");
    }
}
