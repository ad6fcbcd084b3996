//! End-to-end tunnel tests: a relay and a real agent over loopback sockets.

use burrow_agent::{Agent, AgentConfig};
use burrow_gateway::{GatewayConfig, ListenerConfig, Relay};
use burrow_proto::PublicProtocol;
use burrow_transport::TunnelKey;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

fn relay_config(listener: ListenerConfig) -> GatewayConfig {
    let mut config = GatewayConfig::parse(
        r#"
gateway: { ip: 127.0.0.1, port: 0 }
clients:
  - identity: agent1
"#,
    )
    .unwrap();
    config.clients[0].listeners.push(listener);
    config
}

fn listener(protocol: PublicProtocol, internal_port: u16, encrypt: bool) -> ListenerConfig {
    ListenerConfig {
        public_protocol: protocol,
        public_ip: "127.0.0.1".to_string(),
        public_port: 0,
        internal_ip: "127.0.0.1".to_string(),
        internal_port,
        encrypt,
    }
}

async fn tcp_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    port
}

/// Echo server that records the source address of every datagram.
async fn udp_echo() -> (u16, Arc<Mutex<Vec<SocketAddr>>>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    let sources = Arc::new(Mutex::new(Vec::new()));
    let seen = sources.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            seen.lock().unwrap().push(from);
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    (port, sources)
}

/// Starts an agent for `identity` and waits until the relay sees it.
async fn connect_agent(relay: &Relay, identity: &str, key: Option<TunnelKey>) -> Arc<Agent> {
    let gateway = relay.gateway_addr().await.unwrap();
    let mut config = AgentConfig::new(identity, gateway.to_string())
        .with_reconnect_delay(Duration::from_millis(100));
    if let Some(key) = key {
        config = config.with_key(key);
    }
    let agent = Arc::new(Agent::new(config));
    tokio::spawn({
        let agent = agent.clone();
        async move { agent.run().await }
    });

    timeout(Duration::from_secs(5), async {
        while !relay.is_online(identity).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("agent should come online");
    agent
}

async fn public_addr(relay: &Relay) -> (String, SocketAddr) {
    let rule = relay.tunnels("agent1").await.unwrap().remove(0);
    let addr = relay.manager().local_addr("agent1", &rule.id).await.unwrap();
    (rule.id, addr)
}

async fn wait_stats(relay: &Relay, rule_id: &str, input: u64, output: u64) {
    timeout(Duration::from_secs(5), async {
        loop {
            let stats = relay.tunnel_stats("agent1", rule_id).await.unwrap();
            if stats.input == input && stats.output == output {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("counters should settle");
}

async fn ping_tcp(addr: SocketAddr) -> Vec<u8> {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    client.shutdown().await.unwrap();
    let mut out = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut out))
        .await
        .unwrap()
        .unwrap();
    out
}

async fn exchange_udp(client: &UdpSocket, target: SocketAddr, payload: &[u8]) -> Vec<u8> {
    client.send_to(payload, target).await.unwrap();
    let mut buf = vec![0u8; 2048];
    let (n, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf.truncate(n);
    buf
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tcp_ping_through_tunnel() {
    init_tracing();
    let backend = tcp_echo().await;
    let relay = Relay::new(relay_config(listener(PublicProtocol::Tcp, backend, false)), None);
    relay.start().await.unwrap();
    let agent = connect_agent(&relay, "agent1", None).await;

    let (rule_id, addr) = public_addr(&relay).await;
    assert_eq!(ping_tcp(addr).await, b"ping");
    wait_stats(&relay, &rule_id, 4, 4).await;

    agent.stop();
    relay.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_encrypted_tcp_ping_through_tunnel() {
    init_tracing();
    let backend = tcp_echo().await;
    let relay = Relay::new(relay_config(listener(PublicProtocol::Tcp, backend, true)), None);
    relay.start().await.unwrap();

    let key = TunnelKey::from_base64(&relay.key_for("agent1").await.unwrap()).unwrap();
    let agent = connect_agent(&relay, "agent1", Some(key)).await;

    let (rule_id, addr) = public_addr(&relay).await;
    assert_eq!(ping_tcp(addr).await, b"ping");
    assert_eq!(ping_tcp(addr).await, b"ping");
    wait_stats(&relay, &rule_id, 8, 8).await;

    agent.stop();
    relay.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_udp_pseudo_session_reuse_and_expiry() {
    init_tracing();
    let (backend, sources) = udp_echo().await;
    let relay = Relay::new(relay_config(listener(PublicProtocol::Udp, backend, false)), None)
        .with_udp_idle_timeout(Duration::from_millis(600));
    relay.start().await.unwrap();
    let agent = connect_agent(&relay, "agent1", None).await;

    let (rule_id, target) = public_addr(&relay).await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    assert_eq!(exchange_udp(&client, target, b"first").await, b"first");
    assert_eq!(exchange_udp(&client, target, b"second").await, b"second");

    // The agent binds one local socket per stream, so a shared stream shows
    // up at the backend as a single source address.
    {
        let seen = sources.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], seen[1]);
    }

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(exchange_udp(&client, target, b"third").await, b"third");
    {
        let seen = sources.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_ne!(seen[2], seen[0], "expired session must open a fresh stream");
    }

    wait_stats(&relay, &rule_id, 16, 16).await;
    agent.stop();
    relay.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_identity_never_registers() {
    init_tracing();
    let backend = tcp_echo().await;
    let relay = Relay::new(relay_config(listener(PublicProtocol::Tcp, backend, false)), None);
    relay.start().await.unwrap();

    let gateway = relay.gateway_addr().await.unwrap();
    let intruder = Arc::new(Agent::new(
        AgentConfig::new("intruder", gateway.to_string())
            .with_reconnect_delay(Duration::from_millis(50)),
    ));
    tokio::spawn({
        let intruder = intruder.clone();
        async move { intruder.run().await }
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!relay.is_online("intruder").await);
    assert_eq!(relay.registry().count().await, 0);

    intruder.stop();
    relay.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_agent_reconnects_after_session_loss() {
    init_tracing();
    let backend = tcp_echo().await;
    let relay = Relay::new(relay_config(listener(PublicProtocol::Tcp, backend, false)), None);
    relay.start().await.unwrap();
    let agent = connect_agent(&relay, "agent1", None).await;
    let first = relay.registry().get("agent1").await.unwrap();

    first.close().await;
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(session) = relay.registry().get("agent1").await {
                if session.id != first.id {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("agent should reconnect with a new session");

    let (_, addr) = public_addr(&relay).await;
    assert_eq!(ping_tcp(addr).await, b"ping");

    agent.stop();
    relay.shutdown().await;
}
