//! Per-stream forwarding on the agent
//!
//! Each stream the gateway opens carries one public flow. TCP flows are
//! joined with a fresh connection to the internal address. UDP flows get a
//! connected local socket, with datagrams framed in both directions.

use burrow_proto::{ProtocolError, PublicProtocol, TunnelDescriptor, UdpDatagram};
use burrow_transport::conn::write_with_deadline;
use burrow_transport::{
    accept_tunnel, join, BoxedStream, TransportError, TunnelConn, TunnelKey, CONTROL_WRITE_TIMEOUT,
};
use std::io::ErrorKind;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::WriteHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Largest datagram read from a local UDP backend
const UDP_BUFFER_SIZE: usize = 64 * 1024;

/// Errors that end a single forwarded flow
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("Failed to connect to internal address {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error during forwarding: {0}")]
    Io(#[from] std::io::Error),
}

/// Serves one stream pushed by the gateway: reads the preamble, dials the
/// described backend and relays until either side is done.
pub async fn handle_stream(
    stream: BoxedStream,
    key: Option<TunnelKey>,
) -> Result<(), ForwarderError> {
    let (conn, descriptor) = accept_tunnel(stream, key.as_ref()).await?;
    debug!(
        public = %descriptor.public_addr(),
        internal = %descriptor.internal_addr(),
        protocol = %descriptor.public_protocol,
        encrypted = conn.is_encrypted(),
        "Accepted tunnel stream"
    );

    match descriptor.public_protocol {
        PublicProtocol::Tcp => forward_tcp(conn, &descriptor).await,
        PublicProtocol::Udp => forward_udp(conn, &descriptor).await,
    }
}

async fn forward_tcp(conn: TunnelConn, descriptor: &TunnelDescriptor) -> Result<(), ForwarderError> {
    let address = descriptor.internal_addr();
    let local = TcpStream::connect(&address)
        .await
        .map_err(|source| ForwarderError::ConnectionFailed {
            address: address.clone(),
            source,
        })?;

    let stats = join(conn, local).await;
    info!(
        internal = %address,
        bytes_to_local = stats.a_to_b,
        bytes_to_tunnel = stats.b_to_a,
        "TCP forward completed"
    );
    Ok(())
}

/// One local socket per stream. Frames from the tunnel become datagrams to
/// the backend; the backend's replies are framed back onto the stream.
async fn forward_udp(conn: TunnelConn, descriptor: &TunnelDescriptor) -> Result<(), ForwarderError> {
    let address = descriptor.internal_addr();
    let bind_addr = match descriptor.internal_ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => "[::]:0",
        _ => "0.0.0.0:0",
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket
        .connect(&address)
        .await
        .map_err(|source| ForwarderError::ConnectionFailed {
            address: address.clone(),
            source,
        })?;
    let socket = Arc::new(socket);

    let (mut reader, writer) = tokio::io::split(conn);
    let done = CancellationToken::new();
    let replies = tokio::spawn(relay_replies(socket.clone(), writer, done.clone()));

    let mut to_local = 0u64;
    let result = loop {
        let datagram = match UdpDatagram::read_from(&mut reader).await {
            Ok(datagram) => datagram,
            Err(ProtocolError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => break Ok(()),
            Err(e) => break Err(e.into()),
        };
        // A backend that is not up yet refuses; keep the flow alive
        match socket.send(datagram.payload()).await {
            Ok(n) => to_local += n as u64,
            Err(e) => debug!(internal = %address, "UDP send to backend failed: {}", e),
        }
    };

    done.cancel();
    let to_tunnel = replies.await.unwrap_or_default();
    info!(
        internal = %address,
        bytes_to_local = to_local,
        bytes_to_tunnel = to_tunnel,
        "UDP forward completed"
    );
    result
}

async fn relay_replies(
    socket: Arc<UdpSocket>,
    mut writer: WriteHalf<TunnelConn>,
    done: CancellationToken,
) -> u64 {
    let mut buffer = vec![0u8; UDP_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let received = tokio::select! {
            _ = done.cancelled() => break,
            received = socket.recv(&mut buffer) => received,
        };
        let n = match received {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => continue,
            Err(e) => {
                debug!("UDP receive from backend failed: {}", e);
                break;
            }
        };
        let frame = match UdpDatagram::encode_payload(&buffer[..n]) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Dropping oversized UDP reply: {}", e);
                continue;
            }
        };
        if let Err(e) = write_with_deadline(&mut writer, &frame, CONTROL_WRITE_TIMEOUT).await {
            debug!("UDP reply write failed: {}", e);
            break;
        }
        total += n as u64;
    }
    total
}
