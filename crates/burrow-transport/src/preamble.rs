//! Per-flow preamble
//!
//! Every logical stream starts with the encryption negotiation frame,
//! followed by the tunnel descriptor (inside the cipher when encryption is
//! on), followed by payload.

use burrow_proto::{EncryptFlag, TunnelDescriptor};
use tracing::trace;

use crate::cipher::CipherStream;
use crate::conn::write_with_deadline;
use crate::key::TunnelKey;
use crate::{BoxedStream, TransportError, TransportResult, TunnelConn, CONTROL_WRITE_TIMEOUT};

/// Gateway side: announce encryption, wrap if needed, send the descriptor.
///
/// Encryption is on exactly when `key` is provided.
pub async fn open_tunnel(
    mut stream: BoxedStream,
    key: Option<&TunnelKey>,
    descriptor: &TunnelDescriptor,
) -> TransportResult<TunnelConn> {
    let flag = EncryptFlag::from(key.is_some());
    write_with_deadline(&mut stream, &flag.encode(), CONTROL_WRITE_TIMEOUT).await?;

    let mut conn = match key {
        Some(key) => encrypt(stream, key).await?,
        None => TunnelConn::Plain(stream),
    };

    conn.write_control(&descriptor.encode()?).await?;
    trace!(
        identity = %descriptor.identity,
        internal = %descriptor.internal_addr(),
        encrypted = conn.is_encrypted(),
        "Tunnel preamble sent"
    );
    Ok(conn)
}

/// Agent side: read the negotiation, wrap if asked to, read the descriptor.
pub async fn accept_tunnel(
    mut stream: BoxedStream,
    key: Option<&TunnelKey>,
) -> TransportResult<(TunnelConn, TunnelDescriptor)> {
    let flag = EncryptFlag::read_from(&mut stream).await?;

    let mut conn = if flag.is_on() {
        let key = key.ok_or(TransportError::MissingKey)?;
        encrypt(stream, key).await?
    } else {
        TunnelConn::Plain(stream)
    };

    let descriptor = TunnelDescriptor::read_from(&mut conn).await?;
    Ok((conn, descriptor))
}

/// Wraps `stream` in the cipher; the nonce write shares the control deadline.
async fn encrypt(stream: BoxedStream, key: &TunnelKey) -> TransportResult<TunnelConn> {
    let cipher = tokio::time::timeout(CONTROL_WRITE_TIMEOUT, CipherStream::new(stream, key))
        .await
        .map_err(|_| TransportError::WriteTimeout(CONTROL_WRITE_TIMEOUT))??;
    Ok(TunnelConn::Encrypted(cipher))
}
