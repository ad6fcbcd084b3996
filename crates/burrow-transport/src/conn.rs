//! Plain or cipher-wrapped tunnel connection

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::cipher::CipherStream;
use crate::{BoxedStream, TransportError, TransportResult, CONTROL_WRITE_TIMEOUT};

/// A logical stream after the encryption negotiation
pub enum TunnelConn {
    Plain(BoxedStream),
    Encrypted(CipherStream<BoxedStream>),
}

impl TunnelConn {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, TunnelConn::Encrypted(_))
    }

    /// Writes one control frame under [`CONTROL_WRITE_TIMEOUT`].
    pub async fn write_control(&mut self, frame: &[u8]) -> TransportResult<()> {
        write_with_deadline(self, frame, CONTROL_WRITE_TIMEOUT).await
    }
}

/// `write_all` + `flush`, failing with [`TransportError::WriteTimeout`]
/// when the peer stops draining for longer than `deadline`.
pub async fn write_with_deadline<W>(
    writer: &mut W,
    buf: &[u8],
    deadline: Duration,
) -> TransportResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let write = async {
        writer.write_all(buf).await?;
        writer.flush().await
    };
    match tokio::time::timeout(deadline, write).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(TransportError::WriteTimeout(deadline)),
    }
}

impl AsyncRead for TunnelConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelConn::Plain(s) => Pin::new(s).poll_read(cx, buf),
            TunnelConn::Encrypted(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TunnelConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TunnelConn::Plain(s) => Pin::new(s).poll_write(cx, buf),
            TunnelConn::Encrypted(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelConn::Plain(s) => Pin::new(s).poll_flush(cx),
            TunnelConn::Encrypted(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelConn::Plain(s) => Pin::new(s).poll_shutdown(cx),
            TunnelConn::Encrypted(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
