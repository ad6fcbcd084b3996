//! XChaCha20 stream wrapper
//!
//! Each direction has its own nonce. The writer's nonce is sent in the clear
//! when the wrapper is built; the peer's nonce is read lazily on the first
//! read. There is no authentication tag, so this provides confidentiality
//! only.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::XChaCha20;
use rand::RngCore;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::key::TunnelKey;

pub const NONCE_LEN: usize = 24;

pub struct CipherStream<S> {
    inner: S,
    key: TunnelKey,
    encryptor: XChaCha20,
    decryptor: Option<XChaCha20>,
    peer_nonce: [u8; NONCE_LEN],
    peer_nonce_len: usize,
    // Ciphertext accepted by poll_write but not yet taken by `inner`
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<S> CipherStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps `inner`, writing this side's nonce before returning.
    pub async fn new(mut inner: S, key: &TunnelKey) -> io::Result<Self> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        inner.write_all(&nonce).await?;
        inner.flush().await?;

        Ok(Self {
            inner,
            key: key.clone(),
            encryptor: XChaCha20::new(key.as_bytes().into(), &nonce.into()),
            decryptor: None,
            peer_nonce: [0u8; NONCE_LEN],
            peer_nonce_len: 0,
            pending: Vec::new(),
            pending_pos: 0,
        })
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn poll_peer_nonce(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
        while self.peer_nonce_len < NONCE_LEN {
            let mut buf = ReadBuf::new(&mut self.peer_nonce[self.peer_nonce_len..]);
            ready!(Pin::new(&mut self.inner).poll_read(cx, &mut buf))?;
            let n = buf.filled().len();
            if n == 0 {
                if self.peer_nonce_len == 0 {
                    // Peer closed without ever writing
                    return Poll::Ready(Ok(false));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed inside cipher nonce",
                )));
            }
            self.peer_nonce_len += n;
        }
        self.decryptor = Some(XChaCha20::new(
            self.key.as_bytes().into(),
            &self.peer_nonce.into(),
        ));
        Poll::Ready(Ok(true))
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let n = ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pending_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_pos += n;
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncRead for CipherStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.decryptor.is_none() && !ready!(this.poll_peer_nonce(cx))? {
            return Poll::Ready(Ok(()));
        }

        let start = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if let Some(decryptor) = this.decryptor.as_mut() {
            decryptor.apply_keystream(&mut buf.filled_mut()[start..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncWrite for CipherStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        this.pending.extend_from_slice(data);
        this.encryptor.apply_keystream(&mut this.pending);
        // The ciphertext is owned now; whatever `inner` doesn't take yet is
        // pushed out by the next write or flush.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    async fn roundtrip(payload: &[u8], writer_key: &TunnelKey, reader_key: &TunnelKey) -> Vec<u8> {
        let (a, b) = duplex(1024);
        let expected = payload.len();
        let payload = payload.to_vec();
        let writer_key = writer_key.clone();

        let writer = tokio::spawn(async move {
            let mut enc = CipherStream::new(a, &writer_key).await.unwrap();
            enc.write_all(&payload).await.unwrap();
            enc.shutdown().await.unwrap();
        });

        let mut dec = CipherStream::new(b, reader_key).await.unwrap();
        let mut out = Vec::with_capacity(expected);
        dec.read_to_end(&mut out).await.unwrap();
        writer.await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_roundtrip_sizes() {
        let key = TunnelKey::generate();
        for size in [0usize, 1, 65535] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let out = roundtrip(&payload, &key, &key).await;
            assert_eq!(out, payload, "size {size}");
        }
    }

    #[tokio::test]
    async fn test_wrong_key_yields_garbage() {
        let payload = b"the quick brown fox jumps over the lazy dog".to_vec();
        let out = roundtrip(&payload, &TunnelKey::generate(), &TunnelKey::generate()).await;
        assert_eq!(out.len(), payload.len());
        assert_ne!(out, payload);
    }

    #[tokio::test]
    async fn test_nonce_sent_in_clear_then_ciphertext() {
        let (a, mut raw) = duplex(1024);
        let key = TunnelKey::generate();
        let mut enc = CipherStream::new(a, &key).await.unwrap();
        enc.write_all(b"secret").await.unwrap();
        enc.flush().await.unwrap();

        let mut wire = [0u8; NONCE_LEN + 6];
        raw.read_exact(&mut wire).await.unwrap();
        assert_ne!(&wire[NONCE_LEN..], b"secret");

        let mut cipher = XChaCha20::new(key.as_bytes().into(), (&wire[..NONCE_LEN]).into());
        let mut body = wire[NONCE_LEN..].to_vec();
        cipher.apply_keystream(&mut body);
        assert_eq!(body, b"secret");
    }

    #[tokio::test]
    async fn test_full_duplex() {
        let (a, b) = duplex(256);
        let key = TunnelKey::generate();
        let k2 = key.clone();

        let peer = tokio::spawn(async move {
            let mut s = CipherStream::new(b, &k2).await.unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
            s.flush().await.unwrap();
        });

        let mut s = CipherStream::new(a, &key).await.unwrap();
        s.write_all(b"ping").await.unwrap();
        s.flush().await.unwrap();
        let mut buf = [0u8; 4];
        s.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_truncated_nonce_is_error() {
        let (a, mut raw) = duplex(64);
        raw.write_all(&[1u8; 10]).await.unwrap();
        raw.shutdown().await.unwrap();
        let mut s = CipherStream::new(a, &TunnelKey::generate()).await.unwrap();
        let mut buf = [0u8; 8];
        let err = s.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
