//! Bidirectional byte join with per-direction counts

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const BUFFER_SIZE: usize = 32 * 1024;

/// Bytes moved by [`join`]. Counts are reported even when a leg failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinStats {
    /// Bytes read from `a` and written to `b`
    pub a_to_b: u64,
    /// Bytes read from `b` and written to `a`
    pub b_to_a: u64,
}

/// Copies both directions concurrently until each side reaches EOF or
/// errors. A finished direction shuts down its writer so the peer sees EOF.
pub async fn join<A, B>(a: A, b: B) -> JoinStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let (a_to_b, b_to_a) = tokio::join!(
        pipe(&mut a_read, &mut b_write, "a->b"),
        pipe(&mut b_read, &mut a_write, "b->a"),
    );

    JoinStats { a_to_b, b_to_a }
}

async fn pipe<R, W>(reader: &mut R, writer: &mut W, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(direction, error = %e, "Join read ended");
                break;
            }
        };
        if let Err(e) = writer.write_all(&buffer[..n]).await {
            debug!(direction, error = %e, "Join write ended");
            break;
        }
        if let Err(e) = writer.flush().await {
            debug!(direction, error = %e, "Join flush failed");
            break;
        }
        total += n as u64;
    }

    let _ = writer.shutdown().await;
    total
}
