//! Full-duplex byte copier between two streams.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A bidirectional async byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

#[derive(Debug, thiserror::Error)]
#[error("{side}: {source}")]
pub struct PipeError {
    /// Name of the stream whose read or write failed.
    pub side: String,
    #[source]
    pub source: io::Error,
}

/// Copies `a -> b` and `b -> a` until either direction hits EOF or an error,
/// then shuts both streams down and drops them.
///
/// Both directions run inside this future, so nothing keeps copying after it
/// returns. A clean close on either side is `Ok(())`.
pub async fn pipe<A, B>(a: A, a_name: &str, b: B, b_name: &str) -> Result<(), PipeError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_rd, mut a_wr) = tokio::io::split(a);
    let (mut b_rd, mut b_wr) = tokio::io::split(b);

    let res = {
        let a_to_b = copy_one_way(&mut a_rd, a_name, &mut b_wr, b_name);
        let b_to_a = copy_one_way(&mut b_rd, b_name, &mut a_wr, a_name);
        tokio::pin!(a_to_b, b_to_a);

        // The losing direction is cancelled when this block ends; its reader is
        // parked on a stream that is about to be shut down anyway.
        tokio::select! {
            r = &mut a_to_b => r,
            r = &mut b_to_a => r,
        }
    };

    let _ = a_wr.shutdown().await;
    let _ = b_wr.shutdown().await;

    res
}

async fn copy_one_way<R, W>(rd: &mut R, rd_name: &str, wr: &mut W, wr_name: &str) -> Result<(), PipeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = match rd.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(err) => return Err(side_err(rd_name, err)),
        };
        wr.write_all(&buf[..n]).await.map_err(|err| side_err(wr_name, err))?;
        wr.flush().await.map_err(|err| side_err(wr_name, err))?;
    }
}

fn side_err(side: &str, source: io::Error) -> PipeError {
    if tracing::enabled!(tracing::Level::DEBUG) {
        tracing::debug!(side = %side, err = %source, "bridge: copy failed");
    }
    PipeError {
        side: side.to_string(),
        source,
    }
}
