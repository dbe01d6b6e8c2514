use anyhow::Result;
use bytes::Bytes;
use tapx_core::error::TapError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;

const WRITE_CHUNK: usize = 16 * 1024;

/// Outcome of one cancel-aware read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadEvent {
    Data(usize),
    Eof,
    Cancelled,
}

/// Read one chunk, aborting promptly when the token fires. Cancellation is
/// reported in-band so callers can distinguish it from I/O failure.
pub async fn read_cancellable<R>(
    reader: &mut R,
    buf: &mut [u8],
    token: &CancellationToken,
) -> std::io::Result<ReadEvent>
where
    R: AsyncRead + Unpin,
{
    tokio::select! {
        _ = token.cancelled() => Ok(ReadEvent::Cancelled),
        read = reader.read(buf) => match read? {
            0 => Ok(ReadEvent::Eof),
            n => Ok(ReadEvent::Data(n)),
        },
    }
}

/// How far a cancel-aware write got. `written` is valid even when the write
/// was cut short by cancellation; no partial chunk is ever left unreported.
#[derive(Debug, PartialEq, Eq)]
pub struct WriteProgress {
    pub written: usize,
    pub cancelled: bool,
}

/// Write all of `data`, checking the token at every chunk boundary.
pub async fn write_all_cancellable<W>(
    writer: &mut W,
    data: &[u8],
    token: &CancellationToken,
) -> std::io::Result<WriteProgress>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    for chunk in data.chunks(WRITE_CHUNK) {
        if token.is_cancelled() {
            return Ok(WriteProgress {
                written,
                cancelled: true,
            });
        }
        writer.write_all(chunk).await?;
        written += chunk.len();
    }
    Ok(WriteProgress {
        written,
        cancelled: false,
    })
}

/// Read the classification window: up to `want` bytes within `deadline`.
///
/// Returns whatever arrived when the deadline passes (classification can work
/// on a short buffer), an empty buffer on immediate EOF, and
/// `TapError::Cancelled` when the token fires first.
pub async fn read_initial_buffer<R>(
    stream: &mut R,
    want: usize,
    deadline: Duration,
    token: &CancellationToken,
) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let until = Instant::now() + deadline;
    let mut collected = Vec::with_capacity(want);
    let mut chunk = vec![0u8; want];

    while collected.len() < want {
        let remaining = until.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let space = want - collected.len();
        let read = timeout(
            remaining,
            read_cancellable(stream, &mut chunk[..space], token),
        )
        .await;
        match read {
            Ok(Ok(ReadEvent::Data(n))) => collected.extend_from_slice(&chunk[..n]),
            Ok(Ok(ReadEvent::Eof)) => break,
            Ok(Ok(ReadEvent::Cancelled)) => return Err(TapError::Cancelled.into()),
            Ok(Err(err)) => return Err(TapError::Transient(err).into()),
            Err(_) => break,
        }
    }
    Ok(Bytes::from(collected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn initial_buffer_returns_partial_on_timeout() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"GET ").await.unwrap();

        let token = CancellationToken::new();
        let buf = read_initial_buffer(&mut server, 32, Duration::from_millis(50), &token)
            .await
            .unwrap();
        assert_eq!(buf.as_ref(), b"GET ");
    }

    #[tokio::test]
    async fn initial_buffer_stops_at_want() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"0123456789").await.unwrap();

        let token = CancellationToken::new();
        let buf = read_initial_buffer(&mut server, 8, Duration::from_secs(1), &token)
            .await
            .unwrap();
        assert_eq!(buf.as_ref(), b"01234567");
    }

    #[tokio::test]
    async fn cancellation_wins_over_pending_read() {
        let (_client, mut server) = tokio::io::duplex(64);
        let token = CancellationToken::new();
        token.cancel();

        let err = read_initial_buffer(&mut server, 8, Duration::from_secs(5), &token)
            .await
            .unwrap_err();
        assert!(tapx_core::error::is_cancelled(&err));
    }

    #[tokio::test]
    async fn cancelled_write_reports_progress() {
        let (mut a, _b) = tokio::io::duplex(1 << 20);
        let token = CancellationToken::new();
        token.cancel();

        let progress = write_all_cancellable(&mut a, &[0u8; 4096], &token)
            .await
            .unwrap();
        assert_eq!(
            progress,
            WriteProgress {
                written: 0,
                cancelled: true
            }
        );
    }
}
