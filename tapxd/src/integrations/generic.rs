use super::{sha256_hex, BoxedIo, ConnContext, Integration};
use crate::io_util::{read_cancellable, write_all_cancellable, ReadEvent};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tapx_core::error::TapError;
use tapx_core::mockdb::MockMemDb;
use tapx_core::models::{GenericSpec, Mock, MockKind, MockSpec};
use tapx_core::storage::MockWriter;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A response is considered finished once the server has been quiet this long
/// and the client speaks again, or on connection close.
const FLIP_IDLE: Duration = Duration::from_secs(2);

/// How long replay waits for stragglers of the client's current flush.
const FLUSH_SETTLE: Duration = Duration::from_millis(50);

/// Byte-faithful fallback with no framing awareness: two direction-tagged
/// accumulators, flushed into (request, response) pairs on direction flips.
pub struct Generic;

impl Generic {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Generic {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Integration for Generic {
    fn match_type(&self, _buf: &[u8]) -> bool {
        // The dispatcher falls back to this codec explicitly.
        false
    }

    async fn record_outgoing(
        &self,
        client: BoxedIo,
        upstream: BoxedIo,
        sink: Arc<dyn MockWriter>,
        ctx: ConnContext,
    ) -> Result<()> {
        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);
        let result = drive_record(
            &mut client_r,
            &mut client_w,
            &mut upstream_r,
            &mut upstream_w,
            sink.as_ref(),
            &ctx,
        )
        .await;
        let _ = client_w.shutdown().await;
        let _ = upstream_w.shutdown().await;
        result
    }

    async fn mock_outgoing(
        &self,
        mut client: BoxedIo,
        db: Arc<MockMemDb>,
        ctx: ConnContext,
    ) -> Result<()> {
        let result = replay_session(&mut client, db.as_ref(), &ctx).await;
        let _ = client.shutdown().await;
        result
    }
}

async fn drive_record(
    client_r: &mut ReadHalf<BoxedIo>,
    client_w: &mut WriteHalf<BoxedIo>,
    upstream_r: &mut ReadHalf<BoxedIo>,
    upstream_w: &mut WriteHalf<BoxedIo>,
    sink: &dyn MockWriter,
    ctx: &ConnContext,
) -> Result<()> {
    let token = &ctx.token;
    let mut request = Vec::new();
    let mut response = Vec::new();
    let mut server_spoke_last = false;
    let mut client_buf = vec![0u8; 16 * 1024];
    let mut upstream_buf = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            _ = token.cancelled() => return Err(TapError::Cancelled.into()),
            read = client_r.read(&mut client_buf) => {
                let n = read.map_err(TapError::Transient)?;
                if n == 0 {
                    break;
                }
                if server_spoke_last {
                    flush_pair(sink, ctx, &mut request, &mut response).await?;
                    server_spoke_last = false;
                }
                request.extend_from_slice(&client_buf[..n]);
                write_half(upstream_w, &client_buf[..n], token).await?;
            }
            read = upstream_r.read(&mut upstream_buf) => {
                let n = read.map_err(TapError::Transient)?;
                if n == 0 {
                    break;
                }
                response.extend_from_slice(&upstream_buf[..n]);
                write_half(client_w, &upstream_buf[..n], token).await?;
                server_spoke_last = true;
            }
            _ = tokio::time::sleep(FLIP_IDLE), if server_spoke_last => {
                flush_pair(sink, ctx, &mut request, &mut response).await?;
                server_spoke_last = false;
            }
        }
    }
    flush_pair(sink, ctx, &mut request, &mut response).await?;
    Ok(())
}

async fn flush_pair(
    sink: &dyn MockWriter,
    ctx: &ConnContext,
    request: &mut Vec<u8>,
    response: &mut Vec<u8>,
) -> Result<()> {
    if request.is_empty() || response.is_empty() {
        return Ok(());
    }
    let request = std::mem::take(request);
    let response = std::mem::take(response);
    let fingerprint = request_fingerprint(&request);
    debug!(
        conn_id = ctx.conn_id,
        request_bytes = request.len(),
        response_bytes = response.len(),
        "recording generic exchange"
    );
    let mock = Mock::new(MockSpec::Generic(GenericSpec {
        request,
        response,
        fingerprint,
    }));
    sink.write(mock).await
}

async fn replay_session(client: &mut BoxedIo, db: &MockMemDb, ctx: &ConnContext) -> Result<()> {
    let token = &ctx.token;
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        let mut request = Vec::new();
        match read_cancellable(client, &mut buf, token).await {
            Ok(ReadEvent::Data(n)) => request.extend_from_slice(&buf[..n]),
            Ok(ReadEvent::Eof) => return Ok(()),
            Ok(ReadEvent::Cancelled) => return Err(TapError::Cancelled.into()),
            Err(err) => return Err(TapError::Transient(err).into()),
        }
        // Collect the remainder of this flush before matching.
        let mut closed = false;
        loop {
            match timeout(FLUSH_SETTLE, read_cancellable(client, &mut buf, token)).await {
                Err(_) => break,
                Ok(Ok(ReadEvent::Data(n))) => request.extend_from_slice(&buf[..n]),
                Ok(Ok(ReadEvent::Eof)) => {
                    closed = true;
                    break;
                }
                Ok(Ok(ReadEvent::Cancelled)) => return Err(TapError::Cancelled.into()),
                Ok(Err(err)) => return Err(TapError::Transient(err).into()),
            }
        }

        let fingerprint = request_fingerprint(&request);
        let Some(mock) = db.find_next(MockKind::Generic, &fingerprint) else {
            return Err(TapError::NoMatch {
                kind: MockKind::Generic,
            }
            .into());
        };
        debug!(conn_id = ctx.conn_id, mock = %mock.name, "serving generic mock");
        let MockSpec::Generic(spec) = &mock.spec else {
            return Err(TapError::Internal("generic mock carries foreign spec".to_string()).into());
        };
        let progress = write_all_cancellable(client, &spec.response, token)
            .await
            .map_err(TapError::Transient)?;
        if progress.cancelled {
            return Err(TapError::Cancelled.into());
        }
        if closed {
            return Ok(());
        }
    }
}

fn request_fingerprint(request: &[u8]) -> String {
    sha256_hex(&[b"generic", request])
}

async fn write_half(
    writer: &mut WriteHalf<BoxedIo>,
    data: &[u8],
    token: &CancellationToken,
) -> Result<()> {
    let progress = write_all_cancellable(writer, data, token)
        .await
        .map_err(TapError::Transient)?;
    if progress.cancelled {
        return Err(TapError::Cancelled.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_per_request_bytes() {
        assert_eq!(request_fingerprint(b"ping"), request_fingerprint(b"ping"));
        assert_ne!(request_fingerprint(b"ping"), request_fingerprint(b"pong"));
    }
}
