use crate::io_util::{read_cancellable, ReadEvent};
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use tapx_core::events::SocketEvent;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const EVENT_HEADER_LEN: usize = 20;
const MAX_EVENT_PAYLOAD: usize = 16 * 1024 * 1024;

/// Accept the kernel tracer's connection and feed decoded socket events to
/// the factory. Events that cannot be forwarded without blocking are dropped:
/// the tracer must never stall behind the consumer.
pub async fn run_event_ingest(
    listen: SocketAddr,
    events: mpsc::Sender<SocketEvent>,
    token: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("event ingest bind failed on {}", listen))?;
    info!(addr = %listen, "event ingest listening");

    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (stream, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = ?err, "event ingest accept failed");
                continue;
            }
        };
        info!(remote = %remote, "tracer connected");
        let events = events.clone();
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_tracer(stream, events, token).await {
                warn!(remote = %remote, error = %err, "tracer stream failed");
            }
        });
    }
}

async fn serve_tracer(
    mut stream: TcpStream,
    events: mpsc::Sender<SocketEvent>,
    token: CancellationToken,
) -> Result<()> {
    let mut pending = BytesMut::new();
    let mut chunk = vec![0u8; 64 * 1024];

    loop {
        while pending.len() < EVENT_HEADER_LEN {
            match read_cancellable(&mut stream, &mut chunk, &token).await? {
                ReadEvent::Data(n) => pending.extend_from_slice(&chunk[..n]),
                ReadEvent::Eof => return Ok(()),
                ReadEvent::Cancelled => return Ok(()),
            }
        }
        let payload_len = u32::from_le_bytes(
            pending[16..EVENT_HEADER_LEN]
                .try_into()
                .expect("payload length bytes"),
        ) as usize;
        if payload_len > MAX_EVENT_PAYLOAD {
            return Err(anyhow::anyhow!("tracer event payload too large: {payload_len}"));
        }
        let total = EVENT_HEADER_LEN + payload_len;
        while pending.len() < total {
            match read_cancellable(&mut stream, &mut chunk, &token).await? {
                ReadEvent::Data(n) => pending.extend_from_slice(&chunk[..n]),
                ReadEvent::Eof => {
                    return Err(anyhow::anyhow!("tracer stream ended mid-event"));
                }
                ReadEvent::Cancelled => return Ok(()),
            }
        }

        let raw: Bytes = pending.split_to(total).freeze();
        match SocketEvent::decode_wire(raw) {
            Ok(event) => {
                if events.try_send(event).is_err() {
                    warn!("event channel full; dropping socket event");
                }
            }
            Err(err) => {
                // One bad frame poisons the framing; resync by reconnect.
                return Err(err.context("tracer event decode failed"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapx_core::events::Direction;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn events_flow_from_tracer_to_channel() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);

        let (event_tx, mut event_rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let ingest = tokio::spawn(run_event_ingest(addr, event_tx, token.clone()));

        // Give the listener a moment to bind.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let mut tracer = TcpStream::connect(addr).await?;
        let mut buf = Vec::new();
        for event in [
            SocketEvent::Open { conn_id: 5 },
            SocketEvent::Data {
                conn_id: 5,
                direction: Direction::Ingress,
                payload: Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"),
            },
            SocketEvent::Close { conn_id: 5 },
        ] {
            event.encode_wire(&mut buf)?;
            tracer.write_all(&buf).await?;
        }

        assert_eq!(event_rx.recv().await, Some(SocketEvent::Open { conn_id: 5 }));
        match event_rx.recv().await {
            Some(SocketEvent::Data { conn_id, direction, payload }) => {
                assert_eq!(conn_id, 5);
                assert_eq!(direction, Direction::Ingress);
                assert_eq!(payload.as_ref(), b"GET / HTTP/1.1\r\n\r\n");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(event_rx.recv().await, Some(SocketEvent::Close { conn_id: 5 }));

        token.cancel();
        ingest.await??;
        Ok(())
    }
}
