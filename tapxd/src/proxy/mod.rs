pub mod destination;

use crate::integrations::{BoxedIo, ConnContext};
use crate::io_prefix::PeekedIo;
use crate::io_util::read_initial_buffer;
use crate::net;
use crate::runtime::{next_conn_id, RuntimeState};
use anyhow::{anyhow, Result};
use metrics::{counter, histogram};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tapx_core::config::SessionMode;
use tapx_core::error::{is_cancelled, label_of, TapError};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Run the transparent proxy: accept, resolve the original destination,
/// classify by initial bytes, hand off to a codec in the session's mode.
pub async fn run(state: Arc<RuntimeState>, token: CancellationToken) -> Result<()> {
    let addr: SocketAddr = state.config.proxy.listen.parse()?;
    let listeners = net::bind_tcp_listeners(addr, &state.config.runtime)?;
    info!(
        addr = %addr,
        mode = %state.mode,
        session = %state.config.session.name,
        acceptors = listeners.len(),
        "proxy listening"
    );
    serve(state, token, listeners).await
}

/// Accept on already-bound listeners. Split from `run` so embedders can bind
/// an ephemeral port and learn it before traffic starts.
pub async fn serve(
    state: Arc<RuntimeState>,
    token: CancellationToken,
    listeners: Vec<TcpListener>,
) -> Result<()> {
    let mut acceptors = Vec::with_capacity(listeners.len());
    for listener in listeners {
        acceptors.push(tokio::spawn(run_acceptor(
            listener,
            state.clone(),
            token.clone(),
        )));
    }
    for acceptor in acceptors {
        match acceptor.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(err) => return Err(anyhow!("acceptor task failed: {}", err)),
        }
    }
    Ok(())
}

async fn run_acceptor(
    listener: TcpListener,
    state: Arc<RuntimeState>,
    token: CancellationToken,
) -> Result<()> {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (stream, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = ?err, "accept failed");
                continue;
            }
        };
        let Ok(permit) = state.connection_semaphore.clone().try_acquire_owned() else {
            warn!(remote = %remote, "connection limit reached; dropping connection");
            continue;
        };

        let state = state.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let started = Instant::now();
            let conn_id = next_conn_id();
            let result = handle_connection(stream, remote, conn_id, &state, token).await;

            let label = match &result {
                Ok(()) => "ok",
                Err(err) if is_cancelled(err) => "cancelled",
                Err(err) => label_of(err),
            };
            counter!(state.metric_names.connections_total.clone(), "result" => label)
                .increment(1);
            histogram!(state.metric_names.connection_latency_ms.clone())
                .record(started.elapsed().as_secs_f64() * 1000.0);

            // Per-connection errors never stop the accept loop; cancellation
            // is success at this boundary.
            if let Err(err) = result {
                if !is_cancelled(&err) {
                    error!(conn_id, remote = %remote, error = format!("{err:#}"), "connection failed");
                }
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    remote: SocketAddr,
    conn_id: u64,
    state: &Arc<RuntimeState>,
    token: CancellationToken,
) -> Result<()> {
    let dest = match state.resolver.resolve(&stream, remote) {
        Ok(dest) => Some(dest),
        Err(err) => {
            if state.mode == SessionMode::Record {
                // Record cannot proceed without somewhere to dial; never fall
                // through to replay behavior.
                return Err(TapError::UpstreamUnreachable(err.to_string()).into());
            }
            debug!(conn_id, error = %err, "no original destination; replay continues");
            None
        }
    };

    let initial = read_initial_buffer(
        &mut stream,
        state.config.proxy.peek_bytes,
        Duration::from_millis(state.config.proxy.peek_timeout_ms),
        &token,
    )
    .await?;
    let (codec_name, codec) = state.registry.classify(&initial, dest);
    debug!(
        conn_id,
        codec = codec_name,
        remote = %remote,
        dest = ?dest,
        initial_bytes = initial.len(),
        "connection classified"
    );

    // The codec sees the byte stream from its beginning: the classified
    // prefix is replayed ahead of the live socket.
    let client: BoxedIo = Box::new(PeekedIo::new(stream, initial));
    let ctx = ConnContext {
        conn_id,
        token: token.clone(),
        dest,
    };

    match state.mode {
        SessionMode::Record => {
            let dest = dest
                .ok_or_else(|| TapError::Internal("record mode without destination".to_string()))?;
            let dial = Duration::from_millis(state.config.proxy.dial_timeout_ms);
            let upstream = timeout(dial, TcpStream::connect(dest))
                .await
                .map_err(|_| TapError::UpstreamUnreachable(format!("dial {} timed out", dest)))?
                .map_err(|err| TapError::UpstreamUnreachable(format!("dial {}: {}", dest, err)))?;
            codec
                .record_outgoing(client, Box::new(upstream), state.mock_writer.clone(), ctx)
                .await
        }
        SessionMode::Replay => codec.mock_outgoing(client, state.mock_db.clone(), ctx).await,
    }
}
