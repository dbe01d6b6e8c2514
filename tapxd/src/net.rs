use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use tapx_core::config::RuntimeConfig;
use tokio::net::TcpListener;
use tracing::warn;

pub fn worker_threads(cfg: &RuntimeConfig) -> usize {
    cfg.worker_threads.unwrap_or_else(default_parallelism)
}

pub fn max_blocking_threads(cfg: &RuntimeConfig) -> usize {
    cfg.max_blocking_threads
        .unwrap_or_else(|| worker_threads(cfg).saturating_mul(16).max(64))
}

pub fn acceptor_tasks(cfg: &RuntimeConfig) -> usize {
    cfg.acceptor_tasks_per_listener
        .unwrap_or_else(|| worker_threads(cfg))
        .max(1)
}

/// Bind one listener per acceptor task. More than one acceptor needs
/// SO_REUSEPORT; platforms without it fall back to a single acceptor.
pub fn bind_tcp_listeners(addr: SocketAddr, runtime: &RuntimeConfig) -> Result<Vec<TcpListener>> {
    let requested = acceptor_tasks(runtime);
    let effective = if requested <= 1 || !runtime.reuse_port {
        1
    } else if cfg!(unix) {
        requested
    } else {
        warn!(
            requested,
            "SO_REUSEPORT is unsupported on this platform; using a single acceptor"
        );
        1
    };

    let mut listeners = Vec::with_capacity(effective);
    for _ in 0..effective {
        listeners.push(bind_single(addr, runtime, effective > 1)?);
    }
    Ok(listeners)
}

fn bind_single(
    addr: SocketAddr,
    runtime: &RuntimeConfig,
    use_reuse_port: bool,
) -> Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .context("failed to create listening socket")?;
    socket
        .set_reuse_address(true)
        .context("failed to set SO_REUSEADDR")?;

    #[cfg(unix)]
    if use_reuse_port {
        socket
            .set_reuse_port(true)
            .context("failed to set SO_REUSEPORT")?;
    }
    #[cfg(not(unix))]
    let _ = use_reuse_port;

    socket
        .set_nonblocking(true)
        .context("failed to set nonblocking mode")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind failed on {}", addr))?;
    socket
        .listen(runtime.tcp_backlog)
        .with_context(|| format!("listen failed on {}", addr))?;

    let std_listener: StdTcpListener = socket.into();
    TcpListener::from_std(std_listener)
        .with_context(|| format!("tokio listener conversion failed for {}", addr))
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|v| v.get())
        .unwrap_or(1)
}
