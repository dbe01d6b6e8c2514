use crate::config::{MetricsConfig, SystemLogConfig};
use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tracing_subscriber::EnvFilter;

const MAX_SCRAPE_REQUEST_BYTES: usize = 8 * 1024;
const SCRAPE_IO_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_logging(system: &SystemLogConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(system.level.clone()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false);

    if system.format.eq_ignore_ascii_case("json") {
        builder.json().try_init().map_err(|e| anyhow::anyhow!("{e}"))?;
    } else {
        builder.pretty().try_init().map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    Ok(())
}

/// Install the global Prometheus recorder and serve plaintext scrapes.
///
/// The endpoint is loopback-only: the daemon runs next to the application
/// under test and has no business exposing metrics beyond the host.
pub fn start_metrics(config: &MetricsConfig) -> Result<()> {
    let listen: SocketAddr = config.listen.parse()?;
    let path = config.path.clone();

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|e| anyhow::anyhow!("metrics recorder install failed: {}", e))?;

    let runtime = tokio::runtime::Handle::try_current()
        .context("metrics endpoint requires a running tokio runtime")?;
    runtime.spawn(async move {
        let listener = match TcpListener::bind(listen).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::warn!(error = ?err, "failed to bind metrics listener");
                return;
            }
        };
        loop {
            let (mut stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!(error = ?err, "metrics accept failed");
                    continue;
                }
            };
            let handle = handle.clone();
            let path = path.clone();
            tokio::spawn(async move {
                if !peer_addr.ip().is_loopback() {
                    let _ = write_response(&mut stream, "403 Forbidden", "forbidden").await;
                    return;
                }
                let request_path =
                    match timeout(SCRAPE_IO_TIMEOUT, read_request_path(&mut stream)).await {
                        Ok(Ok(Some(path))) => path,
                        Ok(Ok(None)) => return,
                        Ok(Err(_)) | Err(_) => {
                            let _ =
                                write_response(&mut stream, "400 Bad Request", "bad request").await;
                            return;
                        }
                    };
                let (status, body) = if request_path == "/health" {
                    ("200 OK", "OK".to_string())
                } else if request_path == path {
                    ("200 OK", handle.render())
                } else {
                    ("404 Not Found", "not found".to_string())
                };
                let _ = write_response(&mut stream, status, &body).await;
            });
        }
    });
    Ok(())
}

async fn write_response(
    stream: &mut tokio::net::TcpStream,
    status: &str,
    body: &str,
) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = timeout(SCRAPE_IO_TIMEOUT, stream.write_all(response.as_bytes())).await;
    let _ = timeout(SCRAPE_IO_TIMEOUT, stream.shutdown()).await;
    Ok(())
}

async fn read_request_path(stream: &mut tokio::net::TcpStream) -> Result<Option<String>> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        if buf.len().saturating_add(n) > MAX_SCRAPE_REQUEST_BYTES {
            return Err(anyhow::anyhow!("metrics request header too large"));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            return parse_request_line(&buf[..end]);
        }
    }
}

fn parse_request_line(raw: &[u8]) -> Result<Option<String>> {
    let request = std::str::from_utf8(raw)
        .map_err(|_| anyhow::anyhow!("metrics request is not valid utf-8"))?;
    let first = request.lines().next().unwrap_or_default();
    let mut parts = first.split_whitespace();
    let (method, path, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(p), Some(v)) => (m, p, v),
        _ => return Err(anyhow::anyhow!("malformed request line")),
    };
    if method != "GET" {
        return Err(anyhow::anyhow!("unsupported method"));
    }
    if !version.starts_with("HTTP/1.") {
        return Err(anyhow::anyhow!("unsupported http version"));
    }
    Ok(Some(path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_parses_path() {
        let path = parse_request_line(b"GET /metrics HTTP/1.1\r\nHost: x").unwrap();
        assert_eq!(path.as_deref(), Some("/metrics"));
    }

    #[test]
    fn non_get_is_rejected() {
        assert!(parse_request_line(b"POST /metrics HTTP/1.1").is_err());
    }
}
