use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::net::SocketAddr;

use super::types::*;
use crate::storage::TEST_REPORTS_DIR;

pub(super) fn validate_config(config: &Config) -> Result<()> {
    if config.version != 1 {
        return Err(anyhow!(
            "unsupported config.version {} (expected 1)",
            config.version
        ));
    }
    validate_session(&config.session)?;
    validate_proxy(&config.proxy)?;
    validate_runtime(&config.runtime)?;
    validate_system_log(&config.system_log)?;
    if let Some(metrics) = config.metrics.as_ref() {
        validate_metrics(metrics)?;
    }
    validate_factory(&config.factory)?;
    Ok(())
}

fn validate_session(session: &SessionConfig) -> Result<()> {
    let name = session.name.trim();
    if name.is_empty() {
        return Err(anyhow!("session.name must not be empty"));
    }
    if name == TEST_REPORTS_DIR {
        return Err(anyhow!(
            "session.name `{}` is reserved for run reports",
            TEST_REPORTS_DIR
        ));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(anyhow!("session.name must not contain path separators"));
    }
    Ok(())
}

fn validate_proxy(proxy: &ProxyConfig) -> Result<()> {
    proxy
        .listen
        .parse::<SocketAddr>()
        .map_err(|_| anyhow!("proxy.listen is not a valid socket address: {}", proxy.listen))?;
    if proxy.peek_bytes < 8 {
        // The PostgreSQL startup signature needs 8 bytes to classify.
        return Err(anyhow!("proxy.peek_bytes must be at least 8"));
    }
    if proxy.peek_bytes > 64 * 1024 {
        return Err(anyhow!("proxy.peek_bytes must be at most 65536"));
    }
    if proxy.peek_timeout_ms == 0 {
        return Err(anyhow!("proxy.peek_timeout_ms must be positive"));
    }
    if proxy.dial_timeout_ms == 0 {
        return Err(anyhow!("proxy.dial_timeout_ms must be positive"));
    }
    if proxy.mysql_ports.iter().any(|port| *port == 0) {
        return Err(anyhow!("proxy.mysql_ports must not contain port 0"));
    }
    validate_destination(&proxy.destination)
}

fn validate_destination(destination: &DestinationConfig) -> Result<()> {
    match destination.mode.as_str() {
        "kernel" => {}
        "static" => {
            if destination.static_targets.is_empty() && destination.fallback.is_none() {
                return Err(anyhow!(
                    "proxy.destination.mode `static` needs static_targets or a fallback"
                ));
            }
        }
        other => {
            return Err(anyhow!(
                "proxy.destination.mode must be `kernel` or `static`, got `{}`",
                other
            ));
        }
    }

    let mut sources = HashSet::new();
    for entry in &destination.static_targets {
        entry.source.parse::<SocketAddr>().map_err(|_| {
            anyhow!(
                "proxy.destination.static_targets source is not a socket address: {}",
                entry.source
            )
        })?;
        entry.target.parse::<SocketAddr>().map_err(|_| {
            anyhow!(
                "proxy.destination.static_targets target is not a socket address: {}",
                entry.target
            )
        })?;
        if !sources.insert(entry.source.as_str()) {
            return Err(anyhow!(
                "proxy.destination.static_targets has duplicate source {}",
                entry.source
            ));
        }
    }
    if let Some(fallback) = destination.fallback.as_deref() {
        fallback.parse::<SocketAddr>().map_err(|_| {
            anyhow!("proxy.destination.fallback is not a socket address: {}", fallback)
        })?;
    }
    Ok(())
}

fn validate_runtime(runtime: &RuntimeConfig) -> Result<()> {
    if runtime.worker_threads == Some(0) {
        return Err(anyhow!("runtime.worker_threads must be positive when set"));
    }
    if runtime.max_blocking_threads == Some(0) {
        return Err(anyhow!("runtime.max_blocking_threads must be positive when set"));
    }
    if runtime.acceptor_tasks_per_listener == Some(0) {
        return Err(anyhow!(
            "runtime.acceptor_tasks_per_listener must be positive when set"
        ));
    }
    if runtime.tcp_backlog <= 0 {
        return Err(anyhow!("runtime.tcp_backlog must be positive"));
    }
    if runtime.max_concurrent_connections == 0 {
        return Err(anyhow!("runtime.max_concurrent_connections must be positive"));
    }
    Ok(())
}

fn validate_system_log(log: &SystemLogConfig) -> Result<()> {
    if log.level.trim().is_empty() {
        return Err(anyhow!("system_log.level must not be empty"));
    }
    match log.format.as_str() {
        "json" | "pretty" => Ok(()),
        other => Err(anyhow!(
            "system_log.format must be `json` or `pretty`, got `{}`",
            other
        )),
    }
}

fn validate_metrics(metrics: &MetricsConfig) -> Result<()> {
    metrics.listen.parse::<SocketAddr>().map_err(|_| {
        anyhow!("metrics.listen is not a valid socket address: {}", metrics.listen)
    })?;
    if !metrics.path.starts_with('/') {
        return Err(anyhow!("metrics.path must start with `/`"));
    }
    let first = metrics
        .prefix
        .chars()
        .next()
        .ok_or_else(|| anyhow!("metrics.prefix must not be empty"))?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(anyhow!("metrics.prefix must start with [A-Za-z_]"));
    }
    if !metrics
        .prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(anyhow!("metrics.prefix must match [A-Za-z0-9_]+"));
    }
    Ok(())
}

fn validate_factory(factory: &FactoryConfig) -> Result<()> {
    if let Some(listen) = factory.event_listen.as_deref() {
        listen.parse::<SocketAddr>().map_err(|_| {
            anyhow!("factory.event_listen is not a valid socket address: {}", listen)
        })?;
    }
    if factory.mailbox_capacity == 0 {
        return Err(anyhow!("factory.mailbox_capacity must be positive"));
    }
    if factory.silence_flush_ms == 0 {
        return Err(anyhow!("factory.silence_flush_ms must be positive"));
    }
    Ok(())
}
