use super::defaults::*;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub version: u32,
    pub session: SessionConfig,
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub system_log: SystemLogConfig,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub factory: FactoryConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Record,
    Replay,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Record => f.write_str("record"),
            Self::Replay => f.write_str("replay"),
        }
    }
}

/// One run records into or replays from exactly one session; switching modes
/// mid-run is not supported.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    pub name: String,
    pub mode: SessionMode,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ProxyConfig {
    pub listen: String,
    #[serde(default = "default_peek_bytes")]
    pub peek_bytes: usize,
    #[serde(default = "default_peek_timeout_ms")]
    pub peek_timeout_ms: u64,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default)]
    pub destination: DestinationConfig,
    /// Destination ports treated as MySQL. The MySQL wire protocol is
    /// server-first, so it cannot be recognized from client prefix bytes.
    #[serde(default = "default_mysql_ports")]
    pub mysql_ports: Vec<u16>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DestinationConfig {
    #[serde(default = "default_destination_mode")]
    pub mode: String,
    #[serde(default)]
    pub static_targets: Vec<StaticTargetConfig>,
    #[serde(default)]
    pub fallback: Option<String>,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            mode: default_destination_mode(),
            static_targets: Vec::new(),
            fallback: None,
        }
    }
}

/// Maps an accepted connection's source address to the original destination.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StaticTargetConfig {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub worker_threads: Option<usize>,
    #[serde(default)]
    pub max_blocking_threads: Option<usize>,
    #[serde(default)]
    pub acceptor_tasks_per_listener: Option<usize>,
    #[serde(default = "default_reuse_port")]
    pub reuse_port: bool,
    #[serde(default = "default_tcp_backlog")]
    pub tcp_backlog: i32,
    #[serde(default = "default_max_concurrent_connections")]
    pub max_concurrent_connections: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            max_blocking_threads: None,
            acceptor_tasks_per_listener: None,
            reuse_port: default_reuse_port(),
            tcp_backlog: default_tcp_backlog(),
            max_concurrent_connections: default_max_concurrent_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SystemLogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for SystemLogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MetricsConfig {
    pub listen: String,
    #[serde(default = "default_metrics_path")]
    pub path: String,
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FactoryConfig {
    /// Where the kernel tracer delivers socket events; ingress capture is off
    /// when unset.
    #[serde(default)]
    pub event_listen: Option<String>,
    #[serde(default = "default_factory_mailbox_capacity")]
    pub mailbox_capacity: usize,
    #[serde(default = "default_factory_silence_flush_ms")]
    pub silence_flush_ms: u64,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            event_listen: None,
            mailbox_capacity: default_factory_mailbox_capacity(),
            silence_flush_ms: default_factory_silence_flush_ms(),
        }
    }
}
