use crate::integrations::Registry;
use crate::proxy::destination::DestinationResolver;
use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tapx_core::config::{Config, SessionMode};
use tapx_core::mockdb::MockMemDb;
use tapx_core::storage::MockWriter;
use tokio::sync::Semaphore;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Monotonic id correlating one proxied connection's log lines and mocks.
pub fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Shared state built once at startup. The registry and resolver are
/// read-only afterwards; the mock DB is internally synchronized.
pub struct RuntimeState {
    pub config: Arc<Config>,
    pub mode: SessionMode,
    pub registry: Registry,
    pub mock_db: Arc<MockMemDb>,
    pub mock_writer: Arc<dyn MockWriter>,
    pub resolver: DestinationResolver,
    pub metric_names: MetricNames,
    pub connection_semaphore: Arc<Semaphore>,
}

impl RuntimeState {
    pub fn build(config: Config, mock_writer: Arc<dyn MockWriter>) -> Result<Self> {
        let config = Arc::new(config);
        let registry = Registry::builtin(config.proxy.mysql_ports.clone());
        let resolver = DestinationResolver::from_config(&config.proxy.destination)?;
        let prefix = config
            .metrics
            .as_ref()
            .map(|m| m.prefix.as_str())
            .unwrap_or("tapx");
        let metric_names = MetricNames::from_prefix(prefix);
        let connection_semaphore =
            Arc::new(Semaphore::new(config.runtime.max_concurrent_connections));

        Ok(Self {
            mode: config.session.mode,
            config,
            registry,
            mock_db: Arc::new(MockMemDb::new()),
            mock_writer,
            resolver,
            metric_names,
            connection_semaphore,
        })
    }
}

#[derive(Clone)]
pub struct MetricNames {
    pub connections_total: String,
    pub connection_latency_ms: String,
    pub mocks_recorded_total: String,
    pub factory_dropped_events_total: String,
    pub test_cases_emitted_total: String,
}

impl MetricNames {
    pub fn from_prefix(prefix: &str) -> Self {
        Self {
            connections_total: format!("{}_connections_total", prefix),
            connection_latency_ms: format!("{}_connection_latency_ms", prefix),
            mocks_recorded_total: format!("{}_mocks_recorded_total", prefix),
            factory_dropped_events_total: format!("{}_factory_dropped_events_total", prefix),
            test_cases_emitted_total: format!("{}_test_cases_emitted_total", prefix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_ids_are_strictly_increasing() {
        let first = next_conn_id();
        let second = next_conn_id();
        assert!(second > first);
    }

    #[test]
    fn metric_names_carry_the_prefix() {
        let names = MetricNames::from_prefix("tapx_ci");
        assert_eq!(names.connections_total, "tapx_ci_connections_total");
        assert_eq!(names.test_cases_emitted_total, "tapx_ci_test_cases_emitted_total");
    }
}
