use super::load::parse_config;
use super::types::SessionMode;

const MINIMAL: &str = r#"
version: 1
session:
  name: checkout-run
  mode: record
proxy:
  listen: 127.0.0.1:16789
"#;

#[test]
fn minimal_config_parses_with_defaults() {
    let config = parse_config(MINIMAL).expect("minimal config");
    assert_eq!(config.session.name, "checkout-run");
    assert_eq!(config.session.mode, SessionMode::Record);
    assert_eq!(config.proxy.peek_bytes, 32);
    assert_eq!(config.proxy.mysql_ports, vec![3306]);
    assert_eq!(config.proxy.destination.mode, "kernel");
    assert_eq!(config.factory.mailbox_capacity, 1_000);
    assert_eq!(config.factory.silence_flush_ms, 2_000);
    assert_eq!(config.system_log.format, "json");
    assert!(config.metrics.is_none());
}

#[test]
fn full_config_parses() {
    let raw = r#"
version: 1
session:
  name: payments
  mode: replay
proxy:
  listen: 0.0.0.0:16789
  peek_bytes: 64
  peek_timeout_ms: 250
  dial_timeout_ms: 1000
  mysql_ports: [3306, 3307]
  destination:
    mode: static
    static_targets:
      - source: 127.0.0.1:40000
        target: 127.0.0.1:5432
    fallback: 127.0.0.1:9000
runtime:
  worker_threads: 4
  reuse_port: false
  max_concurrent_connections: 256
system_log:
  level: debug
  format: pretty
metrics:
  listen: 127.0.0.1:19200
  prefix: tapx_staging
factory:
  mailbox_capacity: 500
  silence_flush_ms: 1500
"#;
    let config = parse_config(raw).expect("full config");
    assert_eq!(config.session.mode, SessionMode::Replay);
    assert_eq!(config.proxy.destination.static_targets.len(), 1);
    assert_eq!(config.runtime.worker_threads, Some(4));
    assert_eq!(config.metrics.as_ref().unwrap().path, "/metrics");
    assert_eq!(config.metrics.as_ref().unwrap().prefix, "tapx_staging");
}

#[test]
fn unknown_keys_are_rejected() {
    let raw = format!("{MINIMAL}\nsesion_typo: 1\n");
    let err = parse_config(&raw).unwrap_err();
    assert!(err.to_string().contains("unknown config keys"), "{err:#}");
}

#[test]
fn env_defaults_expand() {
    std::env::remove_var("TAPX_CFG_TEST_LISTEN");
    let raw = r#"
version: 1
session:
  name: env-run
  mode: record
proxy:
  listen: ${TAPX_CFG_TEST_LISTEN:-127.0.0.1:16789}
"#;
    let config = parse_config(raw).expect("env default config");
    assert_eq!(config.proxy.listen, "127.0.0.1:16789");
}

#[test]
fn reserved_session_name_is_rejected() {
    let raw = MINIMAL.replace("checkout-run", "testReports");
    let err = parse_config(&raw).unwrap_err();
    assert!(err.to_string().contains("reserved"), "{err:#}");
}

#[test]
fn session_name_with_path_separator_is_rejected() {
    let raw = MINIMAL.replace("checkout-run", "a/b");
    assert!(parse_config(&raw).is_err());
}

#[test]
fn bad_listen_address_is_rejected() {
    let raw = MINIMAL.replace("127.0.0.1:16789", "not-an-addr");
    assert!(parse_config(&raw).is_err());
}

#[test]
fn short_peek_window_is_rejected() {
    let raw = format!("{MINIMAL}  peek_bytes: 4\n");
    let err = parse_config(&raw).unwrap_err();
    assert!(err.to_string().contains("peek_bytes"), "{err:#}");
}

#[test]
fn static_mode_without_targets_is_rejected() {
    let raw = format!("{MINIMAL}  destination:\n    mode: static\n");
    assert!(parse_config(&raw).is_err());
}

#[test]
fn bad_version_is_rejected() {
    let raw = MINIMAL.replace("version: 1", "version: 3");
    assert!(parse_config(&raw).is_err());
}
