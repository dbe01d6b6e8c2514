pub(super) fn default_peek_bytes() -> usize {
    32
}

pub(super) fn default_peek_timeout_ms() -> u64 {
    500
}

pub(super) fn default_dial_timeout_ms() -> u64 {
    3_000
}

pub(super) fn default_destination_mode() -> String {
    "kernel".to_string()
}

pub(super) fn default_mysql_ports() -> Vec<u16> {
    vec![3306]
}

pub(super) fn default_reuse_port() -> bool {
    true
}

pub(super) fn default_tcp_backlog() -> i32 {
    1_024
}

pub(super) fn default_max_concurrent_connections() -> usize {
    1_024
}

pub(super) fn default_log_level() -> String {
    "info".to_string()
}

pub(super) fn default_log_format() -> String {
    "json".to_string()
}

pub(super) fn default_metrics_path() -> String {
    "/metrics".to_string()
}

pub(super) fn default_metrics_prefix() -> String {
    "tapx".to_string()
}

pub(super) fn default_factory_mailbox_capacity() -> usize {
    1_000
}

pub(super) fn default_factory_silence_flush_ms() -> u64 {
    2_000
}
