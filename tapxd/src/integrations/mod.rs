pub mod generic;
pub mod mysql;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use sha2::Digest as _;
use std::net::SocketAddr;
use std::sync::Arc;
use tapx_core::mockdb::MockMemDb;
use tapx_core::storage::MockWriter;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub type BoxedIo = Box<dyn Io>;

/// Per-connection context handed to a codec by the dispatcher.
#[derive(Clone)]
pub struct ConnContext {
    /// Monotonic id correlating this connection's log lines.
    pub conn_id: u64,
    pub token: CancellationToken,
    /// Original pre-redirect destination; absent in replay mode when the
    /// lookup had nothing to say.
    pub dest: Option<SocketAddr>,
}

/// A protocol codec. One instance serves all connections of its protocol;
/// per-connection state lives on the stack of the record/mock call.
#[async_trait]
pub trait Integration: Send + Sync {
    /// Pure prefix check over the classifier's initial buffer. Short buffers
    /// return false, never an error.
    fn match_type(&self, buf: &[u8]) -> bool;

    /// Drive client and upstream until either side closes or the context is
    /// cancelled, emitting a mock per completed exchange.
    async fn record_outgoing(
        &self,
        client: BoxedIo,
        upstream: BoxedIo,
        sink: Arc<dyn MockWriter>,
        ctx: ConnContext,
    ) -> Result<()>;

    /// Serve the client from the mock DB. No upstream socket exists.
    async fn mock_outgoing(
        &self,
        client: BoxedIo,
        db: Arc<MockMemDb>,
        ctx: ConnContext,
    ) -> Result<()>;
}

/// Ordered codec table. Registration order is fixed at construction, which
/// keeps classification deterministic across runs; `generic` is the explicit
/// fallback and never participates in prefix matching.
pub struct Registry {
    entries: Vec<(&'static str, Arc<dyn Integration>)>,
    generic: Arc<dyn Integration>,
    mysql_ports: Vec<u16>,
}

impl Registry {
    pub fn builtin(mysql_ports: Vec<u16>) -> Self {
        Self {
            entries: vec![
                ("postgres_v1", Arc::new(postgres::PostgresV1::new()) as Arc<dyn Integration>),
                ("mysql", Arc::new(mysql::MySql::new()) as Arc<dyn Integration>),
            ],
            generic: Arc::new(generic::Generic::new()),
            mysql_ports,
        }
    }

    /// Pick a codec for a connection: first prefix match in registration
    /// order, then the MySQL destination-port hint (the MySQL server speaks
    /// first, so there is no client prefix to match), then generic.
    pub fn classify(
        &self,
        initial: &[u8],
        dest: Option<SocketAddr>,
    ) -> (&'static str, Arc<dyn Integration>) {
        for (name, codec) in &self.entries {
            if codec.match_type(initial) {
                return (*name, codec.clone());
            }
        }
        if let Some(dest) = dest {
            if self.mysql_ports.contains(&dest.port()) {
                if let Some((name, codec)) =
                    self.entries.iter().find(|(name, _)| *name == "mysql")
                {
                    return (*name, codec.clone());
                }
            }
        }
        ("generic", self.generic.clone())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(name, _)| *name).collect()
    }
}

/// Stable fingerprint digest over a sequence of byte spans.
pub(crate) fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = sha2::Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex_lower(hasher.finalize().as_slice())
}

fn hex_lower(bytes: &[u8]) -> String {
    const LUT: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(LUT[(b >> 4) as usize] as char);
        out.push(LUT[(b & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_order_is_stable() {
        let registry = Registry::builtin(vec![3306]);
        assert_eq!(registry.names(), vec!["postgres_v1", "mysql"]);
    }

    #[test]
    fn mysql_port_hint_applies_only_without_prefix_match() {
        let registry = Registry::builtin(vec![3306]);
        let dest = "10.0.0.5:3306".parse().ok();

        let (name, _) = registry.classify(b"", dest);
        assert_eq!(name, "mysql");

        // A PostgreSQL startup on a MySQL port still classifies by prefix.
        let startup = [0, 0, 0, 8, 0, 3, 0, 0];
        let (name, _) = registry.classify(&startup, dest);
        assert_eq!(name, "postgres_v1");
    }

    #[test]
    fn unknown_traffic_falls_through_to_generic() {
        let registry = Registry::builtin(vec![3306]);
        let (name, _) = registry.classify(b"GET / HT", "10.0.0.5:80".parse().ok());
        assert_eq!(name, "generic");
    }

    #[test]
    fn fingerprint_digest_is_stable_over_parts() {
        assert_eq!(sha256_hex(&[b"ab", b"c"]), sha256_hex(&[b"abc"]));
        assert_ne!(sha256_hex(&[b"abc"]), sha256_hex(&[b"abd"]));
    }
}
