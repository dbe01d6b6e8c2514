use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Version tag stamped on every recorded artifact.
pub const MOCK_VERSION: &str = "tapx.dev/v1";

/// Closed set of protocols a mock can belong to. Each kind owns its spec
/// schema and its fingerprint scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockKind {
    Http,
    PostgresV1,
    MySql,
    Generic,
}

impl MockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::PostgresV1 => "postgres_v1",
            Self::MySql => "mysql",
            Self::Generic => "generic",
        }
    }
}

impl std::fmt::Display for MockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded outbound exchange. Immutable once written; only the mock DB
/// flips the consumed flag on its own copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mock {
    pub version: String,
    pub kind: MockKind,
    /// Unique within a session; assigned by the session writer.
    pub name: String,
    pub spec: MockSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curl: Option<String>,
    pub created_at_unix_ms: u64,
}

impl Mock {
    pub fn new(spec: MockSpec) -> Self {
        let curl = spec.render_curl();
        Self {
            version: MOCK_VERSION.to_string(),
            kind: spec.kind(),
            name: String::new(),
            spec,
            curl,
            created_at_unix_ms: unix_timestamp_ms(),
        }
    }

    pub fn fingerprint(&self) -> &str {
        self.spec.fingerprint()
    }
}

/// Kind-specific payload of a mock.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum MockSpec {
    Http(HttpSpec),
    Postgres(PostgresSpec),
    MySql(MySqlSpec),
    Generic(GenericSpec),
}

impl MockSpec {
    pub fn kind(&self) -> MockKind {
        match self {
            Self::Http(_) => MockKind::Http,
            Self::Postgres(_) => MockKind::PostgresV1,
            Self::MySql(_) => MockKind::MySql,
            Self::Generic(_) => MockKind::Generic,
        }
    }

    pub fn fingerprint(&self) -> &str {
        match self {
            Self::Http(spec) => &spec.fingerprint,
            Self::Postgres(spec) => &spec.fingerprint,
            Self::MySql(spec) => &spec.fingerprint,
            Self::Generic(spec) => &spec.fingerprint,
        }
    }

    fn render_curl(&self) -> Option<String> {
        match self {
            Self::Http(spec) => Some(spec.request.curl()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSpec {
    pub request: HttpRequestRecord,
    pub response: HttpResponseRecord,
    pub fingerprint: String,
}

/// Raw framed bytes of one PostgreSQL request/response exchange, plus the
/// identifiers decoded from the client frames (query text, statement names)
/// that make session logs readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresSpec {
    pub request_frames: Vec<u8>,
    pub response_frames: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifiers: Vec<String>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MySqlSpec {
    pub request: Vec<u8>,
    pub response: Vec<u8>,
    /// Present on the exchange that carried the client handshake response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake: Option<MySqlHandshakeResponse>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericSpec {
    pub request: Vec<u8>,
    pub response: Vec<u8>,
    pub fingerprint: String,
}

/// Decoded MySQL client handshake response (protocol 41 form).
///
/// Field presence is governed by `capability_flags`; the decoder and encoder
/// in the MySQL integration are mutual inverses over this struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MySqlHandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub reserved: [u8; 23],
    pub username: String,
    pub auth_data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_plugin_name: Option<String>,
    /// Insertion-ordered; keys are unique.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connect_attributes: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zstd_compression_level: Option<u8>,
}

/// Ingress-side HTTP test case assembled by the connection factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub version: String,
    pub name: String,
    pub kind: MockKind,
    pub request: HttpRequestRecord,
    pub response: HttpResponseRecord,
    pub created_at_unix_ms: u64,
}

impl TestCase {
    pub fn new(name: String, request: HttpRequestRecord, response: HttpResponseRecord) -> Self {
        Self {
            version: MOCK_VERSION.to_string(),
            name,
            kind: MockKind::Http,
            request,
            response,
            created_at_unix_ms: unix_timestamp_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequestRecord {
    pub method: String,
    pub path: String,
    pub http_major: u8,
    pub http_minor: u8,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequestRecord {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Human-readable reproduction command for session review.
    pub fn curl(&self) -> String {
        let host = self.header("host").unwrap_or("localhost");
        let mut out = format!("curl -X {} 'http://{}{}'", self.method, host, self.path);
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            out.push_str(&format!(" -H '{}: {}'", name, value));
        }
        if !self.body.is_empty() {
            match std::str::from_utf8(&self.body) {
                Ok(text) => out.push_str(&format!(" -d '{}'", text.replace('\'', "'\\''"))),
                Err(_) => out.push_str(" --data-binary @-"),
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponseRecord {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

pub fn unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
