use super::{sha256_hex, BoxedIo, ConnContext, Integration};
use crate::io_util::{read_cancellable, write_all_cancellable, ReadEvent};
use anyhow::Result;
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use tapx_core::error::TapError;
use tapx_core::mockdb::MockMemDb;
use tapx_core::models::{Mock, MockKind, MockSpec, PostgresSpec};
use tapx_core::storage::MockWriter;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const PROTOCOL: &str = "postgres";
const PROTOCOL_VERSION_3: u32 = 0x0003_0000;
const SSL_REQUEST_CODE: u32 = 80_877_103;
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// PostgreSQL v3 codec. Exchanges are delimited on the client side by the
/// protocol's sync points (Query, Sync, FunctionCall) and on the server side
/// by ReadyForQuery, which makes record and replay group frames identically.
pub struct PostgresV1;

impl PostgresV1 {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Integration for PostgresV1 {
    fn match_type(&self, buf: &[u8]) -> bool {
        if buf.len() < 8 {
            return false;
        }
        // Bytes [0..4) are the startup length; [4..8) carry the version or a
        // negotiation code.
        let code = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        code == PROTOCOL_VERSION_3 || code == SSL_REQUEST_CODE
    }

    async fn record_outgoing(
        &self,
        mut client: BoxedIo,
        mut upstream: BoxedIo,
        sink: Arc<dyn MockWriter>,
        ctx: ConnContext,
    ) -> Result<()> {
        let result = record_session(&mut client, &mut upstream, sink.as_ref(), &ctx).await;
        let _ = client.shutdown().await;
        let _ = upstream.shutdown().await;
        result
    }

    async fn mock_outgoing(
        &self,
        mut client: BoxedIo,
        db: Arc<MockMemDb>,
        ctx: ConnContext,
    ) -> Result<()> {
        let result = replay_session(&mut client, db.as_ref(), &ctx).await;
        let _ = client.shutdown().await;
        result
    }
}

async fn record_session(
    client: &mut BoxedIo,
    upstream: &mut BoxedIo,
    sink: &dyn MockWriter,
    ctx: &ConnContext,
) -> Result<()> {
    let token = &ctx.token;
    let mut client_frames = FrameReader::new();
    let mut upstream_frames = FrameReader::new();

    let Some(startup) = read_startup_plaintext(&mut client_frames, client, token).await? else {
        return Ok(());
    };
    write_bytes(upstream, &startup, token).await?;

    let mut request_frames = startup.clone();
    let identifiers = startup_identifiers(&startup);
    let fingerprint = startup_fingerprint(&startup);

    // Authentication runs until the server's first ReadyForQuery. When the
    // server asks for credentials, exactly one client frame answers each ask.
    let mut response_frames = Vec::new();
    loop {
        let Some(frame) = upstream_frames.next_frame(upstream, token).await? else {
            break;
        };
        write_bytes(client, &frame.raw, token).await?;
        response_frames.extend_from_slice(&frame.raw);
        match frame.ty {
            b'R' if auth_code(frame.payload()) != Some(0) => {
                let Some(reply) = client_frames.next_frame(client, token).await? else {
                    break;
                };
                write_bytes(upstream, &reply.raw, token).await?;
                request_frames.extend_from_slice(&reply.raw);
            }
            b'Z' => break,
            _ => {}
        }
    }
    emit_mock(sink, request_frames, response_frames, identifiers, fingerprint).await?;

    'exchanges: loop {
        let mut request_frames = Vec::new();
        let mut identifiers = Vec::new();
        let mut material = Vec::new();

        loop {
            let Some(frame) = client_frames.next_frame(client, token).await? else {
                break 'exchanges;
            };
            write_bytes(upstream, &frame.raw, token).await?;
            if frame.ty == b'X' {
                break 'exchanges;
            }
            push_identifiers(&frame, &mut identifiers);
            material.extend_from_slice(&fingerprint_material(&frame));
            request_frames.extend_from_slice(&frame.raw);
            if is_sync_point(frame.ty) {
                break;
            }
        }
        let fingerprint = sha256_hex(&[&material]);

        let mut response_frames = Vec::new();
        loop {
            let Some(frame) = upstream_frames.next_frame(upstream, token).await? else {
                emit_mock(sink, request_frames, response_frames, identifiers, fingerprint).await?;
                break 'exchanges;
            };
            write_bytes(client, &frame.raw, token).await?;
            response_frames.extend_from_slice(&frame.raw);
            if frame.ty == b'Z' {
                break;
            }
        }
        emit_mock(sink, request_frames, response_frames, identifiers, fingerprint).await?;
    }
    Ok(())
}

async fn replay_session(
    client: &mut BoxedIo,
    db: &MockMemDb,
    ctx: &ConnContext,
) -> Result<()> {
    let token = &ctx.token;
    let mut client_frames = FrameReader::new();

    let Some(startup) = read_startup_plaintext(&mut client_frames, client, token).await? else {
        return Ok(());
    };
    serve_next(client, db, &startup_fingerprint(&startup), ctx, token).await?;

    loop {
        let mut material = Vec::new();
        let mut saw_request_frame = false;
        loop {
            let Some(frame) = client_frames.next_frame(client, token).await? else {
                return Ok(());
            };
            if frame.ty == b'X' {
                return Ok(());
            }
            if frame.ty == b'p' {
                // Credential frames answer the recorded auth exchange, which
                // was already served with the startup response.
                continue;
            }
            saw_request_frame = true;
            material.extend_from_slice(&fingerprint_material(&frame));
            if is_sync_point(frame.ty) {
                break;
            }
        }
        if !saw_request_frame {
            continue;
        }
        serve_next(client, db, &sha256_hex(&[&material]), ctx, token).await?;
    }
}

/// Read the startup message, transparently refusing an SSLRequest first.
/// Recording is plaintext-only; replying `N` makes well-behaved clients retry
/// in the clear on the same connection.
async fn read_startup_plaintext(
    frames: &mut FrameReader,
    client: &mut BoxedIo,
    token: &CancellationToken,
) -> Result<Option<Vec<u8>>> {
    let Some(startup) = frames.next_startup(client, token).await? else {
        return Ok(None);
    };
    let startup = if startup_code(&startup) == Some(SSL_REQUEST_CODE) {
        write_bytes(client, b"N", token).await?;
        match frames.next_startup(client, token).await? {
            Some(next) => next,
            None => return Ok(None),
        }
    } else {
        startup
    };
    if startup_code(&startup) != Some(PROTOCOL_VERSION_3) {
        return Err(TapError::malformed(PROTOCOL, "unsupported startup code").into());
    }
    Ok(Some(startup))
}

async fn serve_next(
    client: &mut BoxedIo,
    db: &MockMemDb,
    fingerprint: &str,
    ctx: &ConnContext,
    token: &CancellationToken,
) -> Result<()> {
    let Some(mock) = db.find_next(MockKind::PostgresV1, fingerprint) else {
        return Err(TapError::NoMatch {
            kind: MockKind::PostgresV1,
        }
        .into());
    };
    debug!(conn_id = ctx.conn_id, mock = %mock.name, "serving postgres mock");
    let MockSpec::Postgres(spec) = &mock.spec else {
        return Err(TapError::Internal("postgres mock carries foreign spec".to_string()).into());
    };
    write_bytes(client, &spec.response_frames, token).await
}

async fn emit_mock(
    sink: &dyn MockWriter,
    request_frames: Vec<u8>,
    response_frames: Vec<u8>,
    identifiers: Vec<String>,
    fingerprint: String,
) -> Result<()> {
    if response_frames.is_empty() {
        return Ok(());
    }
    let mock = Mock::new(MockSpec::Postgres(PostgresSpec {
        request_frames,
        response_frames,
        identifiers,
        fingerprint,
    }));
    sink.write(mock).await
}

async fn write_bytes(io: &mut BoxedIo, bytes: &[u8], token: &CancellationToken) -> Result<()> {
    let progress = write_all_cancellable(io, bytes, token)
        .await
        .map_err(TapError::Transient)?;
    if progress.cancelled {
        return Err(TapError::Cancelled.into());
    }
    Ok(())
}

/// Client-side frame types after which the server is expected to respond.
fn is_sync_point(ty: u8) -> bool {
    matches!(ty, b'Q' | b'S' | b'F')
}

fn startup_code(startup: &[u8]) -> Option<u32> {
    if startup.len() < 8 {
        return None;
    }
    Some(u32::from_be_bytes([
        startup[4], startup[5], startup[6], startup[7],
    ]))
}

fn startup_fingerprint(startup: &[u8]) -> String {
    sha256_hex(&[b"startup", startup])
}

/// `user`/`database` parameters out of the startup body, for readable logs.
fn startup_identifiers(startup: &[u8]) -> Vec<String> {
    let mut identifiers = Vec::new();
    let Some(body) = startup.get(8..) else {
        return identifiers;
    };
    let mut pos = 0;
    while pos < body.len() && body[pos] != 0 {
        let Some((key, next)) = read_cstr(body, pos) else {
            break;
        };
        let Some((value, next)) = read_cstr(body, next) else {
            break;
        };
        if key == "user" || key == "database" {
            identifiers.push(format!("{}={}", key, value));
        }
        pos = next;
    }
    identifiers
}

fn push_identifiers(frame: &PgFrame, identifiers: &mut Vec<String>) {
    match frame.ty {
        b'Q' => {
            if let Some((query, _)) = read_cstr(frame.payload(), 0) {
                identifiers.push(query);
            }
        }
        b'P' => {
            if let Some((name, next)) = read_cstr(frame.payload(), 0) {
                if let Some((query, _)) = read_cstr(frame.payload(), next) {
                    if name.is_empty() {
                        identifiers.push(query);
                    } else {
                        identifiers.push(format!("{}: {}", name, query));
                    }
                }
            }
        }
        _ => {}
    }
}

/// Bytes a frame contributes to the exchange fingerprint. Bind carries
/// caller-supplied parameter values, so only its shape (portal, statement,
/// parameter count) is hashed; every other frame is hashed verbatim.
fn fingerprint_material(frame: &PgFrame) -> Vec<u8> {
    if frame.ty == b'B' {
        if let Some(material) = bind_material(frame.payload()) {
            return material;
        }
    }
    let mut material = Vec::with_capacity(1 + frame.payload().len());
    material.push(frame.ty);
    material.extend_from_slice(frame.payload());
    material
}

fn bind_material(payload: &[u8]) -> Option<Vec<u8>> {
    let (portal, next) = read_cstr_bytes(payload, 0)?;
    let (statement, next) = read_cstr_bytes(payload, next)?;
    let nfmts = read_u16(payload, next)? as usize;
    let params_at = next + 2 + nfmts * 2;
    let nparams = read_u16(payload, params_at)?;

    let mut material = Vec::with_capacity(portal.len() + statement.len() + 5);
    material.push(b'B');
    material.extend_from_slice(portal);
    material.push(0);
    material.extend_from_slice(statement);
    material.push(0);
    material.extend_from_slice(&nparams.to_be_bytes());
    Some(material)
}

fn auth_code(payload: &[u8]) -> Option<u32> {
    if payload.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ]))
}

fn read_cstr(buf: &[u8], start: usize) -> Option<(String, usize)> {
    let (bytes, next) = read_cstr_bytes(buf, start)?;
    Some((String::from_utf8_lossy(bytes).into_owned(), next))
}

fn read_cstr_bytes(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(start..)?;
    let nul = rest.iter().position(|b| *b == 0)?;
    Some((&rest[..nul], start + nul + 1))
}

fn read_u16(buf: &[u8], pos: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*buf.get(pos)?, *buf.get(pos + 1)?]))
}

#[derive(Debug)]
struct PgFrame {
    ty: u8,
    raw: Vec<u8>,
}

impl PgFrame {
    fn payload(&self) -> &[u8] {
        &self.raw[5..]
    }
}

/// Incremental frame assembly over a byte stream. Frames never split across
/// reads from the caller's point of view; partial tails stay buffered.
struct FrameReader {
    pending: BytesMut,
    chunk: Vec<u8>,
}

impl FrameReader {
    fn new() -> Self {
        Self {
            pending: BytesMut::new(),
            chunk: vec![0u8; 16 * 1024],
        }
    }

    async fn fill(
        &mut self,
        io: &mut BoxedIo,
        need: usize,
        token: &CancellationToken,
    ) -> Result<bool> {
        while self.pending.len() < need {
            match read_cancellable(io, &mut self.chunk, token).await {
                Ok(ReadEvent::Data(n)) => self.pending.extend_from_slice(&self.chunk[..n]),
                Ok(ReadEvent::Eof) => return Ok(false),
                Ok(ReadEvent::Cancelled) => return Err(TapError::Cancelled.into()),
                Err(err) => return Err(TapError::Transient(err).into()),
            }
        }
        Ok(true)
    }

    /// Startup-phase message: length-prefixed, no type byte.
    async fn next_startup(
        &mut self,
        io: &mut BoxedIo,
        token: &CancellationToken,
    ) -> Result<Option<Vec<u8>>> {
        if !self.fill(io, 4, token).await? {
            return if self.pending.is_empty() {
                Ok(None)
            } else {
                Err(TapError::malformed(PROTOCOL, "truncated startup header").into())
            };
        }
        let len = u32::from_be_bytes([
            self.pending[0],
            self.pending[1],
            self.pending[2],
            self.pending[3],
        ]) as usize;
        if !(8..=MAX_FRAME_BYTES).contains(&len) {
            return Err(TapError::malformed(PROTOCOL, format!("startup length {}", len)).into());
        }
        if !self.fill(io, len, token).await? {
            return Err(TapError::malformed(PROTOCOL, "truncated startup message").into());
        }
        Ok(Some(self.pending.split_to(len).to_vec()))
    }

    /// Post-startup frame: 1-byte type + 4-byte length excluding the type.
    async fn next_frame(
        &mut self,
        io: &mut BoxedIo,
        token: &CancellationToken,
    ) -> Result<Option<PgFrame>> {
        if !self.fill(io, 5, token).await? {
            return if self.pending.is_empty() {
                Ok(None)
            } else {
                Err(TapError::malformed(PROTOCOL, "truncated frame header").into())
            };
        }
        let ty = self.pending[0];
        let len = u32::from_be_bytes([
            self.pending[1],
            self.pending[2],
            self.pending[3],
            self.pending[4],
        ]) as usize;
        if !(4..=MAX_FRAME_BYTES).contains(&len) {
            return Err(TapError::malformed(
                PROTOCOL,
                format!("frame length {} for type {:#04x}", len, ty),
            )
            .into());
        }
        if !self.fill(io, 1 + len, token).await? {
            return Err(TapError::malformed(PROTOCOL, "truncated frame body").into());
        }
        let raw = self.pending.split_to(1 + len).to_vec();
        Ok(Some(PgFrame { ty, raw }))
    }
}
