use super::{sha256_hex, BoxedIo, ConnContext, Integration};
use crate::io_util::{read_cancellable, write_all_cancellable, ReadEvent};
use anyhow::Result;
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::HashSet;
use std::sync::Arc;
use tapx_core::error::TapError;
use tapx_core::mockdb::MockMemDb;
use tapx_core::models::{Mock, MockKind, MockSpec, MySqlHandshakeResponse, MySqlSpec};
use tapx_core::storage::MockWriter;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const PROTOCOL: &str = "mysql";

pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
pub const CLIENT_SSL: u32 = 0x0000_0800;
pub const CLIENT_ZSTD_COMPRESSION_ALGORITHM: u32 = 0x0001_0000;
pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
pub const CLIENT_CONNECT_ATTRS: u32 = 0x0010_0000;
pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x0020_0000;

const COM_QUIT: u8 = 0x01;

/// Fingerprint of the connection-opening mock: the server greeting precedes
/// any client bytes, so it is matched by position, not content.
const GREETING_FINGERPRINT: &str = "server-greeting";

/// How long after the last response packet a command's result set is
/// considered complete. Result-set shapes vary too much to delimit
/// structurally with replay-grade confidence; the gap heuristic matches how
/// exchanges were paced at record time.
const RESPONSE_SETTLE: Duration = Duration::from_millis(200);

/// MySQL codec. The server speaks first on this protocol, so `match_type`
/// can never recognize it from client prefix bytes; the dispatcher selects it
/// by destination port instead.
pub struct MySql;

impl MySql {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Integration for MySql {
    fn match_type(&self, _buf: &[u8]) -> bool {
        false
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
    let mut client_packets = PacketReader::new();
    let mut server_packets = PacketReader::new();

    // Greeting: server-first, no request bytes.
    let Some(greeting) = server_packets.next_packet(upstream, token).await? else {
        return Ok(());
    };
    write_bytes(client, &greeting.raw, token).await?;
    emit_mock(
        sink,
        Vec::new(),
        greeting.raw,
        None,
        GREETING_FINGERPRINT.to_string(),
    )
    .await?;

    // Login: the client's handshake response, then the server's auth verdict.
    let Some(login) = client_packets.next_packet(client, token).await? else {
        return Ok(());
    };
    let handshake = decode_handshake_response(&login.payload)?;
    if handshake.capability_flags & CLIENT_SSL != 0 {
        return Err(TapError::malformed(PROTOCOL, "tls session cannot be recorded").into());
    }
    write_bytes(upstream, &login.raw, token).await?;
    let fingerprint = handshake_fingerprint(&handshake);

    let mut request_span = login.raw.clone();
    let mut response_span = Vec::new();
    loop {
        let Some(packet) = server_packets.next_packet(upstream, token).await? else {
            break;
        };
        write_bytes(client, &packet.raw, token).await?;
        response_span.extend_from_slice(&packet.raw);
        match packet.payload.first() {
            Some(0x00) | Some(0xff) => break,
            // Auth switch, or a more-data packet that demands full
            // authentication (0x04); both are answered by one client packet.
            Some(0xfe) => {
                let Some(reply) = client_packets.next_packet(client, token).await? else {
                    break;
                };
                write_bytes(upstream, &reply.raw, token).await?;
                request_span.extend_from_slice(&reply.raw);
            }
            Some(0x01) if packet.payload.get(1) == Some(&0x04) => {
                let Some(reply) = client_packets.next_packet(client, token).await? else {
                    break;
                };
                write_bytes(upstream, &reply.raw, token).await?;
                request_span.extend_from_slice(&reply.raw);
            }
            _ => {}
        }
    }
    emit_mock(sink, request_span, response_span, Some(handshake), fingerprint).await?;

    // Command phase.
    loop {
        let Some(command) = client_packets.next_packet(client, token).await? else {
            return Ok(());
        };
        write_bytes(upstream, &command.raw, token).await?;
        if command.payload.first() == Some(&COM_QUIT) {
            return Ok(());
        }
        let fingerprint = command_fingerprint(&command.payload);

        let mut response_span = Vec::new();
        loop {
            let next = if response_span.is_empty() {
                server_packets.next_packet(upstream, token).await?
            } else {
                match timeout(
                    RESPONSE_SETTLE,
                    server_packets.next_packet(upstream, token),
                )
                .await
                {
                    Ok(result) => result?,
                    Err(_) => break,
                }
            };
            let Some(packet) = next else {
                emit_mock(sink, command.raw.clone(), response_span, None, fingerprint).await?;
                return Ok(());
            };
            write_bytes(client, &packet.raw, token).await?;
            response_span.extend_from_slice(&packet.raw);
        }
        emit_mock(sink, command.raw, response_span, None, fingerprint).await?;
    }
}

async fn replay_session(client: &mut BoxedIo, db: &MockMemDb, ctx: &ConnContext) -> Result<()> {
    let token = &ctx.token;
    let mut client_packets = PacketReader::new();

    serve_next(client, db, GREETING_FINGERPRINT, ctx, token).await?;

    let Some(login) = client_packets.next_packet(client, token).await? else {
        return Ok(());
    };
    let handshake = decode_handshake_response(&login.payload)?;
    serve_next(client, db, &handshake_fingerprint(&handshake), ctx, token).await?;

    loop {
        let Some(packet) = client_packets.next_packet(client, token).await? else {
            return Ok(());
        };
        // Sequence ids reset to zero per command; a nonzero id here is an
        // auth continuation whose recorded verdict was already served.
        if packet.seq != 0 {
            continue;
        }
        if packet.payload.first() == Some(&COM_QUIT) {
            return Ok(());
        }
        serve_next(client, db, &command_fingerprint(&packet.payload), ctx, token).await?;
    }
}

async fn serve_next(
    client: &mut BoxedIo,
    db: &MockMemDb,
    fingerprint: &str,
    ctx: &ConnContext,
    token: &CancellationToken,
) -> Result<()> {
    let Some(mock) = db.find_next(MockKind::MySql, fingerprint) else {
        return Err(TapError::NoMatch {
            kind: MockKind::MySql,
        }
        .into());
    };
    debug!(conn_id = ctx.conn_id, mock = %mock.name, "serving mysql mock");
    let MockSpec::MySql(spec) = &mock.spec else {
        return Err(TapError::Internal("mysql mock carries foreign spec".to_string()).into());
    };
    write_bytes(client, &spec.response, token).await
}

async fn emit_mock(
    sink: &dyn MockWriter,
    request: Vec<u8>,
    response: Vec<u8>,
    handshake: Option<MySqlHandshakeResponse>,
    fingerprint: String,
) -> Result<()> {
    if response.is_empty() {
        return Ok(());
    }
    let mock = Mock::new(MockSpec::MySql(MySqlSpec {
        request,
        response,
        handshake,
        fingerprint,
    }));
    sink.write(mock).await
}

fn handshake_fingerprint(handshake: &MySqlHandshakeResponse) -> String {
    // Auth payloads are salted with a per-connection nonce, so the stable
    // identity fields carry the match.
    format!(
        "login:{}:{}:{}",
        handshake.username,
        handshake.database.as_deref().unwrap_or(""),
        handshake.auth_plugin_name.as_deref().unwrap_or("")
    )
}

fn command_fingerprint(payload: &[u8]) -> String {
    sha256_hex(&[b"command", payload])
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

/// Decode a client handshake response (protocol 41 form) from a packet body.
///
/// Error policy: a too-short buffer, an unterminated string field, and a
/// length-encoded integer that decodes to "null" where a length is required
/// are all `Malformed`.
pub fn decode_handshake_response(data: &[u8]) -> Result<MySqlHandshakeResponse, TapError> {
    if data.len() < 32 {
        return Err(TapError::malformed(PROTOCOL, "handshake response too short"));
    }

    let capability_flags = u32::from_le_bytes(data[0..4].try_into().expect("capability bytes"));
    let max_packet_size = u32::from_le_bytes(data[4..8].try_into().expect("max packet bytes"));
    let character_set = data[8];
    let mut reserved = [0u8; 23];
    reserved.copy_from_slice(&data[9..32]);
    let mut rest = &data[32..];

    let username = take_cstr(&mut rest)
        .ok_or_else(|| TapError::malformed(PROTOCOL, "missing null terminator for username"))?;

    let auth_data = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        let len = *rest
            .first()
            .ok_or_else(|| TapError::malformed(PROTOCOL, "handshake too short for auth length"))?
            as usize;
        rest = &rest[1..];
        if len > 0 {
            if rest.len() < len {
                return Err(TapError::malformed(PROTOCOL, "handshake too short for auth data"));
            }
            let (auth, tail) = rest.split_at(len);
            rest = tail;
            auth.to_vec()
        } else {
            Vec::new()
        }
    } else {
        // Legacy form: a length byte, then a filler byte that is not part of
        // the auth payload.
        if rest.len() < 2 {
            return Err(TapError::malformed(PROTOCOL, "handshake too short for auth length"));
        }
        let len = rest[0] as usize;
        rest = &rest[2..];
        if rest.len() < len {
            return Err(TapError::malformed(PROTOCOL, "handshake too short for auth data"));
        }
        let (auth, tail) = rest.split_at(len);
        rest = tail;
        auth.to_vec()
    };

    let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
        // An unterminated database name leaves the field unset rather than
        // failing the whole packet.
        match rest.iter().position(|b| *b == 0) {
            Some(nul) => {
                let database = String::from_utf8_lossy(&rest[..nul]).into_owned();
                rest = &rest[nul + 1..];
                Some(database)
            }
            None => None,
        }
    } else {
        None
    };

    let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 {
        Some(take_cstr(&mut rest).ok_or_else(|| {
            TapError::malformed(PROTOCOL, "missing null terminator for auth plugin name")
        })?)
    } else {
        None
    };

    let connect_attributes = if capability_flags & CLIENT_CONNECT_ATTRS != 0 {
        if rest.len() < 4 {
            return Err(TapError::malformed(
                PROTOCOL,
                "handshake too short for connection attributes",
            ));
        }
        let (total, is_null, read) = decode_lenenc_int(rest);
        if is_null || read == 0 {
            return Err(TapError::malformed(
                PROTOCOL,
                "bad length of connection attribute block",
            ));
        }
        rest = &rest[read..];
        if rest.len() < total {
            return Err(TapError::malformed(
                PROTOCOL,
                "connection attribute block exceeds packet",
            ));
        }
        let (mut block, tail) = rest.split_at(total);
        rest = tail;

        let mut attributes = Vec::new();
        let mut seen = HashSet::new();
        while !block.is_empty() {
            let key = take_lenenc_str(&mut block)
                .ok_or_else(|| TapError::malformed(PROTOCOL, "bad connection attribute key"))?;
            let value = take_lenenc_str(&mut block)
                .ok_or_else(|| TapError::malformed(PROTOCOL, "bad connection attribute value"))?;
            if !seen.insert(key.clone()) {
                return Err(TapError::malformed(
                    PROTOCOL,
                    format!("duplicate connection attribute key {key}"),
                ));
            }
            attributes.push((key, value));
        }
        attributes
    } else {
        Vec::new()
    };

    let zstd_compression_level =
        if !rest.is_empty() && capability_flags & CLIENT_ZSTD_COMPRESSION_ALGORITHM != 0 {
            Some(rest[0])
        } else {
            None
        };

    Ok(MySqlHandshakeResponse {
        capability_flags,
        max_packet_size,
        character_set,
        reserved,
        username,
        auth_data,
        database,
        auth_plugin_name,
        connect_attributes,
        zstd_compression_level,
    })
}

/// Re-encode a handshake response. Inverse of `decode_handshake_response`
/// up to the legacy filler byte, whose value the decoder discards.
pub fn encode_handshake_response(packet: &MySqlHandshakeResponse) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&packet.capability_flags.to_le_bytes());
    out.extend_from_slice(&packet.max_packet_size.to_le_bytes());
    out.push(packet.character_set);
    out.extend_from_slice(&packet.reserved);
    out.extend_from_slice(packet.username.as_bytes());
    out.push(0);

    if packet.capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        out.push(packet.auth_data.len() as u8);
        out.extend_from_slice(&packet.auth_data);
    } else {
        out.push(packet.auth_data.len() as u8);
        out.push(0); // filler
        out.extend_from_slice(&packet.auth_data);
    }

    if packet.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
        if let Some(database) = packet.database.as_deref() {
            out.extend_from_slice(database.as_bytes());
            out.push(0);
        }
    }
    if packet.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
        if let Some(plugin) = packet.auth_plugin_name.as_deref() {
            out.extend_from_slice(plugin.as_bytes());
            out.push(0);
        }
    }
    if packet.capability_flags & CLIENT_CONNECT_ATTRS != 0 {
        let mut block = Vec::new();
        for (key, value) in &packet.connect_attributes {
            push_lenenc_int(&mut block, key.len());
            block.extend_from_slice(key.as_bytes());
            push_lenenc_int(&mut block, value.len());
            block.extend_from_slice(value.as_bytes());
        }
        push_lenenc_int(&mut out, block.len());
        out.extend_from_slice(&block);
    }
    if let Some(level) = packet.zstd_compression_level {
        out.push(level);
    }
    out
}

/// MySQL length-encoded integer: `(value, is_null, bytes_read)`.
/// `bytes_read == 0` signals a prefix whose advertised width exceeds the
/// buffer.
fn decode_lenenc_int(b: &[u8]) -> (usize, bool, usize) {
    let Some(first) = b.first() else {
        return (0, true, 0);
    };
    match first {
        0xfb => (0, true, 1),
        0xfc => {
            if b.len() < 3 {
                return (0, false, 0);
            }
            (
                u16::from_le_bytes([b[1], b[2]]) as usize,
                false,
                3,
            )
        }
        0xfd => {
            if b.len() < 4 {
                return (0, false, 0);
            }
            (
                b[1] as usize | (b[2] as usize) << 8 | (b[3] as usize) << 16,
                false,
                4,
            )
        }
        0xfe => {
            if b.len() < 9 {
                return (0, false, 0);
            }
            (
                u64::from_le_bytes(b[1..9].try_into().expect("lenenc u64")) as usize,
                false,
                9,
            )
        }
        literal => (*literal as usize, false, 1),
    }
}

fn push_lenenc_int(out: &mut Vec<u8>, value: usize) {
    if value < 0xfb {
        out.push(value as u8);
    } else if value <= 0xffff {
        out.push(0xfc);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xff_ffff {
        out.push(0xfd);
        out.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
    } else {
        out.push(0xfe);
        out.extend_from_slice(&(value as u64).to_le_bytes());
    }
}

fn take_cstr(rest: &mut &[u8]) -> Option<String> {
    let nul = rest.iter().position(|b| *b == 0)?;
    let value = String::from_utf8_lossy(&rest[..nul]).into_owned();
    *rest = &rest[nul + 1..];
    Some(value)
}

fn take_lenenc_str(rest: &mut &[u8]) -> Option<String> {
    let (len, is_null, read) = decode_lenenc_int(rest);
    if is_null || read == 0 {
        return None;
    }
    let tail = rest.get(read..)?;
    if tail.len() < len {
        return None;
    }
    let value = String::from_utf8_lossy(&tail[..len]).into_owned();
    *rest = &tail[len..];
    Some(value)
}

struct MyPacket {
    seq: u8,
    payload: Vec<u8>,
    raw: Vec<u8>,
}

/// Incremental packet assembly: 3-byte little-endian length + sequence id.
struct PacketReader {
    pending: BytesMut,
    chunk: Vec<u8>,
}

impl PacketReader {
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

    async fn next_packet(
        &mut self,
        io: &mut BoxedIo,
        token: &CancellationToken,
    ) -> Result<Option<MyPacket>> {
        if !self.fill(io, 4, token).await? {
            return if self.pending.is_empty() {
                Ok(None)
            } else {
                Err(TapError::malformed(PROTOCOL, "truncated packet header").into())
            };
        }
        let len = self.pending[0] as usize
            | (self.pending[1] as usize) << 8
            | (self.pending[2] as usize) << 16;
        let seq = self.pending[3];
        if !self.fill(io, 4 + len, token).await? {
            return Err(TapError::malformed(PROTOCOL, "truncated packet body").into());
        }
        let raw = self.pending.split_to(4 + len).to_vec();
        let payload = raw[4..].to_vec();
        Ok(Some(MyPacket { seq, payload, raw }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTH_20: [u8; 20] = [
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
        0x10, 0x11, 0x12, 0x13, 0x14,
    ];

    fn handshake_bytes(capability_flags: u32, legacy_filler: Option<u8>) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&capability_flags.to_le_bytes());
        data.extend_from_slice(&0x0100_0000u32.to_le_bytes());
        data.push(0x21);
        data.extend_from_slice(&[0u8; 23]);
        data.extend_from_slice(b"root\0");
        data.push(AUTH_20.len() as u8);
        if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA == 0 {
            data.push(legacy_filler.unwrap_or(0));
        }
        data.extend_from_slice(&AUTH_20);
        if capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            data.extend_from_slice(b"test\0");
        }
        if capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            data.extend_from_slice(b"mysql_native_password\0");
        }
        if capability_flags & CLIENT_CONNECT_ATTRS != 0 {
            data.push(0x08);
            data.push(0x03);
            data.extend_from_slice(b"foo");
            data.push(0x03);
            data.extend_from_slice(b"bar");
        }
        data
    }

    const FULL_CAPS: u32 = CLIENT_CONNECT_WITH_DB
        | CLIENT_PLUGIN_AUTH
        | CLIENT_CONNECT_ATTRS
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;

    #[test]
    fn decodes_full_handshake_response() {
        let packet = decode_handshake_response(&handshake_bytes(FULL_CAPS, None)).expect("decode");
        assert_eq!(packet.username, "root");
        assert_eq!(packet.max_packet_size, 0x0100_0000);
        assert_eq!(packet.character_set, 0x21);
        assert_eq!(packet.auth_data, AUTH_20);
        assert_eq!(packet.database.as_deref(), Some("test"));
        assert_eq!(packet.auth_plugin_name.as_deref(), Some("mysql_native_password"));
        assert_eq!(
            packet.connect_attributes,
            vec![("foo".to_string(), "bar".to_string())]
        );
        assert_eq!(packet.zstd_compression_level, None);
    }

    #[test]
    fn legacy_auth_form_skips_the_filler_byte() {
        let caps = CLIENT_CONNECT_WITH_DB;
        let data = handshake_bytes(caps, Some(0xaa));
        let packet = decode_handshake_response(&data).expect("decode");
        assert_eq!(packet.auth_data, AUTH_20);
        assert_eq!(packet.database.as_deref(), Some("test"));
    }

    #[test]
    fn reencoding_reproduces_the_original_bytes() {
        for caps in [FULL_CAPS, CLIENT_CONNECT_WITH_DB, CLIENT_PLUGIN_AUTH] {
            let data = handshake_bytes(caps, None);
            let packet = decode_handshake_response(&data).expect("decode");
            assert_eq!(encode_handshake_response(&packet), data, "caps {caps:#x}");
        }
    }

    #[test]
    fn zstd_level_is_read_from_residual_data() {
        let caps = CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA | CLIENT_ZSTD_COMPRESSION_ALGORITHM;
        let mut data = handshake_bytes(caps, None);
        data.push(0x03);
        let packet = decode_handshake_response(&data).expect("decode");
        assert_eq!(packet.zstd_compression_level, Some(0x03));
        assert_eq!(encode_handshake_response(&packet), data);
    }

    #[test]
    fn short_buffer_is_malformed() {
        let err = decode_handshake_response(&[0u8; 31]).unwrap_err();
        assert_eq!(err.label(), "malformed");
    }

    #[test]
    fn missing_username_terminator_is_malformed() {
        let mut data = Vec::new();
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.push(0x21);
        data.extend_from_slice(&[0u8; 23]);
        data.extend_from_slice(b"root"); // no terminator
        let err = decode_handshake_response(&data).unwrap_err();
        assert_eq!(err.label(), "malformed");
    }

    #[test]
    fn missing_plugin_terminator_is_malformed() {
        let caps = CLIENT_PLUGIN_AUTH | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;
        let mut data = handshake_bytes(caps, None);
        // Drop the plugin name's trailing NUL.
        assert_eq!(data.pop(), Some(0));
        let err = decode_handshake_response(&data).unwrap_err();
        assert_eq!(err.label(), "malformed");
    }

    #[test]
    fn null_attribute_block_length_is_malformed() {
        let caps = CLIENT_CONNECT_ATTRS | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;
        let mut data = handshake_bytes(CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA, None);
        data[0..4].copy_from_slice(&caps.to_le_bytes());
        data.extend_from_slice(&[0xfb, 0, 0, 0]);
        let err = decode_handshake_response(&data).unwrap_err();
        assert_eq!(err.label(), "malformed");
    }

    #[test]
    fn duplicate_attribute_keys_are_malformed() {
        let caps = CLIENT_CONNECT_ATTRS | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;
        let mut data = handshake_bytes(CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA, None);
        data[0..4].copy_from_slice(&caps.to_le_bytes());
        data.push(0x10);
        for _ in 0..2 {
            data.push(0x03);
            data.extend_from_slice(b"foo");
            data.push(0x03);
            data.extend_from_slice(b"bar");
        }
        let err = decode_handshake_response(&data).unwrap_err();
        assert_eq!(err.label(), "malformed");
    }

    #[test]
    fn lenenc_integer_forms_decode() {
        assert_eq!(decode_lenenc_int(&[0x10]), (0x10, false, 1));
        assert_eq!(decode_lenenc_int(&[0xfb]), (0, true, 1));
        assert_eq!(decode_lenenc_int(&[0xfc, 0x34, 0x12]), (0x1234, false, 3));
        assert_eq!(
            decode_lenenc_int(&[0xfd, 0x56, 0x34, 0x12]),
            (0x123456, false, 4)
        );
        assert_eq!(
            decode_lenenc_int(&[0xfe, 1, 0, 0, 0, 0, 0, 0, 0]),
            (1, false, 9)
        );
        // Advertised width exceeding the buffer reads zero bytes.
        assert_eq!(decode_lenenc_int(&[0xfc, 0x34]), (0, false, 0));
    }

    #[test]
    fn lenenc_integer_roundtrips() {
        for value in [0usize, 0xfa, 0xfb, 0xffff, 0x10000, 0xff_ffff, 0x100_0000] {
            let mut buf = Vec::new();
            push_lenenc_int(&mut buf, value);
            let (decoded, is_null, read) = decode_lenenc_int(&buf);
            assert!(!is_null);
            assert_eq!(read, buf.len());
            assert_eq!(decoded, value);
        }
    }

    #[tokio::test]
    async fn packet_reader_reassembles_split_packets() -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let (mut tx, rx) = tokio::io::duplex(64);
        let mut io: BoxedIo = Box::new(rx);
        // length 5, seq 0, payload "hello"
        let raw = [5u8, 0, 0, 0, b'h', b'e', b'l', b'l', b'o'];
        tokio::spawn(async move {
            tx.write_all(&raw[..4]).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            tx.write_all(&raw[4..]).await.unwrap();
        });

        let token = CancellationToken::new();
        let mut reader = PacketReader::new();
        let packet = reader.next_packet(&mut io, &token).await?.expect("packet");
        assert_eq!(packet.seq, 0);
        assert_eq!(packet.payload, b"hello");
        assert!(reader.next_packet(&mut io, &token).await?.is_none());
        Ok(())
    }
}
