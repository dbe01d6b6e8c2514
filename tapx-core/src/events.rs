use anyhow::{anyhow, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Socket identifier assigned by the kernel tracer. Ordering of events is
/// preserved per id; nothing is guaranteed across ids.
pub type ConnId = u64;

const EVENT_WIRE_MAGIC: [u8; 4] = *b"TAPE";
const EVENT_WIRE_VERSION: u8 = 1;
const EVENT_WIRE_HEADER_LEN: usize = 20;

const KIND_OPEN: u8 = 0;
const KIND_DATA: u8 = 1;
const KIND_CLOSE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    fn to_u8(self) -> u8 {
        match self {
            Self::Ingress => 0,
            Self::Egress => 1,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Ingress),
            1 => Ok(Self::Egress),
            other => Err(anyhow!("invalid traffic direction: {}", other)),
        }
    }
}

/// One event from the kernel tracer. Payload buffers are owned copies; the
/// tracer's receive buffer is reused between events, so the reader copies
/// before handing the event over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Open {
        conn_id: ConnId,
    },
    Data {
        conn_id: ConnId,
        direction: Direction,
        payload: Bytes,
    },
    Close {
        conn_id: ConnId,
    },
}

impl SocketEvent {
    pub fn conn_id(&self) -> ConnId {
        match self {
            Self::Open { conn_id } | Self::Close { conn_id } => *conn_id,
            Self::Data { conn_id, .. } => *conn_id,
        }
    }

    pub fn encode_wire(&self, out: &mut Vec<u8>) -> Result<()> {
        let (kind, direction, payload): (u8, u8, &[u8]) = match self {
            Self::Open { .. } => (KIND_OPEN, 0xff, &[]),
            Self::Data {
                direction, payload, ..
            } => (KIND_DATA, direction.to_u8(), payload.as_ref()),
            Self::Close { .. } => (KIND_CLOSE, 0xff, &[]),
        };
        if payload.len() > u32::MAX as usize {
            return Err(anyhow!("socket event payload too large"));
        }

        out.clear();
        out.reserve(EVENT_WIRE_HEADER_LEN + payload.len());
        out.extend_from_slice(&EVENT_WIRE_MAGIC);
        out.push(EVENT_WIRE_VERSION);
        out.push(kind);
        out.push(direction);
        out.push(0); // reserved
        out.extend_from_slice(&self.conn_id().to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        debug_assert_eq!(out.len(), EVENT_WIRE_HEADER_LEN);
        out.extend_from_slice(payload);
        Ok(())
    }

    pub fn decode_wire(buf: Bytes) -> Result<Self> {
        if buf.len() < EVENT_WIRE_HEADER_LEN {
            return Err(anyhow!("socket event truncated (len={})", buf.len()));
        }
        if buf[0..4] != EVENT_WIRE_MAGIC {
            return Err(anyhow!("invalid socket event magic"));
        }
        if buf[4] != EVENT_WIRE_VERSION {
            return Err(anyhow!("unsupported socket event version"));
        }

        let kind = buf[5];
        let conn_id = u64::from_le_bytes(buf[8..16].try_into().expect("conn_id bytes"));
        let payload_len = u32::from_le_bytes(buf[16..20].try_into().expect("payload_len")) as usize;
        if EVENT_WIRE_HEADER_LEN + payload_len != buf.len() {
            return Err(anyhow!(
                "socket event length mismatch (expected={} actual={})",
                EVENT_WIRE_HEADER_LEN + payload_len,
                buf.len()
            ));
        }

        match kind {
            KIND_OPEN => Ok(Self::Open { conn_id }),
            KIND_DATA => Ok(Self::Data {
                conn_id,
                direction: Direction::from_u8(buf[6])?,
                payload: buf.slice(EVENT_WIRE_HEADER_LEN..),
            }),
            KIND_CLOSE => Ok(Self::Close { conn_id }),
            other => Err(anyhow!("invalid socket event kind: {}", other)),
        }
    }
}
