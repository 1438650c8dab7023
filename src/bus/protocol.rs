//! Minimal client-side implementation of the NSQ V2 wire protocol: the
//! commands and frame shapes needed for `PUB`/`SUB`/`RDY`/`FIN`/`REQ`. Kept
//! free of I/O so the framing logic is unit-testable without a running
//! `nsqd`; `nsq.rs` drives these over a `TcpStream`.

use bytes::{Buf, BufMut, BytesMut};

pub const MAGIC_V2: &[u8; 4] = b"  V2";

pub const FRAME_TYPE_RESPONSE: i32 = 0;
pub const FRAME_TYPE_ERROR: i32 = 1;
pub const FRAME_TYPE_MESSAGE: i32 = 2;

pub const HEARTBEAT: &[u8] = b"_heartbeat_";

/// `IDENTIFY\n<len><json>`
pub fn encode_identify(client_id: &str) -> BytesMut {
    let body = serde_json::json!({ "client_id": client_id, "feature_negotiation": false });
    let payload = serde_json::to_vec(&body).unwrap_or_default();
    encode_command_with_body(b"IDENTIFY", &payload)
}

/// `SUB <topic> <channel>\n`
pub fn encode_sub(topic: &str, channel: &str) -> BytesMut {
    encode_line(&format!("SUB {} {}", topic, channel))
}

/// `RDY <count>\n`
pub fn encode_rdy(count: u32) -> BytesMut {
    encode_line(&format!("RDY {}", count))
}

/// `FIN <id>\n`
pub fn encode_fin(id: &str) -> BytesMut {
    encode_line(&format!("FIN {}", id))
}

/// `REQ <id> <timeout_ms>\n`
pub fn encode_req(id: &str, timeout_ms: u32) -> BytesMut {
    encode_line(&format!("REQ {} {}", id, timeout_ms))
}

/// `NOP\n`
pub fn encode_nop() -> BytesMut {
    encode_line("NOP")
}

/// `PUB <topic>\n<len><body>`
pub fn encode_pub(topic: &str, body: &[u8]) -> BytesMut {
    let mut cmd = format!("PUB {}\n", topic).into_bytes();
    let mut buf = BytesMut::with_capacity(cmd.len() + 4 + body.len());
    buf.put(cmd.split_off(0).as_slice());
    buf.put_u32(body.len() as u32);
    buf.put(body);
    buf
}

fn encode_line(line: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(line.len() + 1);
    buf.put(line.as_bytes());
    buf.put_u8(b'\n');
    buf
}

fn encode_command_with_body(name: &[u8], body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(name.len() + 1 + 4 + body.len());
    buf.put(name);
    buf.put_u8(b'\n');
    buf.put_u32(body.len() as u32);
    buf.put(body);
    buf
}

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Vec<u8>),
    Error(Vec<u8>),
    Message(NsqMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsqMessage {
    pub timestamp: i64,
    pub attempts: u16,
    pub id: String,
    pub body: Vec<u8>,
}

/// Decode one frame from a buffer that starts with the 4-byte size field.
/// Returns `None` if the buffer doesn't yet hold a complete frame (caller
/// should read more bytes and retry).
pub fn decode_frame(buf: &mut BytesMut) -> Option<Frame> {
    if buf.len() < 4 {
        return None;
    }
    let size = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
    if buf.len() < 4 + size {
        return None;
    }

    buf.advance(4);
    let mut frame_buf = buf.split_to(size);
    let frame_type = frame_buf.get_i32();
    let data = frame_buf.to_vec();

    Some(match frame_type {
        FRAME_TYPE_ERROR => Frame::Error(data),
        FRAME_TYPE_MESSAGE => Frame::Message(decode_message(&data)),
        _ => Frame::Response(data),
    })
}

fn decode_message(data: &[u8]) -> NsqMessage {
    let mut buf = BytesMut::from(data);
    let timestamp = buf.get_i64();
    let attempts = buf.get_u16();
    let id = String::from_utf8_lossy(&buf[..16.min(buf.len())]).to_string();
    buf.advance(16.min(buf.len()));
    NsqMessage {
        timestamp,
        attempts,
        id,
        body: buf.to_vec(),
    }
}
