//! Wire codec for the broker protocol.
//!
//! Every message on the wire is one self-delimited frame:
//!
//! ```text
//! [ u32 BE totalLen ][ u32 BE headerLen ][ header bytes ][ payload bytes ]
//! ```
//!
//! `totalLen` counts from its own first byte, so `payloadLen ==
//! totalLen - 8 - headerLen`. The header is a flat record whose field order
//! is fixed per message kind; integers are big-endian and strings carry an
//! unsigned LEB128 varint length prefix followed by UTF-8 bytes. `push`
//! payloads are a sequence of `[u32 BE itemLen][item bytes]` entries.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Cursor};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::messages::*;

/// Bytes taken by the two length words at the front of every frame.
pub const FRAME_OVERHEAD: usize = 8;

/// Default upper bound on `totalLen`; bounds reassembly memory per peer.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unknown message kind 0x{0:02x}")]
    InvalidKind(u8),
    #[error("unknown content type {0}")]
    InvalidContentType(u8),
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, CodecError>;

fn malformed(reason: impl Into<String>) -> CodecError {
    CodecError::MalformedFrame(reason.into())
}

/// Encoder/decoder for whole messages.
///
/// Encoding reuses one scratch buffer for the header region; the scratch is
/// cleared before each encode so no bytes from a previous frame can leak
/// into the next one. Safe only because all encoding happens on the single
/// routing task.
#[derive(Debug)]
pub struct MessageCodec {
    scratch: BytesMut,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            scratch: BytesMut::with_capacity(256),
        }
    }

    /// Encode `message` into one complete frame, length prefix included.
    pub fn encode(&mut self, message: &Message) -> Result<Bytes> {
        self.scratch.clear();
        encode_header(&mut self.scratch, message);
        let payload = encode_payload(message)?;

        let total = FRAME_OVERHEAD + self.scratch.len() + payload.len();
        let mut frame = BytesMut::with_capacity(total);
        frame.put_u32(total as u32);
        frame.put_u32(self.scratch.len() as u32);
        frame.extend_from_slice(&self.scratch);
        frame.extend_from_slice(&payload);
        Ok(frame.freeze())
    }

    /// Decode one complete frame (length prefix included) into a message.
    pub fn decode(frame: &[u8]) -> Result<Message> {
        if frame.len() < FRAME_OVERHEAD {
            return Err(malformed(format!("frame of {} bytes", frame.len())));
        }
        let total = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        let header_len = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
        if total != frame.len() {
            return Err(malformed(format!(
                "totalLen {} does not match frame of {} bytes",
                total,
                frame.len()
            )));
        }
        if header_len > total - FRAME_OVERHEAD {
            return Err(malformed(format!(
                "headerLen {} exceeds frame body of {} bytes",
                header_len,
                total - FRAME_OVERHEAD
            )));
        }

        let header = &frame[FRAME_OVERHEAD..FRAME_OVERHEAD + header_len];
        let payload = &frame[FRAME_OVERHEAD + header_len..];

        // kind sits at a fixed offset: right after the u64 id.
        if header.len() < 9 {
            return Err(malformed(format!("header of {} bytes", header.len())));
        }
        let kind = MessageKind::from_code(header[8]).ok_or(CodecError::InvalidKind(header[8]))?;

        let mut cursor = Cursor::new(header);
        let id = get_u64(&mut cursor)?;
        let _ = get_u8(&mut cursor)?;
        decode_body(kind, id, &mut cursor, payload)
    }
}

fn encode_header(buf: &mut BytesMut, message: &Message) {
    match message {
        Message::Request(m) | Message::BrokerRequest(m) => {
            buf.put_u64(m.id);
            buf.put_u8(message.kind().code());
            buf.put_u8(m.content_type.code());
            buf.put_u8(m.error.code());
            put_string(buf, &m.topic);
            put_string(buf, &m.source);
            put_string(buf, &m.target);
        }
        Message::Response(m) => {
            buf.put_u64(m.id);
            buf.put_u8(MessageKind::Res.code());
            buf.put_u8(m.content_type.code());
            buf.put_u8(m.error.code());
            put_string(buf, &m.topic);
            put_string(buf, &m.source);
            put_string(buf, &m.target);
        }
        Message::Publish(m) => {
            buf.put_u64(m.id);
            buf.put_u8(MessageKind::Pub.code());
            buf.put_u8(m.content_type.code());
            put_string(buf, &m.topic);
            put_string(buf, &m.source);
            put_string(buf, &m.target);
        }
        Message::Subscribe(m) => {
            buf.put_u64(m.id);
            buf.put_u8(MessageKind::Sub.code());
            buf.put_u8(m.content_type.code());
            put_string(buf, &m.topic);
            put_string(buf, &m.source);
        }
        Message::Push(m) => {
            buf.put_u64(m.id);
            buf.put_u8(MessageKind::Push.code());
            buf.put_u8(m.content_type.code());
            put_string(buf, &m.topic);
            put_string(buf, &m.source);
            put_string(buf, &m.target);
            buf.put_u32(m.items.len() as u32);
        }
        Message::Pull(m) => {
            buf.put_u64(m.id);
            buf.put_u8(MessageKind::Pull.code());
            buf.put_u8(m.content_type.code());
            put_string(buf, &m.topic);
            put_string(buf, &m.source);
        }
        Message::Ack(m) => {
            buf.put_u64(m.id);
            buf.put_u8(MessageKind::Ack.code());
            put_string(buf, &m.topic);
        }
        Message::Monitor(m) => {
            buf.put_u64(m.id);
            buf.put_u8(MessageKind::Mon.code());
            buf.put_u8(m.content_type.code());
        }
    }
}

fn encode_payload(message: &Message) -> Result<Bytes> {
    match message {
        Message::Request(m) | Message::BrokerRequest(m) => payload_bytes(&m.payload),
        Message::Response(m) => payload_bytes(&m.payload),
        Message::Publish(m) => payload_bytes(&m.payload),
        Message::Subscribe(m) => payload_bytes(&m.payload),
        Message::Pull(m) => payload_bytes(&m.payload),
        Message::Monitor(m) => payload_bytes(&m.payload),
        Message::Ack(_) => Ok(Bytes::new()),
        Message::Push(m) => {
            let mut buf = BytesMut::new();
            for item in &m.items {
                let bytes = payload_bytes(item)?;
                buf.put_u32(bytes.len() as u32);
                buf.extend_from_slice(&bytes);
            }
            Ok(buf.freeze())
        }
    }
}

fn payload_bytes(payload: &Payload) -> Result<Bytes> {
    match payload {
        Payload::Raw(bytes) => Ok(bytes.clone()),
        Payload::Text(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
        Payload::Json(value) => Ok(Bytes::from(serde_json::to_vec(value)?)),
    }
}

fn decode_payload(content_type: ContentType, bytes: &[u8]) -> Result<Payload> {
    match content_type {
        ContentType::Raw => Ok(Payload::Raw(Bytes::copy_from_slice(bytes))),
        ContentType::String => {
            let text = std::str::from_utf8(bytes)
                .map_err(|_| malformed("invalid UTF-8 in string payload"))?;
            Ok(Payload::Text(text.to_string()))
        }
        ContentType::Json => {
            if bytes.is_empty() {
                return Ok(Payload::Json(serde_json::Value::Null));
            }
            Ok(Payload::Json(serde_json::from_slice(bytes)?))
        }
    }
}

fn decode_body(
    kind: MessageKind,
    id: MessageId,
    header: &mut Cursor<&[u8]>,
    payload: &[u8],
) -> Result<Message> {
    match kind {
        MessageKind::Req | MessageKind::Res | MessageKind::Sreq => {
            let content_type = get_content_type(header)?;
            let error = get_error_code(header)?;
            let topic = get_string(header)?;
            let source = get_string(header)?;
            let target = get_string(header)?;
            let payload = decode_payload(content_type, payload)?;
            match kind {
                MessageKind::Req => Ok(Message::Request(RequestMessage {
                    id,
                    content_type,
                    error,
                    topic,
                    source,
                    target,
                    payload,
                })),
                MessageKind::Sreq => Ok(Message::BrokerRequest(RequestMessage {
                    id,
                    content_type,
                    error,
                    topic,
                    source,
                    target,
                    payload,
                })),
                _ => Ok(Message::Response(ResponseMessage {
                    id,
                    content_type,
                    error,
                    topic,
                    source,
                    target,
                    payload,
                })),
            }
        }
        MessageKind::Pub => {
            let content_type = get_content_type(header)?;
            let topic = get_string(header)?;
            let source = get_string(header)?;
            let target = get_string(header)?;
            let payload = decode_payload(content_type, payload)?;
            Ok(Message::Publish(PublishMessage {
                id,
                content_type,
                topic,
                source,
                target,
                payload,
            }))
        }
        MessageKind::Sub => {
            let content_type = get_content_type(header)?;
            let topic = get_string(header)?;
            let source = get_string(header)?;
            let payload = decode_payload(content_type, payload)?;
            Ok(Message::Subscribe(SubscribeMessage {
                id,
                content_type,
                topic,
                source,
                payload,
            }))
        }
        MessageKind::Push => {
            let content_type = get_content_type(header)?;
            let topic = get_string(header)?;
            let source = get_string(header)?;
            let target = get_string(header)?;
            let item_count = get_u32(header)?;
            let items = decode_push_items(content_type, item_count, payload)?;
            Ok(Message::Push(PushMessage {
                id,
                content_type,
                topic,
                source,
                target,
                items,
            }))
        }
        MessageKind::Pull => {
            let content_type = get_content_type(header)?;
            let topic = get_string(header)?;
            let source = get_string(header)?;
            let payload = decode_payload(content_type, payload)?;
            Ok(Message::Pull(PullMessage {
                id,
                content_type,
                topic,
                source,
                payload,
            }))
        }
        MessageKind::Ack => {
            let topic = get_string(header)?;
            Ok(Message::Ack(AckMessage { id, topic }))
        }
        MessageKind::Mon => {
            let content_type = get_content_type(header)?;
            let payload = decode_payload(content_type, payload)?;
            Ok(Message::Monitor(MonitorMessage {
                id,
                content_type,
                payload,
            }))
        }
    }
}

fn decode_push_items(
    content_type: ContentType,
    item_count: u32,
    payload: &[u8],
) -> Result<Vec<Payload>> {
    let mut items = Vec::with_capacity(item_count as usize);
    let mut rest = payload;
    for index in 0..item_count {
        if rest.len() < 4 {
            return Err(malformed(format!(
                "push item {} truncated ({} bytes left)",
                index,
                rest.len()
            )));
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        if len > rest.len() {
            return Err(malformed(format!(
                "push item {} of {} bytes exceeds remaining payload of {}",
                index,
                len,
                rest.len()
            )));
        }
        items.push(decode_payload(content_type, &rest[..len])?);
        rest = &rest[len..];
    }
    if !rest.is_empty() {
        return Err(malformed(format!(
            "{} trailing bytes after push items",
            rest.len()
        )));
    }
    Ok(items)
}

// Cursor helpers. The bytes Buf accessors panic on underrun, so every read
// is bounds-checked first and truncation surfaces as MalformedFrame.

fn get_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    if cursor.remaining() < 1 {
        return Err(malformed("header truncated"));
    }
    Ok(cursor.get_u8())
}

fn get_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    if cursor.remaining() < 4 {
        return Err(malformed("header truncated"));
    }
    Ok(cursor.get_u32())
}

fn get_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    if cursor.remaining() < 8 {
        return Err(malformed("header truncated"));
    }
    Ok(cursor.get_u64())
}

fn get_content_type(cursor: &mut Cursor<&[u8]>) -> Result<ContentType> {
    let code = get_u8(cursor)?;
    ContentType::from_code(code).ok_or(CodecError::InvalidContentType(code))
}

fn get_error_code(cursor: &mut Cursor<&[u8]>) -> Result<ErrorCode> {
    let code = get_u8(cursor)?;
    ErrorCode::from_code(code).ok_or_else(|| malformed(format!("unknown error code {}", code)))
}

/// Unsigned LEB128: seven value bits per byte, high bit set on continuation.
fn put_uvarint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

fn get_uvarint(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = get_u8(cursor)?;
        if shift >= 64 {
            return Err(malformed("varint overflows u64"));
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn put_string(buf: &mut BytesMut, value: &str) {
    put_uvarint(buf, value.len() as u64);
    buf.extend_from_slice(value.as_bytes());
}

fn get_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = get_uvarint(cursor)? as usize;
    if cursor.remaining() < len {
        return Err(malformed(format!(
            "string of {} bytes overruns header ({} left)",
            len,
            cursor.remaining()
        )));
    }
    let start = cursor.position() as usize;
    let bytes = &cursor.get_ref()[start..start + len];
    let text = std::str::from_utf8(bytes)
        .map_err(|_| malformed("invalid UTF-8 in header string"))?
        .to_string();
    cursor.advance(len);
    Ok(text)
}

/// Stream framer: reassembles whole frames from the per-peer byte stream.
///
/// The decoder yields each frame with its length prefix still in place, so
/// the router can forward received bytes verbatim without re-encoding. The
/// encoder writes frames through unchanged for the same reason.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let total = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if total < FRAME_OVERHEAD {
            return Err(malformed(format!("totalLen {} below frame overhead", total)));
        }
        if total > self.max_frame_size {
            return Err(malformed(format!(
                "totalLen {} exceeds limit of {} bytes",
                total, self.max_frame_size
            )));
        }

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total).freeze();
        let header_len = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
        if header_len > total - FRAME_OVERHEAD {
            return Err(malformed(format!(
                "headerLen {} exceeds frame body of {} bytes",
                header_len,
                total - FRAME_OVERHEAD
            )));
        }
        Ok(Some(frame))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
