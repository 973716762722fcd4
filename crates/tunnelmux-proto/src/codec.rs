//! Frame codec
//!
//! [`FrameCodec`] turns a byte stream into [`Message`]s and back. It is used
//! with `tokio_util::codec::FramedRead`/`FramedWrite` by the tunnel transport.
//!
//! # Limits
//!
//! The size prefix is checked against the configured maximum before any
//! body bytes are buffered, so an agent cannot force an unbounded
//! allocation. Oversized frames fail with [`FrameError::TooLarge`].
//!
//! A clean end of stream between frames surfaces as the end of the
//! `FramedRead` stream. An end of stream inside a frame is an I/O error.
//! Read timeouts are applied by the transport, not here.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use crate::message::{flags, FieldId, FieldType, FieldValue, Message, MessageCode};

/// Default maximum frame size (256 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Size prefix + code + flags + id
pub const FRAME_HEADER_SIZE: usize = 12;

/// Smallest field encoding: id + tag + one byte of value
const MIN_FIELD_SIZE: usize = 6;

/// Frame codec errors
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame exceeds the configured limit
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge {
        /// Size announced by the prefix (or computed for an outgoing frame)
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// Frame is structurally invalid
    #[error("malformed frame: {0}")]
    Protocol(String),

    /// Underlying stream failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

/// Length-prefixed message codec with a bounded frame size
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec with the default 256 MiB limit
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Codec with a custom limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.max(FRAME_HEADER_SIZE),
        }
    }

    /// Configured limit
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, FrameError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if size < FRAME_HEADER_SIZE {
            return Err(FrameError::protocol(format!(
                "frame size {} is smaller than the header",
                size
            )));
        }
        if size > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size,
                limit: self.max_frame_size,
            });
        }
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(size).freeze();
        frame.advance(4);
        parse_body(frame).map(Some)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), FrameError> {
        let size = encoded_len(&msg);
        if size > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size,
                limit: self.max_frame_size,
            });
        }
        let size_prefix = u32::try_from(size)
            .map_err(|_| FrameError::protocol(format!("frame size {} overflows u32", size)))?;

        dst.reserve(size);
        dst.put_u32(size_prefix);
        dst.put_u16(msg.code().to_u16());
        dst.put_u16(msg.flags());
        dst.put_u32(msg.id());

        if msg.is_raw() {
            if let Some(payload) = msg.payload() {
                dst.put_slice(payload);
            }
            return Ok(());
        }

        dst.put_u32(msg.field_count() as u32);
        for (id, value) in msg.fields() {
            dst.put_u32(id.0);
            dst.put_u8(value.field_type() as u8);
            put_value(value, dst);
        }
        Ok(())
    }
}

/// Total encoded size of a message, including the size prefix
pub fn encoded_len(msg: &Message) -> usize {
    if msg.is_raw() {
        return FRAME_HEADER_SIZE + msg.payload().map_or(0, |p| p.len());
    }
    FRAME_HEADER_SIZE
        + 4
        + msg
            .fields()
            .map(|(_, value)| 5 + value.encoded_len())
            .sum::<usize>()
}

fn put_value(value: &FieldValue, dst: &mut BytesMut) {
    match value {
        FieldValue::I32(v) => dst.put_i32(*v),
        FieldValue::I64(v) | FieldValue::Time(v) => dst.put_i64(*v),
        FieldValue::U16(v) => dst.put_u16(*v),
        FieldValue::U32(v) => dst.put_u32(*v),
        FieldValue::U64(v) => dst.put_u64(*v),
        FieldValue::Bool(v) => dst.put_u8(u8::from(*v)),
        FieldValue::Guid(g) => dst.put_slice(g.as_bytes()),
        FieldValue::String(s) => {
            dst.put_u32(s.len() as u32);
            dst.put_slice(s.as_bytes());
        }
        FieldValue::Binary(b) => {
            dst.put_u32(b.len() as u32);
            dst.put_slice(b);
        }
    }
}

fn parse_body(mut body: Bytes) -> Result<Message, FrameError> {
    let code = MessageCode::from_u16(body.get_u16());
    let frame_flags = body.get_u16();
    let id = body.get_u32();

    if frame_flags & flags::RAW_BINARY != 0 {
        return Ok(Message::from_parts(
            code,
            id,
            frame_flags,
            BTreeMap::new(),
            Some(body),
        ));
    }

    let count = take_u32(&mut body, "field count")? as usize;
    if count > body.remaining() / MIN_FIELD_SIZE {
        return Err(FrameError::protocol(format!(
            "{} fields cannot fit in {} bytes",
            count,
            body.remaining()
        )));
    }

    let mut fields = BTreeMap::new();
    for _ in 0..count {
        let field_id = FieldId(take_u32(&mut body, "field id")?);
        let tag = take_u8(&mut body, "field type")?;
        let field_type = FieldType::from_u8(tag).ok_or_else(|| {
            FrameError::protocol(format!("unknown type {} for field {}", tag, field_id.0))
        })?;
        let value = take_value(&mut body, field_type)?;
        fields.insert(field_id, value);
    }

    if body.has_remaining() {
        return Err(FrameError::protocol(format!(
            "{} trailing bytes after fields",
            body.remaining()
        )));
    }

    Ok(Message::from_parts(code, id, frame_flags, fields, None))
}

fn need(body: &Bytes, n: usize, what: &str) -> Result<(), FrameError> {
    if body.remaining() < n {
        return Err(FrameError::protocol(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            n,
            body.remaining()
        )));
    }
    Ok(())
}

fn take_u8(body: &mut Bytes, what: &str) -> Result<u8, FrameError> {
    need(body, 1, what)?;
    Ok(body.get_u8())
}

fn take_u32(body: &mut Bytes, what: &str) -> Result<u32, FrameError> {
    need(body, 4, what)?;
    Ok(body.get_u32())
}

fn take_sized(body: &mut Bytes, what: &str) -> Result<Bytes, FrameError> {
    let len = take_u32(body, what)? as usize;
    need(body, len, what)?;
    Ok(body.split_to(len))
}

fn take_value(body: &mut Bytes, field_type: FieldType) -> Result<FieldValue, FrameError> {
    Ok(match field_type {
        FieldType::I32 => {
            need(body, 4, "i32")?;
            FieldValue::I32(body.get_i32())
        }
        FieldType::I64 => {
            need(body, 8, "i64")?;
            FieldValue::I64(body.get_i64())
        }
        FieldType::Time => {
            need(body, 8, "time")?;
            FieldValue::Time(body.get_i64())
        }
        FieldType::U16 => {
            need(body, 2, "u16")?;
            FieldValue::U16(body.get_u16())
        }
        FieldType::U32 => FieldValue::U32(take_u32(body, "u32")?),
        FieldType::U64 => {
            need(body, 8, "u64")?;
            FieldValue::U64(body.get_u64())
        }
        FieldType::Bool => FieldValue::Bool(take_u8(body, "bool")? != 0),
        FieldType::Guid => {
            need(body, 16, "guid")?;
            let raw = body.split_to(16);
            let guid = Uuid::from_slice(&raw)
                .map_err(|e| FrameError::protocol(format!("invalid guid: {}", e)))?;
            FieldValue::Guid(guid)
        }
        FieldType::String => {
            let raw = take_sized(body, "string")?;
            let text = String::from_utf8(raw.to_vec())
                .map_err(|e| FrameError::protocol(format!("invalid utf-8 string: {}", e)))?;
            FieldValue::String(text)
        }
        FieldType::Binary => FieldValue::Binary(take_sized(body, "binary")?),
    })
}
