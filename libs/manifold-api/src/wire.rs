//! Binary message codec — the one persisted contract the core owns.
//!
//! Layout, little-endian throughout: a `u32` frame length, then a version
//! byte, `origin_stream_id` (u64), `stream_id` (u64), `prev_stream_id`
//! (u64), timestamp (i64, unix nanoseconds), the metadata map, and the
//! length-prefixed payload. Frames written by other format versions are
//! refused with a version mismatch.

use crate::message::Message;
use crate::metadata::{Metadata, MetadataValue};
use crate::stream::StreamId;

/// Current wire format version. There is exactly one supported version;
/// older incompatible layouts are rejected, never silently accepted.
pub const WIRE_VERSION: u8 = 2;

const TAG_BYTES: u8 = 0;
const TAG_STR: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_BOOL: u8 = 4;
const TAG_LIST: u8 = 5;
const TAG_MAP: u8 = 6;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("truncated frame: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("wire version mismatch: found {found}, expected {WIRE_VERSION}")]
    VersionMismatch { found: u8 },

    #[error("unknown metadata value tag: {0}")]
    UnknownTag(u8),

    #[error("metadata key is not valid utf-8")]
    BadKey(#[from] std::string::FromUtf8Error),
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Append one framed message to `buf`.
pub fn encode(msg: &Message, buf: &mut Vec<u8>) {
    let frame_start = buf.len();
    buf.extend_from_slice(&0u32.to_le_bytes()); // frame length, patched below

    buf.push(WIRE_VERSION);
    buf.extend_from_slice(&msg.origin_stream_id().0.to_le_bytes());
    buf.extend_from_slice(&msg.stream_id().0.to_le_bytes());
    buf.extend_from_slice(&msg.prev_stream_id().0.to_le_bytes());
    buf.extend_from_slice(&msg.timestamp_ns().to_le_bytes());

    encode_metadata(&msg.metadata, buf);

    buf.extend_from_slice(&(msg.payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&msg.payload);

    let frame_len = (buf.len() - frame_start - 4) as u32;
    buf[frame_start..frame_start + 4].copy_from_slice(&frame_len.to_le_bytes());
}

/// Encode one message into a fresh buffer.
pub fn serialize(msg: &Message) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + msg.payload.len());
    encode(msg, &mut buf);
    buf
}

fn encode_metadata(md: &Metadata, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(md.len() as u32).to_le_bytes());
    for (key, value) in md.iter() {
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(key.as_bytes());
        encode_value(value, buf);
    }
}

fn encode_value(value: &MetadataValue, buf: &mut Vec<u8>) {
    match value {
        MetadataValue::Bytes(b) => {
            buf.push(TAG_BYTES);
            buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
            buf.extend_from_slice(b);
        }
        MetadataValue::Str(s) => {
            buf.push(TAG_STR);
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        MetadataValue::Int(v) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        MetadataValue::Float(v) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        MetadataValue::Bool(v) => {
            buf.push(TAG_BOOL);
            buf.push(*v as u8);
        }
        MetadataValue::List(items) => {
            buf.push(TAG_LIST);
            buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                encode_value(item, buf);
            }
        }
        MetadataValue::Map(md) => {
            buf.push(TAG_MAP);
            encode_metadata(md, buf);
        }
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode one frame from the start of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame
/// (streaming callers keep reading); `Ok(Some((message, consumed)))` on
/// success.
pub fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>, WireError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let frame_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let total = 4 + frame_len;
    if buf.len() < total {
        return Ok(None);
    }

    let mut r = Reader {
        buf: &buf[4..total],
        pos: 0,
    };

    let version = r.u8()?;
    if version != WIRE_VERSION {
        return Err(WireError::VersionMismatch { found: version });
    }

    let origin = StreamId(r.u64()?);
    let stream = StreamId(r.u64()?);
    let prev = StreamId(r.u64()?);
    let timestamp_ns = r.i64()?;
    let metadata = decode_metadata(&mut r)?;
    let payload = r.bytes()?.to_vec();

    let msg = Message::from_parts(payload, metadata, origin, stream, prev, timestamp_ns);
    Ok(Some((msg, total)))
}

/// Decode a buffer holding exactly one frame.
pub fn deserialize(buf: &[u8]) -> Result<Message, WireError> {
    match decode(buf)? {
        Some((msg, _)) => Ok(msg),
        None => Err(WireError::Truncated {
            needed: 4,
            have: buf.len(),
        }),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.buf.len() {
            return Err(WireError::Truncated {
                needed: self.pos + n,
                have: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().expect("slice length checked")))
    }

    fn i64(&mut self) -> Result<i64, WireError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes(b.try_into().expect("slice length checked")))
    }

    fn f64(&mut self) -> Result<f64, WireError> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes(b.try_into().expect("slice length checked")))
    }

    fn bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}

fn decode_metadata(r: &mut Reader<'_>) -> Result<Metadata, WireError> {
    let count = r.u32()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key = String::from_utf8(r.bytes()?.to_vec())?;
        let value = decode_value(r)?;
        entries.push((key, value));
    }
    Ok(entries.into_iter().collect())
}

fn decode_value(r: &mut Reader<'_>) -> Result<MetadataValue, WireError> {
    let tag = r.u8()?;
    match tag {
        TAG_BYTES => Ok(MetadataValue::Bytes(r.bytes()?.to_vec())),
        TAG_STR => Ok(MetadataValue::Str(String::from_utf8(r.bytes()?.to_vec())?)),
        TAG_INT => Ok(MetadataValue::Int(r.i64()?)),
        TAG_FLOAT => Ok(MetadataValue::Float(r.f64()?)),
        TAG_BOOL => Ok(MetadataValue::Bool(r.u8()? != 0)),
        TAG_LIST => {
            let count = r.u32()?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(decode_value(r)?);
            }
            Ok(MetadataValue::List(items))
        }
        TAG_MAP => Ok(MetadataValue::Map(decode_metadata(r)?)),
        other => Err(WireError::UnknownTag(other)),
    }
}
