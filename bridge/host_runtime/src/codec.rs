//! Binary message encoding.
//!
//! All integers and doubles are big-endian. A batch is a sequence of frames,
//! each a `u32` length followed by one encoded message:
//!
//! ```text
//! message := type:str  correlation_id:i64  timestamp:f64  field_count:u32  field*
//! field   := name:str  kind:u8  value
//! str     := len:u32  utf8[len]
//! ```
//!
//! Value layouts per kind: `Real64` 8 bytes, `Int64` 8 bytes, `Bool` 1 byte,
//! `String` as `str`, `Bytes` as `len:u32 raw[len]`, `Message` as
//! `len:u32 message[len]`, `List` as `count:u32 (kind:u8 value)*`.

use crate::error::{BusError, BusResult};
use crate::message::Message;
use crate::value::{Value, ValueKind};
use indexmap::IndexMap;

pub const FRAME_HEADER_LEN: usize = 4;
pub const MAX_NESTING_DEPTH: usize = 32;

pub(crate) fn encode_message(message: &Message, out: &mut Vec<u8>) -> BusResult<()> {
    encode_at_depth(message, out, 0)
}

pub(crate) fn decode_message(bytes: &[u8]) -> BusResult<Message> {
    let mut reader = Reader::new(bytes);
    let message = decode_at_depth(&mut reader, 0)?;
    if reader.remaining() > 0 {
        return Err(BusError::malformed(format!(
            "field count does not match payload: {} trailing bytes after {} fields",
            reader.remaining(),
            message.len()
        )));
    }
    Ok(message)
}

/// Appends one length-prefixed frame to `out`.
pub fn write_frame(out: &mut Vec<u8>, payload: &[u8], max_frame_len: usize) -> BusResult<()> {
    if payload.len() > max_frame_len {
        return Err(BusError::MessageTooLarge {
            len: payload.len(),
            max: max_frame_len,
        });
    }

    let len = length_prefix(payload.len())?;
    out.reserve(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Reads the frame at the start of `bytes`.
///
/// Returns `Ok(None)` when `bytes` holds only part of a frame, otherwise the
/// payload and the total number of bytes the frame occupies.
pub fn read_frame(bytes: &[u8], max_frame_len: usize) -> BusResult<Option<(&[u8], usize)>> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let mut len_buf = [0_u8; FRAME_HEADER_LEN];
    len_buf.copy_from_slice(&bytes[..FRAME_HEADER_LEN]);
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_frame_len {
        return Err(BusError::malformed(format!(
            "frame too large: {len} > {max_frame_len}"
        )));
    }

    let end = FRAME_HEADER_LEN + len;
    if bytes.len() < end {
        return Ok(None);
    }

    Ok(Some((&bytes[FRAME_HEADER_LEN..end], end)))
}

pub fn encode_batch<'a>(
    messages: impl IntoIterator<Item = &'a Message>,
    max_frame_len: usize,
) -> BusResult<Vec<u8>> {
    let mut out = Vec::new();
    for message in messages {
        let payload = message.encode()?;
        write_frame(&mut out, &payload, max_frame_len)?;
    }
    Ok(out)
}

/// Decodes a complete batch. A trailing partial frame is an error here; the
/// bus itself carries partial frames over to the next cycle instead.
pub fn decode_batch(bytes: &[u8], max_frame_len: usize) -> BusResult<Vec<Message>> {
    let mut messages = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        match read_frame(&bytes[pos..], max_frame_len)? {
            Some((payload, used)) => {
                messages.push(Message::decode(payload)?);
                pos += used;
            }
            None => {
                return Err(BusError::malformed(format!(
                    "truncated frame at offset {pos}"
                )));
            }
        }
    }

    Ok(messages)
}

fn encode_at_depth(message: &Message, out: &mut Vec<u8>, depth: usize) -> BusResult<()> {
    if depth > MAX_NESTING_DEPTH {
        return Err(BusError::malformed(format!(
            "nesting deeper than {MAX_NESTING_DEPTH}"
        )));
    }

    put_str(out, message.type_tag())?;
    out.extend_from_slice(&message.correlation_id().to_be_bytes());
    out.extend_from_slice(&message.timestamp().to_bits().to_be_bytes());
    put_u32(out, message.len())?;

    for (name, value) in message.fields() {
        put_str(out, name)?;
        out.push(value.kind().as_byte());
        encode_value(value, out, depth)?;
    }

    Ok(())
}

fn encode_value(value: &Value, out: &mut Vec<u8>, depth: usize) -> BusResult<()> {
    match value {
        Value::Real64(v) => out.extend_from_slice(&v.to_bits().to_be_bytes()),
        Value::Int64(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::Bool(v) => out.push(u8::from(*v)),
        Value::String(s) => put_str(out, s)?,
        Value::Bytes(bytes) => {
            put_u32(out, bytes.len())?;
            out.extend_from_slice(bytes);
        }
        Value::Message(nested) => {
            let mut body = Vec::new();
            encode_at_depth(nested, &mut body, depth + 1)?;
            put_u32(out, body.len())?;
            out.extend_from_slice(&body);
        }
        Value::List(items) => {
            if depth + 1 > MAX_NESTING_DEPTH {
                return Err(BusError::malformed(format!(
                    "nesting deeper than {MAX_NESTING_DEPTH}"
                )));
            }
            put_u32(out, items.len())?;
            for item in items {
                out.push(item.kind().as_byte());
                encode_value(item, out, depth + 1)?;
            }
        }
    }
    Ok(())
}

fn decode_at_depth(reader: &mut Reader<'_>, depth: usize) -> BusResult<Message> {
    if depth > MAX_NESTING_DEPTH {
        return Err(BusError::malformed(format!(
            "nesting deeper than {MAX_NESTING_DEPTH}"
        )));
    }

    let type_tag = reader.string()?;
    let correlation_id = reader.i64()?;
    let timestamp = f64::from_bits(reader.u64()?);
    let field_count = reader.u32()? as usize;

    let mut fields = IndexMap::with_capacity(field_count.min(reader.remaining()));
    for index in 0..field_count {
        if reader.remaining() == 0 {
            return Err(BusError::malformed(format!(
                "field count {field_count} exceeds payload: ran out after {index} fields"
            )));
        }
        let name = reader.string()?;
        let kind = reader.kind()?;
        let value = decode_value(reader, kind, depth)?;
        if fields.insert(name.clone(), value).is_some() {
            return Err(BusError::malformed(format!("duplicate field '{name}'")));
        }
    }

    Ok(Message::from_parts(type_tag, correlation_id, timestamp, fields))
}

fn decode_value(reader: &mut Reader<'_>, kind: ValueKind, depth: usize) -> BusResult<Value> {
    let value = match kind {
        ValueKind::Real64 => Value::Real64(f64::from_bits(reader.u64()?)),
        ValueKind::Int64 => Value::Int64(reader.i64()?),
        ValueKind::Bool => match reader.u8()? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            other => {
                return Err(BusError::malformed(format!("invalid bool byte {other}")));
            }
        },
        ValueKind::String => Value::String(reader.string()?),
        ValueKind::Bytes => {
            let len = reader.u32()? as usize;
            Value::Bytes(reader.take(len)?.to_vec())
        }
        ValueKind::Message => {
            let len = reader.u32()? as usize;
            let mut nested = Reader::new(reader.take(len)?);
            let message = decode_at_depth(&mut nested, depth + 1)?;
            if nested.remaining() > 0 {
                return Err(BusError::malformed(format!(
                    "nested message has {} trailing bytes",
                    nested.remaining()
                )));
            }
            Value::Message(Box::new(message))
        }
        ValueKind::List => {
            if depth + 1 > MAX_NESTING_DEPTH {
                return Err(BusError::malformed(format!(
                    "nesting deeper than {MAX_NESTING_DEPTH}"
                )));
            }
            let count = reader.u32()? as usize;
            let mut items = Vec::with_capacity(count.min(reader.remaining()));
            for _ in 0..count {
                let item_kind = reader.kind()?;
                items.push(decode_value(reader, item_kind, depth + 1)?);
            }
            Value::List(items)
        }
    };
    Ok(value)
}

fn length_prefix(len: usize) -> BusResult<u32> {
    u32::try_from(len).map_err(|_| BusError::MessageTooLarge {
        len,
        max: u32::MAX as usize,
    })
}

fn put_u32(out: &mut Vec<u8>, len: usize) -> BusResult<()> {
    out.extend_from_slice(&length_prefix(len)?.to_be_bytes());
    Ok(())
}

fn put_str(out: &mut Vec<u8>, s: &str) -> BusResult<()> {
    put_u32(out, s.len())?;
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> BusResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(BusError::malformed(format!(
                "truncated: need {n} bytes at offset {}, have {}",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> BusResult<[u8; N]> {
        let mut buf = [0_u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn u8(&mut self) -> BusResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> BusResult<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> BusResult<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn i64(&mut self) -> BusResult<i64> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    fn kind(&mut self) -> BusResult<ValueKind> {
        let at = self.pos;
        let byte = self.u8()?;
        ValueKind::from_byte(byte).ok_or_else(|| {
            BusError::malformed(format!("unknown value kind {byte} at offset {at}"))
        })
    }

    fn string(&mut self) -> BusResult<String> {
        let len = self.u32()? as usize;
        let at = self.pos;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|err| BusError::malformed(format!("invalid utf-8 at offset {at}: {err}")))
    }
}
