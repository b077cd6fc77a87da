//! Binary framing for protocol messages.
//!
//! Frame: `u32` big-endian body length, then `[kind tag][payload]`.
//! Every number carries an explicit width and every value a type tag.

use super::message::{tag, Message};
use crate::error::{Error, Result};
use crate::notify::{EventKinds, Pattern};
use crate::store::{EntryFlags, Value, ValueType};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const LENGTH_PREFIX: usize = 4;

const PATTERN_EXACT: u8 = 0;
const PATTERN_PREFIX: u8 = 1;

const HELLO_SELECTIVE: u8 = 0x01;

/// Append one framed message to `buf`
pub fn encode(message: &Message, buf: &mut Vec<u8>) {
    let start = buf.len();
    buf.put_u32(0);
    buf.put_u8(message.tag());

    match message {
        Message::Hello {
            max_version,
            selective,
            client_name,
        } => {
            buf.put_u16(*max_version);
            buf.put_u8(if *selective { HELLO_SELECTIVE } else { 0 });
            put_string(buf, client_name);
        }
        Message::ProtocolUnsupported { server_version } => buf.put_u16(*server_version),
        Message::HelloComplete { version } => buf.put_u16(*version),
        Message::KeepAlive
        | Message::ClearAll
        | Message::SnapshotRequest
        | Message::ResyncRequired => {}
        Message::EntryAssign {
            name,
            sequence,
            flags,
            value,
        } => {
            put_string(buf, name);
            buf.put_u64(*sequence);
            buf.put_u8(flags.bits());
            put_value(buf, value);
        }
        Message::EntryUpdate {
            name,
            sequence,
            value,
        } => {
            put_string(buf, name);
            buf.put_u64(*sequence);
            put_value(buf, value);
        }
        Message::EntryFlagsUpdate {
            name,
            sequence,
            flags,
        } => {
            put_string(buf, name);
            buf.put_u64(*sequence);
            buf.put_u8(flags.bits());
        }
        Message::EntryDelete { name } => put_string(buf, name),
        Message::Subscribe {
            id,
            pattern,
            kinds,
            immediate,
        } => {
            buf.put_u32(*id);
            match pattern {
                Pattern::Exact(name) => {
                    buf.put_u8(PATTERN_EXACT);
                    put_string(buf, name);
                }
                Pattern::Prefix(prefix) => {
                    buf.put_u8(PATTERN_PREFIX);
                    put_string(buf, prefix);
                }
            }
            buf.put_u8(kinds.bits());
            buf.put_u8(*immediate as u8);
        }
        Message::Unsubscribe { id } => buf.put_u32(*id),
    }

    let body_len = (buf.len() - start - LENGTH_PREFIX) as u32;
    buf[start..start + LENGTH_PREFIX].copy_from_slice(&body_len.to_be_bytes());
}

pub fn encode_to_vec(message: &Message) -> Vec<u8> {
    let mut buf = Vec::new();
    encode(message, &mut buf);
    buf
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    buf.put_u32(b.len() as u32);
    buf.put_slice(b);
}

fn put_value(buf: &mut Vec<u8>, value: &Value) {
    buf.put_u8(value.value_type().tag());
    match value {
        Value::Boolean(b) => buf.put_u8(*b as u8),
        Value::Double(d) => buf.put_f64(*d),
        Value::String(s) => put_string(buf, s),
        Value::Raw(raw) => put_bytes(buf, raw),
        Value::BooleanArray(items) => {
            buf.put_u32(items.len() as u32);
            for b in items {
                buf.put_u8(*b as u8);
            }
        }
        Value::DoubleArray(items) => {
            buf.put_u32(items.len() as u32);
            for d in items {
                buf.put_f64(*d);
            }
        }
        Value::StringArray(items) => {
            buf.put_u32(items.len() as u32);
            for s in items {
                put_string(buf, s);
            }
        }
    }
}

/// Decode one frame body (tag + payload); trailing bytes are an error
pub fn decode_body(body: &[u8]) -> Result<Message> {
    let mut r = Reader { buf: body };
    let kind = r.u8()?;

    let message = match kind {
        tag::HELLO => {
            let max_version = r.u16()?;
            let flags = r.u8()?;
            if flags & !HELLO_SELECTIVE != 0 {
                return Err(protocol(format!("unknown Hello flags {:#04x}", flags)));
            }
            Message::Hello {
                max_version,
                selective: flags & HELLO_SELECTIVE != 0,
                client_name: r.string()?,
            }
        }
        tag::PROTOCOL_UNSUPPORTED => Message::ProtocolUnsupported {
            server_version: r.u16()?,
        },
        tag::HELLO_COMPLETE => Message::HelloComplete { version: r.u16()? },
        tag::KEEP_ALIVE => Message::KeepAlive,
        tag::ENTRY_ASSIGN => Message::EntryAssign {
            name: r.string()?,
            sequence: r.u64()?,
            flags: r.flags()?,
            value: r.value()?,
        },
        tag::ENTRY_UPDATE => Message::EntryUpdate {
            name: r.string()?,
            sequence: r.u64()?,
            value: r.value()?,
        },
        tag::ENTRY_FLAGS_UPDATE => Message::EntryFlagsUpdate {
            name: r.string()?,
            sequence: r.u64()?,
            flags: r.flags()?,
        },
        tag::ENTRY_DELETE => Message::EntryDelete { name: r.string()? },
        tag::CLEAR_ALL => Message::ClearAll,
        tag::SUBSCRIBE => {
            let id = r.u32()?;
            let pattern = match r.u8()? {
                PATTERN_EXACT => Pattern::Exact(r.string()?),
                PATTERN_PREFIX => Pattern::Prefix(r.string()?),
                other => return Err(protocol(format!("unknown pattern kind {}", other))),
            };
            let kinds = r.u8()?;
            let kinds = EventKinds::from_bits(kinds)
                .ok_or_else(|| protocol(format!("unknown event kinds {:#04x}", kinds)))?;
            Message::Subscribe {
                id,
                pattern,
                kinds,
                immediate: r.bool()?,
            }
        }
        tag::UNSUBSCRIBE => Message::Unsubscribe { id: r.u32()? },
        tag::SNAPSHOT_REQUEST => Message::SnapshotRequest,
        tag::RESYNC_REQUIRED => Message::ResyncRequired,
        other => return Err(protocol(format!("unknown message kind {:#04x}", other))),
    };

    if r.buf.has_remaining() {
        return Err(protocol(format!(
            "{} trailing bytes after {}",
            r.buf.remaining(),
            message.name()
        )));
    }
    Ok(message)
}

fn protocol(msg: String) -> Error {
    Error::Protocol(msg)
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl Reader<'_> {
    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            Err(protocol(format!(
                "truncated message: need {} bytes, have {}",
                n,
                self.buf.remaining()
            )))
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn f64(&mut self) -> Result<f64> {
        self.need(8)?;
        Ok(self.buf.get_f64())
    }

    fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(protocol(format!("invalid boolean byte {}", other))),
        }
    }

    fn count(&mut self, min_element_size: usize) -> Result<usize> {
        let n = self.u32()? as usize;
        // reject counts the remaining bytes cannot possibly hold
        self.need(n.saturating_mul(min_element_size))?;
        Ok(n)
    }

    fn bytes(&mut self) -> Result<Bytes> {
        let n = self.count(1)?;
        Ok(self.buf.copy_to_bytes(n))
    }

    fn string(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| protocol("invalid UTF-8 string".to_string()))
    }

    fn flags(&mut self) -> Result<EntryFlags> {
        let bits = self.u8()?;
        EntryFlags::from_bits(bits).ok_or_else(|| protocol(format!("unknown entry flags {:#04x}", bits)))
    }

    fn value(&mut self) -> Result<Value> {
        let type_tag = self.u8()?;
        let value_type = ValueType::from_tag(type_tag)
            .ok_or_else(|| protocol(format!("unknown value type {:#04x}", type_tag)))?;

        let value = match value_type {
            ValueType::Boolean => Value::Boolean(self.bool()?),
            ValueType::Double => Value::Double(self.f64()?),
            ValueType::String => Value::String(self.string()?),
            ValueType::Raw => Value::Raw(self.bytes()?),
            ValueType::BooleanArray => {
                let n = self.count(1)?;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(self.bool()?);
                }
                Value::BooleanArray(items)
            }
            ValueType::DoubleArray => {
                let n = self.count(8)?;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(self.f64()?);
                }
                Value::DoubleArray(items)
            }
            ValueType::StringArray => {
                let n = self.count(4)?;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(self.string()?);
                }
                Value::StringArray(items)
            }
        };
        Ok(value)
    }
}

/// Reassembles frames from a byte stream
pub struct FrameDecoder {
    buffer: BytesMut,
    max_message_size: usize,
}

impl FrameDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            max_message_size,
        }
    }

    /// Feed data into the decoder
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes received but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decode the next complete message, or None if more data is needed
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        if self.buffer.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if len == 0 {
            return Err(protocol("empty frame".to_string()));
        }
        if len > self.max_message_size {
            return Err(protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                len, self.max_message_size
            )));
        }
        if self.buffer.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }

        self.buffer.advance(LENGTH_PREFIX);
        let body = self.buffer.split_to(len);
        decode_body(&body).map(Some)
    }
}
