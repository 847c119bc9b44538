//! Implements AMQP 0-9-1 field tables and the string primitives
//!
//! The value tag set follows the RabbitMQ field-table grammar, which is what
//! every broker and client the proxy fronts actually speaks.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;

pub(crate) fn take_u8(buf: &mut Bytes) -> Result<u8, Error> {
    if buf.remaining() < 1 {
        return Err(Error::UnexpectedEnd);
    }
    Ok(buf.get_u8())
}

pub(crate) fn take_u16(buf: &mut Bytes) -> Result<u16, Error> {
    if buf.remaining() < 2 {
        return Err(Error::UnexpectedEnd);
    }
    Ok(buf.get_u16())
}

pub(crate) fn take_u32(buf: &mut Bytes) -> Result<u32, Error> {
    if buf.remaining() < 4 {
        return Err(Error::UnexpectedEnd);
    }
    Ok(buf.get_u32())
}

pub(crate) fn take_u64(buf: &mut Bytes) -> Result<u64, Error> {
    if buf.remaining() < 8 {
        return Err(Error::UnexpectedEnd);
    }
    Ok(buf.get_u64())
}

pub(crate) fn take_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes, Error> {
    if buf.remaining() < len {
        return Err(Error::UnexpectedEnd);
    }
    Ok(buf.split_to(len))
}

/// Reads a shortstr: one length octet followed by up to 255 octets of UTF-8
pub(crate) fn take_shortstr(buf: &mut Bytes) -> Result<String, Error> {
    let len = take_u8(buf)? as usize;
    let raw = take_bytes(buf, len)?;
    String::from_utf8(raw.to_vec()).map_err(Into::into)
}

/// Reads a longstr: a u32 length followed by arbitrary octets
pub(crate) fn take_longstr(buf: &mut Bytes) -> Result<Bytes, Error> {
    let len = take_u32(buf)? as usize;
    take_bytes(buf, len)
}

pub(crate) fn put_shortstr(dst: &mut BytesMut, value: &str) -> Result<(), Error> {
    if value.len() > u8::MAX as usize {
        return Err(Error::ShortStringTooLong(value.len()));
    }
    dst.put_u8(value.len() as u8);
    dst.put_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn put_longstr(dst: &mut BytesMut, value: &[u8]) {
    dst.put_u32(value.len() as u32);
    dst.put_slice(value);
}

/// A single value in a field table
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// `t` boolean
    Boolean(bool),
    /// `b` short-short-int
    ShortShortInt(i8),
    /// `B` short-short-uint
    ShortShortUInt(u8),
    /// `s` short-int
    ShortInt(i16),
    /// `u` short-uint
    ShortUInt(u16),
    /// `I` long-int
    LongInt(i32),
    /// `i` long-uint
    LongUInt(u32),
    /// `l` long-long-int
    LongLongInt(i64),
    /// `f` float
    Float(f32),
    /// `d` double
    Double(f64),
    /// `D` decimal: scale octet plus unsigned long value
    Decimal(u8, u32),
    /// `S` long string; octets, not necessarily UTF-8
    LongString(Bytes),
    /// `A` field array
    Array(Vec<FieldValue>),
    /// `T` POSIX timestamp
    Timestamp(u64),
    /// `F` nested field table
    Table(FieldTable),
    /// `V` void
    Void,
    /// `x` byte array
    ByteArray(Bytes),
}

impl FieldValue {
    /// Creates a long-string value from UTF-8 text
    pub fn long_string(value: impl Into<String>) -> Self {
        Self::LongString(Bytes::from(value.into().into_bytes()))
    }

    /// The string content of a `LongString` value, if it is one and is UTF-8
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::LongString(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    pub(crate) fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        let tag = take_u8(buf)?;
        let value = match tag {
            b't' => Self::Boolean(take_u8(buf)? != 0),
            b'b' => Self::ShortShortInt(take_u8(buf)? as i8),
            b'B' => Self::ShortShortUInt(take_u8(buf)?),
            b's' => Self::ShortInt(take_u16(buf)? as i16),
            b'u' => Self::ShortUInt(take_u16(buf)?),
            b'I' => Self::LongInt(take_u32(buf)? as i32),
            b'i' => Self::LongUInt(take_u32(buf)?),
            b'l' => Self::LongLongInt(take_u64(buf)? as i64),
            b'f' => Self::Float(f32::from_bits(take_u32(buf)?)),
            b'd' => Self::Double(f64::from_bits(take_u64(buf)?)),
            b'D' => Self::Decimal(take_u8(buf)?, take_u32(buf)?),
            b'S' => Self::LongString(take_longstr(buf)?),
            b'A' => {
                let len = take_u32(buf)? as usize;
                let mut inner = take_bytes(buf, len)?;
                let mut items = Vec::new();
                while inner.has_remaining() {
                    items.push(Self::decode(&mut inner)?);
                }
                Self::Array(items)
            }
            b'T' => Self::Timestamp(take_u64(buf)?),
            b'F' => Self::Table(FieldTable::decode(buf)?),
            b'V' => Self::Void,
            b'x' => Self::ByteArray(take_longstr(buf)?),
            other => return Err(Error::UnknownFieldType(other)),
        };
        Ok(value)
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), Error> {
        match self {
            Self::Boolean(v) => {
                dst.put_u8(b't');
                dst.put_u8(*v as u8);
            }
            Self::ShortShortInt(v) => {
                dst.put_u8(b'b');
                dst.put_i8(*v);
            }
            Self::ShortShortUInt(v) => {
                dst.put_u8(b'B');
                dst.put_u8(*v);
            }
            Self::ShortInt(v) => {
                dst.put_u8(b's');
                dst.put_i16(*v);
            }
            Self::ShortUInt(v) => {
                dst.put_u8(b'u');
                dst.put_u16(*v);
            }
            Self::LongInt(v) => {
                dst.put_u8(b'I');
                dst.put_i32(*v);
            }
            Self::LongUInt(v) => {
                dst.put_u8(b'i');
                dst.put_u32(*v);
            }
            Self::LongLongInt(v) => {
                dst.put_u8(b'l');
                dst.put_i64(*v);
            }
            Self::Float(v) => {
                dst.put_u8(b'f');
                dst.put_u32(v.to_bits());
            }
            Self::Double(v) => {
                dst.put_u8(b'd');
                dst.put_u64(v.to_bits());
            }
            Self::Decimal(scale, value) => {
                dst.put_u8(b'D');
                dst.put_u8(*scale);
                dst.put_u32(*value);
            }
            Self::LongString(v) => {
                dst.put_u8(b'S');
                put_longstr(dst, v);
            }
            Self::Array(items) => {
                dst.put_u8(b'A');
                let mut inner = BytesMut::new();
                for item in items {
                    item.encode(&mut inner)?;
                }
                dst.put_u32(inner.len() as u32);
                dst.put_slice(&inner);
            }
            Self::Timestamp(v) => {
                dst.put_u8(b'T');
                dst.put_u64(*v);
            }
            Self::Table(table) => {
                dst.put_u8(b'F');
                table.encode(dst)?;
            }
            Self::Void => dst.put_u8(b'V'),
            Self::ByteArray(v) => {
                dst.put_u8(b'x');
                put_longstr(dst, v);
            }
        }
        Ok(())
    }
}

/// An AMQP 0-9-1 field table
///
/// Entries keep their wire order; lookups are by key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldTable(Vec<(String, FieldValue)>);

impl FieldTable {
    /// Creates an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry
    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) {
        self.0.push((key.into(), value));
    }

    /// Looks up the first entry with the given key
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0
            .iter()
            .find_map(|(k, v)| (k.as_str() == key).then_some(v))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the table has no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decodes a length-prefixed table
    pub fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        let len = take_u32(buf)? as usize;
        let mut inner = take_bytes(buf, len)?;
        Self::decode_inline(&mut inner)
    }

    /// Decodes name/value pairs until the buffer is exhausted.
    ///
    /// This is the layout of an AMQPLAIN SASL response, which is a bare field
    /// table carried inside the long-string response of Connection.StartOk.
    pub fn decode_inline(buf: &mut Bytes) -> Result<Self, Error> {
        let mut entries = Vec::new();
        while buf.has_remaining() {
            let key = take_shortstr(buf)?;
            let value = FieldValue::decode(buf)?;
            entries.push((key, value));
        }
        Ok(Self(entries))
    }

    /// Encodes the table with its u32 length prefix
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), Error> {
        let mut inner = BytesMut::new();
        for (key, value) in &self.0 {
            put_shortstr(&mut inner, key)?;
            value.encode(&mut inner)?;
        }
        dst.put_u32(inner.len() as u32);
        dst.put_slice(&inner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};

    use super::{FieldTable, FieldValue};

    #[test]
    fn table_round_trip() {
        let mut capabilities = FieldTable::new();
        capabilities.insert("basic.nack", FieldValue::Boolean(true));
        capabilities.insert("publisher_confirms", FieldValue::Boolean(true));

        let mut table = FieldTable::new();
        table.insert("product", FieldValue::long_string("amqpool"));
        table.insert("capabilities", FieldValue::Table(capabilities));
        table.insert("uptime", FieldValue::LongLongInt(-1));

        let mut dst = BytesMut::new();
        table.encode(&mut dst).unwrap();

        let decoded = FieldTable::decode(&mut dst.freeze()).unwrap();
        assert_eq!(decoded, table);
        assert_eq!(decoded.get("product").unwrap().as_str(), Some("amqpool"));
    }

    #[test]
    fn amqplain_inline_table() {
        // LOGIN and PASSWORD as an AMQPLAIN response: no outer length prefix
        let mut dst = BytesMut::new();
        let mut table = FieldTable::new();
        table.insert("LOGIN", FieldValue::long_string("guest"));
        table.insert("PASSWORD", FieldValue::long_string("secret"));
        table.encode(&mut dst).unwrap();

        // strip the length prefix to get the bare pair stream
        let inline = Bytes::copy_from_slice(&dst[4..]);
        let decoded = FieldTable::decode_inline(&mut inline.clone()).unwrap();
        assert_eq!(decoded.get("LOGIN").unwrap().as_str(), Some("guest"));
        assert_eq!(decoded.get("PASSWORD").unwrap().as_str(), Some("secret"));
    }

    #[test]
    fn truncated_table_is_an_error() {
        let mut dst = BytesMut::new();
        let mut table = FieldTable::new();
        table.insert("key", FieldValue::long_string("value"));
        table.encode(&mut dst).unwrap();

        let truncated = dst.freeze().slice(..6);
        assert!(FieldTable::decode(&mut truncated.clone()).is_err());
    }
}
