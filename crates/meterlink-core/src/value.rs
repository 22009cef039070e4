//! Tagged wire values exchanged in every remote call.
//!
//! Each call carries an ordered list of [`WireValue`]s as arguments and
//! receives an ordered list back. The tag always matches the payload width,
//! so reading a slot through the wrong accessor yields `None` rather than a
//! reinterpreted value.
//!
//! The byte form is one tag byte followed by a little-endian payload.
//! Strings and binaries are prefixed with a `u32` length.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};
use thiserror::Error;

/// Largest string or binary payload accepted when decoding.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Errors produced while encoding or decoding wire values.
#[derive(Debug, Error)]
pub enum ValueError {
    /// The tag byte does not name a known value type.
    #[error("Unknown value tag: {0}")]
    UnknownTag(u8),

    /// A string payload was not valid UTF-8.
    #[error("String payload is not valid UTF-8")]
    InvalidUtf8,

    /// A length prefix exceeded [`MAX_PAYLOAD_LEN`].
    #[error("Payload length {0} exceeds limit")]
    TooLong(usize),

    /// Bytes were left over after the declared values were read.
    #[error("{0} trailing bytes after value list")]
    TrailingBytes(usize),

    /// The underlying reader or writer failed (including truncated input).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type tag of a [`WireValue`], as written on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueTag {
    Null = 0,
    UInt32 = 1,
    UInt64 = 2,
    Int32 = 3,
    Int64 = 4,
    Float32 = 5,
    Float64 = 6,
    String = 7,
    Binary = 8,
}

impl TryFrom<u8> for ValueTag {
    type Error = ValueError;

    fn try_from(byte: u8) -> Result<Self, ValueError> {
        Ok(match byte {
            0 => Self::Null,
            1 => Self::UInt32,
            2 => Self::UInt64,
            3 => Self::Int32,
            4 => Self::Int64,
            5 => Self::Float32,
            6 => Self::Float64,
            7 => Self::String,
            8 => Self::Binary,
            other => return Err(ValueError::UnknownTag(other)),
        })
    }
}

/// A single argument or result slot of a remote call.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Null,
    UInt32(u32),
    UInt64(u64),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Binary(Vec<u8>),
}

impl WireValue {
    /// The tag this value is written with.
    pub fn tag(&self) -> ValueTag {
        match self {
            Self::Null => ValueTag::Null,
            Self::UInt32(_) => ValueTag::UInt32,
            Self::UInt64(_) => ValueTag::UInt64,
            Self::Int32(_) => ValueTag::Int32,
            Self::Int64(_) => ValueTag::Int64,
            Self::Float32(_) => ValueTag::Float32,
            Self::Float64(_) => ValueTag::Float64,
            Self::String(_) => ValueTag::String,
            Self::Binary(_) => ValueTag::Binary,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Self::Float32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(v) => Some(v),
            _ => None,
        }
    }
}

impl From<u32> for WireValue {
    fn from(v: u32) -> Self {
        Self::UInt32(v)
    }
}

impl From<u64> for WireValue {
    fn from(v: u64) -> Self {
        Self::UInt64(v)
    }
}

impl From<i32> for WireValue {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for WireValue {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f32> for WireValue {
    fn from(v: f32) -> Self {
        Self::Float32(v)
    }
}

impl From<f64> for WireValue {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<String> for WireValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for WireValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<u8>> for WireValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Binary(v)
    }
}

/// Write a length-prefixed byte payload.
pub(crate) fn write_len_prefixed<W: Write>(w: &mut W, bytes: &[u8]) -> Result<(), ValueError> {
    if bytes.len() > MAX_PAYLOAD_LEN {
        return Err(ValueError::TooLong(bytes.len()));
    }
    w.write_u32::<LittleEndian>(bytes.len() as u32)?;
    w.write_all(bytes)?;
    Ok(())
}

/// Read a length-prefixed byte payload.
pub(crate) fn read_len_prefixed<R: Read>(r: &mut R) -> Result<Vec<u8>, ValueError> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(ValueError::TooLong(len));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub(crate) fn write_string<W: Write>(w: &mut W, s: &str) -> Result<(), ValueError> {
    write_len_prefixed(w, s.as_bytes())
}

pub(crate) fn read_string<R: Read>(r: &mut R) -> Result<String, ValueError> {
    String::from_utf8(read_len_prefixed(r)?).map_err(|_| ValueError::InvalidUtf8)
}

/// Write a single value (tag + payload).
pub fn write_value<W: Write>(w: &mut W, value: &WireValue) -> Result<(), ValueError> {
    w.write_u8(value.tag() as u8)?;
    match value {
        WireValue::Null => {}
        WireValue::UInt32(v) => w.write_u32::<LittleEndian>(*v)?,
        WireValue::UInt64(v) => w.write_u64::<LittleEndian>(*v)?,
        WireValue::Int32(v) => w.write_i32::<LittleEndian>(*v)?,
        WireValue::Int64(v) => w.write_i64::<LittleEndian>(*v)?,
        WireValue::Float32(v) => w.write_f32::<LittleEndian>(*v)?,
        WireValue::Float64(v) => w.write_f64::<LittleEndian>(*v)?,
        WireValue::String(v) => write_string(w, v)?,
        WireValue::Binary(v) => write_len_prefixed(w, v)?,
    }
    Ok(())
}

/// Read a single value (tag + payload).
pub fn read_value<R: Read>(r: &mut R) -> Result<WireValue, ValueError> {
    let tag = ValueTag::try_from(r.read_u8()?)?;
    Ok(match tag {
        ValueTag::Null => WireValue::Null,
        ValueTag::UInt32 => WireValue::UInt32(r.read_u32::<LittleEndian>()?),
        ValueTag::UInt64 => WireValue::UInt64(r.read_u64::<LittleEndian>()?),
        ValueTag::Int32 => WireValue::Int32(r.read_i32::<LittleEndian>()?),
        ValueTag::Int64 => WireValue::Int64(r.read_i64::<LittleEndian>()?),
        ValueTag::Float32 => WireValue::Float32(r.read_f32::<LittleEndian>()?),
        ValueTag::Float64 => WireValue::Float64(r.read_f64::<LittleEndian>()?),
        ValueTag::String => WireValue::String(read_string(r)?),
        ValueTag::Binary => WireValue::Binary(read_len_prefixed(r)?),
    })
}

/// Write a `u32` count followed by each value.
pub fn write_values<W: Write>(w: &mut W, values: &[WireValue]) -> Result<(), ValueError> {
    w.write_u32::<LittleEndian>(values.len() as u32)?;
    for value in values {
        write_value(w, value)?;
    }
    Ok(())
}

/// Read a `u32` count followed by that many values.
pub fn read_values<R: Read>(r: &mut R) -> Result<Vec<WireValue>, ValueError> {
    let count = r.read_u32::<LittleEndian>()? as usize;
    // Every value is at least one tag byte, so a sane count is bounded.
    if count > MAX_PAYLOAD_LEN {
        return Err(ValueError::TooLong(count));
    }
    let mut values = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        values.push(read_value(r)?);
    }
    Ok(values)
}

/// Encode a value list into a fresh buffer.
pub fn encode_values(values: &[WireValue]) -> Result<Vec<u8>, ValueError> {
    let mut buf = Vec::new();
    write_values(&mut buf, values)?;
    Ok(buf)
}

/// Decode a value list that must occupy the whole buffer.
pub fn decode_values(bytes: &[u8]) -> Result<Vec<WireValue>, ValueError> {
    let mut cursor = Cursor::new(bytes);
    let values = read_values(&mut cursor)?;
    let rest = bytes.len() - cursor.position() as usize;
    if rest != 0 {
        return Err(ValueError::TrailingBytes(rest));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors_respect_tag() {
        let v = WireValue::UInt64(7);
        assert_eq!(v.as_u64(), Some(7));
        assert_eq!(v.as_u32(), None);
        assert_eq!(v.as_i64(), None);
        assert_eq!(v.tag(), ValueTag::UInt64);

        let s = WireValue::from("hello");
        assert_eq!(s.as_str(), Some("hello"));
        assert!(s.as_bytes().is_none());
        assert!(WireValue::Null.is_null());
    }

    #[test]
    fn test_mixed_list_survives_encoding() {
        let values = vec![
            WireValue::Null,
            WireValue::from(1u32),
            WireValue::from(u64::MAX),
            WireValue::from(-3i32),
            WireValue::from(-4i64),
            WireValue::from(0.25f32),
            WireValue::from(-1.5f64),
            WireValue::from("meter"),
            WireValue::from(vec![0xde, 0xad]),
        ];
        let bytes = encode_values(&values).unwrap();
        assert_eq!(decode_values(&bytes).unwrap(), values);
    }

    #[test]
    fn test_layout_is_little_endian() {
        let mut buf = Vec::new();
        write_value(&mut buf, &WireValue::UInt32(0x0102_0304)).unwrap();
        assert_eq!(buf, vec![1, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let bytes = [1, 0, 0, 0, 42];
        assert!(matches!(
            decode_values(&bytes),
            Err(ValueError::UnknownTag(42))
        ));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let mut bytes = encode_values(&[WireValue::UInt64(9)]).unwrap();
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(decode_values(&bytes), Err(ValueError::Io(_))));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode_values(&[WireValue::Null]).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode_values(&bytes),
            Err(ValueError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let bytes = [1, 0, 0, 0, 7, 2, 0, 0, 0, 0xff, 0xfe];
        assert!(matches!(decode_values(&bytes), Err(ValueError::InvalidUtf8)));
    }
}
