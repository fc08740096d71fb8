//! # Payload Codec
//!
//! Field-level binary serialization used by every message body.
//!
//! A [`Writer`] appends fields through chained calls and yields the final byte
//! vector; a [`Reader`] consumes the same fields in the same order. Every
//! integer is little-endian and every variable-length field carries a `u32`
//! little-endian length prefix.
//!
//! ## Wire Format
//! ```text
//! bytes / string:  [Length(4, LE)] [Data(N)]
//! u16 / u32 / u64: fixed width, little-endian
//! bool:            one byte, 0 or 1
//! ```
//!
//! ## Usage
//! ```rust
//! use peer_protocol::core::payload::{Reader, Writer};
//!
//! let bytes = Writer::new().write_string("alice").write_u32(7).into_bytes();
//!
//! let mut reader = Reader::new(&bytes);
//! assert_eq!(reader.read_string().unwrap(), "alice");
//! assert_eq!(reader.read_u32().unwrap(), 7);
//! assert!(reader.is_empty());
//! ```

use crate::error::{constants, ProtocolError, Result};

/// Width of every length prefix on the wire.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Append-only field writer.
///
/// A length-prefixed field longer than `u32::MAX` cannot be encoded. The
/// writer then stops appending: [`Writer::finish`] reports the field and
/// [`Writer::into_bytes`] yields an empty buffer, which no message with
/// fields decodes from.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
    oversized: Option<usize>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer that appends after an existing buffer.
    pub fn with_buffer(buf: Vec<u8>) -> Self {
        Self {
            buf,
            oversized: None,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_buffer(Vec::with_capacity(capacity))
    }

    fn push(mut self, bytes: &[u8]) -> Self {
        if self.oversized.is_none() {
            self.buf.extend_from_slice(bytes);
        }
        self
    }

    pub fn write_u8(self, value: u8) -> Self {
        self.push(&[value])
    }

    pub fn write_bool(self, value: bool) -> Self {
        self.write_u8(u8::from(value))
    }

    pub fn write_u16(self, value: u16) -> Self {
        self.push(&value.to_le_bytes())
    }

    pub fn write_u32(self, value: u32) -> Self {
        self.push(&value.to_le_bytes())
    }

    pub fn write_u64(self, value: u64) -> Self {
        self.push(&value.to_le_bytes())
    }

    pub fn write_i64(self, value: i64) -> Self {
        self.push(&value.to_le_bytes())
    }

    /// Append raw bytes with no length prefix. Only useful for fixed-size fields.
    pub fn write_raw(self, value: &[u8]) -> Self {
        self.push(value)
    }

    /// Append a length-prefixed byte sequence.
    pub fn write_bytes(self, value: &[u8]) -> Self {
        self.write_prefixed(value.len(), value)
    }

    /// [`Writer::write_bytes`] that fails at once on an oversized sequence.
    pub fn try_write_bytes(self, value: &[u8]) -> Result<Self> {
        self.write_bytes(value).check()
    }

    fn write_prefixed(mut self, len: usize, value: &[u8]) -> Self {
        match u32::try_from(len) {
            Ok(prefix) => self.write_u32(prefix).write_raw(value),
            Err(_) => {
                self.oversized.get_or_insert(len);
                self
            }
        }
    }

    fn check(self) -> Result<Self> {
        match self.oversized {
            Some(len) => Err(ProtocolError::OversizedField(len)),
            None => Ok(self),
        }
    }

    /// Append a length-prefixed UTF-8 string.
    pub fn write_string(self, value: &str) -> Self {
        self.write_bytes(value.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether a field was too long to encode.
    pub fn is_oversized(&self) -> bool {
        self.oversized.is_some()
    }

    /// The encoded fields, or an empty buffer if one was oversized.
    pub fn into_bytes(self) -> Vec<u8> {
        match self.oversized {
            Some(_) => Vec::new(),
            None => self.buf,
        }
    }

    /// The encoded fields.
    ///
    /// # Errors
    /// `OversizedField` if a length-prefixed field exceeded `u32::MAX` bytes.
    pub fn finish(self) -> Result<Vec<u8>> {
        Ok(self.check()?.buf)
    }
}

/// Cursor over a borrowed payload.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Position of the next unread byte.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(ProtocolError::Decode(format!(
                "{}: wanted {n} bytes, {} left",
                constants::ERR_UNEXPECTED_EOF,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::Decode(format!("Invalid bool byte: {other}"))),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    /// Read exactly `N` raw bytes, the counterpart of [`Writer::write_raw`].
    pub fn read_raw<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.take_array()
    }

    /// Read a length-prefixed byte sequence, borrowing from the payload.
    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        if len > self.remaining() {
            return Err(ProtocolError::Decode(format!(
                "{}: prefix {len}, {} left",
                constants::ERR_LENGTH_OVERFLOW,
                self.remaining()
            )));
        }
        self.take(len)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::Decode(constants::ERR_INVALID_UTF8.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_mixed_fields_in_order() {
        let bytes = Writer::new()
            .write_u8(1)
            .write_u16(513)
            .write_u32(70_000)
            .write_u64(u64::MAX)
            .write_i64(-42)
            .write_bool(true)
            .write_bytes(&[9, 8, 7])
            .write_string("hello")
            .into_bytes();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 1);
        assert_eq!(r.read_u16().unwrap(), 513);
        assert_eq!(r.read_u32().unwrap(), 70_000);
        assert_eq!(r.read_u64().unwrap(), u64::MAX);
        assert_eq!(r.read_i64().unwrap(), -42);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_bytes().unwrap(), &[9, 8, 7]);
        assert_eq!(r.read_string().unwrap(), "hello");
        assert!(r.is_empty());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_zero_length_fields_are_present() {
        let bytes = Writer::new().write_string("").write_bytes(&[]).into_bytes();
        assert_eq!(bytes.len(), 2 * LENGTH_PREFIX_SIZE);

        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_string().unwrap(), "");
        assert!(r.read_bytes().unwrap().is_empty());
        assert!(r.is_empty());
    }

    #[test]
    fn test_truncated_integer() {
        let mut r = Reader::new(&[1, 2, 3]);
        assert!(matches!(r.read_u32(), Err(ProtocolError::Decode(_))));
        // A failed read consumes nothing.
        assert_eq!(r.position(), 0);
    }

    #[test]
    fn test_length_prefix_past_end() {
        let bytes = Writer::new().write_u32(100).write_raw(b"short").into_bytes();
        let mut r = Reader::new(&bytes);
        let err = r.read_bytes().unwrap_err();
        assert!(err.to_string().contains("Length prefix"));
    }

    #[test]
    fn test_invalid_utf8() {
        let bytes = Writer::new().write_bytes(&[0xFF, 0xFE]).into_bytes();
        let mut r = Reader::new(&bytes);
        assert!(matches!(r.read_string(), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_invalid_bool() {
        let mut r = Reader::new(&[2]);
        assert!(r.read_bool().is_err());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    #[allow(clippy::unwrap_used)]
    fn test_oversized_field_is_not_truncated() {
        let too_long = u32::MAX as usize + 1;
        let writer = Writer::new()
            .write_u32(7)
            .write_prefixed(too_long, b"")
            .write_string("after");
        assert!(writer.is_oversized());
        assert!(writer.clone().into_bytes().is_empty());
        assert!(matches!(
            writer.finish(),
            Err(ProtocolError::OversizedField(n)) if n == too_long
        ));

        let fine = Writer::new().try_write_bytes(b"abc").unwrap();
        assert!(!fine.is_oversized());
        assert_eq!(fine.finish().unwrap(), [3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn test_little_endian_layout() {
        let bytes = Writer::new().write_u32(1).into_bytes();
        assert_eq!(bytes, vec![1, 0, 0, 0]);
    }
}
