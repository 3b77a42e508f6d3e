//! Little-endian record framing for persisted transfer state.
//!
//! Writer and reader for the sequential-field record format: fixed-width
//! integers, 16-bit-length-prefixed blobs, 6-byte node handles and the
//! 8-byte expansion-flag block that versioned records append. The reader
//! tracks a field counter so a truncated record reports where it died.

use std::fmt;

/// Number of expansion-flag bytes appended by version >= 1 records.
pub const EXPANSION_FLAGS: usize = 8;

/// 48-bit node identifier, serialized as 6 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle(pub u64);

impl NodeHandle {
    pub const BYTES: usize = 6;
    const MASK: u64 = (1 << 48) - 1;

    pub fn new(h: u64) -> Self {
        NodeHandle(h & Self::MASK)
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012x}", self.0)
    }
}

/// Deserialization failure: the record ended (or held junk) at `field`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordError {
    pub field: u32,
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record truncated or malformed at field {}", self.field)
    }
}

impl std::error::Error for RecordError {}

/// Sequential record writer.
#[derive(Debug, Default)]
pub struct RecordWriter {
    buf: Vec<u8>,
}

impl RecordWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Raw bytes, no length prefix.
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// 16-bit length prefix followed by the bytes. Blobs over 64 KiB cannot
    /// occur in this format; lengths are truncated-checked by the caller.
    pub fn put_blob16(&mut self, v: &[u8]) {
        debug_assert!(v.len() <= u16::MAX as usize);
        self.put_u16(v.len() as u16);
        self.put_bytes(v);
    }

    pub fn put_node_handle(&mut self, h: NodeHandle) {
        self.buf.extend_from_slice(&h.0.to_le_bytes()[..NodeHandle::BYTES]);
    }

    /// Expansion flags: 8 bytes, one per flag, 0 or 1. Flags beyond the ones
    /// passed are written as 0 so readers can grow the set later.
    pub fn put_expansion_flags(&mut self, flags: &[bool]) {
        debug_assert!(flags.len() <= EXPANSION_FLAGS);
        for i in 0..EXPANSION_FLAGS {
            self.put_u8(flags.get(i).copied().unwrap_or(false) as u8);
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Sequential record reader with a field counter for diagnostics.
pub struct RecordReader<'a> {
    data: &'a [u8],
    pos: usize,
    field: u32,
}

impl<'a> RecordReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        RecordReader {
            data,
            pos: 0,
            field: 0,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], RecordError> {
        if self.pos + n > self.data.len() {
            return Err(RecordError { field: self.field });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        self.field += 1;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, RecordError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, RecordError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32, RecordError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64, RecordError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_i64(&mut self) -> Result<i64, RecordError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], RecordError> {
        self.take(n)
    }

    pub fn get_blob16(&mut self) -> Result<&'a [u8], RecordError> {
        let len = self.get_u16()? as usize;
        self.take(len)
    }

    pub fn get_node_handle(&mut self) -> Result<NodeHandle, RecordError> {
        let raw = self.take(NodeHandle::BYTES)?;
        let mut b = [0u8; 8];
        b[..NodeHandle::BYTES].copy_from_slice(raw);
        Ok(NodeHandle(u64::from_le_bytes(b)))
    }

    pub fn get_expansion_flags(&mut self) -> Result<[u8; EXPANSION_FLAGS], RecordError> {
        let raw = self.take(EXPANSION_FLAGS)?;
        let mut flags = [0u8; EXPANSION_FLAGS];
        flags.copy_from_slice(raw);
        Ok(flags)
    }

    pub fn has_data_left(&self) -> bool {
        self.pos < self.data.len()
    }

    pub fn field(&self) -> u32 {
        self.field
    }

    /// Fail unless the record was consumed exactly.
    pub fn expect_end(&self) -> Result<(), RecordError> {
        if self.has_data_left() {
            Err(RecordError { field: self.field })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_roundtrip_little_endian() {
        let mut w = RecordWriter::new();
        w.put_u8(0xAB);
        w.put_u16(0x1234);
        w.put_u64(0x0123_4567_89AB_CDEF);
        w.put_i64(-42);
        let bytes = w.into_bytes();
        assert_eq!(bytes[0], 0xAB);
        assert_eq!(&bytes[1..3], &[0x34, 0x12], "u16 must be little-endian");

        let mut r = RecordReader::new(&bytes);
        assert_eq!(r.get_u8().unwrap(), 0xAB);
        assert_eq!(r.get_u16().unwrap(), 0x1234);
        assert_eq!(r.get_u64().unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(r.get_i64().unwrap(), -42);
        assert!(!r.has_data_left());
    }

    #[test]
    fn blob16_roundtrip_and_truncation() {
        let mut w = RecordWriter::new();
        w.put_blob16(b"hello");
        let mut bytes = w.into_bytes();
        {
            let mut r = RecordReader::new(&bytes);
            assert_eq!(r.get_blob16().unwrap(), b"hello");
        }
        bytes.truncate(4); // length says 5, only 2 bytes present
        let mut r = RecordReader::new(&bytes);
        let err = r.get_blob16().unwrap_err();
        assert_eq!(err.field, 1, "length was read as field 0");
    }

    #[test]
    fn node_handle_is_six_bytes() {
        let mut w = RecordWriter::new();
        w.put_node_handle(NodeHandle::new(0xFFFF_AABB_CCDD_EE99));
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 6);
        let mut r = RecordReader::new(&bytes);
        let h = r.get_node_handle().unwrap();
        assert_eq!(h, NodeHandle::new(0xAABB_CCDD_EE99));
    }

    #[test]
    fn expansion_flags_pad_to_eight() {
        let mut w = RecordWriter::new();
        w.put_expansion_flags(&[true, false, true]);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), EXPANSION_FLAGS);
        let mut r = RecordReader::new(&bytes);
        let flags = r.get_expansion_flags().unwrap();
        assert_eq!(&flags[..3], &[1, 0, 1]);
        assert_eq!(&flags[3..], &[0; 5]);
    }

    #[test]
    fn expect_end_rejects_trailing_bytes() {
        let mut w = RecordWriter::new();
        w.put_u8(1);
        w.put_u8(2);
        let bytes = w.into_bytes();
        let mut r = RecordReader::new(&bytes);
        r.get_u8().unwrap();
        assert!(r.expect_end().is_err());
        r.get_u8().unwrap();
        assert!(r.expect_end().is_ok());
    }
}
