//! Buffer plumbing for on-disk records.
//!
//! Every integer on disk is big-endian. `SnapWriter` builds a record
//! payload in memory; `SnapReader` consumes one, failing with `EndOfFile`
//! instead of panicking when a record is shorter than its fields claim.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{error::SnapError, types::SnapResult};

pub struct SnapWriter {
    buf: BytesMut,
}

impl SnapWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Length-prefixed byte sequence: `len (i32)` then the raw bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_i32(bytes.len() as i32);
        self.buf.put_slice(bytes);
    }

    /// Length-prefixed utf8 string.
    pub fn put_str(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

impl Default for SnapWriter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SnapReader {
    buf: Bytes,
}

impl SnapReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize, what: &str) -> SnapResult {
        if self.buf.remaining() < n {
            return Err(SnapError::EndOfFile(format!(
                "need {} bytes for {}, {} left",
                n,
                what,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn get_i32(&mut self) -> SnapResult<i32> {
        self.need(4, "i32")?;
        Ok(self.buf.get_i32())
    }

    pub fn get_i64(&mut self) -> SnapResult<i64> {
        self.need(8, "i64")?;
        Ok(self.buf.get_i64())
    }

    pub fn get_raw(&mut self, n: usize) -> SnapResult<Bytes> {
        self.need(n, "raw bytes")?;
        Ok(self.buf.copy_to_bytes(n))
    }

    /// Length-prefixed byte sequence, the counterpart of `put_bytes`.
    pub fn get_bytes(&mut self) -> SnapResult<Bytes> {
        let len = self.get_i32()?;
        if len < 0 {
            return Err(SnapError::InvalidBTree(format!(
                "negative byte sequence length {}",
                len
            )));
        }
        self.get_raw(len as usize)
    }

    pub fn get_str(&mut self) -> SnapResult<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| SnapError::InvalidBTree(format!("invalid utf8: {}", e)))
    }

    pub fn skip(&mut self, n: usize) -> SnapResult {
        self.need(n, "skip")?;
        self.buf.advance(n);
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut w = SnapWriter::new();
        w.put_i32(-7);
        w.put_i64(1 << 40);
        w.put_str("btree");
        w.put_bytes(&[1, 2, 3]);

        let mut r = SnapReader::new(w.freeze());
        assert_eq!(r.get_i32().unwrap(), -7);
        assert_eq!(r.get_i64().unwrap(), 1 << 40);
        assert_eq!(r.get_str().unwrap(), "btree");
        assert_eq!(r.get_bytes().unwrap().as_ref(), &[1, 2, 3]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_underflow_is_an_error() {
        let mut w = SnapWriter::new();
        w.put_i32(3);
        let mut r = SnapReader::new(w.freeze());
        assert!(r.get_i64().is_err());
    }

    #[test]
    fn test_big_endian_layout() {
        let mut w = SnapWriter::new();
        w.put_i32(1);
        let bytes = w.freeze();
        assert_eq!(bytes.as_ref(), &[0, 0, 0, 1]);
    }
}
