//! Byte-level primitives for the object format: bounds-checked reading,
//! little-endian fixed-width integers and LEB128 varints.

use crate::error::ObjectError;

/// A byte reader with bounds checks. Every failure is `MalformedObject`
/// tagged with the absolute offset where it happened.
#[derive(Clone, Debug)]
pub struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
    /// Absolute position of `bytes[0]` in the enclosing object, for messages.
    base: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            offset: 0,
            base: 0,
        }
    }

    /// A reader over a section payload that reports offsets relative to the whole object.
    pub fn nested(bytes: &'a [u8], base: usize) -> Self {
        Self {
            bytes,
            offset: 0,
            base,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn position(&self) -> usize {
        self.base + self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset >= self.bytes.len()
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.offset)
    }

    pub fn error(&self, reason: impl std::fmt::Display) -> ObjectError {
        ObjectError::malformed(format!("{} (at byte {})", reason, self.position()))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ObjectError> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or_else(|| self.error("length overflow"))?;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or_else(|| self.error("unexpected end of input"))?;
        self.offset = end;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, ObjectError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, ObjectError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, ObjectError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, ObjectError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn read_uleb(&mut self) -> Result<u64, ObjectError> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift == 63 && byte > 1 {
                return Err(self.error("varint overflows 64 bits"));
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                // Reject non-canonical encodings so decode/encode stays byte-exact.
                if byte == 0 && shift > 0 {
                    return Err(self.error("non-canonical varint"));
                }
                return Ok(result);
            }
            shift += 7;
            if shift > 63 {
                return Err(self.error("varint too long"));
            }
        }
    }

    pub fn read_sleb(&mut self) -> Result<i64, ObjectError> {
        let mut result: i64 = 0;
        let mut shift = 0u32;
        let mut previous: Option<u8> = None;
        loop {
            let byte = self.read_u8()?;
            if shift == 63 && byte != 0 && byte != 0x7f {
                return Err(self.error("varint overflows 64 bits"));
            }
            result |= i64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                // A final byte that only repeats the previous sign bit is padding.
                if let Some(prev) = previous {
                    let sign = prev & 0x40 != 0;
                    if (byte == 0 && !sign) || (byte == 0x7f && sign) {
                        return Err(self.error("non-canonical varint"));
                    }
                }
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
            if shift > 63 {
                return Err(self.error("varint too long"));
            }
            previous = Some(byte);
        }
    }

    /// Reads a ULEB128 that must fit in `u32`.
    pub fn read_u32(&mut self) -> Result<u32, ObjectError> {
        let v = self.read_uleb()?;
        u32::try_from(v).map_err(|_| self.error(format!("value {} does not fit in u32", v)))
    }

    /// Reads a ULEB128 that must fit in `u16`.
    pub fn read_u16(&mut self) -> Result<u16, ObjectError> {
        let v = self.read_uleb()?;
        u16::try_from(v).map_err(|_| self.error(format!("value {} does not fit in u16", v)))
    }

    /// Reads an element count, rejecting counts that cannot possibly fit in
    /// the remaining bytes (each element takes at least one byte).
    pub fn read_count(&mut self) -> Result<usize, ObjectError> {
        let n = self.read_uleb()?;
        if n > self.remaining() as u64 {
            return Err(self.error(format!("count {} exceeds remaining input", n)));
        }
        Ok(n as usize)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ObjectError> {
        self.take(len)
    }

    pub fn read_str(&mut self, len: usize) -> Result<&'a str, ObjectError> {
        let start = self.position();
        let b = self.take(len)?;
        std::str::from_utf8(b).map_err(|_| {
            ObjectError::malformed(format!("invalid UTF-8 (at byte {})", start))
        })
    }
}

/// An append-only byte writer.
#[derive(Clone, Debug, Default)]
pub struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }

    pub fn write_u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    pub fn write_u16_le(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32_le(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_uleb(&mut self, mut v: u64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.bytes.push(byte);
                return;
            }
            self.bytes.push(byte | 0x80);
        }
    }

    pub fn write_sleb(&mut self, mut v: i64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            let done = (v == 0 && byte & 0x40 == 0) || (v == -1 && byte & 0x40 != 0);
            if done {
                self.bytes.push(byte);
                return;
            }
            self.bytes.push(byte | 0x80);
        }
    }

    pub fn write_len(&mut self, len: usize) {
        self.write_uleb(len as u64);
    }

    pub fn write_bytes(&mut self, b: &[u8]) {
        self.bytes.extend_from_slice(b);
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_len(s.len());
        self.write_bytes(s.as_bytes());
    }
}
