//! Little-endian cursor I/O over byte buffers.
//!
//! [`BufferWriter`] backs outbound frames: it grows geometrically unless
//! constructed with a fixed capacity, and supports the splice operations
//! ([`BufferWriter::insert_bytes`], [`BufferWriter::pad`]) the framer
//! uses to patch encryption envelopes in place. [`BufferReader`] is the
//! bounds-checked counterpart for inbound parsing.

use crate::{Error, Result};

/// Wire representation of a 128-bit decimal value: four little-endian
/// 32-bit parts `(lo, mid, hi, flags)`. Bits 16..24 of `flags` hold the
/// scale, bit 31 the sign; remaining flag bits are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Decimal(pub [u32; 4]);

impl Decimal {
    pub fn new(lo: u32, mid: u32, hi: u32, flags: u32) -> Self {
        Decimal([lo, mid, hi, flags])
    }

    /// Builds a decimal from a 96-bit mantissa, scale and sign.
    pub fn from_parts(mantissa: u128, scale: u8, negative: bool) -> Self {
        let lo = mantissa as u32;
        let mid = (mantissa >> 32) as u32;
        let hi = (mantissa >> 64) as u32;
        let mut flags = (scale as u32) << 16;
        if negative {
            flags |= 0x8000_0000;
        }
        Decimal([lo, mid, hi, flags])
    }

    pub fn mantissa(&self) -> u128 {
        (self.0[0] as u128) | ((self.0[1] as u128) << 32) | ((self.0[2] as u128) << 64)
    }

    pub fn scale(&self) -> u8 {
        ((self.0[3] >> 16) & 0xFF) as u8
    }

    pub fn is_negative(&self) -> bool {
        self.0[3] & 0x8000_0000 != 0
    }
}

/// Growable little-endian writer with an explicit cursor.
///
/// The cursor may sit behind the logical length, in which case writes
/// overwrite existing bytes before extending. The framer relies on this
/// to rewrite length fields after the payload is known.
#[derive(Debug, Clone)]
pub struct BufferWriter {
    buf: Vec<u8>,
    pos: usize,
    fixed: bool,
}

impl Default for BufferWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferWriter {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        BufferWriter {
            buf: Vec::with_capacity(capacity),
            pos: 0,
            fixed: false,
        }
    }

    /// A writer that refuses to grow past `capacity`. Used for pooled
    /// datagram buffers whose size is fixed by the transport; callers
    /// fragment oversized messages before writing.
    ///
    /// # Panics
    /// Writing past `capacity` panics. This is an internal invariant
    /// violation, not a recoverable condition.
    pub fn fixed(capacity: usize) -> Self {
        BufferWriter {
            buf: Vec::with_capacity(capacity),
            pos: 0,
            fixed: true,
        }
    }

    /// Logical length: the highest byte ever written.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Moves the cursor. Positions past the current length are clamped.
    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos.min(self.buf.len());
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    /// Discards contents but keeps the allocation.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }

    fn ensure(&mut self, additional: usize) {
        let needed = self.pos + additional;
        if needed <= self.buf.capacity() {
            return;
        }
        if self.fixed {
            panic!(
                "fixed buffer overflow: need {} bytes, capacity {}",
                needed,
                self.buf.capacity()
            );
        }
        let mut cap = self.buf.capacity().max(64);
        while cap < needed {
            cap *= 2;
        }
        self.buf.reserve_exact(cap - self.buf.len());
    }

    /// Writes raw bytes at the cursor, overwriting then extending.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.ensure(bytes.len());
        let end = self.pos + bytes.len();
        if end <= self.buf.len() {
            self.buf[self.pos..end].copy_from_slice(bytes);
        } else {
            let overlap = self.buf.len() - self.pos;
            self.buf[self.pos..].copy_from_slice(&bytes[..overlap]);
            self.buf.extend_from_slice(&bytes[overlap..]);
        }
        self.pos = end;
    }

    /// Inserts bytes at `offset`, shifting the tail right. The cursor is
    /// adjusted if it sat at or beyond the insertion point.
    pub fn insert_bytes(&mut self, offset: usize, bytes: &[u8]) {
        assert!(offset <= self.buf.len(), "insert past end of buffer");
        if self.fixed {
            assert!(
                self.buf.len() + bytes.len() <= self.buf.capacity(),
                "fixed buffer overflow"
            );
        }
        let tail = self.buf.split_off(offset);
        self.buf.extend_from_slice(bytes);
        self.buf.extend_from_slice(&tail);
        if self.pos >= offset {
            self.pos += bytes.len();
        }
    }

    /// Appends `n` zero bytes at the cursor.
    pub fn pad(&mut self, n: usize) {
        self.ensure(n);
        for _ in 0..n {
            self.write_u8(0);
        }
    }

    /// Truncates the logical length. The cursor is clamped to the new end.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
        self.pos = self.pos.min(self.buf.len());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(if v { 1 } else { 0 });
    }

    pub fn write_u8(&mut self, v: u8) {
        self.write_raw(&[v]);
    }

    pub fn write_i8(&mut self, v: i8) {
        self.write_raw(&[v as u8]);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.write_raw(&v.to_le_bytes());
    }

    pub fn write_i16(&mut self, v: i16) {
        self.write_raw(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write_raw(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_raw(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write_raw(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write_raw(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.write_raw(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.write_raw(&v.to_le_bytes());
    }

    pub fn write_decimal(&mut self, v: Decimal) {
        for part in v.0 {
            self.write_u32(part);
        }
    }

    /// Length-prefixed byte block: i32 length, then the payload.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_i32(bytes.len() as i32);
        self.write_raw(bytes);
    }

    /// Length-prefixed UTF-8 string. `None` encodes as length 0; a
    /// present empty string is not representable on this wire and is
    /// written as null.
    pub fn write_string(&mut self, s: Option<&str>) {
        match s {
            None | Some("") => self.write_i32(0),
            Some(s) => {
                self.write_i32(s.len() as i32);
                self.write_raw(s.as_bytes());
            }
        }
    }
}

/// Bounds-checked little-endian reader over a borrowed byte slice.
///
/// Reads that consume exactly the remaining bytes succeed; any read past
/// the end fails with [`Error::BufferUnderflow`].
#[derive(Debug, Clone)]
pub struct BufferReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BufferReader { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len());
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos == self.data.len()
    }

    /// Borrows `n` bytes at the cursor and advances.
    pub fn read_raw(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::BufferUnderflow {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.read_raw(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    pub fn read_decimal(&mut self) -> Result<Decimal> {
        let mut parts = [0u32; 4];
        for part in &mut parts {
            *part = self.read_u32()?;
        }
        Ok(Decimal(parts))
    }

    /// Length-prefixed byte block. The declared length must be
    /// non-negative and fit in the remaining bytes.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(Error::InvalidLength(len));
        }
        Ok(self.read_raw(len as usize)?.to_vec())
    }

    /// Length-prefixed UTF-8 string; length 0 decodes as `None`.
    pub fn read_string(&mut self) -> Result<Option<String>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(Error::InvalidLength(len));
        }
        if len == 0 {
            return Ok(None);
        }
        let bytes = self.read_raw(len as usize)?;
        let s = std::str::from_utf8(bytes).map_err(|_| Error::InvalidString)?;
        Ok(Some(s.to_owned()))
    }
}
