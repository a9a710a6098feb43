//! Bit-level serialization streams for the wire protocol.
//!
//! Packets and session blobs are bit-packed: bools cost one bit, ranged
//! integers cost exactly `bits_required(min, max)` bits, and optional
//! fields are guarded by explicit presence bits. Write and read sides
//! share a single `serialize` visitor per type (see [`Stream`]), so the
//! field order cannot drift between encode and decode.
//!
//! Bit order is LSB-first within each byte; multi-byte values are
//! little-endian.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("read past end of packet")]
    ReadPastEnd,
    #[error("value {value} outside range [{min}, {max}]")]
    OutOfRange { value: i64, min: i64, max: i64 },
    #[error("string of {len} bytes exceeds maximum {max}")]
    TooLong { len: usize, max: usize },
    #[error("string is not valid utf-8")]
    BadString,
    #[error("unknown address type {0}")]
    BadAddressType(u8),
    #[error("unsupported version {version} (accepted {min}..={max})")]
    UnsupportedVersion { version: u32, min: u32, max: u32 },
    #[error("packet too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
    #[error("bad signature")]
    BadSignature,
}

/// Number of bits needed to serialize a value in `[min, max]`.
/// `min == max` needs zero bits.
pub fn bits_required(min: i64, max: i64) -> u32 {
    debug_assert!(min <= max);
    if min == max {
        0
    } else {
        64 - ((max - min) as u64).leading_zeros()
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct BitWriter {
    data: Vec<u8>,
    scratch: u64,
    scratch_bits: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self { data: Vec::with_capacity(bytes), ..Self::default() }
    }

    /// Append the low `bits` bits of `value`. `bits` must be 1..=32 and
    /// `value` must fit (callers go through [`Stream`], which enforces both).
    pub fn write_bits(&mut self, value: u32, bits: u32) {
        debug_assert!(bits >= 1 && bits <= 32);
        debug_assert!(bits == 32 || u64::from(value) < (1u64 << bits));
        self.scratch |= u64::from(value) << self.scratch_bits;
        self.scratch_bits += bits;
        while self.scratch_bits >= 8 {
            self.data.push(self.scratch as u8);
            self.scratch >>= 8;
            self.scratch_bits -= 8;
        }
    }

    /// Zero-pad to the next byte boundary.
    pub fn write_align(&mut self) {
        if self.scratch_bits > 0 {
            self.data.push(self.scratch as u8);
            self.scratch = 0;
            self.scratch_bits = 0;
        }
    }

    /// Aligned whole-byte append.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_align();
        self.data.extend_from_slice(bytes);
    }

    pub fn bytes_written(&self) -> usize {
        self.data.len() + if self.scratch_bits > 0 { 1 } else { 0 }
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.write_align();
        self.data
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    next_byte: usize,
    scratch: u64,
    scratch_bits: u32,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, next_byte: 0, scratch: 0, scratch_bits: 0 }
    }

    pub fn read_bits(&mut self, bits: u32) -> Result<u32, WireError> {
        debug_assert!(bits >= 1 && bits <= 32);
        while self.scratch_bits < bits {
            let byte = *self.data.get(self.next_byte).ok_or(WireError::ReadPastEnd)?;
            self.scratch |= u64::from(byte) << self.scratch_bits;
            self.next_byte += 1;
            self.scratch_bits += 8;
        }
        let value = (self.scratch & ((1u64 << bits) - 1)) as u32;
        self.scratch >>= bits;
        self.scratch_bits -= bits;
        Ok(value)
    }

    /// Discard pad bits up to the next byte boundary.
    pub fn read_align(&mut self) {
        let rem = self.scratch_bits % 8;
        if rem > 0 {
            self.scratch >>= rem;
            self.scratch_bits -= rem;
        }
    }

    pub fn read_bytes(&mut self, out: &mut [u8]) -> Result<(), WireError> {
        self.read_align();
        for slot in out.iter_mut() {
            // Whole bytes may still sit in scratch after an align.
            if self.scratch_bits >= 8 {
                *slot = self.scratch as u8;
                self.scratch >>= 8;
                self.scratch_bits -= 8;
            } else {
                *slot = *self.data.get(self.next_byte).ok_or(WireError::ReadPastEnd)?;
                self.next_byte += 1;
            }
        }
        Ok(())
    }

    pub fn bytes_read(&self) -> usize {
        self.next_byte - (self.scratch_bits / 8) as usize
    }
}

// ── Streams ───────────────────────────────────────────────────────────────────

/// Symmetric serialization visitor. Each wire type implements a single
/// `serialize` taking `&mut self` and a stream; the same code path runs
/// for encode ([`WriteStream`]) and decode ([`ReadStream`]).
pub trait Stream {
    fn is_writing(&self) -> bool;

    fn serialize_bits(&mut self, value: &mut u32, bits: u32) -> Result<(), WireError>;
    fn serialize_bytes(&mut self, bytes: &mut [u8]) -> Result<(), WireError>;
    fn serialize_align(&mut self) -> Result<(), WireError>;

    fn serialize_bool(&mut self, value: &mut bool) -> Result<(), WireError> {
        let mut bit = u32::from(*value);
        self.serialize_bits(&mut bit, 1)?;
        *value = bit != 0;
        Ok(())
    }

    fn serialize_u8(&mut self, value: &mut u8) -> Result<(), WireError> {
        let mut v = u32::from(*value);
        self.serialize_bits(&mut v, 8)?;
        *value = v as u8;
        Ok(())
    }

    fn serialize_u16(&mut self, value: &mut u16) -> Result<(), WireError> {
        let mut v = u32::from(*value);
        self.serialize_bits(&mut v, 16)?;
        *value = v as u16;
        Ok(())
    }

    fn serialize_u32(&mut self, value: &mut u32) -> Result<(), WireError> {
        self.serialize_bits(value, 32)
    }

    fn serialize_u64(&mut self, value: &mut u64) -> Result<(), WireError> {
        let mut lo = *value as u32;
        let mut hi = (*value >> 32) as u32;
        self.serialize_bits(&mut lo, 32)?;
        self.serialize_bits(&mut hi, 32)?;
        *value = u64::from(lo) | (u64::from(hi) << 32);
        Ok(())
    }

    fn serialize_f32(&mut self, value: &mut f32) -> Result<(), WireError> {
        let mut bits = value.to_bits();
        self.serialize_bits(&mut bits, 32)?;
        *value = f32::from_bits(bits);
        Ok(())
    }

    fn serialize_f64(&mut self, value: &mut f64) -> Result<(), WireError> {
        let mut bits = value.to_bits();
        self.serialize_u64(&mut bits)?;
        *value = f64::from_bits(bits);
        Ok(())
    }

    /// Ranged integer. Costs `bits_required(min, max)` bits on the wire;
    /// out-of-range values are rejected on both sides.
    fn serialize_int_range(&mut self, value: &mut i64, min: i64, max: i64) -> Result<(), WireError> {
        debug_assert!(min < max);
        debug_assert!(max - min <= i64::from(u32::MAX));
        if self.is_writing() && (*value < min || *value > max) {
            return Err(WireError::OutOfRange { value: *value, min, max });
        }
        let bits = bits_required(min, max);
        let mut raw = (*value - min) as u32;
        self.serialize_bits(&mut raw, bits)?;
        let decoded = min + i64::from(raw);
        if decoded > max {
            return Err(WireError::OutOfRange { value: decoded, min, max });
        }
        *value = decoded;
        Ok(())
    }

    /// Length-prefixed byte vector, `len <= max`. Aligned.
    fn serialize_byte_vec(&mut self, bytes: &mut Vec<u8>, max: usize) -> Result<(), WireError> {
        if self.is_writing() && bytes.len() > max {
            return Err(WireError::TooLong { len: bytes.len(), max });
        }
        let mut len = bytes.len() as i64;
        self.serialize_int_range(&mut len, 0, max as i64)?;
        if !self.is_writing() {
            bytes.resize(len as usize, 0);
        }
        self.serialize_bytes(bytes)
    }

    /// Length-prefixed utf-8 string, `len <= max` bytes. Aligned.
    fn serialize_string(&mut self, value: &mut String, max: usize) -> Result<(), WireError> {
        let mut raw = std::mem::take(value).into_bytes();
        self.serialize_byte_vec(&mut raw, max)?;
        *value = String::from_utf8(raw).map_err(|_| WireError::BadString)?;
        Ok(())
    }
}

pub struct WriteStream {
    writer: BitWriter,
}

impl WriteStream {
    pub fn new() -> Self {
        Self { writer: BitWriter::new() }
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self { writer: BitWriter::with_capacity(bytes) }
    }

    pub fn finish(self) -> Vec<u8> {
        self.writer.finish()
    }
}

impl Default for WriteStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream for WriteStream {
    fn is_writing(&self) -> bool {
        true
    }

    fn serialize_bits(&mut self, value: &mut u32, bits: u32) -> Result<(), WireError> {
        self.writer.write_bits(*value, bits);
        Ok(())
    }

    fn serialize_bytes(&mut self, bytes: &mut [u8]) -> Result<(), WireError> {
        self.writer.write_bytes(bytes);
        Ok(())
    }

    fn serialize_align(&mut self) -> Result<(), WireError> {
        self.writer.write_align();
        Ok(())
    }
}

pub struct ReadStream<'a> {
    reader: BitReader<'a>,
}

impl<'a> ReadStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { reader: BitReader::new(data) }
    }

    pub fn bytes_read(&self) -> usize {
        self.reader.bytes_read()
    }
}

impl<'a> Stream for ReadStream<'a> {
    fn is_writing(&self) -> bool {
        false
    }

    fn serialize_bits(&mut self, value: &mut u32, bits: u32) -> Result<(), WireError> {
        *value = self.reader.read_bits(bits)?;
        Ok(())
    }

    fn serialize_bytes(&mut self, bytes: &mut [u8]) -> Result<(), WireError> {
        self.reader.read_bytes(bytes)
    }

    fn serialize_align(&mut self) -> Result<(), WireError> {
        self.reader.read_align();
        Ok(())
    }
}
