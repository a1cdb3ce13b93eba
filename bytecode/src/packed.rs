//! Variable-length signed integers.
//!
//! The low bits of the first byte select the form:
//!
//! - `xxxxxxx1` *tiny*: a 7-bit value in the upper bits (-64..=63).
//! - `xxxxx010` *small*: bits 8..12 in the upper bits, one trailing byte
//!   with bits 0..7 (-4096..=4095).
//! - `xxxxx110` *medium*: bits 16..20 in the upper bits, two trailing bytes
//!   big-endian (-1048576..=1048575).
//! - `nnnnnn00` *large*: `n + 1` trailing bytes holding the minimal
//!   big-endian two's complement form, sign-extended on read.

use crate::DecodeError;

const TINY_MIN: i64 = -64;
const TINY_MAX: i64 = 63;
const SMALL_MIN: i64 = -4096;
const SMALL_MAX: i64 = 4095;
const MEDIUM_MIN: i64 = -1_048_576;
const MEDIUM_MAX: i64 = 1_048_575;

/// Number of bytes `n` occupies once packed.
pub fn packed_len(n: i64) -> usize {
    if (TINY_MIN..=TINY_MAX).contains(&n) {
        1
    } else if (SMALL_MIN..=SMALL_MAX).contains(&n) {
        2
    } else if (MEDIUM_MIN..=MEDIUM_MAX).contains(&n) {
        3
    } else {
        1 + significant_bytes(n)
    }
}

/// Append the packed form of `n` to `buf`.
pub fn write_packed(buf: &mut Vec<u8>, n: i64) {
    if (TINY_MIN..=TINY_MAX).contains(&n) {
        buf.push(((n << 1) | 0b1) as u8);
    } else if (SMALL_MIN..=SMALL_MAX).contains(&n) {
        buf.push(((((n >> 8) & 0x1F) << 3) | 0b010) as u8);
        buf.push(n as u8);
    } else if (MEDIUM_MIN..=MEDIUM_MAX).contains(&n) {
        buf.push(((((n >> 16) & 0x1F) << 3) | 0b110) as u8);
        buf.push((n >> 8) as u8);
        buf.push(n as u8);
    } else {
        let len = significant_bytes(n);
        buf.push(((len - 1) << 2) as u8);
        for i in (0..len).rev() {
            buf.push((n >> (i * 8)) as u8);
        }
    }
}

// bytes needed for n in two's complement, sign bit included
fn significant_bytes(n: i64) -> usize {
    let magnitude = if n < 0 { !n } else { n };
    let bits = 65 - magnitude.leading_zeros() as usize;
    bits.div_ceil(8)
}

/// Cursor over a byte slice that understands packed integers.
#[derive(Debug, Clone)]
pub struct PackedReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> PackedReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or(DecodeError::UnexpectedEof { pos: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.bytes.len());
        let Some(end) = end else {
            return Err(DecodeError::UnexpectedEof { pos: self.bytes.len() });
        };
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_packed(&mut self) -> Result<i64, DecodeError> {
        let start = self.pos;
        let first = self.read_u8()?;

        if first & 0b1 != 0 {
            return Ok(((first as i8) >> 1) as i64);
        }

        match first & 0b111 {
            0b010 => {
                let high = ((first as i8) >> 3) as i64;
                let low = self.read_u8()? as i64;
                Ok((high << 8) | low)
            }
            0b110 => {
                let high = ((first as i8) >> 3) as i64;
                let mid = self.read_u8()? as i64;
                let low = self.read_u8()? as i64;
                Ok((high << 16) | (mid << 8) | low)
            }
            _ => {
                let len = (first >> 2) as usize + 1;
                if len > 8 {
                    return Err(DecodeError::PackedOverflow { pos: start, len });
                }
                let bytes = self.read_bytes(len)?;
                let mut value = (bytes[0] as i8) as i64;
                for byte in &bytes[1..] {
                    value = (value << 8) | *byte as i64;
                }
                Ok(value)
            }
        }
    }

    /// Read a packed integer that must fit a `u32`.
    pub fn read_index(&mut self) -> Result<u32, DecodeError> {
        let pos = self.pos;
        let value = self.read_packed()?;
        u32::try_from(value).map_err(|_| DecodeError::OutOfRange { value, pos })
    }

    /// Read a packed integer that must fit an `i32`.
    pub fn read_offset(&mut self) -> Result<i32, DecodeError> {
        let pos = self.pos;
        let value = self.read_packed()?;
        i32::try_from(value).map_err(|_| DecodeError::OutOfRange { value, pos })
    }

    /// Packed byte length followed by UTF-8.
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_index()? as usize;
        let pos = self.pos;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8 { pos })
    }
}

pub fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_packed(buf, s.len() as i64);
    buf.extend_from_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack(n: i64) -> Vec<u8> {
        let mut buf = Vec::new();
        write_packed(&mut buf, n);
        buf
    }

    fn unpack(bytes: &[u8]) -> i64 {
        PackedReader::new(bytes).read_packed().unwrap()
    }

    #[test]
    fn tiny_values_take_one_byte() {
        assert_eq!(pack(0), vec![0x01]);
        assert_eq!(pack(1), vec![0x03]);
        assert_eq!(pack(-1), vec![0xFF]);
        assert_eq!(pack(63), vec![0x7F]);
        assert_eq!(pack(-64), vec![0x81]);
    }

    #[test]
    fn form_boundaries() {
        assert_eq!(packed_len(64), 2);
        assert_eq!(packed_len(-65), 2);
        assert_eq!(packed_len(4095), 2);
        assert_eq!(packed_len(4096), 3);
        assert_eq!(packed_len(-1_048_576), 3);
        assert_eq!(packed_len(1_048_576), 4);
        assert_eq!(packed_len(i64::MAX), 9);
        assert_eq!(packed_len(i64::MIN), 9);

        for n in [64, -65, 4095, -4096, 4096, 1_048_575, -1_048_577, 1 << 40, i64::MIN, i64::MAX] {
            let bytes = pack(n);
            assert_eq!(bytes.len(), packed_len(n), "length of {n}");
            assert_eq!(unpack(&bytes), n, "value of {n}");
        }
    }

    #[test]
    fn small_form_layout() {
        // 300 = 0b1_0010_1100: high bits 0b00001, low byte 0x2C
        assert_eq!(pack(300), vec![(1 << 3) | 0b010, 0x2C]);
        assert_eq!(unpack(&[(1 << 3) | 0b010, 0x2C]), 300);
    }

    #[test]
    fn large_form_sign_extends() {
        let bytes = pack(-3_000_000);
        assert_eq!(bytes[0] & 0b11, 0);
        assert_eq!(bytes.len(), 4);
        assert_eq!(unpack(&bytes), -3_000_000);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = pack(1_000_000);
        let err = PackedReader::new(&bytes[..2]).read_packed().unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedEof { .. }));
    }

    #[test]
    fn oversized_large_form_is_rejected() {
        // declares 9 trailing bytes
        let err = PackedReader::new(&[8 << 2, 0, 0, 0, 0, 0, 0, 0, 0, 0]).read_packed().unwrap_err();
        assert_eq!(err, DecodeError::PackedOverflow { pos: 0, len: 9 });
    }

    #[test]
    fn strings_round_trip() {
        let mut buf = Vec::new();
        write_string(&mut buf, "compare");
        let mut reader = PackedReader::new(&buf);
        assert_eq!(reader.read_string().unwrap(), "compare");
        assert!(reader.is_at_end());
    }
}
