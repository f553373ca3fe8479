//! Little-endian binary encoding for journal and page records.
//!
//! Strings use modified UTF-8 behind a `u16` byte-length prefix: UTF-16 code
//! units are written one at a time, U+0000 takes two bytes, and supplementary
//! characters are written as two three-byte surrogates. Encoded strings longer
//! than 0xffff bytes are rejected with `Error::StringTooLong`.

use crate::{Error, Result};

pub const MAX_UTF_LEN: usize = 0xffff;

/// Bytes `value` takes in modified UTF-8, excluding the length prefix.
pub fn utf_size(value: &str) -> usize {
    value.encode_utf16().map(|unit| unit_size(unit)).sum()
}

#[inline]
fn unit_size(unit: u16) -> usize {
    match unit {
        0x0001..=0x007E => 1,
        0x0800..=0xFFFF => 3,
        _ => 2,
    }
}

/// Appends encoded values to a byte buffer.
pub struct Encoder<'a> {
    out: &'a mut Vec<u8>,
}

impl<'a> Encoder<'a> {
    pub fn new(out: &'a mut Vec<u8>) -> Self {
        Self { out }
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.out.push(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.out.push(u8::from(value));
    }

    pub fn put_u16(&mut self, value: u16) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_i64(&mut self, value: i64) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_f64(&mut self, value: f64) {
        self.out.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    /// Writes a `u32` length followed by the raw bytes.
    pub fn put_bytes(&mut self, value: &[u8]) -> Result<()> {
        let len = u32::try_from(value.len()).map_err(|_| Error::PayloadTooLarge)?;
        self.put_u32(len);
        self.out.extend_from_slice(value);
        Ok(())
    }

    pub fn put_utf(&mut self, value: &str) -> Result<()> {
        let size = utf_size(value);
        if size > MAX_UTF_LEN {
            return Err(Error::StringTooLong(size));
        }
        self.put_u16(size as u16);
        self.out.reserve(size);
        if size == value.len() {
            // Every unit is a single byte.
            self.out.extend_from_slice(value.as_bytes());
            return Ok(());
        }
        for unit in value.encode_utf16() {
            match unit_size(unit) {
                1 => self.out.push(unit as u8),
                2 => {
                    self.out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                    self.out.push(0x80 | (unit & 0x3F) as u8);
                }
                _ => {
                    self.out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                    self.out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                    self.out.push(0x80 | (unit & 0x3F) as u8);
                }
            }
        }
        Ok(())
    }
}

/// Reads values written by [`Encoder`].
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Remaining bytes, consuming them.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(Error::Corrupt("record length overflow"))?;
        if end > self.buf.len() {
            return Err(Error::Corrupt("record truncated"));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::Corrupt("invalid bool")),
        }
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(u64::from_le_bytes(self.take_array()?)))
    }

    /// `count` u64s. A count larger than the remaining input is rejected
    /// before anything is allocated.
    pub fn get_u64_list(&mut self, count: usize) -> Result<Vec<u64>> {
        let bytes = count
            .checked_mul(8)
            .ok_or(Error::Corrupt("record length overflow"))?;
        let raw = self.take(bytes)?;
        Ok(raw
            .chunks_exact(8)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                u64::from_le_bytes(word)
            })
            .collect())
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    pub fn get_utf(&mut self) -> Result<String> {
        let size = self.get_u16()? as usize;
        let bytes = self.take(size)?;
        if bytes.iter().all(|&b| b != 0 && b < 0x80) {
            // Pure ASCII without NUL; identical in both encodings.
            return String::from_utf8(bytes.to_vec()).map_err(|_| Error::Corrupt("invalid utf"));
        }

        let mut units = Vec::with_capacity(size);
        let mut idx = 0;
        let byte_at = |idx: usize| -> Result<u16> {
            bytes
                .get(idx)
                .map(|&b| u16::from(b))
                .ok_or(Error::Corrupt("truncated utf sequence"))
        };
        while idx < bytes.len() {
            let first = u16::from(bytes[idx]);
            match first >> 4 {
                0x0..=0x7 if first != 0 => {
                    units.push(first);
                    idx += 1;
                }
                0xC | 0xD => {
                    let second = byte_at(idx + 1)?;
                    units.push(((first & 0x1F) << 6) | (second & 0x3F));
                    idx += 2;
                }
                0xE => {
                    let second = byte_at(idx + 1)?;
                    let third = byte_at(idx + 2)?;
                    units.push(((first & 0x0F) << 12) | ((second & 0x3F) << 6) | (third & 0x3F));
                    idx += 3;
                }
                _ => return Err(Error::Corrupt("invalid utf lead byte")),
            }
        }
        String::from_utf16(&units).map_err(|_| Error::Corrupt("invalid utf surrogate"))
    }
}
