//! Cursor-based reader over a received payload.

use crate::error::{Result, TransportError};

/// Reads typed fields from a byte span, advancing a cursor
///
/// Every read fails with [`TransportError::InsufficientData`] when fewer bytes remain
/// than the field needs; the cursor does not move on failure.
#[derive(Debug, Clone)]
pub struct FrameReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    /// Whether every byte has been consumed
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8]> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(TransportError::InsufficientData { needed, remaining });
        }
        let start = self.position;
        self.position += needed;
        Ok(&self.data[start..start + needed])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.take_array().map(u16::from_be_bytes)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.take_array().map(i16::from_be_bytes)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.take_array().map(i32::from_be_bytes)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.take_array().map(f32::from_le_bytes)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.take_array().map(f64::from_le_bytes)
    }

    /// Read a `u16` length prefix and that many UTF-8 bytes
    ///
    /// A zero length yields an empty string. On any failure the cursor is restored.
    pub fn read_str(&mut self) -> Result<&'a str> {
        let start = self.position;
        let result = self.read_u16().and_then(|len| {
            let bytes = self.take(len as usize)?;
            std::str::from_utf8(bytes).map_err(|_| TransportError::InvalidUtf8)
        });
        if result.is_err() {
            self.position = start;
        }
        result
    }

    /// Owned variant of [`FrameReader::read_str`]
    pub fn read_string(&mut self) -> Result<String> {
        self.read_str().map(str::to_owned)
    }

    /// Read exactly `len` raw bytes
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    /// Consume everything that is left
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.position..];
        self.position = self.data.len();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_big_endian_integers() {
        let data = [0x12, 0x34, 0xFF, 0xFE, 0x00, 0x00, 0x01, 0x00];
        let mut reader = FrameReader::new(&data);
        assert_eq!(reader.read_u16().expect("u16"), 0x1234);
        assert_eq!(reader.read_i16().expect("i16"), -2);
        assert_eq!(reader.read_i32().expect("i32"), 256);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_insufficient_data_leaves_cursor() {
        let data = [0x00, 0x01, 0x02];
        let mut reader = FrameReader::new(&data);
        assert_eq!(reader.read_u8().expect("u8"), 0);
        assert!(matches!(
            reader.read_i32(),
            Err(TransportError::InsufficientData { needed: 4, remaining: 2 })
        ));
        assert_eq!(reader.position(), 1);
        assert_eq!(reader.read_u16().expect("u16"), 0x0102);
    }

    #[test]
    fn test_zero_length_string() {
        let data = [0x00, 0x00];
        let mut reader = FrameReader::new(&data);
        assert_eq!(reader.read_str().expect("empty"), "");
        assert!(reader.is_empty());
    }

    #[test]
    fn test_truncated_string_restores_cursor() {
        let data = [0x00, 0x05, b'a', b'b'];
        let mut reader = FrameReader::new(&data);
        assert!(reader.read_str().is_err());
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let data = [0x00, 0x02, 0xC3, 0x28];
        let mut reader = FrameReader::new(&data);
        assert!(matches!(reader.read_str(), Err(TransportError::InvalidUtf8)));
    }

    #[test]
    fn test_floats_are_little_endian() {
        let mut data = 1.5f32.to_le_bytes().to_vec();
        data.extend_from_slice(&(-0.25f64).to_le_bytes());
        let mut reader = FrameReader::new(&data);
        assert_eq!(reader.read_f32().expect("f32"), 1.5);
        assert_eq!(reader.read_f64().expect("f64"), -0.25);
    }
}
