//! Frame builder writing straight into a pooled buffer.
//!
//! The writer reserves the full UDP header, appends typed fields after it and
//! back-patches the length when finished. `to_tcp_frame` exposes the frame from the
//! length field onward; `to_udp_frame` exposes the whole buffer prefix and leaves the
//! session, sequence and ack fields zeroed for [`Frame::stamp`].

use crate::core::frame::{
    Frame, FrameKind, LENGTH_OFFSET, PAYLOAD_OFFSET, SEQUENCE_OFFSET, TYPE_OFFSET, UDP_HEADER_SIZE,
};
use crate::error::{Result, TransportError};
use crate::pool::{BufferArena, PooledBuffer};

/// Appends typed fields to a frame held in a [`PooledBuffer`]
#[derive(Debug)]
pub struct FrameWriter {
    buffer: PooledBuffer,
    cursor: usize,
}

impl FrameWriter {
    /// Rent a buffer from `arena` and start a frame of `packet_type`
    pub fn new(arena: &BufferArena, packet_type: u16) -> Result<Self> {
        Self::with_buffer(arena.try_allocate()?, packet_type)
    }

    /// Start a frame of `packet_type` in an already rented buffer
    pub fn with_buffer(mut buffer: PooledBuffer, packet_type: u16) -> Result<Self> {
        if buffer.len() < UDP_HEADER_SIZE {
            return Err(TransportError::BufferOverflow {
                needed: UDP_HEADER_SIZE,
                remaining: buffer.len(),
            });
        }
        buffer[..TYPE_OFFSET].fill(0);
        buffer[TYPE_OFFSET..PAYLOAD_OFFSET].copy_from_slice(&packet_type.to_be_bytes());
        Ok(Self {
            buffer,
            cursor: PAYLOAD_OFFSET,
        })
    }

    /// Bytes of payload written so far
    pub fn payload_len(&self) -> usize {
        self.cursor - PAYLOAD_OFFSET
    }

    /// Bytes still free in the buffer
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    fn reserve(&mut self, needed: usize) -> Result<&mut [u8]> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(TransportError::BufferOverflow { needed, remaining });
        }
        let start = self.cursor;
        self.cursor += needed;
        Ok(&mut self.buffer[start..start + needed])
    }

    pub fn write_u8(&mut self, value: u8) -> Result<&mut Self> {
        self.reserve(1)?[0] = value;
        Ok(self)
    }

    pub fn write_u16(&mut self, value: u16) -> Result<&mut Self> {
        self.reserve(2)?.copy_from_slice(&value.to_be_bytes());
        Ok(self)
    }

    pub fn write_i16(&mut self, value: i16) -> Result<&mut Self> {
        self.reserve(2)?.copy_from_slice(&value.to_be_bytes());
        Ok(self)
    }

    pub fn write_i32(&mut self, value: i32) -> Result<&mut Self> {
        self.reserve(4)?.copy_from_slice(&value.to_be_bytes());
        Ok(self)
    }

    /// Little-endian, unlike the integer fields
    pub fn write_f32(&mut self, value: f32) -> Result<&mut Self> {
        self.reserve(4)?.copy_from_slice(&value.to_le_bytes());
        Ok(self)
    }

    /// Little-endian, unlike the integer fields
    pub fn write_f64(&mut self, value: f64) -> Result<&mut Self> {
        self.reserve(8)?.copy_from_slice(&value.to_le_bytes());
        Ok(self)
    }

    /// Write a `u16` length prefix followed by the UTF-8 bytes
    pub fn write_str(&mut self, value: &str) -> Result<&mut Self> {
        let len =
            u16::try_from(value.len()).map_err(|_| TransportError::StringTooLong(value.len()))?;
        let field = self.reserve(2 + value.len())?;
        field[..2].copy_from_slice(&len.to_be_bytes());
        field[2..].copy_from_slice(value.as_bytes());
        Ok(self)
    }

    /// Write raw bytes with no length prefix
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<&mut Self> {
        self.reserve(value.len())?.copy_from_slice(value);
        Ok(self)
    }

    fn patch_length(&mut self) -> Result<()> {
        let length = self.cursor - TYPE_OFFSET;
        let length = u16::try_from(length).map_err(|_| {
            TransportError::MalformedFrame(format!("frame body of {length} bytes exceeds u16"))
        })?;
        self.buffer[LENGTH_OFFSET..TYPE_OFFSET].copy_from_slice(&length.to_be_bytes());
        Ok(())
    }

    /// Finish as `[length][type][payload]`
    pub fn to_tcp_frame(mut self) -> Result<Frame> {
        self.patch_length()?;
        Ok(Frame::new(
            self.buffer,
            LENGTH_OFFSET,
            self.cursor,
            FrameKind::Tcp,
        ))
    }

    /// Finish as `[session][sequence][ack][length][type][payload]`
    ///
    /// Session, sequence and ack stay zero until stamped.
    pub fn to_udp_frame(mut self) -> Result<Frame> {
        self.patch_length()?;
        debug_assert!(self.buffer[SEQUENCE_OFFSET..LENGTH_OFFSET].iter().all(|b| *b == 0));
        Ok(Frame::new(self.buffer, 0, self.cursor, FrameKind::Udp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::{SessionId, TCP_HEADER_SIZE};

    #[test]
    fn test_tcp_frame_layout() {
        let arena = BufferArena::new(64, 1);
        let mut writer = FrameWriter::new(&arena, 0x0203).expect("writer");
        writer.write_u16(0xAABB).expect("u16").write_bytes(b"xy").expect("bytes");
        let frame = writer.to_tcp_frame().expect("frame");

        assert_eq!(frame.as_bytes(), &[0x00, 0x06, 0x02, 0x03, 0xAA, 0xBB, b'x', b'y']);
        assert_eq!(frame.length_field() as usize, frame.len() - 2);
        assert_eq!(frame.kind(), FrameKind::Tcp);
    }

    #[test]
    fn test_udp_frame_layout_and_stamp() {
        let arena = BufferArena::new(64, 1);
        let mut writer = FrameWriter::new(&arena, 9).expect("writer");
        writer.write_i32(-1).expect("i32");
        let mut frame = writer.to_udp_frame().expect("frame");
        frame
            .stamp(SessionId::new(*b"S001"), 5, 4)
            .expect("udp frames take a stamp");

        assert_eq!(
            frame.as_bytes(),
            &[b'S', b'0', b'0', b'1', 0, 5, 0, 4, 0, 6, 0, 9, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_stamp_rejects_tcp_frames() {
        let arena = BufferArena::new(64, 1);
        let mut frame = FrameWriter::new(&arena, 1)
            .and_then(FrameWriter::to_tcp_frame)
            .expect("frame");
        assert!(frame.stamp(SessionId::new(*b"AAAA"), 1, 0).is_err());
    }

    #[test]
    fn test_empty_string_is_two_zero_bytes() {
        let arena = BufferArena::new(64, 1);
        let mut writer = FrameWriter::new(&arena, 1).expect("writer");
        writer.write_str("").expect("str");
        let frame = writer.to_tcp_frame().expect("frame");
        assert_eq!(&frame.as_bytes()[TCP_HEADER_SIZE..], &[0, 0]);
    }

    #[test]
    fn test_overflow_is_an_error() {
        let arena = BufferArena::new(16, 1);
        let mut writer = FrameWriter::new(&arena, 1).expect("writer");
        writer.write_i32(1).expect("fits exactly");
        assert!(matches!(
            writer.write_u8(1),
            Err(TransportError::BufferOverflow { needed: 1, remaining: 0 })
        ));
    }

    #[test]
    fn test_buffer_returns_when_frame_dropped() {
        let arena = BufferArena::new(32, 1);
        let frame = FrameWriter::new(&arena, 1)
            .and_then(FrameWriter::to_tcp_frame)
            .expect("frame");
        assert_eq!(arena.in_use(), 1);
        assert!(FrameWriter::new(&arena, 1).is_err());
        drop(frame);
        assert_eq!(arena.in_use(), 0);
    }
}
