//! TCP frame decoding and the Tokio stream codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::core::frame::{peek_tcp_type, LENGTH_SIZE, MAX_FRAME_SIZE, TCP_HEADER_SIZE, TYPE_SIZE};
use crate::error::{constants, Result, TransportError};

/// A decoded TCP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpFrame {
    pub packet_type: u16,
    pub payload: Bytes,
}

impl TcpFrame {
    pub fn new(packet_type: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            payload: payload.into(),
        }
    }

    /// Decode exactly one frame; the length field must account for every byte
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        match frame_extent(data, MAX_FRAME_SIZE)? {
            Some(total) if total == data.len() => Ok(Self {
                packet_type: peek_tcp_type(data).unwrap_or_default(),
                payload: Bytes::copy_from_slice(&data[TCP_HEADER_SIZE..]),
            }),
            Some(total) => Err(TransportError::MalformedFrame(format!(
                "{}: frame is {total} bytes, buffer holds {}",
                constants::ERR_LENGTH_MISMATCH,
                data.len()
            ))),
            None => Err(TransportError::MalformedFrame(
                constants::ERR_SHORT_TCP_HEADER.to_string(),
            )),
        }
    }

    /// Encode as `[length][type][payload]`
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(TCP_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&encoded_length(self.payload.len())?.to_be_bytes());
        out.extend_from_slice(&self.packet_type.to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

fn encoded_length(payload_len: usize) -> Result<u16> {
    u16::try_from(payload_len + TYPE_SIZE).map_err(|_| {
        TransportError::MalformedFrame(format!("payload of {payload_len} bytes exceeds u16"))
    })
}

/// Size of the complete frame at the front of `buf`
///
/// `Ok(None)` means more bytes are needed. Frames whose length field is smaller than
/// the type field, or whose total size exceeds `max_frame`, are malformed.
pub fn frame_extent(buf: &[u8], max_frame: usize) -> Result<Option<usize>> {
    if buf.len() < LENGTH_SIZE {
        return Ok(None);
    }
    let length = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if length < TYPE_SIZE {
        return Err(TransportError::MalformedFrame(
            constants::ERR_LENGTH_TOO_SMALL.to_string(),
        ));
    }
    let total = LENGTH_SIZE + length;
    if total > max_frame {
        return Err(TransportError::MalformedFrame(format!(
            "{}: {total} bytes, limit {max_frame}",
            constants::ERR_FRAME_TOO_LARGE
        )));
    }
    Ok((buf.len() >= total).then_some(total))
}

/// Tokio codec for streams of TCP frames
#[derive(Debug, Clone, Copy)]
pub struct TcpFrameCodec {
    max_frame: usize,
}

impl TcpFrameCodec {
    /// Codec that accepts frames up to `max_frame` bytes including the length field
    pub fn new(max_frame: usize) -> Self {
        Self {
            max_frame: max_frame.min(MAX_FRAME_SIZE),
        }
    }
}

impl Default for TcpFrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl Decoder for TcpFrameCodec {
    type Item = TcpFrame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let total = match frame_extent(src, self.max_frame) {
            Ok(Some(total)) => total,
            Ok(None) => {
                src.reserve(TCP_HEADER_SIZE);
                return Ok(None);
            }
            Err(e) => {
                warn!(error = %e, buffered = src.len(), "Rejecting malformed TCP frame");
                return Err(e);
            }
        };

        let mut frame = src.split_to(total);
        frame.advance(LENGTH_SIZE);
        let packet_type = frame.get_u16();
        Ok(Some(TcpFrame {
            packet_type,
            payload: frame.freeze(),
        }))
    }
}

impl Encoder<TcpFrame> for TcpFrameCodec {
    type Error = TransportError;

    fn encode(&mut self, item: TcpFrame, dst: &mut BytesMut) -> Result<()> {
        let length = encoded_length(item.payload.len())?;
        if LENGTH_SIZE + length as usize > self.max_frame {
            return Err(TransportError::MalformedFrame(
                constants::ERR_FRAME_TOO_LARGE.to_string(),
            ));
        }
        dst.reserve(TCP_HEADER_SIZE + item.payload.len());
        dst.put_u16(length);
        dst.put_u16(item.packet_type);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_is_type_plus_payload() {
        let frame = TcpFrame::new(0x0A0B, vec![1, 2, 3]);
        let bytes = frame.to_bytes().expect("encode");
        assert_eq!(&bytes[..2], &5u16.to_be_bytes());
        assert_eq!(TcpFrame::from_bytes(&bytes).expect("decode"), frame);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = TcpFrame::new(1, vec![9]).to_bytes().expect("encode");
        bytes.push(0xEE);
        assert!(matches!(
            TcpFrame::from_bytes(&bytes),
            Err(TransportError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_length_below_type_rejected() {
        assert!(TcpFrame::from_bytes(&[0x00, 0x01, 0x00]).is_err());
        assert!(frame_extent(&[0x00, 0x00], MAX_FRAME_SIZE).is_err());
    }

    #[test]
    fn test_decoder_waits_for_whole_frame() {
        let mut codec = TcpFrameCodec::default();
        let bytes = TcpFrame::new(2, b"hello".to_vec()).to_bytes().expect("encode");

        let mut src = BytesMut::from(&bytes[..4]);
        assert!(codec.decode(&mut src).expect("partial").is_none());

        src.extend_from_slice(&bytes[4..]);
        src.extend_from_slice(&bytes[..3]);
        let frame = codec.decode(&mut src).expect("decode").expect("complete");
        assert_eq!(frame.packet_type, 2);
        assert_eq!(&frame.payload[..], b"hello");
        assert_eq!(src.len(), 3);
    }

    #[test]
    fn test_decoder_enforces_max_frame() {
        let mut codec = TcpFrameCodec::new(8);
        let bytes = TcpFrame::new(2, vec![0u8; 16]).to_bytes().expect("encode");
        let mut src = BytesMut::from(&bytes[..]);
        assert!(codec.decode(&mut src).is_err());
    }

    #[test]
    fn test_encoder_matches_to_bytes() {
        let mut codec = TcpFrameCodec::default();
        let frame = TcpFrame::new(7, b"abc".to_vec());
        let mut dst = BytesMut::new();
        codec.encode(frame.clone(), &mut dst).expect("encode");
        assert_eq!(&dst[..], &frame.to_bytes().expect("encode")[..]);
    }
}
