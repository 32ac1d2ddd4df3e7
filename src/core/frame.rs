//! Frame layout, session identity and header parsing.
//!
//! Outbound frames are built UDP-shaped inside one pooled buffer. The TCP header is the
//! tail of the UDP header, so the same bytes serve both formats:
//!
//! ```text
//! offset  0        4          6     8        10     12
//!         [session][sequence][ack] [length] [type] [payload ...]
//!                                  ^ TCP frame starts here
//! ```

use bytes::Bytes;
use std::fmt;

use crate::error::{constants, Result, TransportError};
use crate::pool::PooledBuffer;

/// Width of the length field
pub const LENGTH_SIZE: usize = 2;

/// Width of the packet type field
pub const TYPE_SIZE: usize = 2;

/// Width of the session id field
pub const SESSION_ID_SIZE: usize = 4;

/// Size of the TCP header (`length + type`)
pub const TCP_HEADER_SIZE: usize = LENGTH_SIZE + TYPE_SIZE;

/// Size of the UDP header (`session + sequence + ack + length + type`)
pub const UDP_HEADER_SIZE: usize = SESSION_ID_SIZE + 2 + 2 + TCP_HEADER_SIZE;

/// Offset of the sequence field in a UDP frame
pub const SEQUENCE_OFFSET: usize = SESSION_ID_SIZE;

/// Offset of the ack field in a UDP frame
pub const ACK_OFFSET: usize = SEQUENCE_OFFSET + 2;

/// Offset of the length field in a UDP frame, and of the TCP frame itself
pub const LENGTH_OFFSET: usize = ACK_OFFSET + 2;

/// Offset of the packet type in a UDP frame
pub const TYPE_OFFSET: usize = LENGTH_OFFSET + LENGTH_SIZE;

/// Offset of the payload in a UDP frame
pub const PAYLOAD_OFFSET: usize = UDP_HEADER_SIZE;

/// Largest possible TCP frame: a maximal length field plus the field itself
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize + LENGTH_SIZE;

/// Sequence number of unordered, fire-and-forget datagrams
pub const UNSEQUENCED: u16 = 0;

/// Packet type of ack-only datagrams; never delivered to the application
pub const ACK_PACKET_TYPE: u16 = 0xFFFF;

/// Which header a finished [`Frame`] starts with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Tcp,
    Udp,
}

/// Four-byte ASCII session identifier carried in every UDP frame
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId([u8; SESSION_ID_SIZE]);

impl SessionId {
    /// Wrap raw id bytes
    pub const fn new(bytes: [u8; SESSION_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw id bytes as they appear on the wire
    pub fn as_bytes(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.0
    }
}

impl TryFrom<&str> for SessionId {
    type Error = TransportError;

    fn try_from(value: &str) -> Result<Self> {
        let bytes: [u8; SESSION_ID_SIZE] = value.as_bytes().try_into().map_err(|_| {
            TransportError::MalformedFrame(format!(
                "session id must be {SESSION_ID_SIZE} bytes, got {}",
                value.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

/// Decoded UDP frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub session_id: SessionId,
    pub sequence: u16,
    pub ack: u16,
    pub length: u16,
    pub packet_type: u16,
}

impl UdpHeader {
    /// Whether this datagram takes part in ordering and retransmission
    pub fn is_reliable(&self) -> bool {
        self.sequence != UNSEQUENCED
    }

    /// Whether this datagram only carries an acknowledgement
    pub fn is_ack_only(&self) -> bool {
        self.packet_type == ACK_PACKET_TYPE
    }
}

/// A validated UDP datagram borrowing its payload from the receive buffer
#[derive(Debug, Clone, Copy)]
pub struct UdpDatagram<'a> {
    pub header: UdpHeader,
    pub payload: &'a [u8],
}

impl<'a> UdpDatagram<'a> {
    /// Parse a datagram, checking the length field against the datagram size
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let (header, rest) = split_udp_header(data).ok_or_else(|| {
            TransportError::MalformedFrame(constants::ERR_SHORT_UDP_HEADER.to_string())
        })?;

        let length = header.length as usize;
        if length < TYPE_SIZE {
            return Err(TransportError::MalformedFrame(
                constants::ERR_LENGTH_TOO_SMALL.to_string(),
            ));
        }
        if length - TYPE_SIZE != rest.len() {
            return Err(TransportError::MalformedFrame(format!(
                "{}: length {length}, datagram carries {}",
                constants::ERR_LENGTH_MISMATCH,
                rest.len() + TYPE_SIZE
            )));
        }

        Ok(Self {
            header,
            payload: rest,
        })
    }
}

/// Split a raw datagram into its header and everything after it
///
/// Returns `None` when the datagram is shorter than [`UDP_HEADER_SIZE`]. The length
/// field is not checked; use [`UdpDatagram::parse`] for that.
pub fn split_udp_header(data: &[u8]) -> Option<(UdpHeader, &[u8])> {
    if data.len() < UDP_HEADER_SIZE {
        return None;
    }
    let mut session = [0u8; SESSION_ID_SIZE];
    session.copy_from_slice(&data[..SESSION_ID_SIZE]);

    let header = UdpHeader {
        session_id: SessionId(session),
        sequence: read_u16_at(data, SEQUENCE_OFFSET)?,
        ack: read_u16_at(data, ACK_OFFSET)?,
        length: read_u16_at(data, LENGTH_OFFSET)?,
        packet_type: read_u16_at(data, TYPE_OFFSET)?,
    };
    Some((header, &data[PAYLOAD_OFFSET..]))
}

/// Packet type of a TCP frame, read without parsing the rest
pub fn peek_tcp_type(frame: &[u8]) -> Option<u16> {
    read_u16_at(frame, LENGTH_SIZE)
}

/// Packet type of a UDP datagram, read without parsing the rest
pub fn peek_udp_type(datagram: &[u8]) -> Option<u16> {
    read_u16_at(datagram, TYPE_OFFSET)
}

/// Packet type at the start of a body that begins with the type field
pub fn peek_packet_type(body: &[u8]) -> Option<u16> {
    read_u16_at(body, 0)
}

#[inline]
fn read_u16_at(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// A finished outbound frame and the pooled buffer that owns its bytes
///
/// Dropping the frame returns the buffer to its arena.
#[derive(Debug)]
pub struct Frame {
    buffer: PooledBuffer,
    start: usize,
    end: usize,
    kind: FrameKind,
}

impl Frame {
    pub(crate) fn new(buffer: PooledBuffer, start: usize, end: usize, kind: FrameKind) -> Self {
        debug_assert!(start <= end && end <= buffer.len());
        Self {
            buffer,
            start,
            end,
            kind,
        }
    }

    /// The encoded frame bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[self.start..self.end]
    }

    /// Encoded size in bytes
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the frame holds no bytes; never true for a finished frame
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Header format of this frame
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Packet type written into the header
    pub fn packet_type(&self) -> u16 {
        read_u16_at(&self.buffer, TYPE_OFFSET).unwrap_or_default()
    }

    /// Value of the length field
    pub fn length_field(&self) -> u16 {
        read_u16_at(&self.buffer, LENGTH_OFFSET).unwrap_or_default()
    }

    /// Back-patch session id, sequence and ack into a UDP frame
    pub fn stamp(&mut self, session_id: SessionId, sequence: u16, ack: u16) -> Result<()> {
        if self.kind != FrameKind::Udp {
            return Err(TransportError::MalformedFrame(
                constants::ERR_NOT_UDP_FRAME.to_string(),
            ));
        }
        let header = &mut self.buffer[..LENGTH_OFFSET];
        header[..SESSION_ID_SIZE].copy_from_slice(session_id.as_bytes());
        header[SEQUENCE_OFFSET..ACK_OFFSET].copy_from_slice(&sequence.to_be_bytes());
        header[ACK_OFFSET..LENGTH_OFFSET].copy_from_slice(&ack.to_be_bytes());
        Ok(())
    }

    /// Copy the encoded bytes out of the pooled buffer
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }

    /// Give up the frame view and keep only the buffer
    pub fn into_buffer(self) -> PooledBuffer {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(sequence: u16, ack: u16, length: u16, packet_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = b"AB12".to_vec();
        out.extend_from_slice(&sequence.to_be_bytes());
        out.extend_from_slice(&ack.to_be_bytes());
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(&packet_type.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_header_layout_constants() {
        assert_eq!(TCP_HEADER_SIZE, 4);
        assert_eq!(UDP_HEADER_SIZE, 12);
        assert_eq!(LENGTH_OFFSET, 8);
        assert_eq!(TYPE_OFFSET, 10);
    }

    #[test]
    fn test_parse_valid_datagram() {
        let raw = datagram(7, 3, 5, 0x0102, b"abc");
        let parsed = UdpDatagram::parse(&raw).expect("valid datagram");
        assert_eq!(parsed.header.session_id.to_string(), "AB12");
        assert_eq!(parsed.header.sequence, 7);
        assert_eq!(parsed.header.ack, 3);
        assert_eq!(parsed.header.packet_type, 0x0102);
        assert_eq!(parsed.payload, b"abc");
        assert!(parsed.header.is_reliable());
    }

    #[test]
    fn test_short_datagram_rejected() {
        let raw = datagram(1, 0, 2, 1, b"");
        assert!(split_udp_header(&raw[..UDP_HEADER_SIZE - 1]).is_none());
        assert!(matches!(
            UdpDatagram::parse(&raw[..5]),
            Err(TransportError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let too_long = datagram(1, 0, 9, 1, b"abc");
        assert!(UdpDatagram::parse(&too_long).is_err());

        let too_short = datagram(1, 0, 3, 1, b"abc");
        assert!(UdpDatagram::parse(&too_short).is_err());

        let below_type = datagram(1, 0, 1, 1, b"");
        assert!(UdpDatagram::parse(&below_type).is_err());
    }

    #[test]
    fn test_peek_types() {
        let raw = datagram(0, 0, 2, 0xBEEF, b"");
        assert_eq!(peek_udp_type(&raw), Some(0xBEEF));
        assert_eq!(peek_tcp_type(&raw[LENGTH_OFFSET..]), Some(0xBEEF));
        assert_eq!(peek_packet_type(&raw[TYPE_OFFSET..]), Some(0xBEEF));
        assert_eq!(peek_packet_type(&[0x01]), None);
    }

    #[test]
    fn test_session_id_from_str() {
        let id = SessionId::try_from("Zq9x").expect("four bytes");
        assert_eq!(id.as_bytes(), b"Zq9x");
        assert!(SessionId::try_from("toolong").is_err());
    }
}
