//! # Wire Codec
//!
//! Stateless encoding and decoding of the TCP and UDP frame formats.
//!
//! ## Components
//! - **Frame**: header layout constants, session ids and header parsing helpers
//! - **Writer**: builds a frame inside a pooled buffer and back-patches its length
//! - **Reader**: cursor over a received payload with typed reads
//! - **Codec**: Tokio codec for `[length][type][payload]` byte streams
//!
//! ## Wire Format
//! ```text
//! TCP: [Length(2)] [Type(2)] [Payload(N)]
//! UDP: [SessionId(4)] [Sequence(2)] [Ack(2)] [Length(2)] [Type(2)] [Payload(N)]
//! ```
//! `Length` counts `Type + Payload`, never the whole frame. Integers are big-endian;
//! floats are little-endian IEEE-754.

pub mod codec;
pub mod frame;
pub mod reader;
pub mod writer;

pub use codec::{TcpFrame, TcpFrameCodec};
pub use frame::{Frame, FrameKind, SessionId, UdpDatagram, UdpHeader};
pub use reader::FrameReader;
pub use writer::FrameWriter;
