//! # Error Types
//!
//! Error handling for the pooled transport.
//!
//! This module defines every error variant that can surface from the pools, the wire
//! codec, the send pipelines and the reliability engine.
//!
//! ## Error Categories
//! - **Resource exhaustion**: a pool or arena has no free capacity
//! - **Malformed frames**: short headers, length fields that disagree with the buffer
//! - **Socket faults**: I/O errors, disconnected sockets, closed send queues
//! - **Lifecycle**: closed pools, failed sessions, shutdown timeouts, configuration mistakes
//!
//! Duplicate acks and stale sequences are not errors; the reliability engine treats
//! them as no-ops.
//!
//! ## Example Usage
//! ```rust
//! use pooled_transport::error::{Result, TransportError};
//! use pooled_transport::pool::arena::BufferArena;
//! use tracing::warn;
//!
//! fn grab(arena: &BufferArena) -> Result<usize> {
//!     let buffer = arena
//!         .allocate()
//!         .ok_or(TransportError::PoolExhausted("buffer arena"))?;
//!     Ok(buffer.offset())
//! }
//!
//! let arena = BufferArena::new(64, 1);
//! if let Err(e) = grab(&arena).and_then(|_| grab(&arena)) {
//!     warn!(error = %e, "arena exhausted");
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to keep allocations out of hot error paths.
pub mod constants {
    /// Pool names used in exhaustion errors
    pub const POOL_BUFFER_ARENA: &str = "buffer arena";
    pub const POOL_TCP_CONNECTIONS: &str = "tcp connections";
    pub const POOL_EVENT_CONTEXTS: &str = "socket event contexts";
    pub const POOL_UDP_SESSIONS: &str = "udp sessions";

    /// Frame validation errors
    pub const ERR_SHORT_UDP_HEADER: &str = "Datagram shorter than the UDP frame header";
    pub const ERR_SHORT_TCP_HEADER: &str = "Frame shorter than the TCP frame header";
    pub const ERR_LENGTH_TOO_SMALL: &str = "Length field smaller than the packet type";
    pub const ERR_LENGTH_MISMATCH: &str = "Length field disagrees with frame bounds";
    pub const ERR_FRAME_TOO_LARGE: &str = "Frame larger than the receive buffer";
    pub const ERR_NOT_UDP_FRAME: &str = "Only UDP frames carry a reliability header";
    pub const ERR_RESERVED_TYPE: &str = "Packet type 0xFFFF is reserved for acks";

    /// Connection error
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
}

/// The primary error type for all transport operations
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Pool exhausted: {0}")]
    PoolExhausted(&'static str),

    #[error("Pool closed")]
    PoolClosed,

    #[error("Insufficient data: needed {needed} bytes, {remaining} remaining")]
    InsufficientData { needed: usize, remaining: usize },

    #[error("Buffer overflow: needed {needed} bytes, {remaining} remaining")]
    BufferOverflow { needed: usize, remaining: usize },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("String too long for u16 length prefix: {0} bytes")]
    StringTooLong(usize),

    #[error("Socket not connected")]
    NotConnected,

    #[error("Send queue closed")]
    ChannelClosed,

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Session {session} gave up on sequence {sequence}")]
    SessionFailed { session: String, sequence: u16 },

    #[error("Unexpected packet type: {0:#06x}")]
    UnexpectedMessage(u16),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Shutdown timed out with {outstanding} resources still checked out")]
    ShutdownTimeout { outstanding: usize },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl TransportError {
    /// True for errors that mean "no capacity right now" rather than a fault
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, TransportError::PoolExhausted(_))
    }
}

/// Type alias for Results using TransportError
pub type Result<T> = std::result::Result<T, TransportError>;
