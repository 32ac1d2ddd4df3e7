//! # Transport Layer
//!
//! Pooled TCP connections and reliable UDP sessions.
//!
//! ## Components
//! - **Pipeline**: ordered single-writer send queue per socket
//! - **Reliability**: sequencing, acks, resends and the receive window
//! - **Session**: session id generation
//! - **TCP**: connection pool handing accepted sockets pooled parts
//! - **UDP**: shared-socket transport with per-peer reliable sessions
//!
//! Every frame handed to a transport is written exactly once and its pooled buffer
//! goes back to the arena after the write attempt, whatever its outcome.

pub mod pipeline;
pub mod reliability;
pub mod session;
pub mod tcp;
pub mod udp;

pub use pipeline::{FrameSink, Outbound, PipelineHandle, PipelineReport, SendPipeline};
pub use reliability::{ReceiveOutcome, ReceivedFrame, ReliabilityContext, ReliabilityEngine, ReliabilitySettings};
pub use session::{RandomSessionIds, SequentialSessionIds, SessionIdGenerator};
pub use tcp::{EventContext, TcpConnection, TcpConnectionPool};
pub use udp::{ReceiveHandler, UdpSession, UdpSessionPool, UdpTransport};
