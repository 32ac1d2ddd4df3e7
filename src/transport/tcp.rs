//! # TCP Connection Pool
//!
//! Hands accepted sockets a ready-to-use [`TcpConnection`] built from three pooled
//! parts: a connection slot, a socket event context and a receive buffer from the
//! arena. The accept loop itself lives with the caller.
//!
//! If any part is exhausted the rent fails, the parts already taken go back and the
//! socket is closed. A connection returns its parts exactly once, either through
//! [`TcpConnectionPool::release`] or when it is dropped.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

use crate::config::TransportConfig;
use crate::core::codec::{frame_extent, TcpFrame};
use crate::core::frame::{peek_tcp_type, TCP_HEADER_SIZE};
use crate::core::{Frame, FrameWriter};
use crate::error::{constants, Result, TransportError};
use crate::pool::{BufferArena, PooledBuffer, Recycle, ResourcePool};
use crate::transport::pipeline::{SendPipeline, TcpSink};
use crate::utils::Metrics;

/// Pooled connection slot
#[derive(Debug, Default)]
pub struct ConnectionSlot {
    id: u64,
    peer: Option<SocketAddr>,
    filled: usize,
}

impl Recycle for ConnectionSlot {
    fn recycle(&mut self) {
        self.id = 0;
        self.peer = None;
        self.filled = 0;
    }
}

/// Pooled per-socket bookkeeping
#[derive(Debug, Default, Clone)]
pub struct EventContext {
    pub bytes_received: u64,
    pub frames_received: u64,
    pub last_activity: Option<Instant>,
}

impl Recycle for EventContext {
    fn recycle(&mut self) {
        *self = EventContext::default();
    }
}

struct Parts {
    slot: ConnectionSlot,
    context: EventContext,
    buffer: PooledBuffer,
}

/// A rented TCP connection
///
/// Reads are reassembled inside the pooled receive buffer; writes go through the
/// connection's own [`SendPipeline`].
pub struct TcpConnection {
    parts: Option<Parts>,
    reader: OwnedReadHalf,
    pipeline: SendPipeline,
    connected: Arc<AtomicBool>,
    owner: TcpConnectionPool,
}

impl TcpConnection {
    pub fn id(&self) -> u64 {
        self.parts.as_ref().map_or(0, |p| p.slot.id)
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.parts.as_ref().and_then(|p| p.slot.peer)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Counters for this connection
    pub fn context(&self) -> Option<&EventContext> {
        self.parts.as_ref().map(|p| &p.context)
    }

    /// Queue a finished TCP frame for writing
    pub fn send(&self, frame: Frame) -> Result<()> {
        if !self.is_connected() {
            drop(frame);
            return Err(TransportError::NotConnected);
        }
        self.pipeline.enqueue(frame)
    }

    /// Read the next complete frame
    ///
    /// Returns `Ok(None)` once the peer has closed the stream cleanly. A frame larger
    /// than the receive buffer is malformed and ends the connection.
    pub async fn next_frame(&mut self) -> Result<Option<TcpFrame>> {
        let Some(parts) = self.parts.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        let capacity = parts.buffer.len();

        loop {
            let filled = parts.slot.filled;
            match frame_extent(&parts.buffer[..filled], capacity) {
                Ok(Some(total)) => {
                    let frame = TcpFrame {
                        packet_type: peek_tcp_type(&parts.buffer[..total]).unwrap_or_default(),
                        payload: Bytes::copy_from_slice(&parts.buffer[TCP_HEADER_SIZE..total]),
                    };
                    parts.buffer.copy_within(total..filled, 0);
                    parts.slot.filled = filled - total;
                    parts.context.frames_received += 1;
                    self.owner.inner.metrics.frame_received(total as u64);
                    return Ok(Some(frame));
                }
                Ok(None) => {}
                Err(e) => {
                    self.owner.inner.metrics.malformed_frame();
                    self.connected.store(false, Ordering::Release);
                    warn!(connection = parts.slot.id, error = %e, "Malformed TCP frame, closing");
                    return Err(e);
                }
            }

            let read = match self.reader.read(&mut parts.buffer[filled..]).await {
                Ok(read) => read,
                Err(e) => {
                    self.connected.store(false, Ordering::Release);
                    return Err(e.into());
                }
            };
            if read == 0 {
                self.connected.store(false, Ordering::Release);
                if filled == 0 {
                    return Ok(None);
                }
                return Err(TransportError::MalformedFrame(format!(
                    "{}: {filled} bytes of a partial frame",
                    constants::ERR_CONNECTION_CLOSED
                )));
            }
            parts.slot.filled += read;
            parts.context.bytes_received += read as u64;
            parts.context.last_activity = Some(Instant::now());
        }
    }

    /// Drain queued writes, then return the connection to its pool
    pub async fn close(self, timeout: Duration) -> Result<()> {
        let result = self.pipeline.stop(timeout).await.map(|_| ());
        drop(self);
        result
    }

    fn give_back(&mut self) {
        if let Some(parts) = self.parts.take() {
            self.pipeline.close();
            self.connected.store(false, Ordering::Release);
            debug!(connection = parts.slot.id, "TCP connection returned");
            self.owner.restore(parts);
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.give_back();
    }
}

struct TcpPoolInner {
    slots: ResourcePool<ConnectionSlot>,
    contexts: ResourcePool<EventContext>,
    arena: BufferArena,
    next_id: AtomicU64,
    metrics: Arc<Metrics>,
}

/// Bounded pool of TCP connections
#[derive(Clone)]
pub struct TcpConnectionPool {
    inner: Arc<TcpPoolInner>,
}

impl TcpConnectionPool {
    /// Pool with `capacity` connections drawing receive buffers from `arena`
    pub fn new(capacity: usize, arena: BufferArena, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(TcpPoolInner {
                slots: ResourcePool::new(constants::POOL_TCP_CONNECTIONS, capacity, ConnectionSlot::default),
                contexts: ResourcePool::new(constants::POOL_EVENT_CONTEXTS, capacity, EventContext::default),
                arena,
                next_id: AtomicU64::new(1),
                metrics,
            }),
        }
    }

    /// Pool sized by `[tcp]` with its own arena sized by `[arena]`
    ///
    /// Invalid `[tcp]` or `[arena]` settings are rejected.
    pub fn from_config(config: &TransportConfig, metrics: Arc<Metrics>) -> Result<Self> {
        config.tcp.validate_strict()?;
        let arena = BufferArena::from_config(&config.arena)?;
        Ok(Self::new(config.tcp.max_connections, arena, metrics))
    }

    /// Bind pooled parts to an accepted socket
    ///
    /// On exhaustion the socket is closed and the error returned; nothing is leaked.
    #[instrument(skip(self, stream))]
    pub fn rent(&self, stream: TcpStream) -> Result<TcpConnection> {
        let mut parts = match self.take_parts() {
            Ok(parts) => parts,
            Err(e) => {
                if e.is_exhaustion() {
                    self.inner.metrics.pool_exhausted();
                }
                warn!(error = %e, "Rejecting TCP connection");
                drop(stream);
                return Err(e);
            }
        };

        parts.slot.id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        parts.slot.peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(connection = parts.slot.id, error = %e, "Could not disable Nagle");
        }

        let connected = Arc::new(AtomicBool::new(true));
        let (reader, writer) = stream.into_split();
        let pipeline = SendPipeline::spawn(
            TcpSink::new(writer, Arc::clone(&connected)),
            format!("tcp-{}", parts.slot.id),
            Arc::clone(&self.inner.metrics),
        );

        debug!(connection = parts.slot.id, peer = ?parts.slot.peer, "TCP connection rented");
        Ok(TcpConnection {
            parts: Some(parts),
            reader,
            pipeline,
            connected,
            owner: self.clone(),
        })
    }

    fn take_parts(&self) -> Result<Parts> {
        let slot = self.inner.slots.try_rent()?;
        let context = match self.inner.contexts.try_rent() {
            Ok(context) => context,
            Err(e) => {
                self.inner.slots.release(slot);
                return Err(e);
            }
        };
        match self.inner.arena.try_allocate() {
            Ok(buffer) => Ok(Parts {
                slot,
                context,
                buffer,
            }),
            Err(e) => {
                self.inner.slots.release(slot);
                self.inner.contexts.release(context);
                Err(e)
            }
        }
    }

    fn restore(&self, parts: Parts) {
        let Parts {
            slot,
            context,
            buffer,
        } = parts;
        self.inner.arena.free(buffer);
        self.inner.contexts.release(context);
        self.inner.slots.release(slot);
    }

    /// Return a connection's parts; queued writes still drain in the background
    pub fn release(&self, mut connection: TcpConnection) {
        connection.give_back();
    }

    /// Start a frame in a buffer from this pool's arena
    pub fn writer(&self, packet_type: u16) -> Result<FrameWriter> {
        FrameWriter::new(&self.inner.arena, packet_type)
    }

    pub fn arena(&self) -> &BufferArena {
        &self.inner.arena
    }

    /// Total connection capacity
    pub fn capacity(&self) -> usize {
        self.inner.slots.capacity()
    }

    /// Connections currently rented
    pub fn in_use(&self) -> usize {
        self.inner.slots.in_use()
    }

    /// Refuse new rents and wait for rented connections to come back
    #[instrument(skip(self))]
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        self.inner.slots.close();
        self.inner.contexts.close();
        info!(in_use = self.in_use(), "Stopping TCP connection pool");

        self.inner.slots.drained(timeout).await?;
        self.inner.contexts.drained(timeout).await
    }
}
