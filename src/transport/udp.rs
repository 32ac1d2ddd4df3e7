//! # UDP Transport
//!
//! Reliable sessions multiplexed over one shared UDP socket.
//!
//! ## Components
//! - **UdpSessionPool**: bounded pool of per-endpoint [`ReliabilityContext`]s
//! - **UdpSession**: one peer; serializes its engine behind a lock and owns a send
//!   pipeline targeting the peer
//! - **UdpTransport**: the socket, the session table, a receive loop and a periodic
//!   resend sweep
//!
//! ## Failure
//! When the resend sweep gives up on a reliable frame the session fails: the peer can
//! never deliver anything behind the missing sequence. A failed session refuses sends
//! with [`TransportError::SessionFailed`], ignores inbound datagrams and is retired by
//! the transport on the same sweep, returning its context to the pool.
//!
//! ## Receive path
//! Datagrams that fail to parse, name an unknown session or arrive from an endpoint
//! other than the session's peer are counted and dropped. Acks are applied first;
//! ack-only datagrams stop there. Everything else runs through the receive window and
//! reliable datagrams are acked unless the window rejected them. The receive handler
//! runs outside the session lock, on the receive loop, so deliveries for one session
//! never overlap.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{TransportConfig, UdpConfig};
use crate::core::frame::{FrameKind, SessionId, UdpDatagram, ACK_PACKET_TYPE, UNSEQUENCED};
use crate::core::{Frame, FrameWriter};
use crate::error::{constants, Result, TransportError};
use crate::pool::{BufferArena, ResourcePool};
use crate::transport::pipeline::{FrameSink, Outbound, SendPipeline, UdpSink};
use crate::transport::reliability::{
    ReceiveOutcome, ReceivedFrame, ReliabilityContext, ReliabilitySettings,
};
use crate::transport::session::{RandomSessionIds, SessionIdGenerator};
use crate::utils::metrics::Timer;
use crate::utils::timeout::{with_timeout, DEFAULT_TIMEOUT};
use crate::utils::Metrics;

/// Callback receiving `(session, packet type, payload)` in per-session order
pub type ReceiveHandler = Arc<dyn Fn(SessionId, u16, Bytes) + Send + Sync + 'static>;

/// Attempts at drawing an id that is not already in use
const ID_ATTEMPTS: usize = 32;

/// Bounded pool of reliability contexts, one per remote endpoint
#[derive(Debug, Clone)]
pub struct UdpSessionPool {
    contexts: ResourcePool<ReliabilityContext>,
}

impl UdpSessionPool {
    pub fn new(capacity: usize, settings: ReliabilitySettings) -> Self {
        Self {
            contexts: ResourcePool::with_warmup(
                constants::POOL_UDP_SESSIONS,
                capacity,
                capacity.min(64),
                move || ReliabilityContext::new(settings),
            ),
        }
    }

    /// Bind a pooled context to `peer` under `session_id`
    pub fn rent(&self, peer: SocketAddr, session_id: SessionId) -> Result<ReliabilityContext> {
        let mut context = self.contexts.try_rent()?;
        context.bind(session_id, peer);
        Ok(context)
    }

    /// Unbind a context and put it back
    pub fn release(&self, context: ReliabilityContext) {
        self.contexts.release(context);
    }

    pub fn capacity(&self) -> usize {
        self.contexts.capacity()
    }

    pub fn in_use(&self) -> usize {
        self.contexts.in_use()
    }

    /// Refuse further rents and wait for rented contexts to come back
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        self.contexts.close();
        self.contexts.drained(timeout).await
    }
}

/// One reliable session with a remote peer
pub struct UdpSession {
    id: SessionId,
    peer: SocketAddr,
    context: Mutex<Option<ReliabilityContext>>,
    pipeline: SendPipeline,
    arena: BufferArena,
    on_receive: ReceiveHandler,
    metrics: Arc<Metrics>,
    /// Sequence given up on; `UNSEQUENCED` while healthy
    failed_at: AtomicU16,
}

/// Reject frames a session could stamp but the peer could never consume
fn check_outbound(frame: &Frame) -> Result<()> {
    if frame.kind() != FrameKind::Udp {
        return Err(TransportError::MalformedFrame(
            constants::ERR_NOT_UDP_FRAME.to_string(),
        ));
    }
    if frame.packet_type() == ACK_PACKET_TYPE {
        return Err(TransportError::MalformedFrame(
            constants::ERR_RESERVED_TYPE.to_string(),
        ));
    }
    Ok(())
}

impl UdpSession {
    /// Session writing through a pipeline over `sink`
    pub fn new<S: FrameSink>(
        context: ReliabilityContext,
        sink: S,
        arena: BufferArena,
        on_receive: ReceiveHandler,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let (id, peer) = context.binding().ok_or_else(|| {
            TransportError::Custom("reliability context is not bound to an endpoint".to_string())
        })?;
        let pipeline = SendPipeline::spawn(sink, format!("udp-{id}"), Arc::clone(&metrics));
        Ok(Self {
            id,
            peer,
            context: Mutex::new(Some(context)),
            pipeline,
            arena,
            on_receive,
            metrics,
            failed_at: AtomicU16::new(UNSEQUENCED),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn context(&self) -> MutexGuard<'_, Option<ReliabilityContext>> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the session still holds its context and has not failed
    pub fn is_open(&self) -> bool {
        self.failed_sequence().is_none() && self.context().is_some()
    }

    /// Sequence whose delivery was given up on, if the session failed
    pub fn failed_sequence(&self) -> Option<u16> {
        match self.failed_at.load(Ordering::Acquire) {
            UNSEQUENCED => None,
            sequence => Some(sequence),
        }
    }

    fn ensure_healthy(&self) -> Result<()> {
        match self.failed_sequence() {
            Some(sequence) => Err(TransportError::SessionFailed {
                session: self.id.to_string(),
                sequence,
            }),
            None => Ok(()),
        }
    }

    /// Stamp, track and queue a reliable frame; returns its sequence
    ///
    /// TCP frames and the reserved ack type are refused before a sequence is taken.
    pub fn send_reliable(&self, mut frame: Frame) -> Result<u16> {
        check_outbound(&frame)?;
        let mut guard = self.context();
        let Some(context) = guard.as_mut() else {
            return Err(TransportError::UnknownSession(self.id.to_string()));
        };
        self.ensure_healthy()?;
        let engine = context.engine_mut();

        let sequence = engine.assign_sequence()?;
        frame.stamp(self.id, sequence, 0)?;
        engine.track(sequence, frame.to_bytes(), Instant::now());

        // Enqueue under the lock so the wire order matches sequence order.
        self.pipeline.enqueue(frame)?;
        trace!(session = %self.id, sequence, "Reliable frame queued");
        Ok(sequence)
    }

    /// Stamp and queue a fire-and-forget frame
    pub fn send_unordered(&self, mut frame: Frame) -> Result<()> {
        check_outbound(&frame)?;
        if self.context().is_none() {
            return Err(TransportError::UnknownSession(self.id.to_string()));
        }
        self.ensure_healthy()?;
        frame.stamp(self.id, UNSEQUENCED, 0)?;
        self.pipeline.enqueue(frame)
    }

    /// Apply an ack; unknown or repeated sequences are a no-op
    pub fn acknowledge(&self, sequence: u16) -> bool {
        let removed = self
            .context()
            .as_mut()
            .is_some_and(|c| c.engine_mut().acknowledge(sequence));
        if removed {
            self.metrics.ack_received();
        }
        removed
    }

    /// Requeue frames unacked for a resend interval; returns how many were resent
    ///
    /// A frame past its resend limit fails the session and nothing is resent.
    pub fn resend_unacked(&self, now: Instant) -> usize {
        let _timer = Timer::start("udp_resend_sweep");
        let mut guard = self.context();
        let Some(context) = guard.as_mut() else {
            return 0;
        };
        if self.failed_sequence().is_some() {
            return 0;
        }
        let sweep = context.engine_mut().resend_unacked(now);

        if let Some(&oldest) = sweep.abandoned.first() {
            self.failed_at.store(oldest, Ordering::Release);
            self.metrics.frames_abandoned(sweep.abandoned.len() as u64);
            self.metrics.session_failed();
            warn!(
                session = %self.id,
                abandoned = ?sweep.abandoned,
                "Giving up on unacknowledged frames, session failed"
            );
            return 0;
        }

        let mut resent = 0;
        for (sequence, bytes) in sweep.resend {
            match self.pipeline.enqueue(Outbound::Shared(bytes)) {
                Ok(()) => resent += 1,
                Err(e) => {
                    debug!(session = %self.id, sequence, error = %e, "Resend not queued");
                    break;
                }
            }
        }
        if resent > 0 {
            self.metrics.frames_resent(resent as u64);
            debug!(session = %self.id, resent, "Resent unacknowledged frames");
        }
        resent
    }

    /// Run an inbound frame through the receive window and deliver what it releases
    pub fn update_received(&self, frame: ReceivedFrame) -> ReceiveOutcome {
        let outcome = {
            let mut guard = self.context();
            match guard.as_mut() {
                Some(context) => context.engine_mut().update_received(frame),
                None => return ReceiveOutcome::Overflow,
            }
        };

        match &outcome {
            ReceiveOutcome::Delivered(frames) => {
                self.metrics.frames_delivered(frames.len() as u64);
                for delivered in frames {
                    (self.on_receive)(self.id, delivered.packet_type, delivered.payload.clone());
                }
            }
            ReceiveOutcome::Buffered => self.metrics.out_of_order_buffered(),
            ReceiveOutcome::Duplicate => self.metrics.duplicate_dropped(),
            ReceiveOutcome::Overflow => self.metrics.window_overflow(),
        }
        outcome
    }

    /// Handle a datagram already matched to this session
    pub fn handle_datagram(&self, datagram: &UdpDatagram<'_>) {
        if self.failed_sequence().is_some() {
            return;
        }
        let header = datagram.header;
        if header.ack != UNSEQUENCED {
            self.acknowledge(header.ack);
        }
        if header.is_ack_only() {
            return;
        }

        let outcome = self.update_received(ReceivedFrame {
            sequence: header.sequence,
            packet_type: header.packet_type,
            payload: Bytes::copy_from_slice(datagram.payload),
        });

        if header.is_reliable() {
            if outcome.should_ack() {
                self.send_ack(header.sequence);
            } else {
                debug!(session = %self.id, sequence = header.sequence, "Receive window full, not acking");
            }
        }
    }

    fn send_ack(&self, sequence: u16) {
        let frame = FrameWriter::new(&self.arena, ACK_PACKET_TYPE)
            .and_then(FrameWriter::to_udp_frame)
            .and_then(|mut frame| {
                frame.stamp(self.id, UNSEQUENCED, sequence)?;
                Ok(frame)
            });
        match frame {
            Ok(frame) => {
                if let Err(e) = self.pipeline.enqueue(frame) {
                    debug!(session = %self.id, sequence, error = %e, "Ack not queued");
                }
            }
            Err(e) => {
                if e.is_exhaustion() {
                    self.metrics.pool_exhausted();
                }
                warn!(session = %self.id, sequence, error = %e, "Dropping ack");
            }
        }
    }

    /// Sequences sent and not yet acked, oldest first
    pub fn unacked_sequences(&self) -> Vec<u16> {
        self.context()
            .as_ref()
            .map(|c| c.engine().unacked_sequences())
            .unwrap_or_default()
    }

    /// Stop the pipeline and hand back the context
    ///
    /// Later sends fail with [`TransportError::UnknownSession`].
    pub async fn shutdown(&self, timeout: Duration) -> (Result<()>, Option<ReliabilityContext>) {
        let context = self.context().take();
        let result = self.pipeline.stop(timeout).await.map(|_| ());
        (result, context)
    }
}

impl fmt::Debug for UdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .field("failed_at", &self.failed_sequence())
            .finish()
    }
}

struct UdpInner {
    socket: Arc<UdpSocket>,
    arena: BufferArena,
    pool: UdpSessionPool,
    sessions: RwLock<HashMap<SessionId, Arc<UdpSession>>>,
    ids: Arc<dyn SessionIdGenerator>,
    on_receive: ReceiveHandler,
    metrics: Arc<Metrics>,
    drain_timeout: Duration,
}

impl UdpInner {
    fn session(&self, id: &SessionId) -> Option<Arc<UdpSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn snapshot(&self) -> Vec<Arc<UdpSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn dispatch(&self, data: &[u8], from: SocketAddr) {
        self.metrics.frame_received(data.len() as u64);

        let datagram = match UdpDatagram::parse(data) {
            Ok(datagram) => datagram,
            Err(e) => {
                self.metrics.malformed_frame();
                debug!(%from, error = %e, "Dropping malformed datagram");
                return;
            }
        };

        let id = datagram.header.session_id;
        let Some(session) = self.session(&id) else {
            debug!(%from, session = %id, "Dropping datagram for unknown session");
            return;
        };
        if session.peer() != from {
            warn!(%from, session = %id, expected = %session.peer(), "Dropping datagram from foreign endpoint");
            return;
        }

        session.handle_datagram(&datagram);
    }

    /// Drain a session's pipeline and return its context to the pool
    async fn retire(&self, session: Arc<UdpSession>, timeout: Duration) -> Result<()> {
        let (result, context) = session.shutdown(timeout).await;
        if let Some(context) = context {
            self.pool.release(context);
        }
        debug!(session = %session.id(), "UDP session closed");
        result
    }

    /// Take failed sessions out of the table and retire them
    async fn retire_failed(&self) {
        let failed: Vec<_> = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<_> = sessions
                .iter()
                .filter(|(_, session)| session.failed_sequence().is_some())
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in failed {
            info!(session = %session.id(), peer = %session.peer(), "Retiring failed UDP session");
            if let Err(e) = self.retire(session, self.drain_timeout).await {
                debug!(error = %e, "Failed session did not drain");
            }
        }
    }
}

/// Reliable sessions over one shared UDP socket
pub struct UdpTransport {
    inner: Arc<UdpInner>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind `[udp].address` with an arena sized by `[arena]`
    ///
    /// Invalid `[udp]` or `[arena]` settings fail before the socket is bound.
    pub async fn bind(config: &TransportConfig, on_receive: ReceiveHandler) -> Result<Self> {
        config.udp.validate_strict()?;
        let arena = BufferArena::from_config(&config.arena)?;
        let socket = UdpSocket::bind(&config.udp.address).await?;
        let transport = Self::with_socket(
            socket,
            arena,
            &config.udp,
            Arc::new(RandomSessionIds),
            on_receive,
            Arc::new(Metrics::new()),
        )?;
        info!(address = %config.udp.address, "UDP transport bound");
        Ok(transport)
    }

    /// Run over an already bound socket
    ///
    /// Spawns the receive loop and the resend sweep; must be called inside a Tokio
    /// runtime. `config` is validated first; its address is not used.
    pub fn with_socket(
        socket: UdpSocket,
        arena: BufferArena,
        config: &UdpConfig,
        ids: Arc<dyn SessionIdGenerator>,
        on_receive: ReceiveHandler,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        config.validate_strict()?;
        let inner = Arc::new(UdpInner {
            socket: Arc::new(socket),
            arena,
            pool: UdpSessionPool::new(config.max_sessions, ReliabilitySettings::from(config)),
            sessions: RwLock::new(HashMap::new()),
            ids,
            on_receive,
            metrics,
            drain_timeout: DEFAULT_TIMEOUT,
        });
        let cancel = CancellationToken::new();

        let tasks = vec![
            tokio::spawn(receive_loop(Arc::clone(&inner), cancel.clone())),
            tokio::spawn(sweep_loop(
                Arc::clone(&inner),
                config.sweep_interval,
                cancel.clone(),
            )),
        ];

        Ok(Self {
            inner,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Open a session to `peer` under a freshly generated id
    pub fn open_session(&self, peer: SocketAddr) -> Result<Arc<UdpSession>> {
        for _ in 0..ID_ATTEMPTS {
            let id = self.inner.ids.generate();
            if self.inner.session(&id).is_none() {
                return self.adopt_session(id, peer);
            }
        }
        Err(TransportError::Custom(format!(
            "no unused session id after {ID_ATTEMPTS} attempts"
        )))
    }

    /// Open a session under an id agreed with the peer out of band
    #[instrument(skip(self), fields(session = %id))]
    pub fn adopt_session(&self, id: SessionId, peer: SocketAddr) -> Result<Arc<UdpSession>> {
        let mut sessions = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&id) {
            return Err(TransportError::Custom(format!("session {id} already open")));
        }

        let context = self.inner.pool.rent(peer, id).inspect_err(|e| {
            if e.is_exhaustion() {
                self.inner.metrics.pool_exhausted();
            }
            warn!(%peer, error = %e, "Cannot open UDP session");
        })?;

        let session = Arc::new(UdpSession::new(
            context,
            UdpSink::new(Arc::clone(&self.inner.socket), peer),
            self.inner.arena.clone(),
            Arc::clone(&self.inner.on_receive),
            Arc::clone(&self.inner.metrics),
        )?);
        sessions.insert(id, Arc::clone(&session));
        info!(%peer, "UDP session opened");
        Ok(session)
    }

    pub fn session(&self, id: &SessionId) -> Option<Arc<UdpSession>> {
        self.inner.session(id)
    }

    /// Remove a session, drain its pipeline and return its context to the pool
    #[instrument(skip(self), fields(session = %id))]
    pub async fn close_session(&self, id: &SessionId) -> Result<()> {
        let session = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .ok_or_else(|| TransportError::UnknownSession(id.to_string()))?;
        self.inner.retire(session, self.inner.drain_timeout).await
    }

    fn require(&self, id: &SessionId) -> Result<Arc<UdpSession>> {
        self.inner
            .session(id)
            .ok_or_else(|| TransportError::UnknownSession(id.to_string()))
    }

    /// Send a UDP frame with ordered, acknowledged delivery
    pub fn send_reliable(&self, id: &SessionId, frame: Frame) -> Result<u16> {
        self.require(id)?.send_reliable(frame)
    }

    /// Send a UDP frame with no ordering or retransmission
    pub fn send_unordered(&self, id: &SessionId, frame: Frame) -> Result<()> {
        self.require(id)?.send_unordered(frame)
    }

    /// Start a frame in a buffer from the transport's arena
    pub fn writer(&self, packet_type: u16) -> Result<FrameWriter> {
        FrameWriter::new(&self.inner.arena, packet_type)
    }

    pub fn arena(&self) -> &BufferArena {
        &self.inner.arena
    }

    /// Session capacity
    pub fn capacity(&self) -> usize {
        self.inner.pool.capacity()
    }

    /// Sessions currently open
    pub fn in_use(&self) -> usize {
        self.inner.pool.in_use()
    }

    /// Cancel background tasks, close every session and drain the pool
    ///
    /// The whole call shares one deadline. Sessions are retired and their contexts
    /// released even when the background tasks overrun it.
    #[instrument(skip(self))]
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let remaining = || deadline.saturating_duration_since(tokio::time::Instant::now());
        self.cancel.cancel();

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let joined = with_timeout(remaining(), futures::future::join_all(tasks)).await;
        if joined.is_err() {
            warn!("UDP background tasks did not stop in time");
        }

        let sessions: Vec<_> = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, session)| session)
            .collect();
        let budget = remaining();
        let closing = sessions
            .into_iter()
            .map(|session| self.inner.retire(session, budget));
        let failed = futures::future::join_all(closing)
            .await
            .into_iter()
            .filter(Result::is_err)
            .count();
        if failed > 0 {
            warn!(failed, "Some UDP sessions did not drain");
        }

        let drained = self.inner.pool.stop(remaining()).await;
        self.inner.metrics.log_metrics();
        info!("UDP transport stopped");
        joined?;
        drained
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn receive_loop(inner: Arc<UdpInner>, cancel: CancellationToken) {
    let mut buffer = match inner.arena.try_allocate() {
        Ok(buffer) => buffer,
        Err(e) => {
            warn!(error = %e, "No receive buffer, UDP receive loop not started");
            return;
        }
    };

    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = inner.socket.recv_from(&mut buffer) => received,
        };
        match received {
            Ok((len, from)) => inner.dispatch(&buffer[..len], from),
            // Some platforms surface ICMP errors from earlier sends here.
            Err(e) => debug!(error = %e, "UDP receive failed"),
        }
    }
    debug!("UDP receive loop stopped");
}

async fn sweep_loop(inner: Arc<UdpInner>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let now = Instant::now();
        for session in inner.snapshot() {
            session.resend_unacked(now);
        }
        inner.retire_failed().await;
    }
    debug!("UDP resend sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::PAYLOAD_OFFSET;
    use std::future::Future;
    use std::io;

    #[derive(Clone, Default)]
    struct RecordingSink {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl FrameSink for RecordingSink {
        fn send_frame<'a>(
            &'a mut self,
            frame: &'a [u8],
        ) -> impl Future<Output = io::Result<()>> + Send + 'a {
            async move {
                self.frames.lock().expect("frames").push(frame.to_vec());
                Ok(())
            }
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    type Delivered = Arc<Mutex<Vec<(u16, Bytes)>>>;

    fn session(sink: RecordingSink, arena: &BufferArena) -> (UdpSession, Delivered) {
        session_with_limit(sink, arena, 0)
    }

    fn session_with_limit(
        sink: RecordingSink,
        arena: &BufferArena,
        max_resend_attempts: u32,
    ) -> (UdpSession, Delivered) {
        let delivered: Delivered = Arc::default();
        let log = Arc::clone(&delivered);
        let handler: ReceiveHandler = Arc::new(move |_, packet_type, payload| {
            log.lock().expect("delivered").push((packet_type, payload));
        });
        let mut context = ReliabilityContext::new(ReliabilitySettings {
            resend_interval: Duration::from_millis(50),
            max_resend_attempts,
            max_out_of_order: 16,
        });
        context.bind(SessionId::new(*b"T001"), "127.0.0.1:4000".parse().expect("addr"));
        let session = UdpSession::new(context, sink, arena.clone(), handler, Arc::new(Metrics::new()))
            .expect("session");
        (session, delivered)
    }

    fn datagram(sequence: u16, ack: u16, packet_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = b"T001".to_vec();
        out.extend_from_slice(&sequence.to_be_bytes());
        out.extend_from_slice(&ack.to_be_bytes());
        out.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
        out.extend_from_slice(&packet_type.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_reliable_send_is_stamped_and_tracked() {
        let arena = BufferArena::new(64, 8);
        let sink = RecordingSink::default();
        let (session, _) = session(sink.clone(), &arena);

        let mut writer = FrameWriter::new(&arena, 7).expect("writer");
        writer.write_u8(1).expect("u8");
        let sequence = session.send_reliable(writer.to_udp_frame().expect("frame")).expect("send");
        settle().await;

        assert_eq!(sequence, 1);
        assert_eq!(session.unacked_sequences(), vec![1]);
        let frames = sink.frames.lock().expect("frames").clone();
        assert_eq!(&frames[0][..8], b"T001\x00\x01\x00\x00");
        assert_eq!(arena.in_use(), 0);
    }

    #[tokio::test]
    async fn test_reliable_datagram_is_delivered_and_acked() {
        let arena = BufferArena::new(64, 8);
        let sink = RecordingSink::default();
        let (session, delivered) = session(sink.clone(), &arena);

        let raw = datagram(1, 0, 9, b"hey");
        session.handle_datagram(&UdpDatagram::parse(&raw).expect("parse"));
        settle().await;

        assert_eq!(delivered.lock().expect("delivered")[0], (9, Bytes::from_static(b"hey")));
        let frames = sink.frames.lock().expect("frames").clone();
        assert_eq!(frames, vec![datagram(0, 1, ACK_PACKET_TYPE, b"")]);
    }

    #[tokio::test]
    async fn test_ack_only_datagram_clears_unacked() {
        let arena = BufferArena::new(64, 8);
        let (session, delivered) = session(RecordingSink::default(), &arena);
        let frame = FrameWriter::new(&arena, 2).expect("writer").to_udp_frame().expect("frame");
        session.send_reliable(frame).expect("send");

        let ack = datagram(0, 1, ACK_PACKET_TYPE, b"");
        session.handle_datagram(&UdpDatagram::parse(&ack).expect("parse"));

        assert!(session.unacked_sequences().is_empty());
        assert!(delivered.lock().expect("delivered").is_empty());
    }

    #[tokio::test]
    async fn test_resend_sweep_requeues_original_bytes() {
        let arena = BufferArena::new(64, 8);
        let sink = RecordingSink::default();
        let (session, _) = session(sink.clone(), &arena);
        let mut writer = FrameWriter::new(&arena, 3).expect("writer");
        writer.write_i32(77).expect("i32");
        session.send_reliable(writer.to_udp_frame().expect("frame")).expect("send");

        assert_eq!(session.resend_unacked(Instant::now()), 0);
        let later = Instant::now() + Duration::from_millis(60);
        assert_eq!(session.resend_unacked(later), 1);
        settle().await;

        let frames = sink.frames.lock().expect("frames").clone();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], frames[1]);
        assert_eq!(&frames[1][PAYLOAD_OFFSET..], &77i32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_sends() {
        let arena = BufferArena::new(64, 8);
        let (session, _) = session(RecordingSink::default(), &arena);
        let (result, context) = session.shutdown(Duration::from_secs(1)).await;
        assert!(result.is_ok());
        assert!(context.is_some());

        let frame = FrameWriter::new(&arena, 1).expect("writer").to_udp_frame().expect("frame");
        assert!(matches!(
            session.send_reliable(frame),
            Err(TransportError::UnknownSession(_))
        ));
        assert_eq!(arena.in_use(), 0);
    }

    fn udp_frame(arena: &BufferArena, packet_type: u16, value: i32) -> Frame {
        let mut writer = FrameWriter::new(arena, packet_type).expect("writer");
        writer.write_i32(value).expect("i32");
        writer.to_udp_frame().expect("frame")
    }

    #[tokio::test]
    async fn test_rejected_frame_does_not_consume_a_sequence() {
        let arena = BufferArena::new(64, 8);
        let sink = RecordingSink::default();
        let (sender, _) = session(sink.clone(), &arena);
        let (receiver, delivered) = session(RecordingSink::default(), &arena);

        let tcp = FrameWriter::new(&arena, 7).expect("writer").to_tcp_frame().expect("frame");
        assert!(matches!(sender.send_reliable(tcp), Err(TransportError::MalformedFrame(_))));
        assert!(sender.unacked_sequences().is_empty());

        assert_eq!(sender.send_reliable(udp_frame(&arena, 7, 5)).expect("send"), 1);
        settle().await;

        for raw in sink.frames.lock().expect("frames").iter() {
            receiver.handle_datagram(&UdpDatagram::parse(raw).expect("parse"));
        }
        let delivered = delivered.lock().expect("delivered").clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, 7);
    }

    #[tokio::test]
    async fn test_ack_packet_type_is_reserved() {
        let arena = BufferArena::new(64, 8);
        let (session, _) = session(RecordingSink::default(), &arena);

        assert!(matches!(
            session.send_reliable(udp_frame(&arena, ACK_PACKET_TYPE, 1)),
            Err(TransportError::MalformedFrame(_))
        ));
        assert!(matches!(
            session.send_unordered(udp_frame(&arena, ACK_PACKET_TYPE, 1)),
            Err(TransportError::MalformedFrame(_))
        ));
        assert_eq!(session.send_reliable(udp_frame(&arena, 9, 1)).expect("send"), 1);
        assert_eq!(session.unacked_sequences(), vec![1]);
    }

    #[tokio::test]
    async fn test_abandoned_frame_fails_the_session() {
        let arena = BufferArena::new(64, 8);
        let sink = RecordingSink::default();
        let (session, delivered) = session_with_limit(sink.clone(), &arena, 1);
        session.send_reliable(udp_frame(&arena, 4, 1)).expect("send");
        session.send_reliable(udp_frame(&arena, 4, 2)).expect("send");

        let start = Instant::now();
        assert_eq!(session.resend_unacked(start + Duration::from_millis(60)), 2);
        assert_eq!(session.resend_unacked(start + Duration::from_millis(120)), 0);

        assert_eq!(session.failed_sequence(), Some(1));
        assert!(!session.is_open());
        assert!(matches!(
            session.send_reliable(udp_frame(&arena, 4, 3)),
            Err(TransportError::SessionFailed { sequence: 1, .. })
        ));
        assert!(matches!(
            session.send_unordered(udp_frame(&arena, 4, 3)),
            Err(TransportError::SessionFailed { .. })
        ));

        // A failed session neither delivers nor acks.
        settle().await;
        let written = sink.frames.lock().expect("frames").len();
        let raw = datagram(1, 0, 9, b"late");
        session.handle_datagram(&UdpDatagram::parse(&raw).expect("parse"));
        settle().await;
        assert!(delivered.lock().expect("delivered").is_empty());
        assert_eq!(sink.frames.lock().expect("frames").len(), written);

        let snapshot = session.metrics.snapshot();
        assert_eq!(snapshot.sessions_failed, 1);
        assert_eq!(snapshot.frames_abandoned, 2);
        assert_eq!(session.resend_unacked(start + Duration::from_secs(1)), 0);
    }

    #[tokio::test]
    async fn test_session_pool_binds_and_unbinds() {
        let pool = UdpSessionPool::new(1, ReliabilitySettings::default());
        let peer: SocketAddr = "127.0.0.1:5000".parse().expect("addr");
        let context = pool.rent(peer, SessionId::new(*b"P001")).expect("rent");
        assert_eq!(context.binding(), Some((SessionId::new(*b"P001"), peer)));
        assert!(pool.rent(peer, SessionId::new(*b"P002")).is_err());

        pool.release(context);
        assert_eq!(pool.in_use(), 0);
        assert!(pool.stop(Duration::from_millis(50)).await.is_ok());
    }
}
