//! # Send Pipeline
//!
//! Serializes every outbound write for one socket.
//!
//! Producers enqueue frames onto an unbounded multi-producer queue; a single worker task
//! owns the socket's write side and drains the queue in FIFO order, one write per item.
//! The item is dropped after its write attempt whatever the outcome, which returns a
//! pooled buffer to its arena exactly once.
//!
//! ## Shutdown
//! - `close()` stops accepting work; the worker writes what is queued, then exits
//! - `stop(timeout)` closes, waits for the drain, and on timeout cancels the worker,
//!   which discards the rest of the queue
//!
//! Items enqueued after close are rejected and dropped immediately.

use bytes::Bytes;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::core::Frame;
use crate::error::{Result, TransportError};
use crate::utils::timeout::with_timeout;
use crate::utils::Metrics;

/// Write side of a socket, owned by a pipeline worker
pub trait FrameSink: Send + 'static {
    /// Write one complete frame
    fn send_frame<'a>(
        &'a mut self,
        frame: &'a [u8],
    ) -> impl Future<Output = io::Result<()>> + Send + 'a;

    /// Whether writes can still succeed
    fn is_connected(&self) -> bool;
}

/// Write half of a TCP stream
pub struct TcpSink {
    writer: OwnedWriteHalf,
    connected: Arc<AtomicBool>,
}

impl TcpSink {
    /// `connected` is shared with the read side; either side clears it on failure
    pub fn new(writer: OwnedWriteHalf, connected: Arc<AtomicBool>) -> Self {
        Self { writer, connected }
    }
}

impl FrameSink for TcpSink {
    fn send_frame<'a>(
        &'a mut self,
        frame: &'a [u8],
    ) -> impl Future<Output = io::Result<()>> + Send + 'a {
        async move {
            let result = self.writer.write_all(frame).await;
            if result.is_err() {
                self.connected.store(false, Ordering::Release);
            }
            result
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// One peer on a shared UDP socket
pub struct UdpSink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpSink {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }
}

impl FrameSink for UdpSink {
    fn send_frame<'a>(
        &'a mut self,
        frame: &'a [u8],
    ) -> impl Future<Output = io::Result<()>> + Send + 'a {
        async move {
            let sent = self.socket.send_to(frame, self.peer).await?;
            if sent != frame.len() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("datagram truncated: {sent} of {} bytes", frame.len()),
                ));
            }
            Ok(())
        }
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// An item waiting in a send queue
#[derive(Debug)]
pub enum Outbound {
    /// A frame in a pooled buffer, returned to its arena after the write
    Pooled(Frame),
    /// Shared bytes, used for retransmissions
    Shared(Bytes),
}

impl Outbound {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Outbound::Pooled(frame) => frame.as_bytes(),
            Outbound::Shared(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<Frame> for Outbound {
    fn from(frame: Frame) -> Self {
        Outbound::Pooled(frame)
    }
}

impl From<Bytes> for Outbound {
    fn from(bytes: Bytes) -> Self {
        Outbound::Shared(bytes)
    }
}

/// What a pipeline worker did before it exited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Items written to the socket
    pub written: u64,
    /// Items dropped after a failed write or on a disconnected socket
    pub dropped: u64,
    /// Items discarded unwritten because the worker was cancelled
    pub discarded: u64,
}

type SharedSender = Arc<Mutex<Option<mpsc::UnboundedSender<Outbound>>>>;

/// Cloneable producer side of a [`SendPipeline`]
#[derive(Clone)]
pub struct PipelineHandle {
    tx: SharedSender,
    metrics: Arc<Metrics>,
}

impl PipelineHandle {
    fn sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Outbound>>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an item for writing
    ///
    /// After close the item is dropped on the spot and
    /// [`TransportError::ChannelClosed`] is returned.
    pub fn enqueue(&self, item: impl Into<Outbound>) -> Result<()> {
        let item = item.into();
        let sender = self.sender();
        match sender.as_ref() {
            Some(tx) => tx.send(item).map_err(|rejected| {
                drop(rejected);
                self.metrics.send_dropped();
                TransportError::ChannelClosed
            }),
            None => {
                drop(item);
                self.metrics.send_dropped();
                Err(TransportError::ChannelClosed)
            }
        }
    }

    /// Whether the pipeline still accepts items
    pub fn is_open(&self) -> bool {
        self.sender().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn close(&self) {
        self.sender().take();
    }
}

/// Ordered single-writer queue for one socket
pub struct SendPipeline {
    handle: PipelineHandle,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<PipelineReport>>>,
    label: String,
}

impl SendPipeline {
    /// Start a worker that owns `sink`
    pub fn spawn<S: FrameSink>(sink: S, label: impl Into<String>, metrics: Arc<Metrics>) -> Self {
        let label = label.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run_worker(
            sink,
            rx,
            cancel.clone(),
            Arc::clone(&metrics),
            label.clone(),
        ));

        Self {
            handle: PipelineHandle {
                tx: Arc::new(Mutex::new(Some(tx))),
                metrics,
            },
            cancel,
            worker: Mutex::new(Some(worker)),
            label,
        }
    }

    /// Queue an item for writing; see [`PipelineHandle::enqueue`]
    pub fn enqueue(&self, item: impl Into<Outbound>) -> Result<()> {
        self.handle.enqueue(item)
    }

    /// Producer handle sharing this pipeline's queue
    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// Stop accepting items; queued items are still written
    pub fn close(&self) {
        self.handle.close();
    }

    /// Close, drain, and wait for the worker
    ///
    /// If the queue has not drained within `timeout` the worker is cancelled, remaining
    /// items are discarded with their buffers returned, and
    /// [`TransportError::Timeout`] is reported.
    #[instrument(skip(self), fields(pipeline = %self.label))]
    pub async fn stop(&self, timeout: Duration) -> Result<PipelineReport> {
        self.close();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut worker) = worker else {
            return Ok(PipelineReport::default());
        };

        match with_timeout(timeout, &mut worker).await {
            Ok(joined) => joined.map_err(|e| TransportError::Custom(format!("pipeline worker failed: {e}"))),
            Err(_) => {
                warn!("Send pipeline did not drain in time, discarding queued frames");
                self.cancel.cancel();
                if let Ok(report) = worker.await {
                    debug!(discarded = report.discarded, "Send pipeline cancelled");
                }
                Err(TransportError::Timeout)
            }
        }
    }
}

impl Drop for SendPipeline {
    fn drop(&mut self) {
        // The worker still drains whatever was queued before the drop.
        self.handle.close();
    }
}

async fn run_worker<S: FrameSink>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
    label: String,
) -> PipelineReport {
    let mut report = PipelineReport::default();

    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        if !sink.is_connected() {
            report.dropped += 1;
            metrics.send_dropped();
            warn!(pipeline = %label, bytes = item.len(), "Socket not connected, dropping frame");
            continue;
        }

        let len = item.len();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "pipeline cancelled")),
            result = sink.send_frame(item.as_bytes()) => result,
        };
        drop(item);

        match result {
            Ok(()) => {
                report.written += 1;
                metrics.frame_sent(len as u64);
                trace!(pipeline = %label, bytes = len, "Frame written");
            }
            Err(e) => {
                report.dropped += 1;
                metrics.send_dropped();
                warn!(pipeline = %label, error = %e, bytes = len, "Frame write failed");
            }
        }
    }

    rx.close();
    while let Ok(item) = rx.try_recv() {
        drop(item);
        report.discarded += 1;
        metrics.send_dropped();
    }

    debug!(
        pipeline = %label,
        written = report.written,
        dropped = report.dropped,
        discarded = report.discarded,
        "Send pipeline stopped"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FrameWriter;
    use crate::pool::BufferArena;

    #[derive(Clone, Default)]
    struct RecordingSink {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
        connected: Arc<AtomicBool>,
        delay: Option<Duration>,
    }

    impl RecordingSink {
        fn connected() -> Self {
            let sink = Self::default();
            sink.connected.store(true, Ordering::SeqCst);
            sink
        }

        fn frames(&self) -> Vec<Vec<u8>> {
            self.frames.lock().expect("frames lock").clone()
        }
    }

    impl FrameSink for RecordingSink {
        fn send_frame<'a>(
            &'a mut self,
            frame: &'a [u8],
        ) -> impl Future<Output = io::Result<()>> + Send + 'a {
            async move {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                self.frames.lock().expect("frames lock").push(frame.to_vec());
                Ok(())
            }
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    fn frame(arena: &BufferArena, marker: u8) -> Frame {
        let mut writer = FrameWriter::new(arena, 1).expect("writer");
        writer.write_u8(marker).expect("marker");
        writer.to_tcp_frame().expect("frame")
    }

    #[tokio::test]
    async fn test_writes_in_submission_order() {
        let arena = BufferArena::new(32, 64);
        let sink = RecordingSink::connected();
        let pipeline = SendPipeline::spawn(sink.clone(), "test", Arc::new(Metrics::new()));

        for marker in 0..50u8 {
            pipeline.enqueue(frame(&arena, marker)).expect("enqueue");
        }
        let report = pipeline.stop(Duration::from_secs(2)).await.expect("stop");

        assert_eq!(report.written, 50);
        let markers: Vec<u8> = sink.frames().iter().map(|f| f[4]).collect();
        assert_eq!(markers, (0..50u8).collect::<Vec<_>>());
        assert_eq!(arena.in_use(), 0);
    }

    #[tokio::test]
    async fn test_disconnected_socket_drops_and_returns_buffer() {
        let arena = BufferArena::new(32, 4);
        let sink = RecordingSink::default();
        let metrics = Arc::new(Metrics::new());
        let pipeline = SendPipeline::spawn(sink.clone(), "test", Arc::clone(&metrics));

        pipeline.enqueue(frame(&arena, 1)).expect("enqueue");
        let report = pipeline.stop(Duration::from_secs(2)).await.expect("stop");

        assert_eq!(report.dropped, 1);
        assert!(sink.frames().is_empty());
        assert_eq!(arena.in_use(), 0);
        assert_eq!(metrics.snapshot().send_drops, 1);
    }

    #[tokio::test]
    async fn test_enqueue_after_close_releases_buffer() {
        let arena = BufferArena::new(32, 2);
        let pipeline =
            SendPipeline::spawn(RecordingSink::connected(), "test", Arc::new(Metrics::new()));
        pipeline.close();

        let result = pipeline.enqueue(frame(&arena, 1));
        assert!(matches!(result, Err(TransportError::ChannelClosed)));
        assert_eq!(arena.in_use(), 0);
        assert!(!pipeline.handle().is_open());
    }

    #[tokio::test]
    async fn test_stop_timeout_discards_queue() {
        let arena = BufferArena::new(32, 16);
        let mut sink = RecordingSink::connected();
        sink.delay = Some(Duration::from_millis(200));
        let pipeline = SendPipeline::spawn(sink.clone(), "slow", Arc::new(Metrics::new()));

        for marker in 0..10u8 {
            pipeline.enqueue(frame(&arena, marker)).expect("enqueue");
        }
        let result = pipeline.stop(Duration::from_millis(50)).await;

        assert!(matches!(result, Err(TransportError::Timeout)));
        assert_eq!(arena.in_use(), 0);
        assert!(sink.frames().len() < 10);
    }

    #[tokio::test]
    async fn test_shared_items_are_written() {
        let sink = RecordingSink::connected();
        let pipeline = SendPipeline::spawn(sink.clone(), "test", Arc::new(Metrics::new()));
        pipeline
            .enqueue(Bytes::from_static(b"resend"))
            .expect("enqueue");
        pipeline.stop(Duration::from_secs(1)).await.expect("stop");
        assert_eq!(sink.frames(), vec![b"resend".to_vec()]);
    }
}
