//! # Reliability Engine
//!
//! Ordered, acknowledged delivery on top of plain UDP datagrams.
//!
//! Per session the engine keeps:
//! - the next sequence to assign to an outbound reliable frame
//! - the set of sent frames still waiting for an ack
//! - a receive window: the next sequence owed to the application plus frames that
//!   arrived ahead of it
//!
//! Sequence 0 marks unordered traffic: it is never tracked and is delivered as soon as
//! it arrives. Reliable sequences live on the ring `1..=65535`; comparisons use the
//! forward distance on that ring with a half-ring horizon, so a sequence more than
//! half the ring behind `next_expected` counts as ahead after wrap-around.
//!
//! The engine only manages state. Sockets, timers and callbacks belong to the caller,
//! which must serialize access per session.

use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::config::UdpConfig;
use crate::core::frame::{SessionId, UNSEQUENCED};
use crate::error::{Result, TransportError};
use crate::pool::Recycle;

/// First sequence assigned on a fresh session
pub const FIRST_SEQUENCE: u16 = 1;

/// Number of distinct reliable sequences
const RING: u32 = u16::MAX as u32;

/// Furthest forward distance still treated as "ahead"
pub const HALF_RING: u16 = (RING / 2) as u16;

/// Sequence that follows `sequence`, skipping the reserved 0
#[inline]
pub fn next_sequence(sequence: u16) -> u16 {
    match sequence {
        u16::MAX => FIRST_SEQUENCE,
        s => s + 1,
    }
}

/// Forward distance from `from` to `to` on the reliable ring
#[inline]
pub fn ring_distance(from: u16, to: u16) -> u16 {
    debug_assert!(from != UNSEQUENCED && to != UNSEQUENCED);
    ((to as u32 + RING - from as u32) % RING) as u16
}

/// Tuning for one engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliabilitySettings {
    /// Age after which an unacked frame is resent
    pub resend_interval: Duration,
    /// Resends before a frame is abandoned; 0 never abandons
    pub max_resend_attempts: u32,
    /// Bound on frames parked in the receive window
    pub max_out_of_order: usize,
}

impl Default for ReliabilitySettings {
    fn default() -> Self {
        Self::from(&UdpConfig::default())
    }
}

impl From<&UdpConfig> for ReliabilitySettings {
    fn from(config: &UdpConfig) -> Self {
        Self {
            resend_interval: config.resend_interval,
            max_resend_attempts: config.max_resend_attempts,
            max_out_of_order: config.max_out_of_order.clamp(1, HALF_RING as usize),
        }
    }
}

/// A sent reliable frame waiting for its ack
#[derive(Debug, Clone)]
pub struct UnackedEntry {
    pub sequence: u16,
    pub frame: Bytes,
    pub last_sent: Instant,
    /// Times the frame has been resent
    pub resends: u32,
}

/// An inbound frame handed to the receive window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub sequence: u16,
    pub packet_type: u16,
    pub payload: Bytes,
}

/// What the receive window did with an inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Frames now owed to the application, in delivery order
    Delivered(Vec<ReceivedFrame>),
    /// Parked until the frames before it arrive
    Buffered,
    /// Already delivered; dropped
    Duplicate,
    /// Too far ahead or the window is full; dropped without an ack
    Overflow,
}

impl ReceiveOutcome {
    /// Whether the sender should receive an ack for this frame
    pub fn should_ack(&self) -> bool {
        !matches!(self, ReceiveOutcome::Overflow)
    }
}

/// Result of one resend sweep
#[derive(Debug, Default, Clone)]
pub struct SweepOutcome {
    /// Frames to put back on the wire, in sequence order
    pub resend: Vec<(u16, Bytes)>,
    /// Sequences given up on
    pub abandoned: Vec<u16>,
}

/// Next sequence owed to the application plus frames that arrived early
#[derive(Debug)]
pub struct ReceiveWindow {
    next_expected: u16,
    pending: HashMap<u16, ReceivedFrame>,
}

impl Default for ReceiveWindow {
    fn default() -> Self {
        Self {
            next_expected: FIRST_SEQUENCE,
            pending: HashMap::new(),
        }
    }
}

impl ReceiveWindow {
    pub fn next_expected(&self) -> u16 {
        self.next_expected
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn reset(&mut self) {
        self.next_expected = FIRST_SEQUENCE;
        self.pending.clear();
    }
}

/// Per-session sequencing, ack tracking and reordering state
#[derive(Debug)]
pub struct ReliabilityEngine {
    settings: ReliabilitySettings,
    next_send_sequence: u16,
    unacked: HashMap<u16, UnackedEntry>,
    window: ReceiveWindow,
}

impl ReliabilityEngine {
    pub fn new(settings: ReliabilitySettings) -> Self {
        Self {
            settings,
            next_send_sequence: FIRST_SEQUENCE,
            unacked: HashMap::new(),
            window: ReceiveWindow::default(),
        }
    }

    pub fn settings(&self) -> &ReliabilitySettings {
        &self.settings
    }

    /// Take the next outbound sequence
    ///
    /// Fails when half the ring is already in flight, since any further sequence
    /// could be mistaken for an old one by the peer.
    pub fn assign_sequence(&mut self) -> Result<u16> {
        if self.unacked.len() >= HALF_RING as usize {
            return Err(TransportError::PoolExhausted("reliable send window"));
        }
        let sequence = self.next_send_sequence;
        self.next_send_sequence = next_sequence(sequence);
        Ok(sequence)
    }

    /// Remember a sent reliable frame until it is acked
    ///
    /// Unordered frames (sequence 0) are ignored.
    pub fn track(&mut self, sequence: u16, frame: Bytes, now: Instant) {
        if sequence == UNSEQUENCED {
            return;
        }
        self.unacked.insert(
            sequence,
            UnackedEntry {
                sequence,
                frame,
                last_sent: now,
                resends: 0,
            },
        );
    }

    /// Forget an acked frame
    ///
    /// Returns whether an entry was removed; unknown sequences are a no-op.
    pub fn acknowledge(&mut self, sequence: u16) -> bool {
        self.unacked.remove(&sequence).is_some()
    }

    /// Collect frames whose last send is at least one resend interval old
    ///
    /// Their send time is refreshed. Frames past the resend limit are removed and
    /// reported as abandoned instead.
    pub fn resend_unacked(&mut self, now: Instant) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let interval = self.settings.resend_interval;
        let limit = self.settings.max_resend_attempts;

        for entry in self.unacked.values_mut() {
            if now.saturating_duration_since(entry.last_sent) < interval {
                continue;
            }
            if limit > 0 && entry.resends >= limit {
                outcome.abandoned.push(entry.sequence);
                continue;
            }
            entry.resends += 1;
            entry.last_sent = now;
            outcome.resend.push((entry.sequence, entry.frame.clone()));
        }

        for sequence in &outcome.abandoned {
            self.unacked.remove(sequence);
        }

        let base = self.next_send_sequence;
        outcome.resend.sort_by_key(|(seq, _)| ring_distance(*seq, base));
        outcome.resend.reverse();
        outcome.abandoned.sort_by_key(|seq| std::cmp::Reverse(ring_distance(*seq, base)));
        outcome
    }

    /// Run an inbound frame through the receive window
    pub fn update_received(&mut self, frame: ReceivedFrame) -> ReceiveOutcome {
        if frame.sequence == UNSEQUENCED {
            return ReceiveOutcome::Delivered(vec![frame]);
        }

        let window = &mut self.window;
        let distance = ring_distance(window.next_expected, frame.sequence);

        if distance == 0 {
            let mut delivered = vec![frame];
            window.next_expected = next_sequence(window.next_expected);
            while let Some(next) = window.pending.remove(&window.next_expected) {
                delivered.push(next);
                window.next_expected = next_sequence(window.next_expected);
            }
            return ReceiveOutcome::Delivered(delivered);
        }

        if distance > HALF_RING {
            return ReceiveOutcome::Duplicate;
        }

        let max = self.settings.max_out_of_order;
        let is_new = !window.pending.contains_key(&frame.sequence);
        if distance as usize > max || (is_new && window.pending.len() >= max) {
            return ReceiveOutcome::Overflow;
        }

        window.pending.insert(frame.sequence, frame);
        ReceiveOutcome::Buffered
    }

    /// Outstanding sequences, oldest first
    pub fn unacked_sequences(&self) -> Vec<u16> {
        let base = self.next_send_sequence;
        let mut sequences: Vec<u16> = self.unacked.keys().copied().collect();
        sequences.sort_by_key(|seq| std::cmp::Reverse(ring_distance(*seq, base)));
        sequences
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    pub fn window(&self) -> &ReceiveWindow {
        &self.window
    }

    /// Return to the state of a fresh session
    pub fn reset(&mut self) {
        self.next_send_sequence = FIRST_SEQUENCE;
        self.unacked.clear();
        self.window.reset();
    }
}

/// Pooled per-endpoint reliability state
///
/// Bound to a session id and remote endpoint while rented; recycled clean.
#[derive(Debug)]
pub struct ReliabilityContext {
    binding: Option<(SessionId, SocketAddr)>,
    engine: ReliabilityEngine,
}

impl ReliabilityContext {
    pub fn new(settings: ReliabilitySettings) -> Self {
        Self {
            binding: None,
            engine: ReliabilityEngine::new(settings),
        }
    }

    pub fn bind(&mut self, session_id: SessionId, peer: SocketAddr) {
        debug_assert!(self.binding.is_none(), "context bound twice");
        self.binding = Some((session_id, peer));
    }

    pub fn binding(&self) -> Option<(SessionId, SocketAddr)> {
        self.binding
    }

    pub fn engine(&self) -> &ReliabilityEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ReliabilityEngine {
        &mut self.engine
    }
}

impl Recycle for ReliabilityContext {
    fn recycle(&mut self) {
        self.binding = None;
        self.engine.reset();
    }
}
