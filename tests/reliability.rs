//! Integration tests for the reliability engine

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::Bytes;
use pooled_transport::transport::reliability::{
    next_sequence, ring_distance, ReceiveOutcome, ReceivedFrame, ReliabilityEngine,
    ReliabilitySettings,
};
use proptest::prelude::*;
use std::time::{Duration, Instant};

const INTERVAL: Duration = Duration::from_millis(200);

fn engine() -> ReliabilityEngine {
    ReliabilityEngine::new(ReliabilitySettings {
        resend_interval: INTERVAL,
        max_resend_attempts: 0,
        max_out_of_order: 64,
    })
}

fn frame(sequence: u16) -> ReceivedFrame {
    ReceivedFrame {
        sequence,
        packet_type: 0x0100,
        payload: Bytes::from(sequence.to_be_bytes().to_vec()),
    }
}

/// Feed frames in arrival order and collect delivered sequences
fn deliver(engine: &mut ReliabilityEngine, arrivals: &[u16]) -> Vec<u16> {
    let mut delivered = Vec::new();
    for &sequence in arrivals {
        if let ReceiveOutcome::Delivered(frames) = engine.update_received(frame(sequence)) {
            delivered.extend(frames.iter().map(|f| f.sequence));
        }
    }
    delivered
}

#[test]
fn test_ack_then_sweep_resends_remaining() {
    let mut engine = engine();
    let sent_at = Instant::now();

    let first = engine.assign_sequence().unwrap();
    let second = engine.assign_sequence().unwrap();
    assert_eq!((first, second), (1, 2));
    engine.track(first, Bytes::from_static(b"first"), sent_at);
    engine.track(second, Bytes::from_static(b"second"), sent_at);

    assert!(engine.acknowledge(1));
    assert_eq!(engine.unacked_sequences(), vec![2]);

    let sweep = engine.resend_unacked(sent_at + INTERVAL);
    assert_eq!(sweep.resend, vec![(2, Bytes::from_static(b"second"))]);
    assert!(sweep.abandoned.is_empty());
}

#[test]
fn test_sweep_before_interval_resends_nothing() {
    let mut engine = engine();
    let sent_at = Instant::now();
    engine.track(1, Bytes::from_static(b"x"), sent_at);
    assert!(engine
        .resend_unacked(sent_at + INTERVAL / 2)
        .resend
        .is_empty());
}

#[test]
fn test_unlimited_resends_never_abandon() {
    let mut engine = engine();
    let mut now = Instant::now();
    engine.track(1, Bytes::from_static(b"x"), now);
    for _ in 0..100 {
        now += INTERVAL;
        assert_eq!(engine.resend_unacked(now).resend.len(), 1);
    }
    assert_eq!(engine.unacked_len(), 1);
}

#[test]
fn test_arrival_1_3_2_delivers_in_order() {
    let mut engine = engine();
    assert_eq!(deliver(&mut engine, &[1, 3, 2]), vec![1, 2, 3]);
}

#[test]
fn test_duplicate_ack_is_noop() {
    let mut engine = engine();
    engine.track(1, Bytes::from_static(b"x"), Instant::now());
    engine.track(2, Bytes::from_static(b"y"), Instant::now());

    assert!(engine.acknowledge(1));
    let before = engine.unacked_sequences();
    assert!(!engine.acknowledge(1));
    assert!(!engine.acknowledge(999));
    assert_eq!(engine.unacked_sequences(), before);
}

#[test]
fn test_stale_and_duplicate_arrivals_dropped() {
    let mut engine = engine();
    assert_eq!(deliver(&mut engine, &[1, 2, 2, 1, 4, 4, 3]), vec![1, 2, 3, 4]);
}

#[test]
fn test_unordered_traffic_bypasses_window() {
    let mut engine = engine();
    assert_eq!(deliver(&mut engine, &[3, 0, 0, 1]), vec![0, 0, 1]);
    assert_eq!(engine.window().next_expected(), 2);
    assert_eq!(engine.window().pending_len(), 1);
}

#[test]
fn test_sequences_wrap_past_zero() {
    let mut engine = engine();
    let mut last = 0;
    for _ in 0..u16::MAX as usize + 1 {
        last = engine.assign_sequence().unwrap();
        assert_ne!(last, 0);
    }
    assert_eq!(last, 1);
}

#[test]
fn test_send_window_is_bounded() {
    let mut engine = engine();
    let now = Instant::now();
    for _ in 0..u16::MAX / 2 {
        let sequence = engine.assign_sequence().unwrap();
        engine.track(sequence, Bytes::new(), now);
    }
    assert!(engine.assign_sequence().is_err());
    engine.acknowledge(1);
    assert!(engine.assign_sequence().is_ok());
}

#[test]
fn test_receive_window_overflow_is_not_acked() {
    let mut engine = ReliabilityEngine::new(ReliabilitySettings {
        resend_interval: INTERVAL,
        max_resend_attempts: 0,
        max_out_of_order: 2,
    });
    assert_eq!(engine.update_received(frame(2)), ReceiveOutcome::Buffered);
    assert_eq!(engine.update_received(frame(3)), ReceiveOutcome::Buffered);
    let overflow = engine.update_received(frame(4));
    assert_eq!(overflow, ReceiveOutcome::Overflow);
    assert!(!overflow.should_ack());

    // The gap fills and the window drains.
    assert_eq!(deliver(&mut engine, &[1, 4]), vec![1, 2, 3, 4]);
}

#[test]
fn test_ring_helpers() {
    assert_eq!(next_sequence(1), 2);
    assert_eq!(next_sequence(u16::MAX), 1);
    assert_eq!(ring_distance(10, 10), 0);
    assert_eq!(ring_distance(65_000, 5), 540);
}

proptest! {
    #[test]
    fn prop_any_arrival_order_delivers_once_in_order(
        order in Just((1u16..=40).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let mut engine = engine();
        let delivered = deliver(&mut engine, &order);
        prop_assert_eq!(delivered, (1u16..=40).collect::<Vec<_>>());
        prop_assert_eq!(engine.window().pending_len(), 0);
    }

    #[test]
    fn prop_duplicates_never_redelivered(
        order in prop::collection::vec(1u16..=20, 0..100),
    ) {
        let mut engine = engine();
        let delivered = deliver(&mut engine, &order);
        let mut sorted = delivered.clone();
        sorted.dedup();
        prop_assert_eq!(&sorted, &delivered);
        prop_assert!(delivered.windows(2).all(|w| w[0] < w[1]));
    }
}
