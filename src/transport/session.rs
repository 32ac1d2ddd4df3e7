//! Session identity generation.

use rand::distr::Alphanumeric;
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::core::frame::{SessionId, SESSION_ID_SIZE};

/// Source of fresh session ids
///
/// Uniqueness against live sessions is checked by the caller; a generator only has to
/// produce well-formed ids.
pub trait SessionIdGenerator: Send + Sync {
    fn generate(&self) -> SessionId;
}

/// Random alphanumeric ids
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSessionIds;

impl SessionIdGenerator for RandomSessionIds {
    fn generate(&self) -> SessionId {
        let mut id = [0u8; SESSION_ID_SIZE];
        let mut rng = rand::rng();
        for (slot, byte) in id.iter_mut().zip((&mut rng).sample_iter(Alphanumeric)) {
            *slot = byte;
        }
        SessionId::new(id)
    }
}

/// Zero-padded decimal ids counting up from a start value, wrapping at 10000
#[derive(Debug, Default)]
pub struct SequentialSessionIds {
    next: AtomicU32,
}

impl SequentialSessionIds {
    pub fn starting_at(start: u32) -> Self {
        Self {
            next: AtomicU32::new(start % 10_000),
        }
    }
}

impl SessionIdGenerator for SequentialSessionIds {
    fn generate(&self) -> SessionId {
        let value = self.next.fetch_add(1, Ordering::Relaxed) % 10_000;
        let mut id = [0u8; SESSION_ID_SIZE];
        id.copy_from_slice(format!("{value:04}").as_bytes());
        SessionId::new(id)
    }
}
