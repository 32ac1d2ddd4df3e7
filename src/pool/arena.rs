//! # Buffer Arena
//!
//! A single large byte region sliced into fixed-size buffers.
//!
//! The whole region is reserved when the arena is built. `allocate` pops a returned
//! region from the free stack if there is one, otherwise carves the next region from
//! the untouched tail. Once both are empty the arena is exhausted and `allocate` returns
//! `None`; it never grows.
//!
//! ## Usage
//! ```rust
//! use pooled_transport::pool::arena::BufferArena;
//!
//! let arena = BufferArena::new(64, 2);
//! let a = arena.allocate().expect("first buffer");
//! let b = arena.allocate().expect("second buffer");
//! assert_ne!(a.offset(), b.offset());
//! assert!(arena.allocate().is_none());
//!
//! let freed = a.offset();
//! arena.free(a);
//! assert_eq!(arena.allocate().map(|c| c.offset()), Some(freed));
//! # drop(b);
//! ```

use bytes::BytesMut;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

use crate::config::ArenaConfig;
use crate::error::{Result, TransportError};

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// A region handed back to the arena, kept for reuse
struct Region {
    offset: usize,
    bytes: BytesMut,
}

struct ArenaState {
    /// Returned regions, reused before the tail is touched
    free: Vec<Region>,
    /// Untouched remainder of the arena
    tail: BytesMut,
    /// Offset of the first byte of `tail`
    cursor: usize,
}

struct ArenaInner {
    id: u64,
    buffer_size: usize,
    capacity: usize,
    in_use: AtomicUsize,
    state: Mutex<ArenaState>,
}

impl ArenaInner {
    fn state(&self) -> MutexGuard<'_, ArenaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reclaim(&self, offset: usize, bytes: BytesMut) {
        debug_assert_eq!(bytes.len(), self.buffer_size);
        self.state().free.push(Region { offset, bytes });
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        trace!(arena = self.id, offset, "Buffer returned to arena");
    }
}

/// Fixed-capacity arena of equally sized byte buffers
///
/// Cloning is cheap and yields another handle to the same arena.
#[derive(Clone)]
pub struct BufferArena {
    inner: Arc<ArenaInner>,
}

impl BufferArena {
    /// Reserve `buffer_count` buffers of `buffer_size` bytes each
    ///
    /// # Panics
    ///
    /// Panics if `buffer_size` is zero or the total size overflows. Both are startup
    /// misconfigurations; use [`BufferArena::from_config`] to get an error instead.
    pub fn new(buffer_size: usize, buffer_count: usize) -> Self {
        assert!(buffer_size > 0, "arena buffer size must be non-zero");
        let total = buffer_size
            .checked_mul(buffer_count)
            .unwrap_or_else(|| panic!("arena of {buffer_count} x {buffer_size} bytes overflows"));

        let id = NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed);
        debug!(arena = id, buffer_size, buffer_count, total, "Buffer arena reserved");

        Self {
            inner: Arc::new(ArenaInner {
                id,
                buffer_size,
                capacity: buffer_count,
                in_use: AtomicUsize::new(0),
                state: Mutex::new(ArenaState {
                    free: Vec::with_capacity(buffer_count),
                    tail: BytesMut::zeroed(total),
                    cursor: 0,
                }),
            }),
        }
    }

    /// Build an arena from validated configuration
    pub fn from_config(config: &ArenaConfig) -> Result<Self> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(TransportError::ConfigError(errors.join("; ")));
        }
        Ok(Self::new(config.buffer_size, config.buffer_count))
    }

    /// Rent one buffer, or `None` once every buffer is checked out
    pub fn allocate(&self) -> Option<PooledBuffer> {
        let inner = &self.inner;
        let region = {
            let mut state = inner.state();
            match state.free.pop() {
                Some(region) => region,
                None if state.tail.len() >= inner.buffer_size => {
                    let offset = state.cursor;
                    let bytes = state.tail.split_to(inner.buffer_size);
                    state.cursor += inner.buffer_size;
                    Region { offset, bytes }
                }
                None => return None,
            }
        };

        inner.in_use.fetch_add(1, Ordering::AcqRel);
        trace!(arena = inner.id, offset = region.offset, "Buffer allocated");

        Some(PooledBuffer {
            offset: region.offset,
            bytes: Some(region.bytes),
            owner: Arc::clone(inner),
        })
    }

    /// Rent one buffer, reporting exhaustion as an error
    pub fn try_allocate(&self) -> Result<PooledBuffer> {
        self.allocate()
            .ok_or(TransportError::PoolExhausted(crate::error::constants::POOL_BUFFER_ARENA))
    }

    /// Return a buffer to the arena
    ///
    /// Handing a buffer to an arena that does not own it is a caller bug. Debug builds
    /// trap; release builds route the buffer back to the arena it came from.
    pub fn free(&self, buffer: PooledBuffer) {
        debug_assert_eq!(
            buffer.arena_id(),
            self.inner.id,
            "buffer freed into an arena that does not own it"
        );
        drop(buffer);
    }

    /// Size in bytes of every buffer
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Total number of buffers
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Buffers currently checked out
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Acquire)
    }

    /// Buffers that can still be allocated
    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(self.in_use())
    }

    /// Identity of this arena, carried by every buffer it hands out
    pub fn id(&self) -> u64 {
        self.inner.id
    }
}

impl fmt::Debug for BufferArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferArena")
            .field("id", &self.inner.id)
            .field("buffer_size", &self.inner.buffer_size)
            .field("capacity", &self.inner.capacity)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// A fixed-size region checked out of a [`BufferArena`]
///
/// The handle is move-only. Dropping it, or passing it to [`BufferArena::free`],
/// returns the region exactly once.
pub struct PooledBuffer {
    offset: usize,
    bytes: Option<BytesMut>,
    owner: Arc<ArenaInner>,
}

impl PooledBuffer {
    /// Offset of this region inside its arena
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Identity of the owning arena
    pub fn arena_id(&self) -> u64 {
        self.owner.id
    }

    /// Fixed length of the region
    pub fn len(&self) -> usize {
        self.owner.buffer_size
    }

    /// Always false; arenas never hand out empty regions
    pub fn is_empty(&self) -> bool {
        self.owner.buffer_size == 0
    }

    /// Borrow the whole region
    pub fn as_slice(&self) -> &[u8] {
        self.bytes.as_deref().unwrap_or(&[])
    }

    /// Mutably borrow the whole region
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.bytes.as_deref_mut().unwrap_or(&mut [])
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(bytes) = self.bytes.take() {
            self.owner.reclaim(self.offset, bytes);
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("arena", &self.owner.id)
            .field("offset", &self.offset)
            .field("len", &self.len())
            .finish()
    }
}
