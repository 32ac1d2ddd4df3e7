//! # Resource Pool
//!
//! Bounded pool of reusable objects built by a factory.
//!
//! The pool never grows past its capacity: when every instance is rented, `rent`
//! returns `None` and the caller decides whether to reject the connection or drop the
//! packet. Items are reset through [`Recycle`] as they come back, so nothing that
//! re-enters the pool still references a socket or a buffer.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::utils::timeout::DRAIN_POLL_INTERVAL;

/// Reset hook run on every item as it is returned to a pool
pub trait Recycle {
    /// Drop socket bindings and buffer references, leaving a clean instance
    fn recycle(&mut self);
}

type Factory<T> = dyn Fn() -> T + Send + Sync + 'static;

struct PoolState<T> {
    free: Vec<T>,
    created: usize,
}

struct PoolInner<T> {
    name: &'static str,
    capacity: usize,
    factory: Box<Factory<T>>,
    in_use: AtomicUsize,
    closed: AtomicBool,
    state: Mutex<PoolState<T>>,
}

impl<T> PoolInner<T> {
    fn state(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed-capacity pool of reusable `T`
///
/// Cloning yields another handle to the same pool.
pub struct ResourcePool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for ResourcePool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Recycle + Send + 'static> ResourcePool<T> {
    /// Create a pool and build all `capacity` instances up front
    pub fn new<F>(name: &'static str, capacity: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::with_warmup(name, capacity, capacity, factory)
    }

    /// Create a pool that builds `warm` instances now and the rest on demand
    pub fn with_warmup<F>(name: &'static str, capacity: usize, warm: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let warm = warm.min(capacity);
        let free: Vec<T> = (0..warm).map(|_| factory()).collect();

        debug!(pool = name, capacity, warm, "Resource pool created");

        Self {
            inner: Arc::new(PoolInner {
                name,
                capacity,
                factory: Box::new(factory),
                in_use: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                state: Mutex::new(PoolState {
                    free,
                    created: warm,
                }),
            }),
        }
    }

    /// Take an instance out of the pool
    ///
    /// Returns `None` when the pool is exhausted or closed.
    pub fn rent(&self) -> Option<T> {
        if self.is_closed() {
            return None;
        }

        let item = {
            let mut state = self.inner.state();
            match state.free.pop() {
                Some(item) => item,
                None if state.created < self.inner.capacity => {
                    state.created += 1;
                    (self.inner.factory)()
                }
                None => return None,
            }
        };

        self.inner.in_use.fetch_add(1, Ordering::AcqRel);
        Some(item)
    }

    /// Take an instance, reporting exhaustion or closure as an error
    pub fn try_rent(&self) -> Result<T> {
        if self.is_closed() {
            return Err(TransportError::PoolClosed);
        }
        self.rent()
            .ok_or(TransportError::PoolExhausted(self.inner.name))
    }

    /// Put an instance back
    ///
    /// The item is recycled first. After `close` the item is dropped instead.
    /// Releasing more items than were rented is a caller bug: debug builds trap and
    /// release builds drop the extra item.
    pub fn release(&self, mut item: T) {
        let counted = self
            .inner
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        debug_assert!(counted, "{} released an item it never rented", self.inner.name);
        if !counted {
            warn!(pool = self.inner.name, "Dropping item released without a rent");
            return;
        }

        item.recycle();
        if !self.is_closed() {
            self.inner.state().free.push(item);
        }
    }

    /// Refuse further rents and drop every idle instance
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = {
            let mut state = self.inner.state();
            let count = state.free.len();
            state.free.clear();
            count
        };
        info!(
            pool = self.inner.name,
            dropped,
            in_use = self.in_use(),
            "Resource pool closed"
        );
    }

    /// Wait until every rented instance has been released
    ///
    /// Fails with [`TransportError::ShutdownTimeout`] if instances are still out when
    /// `timeout` elapses.
    pub async fn drained(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            if self.in_use() == 0 {
                return Ok(());
            }
            tokio::select! {
                _ = &mut deadline => {
                    let outstanding = self.in_use();
                    warn!(pool = self.inner.name, outstanding, "Pool drain timed out");
                    return Err(TransportError::ShutdownTimeout { outstanding });
                }
                _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {}
            }
        }
    }
}

impl<T> ResourcePool<T> {
    /// Name used in logs and exhaustion errors
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Maximum number of instances
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Instances currently rented
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Acquire)
    }

    /// Instances that can still be rented
    pub fn available(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.capacity().saturating_sub(self.in_use())
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl<T> fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("in_use", &self.in_use())
            .field("closed", &self.is_closed())
            .finish()
    }
}
