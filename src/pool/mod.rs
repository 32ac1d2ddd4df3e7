//! # Resource Pools
//!
//! Fixed-capacity pools that hand out socket-adjacent resources without per-operation
//! heap churn.
//!
//! ## Components
//! - **Arena**: one pre-allocated byte region sliced into fixed-size [`PooledBuffer`]s
//! - **Resource**: a bounded pool of reusable objects built up front by a factory
//!
//! ## Ownership
//! Rented items are move-only handles. Returning one consumes it, so a double return
//! cannot be expressed. A [`PooledBuffer`] that is dropped returns itself to its arena.

pub mod arena;
pub mod resource;

pub use arena::{BufferArena, PooledBuffer};
pub use resource::{Recycle, ResourcePool};
