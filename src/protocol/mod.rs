//! # Packet Routing
//!
//! Maps inbound packet types to handlers through a table built once at startup.

pub mod dispatcher;

pub use dispatcher::{Dispatcher, DispatcherBuilder, Origin};
