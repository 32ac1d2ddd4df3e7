//! # Pooled Transport
//!
//! Pooled TCP and UDP transport with a length-prefixed binary wire format and a
//! reliable delivery layer on top of plain UDP.
//!
//! ## Modules
//! - [`pool`]: the buffer arena and bounded resource pools
//! - [`core`]: frame layout, writer, reader and the TCP stream codec
//! - [`transport`]: send pipelines, the reliability engine, TCP and UDP transports
//! - [`protocol`]: packet-type routing
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging, metrics, timeouts
//!
//! ## Quick start
//! ```rust,no_run
//! use pooled_transport::config::TransportConfig;
//! use pooled_transport::protocol::Dispatcher;
//! use pooled_transport::transport::UdpTransport;
//!
//! # async fn run() -> pooled_transport::error::Result<()> {
//! let config = TransportConfig::default();
//! let dispatcher = Dispatcher::builder()
//!     .register(0x0001, |origin, payload| {
//!         tracing::info!(%origin, bytes = payload.len(), "hello");
//!         Ok(())
//!     })?
//!     .build();
//!
//! let transport = UdpTransport::bind(&config, dispatcher.into_receive_handler()).await?;
//! let session = transport.open_session("127.0.0.1:7002".parse().expect("addr"))?;
//!
//! let mut writer = transport.writer(0x0001)?;
//! writer.write_str("hi")?;
//! session.send_reliable(writer.to_udp_frame()?)?;
//!
//! transport.stop(config.server.shutdown_timeout).await
//! # }
//! ```

#![cfg_attr(not(test), warn(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod core;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use config::TransportConfig;
pub use error::{Result, TransportError};
