use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{trace, warn};

use crate::core::frame::{peek_packet_type, SessionId, TYPE_SIZE};
use crate::core::TcpFrame;
use crate::error::{constants, Result, TransportError};
use crate::transport::udp::ReceiveHandler;

/// Where an inbound frame came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Udp(SessionId),
    Tcp(u64),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Udp(id) => write!(f, "udp:{id}"),
            Origin::Tcp(id) => write!(f, "tcp:{id}"),
        }
    }
}

type HandlerFn = dyn Fn(Origin, Bytes) -> Result<()> + Send + Sync + 'static;

/// Collects handlers before the routing table is frozen
#[derive(Default)]
pub struct DispatcherBuilder {
    handlers: HashMap<u16, Box<HandlerFn>>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `packet_type` to `handler`; registering a type twice is an error
    pub fn register<F>(mut self, packet_type: u16, handler: F) -> Result<Self>
    where
        F: Fn(Origin, Bytes) -> Result<()> + Send + Sync + 'static,
    {
        if self.handlers.contains_key(&packet_type) {
            return Err(TransportError::ConfigError(format!(
                "handler for packet type {packet_type:#06x} registered twice"
            )));
        }
        self.handlers.insert(packet_type, Box::new(handler));
        Ok(self)
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            handlers: Arc::new(self.handlers),
        }
    }
}

/// Immutable packet-type routing table
///
/// Cloning shares the table.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<HashMap<u16, Box<HandlerFn>>>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    pub fn handles(&self, packet_type: u16) -> bool {
        self.handlers.contains_key(&packet_type)
    }

    /// Run the handler registered for `packet_type`
    pub fn dispatch(&self, origin: Origin, packet_type: u16, payload: Bytes) -> Result<()> {
        trace!(%origin, packet_type, bytes = payload.len(), "Dispatching");
        self.handlers
            .get(&packet_type)
            .ok_or(TransportError::UnexpectedMessage(packet_type))
            .and_then(|handler| handler(origin, payload))
    }

    /// Route a body that starts with its packet type
    pub fn dispatch_raw(&self, origin: Origin, body: &[u8]) -> Result<()> {
        let packet_type = peek_packet_type(body).ok_or_else(|| {
            TransportError::MalformedFrame(constants::ERR_SHORT_TCP_HEADER.to_string())
        })?;
        self.dispatch(origin, packet_type, Bytes::copy_from_slice(&body[TYPE_SIZE..]))
    }

    /// Route a frame read from a TCP connection
    pub fn dispatch_tcp(&self, connection: u64, frame: TcpFrame) -> Result<()> {
        self.dispatch(Origin::Tcp(connection), frame.packet_type, frame.payload)
    }

    /// Receive handler for a UDP transport
    ///
    /// Handler errors are logged and never reach the transport.
    pub fn into_receive_handler(self) -> ReceiveHandler {
        Arc::new(move |session, packet_type, payload| {
            if let Err(e) = self.dispatch(Origin::Udp(session), packet_type, payload) {
                warn!(session = %session, packet_type, error = %e, "Packet handler failed");
            }
        })
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        f.debug_struct("Dispatcher").field("packet_types", &types).finish()
    }
}
