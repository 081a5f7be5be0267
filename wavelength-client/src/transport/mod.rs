mod memory;
mod websocket;

use std::{fmt, sync::Arc};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::{MemoryConnection, MemoryConnector, SentFrame};
pub use websocket::WebSocketConnector;

pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    Connected,
    Text(String),
    Binary(Bytes),
    Error(String),
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub connection: ConnectionId,
    pub kind: TransportEventKind,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
}

pub trait Connection: Send + Sync + fmt::Debug {
    fn id(&self) -> ConnectionId;
    fn is_valid(&self) -> bool;
    fn send_text(&self, text: String) -> Result<(), TransportError>;
    /// The whole buffer goes out as a single frame.
    fn send_binary(&self, data: Bytes) -> Result<(), TransportError>;
    fn ping(&self) -> Result<(), TransportError>;
    fn close(&self);
}

/// Every opened connection ends with exactly one `Disconnected` event.
pub trait Connector: Send + Sync {
    fn open(
        &self,
        url: &str,
        id: ConnectionId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Arc<dyn Connection>;
}
