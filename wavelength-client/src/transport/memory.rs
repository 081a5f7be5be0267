use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use tokio::sync::mpsc;
use wavelength_core::{Envelope, decode_envelope};

use super::{
    Connection, ConnectionId, Connector, TransportError, TransportEvent, TransportEventKind,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentFrame {
    Text(String),
    Binary(Bytes),
    Ping,
}

/// In-process stand-in for a relay connection. Records outbound frames and
/// lets the owner inject inbound transport events.
#[derive(Debug)]
pub struct MemoryConnection {
    id: ConnectionId,
    url: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    sent: Mutex<Vec<SentFrame>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl MemoryConnection {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn emit(&self, kind: TransportEventKind) {
        match kind {
            TransportEventKind::Connected => self.connected.store(true, Ordering::Release),
            TransportEventKind::Disconnected => self.connected.store(false, Ordering::Release),
            _ => {}
        }
        let _ = self.events.send(TransportEvent {
            connection: self.id,
            kind,
        });
    }

    pub fn emit_connected(&self) {
        self.emit(TransportEventKind::Connected);
    }

    pub fn emit_text(&self, text: impl Into<String>) {
        self.emit(TransportEventKind::Text(text.into()));
    }

    pub fn emit_binary(&self, data: impl Into<Bytes>) {
        self.emit(TransportEventKind::Binary(data.into()));
    }

    pub fn emit_disconnected(&self) {
        self.emit(TransportEventKind::Disconnected);
    }

    pub fn sent(&self) -> Vec<SentFrame> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Outbound text frames that decode as envelopes.
    pub fn sent_envelopes(&self) -> Vec<Envelope> {
        self.sent()
            .into_iter()
            .filter_map(|frame| match frame {
                SentFrame::Text(text) => decode_envelope(&text).ok(),
                _ => None,
            })
            .collect()
    }

    fn record(&self, frame: SentFrame) -> Result<(), TransportError> {
        if !self.is_valid() {
            return Err(TransportError::Closed(self.id));
        }
        match self.sent.lock() {
            Ok(mut sent) => sent.push(frame),
            Err(poisoned) => poisoned.into_inner().push(frame),
        }
        Ok(())
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_valid(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.is_closed()
    }

    fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.record(SentFrame::Text(text))
    }

    fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        self.record(SentFrame::Binary(data))
    }

    fn ping(&self) -> Result<(), TransportError> {
        self.record(SentFrame::Ping)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[derive(Debug, Default)]
pub struct MemoryConnector {
    opened: Mutex<Vec<Arc<MemoryConnection>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connections(&self) -> Vec<Arc<MemoryConnection>> {
        match self.opened.lock() {
            Ok(opened) => opened.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn last(&self) -> Option<Arc<MemoryConnection>> {
        self.connections().pop()
    }
}

impl Connector for MemoryConnector {
    fn open(
        &self,
        url: &str,
        id: ConnectionId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Arc<dyn Connection> {
        let connection = Arc::new(MemoryConnection {
            id,
            url: url.to_owned(),
            events,
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        match self.opened.lock() {
            Ok(mut opened) => opened.push(Arc::clone(&connection)),
            Err(poisoned) => poisoned.into_inner().push(Arc::clone(&connection)),
        }
        connection
    }
}
