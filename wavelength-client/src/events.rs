use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::warn;
use wavelength_core::{Frequency, MessageId, Timestamp};

use crate::registry::RegistryChange;

const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    PasswordRequired,
    InvalidPassword,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub kind: String,
    pub mime_type: Option<String>,
    pub name: Option<String>,
    /// Store id when the payload arrived inline, otherwise whatever reference the relay sent.
    pub reference_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEvent {
    pub message_id: Option<MessageId>,
    pub sender_id: Option<String>,
    pub sender_label: String,
    pub content: String,
    pub timestamp: Option<Timestamp>,
    pub is_self: bool,
    pub attachment: Option<AttachmentRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileProgressStage {
    Preparing,
    Processing(u8),
    Encoding,
    Sending,
    Sent,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    WavelengthCreated { frequency: Frequency },
    WavelengthJoined { frequency: Frequency },
    WavelengthLeft { frequency: Frequency },
    WavelengthClosed { frequency: Frequency },
    ConnectionError { frequency: Frequency, error: String },
    AuthenticationFailed { frequency: Frequency, reason: AuthFailure },
    UserKicked { frequency: Frequency, reason: Option<String> },
    MessageReceived { frequency: Frequency, message: ChatEvent },
    MessageSent { frequency: Frequency, message_id: MessageId },
    PresenceChanged { frequency: Frequency, user_id: Option<String>, joined: bool },
    SystemNotice { frequency: Frequency, message: String },
    FileProgress { progress_id: String, stage: FileProgressStage },
    PttGranted { frequency: Frequency },
    PttDenied { frequency: Frequency, reason: String },
    PttStartReceiving { frequency: Frequency, sender: String },
    PttStopReceiving { frequency: Frequency },
    LocalAmplitude { frequency: Frequency, amplitude: f32 },
    RemoteAmplitude { frequency: Frequency, amplitude: f32 },
    AudioReceived { frequency: Frequency, data: Bytes },
    Registry(RegistryChange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Lifecycle,
    Failure,
    Chat,
    Presence,
    FileProgress,
    Ptt,
    Audio,
    Registry,
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::WavelengthCreated { .. }
            | SessionEvent::WavelengthJoined { .. }
            | SessionEvent::WavelengthLeft { .. }
            | SessionEvent::WavelengthClosed { .. } => EventKind::Lifecycle,
            SessionEvent::ConnectionError { .. }
            | SessionEvent::AuthenticationFailed { .. }
            | SessionEvent::UserKicked { .. }
            | SessionEvent::SystemNotice { .. } => EventKind::Failure,
            SessionEvent::MessageReceived { .. } | SessionEvent::MessageSent { .. } => {
                EventKind::Chat
            }
            SessionEvent::PresenceChanged { .. } => EventKind::Presence,
            SessionEvent::FileProgress { .. } => EventKind::FileProgress,
            SessionEvent::PttGranted { .. }
            | SessionEvent::PttDenied { .. }
            | SessionEvent::PttStartReceiving { .. }
            | SessionEvent::PttStopReceiving { .. } => EventKind::Ptt,
            SessionEvent::LocalAmplitude { .. }
            | SessionEvent::RemoteAmplitude { .. }
            | SessionEvent::AudioReceived { .. } => EventKind::Audio,
            SessionEvent::Registry(_) => EventKind::Registry,
        }
    }
}

/// Fan-out of [`SessionEvent`]s. Cloning shares the same underlying channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            kinds: Vec::new(),
        }
    }

    pub fn subscribe_kinds(&self, kinds: &[EventKind]) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            kinds: kinds.to_vec(),
        }
    }
}

pub struct EventSubscription {
    rx: broadcast::Receiver<SessionEvent>,
    kinds: Vec<EventKind>,
}

impl EventSubscription {
    fn wants(&self, event: &SessionEvent) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&event.kind())
    }

    /// Next matching event, or `None` once the bus is gone. Lagged events are skipped.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }

    pub fn drain(&mut self) -> Vec<SessionEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
