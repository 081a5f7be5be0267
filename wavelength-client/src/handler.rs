use std::collections::{HashSet, VecDeque};

use uuid::Uuid;
use wavelength_core::{Envelope, MessageId, ProtocolError, decode_envelope, encode_envelope};

pub const DEFAULT_PROCESSED_CAPACITY: usize = 200;
pub const SENT_CACHE_CAPACITY: usize = 100;

/// Envelope codec plus the bounded caches of dispatched and sent message ids.
#[derive(Debug)]
pub struct MessageHandler {
    capacity: usize,
    processed: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    sent: VecDeque<(MessageId, String)>,
}

impl Default for MessageHandler {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_PROCESSED_CAPACITY)
    }
}

impl MessageHandler {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            processed: HashSet::new(),
            order: VecDeque::new(),
            sent: VecDeque::with_capacity(SENT_CACHE_CAPACITY),
        }
    }

    pub fn parse_message(&self, text: &str) -> Result<Envelope, ProtocolError> {
        decode_envelope(text)
    }

    pub fn encode_message(&self, envelope: &Envelope) -> Result<String, ProtocolError> {
        encode_envelope(envelope)
    }

    pub fn generate_message_id(&self) -> MessageId {
        Uuid::new_v4().to_string()
    }

    pub fn is_processed(&self, message_id: &str) -> bool {
        self.processed.contains(message_id)
    }

    /// Crossing the cap trims the oldest fifth in one go.
    pub fn mark_processed(&mut self, message_id: &str) {
        if !self.processed.insert(message_id.to_owned()) {
            return;
        }
        self.order.push_back(message_id.to_owned());

        if self.processed.len() > self.capacity {
            let evict = (self.capacity / 5).max(1);
            for oldest in self.order.drain(..evict.min(self.order.len())) {
                self.processed.remove(&oldest);
            }
        }
    }

    pub fn processed_len(&self) -> usize {
        self.processed.len()
    }

    pub fn remember_sent(&mut self, message_id: &str, content: &str) {
        if self.sent.len() == SENT_CACHE_CAPACITY {
            self.sent.pop_front();
        }
        self.sent
            .push_back((message_id.to_owned(), content.to_owned()));
    }

    /// True when the relay is echoing one of our recent messages back.
    pub fn sent_by_us(&self, message_id: &str) -> bool {
        self.sent.iter().any(|(id, _)| id == message_id)
    }
}
