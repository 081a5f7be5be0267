use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use bytes::Bytes;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentPayload {
    Base64(String),
    Raw(Bytes),
}

impl AttachmentPayload {
    pub fn len(&self) -> usize {
        match self {
            AttachmentPayload::Base64(text) => text.len(),
            AttachmentPayload::Raw(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Large payloads live here; envelopes and events only carry the returned id.
#[derive(Debug, Default)]
pub struct AttachmentDataStore {
    entries: Mutex<HashMap<String, AttachmentPayload>>,
}

impl AttachmentDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, AttachmentPayload>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn store(&self, payload: AttachmentPayload) -> String {
        let id = Uuid::new_v4().to_string();
        self.entries().insert(id.clone(), payload);
        id
    }

    pub fn get(&self, id: &str) -> Option<AttachmentPayload> {
        self.entries().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<AttachmentPayload> {
        self.entries().remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
