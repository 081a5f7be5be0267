use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    sync::{Arc, Weak},
};

use chrono::{DateTime, Utc};
use wavelength_core::Frequency;

use crate::transport::{Connection, ConnectionId};

#[derive(Clone)]
pub struct WavelengthInfo {
    pub frequency: Frequency,
    pub is_password_protected: bool,
    /// Cleared once the relay accepts the registration.
    pub password: String,
    pub host_id: String,
    /// Identity this client presents on the wavelength (equals `host_id` when hosting).
    pub client_id: String,
    pub is_host: bool,
    pub connection: Option<Weak<dyn Connection>>,
    pub connection_id: Option<ConnectionId>,
    pub is_closing: bool,
    pub created_at: DateTime<Utc>,
}

impl WavelengthInfo {
    pub fn new(frequency: impl Into<Frequency>) -> Self {
        Self {
            frequency: frequency.into(),
            is_password_protected: false,
            password: String::new(),
            host_id: String::new(),
            client_id: String::new(),
            is_host: false,
            connection: None,
            connection_id: None,
            is_closing: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_connection(mut self, connection: &Arc<dyn Connection>) -> Self {
        self.connection_id = Some(connection.id());
        self.connection = Some(Arc::downgrade(connection));
        self
    }
}

impl fmt::Debug for WavelengthInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WavelengthInfo")
            .field("frequency", &self.frequency)
            .field("is_password_protected", &self.is_password_protected)
            .field("host_id", &self.host_id)
            .field("client_id", &self.client_id)
            .field("is_host", &self.is_host)
            .field("connection_id", &self.connection_id)
            .field("is_closing", &self.is_closing)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    Added(Frequency),
    Removed(Frequency),
    Updated(Frequency),
    ActiveChanged(Option<Frequency>),
}

#[derive(Debug, Default)]
pub struct WavelengthRegistry {
    wavelengths: HashMap<Frequency, WavelengthInfo>,
    pending: HashSet<Frequency>,
    active: Option<Frequency>,
    changes: VecDeque<RegistryChange>,
}

impl WavelengthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails if the frequency is already registered. Clears its pending marker.
    pub fn add(&mut self, info: WavelengthInfo) -> bool {
        if self.wavelengths.contains_key(&info.frequency) {
            return false;
        }
        let frequency = info.frequency.clone();
        self.pending.remove(&frequency);
        self.wavelengths.insert(frequency.clone(), info);
        self.changes.push_back(RegistryChange::Added(frequency));
        true
    }

    pub fn remove(&mut self, frequency: &str) -> bool {
        if self.wavelengths.remove(frequency).is_none() {
            return false;
        }
        if self.active.as_deref() == Some(frequency) {
            self.active = None;
            self.changes.push_back(RegistryChange::ActiveChanged(None));
        }
        self.changes
            .push_back(RegistryChange::Removed(frequency.to_owned()));
        true
    }

    pub fn update(&mut self, info: WavelengthInfo) -> bool {
        match self.wavelengths.get_mut(&info.frequency) {
            Some(existing) => {
                let frequency = info.frequency.clone();
                *existing = info;
                self.changes.push_back(RegistryChange::Updated(frequency));
                true
            }
            None => false,
        }
    }

    pub fn get(&self, frequency: &str) -> Option<&WavelengthInfo> {
        self.wavelengths.get(frequency)
    }

    pub fn contains(&self, frequency: &str) -> bool {
        self.wavelengths.contains_key(frequency)
    }

    /// `None` clears the pointer. Refuses frequencies that are not registered.
    pub fn set_active(&mut self, frequency: Option<&str>) -> bool {
        if let Some(frequency) = frequency {
            if !self.wavelengths.contains_key(frequency) {
                return false;
            }
        }
        if self.active.as_deref() == frequency {
            return true;
        }
        self.active = frequency.map(str::to_owned);
        self.changes
            .push_back(RegistryChange::ActiveChanged(self.active.clone()));
        true
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Refuses frequencies that are already registered.
    pub fn add_pending(&mut self, frequency: &str) -> bool {
        if self.wavelengths.contains_key(frequency) {
            return false;
        }
        self.pending.insert(frequency.to_owned())
    }

    pub fn remove_pending(&mut self, frequency: &str) -> bool {
        self.pending.remove(frequency)
    }

    pub fn is_pending(&self, frequency: &str) -> bool {
        self.pending.contains(frequency)
    }

    pub fn mark_closing(&mut self, frequency: &str, closing: bool) -> bool {
        match self.wavelengths.get_mut(frequency) {
            Some(info) => {
                info.is_closing = closing;
                self.changes
                    .push_back(RegistryChange::Updated(frequency.to_owned()));
                true
            }
            None => false,
        }
    }

    pub fn is_closing(&self, frequency: &str) -> bool {
        self.wavelengths
            .get(frequency)
            .is_some_and(|info| info.is_closing)
    }

    pub fn connection(&self, frequency: &str) -> Option<Arc<dyn Connection>> {
        self.wavelengths
            .get(frequency)
            .and_then(|info| info.connection.as_ref())
            .and_then(Weak::upgrade)
    }

    pub fn frequencies(&self) -> Vec<Frequency> {
        let mut frequencies: Vec<_> = self.wavelengths.keys().cloned().collect();
        frequencies.sort();
        frequencies
    }

    pub fn clear_all(&mut self) {
        let removed: Vec<_> = self.wavelengths.drain().map(|(frequency, _)| frequency).collect();
        self.pending.clear();
        if self.active.take().is_some() {
            self.changes.push_back(RegistryChange::ActiveChanged(None));
        }
        self.changes
            .extend(removed.into_iter().map(RegistryChange::Removed));
    }

    pub fn drain_changes(&mut self) -> Vec<RegistryChange> {
        self.changes.drain(..).collect()
    }
}
