use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;
use wavelength_core::{Frequency, hash_password};

use crate::error::SessionError;

pub const SESSION_LIFETIME_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub client_id: String,
    pub frequency: Frequency,
    pub timestamp: DateTime<Utc>,
    pub is_active: bool,
}

impl SessionInfo {
    fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && now <= self.timestamp + Duration::seconds(SESSION_LIFETIME_SECS)
    }
}

/// Client identities, per-frequency password hashes and session tokens.
#[derive(Debug, Default)]
pub struct AuthenticationManager {
    passwords: HashMap<Frequency, String>,
    sessions: HashMap<String, SessionInfo>,
}

impl AuthenticationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate_client_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    pub fn generate_session_token(&self, client_id: &str) -> String {
        let seed = format!(
            "{}:{}:{}",
            Uuid::new_v4(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            client_id
        );
        hex::encode(Sha256::digest(seed.as_bytes()))
    }

    pub fn register_password(&mut self, frequency: &str, password: &str) {
        if password.is_empty() {
            self.passwords.remove(frequency);
            return;
        }
        self.passwords
            .insert(frequency.to_owned(), hash_password(password));
    }

    /// Frequencies without a registered password accept anything.
    pub fn verify_password(&self, frequency: &str, password: &str) -> bool {
        match self.passwords.get(frequency) {
            Some(expected) => *expected == hash_password(password),
            None => true,
        }
    }

    pub fn remove_password(&mut self, frequency: &str) {
        self.passwords.remove(frequency);
    }

    pub fn store_session(&mut self, token: &str, client_id: &str, frequency: &str) {
        self.store_session_at(token, client_id, frequency, Utc::now());
    }

    pub fn store_session_at(
        &mut self,
        token: &str,
        client_id: &str,
        frequency: &str,
        timestamp: DateTime<Utc>,
    ) {
        self.sessions.insert(
            token.to_owned(),
            SessionInfo {
                client_id: client_id.to_owned(),
                frequency: frequency.to_owned(),
                timestamp,
                is_active: true,
            },
        );
    }

    pub fn session(&self, token: &str) -> Option<&SessionInfo> {
        self.sessions.get(token)
    }

    pub fn validate_session(&self, token: &str) -> bool {
        self.validate_session_at(token, Utc::now())
    }

    pub fn validate_session_at(&self, token: &str, now: DateTime<Utc>) -> bool {
        self.sessions
            .get(token)
            .is_some_and(|session| session.is_valid_at(now))
    }

    pub fn require_session(&self, token: &str) -> Result<&SessionInfo, SessionError> {
        let now = Utc::now();
        self.sessions
            .get(token)
            .filter(|session| session.is_valid_at(now))
            .ok_or(SessionError::SessionExpired)
    }

    pub fn deactivate_session(&mut self, token: &str) {
        if let Some(session) = self.sessions.get_mut(token) {
            session.is_active = false;
        }
    }

    pub fn deactivate_client_sessions(&mut self, client_id: &str) {
        self.sessions
            .values_mut()
            .filter(|session| session.client_id == client_id)
            .for_each(|session| session.is_active = false);
    }

    pub fn deactivate_frequency_sessions(&mut self, frequency: &str) {
        self.sessions
            .values_mut()
            .filter(|session| session.frequency == frequency)
            .for_each(|session| session.is_active = false);
    }

    /// Drops inactive and expired sessions, returning how many were removed.
    pub fn cleanup_expired_sessions(&mut self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.is_valid_at(now));
        let removed = before - self.sessions.len();
        if removed > 0 {
            debug!(removed, "expired sessions cleaned up");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_expires_after_a_day() {
        let mut auth = AuthenticationManager::new();
        let now = Utc::now();

        auth.store_session_at("stale", "client", "1", now - Duration::seconds(86_401));
        auth.store_session_at("fresh", "client", "1", now - Duration::seconds(86_400));

        assert!(!auth.validate_session_at("stale", now));
        assert!(auth.validate_session_at("fresh", now));
        assert!(!auth.validate_session_at("missing", now));
    }

    #[test]
    fn deactivation_invalidates_sessions() {
        let mut auth = AuthenticationManager::new();
        auth.store_session("a", "client-1", "1");
        auth.store_session("b", "client-2", "2");
        auth.store_session("c", "client-3", "2");

        auth.deactivate_session("a");
        auth.deactivate_frequency_sessions("2");
        assert!(!auth.validate_session("a"));
        assert!(!auth.validate_session("b"));
        assert!(!auth.validate_session("c"));
        assert!(matches!(
            auth.require_session("c"),
            Err(SessionError::SessionExpired)
        ));
        assert_eq!(auth.cleanup_expired_sessions(), 3);
    }

    #[test]
    fn client_sessions_deactivate_together() {
        let mut auth = AuthenticationManager::new();
        auth.store_session("a", "client-1", "1");
        auth.store_session("b", "client-1", "2");
        auth.deactivate_client_sessions("client-1");
        assert!(!auth.validate_session("a"));
        assert!(!auth.validate_session("b"));
    }

    #[test]
    fn passwords_are_checked_per_frequency() {
        let mut auth = AuthenticationManager::new();
        assert!(auth.verify_password("1", "anything"));

        auth.register_password("1", "secret");
        assert!(auth.verify_password("1", "secret"));
        assert!(!auth.verify_password("1", "guess"));

        auth.remove_password("1");
        assert!(auth.verify_password("1", "guess"));
    }

    #[test]
    fn tokens_are_unique_hex() {
        let auth = AuthenticationManager::new();
        let first = auth.generate_session_token("client");
        let second = auth.generate_session_token("client");
        assert_eq!(first.len(), 64);
        assert_ne!(first, second);
    }
}
