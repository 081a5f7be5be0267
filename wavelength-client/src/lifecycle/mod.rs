mod creator;
mod joiner;
mod leaver;

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{runtime::Handle, sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use wavelength_core::{Envelope, Frequency};

use crate::{
    context::SessionContext,
    error::SessionError,
    events::SessionEvent,
    registry::WavelengthInfo,
    transport::{Connection, ConnectionId, Connector, TransportEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Disconnected,
    Connecting,
    AwaitingResult,
    Active,
    Closing,
}

#[derive(Debug)]
enum Role {
    Host { password: String },
    Guest { password: Option<String> },
}

/// Pings the connection until it goes away. Aborted on drop.
#[derive(Debug)]
struct KeepAlive(JoinHandle<()>);

impl KeepAlive {
    fn start(connection: &Arc<dyn Connection>, every: Duration) -> Option<Self> {
        if every.is_zero() {
            return None;
        }
        let runtime = Handle::try_current().ok()?;
        let connection = Arc::downgrade(connection);

        Some(Self(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(connection) = connection.upgrade() else {
                    break;
                };
                if !connection.is_valid() || connection.ping().is_err() {
                    break;
                }
            }
        })))
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug)]
struct Attempt {
    frequency: Frequency,
    role: Role,
    client_id: String,
    connection: Arc<dyn Connection>,
    phase: LifecycleState,
    connected_handled: bool,
    error_reported: bool,
    keep_alive: Option<KeepAlive>,
    session_token: Option<String>,
}

pub struct Lifecycle {
    connector: Arc<dyn Connector>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    attempts: HashMap<ConnectionId, Attempt>,
    next_connection: ConnectionId,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("attempts", &self.attempts.len())
            .field("next_connection", &self.next_connection)
            .finish_non_exhaustive()
    }
}

fn normalize_frequency(frequency: &str) -> Result<Frequency, SessionError> {
    let frequency = frequency.trim();
    if frequency.is_empty() {
        return Err(SessionError::InvalidFrequency);
    }
    Ok(frequency.to_owned())
}

impl Lifecycle {
    pub fn new(
        connector: Arc<dyn Connector>,
        transport_tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            connector,
            transport_tx,
            attempts: HashMap::new(),
            next_connection: 1,
        }
    }

    pub fn state(&self, frequency: &str) -> LifecycleState {
        self.attempt_for(frequency)
            .and_then(|id| self.attempts.get(&id))
            .map(|attempt| attempt.phase)
            .unwrap_or(LifecycleState::Disconnected)
    }

    pub fn route(&self, id: ConnectionId) -> Option<(Frequency, LifecycleState)> {
        self.attempts
            .get(&id)
            .map(|attempt| (attempt.frequency.clone(), attempt.phase))
    }

    pub fn session_token(&self, frequency: &str) -> Option<&str> {
        self.attempt_for(frequency)
            .and_then(|id| self.attempts.get(&id))
            .and_then(|attempt| attempt.session_token.as_deref())
    }

    pub fn frequencies(&self) -> Vec<Frequency> {
        self.attempts
            .values()
            .map(|attempt| attempt.frequency.clone())
            .collect()
    }

    fn attempt_for(&self, frequency: &str) -> Option<ConnectionId> {
        self.attempts
            .iter()
            .find(|(_, attempt)| attempt.frequency == frequency)
            .map(|(id, _)| *id)
    }

    fn open(&mut self, ctx: &SessionContext, frequency: Frequency, role: Role, client_id: String) {
        let id = self.next_connection;
        self.next_connection += 1;

        let url = ctx.config.relay_url();
        debug!(connection = id, frequency = %frequency, url = %url, "opening transport");
        let connection = self.connector.open(&url, id, self.transport_tx.clone());
        self.attempts.insert(
            id,
            Attempt {
                frequency,
                role,
                client_id,
                connection,
                phase: LifecycleState::Connecting,
                connected_handled: false,
                error_reported: false,
                keep_alive: None,
                session_token: None,
            },
        );
    }

    /// Acts on the first connect signal only.
    pub fn on_connected(&mut self, ctx: &mut SessionContext, id: ConnectionId) {
        let Some(attempt) = self.attempts.get_mut(&id) else {
            return;
        };
        if attempt.connected_handled {
            debug!(connection = id, "duplicate connect signal ignored");
            return;
        }
        attempt.connected_handled = true;
        attempt.phase = LifecycleState::AwaitingResult;

        let mut info = WavelengthInfo::new(attempt.frequency.clone()).with_connection(&attempt.connection);
        info.client_id = attempt.client_id.clone();
        let request = match &attempt.role {
            Role::Host { password } => {
                info.is_host = true;
                info.host_id = attempt.client_id.clone();
                info.is_password_protected = !password.is_empty();
                info.password = password.clone();
                creator::register_request(attempt, password)
            }
            Role::Guest { password } => {
                info.is_password_protected = password.is_some();
                joiner::join_request(attempt, password.as_deref())
            }
        };

        let frequency = attempt.frequency.clone();
        if !ctx.registry.add(info) {
            warn!(frequency = %frequency, "wavelength registered twice");
            ctx.events.publish(SessionEvent::ConnectionError {
                frequency,
                error: "wavelength is already registered".to_owned(),
            });
            self.abort(ctx, id);
            return;
        }

        info!(connection = id, frequency = %frequency, "transport connected, sending handshake");
        let sent = ctx.send_envelope(attempt.connection.as_ref(), &request);
        if let Err(err) = sent {
            warn!(frequency = %frequency, "handshake send failed: {err}");
            ctx.events.publish(SessionEvent::ConnectionError {
                frequency,
                error: err.to_string(),
            });
            self.abort(ctx, id);
        }
    }

    pub fn on_handshake_text(&mut self, ctx: &mut SessionContext, id: ConnectionId, text: &str) {
        let Some(attempt) = self.attempts.get(&id) else {
            return;
        };
        let envelope = match ctx.handler.parse_message(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(connection = id, "dropping frame before handshake: {err}");
                return;
            }
        };

        let is_host = matches!(attempt.role, Role::Host { .. });
        match envelope {
            Envelope::RegisterResult(result) if is_host => self.on_register_result(ctx, id, result),
            Envelope::JoinResult(result) if !is_host => self.on_join_result(ctx, id, result),
            Envelope::Error(notice) => {
                warn!(connection = id, frequency = %attempt.frequency, "relay error during handshake: {}", notice.error);
            }
            other => debug!(connection = id, kind = other.kind(), "ignored before handshake completes"),
        }
    }

    pub fn on_error(&mut self, ctx: &mut SessionContext, id: ConnectionId, error: String) {
        let Some(attempt) = self.attempts.get_mut(&id) else {
            return;
        };
        attempt.error_reported = true;
        warn!(connection = id, frequency = %attempt.frequency, "transport error: {error}");
        ctx.events.publish(SessionEvent::ConnectionError {
            frequency: attempt.frequency.clone(),
            error,
        });
    }

    /// Returns the frequency whose attempt just ended.
    pub fn on_disconnected(&mut self, ctx: &mut SessionContext, id: ConnectionId) -> Option<Frequency> {
        let attempt = self.attempts.remove(&id)?;
        let frequency = attempt.frequency.clone();

        ctx.registry.remove_pending(&frequency);
        if let Some(token) = &attempt.session_token {
            ctx.auth.deactivate_session(token);
        }

        let owns_entry = ctx
            .registry
            .get(&frequency)
            .is_some_and(|info| info.connection_id == Some(id) && !info.is_closing);

        if attempt.phase == LifecycleState::Active {
            if owns_entry {
                let was_active = ctx.registry.active() == Some(frequency.as_str());
                ctx.registry.remove(&frequency);
                let event = if was_active {
                    SessionEvent::WavelengthLeft {
                        frequency: frequency.clone(),
                    }
                } else {
                    SessionEvent::WavelengthClosed {
                        frequency: frequency.clone(),
                    }
                };
                ctx.events.publish(event);
            }
        } else {
            if owns_entry {
                ctx.registry.remove(&frequency);
            }
            if !attempt.error_reported {
                ctx.events.publish(SessionEvent::ConnectionError {
                    frequency: frequency.clone(),
                    error: "connection closed before the handshake completed".to_owned(),
                });
            }
        }

        info!(connection = id, frequency = %frequency, "transport disconnected");
        Some(frequency)
    }

    fn activate(&mut self, ctx: &mut SessionContext, id: ConnectionId, host_id: Option<String>) {
        let Some(attempt) = self.attempts.get_mut(&id) else {
            return;
        };
        let frequency = attempt.frequency.clone();

        if let Some(mut info) = ctx.registry.get(&frequency).cloned() {
            if let Some(host_id) = host_id.filter(|host_id| !host_id.is_empty()) {
                info.host_id = host_id;
            }
            info.password.clear();
            ctx.registry.update(info);
        }
        ctx.registry.set_active(Some(frequency.as_str()));

        attempt.phase = LifecycleState::Active;
        attempt.keep_alive = KeepAlive::start(&attempt.connection, ctx.config.keep_alive_interval);

        let token = ctx.auth.generate_session_token(&attempt.client_id);
        ctx.auth
            .store_session(&token, &attempt.client_id, &frequency);
        attempt.session_token = Some(token);
    }

    /// Failed handshake: drop the provisional entry without a closed/left event.
    fn abort(&mut self, ctx: &mut SessionContext, id: ConnectionId) {
        if let Some(attempt) = self.finish(ctx, id) {
            debug!(connection = id, frequency = %attempt.frequency, "attempt aborted");
        }
    }

    fn finish(&mut self, ctx: &mut SessionContext, id: ConnectionId) -> Option<Attempt> {
        let attempt = self.attempts.remove(&id)?;
        attempt.connection.close();
        ctx.registry.remove_pending(&attempt.frequency);

        let owns_entry = ctx
            .registry
            .get(&attempt.frequency)
            .is_some_and(|info| info.connection_id == Some(id));
        if owns_entry {
            ctx.registry.remove(&attempt.frequency);
        }
        if let Some(token) = &attempt.session_token {
            ctx.auth.deactivate_session(token);
        }
        Some(attempt)
    }
}
