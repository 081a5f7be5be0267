use std::{path::PathBuf, sync::Arc};

use bytes::Bytes;
use tokio::{runtime::Handle, sync::mpsc};
use tracing::{debug, info, warn};
use wavelength_core::{Frequency, MessageId};

use crate::{
    attachment_queue::AttachmentQueueManager,
    attachment_store::AttachmentDataStore,
    auth::AuthenticationManager,
    config::ClientConfig,
    context::SessionContext,
    error::SessionError,
    events::{EventBus, SessionEvent},
    lifecycle::{Lifecycle, LifecycleState},
    processor::{self, Followup},
    ptt::{AudioBackend, PttController, PttState},
    registry::WavelengthRegistry,
    service::{MessageService, PreparedFile},
    transport::{ConnectionId, Connector, TransportEvent, TransportEventKind},
};

/// Receivers the owner of a [`SessionCoordinator`] must pump into it.
#[derive(Debug)]
pub struct CoordinatorInbox {
    pub transport: mpsc::UnboundedReceiver<TransportEvent>,
    pub deliveries: mpsc::UnboundedReceiver<PreparedFile>,
}

#[derive(Debug)]
pub struct SessionCoordinator {
    ctx: SessionContext,
    lifecycle: Lifecycle,
    service: MessageService,
    ptt: PttController,
}

impl SessionCoordinator {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        audio: Box<dyn AudioBackend>,
        events: EventBus,
        runtime: Handle,
    ) -> (Self, CoordinatorInbox) {
        let (transport_tx, transport) = mpsc::unbounded_channel();
        let (delivery_tx, deliveries) = mpsc::unbounded_channel();

        let coordinator = Self {
            ctx: SessionContext::new(config, events.clone()),
            lifecycle: Lifecycle::new(connector, transport_tx),
            service: MessageService::new(AttachmentQueueManager::new(runtime), delivery_tx),
            ptt: PttController::new(audio, events),
        };
        (
            coordinator,
            CoordinatorInbox {
                transport,
                deliveries,
            },
        )
    }

    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    pub fn config(&self) -> &ClientConfig {
        &self.ctx.config
    }

    pub fn registry(&self) -> &WavelengthRegistry {
        &self.ctx.registry
    }

    pub fn auth(&self) -> &AuthenticationManager {
        &self.ctx.auth
    }

    pub fn attachments(&self) -> Arc<AttachmentDataStore> {
        Arc::clone(&self.ctx.store)
    }

    pub fn lifecycle_state(&self, frequency: &str) -> LifecycleState {
        self.lifecycle.state(frequency)
    }

    pub fn session_token(&self, frequency: &str) -> Option<&str> {
        self.lifecycle.session_token(frequency)
    }

    pub fn ptt_state(&self) -> &PttState {
        self.ptt.state()
    }

    pub fn active_wavelength(&self) -> Option<Frequency> {
        self.ctx.registry.active().map(str::to_owned)
    }

    pub fn create_wavelength(
        &mut self,
        frequency: &str,
        password: Option<&str>,
    ) -> Result<(), SessionError> {
        let result = self.lifecycle.create(&mut self.ctx, frequency, password);
        self.flush_registry_changes();
        result
    }

    pub fn join_wavelength(
        &mut self,
        frequency: &str,
        password: Option<&str>,
    ) -> Result<(), SessionError> {
        let result = self.lifecycle.join(&mut self.ctx, frequency, password);
        self.flush_registry_changes();
        result
    }

    pub fn leave_wavelength(&mut self, frequency: &str) -> Result<(), SessionError> {
        self.release_floor_for(frequency);
        self.ptt.teardown(frequency);
        let result = self.lifecycle.leave(&mut self.ctx, frequency);
        self.flush_registry_changes();
        result
    }

    pub fn close_wavelength(&mut self, frequency: &str) -> Result<(), SessionError> {
        self.lifecycle.ensure_closable(&self.ctx, frequency)?;
        self.release_floor_for(frequency);
        self.ptt.teardown(frequency);
        let result = self.lifecycle.close(&mut self.ctx, frequency);
        self.flush_registry_changes();
        result
    }

    pub fn set_active_wavelength(&mut self, frequency: Option<&str>) -> Result<(), SessionError> {
        let switched = self.ctx.registry.set_active(frequency);
        self.flush_registry_changes();
        match (switched, frequency) {
            (false, Some(frequency)) => Err(SessionError::UnknownWavelength(frequency.to_owned())),
            _ => Ok(()),
        }
    }

    pub fn send_text(&mut self, content: &str) -> Result<MessageId, SessionError> {
        self.service.send_text(&mut self.ctx, content)
    }

    pub fn send_file(&mut self, path: PathBuf, progress_id: String) -> Result<(), SessionError> {
        self.service.send_file(&mut self.ctx, path, progress_id)
    }

    /// Asks the relay for the floor on the active wavelength.
    pub fn press_ptt(&mut self) -> Result<(), SessionError> {
        let frequency = self
            .ctx
            .registry
            .active()
            .map(str::to_owned)
            .ok_or(SessionError::NoActiveWavelength)?;
        self.ptt.press(&frequency)?;
        if let Err(err) = self.service.send_ptt_request(&self.ctx, &frequency) {
            self.ptt.release();
            return Err(err);
        }
        Ok(())
    }

    pub fn release_ptt(&mut self) -> Result<(), SessionError> {
        match self.ptt.release() {
            Some(frequency) => self.service.send_ptt_release(&self.ctx, &frequency),
            None => Ok(()),
        }
    }

    /// Forwards one captured PCM buffer while transmitting; dropped otherwise.
    pub fn push_captured_audio(&mut self, pcm: Bytes) -> Result<(), SessionError> {
        match self.ptt.on_captured_audio(&pcm) {
            Some(frequency) => self.service.send_audio(&self.ctx, &frequency, pcm),
            None => Ok(()),
        }
    }

    pub fn send_audio(&mut self, frequency: &str, pcm: Bytes) -> Result<(), SessionError> {
        self.service.send_audio(&self.ctx, frequency, pcm)
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        let id = event.connection;
        let Some((frequency, phase)) = self.lifecycle.route(id) else {
            debug!(connection = id, "event for a retired connection dropped");
            return;
        };

        match event.kind {
            TransportEventKind::Connected => self.lifecycle.on_connected(&mut self.ctx, id),
            TransportEventKind::Text(text) => match phase {
                LifecycleState::Connecting | LifecycleState::AwaitingResult => {
                    self.lifecycle.on_handshake_text(&mut self.ctx, id, &text);
                }
                LifecycleState::Active => {
                    let followup =
                        processor::process_text(&mut self.ctx, &mut self.ptt, &frequency, &text);
                    if let Some(followup) = followup {
                        self.apply_followup(id, &frequency, followup);
                    }
                }
                LifecycleState::Closing | LifecycleState::Disconnected => {
                    debug!(connection = id, "frame on a closing connection dropped");
                }
            },
            TransportEventKind::Binary(data) => {
                if phase == LifecycleState::Active {
                    processor::process_binary(&mut self.ptt, &frequency, data);
                }
            }
            TransportEventKind::Error(error) => self.lifecycle.on_error(&mut self.ctx, id, error),
            TransportEventKind::Disconnected => {
                if let Some(frequency) = self.lifecycle.on_disconnected(&mut self.ctx, id) {
                    self.ptt.teardown(&frequency);
                }
            }
        }
        self.flush_registry_changes();
    }

    pub fn deliver_file(&mut self, prepared: PreparedFile) {
        self.service.deliver(&mut self.ctx, prepared);
    }

    /// Leaves every wavelength and drops expired sessions.
    pub fn shutdown(&mut self) {
        info!("session shutting down");
        if let Some(frequency) = self.ptt.release() {
            if let Err(err) = self.service.send_ptt_release(&self.ctx, &frequency) {
                debug!(frequency = %frequency, "ptt release at shutdown not delivered: {err}");
            }
        }
        for frequency in self.lifecycle.frequencies() {
            self.ptt.teardown(&frequency);
        }
        self.lifecycle.leave_all(&mut self.ctx);
        self.ctx.auth.cleanup_expired_sessions();
        self.flush_registry_changes();
    }

    fn apply_followup(&mut self, id: ConnectionId, frequency: &str, followup: Followup) {
        match followup {
            Followup::WavelengthClosed => {
                self.ptt.teardown(frequency);
                self.lifecycle.on_remote_closed(&mut self.ctx, id);
            }
            Followup::Kicked(reason) => {
                self.ptt.teardown(frequency);
                self.lifecycle.on_kicked(&mut self.ctx, id, reason);
            }
            Followup::ReturnFloor(frequency) => {
                if let Err(err) = self.service.send_ptt_release(&self.ctx, &frequency) {
                    warn!(frequency = %frequency, "could not return ptt grant: {err}");
                }
            }
        }
    }

    /// Hands the floor back before the transport goes away.
    fn release_floor_for(&mut self, frequency: &str) {
        if self.ptt.state().frequency() != Some(frequency) {
            return;
        }
        let Some(held) = self.ptt.release() else {
            return;
        };
        if let Err(err) = self.service.send_ptt_release(&self.ctx, &held) {
            debug!(frequency = %held, "ptt release before leave not delivered: {err}");
        }
    }

    fn flush_registry_changes(&mut self) {
        for change in self.ctx.registry.drain_changes() {
            self.ctx.events.publish(SessionEvent::Registry(change));
        }
    }
}
