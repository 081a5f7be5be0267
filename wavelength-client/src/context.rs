use std::sync::Arc;

use wavelength_core::Envelope;

use crate::{
    attachment_store::AttachmentDataStore, auth::AuthenticationManager, config::ClientConfig,
    error::SessionError, events::EventBus, handler::MessageHandler,
    registry::WavelengthRegistry, transport::Connection,
};

/// State shared by the lifecycle controllers, the processor and the service.
/// Lives on the session event loop.
#[derive(Debug)]
pub struct SessionContext {
    pub config: ClientConfig,
    pub registry: WavelengthRegistry,
    pub auth: AuthenticationManager,
    pub handler: MessageHandler,
    pub store: Arc<AttachmentDataStore>,
    pub events: EventBus,
}

impl SessionContext {
    pub fn new(config: ClientConfig, events: EventBus) -> Self {
        Self {
            config,
            registry: WavelengthRegistry::new(),
            auth: AuthenticationManager::new(),
            handler: MessageHandler::default(),
            store: Arc::new(AttachmentDataStore::new()),
            events,
        }
    }

    pub fn send_envelope(
        &self,
        connection: &dyn Connection,
        envelope: &Envelope,
    ) -> Result<(), SessionError> {
        let text = self.handler.encode_message(envelope)?;
        connection
            .send_text(text)
            .map_err(|err| SessionError::Connection(err.to_string()))
    }
}
