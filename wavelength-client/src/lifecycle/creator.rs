use tracing::{info, warn};
use wavelength_core::{Envelope, HandshakeResult, RegisterWavelength};

use super::{Attempt, Lifecycle, Role, normalize_frequency};
use crate::{
    context::SessionContext, error::SessionError, events::SessionEvent, transport::ConnectionId,
};

pub(super) fn register_request(attempt: &Attempt, password: &str) -> Envelope {
    Envelope::RegisterWavelength(RegisterWavelength {
        frequency: attempt.frequency.clone(),
        is_password_protected: !password.is_empty(),
        password: password.to_owned(),
        host_id: attempt.client_id.clone(),
    })
}

impl Lifecycle {
    /// Starts hosting `frequency`. The outcome arrives later as
    /// `WavelengthCreated` or `ConnectionError`.
    pub fn create(
        &mut self,
        ctx: &mut SessionContext,
        frequency: &str,
        password: Option<&str>,
    ) -> Result<(), SessionError> {
        let frequency = normalize_frequency(frequency)?;
        if ctx.registry.contains(&frequency) || !ctx.registry.add_pending(&frequency) {
            return Err(SessionError::DuplicateRequest(frequency));
        }

        let host_id = ctx.auth.generate_client_id();
        let password = password.unwrap_or_default().to_owned();
        info!(frequency = %frequency, protected = !password.is_empty(), "creating wavelength");
        self.open(ctx, frequency, Role::Host { password }, host_id);
        Ok(())
    }

    pub(super) fn on_register_result(
        &mut self,
        ctx: &mut SessionContext,
        id: ConnectionId,
        result: HandshakeResult,
    ) {
        let Some(attempt) = self.attempts.get(&id) else {
            return;
        };
        let frequency = attempt.frequency.clone();

        if !result.success {
            let error = result
                .error
                .filter(|error| !error.is_empty())
                .unwrap_or_else(|| "Unknown error".to_owned());
            warn!(frequency = %frequency, "registration rejected: {error}");
            ctx.events
                .publish(SessionEvent::ConnectionError { frequency, error });
            self.abort(ctx, id);
            return;
        }

        if let Role::Host { password } = &attempt.role {
            ctx.auth.register_password(&frequency, password);
        }
        self.activate(ctx, id, result.host_id);
        info!(frequency = %frequency, "wavelength created");
        ctx.events
            .publish(SessionEvent::WavelengthCreated { frequency });
    }
}
