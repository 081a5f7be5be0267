use tracing::{info, warn};
use wavelength_core::{
    ERR_INVALID_PASSWORD, ERR_PASSWORD_REQUIRED, Envelope, HandshakeResult, JoinWavelength,
};

use super::{Attempt, Lifecycle, LifecycleState, Role, normalize_frequency};
use crate::{
    context::SessionContext,
    error::SessionError,
    events::{AuthFailure, SessionEvent},
    transport::ConnectionId,
};

pub(super) fn join_request(attempt: &Attempt, password: Option<&str>) -> Envelope {
    Envelope::JoinWavelength(JoinWavelength {
        frequency: attempt.frequency.clone(),
        password: password.map(str::to_owned),
        client_id: attempt.client_id.clone(),
    })
}

fn auth_failure(error: &str) -> Option<AuthFailure> {
    match error {
        ERR_PASSWORD_REQUIRED => Some(AuthFailure::PasswordRequired),
        ERR_INVALID_PASSWORD => Some(AuthFailure::InvalidPassword),
        _ => None,
    }
}

impl Lifecycle {
    /// Joins `frequency` as a guest. Joining a wavelength that is already
    /// established only makes it the active one.
    pub fn join(
        &mut self,
        ctx: &mut SessionContext,
        frequency: &str,
        password: Option<&str>,
    ) -> Result<(), SessionError> {
        let frequency = normalize_frequency(frequency)?;
        if ctx.registry.is_pending(&frequency) {
            return Err(SessionError::DuplicateRequest(frequency));
        }
        if ctx.registry.contains(&frequency) {
            if self.state(&frequency) != LifecycleState::Active {
                return Err(SessionError::DuplicateRequest(frequency));
            }
            ctx.registry.set_active(Some(frequency.as_str()));
            return Ok(());
        }

        ctx.registry.add_pending(&frequency);
        let client_id = ctx.auth.generate_client_id();
        let password = password.filter(|p| !p.is_empty()).map(str::to_owned);
        info!(frequency = %frequency, with_password = password.is_some(), "joining wavelength");
        self.open(ctx, frequency, Role::Guest { password }, client_id);
        Ok(())
    }

    pub(super) fn on_join_result(
        &mut self,
        ctx: &mut SessionContext,
        id: ConnectionId,
        result: HandshakeResult,
    ) {
        let Some(frequency) = self.attempts.get(&id).map(|a| a.frequency.clone()) else {
            return;
        };

        if !result.success {
            let error = result
                .error
                .filter(|error| !error.is_empty())
                .unwrap_or_else(|| "Unknown error".to_owned());
            warn!(frequency = %frequency, "join rejected: {error}");
            let event = match auth_failure(&error) {
                Some(reason) => SessionEvent::AuthenticationFailed { frequency, reason },
                None => SessionEvent::ConnectionError { frequency, error },
            };
            ctx.events.publish(event);
            self.abort(ctx, id);
            return;
        }

        self.activate(ctx, id, result.host_id);
        info!(frequency = %frequency, "wavelength joined");
        ctx.events
            .publish(SessionEvent::WavelengthJoined { frequency });
    }
}
