use tracing::{info, warn};
use wavelength_core::{Envelope, FrequencyRef};

use super::{Lifecycle, LifecycleState};
use crate::{
    context::SessionContext, error::SessionError, events::SessionEvent, transport::ConnectionId,
};

impl Lifecycle {
    /// Leaves `frequency`. A host leaving closes the wavelength on the relay.
    pub fn leave(&mut self, ctx: &mut SessionContext, frequency: &str) -> Result<(), SessionError> {
        let id = self
            .attempt_for(frequency)
            .ok_or_else(|| SessionError::UnknownWavelength(frequency.to_owned()))?;

        let established = self
            .attempts
            .get(&id)
            .filter(|attempt| attempt.phase == LifecycleState::Active);
        if let Some(attempt) = established {
            let is_host = ctx.registry.get(frequency).is_some_and(|info| info.is_host);
            let target = FrequencyRef::new(frequency);
            let envelope = if is_host {
                Envelope::CloseWavelength(target)
            } else {
                Envelope::LeaveWavelength(target)
            };
            if let Err(err) = ctx.send_envelope(attempt.connection.as_ref(), &envelope) {
                warn!(frequency, "leave notice not delivered: {err}");
            }
        }

        self.finish(ctx, id);
        info!(frequency, "left wavelength");
        ctx.events.publish(SessionEvent::WavelengthLeft {
            frequency: frequency.to_owned(),
        });
        Ok(())
    }

    /// Fails unless this client hosts an open attempt on `frequency`.
    pub fn ensure_closable(
        &self,
        ctx: &SessionContext,
        frequency: &str,
    ) -> Result<ConnectionId, SessionError> {
        let is_host = ctx
            .registry
            .get(frequency)
            .map(|info| info.is_host)
            .ok_or_else(|| SessionError::UnknownWavelength(frequency.to_owned()))?;
        if !is_host {
            return Err(SessionError::NotHost(frequency.to_owned()));
        }
        self.attempt_for(frequency)
            .ok_or_else(|| SessionError::UnknownWavelength(frequency.to_owned()))
    }

    /// Host-only shutdown of `frequency` for every member.
    pub fn close(&mut self, ctx: &mut SessionContext, frequency: &str) -> Result<(), SessionError> {
        let id = self.ensure_closable(ctx, frequency)?;

        ctx.registry.mark_closing(frequency, true);
        if let Some(attempt) = self.attempts.get_mut(&id) {
            attempt.phase = LifecycleState::Closing;
            let envelope = Envelope::CloseWavelength(FrequencyRef::new(frequency));
            if let Err(err) = ctx.send_envelope(attempt.connection.as_ref(), &envelope) {
                warn!(frequency, "close notice not delivered: {err}");
            }
        }

        self.finish(ctx, id);
        ctx.auth.remove_password(frequency);
        info!(frequency, "wavelength closed by host");
        ctx.events.publish(SessionEvent::WavelengthClosed {
            frequency: frequency.to_owned(),
        });
        Ok(())
    }

    /// The relay or the host ended the wavelength.
    pub fn on_remote_closed(&mut self, ctx: &mut SessionContext, id: ConnectionId) {
        if let Some(attempt) = self.finish(ctx, id) {
            info!(frequency = %attempt.frequency, "wavelength closed remotely");
            ctx.events.publish(SessionEvent::WavelengthClosed {
                frequency: attempt.frequency,
            });
        }
    }

    pub fn on_kicked(&mut self, ctx: &mut SessionContext, id: ConnectionId, reason: Option<String>) {
        if let Some(attempt) = self.finish(ctx, id) {
            warn!(frequency = %attempt.frequency, reason = ?reason, "removed from wavelength");
            ctx.events.publish(SessionEvent::UserKicked {
                frequency: attempt.frequency,
                reason,
            });
        }
    }

    /// Leaves everything, including attempts still in their handshake.
    pub fn leave_all(&mut self, ctx: &mut SessionContext) {
        for frequency in self.frequencies() {
            if let Err(err) = self.leave(ctx, &frequency) {
                warn!(frequency = %frequency, "leave during shutdown failed: {err}");
            }
        }
        ctx.registry.clear_all();
    }
}
