use bytes::Bytes;
use tracing::{debug, warn};
use wavelength_core::{
    DEFAULT_PTT_DENIED_REASON, Frequency, UNKNOWN_SENDER, frequencies_match, pcm_rms_amplitude,
};

use crate::{
    error::{AudioError, SessionError},
    events::{EventBus, SessionEvent},
};

pub trait AudioBackend: Send {
    fn open_capture(&mut self) -> Result<(), AudioError>;
    fn close_capture(&mut self);
    fn open_playback(&mut self) -> Result<(), AudioError>;
    fn close_playback(&mut self);
    fn write_playback(&mut self, pcm: &[u8]) -> Result<(), AudioError>;
}

/// Backend for headless use: every device opens and audio is discarded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAudio;

impl AudioBackend for NullAudio {
    fn open_capture(&mut self) -> Result<(), AudioError> {
        Ok(())
    }

    fn close_capture(&mut self) {}

    fn open_playback(&mut self) -> Result<(), AudioError> {
        Ok(())
    }

    fn close_playback(&mut self) {}

    fn write_playback(&mut self, _pcm: &[u8]) -> Result<(), AudioError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PttState {
    Idle,
    Requesting { frequency: Frequency },
    Transmitting { frequency: Frequency },
    Receiving { frequency: Frequency, sender: String },
}

impl PttState {
    pub fn frequency(&self) -> Option<&str> {
        match self {
            PttState::Idle => None,
            PttState::Requesting { frequency }
            | PttState::Transmitting { frequency }
            | PttState::Receiving { frequency, .. } => Some(frequency),
        }
    }
}

pub struct PttController {
    state: PttState,
    audio: Box<dyn AudioBackend>,
    events: EventBus,
}

impl std::fmt::Debug for PttController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PttController")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl PttController {
    pub fn new(audio: Box<dyn AudioBackend>, events: EventBus) -> Self {
        Self {
            state: PttState::Idle,
            audio,
            events,
        }
    }

    pub fn state(&self) -> &PttState {
        &self.state
    }

    pub fn controls_enabled(&self) -> bool {
        self.state == PttState::Idle
    }

    pub fn press(&mut self, frequency: &str) -> Result<(), SessionError> {
        if self.state != PttState::Idle {
            return Err(SessionError::PttBusy);
        }
        self.state = PttState::Requesting {
            frequency: frequency.to_owned(),
        };
        Ok(())
    }

    /// Returns the frequency that needs a `release_ptt`. Releasing while the
    /// request is still outstanding just cancels it locally.
    pub fn release(&mut self) -> Option<Frequency> {
        match std::mem::replace(&mut self.state, PttState::Idle) {
            PttState::Requesting { frequency } => {
                debug!(frequency = %frequency, "ptt request cancelled");
                None
            }
            PttState::Transmitting { frequency } => {
                self.audio.close_capture();
                Some(frequency)
            }
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Returns a frequency whose floor must be handed straight back: a grant
    /// nobody asked for, or one whose capture device failed to open.
    pub fn on_granted(&mut self, frequency: &str) -> Option<Frequency> {
        let requested = match &self.state {
            PttState::Requesting { frequency: requested } => requested.clone(),
            _ => {
                debug!(frequency = %frequency, "unsolicited ptt grant returned");
                return Some(frequency.to_owned());
            }
        };
        if !frequencies_match(&requested, Some(frequency)) {
            debug!(requested = %requested, granted = %frequency, "grant for another frequency returned");
            return Some(frequency.to_owned());
        }

        match self.audio.open_capture() {
            Ok(()) => {
                self.state = PttState::Transmitting {
                    frequency: requested.clone(),
                };
                self.events.publish(SessionEvent::PttGranted {
                    frequency: requested,
                });
                None
            }
            Err(err) => {
                warn!(frequency = %requested, "capture failed to open: {err}");
                self.state = PttState::Idle;
                self.events.publish(SessionEvent::SystemNotice {
                    frequency: requested.clone(),
                    message: err.to_string(),
                });
                Some(requested)
            }
        }
    }

    pub fn on_denied(&mut self, frequency: &str, reason: Option<&str>) {
        match &self.state {
            PttState::Requesting { frequency: requested } if requested == frequency => {
                self.state = PttState::Idle;
                self.events.publish(SessionEvent::PttDenied {
                    frequency: frequency.to_owned(),
                    reason: reason
                        .filter(|reason| !reason.is_empty())
                        .unwrap_or(DEFAULT_PTT_DENIED_REASON)
                        .to_owned(),
                });
            }
            _ => debug!(frequency = %frequency, "ptt denial without a request ignored"),
        }
    }

    pub fn on_start_receiving(&mut self, frequency: &str, sender: Option<&str>) {
        if self.state != PttState::Idle {
            debug!(frequency = %frequency, state = ?self.state, "start receiving ignored");
            return;
        }
        let sender = sender
            .filter(|sender| !sender.is_empty())
            .unwrap_or(UNKNOWN_SENDER)
            .to_owned();

        if let Err(err) = self.audio.open_playback() {
            warn!(frequency = %frequency, "playback failed to open: {err}");
            self.events.publish(SessionEvent::SystemNotice {
                frequency: frequency.to_owned(),
                message: err.to_string(),
            });
            return;
        }
        self.state = PttState::Receiving {
            frequency: frequency.to_owned(),
            sender: sender.clone(),
        };
        self.events.publish(SessionEvent::PttStartReceiving {
            frequency: frequency.to_owned(),
            sender,
        });
    }

    pub fn on_stop_receiving(&mut self, frequency: &str) {
        if matches!(&self.state, PttState::Receiving { frequency: current, .. } if current == frequency)
        {
            self.audio.close_playback();
            self.state = PttState::Idle;
            self.events.publish(SessionEvent::PttStopReceiving {
                frequency: frequency.to_owned(),
            });
        }
    }

    pub fn on_remote_audio(&mut self, frequency: &str, data: Bytes) {
        if matches!(&self.state, PttState::Receiving { frequency: current, .. } if current == frequency)
        {
            if let Err(err) = self.audio.write_playback(&data) {
                warn!(frequency = %frequency, "playback write failed: {err}");
            }
            self.events.publish(SessionEvent::RemoteAmplitude {
                frequency: frequency.to_owned(),
                amplitude: pcm_rms_amplitude(&data),
            });
        }
        self.events.publish(SessionEvent::AudioReceived {
            frequency: frequency.to_owned(),
            data,
        });
    }

    pub fn on_remote_amplitude(&mut self, frequency: &str, amplitude: f64) {
        self.events.publish(SessionEvent::RemoteAmplitude {
            frequency: frequency.to_owned(),
            amplitude: amplitude.clamp(0.0, 1.0) as f32,
        });
    }

    /// Returns the frequency the chunk should be streamed to, if transmitting.
    pub fn on_captured_audio(&mut self, pcm: &[u8]) -> Option<Frequency> {
        let PttState::Transmitting { frequency } = &self.state else {
            return None;
        };
        self.events.publish(SessionEvent::LocalAmplitude {
            frequency: frequency.clone(),
            amplitude: pcm_rms_amplitude(pcm),
        });
        Some(frequency.clone())
    }

    /// Drops any floor state tied to `frequency` and closes its devices.
    pub fn teardown(&mut self, frequency: &str) {
        if self.state.frequency() != Some(frequency) {
            return;
        }
        match std::mem::replace(&mut self.state, PttState::Idle) {
            PttState::Transmitting { .. } => self.audio.close_capture(),
            PttState::Receiving { .. } => self.audio.close_playback(),
            _ => {}
        }
        debug!(frequency = %frequency, "ptt state torn down");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::events::EventKind;

    #[derive(Clone, Default)]
    struct RecordingAudio {
        calls: Arc<Mutex<Vec<&'static str>>>,
        fail_capture: bool,
    }

    impl RecordingAudio {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().expect("calls lock").clone()
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().expect("calls lock").push(call);
        }
    }

    impl AudioBackend for RecordingAudio {
        fn open_capture(&mut self) -> Result<(), AudioError> {
            self.record("open_capture");
            if self.fail_capture {
                return Err(AudioError::Capture("no microphone".to_owned()));
            }
            Ok(())
        }

        fn close_capture(&mut self) {
            self.record("close_capture");
        }

        fn open_playback(&mut self) -> Result<(), AudioError> {
            self.record("open_playback");
            Ok(())
        }

        fn close_playback(&mut self) {
            self.record("close_playback");
        }

        fn write_playback(&mut self, _pcm: &[u8]) -> Result<(), AudioError> {
            self.record("write_playback");
            Ok(())
        }
    }

    fn controller(audio: &RecordingAudio) -> (PttController, EventBus) {
        let bus = EventBus::new();
        (PttController::new(Box::new(audio.clone()), bus.clone()), bus)
    }

    #[test]
    fn capture_opens_only_after_grant() {
        let audio = RecordingAudio::default();
        let (mut ptt, _bus) = controller(&audio);

        ptt.press("1").expect("press from idle");
        assert!(!ptt.controls_enabled());
        assert!(audio.calls().is_empty());

        assert_eq!(ptt.on_granted("1"), None);
        assert_eq!(
            ptt.state(),
            &PttState::Transmitting {
                frequency: "1".to_owned()
            }
        );
        assert_eq!(audio.calls(), vec!["open_capture"]);

        assert_eq!(ptt.release(), Some("1".to_owned()));
        assert!(ptt.controls_enabled());
        assert_eq!(audio.calls(), vec!["open_capture", "close_capture"]);
    }

    #[test]
    fn denial_returns_to_idle_without_capture() {
        let audio = RecordingAudio::default();
        let (mut ptt, bus) = controller(&audio);
        let mut events = bus.subscribe_kinds(&[EventKind::Ptt]);

        ptt.press("1").expect("press");
        ptt.on_denied("1", Some("busy"));

        assert_eq!(ptt.state(), &PttState::Idle);
        assert!(audio.calls().is_empty());
        assert_eq!(
            events.try_recv(),
            Some(SessionEvent::PttDenied {
                frequency: "1".to_owned(),
                reason: "busy".to_owned()
            })
        );
    }

    #[test]
    fn denial_without_reason_uses_default() {
        let audio = RecordingAudio::default();
        let (mut ptt, bus) = controller(&audio);
        let mut events = bus.subscribe_kinds(&[EventKind::Ptt]);

        ptt.press("1").expect("press");
        ptt.on_denied("1", None);
        assert!(matches!(
            events.try_recv(),
            Some(SessionEvent::PttDenied { reason, .. }) if reason == DEFAULT_PTT_DENIED_REASON
        ));
    }

    #[test]
    fn release_while_requesting_cancels_locally() {
        let audio = RecordingAudio::default();
        let (mut ptt, _bus) = controller(&audio);

        ptt.press("1").expect("press");
        assert_eq!(ptt.release(), None);
        assert_eq!(ptt.state(), &PttState::Idle);

        // The late grant is handed back instead of opening the microphone.
        assert_eq!(ptt.on_granted("1"), Some("1".to_owned()));
        assert!(audio.calls().is_empty());
    }

    #[test]
    fn grant_for_other_frequency_is_returned() {
        let audio = RecordingAudio::default();
        let (mut ptt, _bus) = controller(&audio);

        ptt.press("1").expect("press");
        assert_eq!(ptt.on_granted("2"), Some("2".to_owned()));
        assert_eq!(
            ptt.state(),
            &PttState::Requesting {
                frequency: "1".to_owned()
            }
        );
    }

    #[test]
    fn capture_failure_hands_floor_back() {
        let audio = RecordingAudio {
            fail_capture: true,
            ..RecordingAudio::default()
        };
        let (mut ptt, _bus) = controller(&audio);

        ptt.press("1").expect("press");
        assert_eq!(ptt.on_granted("1"), Some("1".to_owned()));
        assert_eq!(ptt.state(), &PttState::Idle);
    }

    #[test]
    fn receiving_plays_audio_until_stopped() {
        let audio = RecordingAudio::default();
        let (mut ptt, bus) = controller(&audio);
        let mut events = bus.subscribe();

        ptt.on_start_receiving("1", None);
        assert_eq!(
            ptt.state(),
            &PttState::Receiving {
                frequency: "1".to_owned(),
                sender: UNKNOWN_SENDER.to_owned()
            }
        );
        assert!(ptt.press("1").is_err());

        ptt.on_remote_audio("1", Bytes::from_static(&[0xff, 0x7f]));
        ptt.on_stop_receiving("1");

        assert_eq!(
            audio.calls(),
            vec!["open_playback", "write_playback", "close_playback"]
        );
        let kinds: Vec<_> = events.drain().iter().map(SessionEvent::kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Ptt,
                EventKind::Audio,
                EventKind::Audio,
                EventKind::Ptt
            ]
        );
    }

    #[test]
    fn captured_audio_streams_only_while_transmitting() {
        let audio = RecordingAudio::default();
        let (mut ptt, _bus) = controller(&audio);

        assert_eq!(ptt.on_captured_audio(&[0, 0]), None);
        ptt.press("1").expect("press");
        assert_eq!(ptt.on_captured_audio(&[0, 0]), None);
        ptt.on_granted("1");
        assert_eq!(ptt.on_captured_audio(&[0, 0]), Some("1".to_owned()));
    }

    #[test]
    fn teardown_closes_devices_for_that_frequency_only() {
        let audio = RecordingAudio::default();
        let (mut ptt, _bus) = controller(&audio);

        ptt.on_start_receiving("1", Some("host"));
        ptt.teardown("2");
        assert!(matches!(ptt.state(), PttState::Receiving { .. }));

        ptt.teardown("1");
        assert_eq!(ptt.state(), &PttState::Idle);
        assert_eq!(audio.calls(), vec!["open_playback", "close_playback"]);
    }
}
