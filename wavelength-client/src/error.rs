use thiserror::Error;
use wavelength_core::{Frequency, ProtocolError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("wavelength {0} already exists or is pending")]
    DuplicateRequest(Frequency),
    #[error("session expired")]
    SessionExpired,
    #[error("no active wavelength")]
    NoActiveWavelength,
    #[error("unknown wavelength {0}")]
    UnknownWavelength(Frequency),
    #[error("frequency must not be empty")]
    InvalidFrequency,
    #[error("transport for {0} is not connected")]
    InvalidTransport(Frequency),
    #[error("only the host can close wavelength {0}")]
    NotHost(Frequency),
    #[error("push-to-talk is busy")]
    PttBusy,
    #[error("session loop has stopped")]
    Stopped,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AudioError {
    #[error("capture device unavailable: {0}")]
    Capture(String),
    #[error("playback device unavailable: {0}")]
    Playback(String),
}
