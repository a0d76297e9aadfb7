use std::time::Duration;

use thiserror::Error;

use crate::engine::TurnState;

/// All errors produced by parley-core.
#[derive(Debug, Error)]
pub enum ParleyError {
    /// Capture or playback device could not be opened, or went away mid-session.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Speech classifier backend failed to initialise. Callers degrade to
    /// energy-only detection.
    #[error("speech classifier unavailable: {0}")]
    ClassifierUnavailable(String),

    #[error("playback engine is busy with another session")]
    EngineBusy,

    #[error("invalid audio frame: expected {expected} samples, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },

    #[error("no speech heard within {waited:?}")]
    ListenTimeout { waited: Duration },

    #[error("unsupported sample rate: {0} Hz (expected 8000, 16000, 32000 or 48000)")]
    UnsupportedSampleRate(u32),

    #[error("invalid turn transition {from:?} -> {to:?}")]
    InvalidTransition { from: TurnState, to: TurnState },

    #[error("speech synthesis error: {0}")]
    Synthesis(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ParleyError>;
