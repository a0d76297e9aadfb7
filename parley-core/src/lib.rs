//! # parley-core
//!
//! Full-duplex turn-taking engine for voice conversations.
//!
//! ## Architecture
//!
//! ```text
//! CaptureDevice ──open──► FrameSource (30 ms AudioFrames)
//!                              │
//!                  FrameAnalyzer (VAD + EnergyGate)
//!                     │                      │
//!          onset: VAD OR energy      interrupt: VAD AND energy
//!                     │                      │
//!             EndpointDetector         BargeInMonitor
//!                     └────────► TurnCoordinator ◄────┘
//!                                     │
//!                      Transcriber / DialogueBackend / PlaybackController
//! ```
//!
//! The capture device has at most one owner at a time: a listen cycle or a
//! barge-in watch, never both.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod backends;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod playback;
pub mod vad;

// Convenience re-exports for downstream crates
pub use audio::{CaptureDevice, FrameSource, ScriptedDevice, ScriptedSource, WavFileDevice};
pub use backends::{DialogueBackend, EchoDialogue, StubTranscriber, Transcriber};
pub use buffering::frame::{AudioFrame, SampleRate, FRAME_DURATION, FRAME_MS};
pub use engine::{
    Completion, DiagnosticsSnapshot, EngineConfig, SessionHandle, TurnCoordinator, TurnOutcome,
    TurnState, Utterance,
};
pub use error::{ParleyError, Result};
pub use ipc::events::{AudioActivityEvent, InterruptEvent, TurnStateEvent};
pub use playback::{
    PlaybackController, PlaybackOutcome, SimulatedSynthesizer, SpeechSynthesizer,
    SynthesisProgress,
};
pub use vad::{
    ClassifierFactory, EnergyGate, ScriptedFactory, Sensitivity, VoiceActivityClassifier,
    WebRtcFactory,
};

#[cfg(feature = "audio-cpal")]
pub use audio::MicrophoneDevice;
