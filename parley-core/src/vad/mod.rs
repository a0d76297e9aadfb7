//! Voice activity classification.
//!
//! The `VoiceActivityClassifier` trait is the extensibility point for speech
//! classifiers. Classifiers are built through a [`ClassifierFactory`] on the
//! thread that will use them, because some backends (libfvad) are not `Send`.
//!
//! [`EnergyGate`] is the secondary signal; [`FrameAnalyzer`] combines both
//! and absorbs per-frame errors.

pub mod analyzer;
pub mod energy;
pub mod scripted;
pub mod webrtc;

pub use analyzer::{AnalyzerStats, FrameAnalyzer, FrameSignals};
pub use energy::EnergyGate;
pub use scripted::ScriptedFactory;
pub use webrtc::WebRtcFactory;

use serde::{Deserialize, Serialize};

use crate::buffering::frame::{AudioFrame, SampleRate};
use crate::error::{ParleyError, Result};

/// Whether a given audio frame contains speech or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    Speech,
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}

/// Classifier strictness on a 0–3 scale: 0 lets the most through, 3 is the
/// most reluctant to call a frame speech. Does not change per-frame latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub struct Sensitivity(u8);

impl Sensitivity {
    pub const PERMISSIVE: Sensitivity = Sensitivity(0);
    pub const STRICT: Sensitivity = Sensitivity(3);

    /// Levels above 3 are clamped to 3.
    pub fn new(level: u8) -> Self {
        Self(level.min(3))
    }

    pub fn level(self) -> u8 {
        self.0
    }
}

impl Default for Sensitivity {
    fn default() -> Self {
        Self::STRICT
    }
}

impl From<u8> for Sensitivity {
    fn from(level: u8) -> Self {
        Self::new(level)
    }
}

impl From<Sensitivity> for u8 {
    fn from(s: Sensitivity) -> u8 {
        s.0
    }
}

/// Per-frame speech/non-speech classifier.
///
/// Implementors may be stateful and need not be `Send`.
pub trait VoiceActivityClassifier {
    /// Classify one frame.
    ///
    /// # Errors
    /// `InvalidFrame` when the frame length differs from the configured frame
    /// size. Implementations must not guess on mis-sized input.
    fn classify(&mut self, frame: &AudioFrame) -> Result<VadDecision>;

    /// Reset any internal state between capture sessions.
    fn reset(&mut self) {}

    fn name(&self) -> &'static str;
}

/// Builds classifiers. Shared between the listen and barge-in threads.
pub trait ClassifierFactory: Send + Sync {
    /// # Errors
    /// `ClassifierUnavailable` when the backend cannot run at this rate or is
    /// not compiled in. Callers fall back to energy-only detection.
    fn create(
        &self,
        rate: SampleRate,
        sensitivity: Sensitivity,
    ) -> Result<Box<dyn VoiceActivityClassifier>>;
}

/// Reject frames whose length does not match `rate`'s frame size.
pub fn check_frame_len(frame: &AudioFrame, rate: SampleRate) -> Result<()> {
    let expected = rate.frame_len();
    let actual = frame.samples().len();
    if actual != expected {
        return Err(ParleyError::InvalidFrame { expected, actual });
    }
    Ok(())
}

/// Factory that never yields a classifier: explicit energy-only operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnergyOnly;

impl ClassifierFactory for EnergyOnly {
    fn create(&self, _: SampleRate, _: Sensitivity) -> Result<Box<dyn VoiceActivityClassifier>> {
        Err(ParleyError::ClassifierUnavailable(
            "energy-only detection configured".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitivity_clamps_and_serializes_as_level() {
        assert_eq!(Sensitivity::new(9).level(), 3);
        assert_eq!(Sensitivity::default(), Sensitivity::STRICT);
        let s: Sensitivity = serde_json::from_str("7").expect("sensitivity");
        assert_eq!(s.level(), 3);
        assert_eq!(serde_json::to_string(&Sensitivity::PERMISSIVE).unwrap(), "0");
    }

    #[test]
    fn frame_length_check_reports_sizes() {
        let frame = AudioFrame::new(vec![0; 100], SampleRate::Hz8000, 0);
        match check_frame_len(&frame, SampleRate::Hz8000) {
            Err(ParleyError::InvalidFrame { expected, actual }) => {
                assert_eq!(expected, 240);
                assert_eq!(actual, 100);
            }
            other => panic!("expected InvalidFrame, got {other:?}"),
        }
    }

    #[test]
    fn energy_only_factory_reports_unavailable() {
        assert!(matches!(
            EnergyOnly.create(SampleRate::Hz16000, Sensitivity::default()),
            Err(ParleyError::ClassifierUnavailable(_))
        ));
    }
}
