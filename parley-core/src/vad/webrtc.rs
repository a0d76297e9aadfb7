//! WebRTC voice activity detector (libfvad via the `webrtc-vad` crate).
//!
//! libfvad accepts 10/20/30 ms frames at 8/16/32/48 kHz; the engine always
//! hands it 30 ms frames at the configured rate. The detector holds a raw C
//! handle and is therefore `!Send`: build it on the thread that uses it.

use super::{ClassifierFactory, Sensitivity, VoiceActivityClassifier};
use crate::buffering::frame::SampleRate;
use crate::error::Result;

#[cfg(feature = "webrtc")]
pub use backend::WebRtcClassifier;

/// Builds [`WebRtcClassifier`]s, or reports `ClassifierUnavailable` when the
/// `webrtc` feature is compiled out.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcFactory;

impl ClassifierFactory for WebRtcFactory {
    #[cfg(feature = "webrtc")]
    fn create(
        &self,
        rate: SampleRate,
        sensitivity: Sensitivity,
    ) -> Result<Box<dyn VoiceActivityClassifier>> {
        Ok(Box::new(WebRtcClassifier::new(rate, sensitivity)))
    }

    #[cfg(not(feature = "webrtc"))]
    fn create(
        &self,
        _rate: SampleRate,
        _sensitivity: Sensitivity,
    ) -> Result<Box<dyn VoiceActivityClassifier>> {
        Err(crate::error::ParleyError::ClassifierUnavailable(
            "compiled without the webrtc feature".into(),
        ))
    }
}

#[cfg(feature = "webrtc")]
mod backend {
    use tracing::{debug, warn};
    use webrtc_vad::{SampleRate as FvadRate, Vad, VadMode};

    use super::super::{check_frame_len, Sensitivity, VadDecision, VoiceActivityClassifier};
    use crate::buffering::frame::{AudioFrame, SampleRate};
    use crate::error::Result;

    pub struct WebRtcClassifier {
        vad: Vad,
        rate: SampleRate,
        sensitivity: Sensitivity,
    }

    impl WebRtcClassifier {
        pub fn new(rate: SampleRate, sensitivity: Sensitivity) -> Self {
            debug!(rate = rate.hz(), level = sensitivity.level(), "webrtc vad ready");
            Self {
                vad: Vad::new_with_rate_and_mode(fvad_rate(rate), fvad_mode(sensitivity)),
                rate,
                sensitivity,
            }
        }
    }

    fn fvad_rate(rate: SampleRate) -> FvadRate {
        match rate {
            SampleRate::Hz8000 => FvadRate::Rate8kHz,
            SampleRate::Hz16000 => FvadRate::Rate16kHz,
            SampleRate::Hz32000 => FvadRate::Rate32kHz,
            SampleRate::Hz48000 => FvadRate::Rate48kHz,
        }
    }

    fn fvad_mode(sensitivity: Sensitivity) -> VadMode {
        match sensitivity.level() {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            _ => VadMode::VeryAggressive,
        }
    }

    impl VoiceActivityClassifier for WebRtcClassifier {
        fn classify(&mut self, frame: &AudioFrame) -> Result<VadDecision> {
            check_frame_len(frame, self.rate)?;
            match self.vad.is_voice_segment(frame.samples()) {
                Ok(true) => Ok(VadDecision::Speech),
                Ok(false) => Ok(VadDecision::Silence),
                Err(()) => {
                    // Length was validated above, so this is libfvad rejecting
                    // the rate/length combination outright.
                    warn!(seq = frame.sequence(), "libfvad rejected frame");
                    Ok(VadDecision::Silence)
                }
            }
        }

        fn reset(&mut self) {
            self.vad = Vad::new_with_rate_and_mode(fvad_rate(self.rate), fvad_mode(self.sensitivity));
        }

        fn name(&self) -> &'static str {
            "webrtc"
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::error::ParleyError;

        #[test]
        fn digital_silence_is_not_speech() {
            let mut vad = WebRtcClassifier::new(SampleRate::Hz16000, Sensitivity::STRICT);
            let frame = AudioFrame::silent(SampleRate::Hz16000, 0);
            assert_eq!(vad.classify(&frame).unwrap(), VadDecision::Silence);
        }

        #[test]
        fn mis_sized_frame_is_rejected_not_guessed() {
            let mut vad = WebRtcClassifier::new(SampleRate::Hz16000, Sensitivity::PERMISSIVE);
            let frame = AudioFrame::new(vec![1000; 320], SampleRate::Hz16000, 0);
            assert!(matches!(
                vad.classify(&frame),
                Err(ParleyError::InvalidFrame {
                    expected: 480,
                    actual: 320
                })
            ));
        }

        #[test]
        fn every_rate_and_level_constructs() {
            for hz in [8_000, 16_000, 32_000, 48_000] {
                let rate = SampleRate::from_hz(hz).unwrap();
                for level in 0..=3 {
                    let mut vad = WebRtcClassifier::new(rate, Sensitivity::new(level));
                    assert!(vad.classify(&AudioFrame::silent(rate, 0)).is_ok());
                }
            }
        }
    }
}
