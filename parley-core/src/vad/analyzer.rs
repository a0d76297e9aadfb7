//! Per-frame signal extraction: classifier verdict plus energy.
//!
//! The two consumers combine the signals differently. Endpointing wants to
//! catch every onset (`onset`: VAD **or** energy); barge-in wants to avoid
//! interrupting on background noise (`interrupt`: VAD **and** energy).
//! There is deliberately no shared `is_speech`.

use tracing::{debug, warn};

use super::{ClassifierFactory, EnergyGate, Sensitivity, VoiceActivityClassifier};
use crate::buffering::frame::{AudioFrame, SampleRate};
use crate::error::{ParleyError, Result};

/// Signals for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSignals {
    /// Classifier verdict; `None` in energy-only mode.
    pub vad: Option<bool>,
    /// Mean-square energy (0 for dropped frames).
    pub energy: f64,
    /// The frame was malformed and contributes nothing.
    pub dropped: bool,
}

impl FrameSignals {
    fn dropped(vad_available: bool) -> Self {
        Self {
            vad: vad_available.then_some(false),
            energy: 0.0,
            dropped: true,
        }
    }

    /// Listen-path policy: speech if either signal fires.
    pub fn onset(&self, energy_threshold: f64) -> bool {
        !self.dropped && (self.vad == Some(true) || self.energy > energy_threshold)
    }

    /// Barge-in policy: speech only if both signals fire. Without a
    /// classifier this reduces to the energy test.
    pub fn interrupt(&self, energy_threshold: f64) -> bool {
        if self.dropped {
            return false;
        }
        let loud = self.energy > energy_threshold;
        match self.vad {
            Some(voiced) => voiced && loud,
            None => loud,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AnalyzerStats {
    pub frames: usize,
    pub vad_speech: usize,
    pub dropped: usize,
    /// Classifier resets after a break in the frame stream.
    pub resets: usize,
}

/// Owns one classifier (or none) for the lifetime of a capture session.
///
/// The classifier carries state from frame to frame, so it is reset whenever
/// the stream breaks: a sequence gap (frames lost upstream) or a dropped
/// frame it never saw.
pub struct FrameAnalyzer {
    classifier: Option<Box<dyn VoiceActivityClassifier>>,
    rate: SampleRate,
    degraded: Option<String>,
    stats: AnalyzerStats,
    last_sequence: Option<u64>,
    broken: bool,
}

impl FrameAnalyzer {
    /// Build the classifier through `factory`. A failing factory yields an
    /// energy-only analyzer; check [`degraded_reason`](Self::degraded_reason).
    pub fn from_factory(
        factory: &dyn ClassifierFactory,
        rate: SampleRate,
        sensitivity: Sensitivity,
    ) -> Self {
        Self::with_classifier(factory.create(rate, sensitivity), rate)
    }

    pub fn with_classifier(
        classifier: Result<Box<dyn VoiceActivityClassifier>>,
        rate: SampleRate,
    ) -> Self {
        match classifier {
            Ok(classifier) => {
                debug!(backend = classifier.name(), "frame analyzer ready");
                Self {
                    classifier: Some(classifier),
                    rate,
                    degraded: None,
                    stats: AnalyzerStats::default(),
                    last_sequence: None,
                    broken: false,
                }
            }
            Err(e) => Self {
                classifier: None,
                rate,
                degraded: Some(e.to_string()),
                stats: AnalyzerStats::default(),
                last_sequence: None,
                broken: false,
            },
        }
    }

    /// Energy-only analyzer.
    pub fn energy_only(rate: SampleRate) -> Self {
        Self::with_classifier(
            Err(ParleyError::ClassifierUnavailable("energy-only".into())),
            rate,
        )
    }

    /// Why the classifier is missing, if it is.
    pub fn degraded_reason(&self) -> Option<&str> {
        self.degraded.as_deref()
    }

    pub fn has_classifier(&self) -> bool {
        self.classifier.is_some()
    }

    pub fn stats(&self) -> AnalyzerStats {
        self.stats
    }

    /// Analyse one frame. Never fails: malformed frames come back with
    /// `dropped = true` and count as non-speech under both policies.
    pub fn analyze(&mut self, frame: &AudioFrame) -> FrameSignals {
        self.stats.frames += 1;
        let has_vad = self.classifier.is_some();

        if frame.sample_rate() != self.rate || !frame.is_well_formed() {
            self.drop_frame(frame, frame.samples().len());
            return FrameSignals::dropped(has_vad);
        }
        self.follow(frame.sequence());

        let vad = match self.classifier.as_mut().map(|c| c.classify(frame)) {
            None => None,
            Some(Ok(decision)) => Some(decision.is_speech()),
            Some(Err(ParleyError::InvalidFrame { actual, .. })) => {
                self.drop_frame(frame, actual);
                return FrameSignals::dropped(has_vad);
            }
            Some(Err(e)) => {
                warn!(seq = frame.sequence(), "classifier error, treating as silence: {e}");
                Some(false)
            }
        };

        if vad == Some(true) {
            self.stats.vad_speech += 1;
        }
        FrameSignals {
            vad,
            energy: EnergyGate::energy(frame),
            dropped: false,
        }
    }

    /// Reset the classifier if `seq` does not directly follow the last
    /// frame it classified.
    fn follow(&mut self, seq: u64) {
        let gap = self
            .last_sequence
            .is_some_and(|last| seq != last.wrapping_add(1));
        self.last_sequence = Some(seq);
        if !(gap || std::mem::take(&mut self.broken)) {
            return;
        }
        if let Some(classifier) = self.classifier.as_mut() {
            debug!(seq, "frame stream broke, resetting classifier");
            classifier.reset();
            self.stats.resets += 1;
        }
    }

    fn drop_frame(&mut self, frame: &AudioFrame, actual: usize) {
        self.stats.dropped += 1;
        self.broken = true;
        warn!(
            seq = frame.sequence(),
            expected = self.rate.frame_len(),
            actual,
            "dropping malformed frame"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vad::{ScriptedFactory, VadDecision};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    const RATE: SampleRate = SampleRate::Hz16000;

    fn signals(vad: Option<bool>, energy: f64) -> FrameSignals {
        FrameSignals {
            vad,
            energy,
            dropped: false,
        }
    }

    #[test]
    fn onset_is_a_union_and_interrupt_a_conjunction() {
        let th = 10_000.0;
        // VAD only
        assert!(signals(Some(true), 10.0).onset(th));
        assert!(!signals(Some(true), 10.0).interrupt(th));
        // energy only
        assert!(signals(Some(false), 50_000.0).onset(th));
        assert!(!signals(Some(false), 50_000.0).interrupt(th));
        // both
        assert!(signals(Some(true), 50_000.0).interrupt(th));
        // neither
        assert!(!signals(Some(false), 10.0).onset(th));
    }

    #[test]
    fn energy_only_mode_uses_energy_for_both_policies() {
        let th = 10_000.0;
        assert!(signals(None, 50_000.0).onset(th));
        assert!(signals(None, 50_000.0).interrupt(th));
        assert!(!signals(None, 5_000.0).interrupt(th));
    }

    #[test]
    fn mis_sized_frame_is_dropped_and_counted() {
        let mut analyzer =
            FrameAnalyzer::from_factory(&ScriptedFactory::always(true), RATE, Sensitivity::STRICT);
        let short = AudioFrame::new(vec![20_000; 100], RATE, 0);
        let s = analyzer.analyze(&short);
        assert!(s.dropped);
        assert!(!s.onset(0.0));
        assert!(!s.interrupt(0.0));

        let ok = analyzer.analyze(&AudioFrame::constant(20_000, RATE, 1));
        assert!(ok.interrupt(10_000.0));
        assert_eq!(
            analyzer.stats(),
            AnalyzerStats {
                frames: 2,
                vad_speech: 1,
                dropped: 1,
                resets: 1,
            }
        );
    }

    #[test]
    fn wrong_rate_frame_is_dropped() {
        let mut analyzer = FrameAnalyzer::energy_only(RATE);
        let s = analyzer.analyze(&AudioFrame::constant(20_000, SampleRate::Hz8000, 0));
        assert!(s.dropped);
        assert_eq!(s.vad, None);
    }

    #[test]
    fn failing_factory_degrades_to_energy_only() {
        let analyzer =
            FrameAnalyzer::from_factory(&ScriptedFactory::unavailable(), RATE, Sensitivity::STRICT);
        assert!(!analyzer.has_classifier());
        assert!(analyzer
            .degraded_reason()
            .is_some_and(|r| r.contains("unavailable")));
    }

    struct CountingClassifier {
        resets: Arc<AtomicUsize>,
    }

    impl VoiceActivityClassifier for CountingClassifier {
        fn classify(&mut self, _frame: &AudioFrame) -> Result<VadDecision> {
            Ok(VadDecision::Silence)
        }

        fn reset(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[test]
    fn sequence_gap_resets_the_classifier() {
        let resets = Arc::new(AtomicUsize::new(0));
        let mut analyzer = FrameAnalyzer::with_classifier(
            Ok(Box::new(CountingClassifier {
                resets: Arc::clone(&resets),
            })),
            RATE,
        );
        for seq in [4, 5, 6] {
            analyzer.analyze(&AudioFrame::silent(RATE, seq));
        }
        assert_eq!(resets.load(Ordering::SeqCst), 0);

        analyzer.analyze(&AudioFrame::silent(RATE, 9));
        analyzer.analyze(&AudioFrame::silent(RATE, 10));
        assert_eq!(resets.load(Ordering::SeqCst), 1);
        assert_eq!(analyzer.stats().resets, 1);
    }

    #[test]
    fn energy_only_analyzer_has_nothing_to_reset() {
        let mut analyzer = FrameAnalyzer::energy_only(RATE);
        analyzer.analyze(&AudioFrame::silent(RATE, 0));
        analyzer.analyze(&AudioFrame::silent(RATE, 7));
        assert_eq!(analyzer.stats().resets, 0);
    }
}
