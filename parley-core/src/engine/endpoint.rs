//! Listen-cycle endpointing.
//!
//! ```text
//! AwaitingSpeech ──onset──► InSpeech ──25 silent frames──► Trailing ──► Done
//!        │                      │
//!        └──── frame cap / wall-clock cap / cancel ───────────────────► Done
//! ```
//!
//! [`EndpointDetector`] is the pure state machine: it is fed one verdict per
//! frame and never blocks. [`listen`] drives it against a [`FrameSource`]
//! with the absolute wall-clock cap and cooperative cancellation.

use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, info_span};

use super::EngineConfig;
use crate::audio::{wav, FrameSource};
use crate::buffering::frame::{AudioFrame, SampleRate, FRAME_DURATION};
use crate::error::{ParleyError, Result};
use crate::vad::{FrameAnalyzer, FrameSignals};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    AwaitingSpeech,
    InSpeech,
    Trailing,
    Done,
}

/// Why a listen cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Speech followed by the trailing-silence run.
    EndOfSpeech,
    /// The safety cap fired.
    Timeout,
    /// The caller stopped the cycle.
    Cancelled,
}

/// The product of one listen cycle.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Every frame from the start of capture through the trailing silence.
    /// Empty when no speech was heard.
    pub frames: Vec<AudioFrame>,
    pub has_speech: bool,
    /// Sequence of the first speech frame.
    pub start_frame: Option<u64>,
    /// Sequence of the last speech frame.
    pub end_frame: Option<u64>,
    /// Audio duration of `frames`.
    pub duration: Duration,
    /// Wall-clock time the cycle took.
    pub elapsed: Duration,
    pub sample_rate: SampleRate,
    pub completion: Completion,
}

impl Utterance {
    /// Frames with speech in them, first to last (inclusive, by sequence).
    pub fn speech_span(&self) -> Option<RangeInclusive<u64>> {
        Some(self.start_frame?..=self.end_frame?)
    }

    /// All samples, concatenated.
    pub fn pcm(&self) -> Vec<i16> {
        self.frames
            .iter()
            .flat_map(|f| f.samples().iter().copied())
            .collect()
    }

    /// Turn "nothing heard" into an error for callers that want one.
    pub fn require_speech(self) -> Result<Self> {
        if self.has_speech {
            Ok(self)
        } else {
            Err(ParleyError::ListenTimeout {
                waited: self.elapsed,
            })
        }
    }

    pub fn write_wav(&self, path: &Path) -> Result<()> {
        wav::write_pcm(path, self.sample_rate, &self.pcm())
    }
}

pub struct EndpointDetector {
    state: EndpointState,
    rate: SampleRate,
    silence_frames: usize,
    max_frames: usize,
    pre_roll: Vec<AudioFrame>,
    frames: Vec<AudioFrame>,
    silence_run: usize,
    seen: usize,
    start_frame: Option<u64>,
    end_frame: Option<u64>,
}

impl EndpointDetector {
    pub fn new(rate: SampleRate, silence_frames: usize, max_frames: usize) -> Self {
        Self {
            state: EndpointState::AwaitingSpeech,
            rate,
            silence_frames: silence_frames.max(1),
            max_frames: max_frames.max(1),
            pre_roll: Vec::new(),
            frames: Vec::new(),
            silence_run: 0,
            seen: 0,
            start_frame: None,
            end_frame: None,
        }
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    /// Frames consumed so far, including dropped ones.
    pub fn frames_seen(&self) -> usize {
        self.seen
    }

    /// Feed one classified frame. Returns `Some` exactly once, on the frame
    /// that completes the cycle.
    pub fn push(&mut self, frame: AudioFrame, is_speech: bool) -> Option<Completion> {
        self.step(Some(frame), is_speech)
    }

    /// Account for a frame that was dropped as malformed: it counts as
    /// silence and toward the frame cap but is not stored.
    pub fn push_dropped(&mut self) -> Option<Completion> {
        self.step(None, false)
    }

    fn step(&mut self, frame: Option<AudioFrame>, is_speech: bool) -> Option<Completion> {
        if self.state == EndpointState::Done {
            return None;
        }
        self.seen += 1;

        match (self.state, frame) {
            (EndpointState::AwaitingSpeech, Some(frame)) if is_speech => {
                let seq = frame.sequence();
                self.frames = std::mem::take(&mut self.pre_roll);
                self.frames.push(frame);
                self.start_frame = Some(seq);
                self.end_frame = Some(seq);
                self.silence_run = 0;
                self.state = EndpointState::InSpeech;
                debug!(seq, "speech onset");
            }
            (EndpointState::AwaitingSpeech, Some(frame)) => self.pre_roll.push(frame),
            (EndpointState::InSpeech, frame) => {
                if let Some(frame) = frame {
                    if is_speech {
                        self.end_frame = Some(frame.sequence());
                    }
                    self.frames.push(frame);
                }
                if is_speech {
                    self.silence_run = 0;
                } else {
                    self.silence_run += 1;
                    if self.silence_run >= self.silence_frames {
                        self.state = EndpointState::Trailing;
                    }
                }
            }
            _ => {}
        }

        if self.state == EndpointState::Trailing {
            self.state = EndpointState::Done;
            return Some(Completion::EndOfSpeech);
        }
        if self.seen >= self.max_frames {
            self.state = EndpointState::Done;
            return Some(Completion::Timeout);
        }
        None
    }

    /// Close the cycle. Without speech the utterance carries no frames.
    pub fn finish(self, completion: Completion, elapsed: Duration) -> Utterance {
        let has_speech = self.start_frame.is_some();
        let frames = if has_speech { self.frames } else { Vec::new() };
        Utterance {
            duration: FRAME_DURATION * frames.len() as u32,
            frames,
            has_speech,
            start_frame: self.start_frame,
            end_frame: self.end_frame,
            elapsed,
            sample_rate: self.rate,
            completion,
        }
    }
}

/// Run one listen cycle to completion.
///
/// `on_frame` sees every analysed frame with its onset verdict (for activity
/// events). Only a failing device ends the cycle with an error.
pub fn listen(
    source: &mut dyn FrameSource,
    analyzer: &mut FrameAnalyzer,
    config: &EngineConfig,
    cancel: &AtomicBool,
    mut on_frame: impl FnMut(&AudioFrame, &FrameSignals, bool),
) -> Result<Utterance> {
    let span = info_span!("listen", rate = source.sample_rate().hz());
    let _enter = span.enter();

    let started = Instant::now();
    let poll = config.frame_poll.max(Duration::from_millis(1));
    let mut detector = EndpointDetector::new(
        source.sample_rate(),
        config.silence_frames,
        config.max_listen_frames(),
    );

    let completion = loop {
        if cancel.load(Ordering::Acquire) {
            break Completion::Cancelled;
        }
        let elapsed = started.elapsed();
        if elapsed >= config.max_listen {
            break Completion::Timeout;
        }

        let Some(frame) = source.next_frame((config.max_listen - elapsed).min(poll))? else {
            continue;
        };

        let signals = analyzer.analyze(&frame);
        let is_speech = signals.onset(config.listen_energy_threshold);
        on_frame(&frame, &signals, is_speech);

        let done = if signals.dropped {
            detector.push_dropped()
        } else {
            detector.push(frame, is_speech)
        };
        if let Some(completion) = done {
            break completion;
        }
    };

    let seen = detector.frames_seen();
    let utterance = detector.finish(completion, started.elapsed());
    info!(
        reason = ?utterance.completion,
        has_speech = utterance.has_speech,
        frames = utterance.frames.len(),
        seen,
        "listen cycle complete"
    );
    Ok(utterance)
}
