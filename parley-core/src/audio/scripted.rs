//! Deterministic frame sources for tests, demos and offline runs.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{CaptureDevice, FrameSource};
use crate::buffering::frame::{AudioFrame, SampleRate};
use crate::error::{ParleyError, Result};

/// What a scripted source does once its frames run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptEnd {
    /// Keep yielding silent frames, like a quiet room.
    Silence,
    /// Yield nothing at all, like a stalled driver.
    Stall,
    /// Report the device as gone.
    Close,
}

/// Build one constant-amplitude frame per entry of `levels`, numbered from 0.
pub fn frames_from_levels(rate: SampleRate, levels: &[i16]) -> Vec<AudioFrame> {
    levels
        .iter()
        .enumerate()
        .map(|(i, &level)| AudioFrame::constant(level, rate, i as u64))
        .collect()
}

/// Replays a fixed list of frames.
pub struct ScriptedSource {
    frames: VecDeque<AudioFrame>,
    rate: SampleRate,
    pacer: Pacer,
    end: ScriptEnd,
    next_sequence: u64,
    _handle: Option<OpenHandle>,
}

impl ScriptedSource {
    pub fn new(rate: SampleRate, frames: Vec<AudioFrame>) -> Self {
        let next_sequence = frames.last().map(|f| f.sequence() + 1).unwrap_or(0);
        Self {
            frames: frames.into(),
            rate,
            pacer: Pacer::default(),
            end: ScriptEnd::Silence,
            next_sequence,
            _handle: None,
        }
    }

    /// A source that never yields a frame.
    pub fn stalled(rate: SampleRate) -> Self {
        Self::new(rate, Vec::new()).ending_with(ScriptEnd::Stall)
    }

    /// Deliver one frame per `pace` instead of as fast as asked.
    pub fn paced(mut self, pace: Duration) -> Self {
        self.pacer = Pacer::new(pace);
        self
    }

    pub fn ending_with(mut self, end: ScriptEnd) -> Self {
        self.end = end;
        self
    }

    fn tracked(mut self, handle: OpenHandle) -> Self {
        self._handle = Some(handle);
        self
    }
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<AudioFrame>> {
        if self.frames.is_empty() {
            match self.end {
                ScriptEnd::Silence => {}
                ScriptEnd::Stall => {
                    std::thread::sleep(timeout);
                    return Ok(None);
                }
                ScriptEnd::Close => {
                    return Err(ParleyError::DeviceUnavailable("script exhausted".into()))
                }
            }
        }

        if !self.pacer.wait(timeout) {
            return Ok(None);
        }

        let frame = match self.frames.pop_front() {
            Some(frame) => frame,
            None => {
                let seq = self.next_sequence;
                self.next_sequence += 1;
                AudioFrame::silent(self.rate, seq)
            }
        };
        Ok(Some(frame))
    }

    fn sample_rate(&self) -> SampleRate {
        self.rate
    }
}

/// Releases one frame per `pace`, starting immediately.
#[derive(Debug, Default)]
pub(crate) struct Pacer {
    pace: Option<Duration>,
    next_due: Option<Instant>,
}

impl Pacer {
    pub(crate) fn new(pace: Duration) -> Self {
        Self {
            pace: Some(pace),
            next_due: None,
        }
    }

    /// Sleep until the next frame is due. False if that is further away
    /// than `timeout`, after sleeping for `timeout`.
    pub(crate) fn wait(&mut self, timeout: Duration) -> bool {
        let Some(pace) = self.pace else {
            return true;
        };
        let now = Instant::now();
        let due = *self.next_due.get_or_insert(now);
        if due > now {
            let wait = due - now;
            if wait > timeout {
                std::thread::sleep(timeout);
                return false;
            }
            std::thread::sleep(wait);
        }
        self.next_due = Some(due + pace);
        true
    }
}

/// Decrements the device's open count when the source is dropped.
struct OpenHandle {
    open: Arc<AtomicUsize>,
}

impl Drop for OpenHandle {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A capture device that hands out one scripted session per `open`, and
/// records how many sessions were open at once.
pub struct ScriptedDevice {
    rate: SampleRate,
    sessions: Mutex<VecDeque<Vec<AudioFrame>>>,
    pace: Option<Duration>,
    end: ScriptEnd,
    fail_opens: bool,
    open: Arc<AtomicUsize>,
    max_open: AtomicUsize,
    total_opens: AtomicUsize,
}

impl ScriptedDevice {
    pub fn new(rate: SampleRate) -> Self {
        Self {
            rate,
            sessions: Mutex::new(VecDeque::new()),
            pace: None,
            end: ScriptEnd::Silence,
            fail_opens: false,
            open: Arc::new(AtomicUsize::new(0)),
            max_open: AtomicUsize::new(0),
            total_opens: AtomicUsize::new(0),
        }
    }

    /// A device whose every `open` fails with `DeviceUnavailable`.
    pub fn unavailable(rate: SampleRate) -> Self {
        let mut device = Self::new(rate);
        device.fail_opens = true;
        device
    }

    /// Queue the frames the next `open` will replay. Sessions past the end of
    /// the queue replay nothing and then follow the configured `ScriptEnd`.
    pub fn with_session(self, frames: Vec<AudioFrame>) -> Self {
        self.sessions.lock().push_back(frames);
        self
    }

    pub fn paced(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    pub fn ending_with(mut self, end: ScriptEnd) -> Self {
        self.end = end;
        self
    }

    /// Sessions currently open.
    pub fn open_handles(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Highest number of sessions ever open at the same time.
    pub fn max_concurrent_opens(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    pub fn total_opens(&self) -> usize {
        self.total_opens.load(Ordering::SeqCst)
    }
}

impl CaptureDevice for ScriptedDevice {
    fn open(&self) -> Result<Box<dyn FrameSource>> {
        if self.fail_opens {
            return Err(ParleyError::DeviceUnavailable("scripted device offline".into()));
        }
        let now_open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(now_open, Ordering::SeqCst);
        self.total_opens.fetch_add(1, Ordering::SeqCst);

        let frames = self.sessions.lock().pop_front().unwrap_or_default();
        let mut source = ScriptedSource::new(self.rate, frames)
            .ending_with(self.end)
            .tracked(OpenHandle {
                open: Arc::clone(&self.open),
            });
        if let Some(pace) = self.pace {
            source = source.paced(pace);
        }
        Ok(Box::new(source))
    }

    fn name(&self) -> String {
        "scripted device".into()
    }
}
