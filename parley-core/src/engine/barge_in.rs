//! Barge-in: stop playback when the user talks over it.
//!
//! Runs on its own thread for the life of one playback session and owns the
//! capture device for that time. Fires on VAD **and** energy so background
//! noise that trips only one signal does not cut the reply short.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, info_span, warn};

use crate::audio::FrameSource;
use crate::buffering::frame::AudioFrame;
use crate::error::ParleyError;
use crate::ipc::events::InterruptEvent;
use crate::playback::{PlaybackController, SessionToken};
use crate::vad::{FrameAnalyzer, FrameSignals};

/// Debounced interrupt decision for one playback session.
#[derive(Debug)]
pub struct BargeInMonitor {
    session_id: u64,
    energy_threshold: f64,
    confirm_frames: usize,
    run: usize,
    fired: bool,
}

impl BargeInMonitor {
    pub fn new(session_id: u64, energy_threshold: f64, confirm_frames: usize) -> Self {
        Self {
            session_id,
            energy_threshold,
            confirm_frames: confirm_frames.max(1),
            run: 0,
            fired: false,
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// Returns the session's interrupt the first time `confirm_frames`
    /// consecutive frames satisfy the interrupt policy; `None` ever after.
    pub fn evaluate(&mut self, signals: &FrameSignals) -> Option<InterruptEvent> {
        if self.fired {
            return None;
        }
        if !signals.interrupt(self.energy_threshold) {
            self.run = 0;
            return None;
        }
        self.run += 1;
        if self.run < self.confirm_frames {
            return None;
        }
        self.fired = true;
        Some(InterruptEvent {
            session_id: self.session_id,
            timestamp: Utc::now(),
            energy: signals.energy,
            vad: signals.vad,
        })
    }
}

/// How a watch ended.
#[derive(Debug)]
pub enum WatchOutcome {
    /// The user barged in; playback has already been told to stop.
    Interrupted(InterruptEvent),
    /// The session finished or was cancelled first.
    SessionEnded,
    /// The capture device failed; barge-in is off for the rest of the session.
    DeviceLost(ParleyError),
}

/// Watch `source` until the session ends or the user barges in.
///
/// On firing, stops the session through `playback` before returning, so the
/// caller only has to release the device and update turn state. Speech that
/// arrives after the session has finished or been stopped elsewhere ends the
/// watch without an interrupt.
pub fn watch(
    source: &mut dyn FrameSource,
    analyzer: &mut FrameAnalyzer,
    monitor: &mut BargeInMonitor,
    token: &SessionToken,
    playback: &PlaybackController,
    poll: Duration,
    mut on_frame: impl FnMut(&AudioFrame, &FrameSignals, bool),
) -> WatchOutcome {
    let span = info_span!("barge_in", session_id = token.id());
    let _enter = span.enter();
    let poll = poll.max(Duration::from_millis(1));
    let mut frames = 0usize;

    loop {
        if !token.is_live() {
            debug!(frames, "session over, barge-in watch ends");
            return WatchOutcome::SessionEnded;
        }

        let frame = match source.next_frame(poll) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                warn!("barge-in capture failed: {e}");
                return WatchOutcome::DeviceLost(e);
            }
        };
        frames += 1;

        let signals = analyzer.analyze(&frame);
        let fires = signals.interrupt(monitor.energy_threshold);
        on_frame(&frame, &signals, fires);

        if let Some(event) = monitor.evaluate(&signals) {
            // The reply may have ended while this frame was in flight.
            if !playback.stop_session(token.id()) {
                debug!(frames, "speech after the session ended; not an interrupt");
                return WatchOutcome::SessionEnded;
            }
            info!(
                frames,
                energy = event.energy,
                vad = ?event.vad,
                "barge-in detected"
            );
            return WatchOutcome::Interrupted(event);
        }
    }
}
