use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

/// Counters shared by the listen, playback and barge-in threads.
#[derive(Default)]
pub struct TurnDiagnostics {
    pub listen_cycles: AtomicUsize,
    pub utterances: AtomicUsize,
    pub listen_timeouts: AtomicUsize,
    pub frames_analyzed: AtomicUsize,
    pub vad_speech: AtomicUsize,
    pub frames_dropped: AtomicUsize,
    pub classifier_resets: AtomicUsize,
    pub degraded_sessions: AtomicUsize,
    pub sessions_started: AtomicUsize,
    pub sessions_completed: AtomicUsize,
    pub sessions_cancelled: AtomicUsize,
    pub sessions_failed: AtomicUsize,
    pub interrupts: AtomicUsize,
    pub busy_rejections: AtomicUsize,
    pub capture_conflicts: AtomicUsize,
}

impl TurnDiagnostics {
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            listen_cycles: self.listen_cycles.load(Ordering::Relaxed),
            utterances: self.utterances.load(Ordering::Relaxed),
            listen_timeouts: self.listen_timeouts.load(Ordering::Relaxed),
            frames_analyzed: self.frames_analyzed.load(Ordering::Relaxed),
            vad_speech: self.vad_speech.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            classifier_resets: self.classifier_resets.load(Ordering::Relaxed),
            degraded_sessions: self.degraded_sessions.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_cancelled: self.sessions_cancelled.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            busy_rejections: self.busy_rejections.load(Ordering::Relaxed),
            capture_conflicts: self.capture_conflicts.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn counters(&self) -> [&AtomicUsize; 15] {
        [
            &self.listen_cycles,
            &self.utterances,
            &self.listen_timeouts,
            &self.frames_analyzed,
            &self.vad_speech,
            &self.frames_dropped,
            &self.classifier_resets,
            &self.degraded_sessions,
            &self.sessions_started,
            &self.sessions_completed,
            &self.sessions_cancelled,
            &self.sessions_failed,
            &self.interrupts,
            &self.busy_rejections,
            &self.capture_conflicts,
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub listen_cycles: usize,
    pub utterances: usize,
    pub listen_timeouts: usize,
    pub frames_analyzed: usize,
    pub vad_speech: usize,
    pub frames_dropped: usize,
    /// Times a speech classifier was reset after a gap in the frame stream.
    pub classifier_resets: usize,
    /// Capture sessions that ran without a speech classifier.
    pub degraded_sessions: usize,
    pub sessions_started: usize,
    pub sessions_completed: usize,
    pub sessions_cancelled: usize,
    pub sessions_failed: usize,
    pub interrupts: usize,
    pub busy_rejections: usize,
    /// Capture opens refused because another session held the device.
    pub capture_conflicts: usize,
}
