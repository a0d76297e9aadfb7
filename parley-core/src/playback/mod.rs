//! Playback controller: one synthesis engine, one session at a time.
//!
//! ## Lifecycle
//!
//! ```text
//! reserve(text) ──► PlaybackSession ──play()──► tick … tick ──► Completed
//!      │                                  │
//!      └─ EngineBusy if a session exists  └─ stop() ──► halt ──► Cancelled
//! ```
//!
//! The controller is a cheap `Clone` handle. A session holds the engine from
//! `reserve` until it is dropped; dropping releases it on every exit path.
//! `stop` only flips the session's atomic flag, so it is safe from any
//! thread and the playback loop notices it before its next engine tick.

pub mod simulated;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
    Arc,
};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use crate::error::{ParleyError, Result};

pub use simulated::{SimulatedSynthesizer, SynthesisLog};

/// Result of one engine tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisProgress {
    Playing,
    Finished,
}

/// The acoustic engine behind the controller.
///
/// `tick` renders one slice of audio and should return within a few tens of
/// milliseconds: stop requests are only observed between ticks.
pub trait SpeechSynthesizer: Send {
    fn begin(&mut self, text: &str) -> Result<()>;

    fn tick(&mut self) -> Result<SynthesisProgress>;

    /// Abort the current utterance and silence output. Must be idempotent.
    fn halt(&mut self);

    fn name(&self) -> &'static str {
        "synthesizer"
    }
}

/// How a playback session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackOutcome {
    Completed,
    Cancelled,
    /// Cancelled by barge-in.
    Interrupted,
    Failed,
}

const CANCELLED: u8 = 0b01;
const FINISHED: u8 = 0b10;

/// Shared view of one session's flags.
///
/// Cancel and finish share one atomic; whichever lands first wins, and a
/// finished session can no longer be cancelled.
#[derive(Debug, Clone)]
pub struct SessionToken {
    id: u64,
    flags: Arc<AtomicU8>,
}

impl SessionToken {
    fn new(id: u64) -> Self {
        Self {
            id,
            flags: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.flags.load(Ordering::Acquire) & CANCELLED != 0
    }

    /// The session has stopped speaking, on its own or after a stop.
    pub fn is_finished(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FINISHED != 0
    }

    /// Neither cancelled nor finished.
    pub fn is_live(&self) -> bool {
        self.flags.load(Ordering::Acquire) == 0
    }

    /// True only for the call that cancelled a live session.
    fn cancel(&self) -> bool {
        self.flags
            .compare_exchange(0, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark the session finished. Returns whether a stop got there first.
    fn finish(&self) -> bool {
        self.flags.fetch_or(FINISHED, Ordering::AcqRel) & CANCELLED != 0
    }
}

struct PlaybackInner {
    engine: Mutex<Box<dyn SpeechSynthesizer>>,
    busy: AtomicBool,
    active: Mutex<Option<SessionToken>>,
    next_session_id: AtomicU64,
}

#[derive(Clone)]
pub struct PlaybackController {
    inner: Arc<PlaybackInner>,
}

impl PlaybackController {
    pub fn new(engine: Box<dyn SpeechSynthesizer>) -> Self {
        Self {
            inner: Arc::new(PlaybackInner {
                engine: Mutex::new(engine),
                busy: AtomicBool::new(false),
                active: Mutex::new(None),
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    /// Claim the engine for `text` without starting it.
    ///
    /// # Errors
    /// `EngineBusy` immediately if a session exists. The existing session is
    /// not touched.
    pub fn reserve(&self, text: &str) -> Result<PlaybackSession> {
        if self
            .inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("speak rejected: engine busy");
            return Err(ParleyError::EngineBusy);
        }

        let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        let token = SessionToken::new(id);
        *self.inner.active.lock() = Some(token.clone());

        Ok(PlaybackSession {
            inner: Arc::clone(&self.inner),
            token,
            text: text.to_string(),
            started: Instant::now(),
        })
    }

    /// Speak `text`, blocking until it finishes or is stopped.
    pub fn speak(&self, text: &str) -> Result<PlaybackOutcome> {
        self.reserve(text)?.play()
    }

    /// Stop whatever is playing. No-op when idle; safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(token) = self.inner.active.lock().as_ref() {
            if token.cancel() {
                info!(session_id = token.id, "playback stop requested");
            }
        }
    }

    /// Stop only if session `id` is the active one. Returns whether this call
    /// cancelled it.
    pub fn stop_session(&self, id: u64) -> bool {
        match self.inner.active.lock().as_ref() {
            Some(token) if token.id == id => {
                let first = token.cancel();
                if first {
                    info!(session_id = id, "playback stop requested");
                }
                first
            }
            _ => false,
        }
    }

    /// False as soon as a stop has been requested, even before the engine
    /// has acknowledged it.
    pub fn is_playing(&self) -> bool {
        self.inner
            .active
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    pub fn active_session(&self) -> Option<SessionToken> {
        self.inner.active.lock().clone()
    }
}

impl std::fmt::Debug for PlaybackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackController")
            .field("active", &self.active_session().map(|t| t.id))
            .finish_non_exhaustive()
    }
}

/// Exclusive claim on the engine. Dropping it releases the engine.
pub struct PlaybackSession {
    inner: Arc<PlaybackInner>,
    token: SessionToken,
    text: String,
    started: Instant,
}

impl PlaybackSession {
    pub fn id(&self) -> u64 {
        self.token.id
    }

    pub fn token(&self) -> SessionToken {
        self.token.clone()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Drive the engine until the text is spoken or the session is stopped.
    ///
    /// # Errors
    /// `Synthesis` if the engine fails; it is halted first.
    pub fn play(self) -> Result<PlaybackOutcome> {
        let span = info_span!("playback", session_id = self.token.id);
        let _enter = span.enter();

        if self.text.trim().is_empty() {
            debug!("empty text, nothing to speak");
            return Ok(self.settle(PlaybackOutcome::Completed));
        }
        if self.token.is_cancelled() {
            return Ok(PlaybackOutcome::Cancelled);
        }

        let mut engine = self.inner.engine.lock();
        info!(engine = engine.name(), chars = self.text.chars().count(), "speaking");
        if let Err(e) = engine.begin(&self.text) {
            engine.halt();
            return Err(e);
        }

        let mut ticks = 0usize;
        loop {
            if self.token.is_cancelled() {
                engine.halt();
                info!(ticks, elapsed_ms = self.started.elapsed().as_millis() as u64, "playback cancelled");
                return Ok(PlaybackOutcome::Cancelled);
            }
            match engine.tick() {
                Ok(SynthesisProgress::Playing) => ticks += 1,
                Ok(SynthesisProgress::Finished) => {
                    info!(ticks, elapsed_ms = self.started.elapsed().as_millis() as u64, "playback finished");
                    return Ok(self.settle(PlaybackOutcome::Completed));
                }
                Err(e) => {
                    warn!("synthesis failed: {e}");
                    engine.halt();
                    return Err(e);
                }
            }
        }
    }
}

impl PlaybackSession {
    /// `Cancelled` if a stop landed before the session could finish.
    fn settle(&self, outcome: PlaybackOutcome) -> PlaybackOutcome {
        if self.token.finish() {
            PlaybackOutcome::Cancelled
        } else {
            outcome
        }
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.token.finish();
        let mut active = self.inner.active.lock();
        if active.as_ref().is_some_and(|t| t.id == self.token.id) {
            *active = None;
        }
        drop(active);
        self.inner.busy.store(false, Ordering::Release);
    }
}
