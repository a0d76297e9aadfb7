//! `TurnCoordinator`: who talks when.
//!
//! ## Turn cycle
//!
//! ```text
//!            run_listen_cycle                 begin_speaking
//!   Idle ─────────────────────► Listening ──► Processing ──────────► Speaking
//!    ▲  ◄── no speech / cancel ──┘    ▲           │ empty result         │
//!    │  ◄────────────────────────────────────────┘                       │
//!    │  ◄───────────────────── playback done / cancelled ───────────────┤
//!    │                                  └──────────── barge-in ─────────┘
//!    └──── begin_speaking (unsolicited, e.g. a welcome line) ──► Speaking
//! ```
//!
//! Every transition is committed under one `parking_lot::Mutex`, so they are
//! totally ordered. Barge-in is the only edge taken off the caller's thread.
//!
//! ## Threading
//!
//! - **Listen cycles** run on the caller's thread and own the capture device
//!   for their duration.
//! - **`begin_speaking`** spawns a playback thread and a barge-in thread. The
//!   barge-in thread owns the capture device while the reply plays; it drops
//!   the device before moving the turn to `Listening`, so the next listen
//!   cycle can never overlap it.
//! - Speech classifiers are created on the thread that uses them (libfvad
//!   handles are `!Send`).

pub mod barge_in;
pub mod diagnostics;
pub mod endpoint;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{CaptureDevice, FrameSource},
    backends::{DialogueBackend, Transcriber},
    buffering::frame::{AudioFrame, SampleRate, FRAME_MS},
    error::{ParleyError, Result},
    ipc::events::{AudioActivityEvent, InterruptEvent, TurnStateEvent},
    playback::{PlaybackController, PlaybackOutcome, PlaybackSession, SessionToken, SpeechSynthesizer},
    vad::{ClassifierFactory, FrameAnalyzer, FrameSignals, Sensitivity},
};

pub use barge_in::{BargeInMonitor, WatchOutcome};
pub use diagnostics::{DiagnosticsSnapshot, TurnDiagnostics};
pub use endpoint::{Completion, EndpointDetector, EndpointState, Utterance};
pub use crate::ipc::events::TurnState;

/// Broadcast channel capacity: 256 events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// How long `cancel_speaking` waits for the playback thread to settle.
const CANCEL_SETTLE: Duration = Duration::from_secs(2);

/// Configuration for `TurnCoordinator`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rate every frame is captured and classified at. Default: 16 kHz.
    pub sample_rate: SampleRate,
    /// Classifier strictness, 0–3. Default: 3.
    pub vad_sensitivity: Sensitivity,
    /// Mean-square energy that counts as speech onset on its own while
    /// listening. Default: 250 000 (a mean absolute level of about 500).
    pub listen_energy_threshold: f64,
    /// Mean-square energy that must accompany a VAD verdict to barge in.
    /// Default: 10 000.
    pub interrupt_energy_threshold: f64,
    /// Consecutive non-speech frames that end an utterance. Default: 25
    /// (750 ms).
    pub silence_frames: usize,
    /// Absolute cap on one listen cycle. Default: 30 s.
    #[serde(with = "duration_ms")]
    pub max_listen: Duration,
    /// Consecutive qualifying frames before barge-in fires. Default: 1.
    pub barge_in_confirm_frames: usize,
    /// Longest single wait for a frame; bounds how quickly cancellation is
    /// noticed. Default: 30 ms.
    #[serde(with = "duration_ms")]
    pub frame_poll: Duration,
    /// Input device name; `None` selects the system default.
    pub preferred_input_device: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: SampleRate::Hz16000,
            vad_sensitivity: Sensitivity::STRICT,
            listen_energy_threshold: 250_000.0,
            interrupt_energy_threshold: 10_000.0,
            silence_frames: 25,
            max_listen: Duration::from_secs(30),
            barge_in_confirm_frames: 1,
            frame_poll: Duration::from_millis(FRAME_MS),
            preferred_input_device: None,
        }
    }
}

impl EngineConfig {
    /// Frame-count equivalent of `max_listen`.
    pub fn max_listen_frames(&self) -> usize {
        ((self.max_listen.as_millis() / FRAME_MS as u128) as usize).max(1)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// What one call to [`TurnCoordinator::take_turn`] amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The listen cycle heard no speech.
    NothingHeard,
    /// Speech was captured but transcribed to nothing.
    Unrecognized,
    /// The dialogue backend had no reply.
    Unanswered { transcript: String },
    Answered {
        transcript: String,
        reply: String,
        playback: PlaybackOutcome,
    },
}

type InterruptHandler = Arc<dyn Fn(&InterruptEvent) + Send + Sync>;

#[derive(Debug)]
struct TurnCell {
    state: TurnState,
    /// Cancel flag of the running listen cycle.
    listening: Option<Arc<AtomicBool>>,
    /// Session that owns the `Speaking` state.
    speaking: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureOwner {
    Listen,
    BargeIn(u64),
}

/// Records who holds the capture device. A second claim is refused rather
/// than waited for.
struct CaptureRegistry {
    owner: Mutex<Option<CaptureOwner>>,
}

impl CaptureRegistry {
    fn acquire(&self, who: CaptureOwner) -> std::result::Result<CaptureLease<'_>, CaptureOwner> {
        let mut owner = self.owner.lock();
        if let Some(current) = *owner {
            return Err(current);
        }
        *owner = Some(who);
        Ok(CaptureLease { registry: self })
    }
}

struct CaptureLease<'a> {
    registry: &'a CaptureRegistry,
}

impl Drop for CaptureLease<'_> {
    fn drop(&mut self) {
        *self.registry.owner.lock() = None;
    }
}

/// An open device plus its lease. Fields drop in order: the device closes
/// before the lease is given back.
struct CaptureSession<'a> {
    source: Box<dyn FrameSource>,
    _lease: CaptureLease<'a>,
}

struct Shared {
    config: EngineConfig,
    device: Arc<dyn CaptureDevice>,
    classifiers: Arc<dyn ClassifierFactory>,
    playback: PlaybackController,
    turn: Mutex<TurnCell>,
    turn_changed: Condvar,
    capture: CaptureRegistry,
    interrupt_handlers: Mutex<Vec<InterruptHandler>>,
    state_tx: broadcast::Sender<TurnStateEvent>,
    interrupt_tx: broadcast::Sender<InterruptEvent>,
    activity_tx: broadcast::Sender<AudioActivityEvent>,
    state_seq: AtomicU64,
    activity_seq: AtomicU64,
    classifier_warned: AtomicBool,
    diagnostics: TurnDiagnostics,
}

/// The engine handle.
///
/// Cheap to clone; clones share one turn state, one capture device and one
/// playback controller.
#[derive(Clone)]
pub struct TurnCoordinator {
    shared: Arc<Shared>,
}

impl TurnCoordinator {
    pub fn new(
        config: EngineConfig,
        device: Arc<dyn CaptureDevice>,
        classifiers: Arc<dyn ClassifierFactory>,
        synthesizer: Box<dyn SpeechSynthesizer>,
    ) -> Self {
        let (state_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (interrupt_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);

        info!(
            device = device.name().as_str(),
            rate = config.sample_rate.hz(),
            sensitivity = config.vad_sensitivity.level(),
            "turn coordinator ready"
        );

        Self {
            shared: Arc::new(Shared {
                config,
                device,
                classifiers,
                playback: PlaybackController::new(synthesizer),
                turn: Mutex::new(TurnCell {
                    state: TurnState::Idle,
                    listening: None,
                    speaking: None,
                }),
                turn_changed: Condvar::new(),
                capture: CaptureRegistry {
                    owner: Mutex::new(None),
                },
                interrupt_handlers: Mutex::new(Vec::new()),
                state_tx,
                interrupt_tx,
                activity_tx,
                state_seq: AtomicU64::new(0),
                activity_seq: AtomicU64::new(0),
                classifier_warned: AtomicBool::new(false),
                diagnostics: TurnDiagnostics::default(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn current_turn_state(&self) -> TurnState {
        self.shared.turn.lock().state
    }

    /// True while a reply is playing and no stop has been requested.
    pub fn is_playing(&self) -> bool {
        self.shared.playback.is_playing()
    }

    /// Flags of the reply currently playing, if any.
    pub fn active_session(&self) -> Option<SessionToken> {
        self.shared.playback.active_session()
    }

    /// Request a stop without waiting for the turn to settle. Idempotent.
    /// Replies can only be started through [`begin_speaking`](Self::begin_speaking).
    pub fn stop_playback(&self) {
        self.shared.playback.stop();
    }

    // ── Listening ────────────────────────────────────────────────────────

    /// Capture one utterance.
    ///
    /// Allowed from `Idle`, or from `Listening` entered by barge-in. Ends in
    /// `Processing` when speech was heard, otherwise back in `Idle`. The
    /// capture device is closed before this returns.
    ///
    /// # Errors
    /// - `InvalidTransition` while processing or speaking, or if another
    ///   cycle is already running.
    /// - `DeviceUnavailable` if the device cannot be opened or fails.
    pub fn run_listen_cycle(&self) -> Result<Utterance> {
        let shared = &self.shared;
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut cell = shared.turn.lock();
            match (cell.state, cell.listening.is_some()) {
                (TurnState::Idle, _) => shared.transition(&mut cell, TurnState::Listening),
                (TurnState::Listening, false) => {}
                (from, _) => {
                    return Err(ParleyError::InvalidTransition {
                        from,
                        to: TurnState::Listening,
                    })
                }
            }
            cell.listening = Some(Arc::clone(&cancel));
        }

        TurnDiagnostics::bump(&shared.diagnostics.listen_cycles);
        let result = shared.listen(&cancel);

        let mut cell = shared.turn.lock();
        cell.listening = None;
        match &result {
            Ok(utterance) if utterance.has_speech => {
                TurnDiagnostics::bump(&shared.diagnostics.utterances);
                shared.transition(&mut cell, TurnState::Processing);
            }
            Ok(utterance) => {
                if utterance.completion == Completion::Timeout {
                    TurnDiagnostics::bump(&shared.diagnostics.listen_timeouts);
                }
                shared.transition(&mut cell, TurnState::Idle);
            }
            Err(e) => {
                warn!("listen cycle failed: {e}");
                shared.transition(&mut cell, TurnState::Idle);
            }
        }
        result
    }

    /// Stop the running listen cycle (it returns what it has so far), or
    /// leave a post-barge-in `Listening` state for `Idle`. Returns whether
    /// anything was cancelled.
    pub fn cancel_listening(&self) -> bool {
        let shared = &self.shared;
        let mut cell = shared.turn.lock();
        if let Some(flag) = cell.listening.as_ref() {
            flag.store(true, Ordering::Release);
            info!("listen cycle cancel requested");
            return true;
        }
        if cell.state == TurnState::Listening {
            shared.transition(&mut cell, TurnState::Idle);
            return true;
        }
        false
    }

    /// Close a `Processing` turn without speaking (empty transcript or
    /// reply, or the caller gave up).
    pub fn finish_processing(&self) -> Result<()> {
        let shared = &self.shared;
        let mut cell = shared.turn.lock();
        shared.expect_state(&cell, &[TurnState::Processing], TurnState::Idle)?;
        shared.transition(&mut cell, TurnState::Idle);
        Ok(())
    }

    // ── Speaking ─────────────────────────────────────────────────────────

    /// Start speaking `text` in the background with barge-in armed.
    ///
    /// Allowed from `Processing` (a reply) or `Idle` (unsolicited speech).
    ///
    /// # Errors
    /// - `EngineBusy` if a playback session is active; nothing changes.
    /// - `InvalidTransition` from `Listening` or `Speaking`.
    pub fn begin_speaking(&self, text: &str) -> Result<SessionHandle> {
        let shared = &self.shared;
        let session = {
            let mut cell = shared.turn.lock();
            let session = match shared.playback.reserve(text) {
                Ok(session) => session,
                Err(e) => {
                    TurnDiagnostics::bump(&shared.diagnostics.busy_rejections);
                    return Err(e);
                }
            };
            // The reservation is dropped on the error path, releasing the engine.
            shared.expect_state(
                &cell,
                &[TurnState::Processing, TurnState::Idle],
                TurnState::Speaking,
            )?;
            shared.transition(&mut cell, TurnState::Speaking);
            cell.speaking = Some(session.id());
            session
        };
        TurnDiagnostics::bump(&shared.diagnostics.sessions_started);

        let token = session.token();
        let (outcome_tx, outcome_rx) = bounded::<PlaybackOutcome>(1);

        let monitor = {
            let shared = Arc::clone(shared);
            let token = token.clone();
            std::thread::Builder::new()
                .name("parley-barge-in".into())
                .spawn(move || shared.run_barge_in(&token))
        };
        let monitor = match monitor {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("failed to spawn barge-in thread, interrupts disabled: {e}");
                None
            }
        };

        let player = {
            let shared = Arc::clone(shared);
            std::thread::Builder::new()
                .name("parley-playback".into())
                .spawn(move || {
                    let outcome = shared.run_playback(session, monitor);
                    let _ = outcome_tx.send(outcome);
                })
        };
        if let Err(e) = player {
            // The closure, and with it the session, was dropped: the engine
            // is free again and the monitor sees a finished token.
            error!("failed to spawn playback thread: {e}");
            let mut cell = shared.turn.lock();
            if cell.speaking == Some(token.id()) {
                cell.speaking = None;
                shared.transition(&mut cell, TurnState::Idle);
            }
            return Err(ParleyError::Other(anyhow::anyhow!(
                "playback thread failed to start: {e}"
            )));
        }

        Ok(SessionHandle {
            token,
            playback: shared.playback.clone(),
            outcome: outcome_rx,
            settled: None,
        })
    }

    /// Stop the current reply and wait (briefly) until the turn has left
    /// `Speaking`. No-op when nothing is playing.
    pub fn cancel_speaking(&self) -> bool {
        let shared = &self.shared;
        let mut cell = shared.turn.lock();
        let Some(id) = cell.speaking else {
            drop(cell);
            shared.playback.stop();
            return false;
        };
        shared.playback.stop_session(id);

        let deadline = Instant::now() + CANCEL_SETTLE;
        while cell.speaking == Some(id) {
            if shared.turn_changed.wait_until(&mut cell, deadline).timed_out() {
                warn!(session_id = id, "playback did not settle after cancel");
                break;
            }
        }
        true
    }

    // ── Whole turn ───────────────────────────────────────────────────────

    /// Listen, transcribe, reply and speak the reply, waiting for playback
    /// to end. After a barge-in the coordinator is left in `Listening`, so
    /// the next call hears the interruption.
    pub fn take_turn(
        &self,
        transcriber: &mut dyn Transcriber,
        dialogue: &mut dyn DialogueBackend,
    ) -> Result<TurnOutcome> {
        let utterance = self.run_listen_cycle()?;
        if !utterance.has_speech {
            return Ok(TurnOutcome::NothingHeard);
        }

        let transcript = transcriber
            .transcribe(&utterance.frames, utterance.sample_rate)
            .trim()
            .to_string();
        drop(utterance);
        if transcript.is_empty() {
            self.finish_processing()?;
            return Ok(TurnOutcome::Unrecognized);
        }
        info!(transcript = transcript.as_str(), "heard");

        let reply = dialogue.generate_reply(&transcript, None).trim().to_string();
        if reply.is_empty() {
            self.finish_processing()?;
            return Ok(TurnOutcome::Unanswered { transcript });
        }

        let handle = match self.begin_speaking(&reply) {
            Ok(handle) => handle,
            Err(e) => {
                // Still Processing: give the turn back before reporting.
                let _ = self.finish_processing();
                return Err(e);
            }
        };
        let playback = handle.wait();
        Ok(TurnOutcome::Answered {
            transcript,
            reply,
            playback,
        })
    }

    // ── Observers ────────────────────────────────────────────────────────

    /// Register a handler run on the barge-in thread, once per interrupted
    /// session, after the turn has moved to `Listening`.
    pub fn on_interrupt(&self, handler: impl Fn(&InterruptEvent) + Send + Sync + 'static) {
        self.shared.interrupt_handlers.lock().push(Arc::new(handler));
    }

    pub fn subscribe_states(&self) -> broadcast::Receiver<TurnStateEvent> {
        self.shared.state_tx.subscribe()
    }

    pub fn subscribe_interrupts(&self) -> broadcast::Receiver<InterruptEvent> {
        self.shared.interrupt_tx.subscribe()
    }

    /// Per-frame energy and verdicts while the capture device is open.
    pub fn subscribe_activity(&self) -> broadcast::Receiver<AudioActivityEvent> {
        self.shared.activity_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics.snapshot()
    }

    pub fn reset_diagnostics(&self) {
        self.shared.diagnostics.reset();
    }
}

impl std::fmt::Debug for TurnCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnCoordinator")
            .field("state", &self.current_turn_state())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Shared {
    /// Commit a transition and publish it. Callers hold the turn lock and
    /// have already checked the edge is legal.
    fn transition(&self, cell: &mut MutexGuard<'_, TurnCell>, to: TurnState) {
        let from = cell.state;
        cell.state = to;
        let seq = self.state_seq.fetch_add(1, Ordering::SeqCst);
        info!(seq, ?from, ?to, "turn state");
        let _ = self.state_tx.send(TurnStateEvent { seq, from, to });
        self.turn_changed.notify_all();
    }

    fn expect_state(&self, cell: &TurnCell, allowed: &[TurnState], to: TurnState) -> Result<()> {
        if allowed.contains(&cell.state) {
            Ok(())
        } else {
            Err(ParleyError::InvalidTransition {
                from: cell.state,
                to,
            })
        }
    }

    fn open_capture(&self, who: CaptureOwner) -> Result<CaptureSession<'_>> {
        let lease = self.capture.acquire(who).map_err(|holder| {
            TurnDiagnostics::bump(&self.diagnostics.capture_conflicts);
            ParleyError::DeviceUnavailable(format!("capture device held by {holder:?}"))
        })?;
        let source = self.device.open()?;
        Ok(CaptureSession {
            source,
            _lease: lease,
        })
    }

    /// Build the analyzer for a capture session on the current thread.
    fn analyzer(&self, rate: SampleRate) -> FrameAnalyzer {
        let analyzer =
            FrameAnalyzer::from_factory(self.classifiers.as_ref(), rate, self.config.vad_sensitivity);
        if let Some(reason) = analyzer.degraded_reason() {
            TurnDiagnostics::bump(&self.diagnostics.degraded_sessions);
            if !self.classifier_warned.swap(true, Ordering::Relaxed) {
                warn!("{reason}; continuing with energy-only detection");
            }
        }
        analyzer
    }

    fn publish_frame(&self, signals: &FrameSignals, is_speech: bool) {
        let seq = self.activity_seq.fetch_add(1, Ordering::Relaxed);
        let _ = self.activity_tx.send(AudioActivityEvent {
            seq,
            energy: signals.energy,
            is_speech,
        });
    }

    fn record_stats(&self, analyzer: &FrameAnalyzer) {
        let stats = analyzer.stats();
        let d = &self.diagnostics;
        TurnDiagnostics::add(&d.frames_analyzed, stats.frames);
        TurnDiagnostics::add(&d.vad_speech, stats.vad_speech);
        TurnDiagnostics::add(&d.frames_dropped, stats.dropped);
        TurnDiagnostics::add(&d.classifier_resets, stats.resets);
    }

    fn listen(&self, cancel: &AtomicBool) -> Result<Utterance> {
        let mut capture = self.open_capture(CaptureOwner::Listen)?;
        let mut analyzer = self.analyzer(capture.source.sample_rate());

        let result = endpoint::listen(
            capture.source.as_mut(),
            &mut analyzer,
            &self.config,
            cancel,
            |_: &AudioFrame, signals, is_speech| self.publish_frame(signals, is_speech),
        );

        // Close the device before anyone sees the utterance.
        drop(capture);
        self.record_stats(&analyzer);
        result
    }

    /// Body of the barge-in thread.
    fn run_barge_in(&self, token: &SessionToken) -> Option<InterruptEvent> {
        let id = token.id();
        let mut capture = match self.open_capture(CaptureOwner::BargeIn(id)) {
            Ok(capture) => capture,
            Err(e) => {
                warn!(session_id = id, "barge-in disabled for this reply: {e}");
                return None;
            }
        };
        let mut analyzer = self.analyzer(capture.source.sample_rate());
        let mut monitor = BargeInMonitor::new(
            id,
            self.config.interrupt_energy_threshold,
            self.config.barge_in_confirm_frames,
        );

        let outcome = barge_in::watch(
            capture.source.as_mut(),
            &mut analyzer,
            &mut monitor,
            token,
            &self.playback,
            self.config.frame_poll,
            |_: &AudioFrame, signals, fires| self.publish_frame(signals, fires),
        );

        // Release the microphone before the turn can move to Listening.
        drop(capture);
        self.record_stats(&analyzer);

        let WatchOutcome::Interrupted(event) = outcome else {
            return None;
        };

        {
            let mut cell = self.turn.lock();
            if cell.state == TurnState::Speaking && cell.speaking == Some(id) {
                cell.speaking = None;
                self.transition(&mut cell, TurnState::Listening);
            } else {
                debug!(session_id = id, "turn already moved on; interrupt not applied");
                return None;
            }
        }

        TurnDiagnostics::bump(&self.diagnostics.interrupts);
        let _ = self.interrupt_tx.send(event.clone());
        // Handlers run unlocked so they may register more handlers.
        let handlers: Vec<InterruptHandler> = self.interrupt_handlers.lock().clone();
        for handler in &handlers {
            handler(&event);
        }
        Some(event)
    }

    /// Body of the playback thread.
    fn run_playback(
        &self,
        session: PlaybackSession,
        monitor: Option<JoinHandle<Option<InterruptEvent>>>,
    ) -> PlaybackOutcome {
        let id = session.id();
        let played = session.play();

        let interrupted = match monitor.map(JoinHandle::join) {
            Some(Ok(event)) => event.is_some(),
            Some(Err(_)) => {
                error!(session_id = id, "barge-in thread panicked");
                false
            }
            None => false,
        };

        let outcome = match played {
            _ if interrupted => PlaybackOutcome::Interrupted,
            Ok(outcome) => outcome,
            Err(e) => {
                error!(session_id = id, "playback failed: {e}");
                PlaybackOutcome::Failed
            }
        };
        let d = &self.diagnostics;
        match outcome {
            PlaybackOutcome::Completed => TurnDiagnostics::bump(&d.sessions_completed),
            PlaybackOutcome::Cancelled => TurnDiagnostics::bump(&d.sessions_cancelled),
            PlaybackOutcome::Failed => TurnDiagnostics::bump(&d.sessions_failed),
            PlaybackOutcome::Interrupted => {}
        }

        let mut cell = self.turn.lock();
        if cell.state == TurnState::Speaking && cell.speaking == Some(id) {
            cell.speaking = None;
            self.transition(&mut cell, TurnState::Idle);
        }
        outcome
    }
}

/// Caller's handle on one background reply.
pub struct SessionHandle {
    token: SessionToken,
    playback: PlaybackController,
    outcome: Receiver<PlaybackOutcome>,
    settled: Option<PlaybackOutcome>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.token.id()
    }

    /// Ask playback to stop. Idempotent; does not wait.
    pub fn cancel(&self) {
        self.playback.stop_session(self.token.id());
    }

    /// True once the session has ended and the turn state reflects it.
    pub fn is_finished(&mut self) -> bool {
        self.poll(Duration::ZERO).is_some()
    }

    /// Wait up to `timeout` for the session to end.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<PlaybackOutcome> {
        self.poll(timeout)
    }

    /// Block until the session has ended and the turn state is settled.
    pub fn wait(self) -> PlaybackOutcome {
        if let Some(outcome) = self.settled {
            return outcome;
        }
        self.outcome.recv().unwrap_or(PlaybackOutcome::Failed)
    }

    fn poll(&mut self, timeout: Duration) -> Option<PlaybackOutcome> {
        if self.settled.is_none() {
            self.settled = match self.outcome.recv_timeout(timeout) {
                Ok(outcome) => Some(outcome),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => Some(PlaybackOutcome::Failed),
            };
        }
        self.settled
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.token.id())
            .field("settled", &self.settled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::scripted::{frames_from_levels, ScriptedDevice};
    use crate::playback::SimulatedSynthesizer;
    use crate::vad::ScriptedFactory;

    use tokio::sync::broadcast::error::TryRecvError;

    const RATE: SampleRate = SampleRate::Hz16000;
    const VOICE: i16 = 3_000;

    fn fast_config() -> EngineConfig {
        EngineConfig {
            max_listen: Duration::from_secs(5),
            frame_poll: Duration::from_millis(5),
            ..EngineConfig::default()
        }
    }

    fn coordinator(device: ScriptedDevice, factory: ScriptedFactory) -> (TurnCoordinator, Arc<ScriptedDevice>) {
        let device = Arc::new(device);
        let coordinator = TurnCoordinator::new(
            fast_config(),
            Arc::clone(&device) as Arc<dyn CaptureDevice>,
            Arc::new(factory),
            Box::new(SimulatedSynthesizer::new(Duration::from_millis(5))),
        );
        (coordinator, device)
    }

    fn drain_states(rx: &mut broadcast::Receiver<TurnStateEvent>) -> Vec<(TurnState, TurnState)> {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(ev) => out.push((ev.from, ev.to)),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => return out,
            }
        }
    }

    fn speech_session(speech: usize) -> Vec<AudioFrame> {
        let mut levels = vec![0i16; 3];
        levels.extend(vec![VOICE; speech]);
        levels.extend(vec![0i16; 30]);
        frames_from_levels(RATE, &levels)
    }

    #[test]
    fn listen_cycle_moves_idle_listening_processing() {
        let (c, _device) = coordinator(
            ScriptedDevice::new(RATE).with_session(speech_session(5)),
            ScriptedFactory::voiced_level(VOICE),
        );
        let mut states = c.subscribe_states();

        let utterance = c.run_listen_cycle().expect("listen");
        assert!(utterance.has_speech);
        assert_eq!(utterance.speech_span(), Some(3..=7));
        assert_eq!(c.current_turn_state(), TurnState::Processing);
        assert_eq!(
            drain_states(&mut states),
            vec![
                (TurnState::Idle, TurnState::Listening),
                (TurnState::Listening, TurnState::Processing)
            ]
        );

        c.finish_processing().expect("finish");
        assert_eq!(c.current_turn_state(), TurnState::Idle);
    }

    #[test]
    fn silent_cycle_returns_to_idle() {
        let mut config = fast_config();
        config.max_listen = Duration::from_millis(300);
        let device = Arc::new(ScriptedDevice::new(RATE));
        let c = TurnCoordinator::new(
            config,
            device,
            Arc::new(ScriptedFactory::always(false)),
            Box::new(SimulatedSynthesizer::new(Duration::from_millis(1))),
        );
        let u = c.run_listen_cycle().expect("listen");
        assert!(!u.has_speech);
        assert!(u.frames.is_empty());
        assert_eq!(u.completion, Completion::Timeout);
        assert_eq!(c.current_turn_state(), TurnState::Idle);
        assert_eq!(c.diagnostics_snapshot().listen_timeouts, 1);
    }

    #[test]
    fn device_failure_surfaces_and_returns_to_idle() {
        let (c, _device) = coordinator(ScriptedDevice::unavailable(RATE), ScriptedFactory::always(true));
        assert!(matches!(
            c.run_listen_cycle(),
            Err(ParleyError::DeviceUnavailable(_))
        ));
        assert_eq!(c.current_turn_state(), TurnState::Idle);
    }

    #[test]
    fn illegal_edges_are_rejected() {
        let (c, _device) = coordinator(ScriptedDevice::new(RATE), ScriptedFactory::always(false));
        assert!(matches!(
            c.finish_processing(),
            Err(ParleyError::InvalidTransition {
                from: TurnState::Idle,
                to: TurnState::Idle
            })
        ));
        assert!(!c.cancel_listening());
    }

    #[test]
    fn unsolicited_speech_runs_idle_speaking_idle() {
        let (c, _device) = coordinator(ScriptedDevice::new(RATE), ScriptedFactory::always(false));
        let mut states = c.subscribe_states();
        let handle = c.begin_speaking("hello I am here").expect("speak");
        assert_eq!(handle.wait(), PlaybackOutcome::Completed);
        assert_eq!(c.current_turn_state(), TurnState::Idle);
        assert_eq!(
            drain_states(&mut states),
            vec![
                (TurnState::Idle, TurnState::Speaking),
                (TurnState::Speaking, TurnState::Idle)
            ]
        );
    }

    #[test]
    fn cancel_speaking_settles_in_idle() {
        let (c, _device) = coordinator(ScriptedDevice::new(RATE), ScriptedFactory::always(false));
        let mut handle = c.begin_speaking(&vec!["la"; 400].join(" ")).expect("speak");
        std::thread::sleep(Duration::from_millis(30));
        assert!(c.cancel_speaking());
        assert_eq!(c.current_turn_state(), TurnState::Idle);
        assert_eq!(
            handle.wait_timeout(Duration::from_secs(1)),
            Some(PlaybackOutcome::Cancelled)
        );
        assert!(handle.is_finished());
        assert!(!c.cancel_speaking());
    }

    #[test]
    fn classifier_outage_degrades_to_energy_only() {
        let mut levels = vec![0i16; 2];
        levels.extend(vec![2_000i16; 4]); // 4e6 mean-square, above the listen threshold
        levels.extend(vec![0i16; 30]);
        let (c, _device) = coordinator(
            ScriptedDevice::new(RATE).with_session(frames_from_levels(RATE, &levels)),
            ScriptedFactory::unavailable(),
        );
        let u = c.run_listen_cycle().expect("listen");
        assert!(u.has_speech);
        assert_eq!(u.speech_span(), Some(2..=5));
        assert_eq!(c.diagnostics_snapshot().degraded_sessions, 1);
    }

    #[test]
    fn config_round_trips_durations_as_millis() {
        let json = serde_json::to_value(EngineConfig::default()).expect("serialize");
        assert_eq!(json["max_listen"], 30_000);
        assert_eq!(json["frame_poll"], 30);
        assert_eq!(json["vad_sensitivity"], 3);
        assert_eq!(json["sample_rate"], 16_000);

        let partial: EngineConfig =
            serde_json::from_str(r#"{"silence_frames": 10, "max_listen": 5000}"#).expect("partial");
        assert_eq!(partial.silence_frames, 10);
        assert_eq!(partial.max_listen, Duration::from_secs(5));
        assert_eq!(partial.max_listen_frames(), 166);
        assert_eq!(partial.interrupt_energy_threshold, 10_000.0);
    }
}
