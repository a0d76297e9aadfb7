use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use parley_core::audio::scripted::{frames_from_levels, ScriptedDevice};
use parley_core::playback::SynthesisLog;
use parley_core::{
    AudioFrame, CaptureDevice, DialogueBackend, EngineConfig, InterruptEvent, ParleyError,
    PlaybackOutcome, SampleRate, ScriptedFactory, SimulatedSynthesizer, Transcriber,
    TurnCoordinator, TurnOutcome, TurnState, TurnStateEvent,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

const RATE: SampleRate = SampleRate::Hz16000;
/// Voiced per the scripted classifier, and loud enough for both policies.
const VOICE: i16 = 3_000;
const PACE: Duration = Duration::from_millis(5);

/// Records how many capture sessions were open whenever it is called.
struct ProbeTranscriber {
    device: Arc<ScriptedDevice>,
    open_at_call: Vec<usize>,
    lines: VecDeque<&'static str>,
}

impl Transcriber for ProbeTranscriber {
    fn transcribe(&mut self, frames: &[AudioFrame], _rate: SampleRate) -> String {
        assert!(!frames.is_empty());
        self.open_at_call.push(self.device.open_handles());
        self.lines.pop_front().unwrap_or_default().to_string()
    }
}

/// Replies with a long monologue so there is time to interrupt it.
struct Monologue;

impl DialogueBackend for Monologue {
    fn generate_reply(&mut self, text: &str, _emotion: Option<&str>) -> String {
        format!("about {text}: {}", vec!["and"; 120].join(" "))
    }
}

fn utterance(speech: usize) -> Vec<AudioFrame> {
    let mut levels = vec![0i16; 3];
    levels.extend(vec![VOICE; speech]);
    levels.extend(vec![0i16; 26]);
    frames_from_levels(RATE, &levels)
}

fn talk_over(after_silent: usize) -> Vec<AudioFrame> {
    let mut levels = vec![0i16; after_silent];
    levels.extend(vec![VOICE; 40]);
    frames_from_levels(RATE, &levels)
}

fn config() -> EngineConfig {
    EngineConfig {
        frame_poll: Duration::from_millis(5),
        max_listen: Duration::from_secs(5),
        ..EngineConfig::default()
    }
}

fn build(device: ScriptedDevice) -> (TurnCoordinator, Arc<ScriptedDevice>, SynthesisLog) {
    let device = Arc::new(device.paced(PACE));
    let synth = SimulatedSynthesizer::new(Duration::from_millis(10));
    let log = synth.log();
    let coordinator = TurnCoordinator::new(
        config(),
        Arc::clone(&device) as Arc<dyn CaptureDevice>,
        Arc::new(ScriptedFactory::voiced_level(VOICE)),
        Box::new(synth),
    );
    (coordinator, device, log)
}

fn recv_event_with_timeout<T: Clone>(rx: &mut broadcast::Receiver<T>, timeout: Duration) -> T {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(ev) => return ev,
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    panic!("timed out waiting for event");
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => panic!("event channel closed unexpectedly"),
        }
    }
}

fn assert_no_event_for<T: Clone>(rx: &mut broadcast::Receiver<T>, timeout: Duration) {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(_) => panic!("expected no further event"),
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => return,
        }
    }
}

fn drain(rx: &mut broadcast::Receiver<TurnStateEvent>) -> Vec<(TurnState, TurnState)> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push((ev.from, ev.to));
    }
    out
}

#[test]
fn barge_in_interrupts_the_reply_and_hands_the_turn_back() {
    let device = ScriptedDevice::new(RATE)
        .with_session(utterance(8)) // first listen cycle
        .with_session(talk_over(4)) // barge-in watch
        .with_session(utterance(5)); // the interruption, heard next turn
    let (c, device, log) = build(device);

    let handler_calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = Arc::clone(&handler_calls);
        c.on_interrupt(move |_: &InterruptEvent| {
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }
    let mut interrupts = c.subscribe_interrupts();
    let mut states = c.subscribe_states();

    let mut transcriber = ProbeTranscriber {
        device: Arc::clone(&device),
        open_at_call: Vec::new(),
        lines: VecDeque::from(["the weather", "wait, stop"]),
    };
    let mut dialogue = Monologue;

    let first = c.take_turn(&mut transcriber, &mut dialogue).expect("first turn");
    match &first {
        TurnOutcome::Answered {
            transcript,
            playback,
            ..
        } => {
            assert_eq!(transcript, "the weather");
            assert_eq!(*playback, PlaybackOutcome::Interrupted);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(c.current_turn_state(), TurnState::Listening);
    assert!(log.spoken().len() < 120, "reply should have been cut short");

    let event = recv_event_with_timeout(&mut interrupts, Duration::from_secs(1));
    assert_eq!(event.vad, Some(true));
    assert!(event.energy > c.config().interrupt_energy_threshold);
    // 40 qualifying frames, one event
    assert_no_event_for(&mut interrupts, Duration::from_millis(100));
    assert_eq!(handler_calls.load(Ordering::SeqCst), 1);

    assert_eq!(
        drain(&mut states),
        vec![
            (TurnState::Idle, TurnState::Listening),
            (TurnState::Listening, TurnState::Processing),
            (TurnState::Processing, TurnState::Speaking),
            (TurnState::Speaking, TurnState::Listening),
        ]
    );

    // The interruption becomes the next turn, starting from Listening.
    let second = c.take_turn(&mut transcriber, &mut dialogue).expect("second turn");
    assert!(matches!(second, TurnOutcome::Answered { .. }));

    assert_eq!(transcriber.open_at_call, vec![0, 0], "device open during transcription");
    assert_eq!(device.max_concurrent_opens(), 1);
    assert_eq!(device.open_handles(), 0);

    let diag = c.diagnostics_snapshot();
    assert_eq!(diag.interrupts, 1);
    assert_eq!(diag.utterances, 2);
    assert_eq!(diag.capture_conflicts, 0);
}

#[test]
fn reply_that_finishes_uninterrupted_returns_to_idle() {
    let device = ScriptedDevice::new(RATE).with_session(utterance(6));
    let (c, device, log) = build(device);
    let mut transcriber = ProbeTranscriber {
        device: Arc::clone(&device),
        open_at_call: Vec::new(),
        lines: VecDeque::from(["hello"]),
    };
    let mut dialogue = parley_core::EchoDialogue::new();
    let mut interrupts = c.subscribe_interrupts();

    let outcome = c.take_turn(&mut transcriber, &mut dialogue).expect("turn");
    let TurnOutcome::Answered { reply, playback, .. } = outcome else {
        panic!("expected an answer");
    };
    assert_eq!(playback, PlaybackOutcome::Completed);
    assert_eq!(log.spoken().join(" "), reply);
    assert_eq!(c.current_turn_state(), TurnState::Idle);
    assert_no_event_for(&mut interrupts, Duration::from_millis(50));
    assert_eq!(device.max_concurrent_opens(), 1);
}

#[test]
fn empty_transcript_closes_the_turn() {
    let device = ScriptedDevice::new(RATE).with_session(utterance(6));
    let (c, device, log) = build(device);
    let mut transcriber = ProbeTranscriber {
        device,
        open_at_call: Vec::new(),
        lines: VecDeque::from([""]),
    };
    let outcome = c
        .take_turn(&mut transcriber, &mut parley_core::EchoDialogue::new())
        .expect("turn");
    assert_eq!(outcome, TurnOutcome::Unrecognized);
    assert_eq!(c.current_turn_state(), TurnState::Idle);
    assert_eq!(log.begun(), 0);
}

#[test]
fn speaking_while_speaking_is_rejected_without_touching_the_active_session() {
    let (c, _device, _log) = build(ScriptedDevice::new(RATE));
    let handle = c
        .begin_speaking(&vec!["hm"; 200].join(" "))
        .expect("first reply");

    let err = c.begin_speaking("second").expect_err("engine is busy");
    assert!(matches!(err, ParleyError::EngineBusy));

    let active = c.active_session().expect("still playing");
    assert_eq!(active.id(), handle.id());
    assert!(!active.is_cancelled());
    assert_eq!(c.current_turn_state(), TurnState::Speaking);
    assert_eq!(c.diagnostics_snapshot().busy_rejections, 1);

    handle.cancel();
    assert_eq!(handle.wait(), PlaybackOutcome::Cancelled);
    assert_eq!(c.current_turn_state(), TurnState::Idle);
}

#[test]
fn stop_is_idempotent_and_observed_immediately() {
    let (c, _device, log) = build(ScriptedDevice::new(RATE));
    let mut handle = c
        .begin_speaking(&vec!["hm"; 200].join(" "))
        .expect("reply");
    thread::sleep(Duration::from_millis(40));
    assert!(c.is_playing());

    c.stop_playback();
    assert!(!c.is_playing());
    c.stop_playback();

    let words_at_stop = log.spoken().len();
    assert_eq!(
        handle.wait_timeout(Duration::from_secs(1)),
        Some(PlaybackOutcome::Cancelled)
    );
    // at most the tick in flight when stop landed
    assert!(log.spoken().len() <= words_at_stop + 1);
    assert_eq!(c.current_turn_state(), TurnState::Idle);
}

#[test]
fn listening_is_refused_while_speaking() {
    let (c, device, _log) = build(ScriptedDevice::new(RATE));
    let handle = c
        .begin_speaking(&vec!["hm"; 100].join(" "))
        .expect("reply");
    assert!(matches!(
        c.run_listen_cycle(),
        Err(ParleyError::InvalidTransition {
            from: TurnState::Speaking,
            to: TurnState::Listening
        })
    ));
    handle.cancel();
    handle.wait();
    assert!(device.max_concurrent_opens() <= 1);
}

#[test]
fn cancel_listening_stops_a_running_cycle() {
    let (c, _device, _log) = build(ScriptedDevice::new(RATE));
    let canceller = {
        let c = c.clone();
        thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(1);
            while c.current_turn_state() != TurnState::Listening && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(2));
            }
            thread::sleep(Duration::from_millis(50));
            c.cancel_listening()
        })
    };
    let u = c.run_listen_cycle().expect("listen");
    assert!(canceller.join().expect("canceller"));
    assert_eq!(u.completion, parley_core::Completion::Cancelled);
    assert!(!u.has_speech);
    assert_eq!(c.current_turn_state(), TurnState::Idle);
}

#[test]
fn activity_events_follow_each_captured_frame() {
    let device = ScriptedDevice::new(RATE).with_session(utterance(4));
    let (c, _device, _log) = build(device);
    let mut activity = c.subscribe_activity();

    let u = c.run_listen_cycle().expect("listen");
    assert!(u.has_speech);

    let mut seen = Vec::new();
    while let Ok(ev) = activity.try_recv() {
        seen.push(ev);
    }
    assert_eq!(seen.len(), u.frames.len());
    assert!(seen.windows(2).all(|w| w[1].seq == w[0].seq + 1));
    assert_eq!(seen.iter().filter(|e| e.is_speech).count(), 4);
}

#[test]
fn speech_after_a_reply_ends_on_its_own_is_not_a_barge_in() {
    // One quiet frame, then a voiced one 60 ms later: the two-word reply
    // finishes while the watch is still waiting for it.
    let mut device = ScriptedDevice::new(RATE);
    for _ in 0..5 {
        device = device.with_session(frames_from_levels(RATE, &[0, VOICE]));
    }
    let device = Arc::new(device.paced(Duration::from_millis(60)));
    let coordinator = TurnCoordinator::new(
        EngineConfig {
            frame_poll: Duration::from_millis(100),
            ..config()
        },
        Arc::clone(&device) as Arc<dyn CaptureDevice>,
        Arc::new(ScriptedFactory::voiced_level(VOICE)),
        Box::new(SimulatedSynthesizer::new(Duration::from_millis(10))),
    );
    let mut interrupts = coordinator.subscribe_interrupts();
    let handled = Arc::new(AtomicUsize::new(0));
    {
        let handled = Arc::clone(&handled);
        coordinator.on_interrupt(move |_: &InterruptEvent| {
            handled.fetch_add(1, Ordering::SeqCst);
        });
    }

    for _ in 0..5 {
        let handle = coordinator.begin_speaking("two words").expect("speak");
        assert_eq!(handle.wait(), PlaybackOutcome::Completed);
        assert_eq!(coordinator.current_turn_state(), TurnState::Idle);
    }

    assert_no_event_for(&mut interrupts, Duration::from_millis(100));
    assert_eq!(handled.load(Ordering::SeqCst), 0);
    assert_eq!(coordinator.diagnostics_snapshot().interrupts, 0);
    assert_eq!(coordinator.diagnostics_snapshot().sessions_completed, 5);
}

#[test]
fn interrupt_handler_can_register_another_handler() {
    let device = ScriptedDevice::new(RATE).with_session(talk_over(2));
    let (c, _device, _log) = build(device);
    let outer_calls = Arc::new(AtomicUsize::new(0));
    {
        let coordinator = c.clone();
        let calls = Arc::clone(&outer_calls);
        c.on_interrupt(move |_: &InterruptEvent| {
            calls.fetch_add(1, Ordering::SeqCst);
            coordinator.on_interrupt(|_: &InterruptEvent| {});
        });
    }

    let mut handle = c
        .begin_speaking(&vec!["and"; 120].join(" "))
        .expect("speak");
    assert_eq!(
        handle.wait_timeout(Duration::from_secs(3)),
        Some(PlaybackOutcome::Interrupted)
    );
    assert_eq!(c.current_turn_state(), TurnState::Listening);
    assert_eq!(outer_calls.load(Ordering::SeqCst), 1);
}
