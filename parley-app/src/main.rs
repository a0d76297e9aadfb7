//! Parley headless conversation host.
//!
//! Wires a capture device, the WebRTC voice classifier, the stub speech
//! backends and a simulated voice into a [`TurnCoordinator`], then takes
//! turns until the requested count is reached. Barge-ins are printed as they
//! happen; the next turn picks the interrupting speech up.

mod recorder;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use parley_core::{
    audio::{device::list_input_devices, scripted::frames_from_levels},
    CaptureDevice, EchoDialogue, ParleyError, PlaybackOutcome, SampleRate, ScriptedDevice,
    SimulatedSynthesizer, StubTranscriber, Transcriber, TurnCoordinator, TurnOutcome,
    WavFileDevice, WebRtcFactory, FRAME_DURATION,
};
use recorder::SavingTranscriber;
use settings::{apply_env_overrides, default_settings_path, load_settings, AppSettings};
use tracing::{info, warn};

#[derive(Debug, Default)]
struct Args {
    settings: Option<PathBuf>,
    wav: Option<PathBuf>,
    turns: Option<usize>,
    save_utterances: Option<PathBuf>,
    list_devices: bool,
    write_settings: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--settings" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --settings".into());
                };
                args.settings = Some(PathBuf::from(v));
            }
            "--wav" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --wav".into());
                };
                args.wav = Some(PathBuf::from(v));
            }
            "--turns" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --turns".into());
                };
                let n = v
                    .parse::<usize>()
                    .map_err(|_| format!("invalid --turns value: {v}"))?;
                args.turns = Some(n.max(1));
            }
            "--save-utterances" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --save-utterances".into());
                };
                args.save_utterances = Some(PathBuf::from(v));
            }
            "--list-devices" => args.list_devices = true,
            "--write-settings" => args.write_settings = true,
            "--help" | "-h" => {
                println!(
                    "Usage: parley [--settings PATH] [--wav FILE] [--turns N] \
                     [--save-utterances DIR] [--list-devices] [--write-settings]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("parley=info,parley_core=info")),
        )
        .init();

    let args = parse_args().map_err(anyhow::Error::msg)?;

    if args.list_devices {
        let devices = list_input_devices();
        if devices.is_empty() {
            println!("no input devices (build with --features microphone to enumerate)");
        }
        for device in devices {
            println!("{}", serde_json::to_string(&device)?);
        }
        return Ok(());
    }

    let settings_path = args.settings.clone().unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path);
    apply_env_overrides(&mut settings);
    if args.write_settings {
        settings::save_settings(&settings_path, &settings)
            .with_context(|| format!("writing {}", settings_path.display()))?;
        info!(path = %settings_path.display(), "settings written");
    }
    if let Some(dir) = &args.save_utterances {
        settings.save_utterances_dir = Some(dir.display().to_string());
    }

    let config = settings.engine_config();
    let turns = args.turns.unwrap_or(3);
    let device = capture_device(&settings, args.wav.as_deref(), config.sample_rate, turns)?;
    info!(device = device.name().as_str(), turns, "starting parley");

    let synthesizer = SimulatedSynthesizer::new(settings.word_duration()).echoing();
    let coordinator = TurnCoordinator::new(
        config,
        device,
        Arc::new(WebRtcFactory),
        Box::new(synthesizer),
    );
    coordinator.on_interrupt(|event| {
        println!(
            "[interrupted] session {} at {} (energy {:.0})",
            event.session_id,
            event.timestamp.format("%H:%M:%S%.3f"),
            event.energy
        );
    });

    let mut transcriber: Box<dyn Transcriber> = match &settings.save_utterances_dir {
        Some(dir) => Box::new(
            SavingTranscriber::new(StubTranscriber::new(), dir)
                .with_context(|| format!("creating {dir}"))?,
        ),
        None => Box::new(StubTranscriber::new()),
    };
    let mut dialogue = EchoDialogue::new();

    let welcome = coordinator
        .begin_speaking(&settings.welcome_message())
        .context("speaking welcome message")?;
    report_playback("welcome", welcome.wait());

    for turn in 1..=turns {
        match coordinator.take_turn(&mut transcriber, &mut dialogue) {
            Ok(TurnOutcome::NothingHeard) => println!("[turn {turn}] (silence)"),
            Ok(TurnOutcome::Unrecognized) => println!("[turn {turn}] (could not transcribe)"),
            Ok(TurnOutcome::Unanswered { transcript }) => {
                println!("[turn {turn}] you: {transcript}\n[turn {turn}] (no reply)")
            }
            Ok(TurnOutcome::Answered {
                transcript,
                reply,
                playback,
            }) => {
                println!("[turn {turn}] you: {transcript}");
                println!("[turn {turn}] {}: {reply}", settings.assistant_name);
                report_playback(&format!("turn {turn}"), playback);
            }
            Err(e @ (ParleyError::EngineBusy | ParleyError::Synthesis(_))) => {
                warn!(turn, "turn failed: {e}")
            }
            Err(e) => return Err(e).context("turn-taking stopped"),
        }
    }

    let diagnostics = coordinator.diagnostics_snapshot();
    println!("{}", serde_json::to_string_pretty(&diagnostics)?);
    Ok(())
}

fn report_playback(label: &str, outcome: PlaybackOutcome) {
    match outcome {
        PlaybackOutcome::Completed => {}
        other => println!("[{label}] playback {other:?}"),
    }
}

/// Microphone when compiled in and no file was given; otherwise a WAV replay
/// or a scripted demo conversation.
#[cfg_attr(feature = "microphone", allow(unused_variables))]
fn capture_device(
    settings: &AppSettings,
    wav: Option<&std::path::Path>,
    rate: SampleRate,
    turns: usize,
) -> anyhow::Result<Arc<dyn CaptureDevice>> {
    if let Some(path) = wav {
        let device = WavFileDevice::new(path, rate)
            .with_context(|| format!("loading {}", path.display()))?;
        return Ok(Arc::new(device));
    }
    #[cfg(feature = "microphone")]
    {
        Ok(Arc::new(parley_core::MicrophoneDevice::new(
            settings.preferred_input_device.clone(),
            rate,
        )))
    }
    #[cfg(not(feature = "microphone"))]
    {
        if let Some(name) = &settings.preferred_input_device {
            warn!(name = name.as_str(), "microphone support not compiled in, using demo script");
        }
        Ok(Arc::new(demo_device(rate, turns)))
    }
}

/// Opens alternate between barge-in watches (quiet room) and listen cycles
/// (one spoken phrase), starting with the watch over the welcome message.
#[cfg_attr(feature = "microphone", allow(dead_code))]
fn demo_device(rate: SampleRate, turns: usize) -> ScriptedDevice {
    let mut phrase = vec![0i16; 10];
    phrase.extend(std::iter::repeat(3_000).take(40));
    phrase.extend(std::iter::repeat(0).take(30));

    let mut device = ScriptedDevice::new(rate).paced(FRAME_DURATION);
    for _ in 0..turns {
        device = device
            .with_session(Vec::new())
            .with_session(frames_from_levels(rate, &phrase));
    }
    device.with_session(Vec::new())
}
