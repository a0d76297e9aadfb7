//! Microphone capture via cpal.
//!
//! # Threading
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS), so each capture session gets a dedicated thread that builds the
//! stream, frames the audio and drops the stream again on exit.
//!
//! ```text
//! cpal callback ──push_slice──► SPSC ring ──► framing thread ──► bounded channel ──► FrameSource
//!   (RT, zero-alloc)                            resample + cut 30 ms
//! ```
//!
//! The real-time callback **must not** allocate, block or do I/O; it only
//! mixes to mono and pushes into the ring.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, SampleRate as CpalRate, Stream, StreamConfig,
};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use super::{resample::RateConverter, CaptureDevice, FrameSource};
use crate::buffering::{
    create_sample_ring, f32_to_i16,
    frame::{AudioFrame, SampleRate},
    Consumer, FrameAssembler, Producer, SampleProducer,
};
use crate::error::{ParleyError, Result};

/// Frames buffered between the framing thread and the consumer (≈ 1.9 s).
const FRAME_CHANNEL_CAP: usize = 64;
/// Samples drained from the ring per framing iteration.
const DRAIN_CHUNK: usize = 960;
/// Sleep when the ring is empty (avoids busy-waiting a core).
const SLEEP_EMPTY_MS: u64 = 5;

/// The system microphone (or a named input device).
#[derive(Debug, Clone)]
pub struct MicrophoneDevice {
    preferred_name: Option<String>,
    sample_rate: SampleRate,
}

impl MicrophoneDevice {
    pub fn new(preferred_name: Option<String>, sample_rate: SampleRate) -> Self {
        Self {
            preferred_name,
            sample_rate,
        }
    }
}

impl CaptureDevice for MicrophoneDevice {
    /// Blocks until the stream is confirmed open (or failed).
    fn open(&self) -> Result<Box<dyn FrameSource>> {
        let running = Arc::new(AtomicBool::new(true));
        let (frame_tx, frame_rx) = bounded::<AudioFrame>(FRAME_CHANNEL_CAP);
        let (open_tx, open_rx) = crossbeam_channel::bounded::<Result<u32>>(1);

        let preferred = self.preferred_name.clone();
        let target = self.sample_rate;
        let thread_running = Arc::clone(&running);

        let handle = std::thread::Builder::new()
            .name("parley-capture".into())
            .spawn(move || {
                let (producer, consumer) = create_sample_ring();
                let (stream, device_rate) =
                    match build_stream(producer, &thread_running, preferred.as_deref()) {
                        Ok(opened) => {
                            let _ = open_tx.send(Ok(opened.1));
                            opened
                        }
                        Err(e) => {
                            let _ = open_tx.send(Err(e));
                            return;
                        }
                    };
                frame_loop(consumer, device_rate, target, &thread_running, frame_tx);
                // Stream drops here, releasing the device on this thread.
                drop(stream);
                debug!("capture thread exited");
            })
            .map_err(|e| ParleyError::DeviceUnavailable(format!("spawn capture thread: {e}")))?;

        match open_rx.recv() {
            Ok(Ok(device_rate)) => {
                info!(device_rate, target_rate = target.hz(), "microphone open");
                Ok(Box::new(MicrophoneSource {
                    frames: frame_rx,
                    running,
                    thread: Some(handle),
                    sample_rate: target,
                }))
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(ParleyError::DeviceUnavailable(
                    "capture thread died before opening the device".into(),
                ))
            }
        }
    }

    fn name(&self) -> String {
        self.preferred_name
            .clone()
            .unwrap_or_else(|| "default microphone".into())
    }
}

/// Open capture session. Dropping it stops and joins the capture thread.
pub struct MicrophoneSource {
    frames: Receiver<AudioFrame>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    sample_rate: SampleRate,
}

impl FrameSource for MicrophoneSource {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<AudioFrame>> {
        match self.frames.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ParleyError::DeviceUnavailable(
                "microphone stream ended".into(),
            )),
        }
    }

    fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("capture thread panicked");
            }
        }
    }
}

fn frame_loop(
    mut consumer: crate::buffering::SampleConsumer,
    device_rate: u32,
    target: SampleRate,
    running: &AtomicBool,
    frame_tx: Sender<AudioFrame>,
) {
    let mut resampler = match RateConverter::new(device_rate, target.hz(), DRAIN_CHUNK) {
        Ok(r) => r,
        Err(e) => {
            error!("failed to create resampler: {e}");
            return;
        }
    };
    let mut assembler = FrameAssembler::new(target);
    let mut raw = vec![0f32; DRAIN_CHUNK];
    let mut dropped = 0usize;

    while running.load(Ordering::Acquire) {
        let n = consumer.pop_slice(&mut raw);
        if n == 0 {
            std::thread::sleep(Duration::from_millis(SLEEP_EMPTY_MS));
            continue;
        }

        let resampled = resampler.process(&raw[..n]);
        let pcm: Vec<i16> = resampled.iter().copied().map(f32_to_i16).collect();
        for frame in assembler.push(&pcm) {
            match frame_tx.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    if dropped % 50 == 1 {
                        warn!(dropped, "frame channel full: consumer is not keeping up");
                    }
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

/// Open the preferred input device (falling back to the default, then the
/// first available one) and start a mono f32 stream into `producer`.
fn build_stream(
    mut producer: SampleProducer,
    running: &Arc<AtomicBool>,
    preferred_name: Option<&str>,
) -> Result<(Stream, u32)> {
    let host = cpal::default_host();

    let preferred = preferred_name.and_then(|wanted| match host.input_devices() {
        Ok(mut devices) => {
            let found = devices.find(|d| d.name().map(|n| n == wanted).unwrap_or(false));
            if found.is_none() {
                warn!("preferred input device '{wanted}' not found, falling back");
            }
            found
        }
        Err(e) => {
            warn!("failed to list input devices while resolving preference: {e}");
            None
        }
    });

    let device = match preferred.or_else(|| host.default_input_device()) {
        Some(device) => device,
        None => host
            .input_devices()
            .map_err(|e| ParleyError::DeviceUnavailable(e.to_string()))?
            .next()
            .ok_or_else(|| ParleyError::DeviceUnavailable("no input device found".into()))?,
    };

    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening input device"
    );

    let supported = device
        .default_input_config()
        .map_err(|e| ParleyError::DeviceUnavailable(e.to_string()))?;
    let device_rate = supported.sample_rate().0;
    let channels = supported.channels() as usize;

    let config = StreamConfig {
        channels: supported.channels(),
        sample_rate: CpalRate(device_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let flag = Arc::clone(running);
    let mut mix_buf: Vec<f32> = Vec::new();
    let err_fn = |err: cpal::StreamError| error!("audio stream error: {err}");

    // Each arm mixes down to mono in a reused buffer, then pushes into the ring.
    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _info| {
                if !flag.load(Ordering::Relaxed) {
                    return;
                }
                mix_to_mono(data, channels, &mut mix_buf, |s| s);
                push_or_warn(&mut producer, &mix_buf);
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _info| {
                if !flag.load(Ordering::Relaxed) {
                    return;
                }
                mix_to_mono(data, channels, &mut mix_buf, |s| s as f32 / 32768.0);
                push_or_warn(&mut producer, &mix_buf);
            },
            err_fn,
            None,
        ),
        SampleFormat::U8 => device.build_input_stream(
            &config,
            move |data: &[u8], _info| {
                if !flag.load(Ordering::Relaxed) {
                    return;
                }
                mix_to_mono(data, channels, &mut mix_buf, |s| (s as f32 - 128.0) / 128.0);
                push_or_warn(&mut producer, &mix_buf);
            },
            err_fn,
            None,
        ),
        fmt => {
            return Err(ParleyError::DeviceUnavailable(format!(
                "unsupported sample format: {fmt:?}"
            )))
        }
    }
    .map_err(|e| ParleyError::DeviceUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| ParleyError::DeviceUnavailable(e.to_string()))?;

    Ok((stream, device_rate))
}

fn mix_to_mono<T: Copy>(data: &[T], channels: usize, out: &mut Vec<f32>, to_f32: impl Fn(T) -> f32) {
    let ch = channels.max(1);
    let frames = data.len() / ch;
    out.resize(frames, 0.0);
    for (f, slot) in out.iter_mut().enumerate() {
        let base = f * ch;
        let sum: f32 = data[base..base + ch].iter().map(|&s| to_f32(s)).sum();
        *slot = sum / ch as f32;
    }
}

fn push_or_warn(producer: &mut SampleProducer, samples: &[f32]) {
    let written = producer.push_slice(samples);
    if written < samples.len() {
        warn!("ring buffer full: dropped {} samples", samples.len() - written);
    }
}
