//! WAV replay and dumps via hound.
//!
//! `WavFileDevice` stands in for a microphone: the file plays once at
//! real-time pace across all sessions, then continues with silence.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{resample::RateConverter, scripted::Pacer, CaptureDevice, FrameSource};
use crate::buffering::{
    f32_to_i16,
    frame::{AudioFrame, SampleRate, FRAME_DURATION},
    FrameAssembler,
};
use crate::error::Result;

/// Load a WAV file as mono frames at `target` rate.
///
/// Multi-channel input is averaged to mono; other sample rates are resampled.
pub fn load_frames(path: &Path, target: SampleRate) -> Result<Vec<AudioFrame>> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<f32>, hound::Error>>()?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<Vec<f32>, hound::Error>>()?
        }
    };

    let mono: Vec<f32> = interleaved
        .chunks(channels)
        .map(|c| c.iter().sum::<f32>() / c.len() as f32)
        .collect();

    let mut converter = RateConverter::new(spec.sample_rate, target.hz(), target.frame_len())?;
    let mut resampled = converter.process(&mono);
    resampled.extend(converter.flush());

    let pcm: Vec<i16> = resampled.into_iter().map(f32_to_i16).collect();
    let frames = FrameAssembler::new(target).push(&pcm);

    info!(
        path = %path.display(),
        source_rate = spec.sample_rate,
        frames = frames.len(),
        "loaded wav"
    );
    Ok(frames)
}

/// Write mono 16-bit PCM to `path`.
pub fn write_pcm(path: &Path, rate: SampleRate, samples: &[i16]) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: rate.hz(),
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for &s in samples {
        writer.write_sample(s)?;
    }
    writer.finalize()?;
    Ok(())
}

/// One WAV recording shared by every session opened on a [`WavFileDevice`].
#[derive(Debug)]
struct Tape {
    frames: VecDeque<AudioFrame>,
    next_sequence: u64,
}

/// Replays a WAV file as if it were a microphone.
///
/// The file is one continuous stream: each `open` picks up where the previous
/// session stopped, and the room goes quiet once the recording runs out.
#[derive(Debug, Clone)]
pub struct WavFileDevice {
    path: PathBuf,
    rate: SampleRate,
    pace: Duration,
    tape: Arc<Mutex<Tape>>,
}

impl WavFileDevice {
    /// Decode `path` up front, so a bad file fails here rather than on the
    /// first listen.
    pub fn new(path: impl Into<PathBuf>, rate: SampleRate) -> Result<Self> {
        let path = path.into();
        let frames = load_frames(&path, rate)?;
        let next_sequence = frames.len() as u64;
        Ok(Self {
            path,
            rate,
            pace: FRAME_DURATION,
            tape: Arc::new(Mutex::new(Tape {
                frames: frames.into(),
                next_sequence,
            })),
        })
    }

    /// Replay faster (or slower) than real time.
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    /// Frames of the recording not yet handed to any session.
    pub fn remaining(&self) -> usize {
        self.tape.lock().frames.len()
    }
}

impl CaptureDevice for WavFileDevice {
    fn open(&self) -> Result<Box<dyn FrameSource>> {
        debug!(path = %self.path.display(), remaining = self.remaining(), "wav session opened");
        Ok(Box::new(WavFrameSource {
            tape: Arc::clone(&self.tape),
            rate: self.rate,
            pacer: Pacer::new(self.pace),
        }))
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }
}

/// One capture session over a [`WavFileDevice`].
pub struct WavFrameSource {
    tape: Arc<Mutex<Tape>>,
    rate: SampleRate,
    pacer: Pacer,
}

impl FrameSource for WavFrameSource {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<AudioFrame>> {
        if !self.pacer.wait(timeout) {
            return Ok(None);
        }
        let mut tape = self.tape.lock();
        let frame = match tape.frames.pop_front() {
            Some(frame) => frame,
            None => {
                let seq = tape.next_sequence;
                tape.next_sequence += 1;
                AudioFrame::silent(self.rate, seq)
            }
        };
        Ok(Some(frame))
    }

    fn sample_rate(&self) -> SampleRate {
        self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_wav(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("parley-{}-{name}.wav", std::process::id()))
    }

    #[test]
    fn written_pcm_loads_back_as_frames() {
        let path = temp_wav("roundtrip");
        let rate = SampleRate::Hz16000;
        let samples = vec![1200i16; rate.frame_len() * 3 + 10];
        write_pcm(&path, rate, &samples).expect("write wav");

        let frames = load_frames(&path, rate).expect("load wav");
        let _ = std::fs::remove_file(&path);

        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.is_well_formed()));
        // 1200 / 32768 * 32767 rounds to within one step of the original
        assert!((frames[1].samples()[0] - 1200).abs() <= 1);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(WavFileDevice::new("/definitely/not/here.wav", SampleRate::Hz16000).is_err());
    }

    #[test]
    fn sessions_continue_where_the_previous_one_stopped() {
        let path = temp_wav("continuous");
        let rate = SampleRate::Hz16000;
        let samples: Vec<i16> = (1..=4i16)
            .flat_map(|level| std::iter::repeat(level * 1_000).take(rate.frame_len()))
            .collect();
        write_pcm(&path, rate, &samples).expect("write wav");
        let device = WavFileDevice::new(&path, rate)
            .expect("open wav")
            .with_pace(Duration::from_millis(1));
        let _ = std::fs::remove_file(&path);

        let wait = Duration::from_millis(100);
        let mut first = device.open().expect("first session");
        let a = first.next_frame(wait).unwrap().unwrap();
        let b = first.next_frame(wait).unwrap().unwrap();
        drop(first);

        let mut second = device.open().expect("second session");
        let c = second.next_frame(wait).unwrap().unwrap();
        let d = second.next_frame(wait).unwrap().unwrap();
        let after = second.next_frame(wait).unwrap().unwrap();

        let seqs: Vec<u64> = [&a, &b, &c, &d, &after].iter().map(|f| f.sequence()).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        assert!((c.samples()[0] - 3_000).abs() <= 1);
        assert_eq!(after.samples()[0], 0);
        assert_eq!(device.remaining(), 0);
    }
}
