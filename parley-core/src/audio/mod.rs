//! Frame sources: where 30 ms PCM frames come from.
//!
//! A [`CaptureDevice`] is opened once per capture session (one listen cycle
//! or one barge-in watch) and yields a [`FrameSource`]. Dropping the source
//! closes the device; nothing else holds it open.
//!
//! Consumers pull frames with a bounded wait instead of being called back on
//! an arbitrary driver thread, so ordering and backpressure stay explicit.

pub mod device;
#[cfg(feature = "audio-cpal")]
pub mod microphone;
pub mod resample;
pub mod scripted;
pub mod wav;

use std::time::Duration;

use crate::buffering::frame::{AudioFrame, SampleRate};
use crate::error::Result;

#[cfg(feature = "audio-cpal")]
pub use microphone::MicrophoneDevice;
pub use scripted::{ScriptedDevice, ScriptedSource};
pub use wav::{WavFileDevice, WavFrameSource};

/// A stream of fixed-duration frames from one open device.
pub trait FrameSource: Send {
    /// Wait up to `timeout` for the next frame.
    ///
    /// `Ok(None)` means nothing arrived in time (a silent or stalled device);
    /// `Err(DeviceUnavailable)` means the device is gone.
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<AudioFrame>>;

    /// Rate of every frame this source yields.
    fn sample_rate(&self) -> SampleRate;
}

/// Something that can be opened for capture, one session at a time.
pub trait CaptureDevice: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>>;

    /// Human-readable name for logs.
    fn name(&self) -> String {
        "capture device".to_string()
    }
}
