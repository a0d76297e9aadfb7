//! Fixed-duration PCM frames: the unit of classification and timing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};

/// Every frame spans exactly this many milliseconds.
pub const FRAME_MS: u64 = 30;

/// Frame duration as a `Duration`.
pub const FRAME_DURATION: Duration = Duration::from_millis(FRAME_MS);

/// Sample rates accepted by the speech classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum SampleRate {
    Hz8000,
    Hz16000,
    Hz32000,
    Hz48000,
}

impl SampleRate {
    pub fn from_hz(hz: u32) -> Result<Self> {
        match hz {
            8_000 => Ok(Self::Hz8000),
            16_000 => Ok(Self::Hz16000),
            32_000 => Ok(Self::Hz32000),
            48_000 => Ok(Self::Hz48000),
            other => Err(ParleyError::UnsupportedSampleRate(other)),
        }
    }

    pub fn hz(self) -> u32 {
        match self {
            Self::Hz8000 => 8_000,
            Self::Hz16000 => 16_000,
            Self::Hz32000 => 32_000,
            Self::Hz48000 => 48_000,
        }
    }

    /// Samples in one 30 ms frame at this rate (240, 480, 960 or 1440).
    pub fn frame_len(self) -> usize {
        (self.hz() as u64 * FRAME_MS / 1000) as usize
    }
}

impl Default for SampleRate {
    fn default() -> Self {
        Self::Hz16000
    }
}

impl TryFrom<u32> for SampleRate {
    type Error = ParleyError;

    fn try_from(hz: u32) -> Result<Self> {
        Self::from_hz(hz)
    }
}

impl From<SampleRate> for u32 {
    fn from(rate: SampleRate) -> u32 {
        rate.hz()
    }
}

/// One 30 ms block of mono signed 16-bit PCM.
///
/// Immutable once produced. The length is *not* validated here: malformed
/// frames must be representable so that consumers can reject them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: SampleRate,
    sequence: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: SampleRate, sequence: u64) -> Self {
        Self {
            samples,
            sample_rate,
            sequence,
        }
    }

    /// A frame of digital silence at the correct length.
    pub fn silent(sample_rate: SampleRate, sequence: u64) -> Self {
        Self::new(vec![0; sample_rate.frame_len()], sample_rate, sequence)
    }

    /// A correctly sized frame filled with a constant amplitude.
    pub fn constant(amplitude: i16, sample_rate: SampleRate, sequence: u64) -> Self {
        Self::new(
            vec![amplitude; sample_rate.frame_len()],
            sample_rate,
            sequence,
        )
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    /// Position of this frame in its capture session, starting at 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// True when the sample count matches the frame size for the rate.
    pub fn is_well_formed(&self) -> bool {
        self.samples.len() == self.sample_rate.frame_len()
    }
}
