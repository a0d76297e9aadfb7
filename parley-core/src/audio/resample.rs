//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Capture devices commonly run at 44.1 or 48 kHz and WAV files can be at
//! any rate, while the classifier only accepts 8/16/32/48 kHz. `RateConverter`
//! bridges that gap on the framing thread, where allocation is allowed.
//! When the rates already match no rubato session is created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, error};

use crate::error::{ParleyError, Result};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input blocks between calls.
    input_buf: Vec<f32>,
    chunk_size: usize,
    /// `[1][output_frames_max]`
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// `chunk_size` is the number of input samples handed to rubato per call.
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let ratio = target_rate as f64 / source_rate as f64;
        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
            .map_err(|e| ParleyError::DeviceUnavailable(format!("resampler init: {e}")))?;
        let output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];

        debug!(source_rate, target_rate, chunk_size, "resampler ready");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf,
        })
    }

    /// Feed samples; returns whatever output is ready (may be empty).
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);
        let mut result = Vec::new();

        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];
            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => error!("resampler process error: {e}"),
            }
            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    /// Pad the pending remainder with silence and push it through.
    /// Used at end of input (WAV replay) so the tail is not lost.
    pub fn flush(&mut self) -> Vec<f32> {
        if self.resampler.is_none() || self.input_buf.is_empty() {
            return Vec::new();
        }
        let pad = self.chunk_size - self.input_buf.len();
        self.process(&vec![0.0; pad])
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}
