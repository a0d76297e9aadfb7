//! Energy gate: mean squared amplitude against a threshold.
//!
//! Pure and stateless. It is a secondary signal, so malformed buffers yield
//! an energy of 0 instead of an error.

use crate::buffering::frame::AudioFrame;

/// Mean-square energy of i16 PCM, in squared sample units
/// (a full-scale square wave is ≈ 1.07e9).
#[derive(Debug, Default, Clone, Copy)]
pub struct EnergyGate;

impl EnergyGate {
    /// Mean squared amplitude of the frame, or 0 for an empty buffer.
    pub fn energy(frame: &AudioFrame) -> f64 {
        Self::energy_of(frame.samples())
    }

    pub fn energy_of(samples: &[i16]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = samples
            .iter()
            .map(|&s| {
                let v = s as f64;
                v * v
            })
            .sum();
        sum_sq / samples.len() as f64
    }

    /// Strictly above `threshold`.
    pub fn exceeds(frame: &AudioFrame, threshold: f64) -> bool {
        Self::energy(frame) > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::frame::SampleRate;
    use approx::assert_relative_eq;

    #[test]
    fn silence_has_zero_energy() {
        let frame = AudioFrame::silent(SampleRate::Hz16000, 0);
        assert_eq!(EnergyGate::energy(&frame), 0.0);
        assert!(!EnergyGate::exceeds(&frame, 0.0));
    }

    #[test]
    fn square_wave_energy_is_amplitude_squared() {
        let samples: Vec<i16> = (0..480).map(|i| if i % 2 == 0 { 500 } else { -500 }).collect();
        let frame = AudioFrame::new(samples, SampleRate::Hz16000, 0);
        assert_relative_eq!(EnergyGate::energy(&frame), 250_000.0);
    }

    #[test]
    fn threshold_is_strict() {
        let frame = AudioFrame::constant(100, SampleRate::Hz8000, 0);
        assert!(!EnergyGate::exceeds(&frame, 10_000.0));
        assert!(EnergyGate::exceeds(&frame, 9_999.0));
    }

    #[test]
    fn empty_buffer_is_zero_not_error() {
        let frame = AudioFrame::new(Vec::new(), SampleRate::Hz16000, 0);
        assert_eq!(EnergyGate::energy(&frame), 0.0);
    }

    #[test]
    fn extreme_samples_do_not_overflow() {
        let frame = AudioFrame::constant(i16::MIN, SampleRate::Hz48000, 0);
        assert_relative_eq!(EnergyGate::energy(&frame), 32768.0 * 32768.0);
    }
}
