//! Audio framing and the lock-free SPSC ring between the capture callback
//! and the framing thread.
//!
//! Uses `ringbuf::HeapRb<f32>` which provides a wait-free `push_slice`
//! safe to call from the real-time audio callback.

pub mod frame;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Producer};

/// Producer half, held by the audio callback thread.
pub type SampleProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the framing thread.
pub type SampleConsumer = ringbuf::HeapCons<f32>;

/// 2^18 = 262 144 f32 samples ≈ 5.4 s at 48 kHz. The framing thread drains
/// every few milliseconds, so this only absorbs scheduler hiccups.
pub const RING_CAPACITY: usize = 1 << 18;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_sample_ring() -> (SampleProducer, SampleConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}

/// Convert a normalised f32 sample in [-1.0, 1.0] to i16 PCM.
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Cuts a stream of i16 samples into fixed-length frames with a running
/// sequence counter.
#[derive(Debug)]
pub struct FrameAssembler {
    sample_rate: frame::SampleRate,
    pending: Vec<i16>,
    next_sequence: u64,
}

impl FrameAssembler {
    pub fn new(sample_rate: frame::SampleRate) -> Self {
        Self {
            sample_rate,
            pending: Vec::with_capacity(sample_rate.frame_len() * 2),
            next_sequence: 0,
        }
    }

    /// Append samples; returns every complete frame now available.
    pub fn push(&mut self, samples: &[i16]) -> Vec<frame::AudioFrame> {
        self.pending.extend_from_slice(samples);
        let len = self.sample_rate.frame_len();
        let mut out = Vec::new();
        while self.pending.len() >= len {
            let rest = self.pending.split_off(len);
            let block = std::mem::replace(&mut self.pending, rest);
            out.push(frame::AudioFrame::new(
                block,
                self.sample_rate,
                self.next_sequence,
            ));
            self.next_sequence += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::frame::SampleRate;
    use super::*;

    #[test]
    fn assembler_emits_whole_frames_and_keeps_remainder() {
        let mut asm = FrameAssembler::new(SampleRate::Hz8000);
        assert!(asm.push(&[1; 200]).is_empty());
        let frames = asm.push(&[2; 300]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].sequence(), 0);
        assert_eq!(frames[1].sequence(), 1);
        assert!(frames.iter().all(|f| f.is_well_formed()));
        assert_eq!(frames[0].samples()[199], 1);
        assert_eq!(frames[0].samples()[200], 2);
        // 500 - 480 = 20 samples left over
        assert_eq!(asm.push(&[3; 220]).len(), 1);
    }

    #[test]
    fn f32_conversion_clamps() {
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(-2.0), -i16::MAX);
    }

    #[test]
    fn ring_round_trips_samples() {
        let (mut prod, mut cons) = create_sample_ring();
        assert_eq!(prod.push_slice(&[0.25, -0.5]), 2);
        let mut out = [0f32; 4];
        assert_eq!(cons.pop_slice(&mut out), 2);
        assert_eq!(&out[..2], &[0.25, -0.5]);
    }
}
