//! A synthesizer that "speaks" one word per tick into a log.
//!
//! Stands in for a real TTS engine in tests and in the headless host.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;

use super::{SpeechSynthesizer, SynthesisProgress};
use crate::error::{ParleyError, Result};

#[derive(Default)]
struct LogInner {
    spoken: Mutex<Vec<String>>,
    begun: AtomicUsize,
    halts: AtomicUsize,
}

/// Read side of a [`SimulatedSynthesizer`], usable after the synthesizer has
/// been moved into a controller.
#[derive(Clone, Default)]
pub struct SynthesisLog {
    inner: Arc<LogInner>,
}

impl SynthesisLog {
    /// Words emitted so far, across all utterances.
    pub fn spoken(&self) -> Vec<String> {
        self.inner.spoken.lock().clone()
    }

    /// Utterances started.
    pub fn begun(&self) -> usize {
        self.inner.begun.load(Ordering::SeqCst)
    }

    pub fn halts(&self) -> usize {
        self.inner.halts.load(Ordering::SeqCst)
    }
}

pub struct SimulatedSynthesizer {
    tick: Duration,
    pending: VecDeque<String>,
    log: SynthesisLog,
    fail_after: Option<usize>,
    ticks: usize,
    echo: bool,
}

impl SimulatedSynthesizer {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            pending: VecDeque::new(),
            log: SynthesisLog::default(),
            fail_after: None,
            ticks: 0,
            echo: false,
        }
    }

    /// Fail with a synthesis error on tick `n` of every utterance.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Print each word to stdout as it is "spoken".
    pub fn echoing(mut self) -> Self {
        self.echo = true;
        self
    }

    pub fn log(&self) -> SynthesisLog {
        self.log.clone()
    }
}

impl SpeechSynthesizer for SimulatedSynthesizer {
    fn begin(&mut self, text: &str) -> Result<()> {
        self.pending = text.split_whitespace().map(str::to_string).collect();
        self.ticks = 0;
        self.log.inner.begun.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn tick(&mut self) -> Result<SynthesisProgress> {
        if self.fail_after == Some(self.ticks) {
            return Err(ParleyError::Synthesis("simulated engine fault".into()));
        }
        self.ticks += 1;
        let Some(word) = self.pending.pop_front() else {
            return Ok(SynthesisProgress::Finished);
        };
        std::thread::sleep(self.tick);
        if self.echo {
            print!("{word} ");
            if self.pending.is_empty() {
                println!();
            }
        }
        self.log.inner.spoken.lock().push(word);
        Ok(SynthesisProgress::Playing)
    }

    fn halt(&mut self) {
        self.pending.clear();
        if self.echo {
            println!(" [stopped]");
        }
        self.log.inner.halts.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}
