//! Utterance dumps: a transcriber decorator that writes every utterance it
//! is handed to a numbered WAV file before passing it on.

use std::path::PathBuf;

use parley_core::{audio::wav::write_pcm, AudioFrame, SampleRate, Transcriber};
use tracing::{info, warn};

pub struct SavingTranscriber<T> {
    inner: T,
    dir: PathBuf,
    saved: usize,
}

impl<T: Transcriber> SavingTranscriber<T> {
    pub fn new(inner: T, dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            inner,
            dir,
            saved: 0,
        })
    }

    pub fn saved(&self) -> usize {
        self.saved
    }

    fn next_path(&self) -> PathBuf {
        self.dir.join(format!("utterance-{:03}.wav", self.saved + 1))
    }
}

impl<T: Transcriber> Transcriber for SavingTranscriber<T> {
    fn transcribe(&mut self, frames: &[AudioFrame], rate: SampleRate) -> String {
        if !frames.is_empty() {
            let pcm: Vec<i16> = frames
                .iter()
                .flat_map(|f| f.samples().iter().copied())
                .collect();
            let path = self.next_path();
            // A failed dump never costs the user their turn.
            match write_pcm(&path, rate, &pcm) {
                Ok(()) => {
                    self.saved += 1;
                    info!(path = %path.display(), frames = frames.len(), "saved utterance");
                }
                Err(e) => warn!(path = %path.display(), "failed to save utterance: {e}"),
            }
        }
        self.inner.transcribe(frames, rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{audio::wav::load_frames, StubTranscriber};

    #[test]
    fn writes_one_file_per_utterance_and_delegates() {
        let dir = std::env::temp_dir().join(format!("parley-recorder-{}", std::process::id()));
        let rate = SampleRate::Hz16000;
        let frames: Vec<AudioFrame> = (0..4).map(|i| AudioFrame::constant(800, rate, i)).collect();

        let mut saving = SavingTranscriber::new(StubTranscriber::scripted(["hello"]), &dir)
            .expect("create dir");
        assert_eq!(saving.transcribe(&frames, rate), "hello");
        assert_eq!(saving.transcribe(&[], rate), "");
        assert_eq!(saving.saved(), 1);

        let reloaded = load_frames(&dir.join("utterance-001.wav"), rate).expect("reload");
        let _ = std::fs::remove_dir_all(&dir);
        assert_eq!(reloaded.len(), 4);
    }
}
