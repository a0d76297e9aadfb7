//! Collaborators the engine hands work to but does not own.
//!
//! Both traits are infallible by contract: a backend that fails returns an
//! empty string, which the coordinator treats as "nothing to say".
//! `&mut self` lets implementations keep decoder state or chat history.

pub mod stub;

pub use stub::{EchoDialogue, StubTranscriber};

use crate::buffering::frame::{AudioFrame, SampleRate};

/// Speech-to-text.
pub trait Transcriber: Send {
    /// Transcribe a captured utterance. Empty on failure or no words.
    fn transcribe(&mut self, frames: &[AudioFrame], rate: SampleRate) -> String;
}

/// Response generation.
pub trait DialogueBackend: Send {
    /// Reply to `text`; `emotion` is an optional hint such as `"calm"`.
    fn generate_reply(&mut self, text: &str, emotion: Option<&str>) -> String;
}

impl<T: Transcriber + ?Sized> Transcriber for Box<T> {
    fn transcribe(&mut self, frames: &[AudioFrame], rate: SampleRate) -> String {
        (**self).transcribe(frames, rate)
    }
}

impl<D: DialogueBackend + ?Sized> DialogueBackend for Box<D> {
    fn generate_reply(&mut self, text: &str, emotion: Option<&str>) -> String {
        (**self).generate_reply(text, emotion)
    }
}
