//! Placeholder backends so the whole turn loop runs without models.

use std::collections::VecDeque;

use tracing::debug;

use super::{DialogueBackend, Transcriber};
use crate::buffering::frame::{AudioFrame, SampleRate, FRAME_MS};

/// Describes the audio instead of recognising it:
/// `"[stub: <N> frames, <ms> ms @ <SR> Hz]"`.
///
/// Optionally replays a queue of canned transcripts first, which is how
/// tests script a conversation.
#[derive(Debug, Default)]
pub struct StubTranscriber {
    scripted: VecDeque<String>,
    calls: usize,
}

impl StubTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return these transcripts, in order, before falling back to the
    /// description.
    pub fn scripted<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scripted: lines.into_iter().map(Into::into).collect(),
            calls: 0,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl Transcriber for StubTranscriber {
    fn transcribe(&mut self, frames: &[AudioFrame], rate: SampleRate) -> String {
        self.calls += 1;
        if let Some(line) = self.scripted.pop_front() {
            return line;
        }
        if frames.is_empty() {
            return String::new();
        }
        debug!(frames = frames.len(), "stub transcription");
        format!(
            "[stub: {} frames, {} ms @ {} Hz]",
            frames.len(),
            frames.len() as u64 * FRAME_MS,
            rate.hz()
        )
    }
}

const HISTORY_LIMIT: usize = 20;

const INTENTS: &[(&str, &[&str], &[&str])] = &[
    (
        "greeting",
        &["hello", "hi", "hey", "good morning", "good evening"],
        &[
            "Hello! Nice to hear from you. How is your day going?",
            "Hi there! What can I do for you?",
        ],
    ),
    (
        "farewell",
        &["bye", "goodbye", "see you", "good night"],
        &["Goodbye! Talk to you soon.", "Bye, have a good one!"],
    ),
    (
        "thanks",
        &["thanks", "thank you", "cheers"],
        &["You're welcome!", "Happy to help."],
    ),
];

/// Rule-based dialogue: a few keyword intents with canned replies, otherwise
/// it repeats what it heard. Replies rotate deterministically.
#[derive(Debug, Default)]
pub struct EchoDialogue {
    history: Vec<(String, String)>,
    turn: usize,
}

impl EchoDialogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent exchanges, oldest first, capped at 20.
    pub fn history(&self) -> &[(String, String)] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    fn intent_reply(&self, lowered: &str) -> Option<&'static str> {
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .filter(|w| !w.is_empty())
            .collect();
        let bigrams: Vec<String> = words.windows(2).map(|w| w.join(" ")).collect();

        INTENTS.iter().find_map(|(_, keywords, replies)| {
            let hit = words.iter().any(|w| keywords.contains(w))
                || bigrams.iter().any(|b| keywords.contains(&b.as_str()));
            hit.then(|| replies[self.turn % replies.len()])
        })
    }
}

impl DialogueBackend for EchoDialogue {
    fn generate_reply(&mut self, text: &str, emotion: Option<&str>) -> String {
        let text = text.trim();
        if text.is_empty() {
            return String::new();
        }
        let lowered = text.to_lowercase();
        let reply = match (self.intent_reply(&lowered), emotion) {
            (Some(canned), _) => canned.to_string(),
            (None, Some("sad")) => format!("That sounds hard. You said: {text}"),
            (None, _) => format!("You said: {text}"),
        };

        self.turn += 1;
        self.history.push((text.to_string(), reply.clone()));
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
        reply
    }
}
