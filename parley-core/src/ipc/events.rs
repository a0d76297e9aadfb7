//! Events broadcast by the turn coordinator.
//!
//! ## Channels
//!
//! | Event | Subscribe with |
//! |-------|----------------|
//! | `TurnStateEvent` | `TurnCoordinator::subscribe_states` |
//! | `InterruptEvent` | `TurnCoordinator::subscribe_interrupts` |
//! | `AudioActivityEvent` | `TurnCoordinator::subscribe_activity` |
//!
//! Field names are camelCase and enum values lowercase so a GUI or API layer
//! can forward them as JSON unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Turn state
// ---------------------------------------------------------------------------

/// Where the conversation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    /// Nothing in progress.
    Idle,
    /// Capturing the user (or ready to, after a barge-in).
    Listening,
    /// An utterance is with transcription / dialogue.
    Processing,
    /// A reply is playing and barge-in is armed.
    Speaking,
}

/// Emitted on every committed transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnStateEvent {
    /// Monotonically increasing; gaps never occur, so a consumer can detect
    /// lag from the sequence alone.
    pub seq: u64,
    pub from: TurnState,
    pub to: TurnState,
}

// ---------------------------------------------------------------------------
// Barge-in
// ---------------------------------------------------------------------------

/// Raised at most once per playback session when the user talks over it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptEvent {
    pub session_id: u64,
    pub timestamp: DateTime<Utc>,
    /// Mean-square energy of the frame that fired.
    pub energy: f64,
    /// Classifier verdict for that frame; `None` in energy-only mode.
    pub vad: Option<bool>,
}

// ---------------------------------------------------------------------------
// Audio activity
// ---------------------------------------------------------------------------

/// One per analysed frame while capturing (listen cycles and barge-in).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioActivityEvent {
    pub seq: u64,
    /// Mean-square energy of the frame.
    pub energy: f64,
    /// The verdict of the policy in force: onset while listening,
    /// interrupt while speaking.
    pub is_speech: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_state_event_uses_lowercase_states() {
        let event = TurnStateEvent {
            seq: 4,
            from: TurnState::Speaking,
            to: TurnState::Listening,
        };
        let json = serde_json::to_value(&event).expect("serialize state event");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["from"], "speaking");
        assert_eq!(json["to"], "listening");

        let back: TurnStateEvent = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.to, TurnState::Listening);
    }

    #[test]
    fn turn_state_rejects_other_casing() {
        assert!(serde_json::from_str::<TurnState>(r#""Idle""#).is_err());
        assert_eq!(
            serde_json::from_str::<TurnState>(r#""processing""#).unwrap(),
            TurnState::Processing
        );
    }

    #[test]
    fn interrupt_event_serializes_with_camel_case_fields() {
        let event = InterruptEvent {
            session_id: 9,
            timestamp: Utc::now(),
            energy: 42_000.5,
            vad: None,
        };
        let json = serde_json::to_value(&event).expect("serialize interrupt");
        assert_eq!(json["sessionId"], 9);
        assert!(json["timestamp"].is_string());
        assert!(json["vad"].is_null());
        let energy = json["energy"].as_f64().expect("energy is a number");
        assert!((energy - 42_000.5).abs() < 1e-9);
    }

    #[test]
    fn audio_activity_event_serializes_with_camel_case_fields() {
        let event = AudioActivityEvent {
            seq: 3,
            energy: 250_000.0,
            is_speech: true,
        };
        let json = serde_json::to_value(&event).expect("serialize activity event");
        assert_eq!(json["isSpeech"], true);
        let back: AudioActivityEvent = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.seq, 3);
    }
}
