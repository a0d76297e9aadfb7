//! Persistent host settings (JSON file in the user data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parley_core::{EngineConfig, SampleRate, Sensitivity, FRAME_MS};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub assistant_name: String,
    pub preferred_input_device: Option<String>,
    pub sample_rate: u32,
    pub vad_sensitivity: u8,
    pub listen_energy_threshold: f64,
    pub interrupt_energy_threshold: f64,
    /// Trailing silence that ends an utterance.
    pub end_of_speech_ms: u64,
    pub max_listen_secs: u64,
    pub barge_in_confirm_frames: usize,
    /// Pace of the simulated voice.
    pub speech_words_per_minute: u32,
    pub save_utterances_dir: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            assistant_name: "Parley".into(),
            preferred_input_device: None,
            sample_rate: engine.sample_rate.hz(),
            vad_sensitivity: engine.vad_sensitivity.level(),
            listen_energy_threshold: engine.listen_energy_threshold,
            interrupt_energy_threshold: engine.interrupt_energy_threshold,
            end_of_speech_ms: engine.silence_frames as u64 * FRAME_MS,
            max_listen_secs: engine.max_listen.as_secs(),
            barge_in_confirm_frames: engine.barge_in_confirm_frames,
            speech_words_per_minute: 180,
            save_utterances_dir: None,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.assistant_name = match self.assistant_name.trim() {
            "" => "Parley".into(),
            name => name.to_string(),
        };
        self.preferred_input_device = trimmed(self.preferred_input_device.take());
        self.save_utterances_dir = trimmed(self.save_utterances_dir.take());
        if SampleRate::from_hz(self.sample_rate).is_err() {
            self.sample_rate = SampleRate::default().hz();
        }
        self.vad_sensitivity = self.vad_sensitivity.min(3);
        self.listen_energy_threshold = clamp_energy(self.listen_energy_threshold, 250_000.0);
        self.interrupt_energy_threshold = clamp_energy(self.interrupt_energy_threshold, 10_000.0);
        self.end_of_speech_ms = self.end_of_speech_ms.clamp(FRAME_MS * 5, 5_000);
        self.max_listen_secs = self.max_listen_secs.clamp(1, 120);
        self.barge_in_confirm_frames = self.barge_in_confirm_frames.clamp(1, 10);
        self.speech_words_per_minute = self.speech_words_per_minute.clamp(60, 400);
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            sample_rate: SampleRate::from_hz(self.sample_rate).unwrap_or_default(),
            vad_sensitivity: Sensitivity::new(self.vad_sensitivity),
            listen_energy_threshold: self.listen_energy_threshold,
            interrupt_energy_threshold: self.interrupt_energy_threshold,
            silence_frames: (self.end_of_speech_ms / FRAME_MS).max(1) as usize,
            max_listen: Duration::from_secs(self.max_listen_secs),
            barge_in_confirm_frames: self.barge_in_confirm_frames,
            preferred_input_device: self.preferred_input_device.clone(),
            ..EngineConfig::default()
        }
    }

    /// Duration of one simulated word.
    pub fn word_duration(&self) -> Duration {
        Duration::from_millis(60_000 / self.speech_words_per_minute.max(1) as u64)
    }

    pub fn welcome_message(&self) -> String {
        format!("Hello, I am {}. What would you like to talk about?", self.assistant_name)
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn clamp_energy(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0e9)
    } else {
        fallback
    }
}

/// Environment variables win over the settings file, for one-off runs.
pub fn apply_env_overrides(settings: &mut AppSettings) {
    if let Ok(device) = std::env::var("PARLEY_INPUT_DEVICE") {
        settings.preferred_input_device = Some(device);
    }
    if let Some(level) = env_parse::<u8>("PARLEY_VAD_SENSITIVITY") {
        settings.vad_sensitivity = level;
    }
    if let Some(threshold) = env_parse::<f64>("PARLEY_INTERRUPT_ENERGY") {
        settings.interrupt_energy_threshold = threshold;
    }
    if let Some(threshold) = env_parse::<f64>("PARLEY_LISTEN_ENERGY") {
        settings.listen_energy_threshold = threshold;
    }
    settings.normalize();
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Parley")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("parley")
            .join("settings.json")
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
