//! Input device enumeration for settings screens and `--list-devices`.

use serde::{Deserialize, Serialize};

/// Metadata about an audio input device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
    /// Best guess at the device a user would talk into.
    pub is_recommended: bool,
}

/// Names that usually mean "capture what the speakers play". Picking one of
/// these as the barge-in source makes the engine interrupt itself.
const LOOPBACK_HINTS: &[&str] = &[
    "stereo mix",
    "what u hear",
    "loopback",
    "monitor of",
    "speakers (",
];

const MIC_HINTS: &[&str] = &["microphone", "mic", "headset", "array", "usb"];

pub fn looks_like_loopback(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    LOOPBACK_HINTS.iter().any(|k| lowered.contains(k))
}

/// Higher is better.
pub fn input_rank(name: &str, is_default: bool) -> i32 {
    let lowered = name.to_ascii_lowercase();
    let mut rank = if looks_like_loopback(&lowered) { -10 } else { 5 };
    if MIC_HINTS.iter().any(|k| lowered.contains(k)) {
        rank += 3;
    }
    if is_default {
        rank += 2;
    }
    rank
}

/// Mark the highest-ranked entry as recommended and sort it first.
pub fn recommend(mut devices: Vec<DeviceInfo>) -> Vec<DeviceInfo> {
    if let Some(best) = devices
        .iter_mut()
        .max_by_key(|d| input_rank(&d.name, d.is_default))
    {
        best.is_recommended = true;
    }
    devices.sort_by_key(|d| (!d.is_recommended, !d.is_default, d.name.to_ascii_lowercase()));
    devices
}

/// List available input devices. Empty when capture support is compiled out.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = match host.input_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                DeviceInfo {
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    name,
                    is_recommended: false,
                }
            })
            .collect(),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            Vec::new()
        }
    };
    recommend(devices)
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    Vec::new()
}
