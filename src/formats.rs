#![forbid(unsafe_code)]

//! Stream descriptors and the ladder-based selection that turns them into the
//! handful of download options shown to users.
//!
//! The extraction backend can offer dozens of variants for a single video
//! (DASH video-only streams, muxed progressive streams, several audio
//! bitrates). Users only ever pick from a short fixed list: four video
//! resolutions and two audio tiers. Each rung of those ladders is backed by
//! the first descriptor that satisfies it, in the order the backend listed
//! them.

use serde::{Deserialize, Serialize};

pub const VIDEO_CONTAINER: &str = "mp4";
pub const AUDIO_CONTAINER: &str = "mp3";
pub const UNKNOWN_SIZE: &str = "Unknown size";

/// Preferred video resolutions, best first.
pub const VIDEO_LADDER: [&str; 4] = ["1080p", "720p", "480p", "360p"];

/// Preferred audio tiers, best first.
pub const AUDIO_LADDER: [(&str, AudioQualityTier); 2] = [
    ("High", AudioQualityTier::High),
    ("Medium", AudioQualityTier::Medium),
];

/// Audio quality bucket reported for audio-capable streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioQualityTier {
    #[serde(rename = "AUDIO_QUALITY_HIGH")]
    High,
    #[serde(rename = "AUDIO_QUALITY_MEDIUM")]
    Medium,
    #[serde(rename = "AUDIO_QUALITY_LOW")]
    Low,
    #[serde(rename = "AUDIO_QUALITY_ULTRALOW")]
    UltraLow,
}

/// One encoded stream variant as reported by the extraction backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStreamDescriptor {
    pub identifier: String,
    pub has_video_track: bool,
    pub has_audio_track: bool,
    pub container_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_quality_tier: Option<AudioQualityTier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub byte_length: Option<u64>,
}

/// A user-facing download choice. Field names on the wire follow what the
/// web client already reads (`itag`, `quality`, `container`, `size`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalOption {
    #[serde(rename = "itag")]
    pub identifier: String,
    #[serde(rename = "quality")]
    pub display_label: String,
    #[serde(rename = "container")]
    pub container_format: String,
    #[serde(rename = "size")]
    pub size_display: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOptions {
    pub video: Vec<CanonicalOption>,
    pub audio: Vec<CanonicalOption>,
}

impl FormatOptions {
    pub fn is_empty(&self) -> bool {
        self.video.is_empty() && self.audio.is_empty()
    }
}

/// Reduces the backend's descriptor list to at most one option per ladder
/// rung. An empty result is valid and left for the caller to present.
pub fn normalize(descriptors: &[RawStreamDescriptor]) -> FormatOptions {
    FormatOptions {
        video: select_video(descriptors),
        audio: select_audio(descriptors),
    }
}

fn select_video(descriptors: &[RawStreamDescriptor]) -> Vec<CanonicalOption> {
    VIDEO_LADDER
        .iter()
        .filter_map(|label| {
            // Substring match so "1080p60" still backs the "1080p" rung.
            descriptors
                .iter()
                .find(|descriptor| {
                    descriptor.container_format == VIDEO_CONTAINER
                        && descriptor
                            .quality_label
                            .as_deref()
                            .is_some_and(|quality| quality.contains(label))
                })
                .map(|descriptor| option_for(descriptor, label, VIDEO_CONTAINER))
        })
        .collect()
}

fn select_audio(descriptors: &[RawStreamDescriptor]) -> Vec<CanonicalOption> {
    AUDIO_LADDER
        .iter()
        .filter_map(|(label, tier)| {
            descriptors
                .iter()
                .find(|descriptor| {
                    !descriptor.has_video_track && descriptor.audio_quality_tier == Some(*tier)
                })
                .map(|descriptor| option_for(descriptor, label, AUDIO_CONTAINER))
        })
        .collect()
}

fn option_for(descriptor: &RawStreamDescriptor, label: &str, container: &str) -> CanonicalOption {
    CanonicalOption {
        identifier: descriptor.identifier.clone(),
        display_label: label.to_string(),
        container_format: container.to_string(),
        size_display: format_size(descriptor.byte_length),
    }
}

/// Renders a byte count as megabytes with two decimals.
pub fn format_size(bytes: Option<u64>) -> String {
    match bytes {
        Some(bytes) => format!("{:.2} MB", bytes as f64 / 1024.0 / 1024.0),
        None => UNKNOWN_SIZE.to_string(),
    }
}

/// Renders a duration as `M:SS`. Minutes are not rolled over into hours.
pub fn format_duration(total_seconds: u64) -> String {
    let minutes = total_seconds / 60;
    let seconds = total_seconds % 60;
    format!("{minutes}:{seconds:02}")
}
