use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::time::Duration;
use tracing::info;

use crate::errors::{Result, StreamError};
use crate::utils::duration_str;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_allow_origin: Option<String>,
    /// Prefix for manifest URLs handed back to recording callers (e.g. "https://relay:8443").
    /// Relative URLs are returned when unset.
    pub public_base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_allow_origin: Some("*".to_string()),
            public_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: String,
    pub url: String,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(with = "duration_str", default = "default_refresh_interval")]
    pub refresh_interval: Duration,
    #[serde(with = "duration_str", default = "default_capture_timeout")]
    pub capture_timeout: Duration,
    #[serde(with = "duration_str", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
    #[serde(default = "default_true")]
    pub idle_eviction: bool,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize, // Snapshots buffered per subscriber before it lags
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_output_directory")]
    pub output_directory: String,
    #[serde(with = "duration_str", default = "default_segment_duration")]
    pub segment_duration: Duration,
    #[serde(default = "default_retention_segments")]
    pub retention_segments: usize,
    #[serde(with = "duration_str", default = "default_lock_timeout")]
    pub lock_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfmpegConfig {
    #[serde(default = "default_ffmpeg_binary")]
    pub binary: String,
    /// Demuxer for the piped camera feed (-f). Multipart MJPEG cameras need "mpjpeg".
    pub input_format: Option<String>,
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default = "default_crf")]
    pub crf: u8,
    #[serde(default = "default_preset")]
    pub preset: String,
    /// Decode snapshots through ffmpeg instead of cutting the first JPEG out of the feed.
    #[serde(default)]
    pub snapshot_via_ffmpeg: bool,
    pub extra_input_args: Option<Vec<String>>,
}

fn default_refresh_interval() -> Duration { Duration::from_secs(2) }
fn default_capture_timeout() -> Duration { Duration::from_secs(10) }
fn default_idle_timeout() -> Duration { Duration::from_secs(60) }
fn default_true() -> bool { true }
fn default_subscriber_buffer() -> usize { 16 }
fn default_output_directory() -> String { "recordings".to_string() }
fn default_segment_duration() -> Duration { Duration::from_secs(4) }
fn default_retention_segments() -> usize { 8 }
fn default_lock_timeout() -> Duration { Duration::from_secs(5) }
fn default_ffmpeg_binary() -> String { "ffmpeg".to_string() }
fn default_video_codec() -> String { "libx264".to_string() }
fn default_crf() -> u8 { 23 }
fn default_preset() -> String { "veryfast".to_string() }

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            capture_timeout: default_capture_timeout(),
            idle_timeout: default_idle_timeout(),
            idle_eviction: true,
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_directory: default_output_directory(),
            segment_duration: default_segment_duration(),
            retention_segments: default_retention_segments(),
            lock_timeout: default_lock_timeout(),
        }
    }
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary: default_ffmpeg_binary(),
            input_format: Some("mpjpeg".to_string()),
            video_codec: default_video_codec(),
            crf: default_crf(),
            preset: default_preset(),
            snapshot_via_ffmpeg: false,
            extra_input_args: None,
        }
    }
}

impl CameraConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = if path.ends_with(".json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };

        config.validate()?;
        info!("Loaded configuration from '{}' with {} camera(s)", path, config.cameras.len());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if camera.id.trim().is_empty() {
                return Err(StreamError::config("Camera id must not be empty"));
            }
            if !seen.insert(camera.id.as_str()) {
                return Err(StreamError::config(format!("Duplicate camera id '{}'", camera.id)));
            }
        }

        if self.recording.retention_segments == 0 {
            return Err(StreamError::config("recording.retention_segments must be at least 1"));
        }

        Ok(())
    }
}
