//! Configuration management for race-timer

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::{
    CaptureConstraints, FfmpegSettings, RecorderSettings, DEFAULT_PREFERRED_MEDIA_TYPES,
};
use crate::race::RaceSettings;
use crate::transport::TcpTransportSettings;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Race timing calibration
    #[serde(default)]
    pub race: RaceConfig,

    /// Peer link
    #[serde(default)]
    pub transport: TransportConfig,

    /// Finish-line camera
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Start cue playback
    #[serde(default)]
    pub cue: CueConfig,

    /// Where finished recordings are saved
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceConfig {
    /// Delay between commit and start; must match the cue length (ms)
    #[serde(default = "default_lead_time")]
    pub lead_time_ms: u64,

    /// Race clock display cadence (ms)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Address to accept the peer on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Host advertised in the peer id; detected from the outbound interface when unset
    pub advertise_host: Option<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    /// ffmpeg demuxer for the camera (`v4l2`, `avfoundation`, `dshow`)
    #[serde(default = "default_input_format")]
    pub input_format: String,

    /// ffmpeg demuxer for a separate audio device
    #[serde(default = "default_audio_input_format")]
    pub audio_input_format: String,

    /// Camera device
    #[serde(default = "default_device")]
    pub device: String,

    /// Separate audio device; unset when audio comes with the camera input
    pub audio_device: Option<String>,

    #[serde(default = "default_true")]
    pub capture_audio: bool,

    /// How often recorder output is handed over (ms)
    #[serde(default = "default_chunk_interval")]
    pub chunk_interval_ms: u64,

    /// Encodings to try, best first
    #[serde(default = "default_preferred_media_types")]
    pub preferred_media_types: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CueConfig {
    /// Player and its options, e.g. `["ffplay", "-nodisp", "-autoexit"]`.
    /// Empty means a silent cue.
    #[serde(default)]
    pub command: Vec<String>,

    /// Audio file handed to the player
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Directory recordings are saved to
    #[serde(default = "default_recording_output_directory_option")]
    pub output_directory: Option<PathBuf>,
}

// Default value functions
fn default_lead_time() -> u64 {
    12_700 // length of the bundled cue
}

fn default_tick_interval() -> u64 {
    10
}

fn default_listen_addr() -> String {
    "0.0.0.0:7878".to_string()
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_input_format() -> String {
    crate::capture::default_input_format().to_string()
}

fn default_audio_input_format() -> String {
    "pulse".to_string()
}

fn default_device() -> String {
    if cfg!(target_os = "macos") {
        "0".to_string()
    } else if cfg!(target_os = "windows") {
        "video=Integrated Camera".to_string()
    } else {
        "/dev/video0".to_string()
    }
}

fn default_true() -> bool {
    true
}

fn default_chunk_interval() -> u64 {
    1_000
}

fn default_preferred_media_types() -> Vec<String> {
    DEFAULT_PREFERRED_MEDIA_TYPES.iter().map(|s| s.to_string()).collect()
}

fn default_recording_output_directory() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|dirs| dirs.video_dir().map(Path::to_path_buf))
        .unwrap_or_else(std::env::temp_dir)
        .join("race-timer")
}

fn default_recording_output_directory_option() -> Option<PathBuf> {
    Some(default_recording_output_directory())
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            lead_time_ms: default_lead_time(),
            tick_interval_ms: default_tick_interval(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            advertise_host: None,
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            input_format: default_input_format(),
            audio_input_format: default_audio_input_format(),
            device: default_device(),
            audio_device: None,
            capture_audio: true,
            chunk_interval_ms: default_chunk_interval(),
            preferred_media_types: default_preferred_media_types(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_directory: default_recording_output_directory_option(),
        }
    }
}

impl Config {
    /// Load configuration from `path` (or the default location), creating a
    /// default file when none exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

            config.config_path = Some(config_path);
            Ok(config)
        } else {
            // Create default config
            let config = Config {
                config_path: Some(config_path),
                ..Config::default()
            };
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "race-timer", "race-timer")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    pub fn race_settings(&self) -> RaceSettings {
        RaceSettings {
            lead_time: Duration::from_millis(self.race.lead_time_ms),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.race.tick_interval_ms.max(1))
    }

    pub fn transport_settings(&self) -> Result<TcpTransportSettings> {
        let listen_addr: SocketAddr = self
            .transport
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid listen_addr: {}", self.transport.listen_addr))?;

        Ok(TcpTransportSettings {
            listen_addr,
            advertise_host: self.transport.advertise_host.clone(),
            connect_timeout: Duration::from_millis(self.transport.connect_timeout_ms),
        })
    }

    pub fn ffmpeg_settings(&self) -> FfmpegSettings {
        FfmpegSettings {
            ffmpeg_path: self.capture.ffmpeg_path.clone(),
            input_format: self.capture.input_format.clone(),
            audio_input_format: self.capture.audio_input_format.clone(),
        }
    }

    pub fn recorder_settings(&self) -> RecorderSettings {
        RecorderSettings {
            preferred_media_types: self.capture.preferred_media_types.clone(),
            chunk_interval: Duration::from_millis(self.capture.chunk_interval_ms.max(1)),
        }
    }

    pub fn capture_constraints(&self) -> CaptureConstraints {
        CaptureConstraints {
            video_device: self.capture.device.clone(),
            audio: self.capture.capture_audio,
            audio_device: self.capture.audio_device.clone(),
        }
    }

    pub fn output_directory(&self) -> PathBuf {
        self.recording
            .output_directory
            .clone()
            .unwrap_or_else(default_recording_output_directory)
    }
}
