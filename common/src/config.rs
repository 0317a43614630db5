use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Slowest capture rate accepted, in frames per second.
pub const MIN_FPS: f64 = 1e-3;
/// Fastest capture rate accepted, in frames per second.
pub const MAX_FPS: f64 = 1000.0;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_quality")]
    pub quality: u32,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default)]
    pub images: Vec<PathBuf>,
    #[serde(default = "default_loop_frames")]
    pub loop_frames: bool,
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_frame_buffer")]
    pub frame_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_format")]
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown_ms(),
            event_capacity: default_event_capacity(),
            frame_buffer: default_frame_buffer(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_output_format(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_FPS..=MAX_FPS).contains(&self.source.fps) {
            return Err(ConfigError::Invalid(format!(
                "source.fps must be between {MIN_FPS} and {MAX_FPS}, got {}",
                self.source.fps
            )));
        }
        match self.source.mode.as_str() {
            "replay" if self.source.images.is_empty() => {
                return Err(ConfigError::Invalid(
                    "source.images must list at least one image in replay mode".into(),
                ));
            }
            "mjpeg" if self.source.url.is_empty() => {
                return Err(ConfigError::Invalid(
                    "source.url is required in mjpeg mode".into(),
                ));
            }
            "replay" | "mjpeg" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown source.mode '{other}', expected 'replay' or 'mjpeg'"
                )));
            }
        }
        if self.source.width.is_some() != self.source.height.is_some() {
            return Err(ConfigError::Invalid(
                "source.width and source.height must be set together".into(),
            ));
        }
        if self.scan.event_capacity == 0 || self.scan.frame_buffer == 0 {
            return Err(ConfigError::Invalid(
                "scan.event_capacity and scan.frame_buffer must be non-zero".into(),
            ));
        }
        match self.output.format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(ConfigError::Invalid(format!(
                "unknown output.format '{other}', expected 'text' or 'json'"
            ))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_mode() -> String {
    "replay".into()
}
fn default_quality() -> u32 {
    80
}
fn default_fps() -> f64 {
    10.0
}
fn default_loop_frames() -> bool {
    true
}
fn default_max_reconnects() -> u32 {
    5
}
fn default_cooldown_ms() -> u64 {
    1500
}
fn default_event_capacity() -> usize {
    64
}
fn default_frame_buffer() -> usize {
    4
}
fn default_output_format() -> String {
    "text".into()
}
fn default_log_level() -> String {
    "info".into()
}
