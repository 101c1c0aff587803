//! Configuration management for the recording agent

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Rooms recorded on behalf of the config file itself (collaborator
    /// layers add further subscribers at runtime)
    #[serde(default)]
    pub rooms: Vec<u64>,

    /// Live status monitoring
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Recording and merge behavior
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Upload behavior
    #[serde(default)]
    pub upload: UploadConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Live status poll interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Whether the slideshow status counts as the broadcast having ended
    #[serde(default = "default_true")]
    pub slideshow_as_end: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Directory for segments, merged files, and session sidecars
    #[serde(default = "default_save_dir_option")]
    pub save_dir: Option<PathBuf>,

    /// ffmpeg binary used for capture and lossless concat
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    /// Debug switch: never delete segment/source files, and skip the
    /// startup recovery pass
    #[serde(default)]
    pub keep_segments: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Platform cookie used for uploads
    pub cookie: Option<String>,

    /// Whether finished recordings are uploaded automatically
    #[serde(default = "default_true")]
    pub auto_upload: bool,

    /// Category id for published recordings
    #[serde(default = "default_tid")]
    pub tid: u32,

    /// Tag list (comma separated) for published recordings
    #[serde(default = "default_tag")]
    pub tag: String,
}

// Default value functions
fn default_poll_interval() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_tid() -> u32 {
    27
}

fn default_tag() -> String {
    "直播录像".to_string()
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_save_dir() -> PathBuf {
    std::env::temp_dir().join("bililive-recordings")
}

fn default_save_dir_option() -> Option<PathBuf> {
    Some(default_save_dir())
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            slideshow_as_end: true,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            save_dir: Some(default_save_dir()),
            ffmpeg_path: default_ffmpeg_path(),
            keep_segments: false,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            cookie: None,
            auto_upload: true,
            tid: default_tid(),
            tag: default_tag(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rooms: Vec::new(),
            monitor: MonitorConfig::default(),
            recording: RecordingConfig::default(),
            upload: UploadConfig::default(),
            config_path: None,
        }
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

            config.config_path = Some(config_path);
            Ok(config)
        } else {
            // Create default config
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = match &self.config_path {
            Some(path) => path.clone(),
            None => Self::default_config_path()?,
        };

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
        let proj_dirs = directories::ProjectDirs::from("dev", "xz-blr", "bililive-agent")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Effective save directory for recordings and sidecars
    pub fn save_dir(&self) -> PathBuf {
        self.recording
            .save_dir
            .clone()
            .unwrap_or_else(default_save_dir)
    }
}
