//! Configuration loader and validator for the story engine.
use crate::playback::PlaybackConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub playback: Playback,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Overrides the default `sqlite://{data_dir}/storyline.db`.
    #[serde(default)]
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Playback {
    pub tick_ms: u64,
    pub default_image_secs: u64,
    pub default_video_secs: u64,
    pub view_dwell_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Local,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub bucket: String,
    pub public_base_url: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins, then `app.database_url`, then a file in `data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| self.app.database_url.clone())
            .unwrap_or_else(|| format!("sqlite://{}/storyline.db", self.app.data_dir))
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            tick: Duration::from_millis(self.playback.tick_ms),
            default_image: Duration::from_secs(self.playback.default_image_secs),
            default_video: Duration::from_secs(self.playback.default_video_secs),
            view_dwell: Duration::from_millis(self.playback.view_dwell_ms),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    let p = &cfg.playback;
    if p.tick_ms == 0 {
        return Err(ConfigError::Invalid("playback.tick_ms must be > 0"));
    }
    if p.default_image_secs == 0 {
        return Err(ConfigError::Invalid("playback.default_image_secs must be > 0"));
    }
    if p.default_video_secs == 0 {
        return Err(ConfigError::Invalid("playback.default_video_secs must be > 0"));
    }
    if p.view_dwell_ms == 0 {
        return Err(ConfigError::Invalid("playback.view_dwell_ms must be > 0"));
    }

    let s = &cfg.storage;
    if s.bucket.trim().is_empty() || s.bucket.contains('/') {
        return Err(ConfigError::Invalid("storage.bucket must be a non-empty name without '/'"));
    }
    if s.public_base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("storage.public_base_url must be non-empty"));
    }
    let missing_endpoint = s.endpoint.as_deref().map_or(true, |e| e.trim().is_empty());
    if s.backend == StorageBackend::Http && missing_endpoint {
        return Err(ConfigError::Invalid("storage.endpoint is required for the http backend"));
    }

    Ok(())
}

/// Example YAML, printed by `storyline example-config`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

playback:
  tick_ms: 50
  default_image_secs: 5
  default_video_secs: 15
  view_dwell_ms: 1500

storage:
  backend: local
  bucket: "stories"
  public_base_url: "http://localhost:8080/media"
  # endpoint: "https://objects.example.com/v1"
  # token: "YOUR_OBJECT_STORE_TOKEN"
"#
}
