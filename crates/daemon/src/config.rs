//! Configuration management for the dirshare daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/dirshare/config.toml`.
//! A legacy JSON file (`webdavUsername` / `webdavDirectory`) is also
//! accepted when the path ends in `.json`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::framing::{FrameCodec, MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatcher::{SessionSettings, DEFAULT_DISPLAY_USER, DEFAULT_MAX_READ_SIZE};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("display_user must not be empty")]
    EmptyDisplayUser,

    #[error("root_dir must not be empty")]
    EmptyRootDir,

    #[error("max_read_size must be between 1 and {max}, got {value}")]
    InvalidMaxReadSize { value: u32, max: u32 },
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Largest READ payload that still fits in one frame with room for headers.
const MAX_READ_SIZE_LIMIT: u32 = (MAX_FRAME_SIZE as u32) - 64 * 1024;

/// Main configuration structure for the dirshare daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// The shared directory tree.
    pub share: ShareConfig,

    /// Logging settings.
    pub logging: LoggingConfig,

    /// Listener settings.
    pub transport: TransportConfig,
}

/// The shared directory tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShareConfig {
    /// Directory served to clients. Created if missing.
    pub root_dir: PathBuf,

    /// Owner and group shown in directory listings.
    pub display_user: String,

    /// Upper bound for a single READ, in bytes.
    pub max_read_size: u32,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Also write logs to this file, rolled daily.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Unix socket accepting client sessions.
    pub socket_path: PathBuf,

    /// Compress large outgoing frames.
    pub compression: bool,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./sftp_files"),
            display_user: DEFAULT_DISPLAY_USER.to_string(),
            max_read_size: DEFAULT_MAX_READ_SIZE,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            compression: true,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dirshare")
        .join("config.toml")
}

/// Returns the default listener socket path.
///
/// 1. The user runtime directory if there is one: `$XDG_RUNTIME_DIR/dirshare/dirshare.sock`
/// 2. Otherwise: `/tmp/dirshare-$UID/dirshare.sock`
pub fn default_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    match dirs::runtime_dir() {
        Some(runtime_dir) => runtime_dir.join("dirshare").join("dirshare.sock"),
        None => {
            let uid = fs::metadata("/proc/self").map(|m| m.uid()).unwrap_or(0);
            PathBuf::from(format!("/tmp/dirshare-{}", uid)).join("dirshare.sock")
        }
    }
}

/// Keys of the JSON configuration written by earlier releases.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct LegacyConfig {
    webdav_username: Option<String>,
    webdav_directory: Option<String>,
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - DIRSHARE_ROOT_DIR: Override the shared directory
    /// - DIRSHARE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("DIRSHARE_ROOT_DIR") {
            if !root.is_empty() {
                tracing::info!("Overriding root_dir from environment: {}", root);
                self.share.root_dir = PathBuf::from(root);
            }
        }

        if let Ok(level) = std::env::var("DIRSHARE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        if self.share.display_user.trim().is_empty() {
            return Err(ConfigError::EmptyDisplayUser);
        }

        if self.share.root_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyRootDir);
        }

        let size = self.share.max_read_size;
        if size == 0 || size > MAX_READ_SIZE_LIMIT {
            return Err(ConfigError::InvalidMaxReadSize {
                value: size,
                max: MAX_READ_SIZE_LIMIT,
            });
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// Files ending in `.json` are read as legacy configuration; anything
    /// else is parsed as TOML.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let is_json = path.extension().is_some_and(|ext| ext == "json");
        let parsed = if is_json {
            Self::from_legacy_json(&contents)
        } else {
            Self::from_toml(&contents)
        };
        parsed.with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Build a configuration from the legacy JSON layout.
    ///
    /// Only the username and directory are carried over; empty values keep
    /// the defaults. Stored credentials are ignored.
    pub fn from_legacy_json(json: &str) -> Result<Self> {
        let legacy: LegacyConfig =
            serde_json::from_str(json).context("Invalid legacy JSON configuration")?;

        let mut config = Self::default();
        if let Some(user) = legacy.webdav_username.filter(|u| !u.is_empty()) {
            config.share.display_user = user;
        }
        if let Some(dir) = legacy.webdav_directory.filter(|d| !d.is_empty()) {
            config.share.root_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Create the shared directory if needed and return its absolute path.
    pub fn ensure_root_dir(&self) -> Result<PathBuf> {
        let root = &self.share.root_dir;
        fs::create_dir_all(root)
            .with_context(|| format!("Failed to create root directory: {}", root.display()))?;
        root.canonicalize()
            .with_context(|| format!("Failed to resolve root directory: {}", root.display()))
    }

    /// Per-session settings for the given absolute root.
    pub fn session_settings(&self, root: PathBuf) -> SessionSettings {
        SessionSettings {
            root,
            display_user: self.share.display_user.clone(),
            max_read_size: self.share.max_read_size,
        }
    }

    /// Frame codec matching the transport settings.
    pub fn frame_codec(&self) -> FrameCodec {
        if self.transport.compression {
            FrameCodec::new()
        } else {
            FrameCodec::without_compression()
        }
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
