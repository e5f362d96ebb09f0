//! Configuration types for trafficrec

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{RecorderError, Result};

/// On-disk representation of recorded exchanges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingFormat {
    /// Response body only, no metadata
    BodyOnly,
    /// Mocktail `.tail` files
    #[default]
    Mocktail,
    /// Raw HTTP/1.1 response message
    HttpMessage,
    /// Delegated to the policy's custom serializer
    Custom,
}

impl RecordingFormat {
    /// Name used in config files and for per-format subdirectories
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BodyOnly => "body_only",
            Self::Mocktail => "mocktail",
            Self::HttpMessage => "http_message",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for RecordingFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordingFormat {
    type Err = RecorderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "body_only" | "body" => Ok(Self::BodyOnly),
            "mocktail" | "tail" => Ok(Self::Mocktail),
            "http_message" | "http" => Ok(Self::HttpMessage),
            "custom" => Ok(Self::Custom),
            other => Err(RecorderError::ConfigError(format!(
                "Unknown recording format: {other}"
            ))),
        }
    }
}

/// Recorder configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Output format for new sessions
    #[serde(default)]
    pub format: RecordingFormat,
    /// Default output directory (used by the CLI when none is given)
    #[serde(default)]
    pub recording_dir: Option<PathBuf>,
    /// Write each format into its own subdirectory of the output directory
    #[serde(default)]
    pub format_subdirectories: bool,
    /// Resource limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest response body kept in memory for one exchange
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// Maximum number of exchanges tracked at once
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_max_body_size() -> usize {
    256 * 1024 * 1024 // 256 MB
}

fn default_max_in_flight() -> usize {
    4096
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_size: default_max_body_size(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl RecorderConfig {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RecorderError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    ///
    /// # Errors
    ///
    /// Returns error if the document is malformed or invalid
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| RecorderError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        if let Some(dir) = &self.recording_dir {
            if dir.as_os_str().is_empty() {
                return Err(RecorderError::ConfigError(
                    "recording_dir cannot be empty".to_string(),
                ));
            }
        }

        if self.limits.max_body_size == 0 {
            return Err(RecorderError::ConfigError(
                "limits.max_body_size must be > 0".to_string(),
            ));
        }

        if self.limits.max_in_flight == 0 {
            return Err(RecorderError::ConfigError(
                "limits.max_in_flight must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
