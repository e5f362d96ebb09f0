//! Error types for trafficrec

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for trafficrec operations
pub type Result<T> = std::result::Result<T, RecorderError>;

/// Errors that can occur while recording traffic
#[derive(Debug, Error)]
pub enum RecorderError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A recording session is already active
    #[error("Already recording")]
    AlreadyRecording,

    /// Configuration cannot change while a session is active
    #[error("Cannot change configuration while recording")]
    SessionActive,

    /// Output directory cannot be created or written
    #[error("Invalid recording path {}: {reason}", path.display())]
    InvalidPath {
        /// Offending directory
        path: PathBuf,
        /// Why it was rejected
        reason: String,
    },

    /// Writing a single exchange failed
    #[error("Failed to write {}: {source}", path.display())]
    WriteFailure {
        /// Target path of the write
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// A user policy callback failed or panicked
    #[error("Policy callback `{callback}` failed: {reason}")]
    PolicyCallbackFailure {
        /// Name of the callback
        callback: &'static str,
        /// Failure description
        reason: String,
    },

    /// Response body exceeded the configured limit
    #[error("Data too large: {size} bytes exceeds limit of {limit} bytes")]
    DataTooLarge {
        /// Actual size
        size: usize,
        /// Size limit
        limit: usize,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Capture script could not be parsed
    #[error("Invalid capture script: {0}")]
    InvalidScript(String),

    /// Recorded file could not be parsed
    #[error("Invalid recording format: {0}")]
    InvalidFormat(String),
}
