//! Error types for refract

use std::io;
use thiserror::Error;

/// Result type alias for refract operations
pub type Result<T> = std::result::Result<T, RefractError>;

/// Main error type for refract
#[derive(Error, Debug)]
pub enum RefractError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file parsing errors
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Packet capture source errors (fatal: the session cannot start)
    #[error("Capture error: {0}")]
    Capture(String),

    /// HTTP message parsing errors on a reassembled stream
    #[error("HTTP parse error: {0}")]
    HttpParse(String),

    /// Capture record framing errors
    #[error("Record codec error: {0}")]
    Record(String),

    /// Request modifier errors
    #[error("Modifier error: {0}")]
    Modifier(String),

    /// Replay client errors
    #[error("Replay error: {0}")]
    Replay(String),

    /// Request timeout
    #[error("Request timeout")]
    Timeout,

    /// Diverging-request sink errors
    #[error("Diff sink error: {0}")]
    DiffSink(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<pcap::Error> for RefractError {
    fn from(err: pcap::Error) -> Self {
        RefractError::Capture(err.to_string())
    }
}

impl From<reqwest::Error> for RefractError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RefractError::Timeout
        } else {
            RefractError::Replay(err.to_string())
        }
    }
}

impl From<serde_yaml::Error> for RefractError {
    fn from(err: serde_yaml::Error) -> Self {
        RefractError::ConfigParse(err.to_string())
    }
}

impl From<toml::de::Error> for RefractError {
    fn from(err: toml::de::Error) -> Self {
        RefractError::ConfigParse(err.to_string())
    }
}

impl From<regex::Error> for RefractError {
    fn from(err: regex::Error) -> Self {
        RefractError::Modifier(format!("Invalid regex pattern: {}", err))
    }
}

impl From<httparse::Error> for RefractError {
    fn from(err: httparse::Error) -> Self {
        RefractError::HttpParse(err.to_string())
    }
}
