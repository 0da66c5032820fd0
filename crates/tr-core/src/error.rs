//! Core error types for Trayce

use std::path::PathBuf;
use thiserror::Error;

/// Session-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The command stream was closed before the agent sent its handshake
    #[error("Command stream closed before the handshake message")]
    MissingHandshake,

    /// The session has been stopped
    #[error("Session is closed")]
    Closed,
}

/// Errors produced while parsing captured HTTP bytes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpParseError {
    /// No blank line separates headers from body
    #[error("Missing header/body boundary")]
    MissingBoundary,

    /// Header block is not valid UTF-8
    #[error("Header block is not valid UTF-8")]
    InvalidUtf8,

    /// Request line is not "METHOD PATH VERSION"
    #[error("Malformed request line: {0:?}")]
    InvalidRequestLine(String),

    /// Status line is not "VERSION STATUS [MESSAGE]"
    #[error("Malformed status line: {0:?}")]
    InvalidStatusLine(String),

    /// Status code is not an integer
    #[error("Invalid status code: {0:?}")]
    InvalidStatus(String),

    /// Header line without a ": " separator
    #[error("Malformed header line: {0:?}")]
    InvalidHeader(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
