//! Error types for tapline

use std::io;

/// Main error type for the proxy and the replay engine
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Dial, transport takeover, relay copy, or outbound call failure.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Replay failed: {0}")]
    ReplayFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Error::Persistence(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Error::Parse(msg.into())
    }

    pub fn replay_failed(msg: impl Into<String>) -> Self {
        Error::ReplayFailed(msg.into())
    }

    pub fn not_found(id: impl std::fmt::Display) -> Self {
        Error::NotFound(id.to_string())
    }

    pub fn invalid_url(msg: impl Into<String>) -> Self {
        Error::InvalidUrl(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
