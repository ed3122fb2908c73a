//! Error types for the voice engine

use thiserror::Error;

/// Result type alias for voxline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone/camera permission or hardware failure
    #[error("media access error: {0}")]
    MediaAccess(String),

    /// Audio encode/decode or output device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Text-to-speech error
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Work was cancelled; expected outcome of an interruption or close
    #[error("stream aborted")]
    StreamAborted,

    /// Optional platform capability is unavailable
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Prompt submission to the chat pipeline failed
    #[error("chat error: {0}")]
    Chat(String),

    /// Operation not valid in the current session state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error is the expected result of cancellation
    ///
    /// Aborts must never be reported to the user.
    #[must_use]
    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::StreamAborted)
    }
}
