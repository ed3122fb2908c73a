//! Chat-stream and session events
//!
//! The chat pipeline pushes exactly three event kinds per response. The
//! session publishes its own observable events to any subscriber.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::session::SessionState;
use crate::Result;

/// Capacity of the session event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Identifier of one streamed assistant response
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseId(String);

impl ResponseId {
    /// Generate a fresh random id
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResponseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResponseId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ResponseId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Lifecycle notification from the chat-completion stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatStreamEvent {
    /// A new response began streaming
    Start { response_id: ResponseId },
    /// A text fragment of the response arrived
    Chunk { response_id: ResponseId, text: String },
    /// The response finished streaming
    Finish { response_id: ResponseId },
}

impl ChatStreamEvent {
    /// Response this event belongs to
    #[must_use]
    pub const fn response_id(&self) -> &ResponseId {
        match self {
            Self::Start { response_id }
            | Self::Chunk { response_id, .. }
            | Self::Finish { response_id } => response_id,
        }
    }
}

/// Options for submitting a prompt to the chat pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Bypass rich-text formatting applied to typed input
    pub raw: bool,
}

impl SubmitOptions {
    /// Submit as a raw prompt
    #[must_use]
    pub const fn raw() -> Self {
        Self { raw: true }
    }
}

/// The chat-completion client the engine talks to
///
/// The engine never starts generation on its own; it only submits
/// transcripts and asks for generation to stop.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Submit a prompt as if the user typed it
    ///
    /// # Errors
    ///
    /// Returns `Error::Chat` if the prompt could not be submitted
    async fn submit(&self, text: &str, options: SubmitOptions) -> Result<()>;

    /// Ask the pipeline to halt a streaming response
    fn stop_generation(&self, response_id: &ResponseId);
}

/// What cut the assistant off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    /// The user started talking over the assistant
    VoiceOnset,
    /// The user tapped the avatar
    AvatarTap,
}

/// Observable session activity
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Lifecycle state changed
    StateChanged(SessionState),
    /// Voice activity detector confirmed speech onset
    SpeechStarted,
    /// An utterance was sealed and queued for transcription
    UtteranceSealed { duration: Duration, samples: usize },
    /// A transcript was submitted to the chat pipeline
    Transcribed(String),
    /// Transient, user-facing error notification
    Notice(String),
    /// The assistant started or stopped speaking
    AssistantSpeaking(bool),
    /// A response was cut off
    Interrupted {
        response_id: ResponseId,
        reason: InterruptReason,
    },
}
