//! Conversation engine
//!
//! Ties the voice adapters into a full-duplex loop: listen, detect the end
//! of an utterance, transcribe and submit it, then speak the streamed reply
//! while staying ready for the user to cut in.

mod cache;
mod events;
mod interruption;
mod queue;
mod session;
mod transcription;

pub use cache::{CacheEntry, CacheLookup, SpeechCache};
pub use events::{
    ChatClient, ChatStreamEvent, EVENT_CHANNEL_CAPACITY, InterruptReason, ResponseId,
    SessionEvent, SubmitOptions,
};
pub use interruption::{InterruptionController, OnsetDecision};
pub use queue::{PlaybackParts, SpeechPlayback};
pub use session::{CaptureSession, Collaborators, SessionState, TickOutcome, VoiceSession};
pub use transcription::TranscriptionDispatcher;
