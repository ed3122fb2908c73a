//! Voxline - real-time voice conversation engine for AI assistants
//!
//! This library turns a microphone and a speaker into a hands-free
//! conversation with a streaming chat pipeline:
//! - Voice activity detection over per-frame spectral analysis
//! - Utterance recording and speech-to-text submission
//! - Ordered, speculatively synthesized playback of streamed replies
//! - Barge-in handling and session lifecycle management
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     VoiceSession                          │
//! │   Closed → Opening → Active → Closing → Closed           │
//! └───────┬──────────────────────────────────────┬───────────┘
//!         │ analysis loop (~60 Hz)               │ chat events
//! ┌───────▼──────────────────────┐   ┌───────────▼───────────┐
//! │ Analyzer → VAD → Recorder    │   │ SpeechPlayback        │
//! │        │                     │   │  queue + cache + worker│
//! │        ▼                     │   └───────────▲───────────┘
//! │ TranscriptionDispatcher ─────┼──► ChatClient │
//! └──────────────────────────────┘   InterruptionController
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod voice;

pub use config::Config;
pub use engine::{
    ChatClient, ChatStreamEvent, Collaborators, ResponseId, SessionEvent, SessionState,
    SubmitOptions, VoiceSession,
};
pub use error::{Error, Result};
