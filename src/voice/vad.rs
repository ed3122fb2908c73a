//! Voice activity detection
//!
//! Decides utterance boundaries from per-frame activity using a silence
//! timeout. No push-to-talk: onset is the first active frame, end is the
//! first frame at least `silence` after the last active one.

use std::time::Duration;

use tokio::time::Instant;

use super::analyzer::ActivityFrame;

/// State of the voice activity detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// Waiting for speech
    Quiescent,
    /// Active frames are arriving
    Speaking,
    /// Speech stopped; waiting out the silence timeout
    SilencePending,
}

/// Outcome of observing one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// Nothing changed
    None,
    /// Speech onset; start retaining audio
    SpeechStarted,
    /// Speech is ongoing (timer reset)
    SpeechContinued,
    /// First silent frame after speech
    SilenceStarted,
    /// Silence timeout elapsed; seal the utterance
    UtteranceEnded,
}

/// Silence-timeout speech boundary detector
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    state: VadState,
    silence: Duration,
    last_sound: Option<Instant>,
    speech_started_at: Option<Instant>,
    has_started_speaking: bool,
    confirmed_end: bool,
}

impl VoiceActivityDetector {
    /// Create a detector that seals after `silence` without activity
    #[must_use]
    pub const fn new(silence: Duration) -> Self {
        Self {
            state: VadState::Quiescent,
            silence,
            last_sound: None,
            speech_started_at: None,
            has_started_speaking: false,
            confirmed_end: false,
        }
    }

    /// Advance the state machine by one frame
    pub fn observe(&mut self, frame: &ActivityFrame, now: Instant) -> VadEvent {
        match self.state {
            VadState::Quiescent => {
                if frame.has_signal {
                    self.state = VadState::Speaking;
                    self.last_sound = Some(now);
                    self.speech_started_at = Some(now);
                    self.has_started_speaking = true;
                    self.confirmed_end = false;
                    tracing::trace!(rms = frame.rms, "speech onset");
                    VadEvent::SpeechStarted
                } else {
                    VadEvent::None
                }
            }
            VadState::Speaking | VadState::SilencePending if frame.has_signal => {
                self.state = VadState::Speaking;
                self.last_sound = Some(now);
                VadEvent::SpeechContinued
            }
            VadState::Speaking | VadState::SilencePending => {
                if self.silence_elapsed(now) {
                    self.confirmed_end = true;
                    tracing::debug!(
                        speech_ms = self.speech_duration(now).as_millis(),
                        "utterance end confirmed"
                    );
                    self.rearm();
                    VadEvent::UtteranceEnded
                } else if self.state == VadState::Speaking {
                    self.state = VadState::SilencePending;
                    VadEvent::SilenceStarted
                } else {
                    VadEvent::None
                }
            }
        }
    }

    /// Return to `Quiescent`, forgetting any partial utterance
    pub const fn reset(&mut self) {
        self.rearm();
        self.confirmed_end = false;
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> VadState {
        self.state
    }

    /// Timestamp of the most recent active frame in the current utterance
    #[must_use]
    pub const fn last_sound(&self) -> Option<Instant> {
        self.last_sound
    }

    /// Whether speech has been confirmed for the current utterance
    #[must_use]
    pub const fn has_started_speaking(&self) -> bool {
        self.has_started_speaking
    }

    /// Whether the previous utterance ended on a confirmed silence
    #[must_use]
    pub const fn confirmed_end(&self) -> bool {
        self.confirmed_end
    }

    /// Configured silence timeout
    #[must_use]
    pub const fn silence(&self) -> Duration {
        self.silence
    }

    fn silence_elapsed(&self, now: Instant) -> bool {
        self.last_sound
            .is_some_and(|last| now.saturating_duration_since(last) >= self.silence)
    }

    fn speech_duration(&self, now: Instant) -> Duration {
        self.speech_started_at
            .map_or(Duration::ZERO, |start| now.saturating_duration_since(start))
    }

    const fn rearm(&mut self) {
        self.state = VadState::Quiescent;
        self.last_sound = None;
        self.speech_started_at = None;
        self.has_started_speaking = false;
    }
}
