//! Barge-in arbitration
//!
//! | Trigger           | Assistant speaking | `voice_interruption` | Action     |
//! |-------------------|--------------------|----------------------|------------|
//! | speech onset      | no                 | any                  | none       |
//! | speech onset      | yes                | off                  | ignored    |
//! | speech onset      | yes                | on                   | interrupt  |
//! | avatar tap        | yes                | any                  | interrupt  |
//!
//! Interrupting cancels the response's token, releases the output device,
//! and asks the chat pipeline to stop generating.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use super::events::{ChatClient, InterruptReason, ResponseId, SessionEvent};
use super::queue::SpeechPlayback;
use crate::config::VoiceSettings;

/// What to do with a detected speech onset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnsetDecision {
    /// Normal turn-taking; record the utterance
    Proceed,
    /// The assistant was cut off; record the utterance
    Interrupted,
    /// Assistant is speaking and barge-in is disabled; drop the onset
    Ignored,
}

impl OnsetDecision {
    /// Whether the onset should start an utterance
    #[must_use]
    pub const fn records(self) -> bool {
        !matches!(self, Self::Ignored)
    }
}

/// Applies the interruption policy
#[derive(Clone)]
pub struct InterruptionController {
    playback: SpeechPlayback,
    chat: Arc<dyn ChatClient>,
    settings: watch::Receiver<VoiceSettings>,
    events: broadcast::Sender<SessionEvent>,
}

impl InterruptionController {
    #[must_use]
    pub const fn new(
        playback: SpeechPlayback,
        chat: Arc<dyn ChatClient>,
        settings: watch::Receiver<VoiceSettings>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            playback,
            chat,
            settings,
            events,
        }
    }

    /// The user started speaking
    #[must_use]
    pub fn on_user_speech_onset(&self) -> OnsetDecision {
        if !self.playback.is_speaking() {
            return OnsetDecision::Proceed;
        }

        if !self.settings.borrow().voice_interruption {
            tracing::trace!("speech onset while assistant speaking; ignored");
            return OnsetDecision::Ignored;
        }

        self.interrupt(InterruptReason::VoiceOnset);
        OnsetDecision::Interrupted
    }

    /// The user tapped the avatar; returns whether anything was cut off
    #[must_use]
    pub fn on_avatar_tap(&self) -> bool {
        if !self.playback.is_speaking() {
            return false;
        }
        self.interrupt(InterruptReason::AvatarTap).is_some()
    }

    /// Cancel the active response; idempotent
    fn interrupt(&self, reason: InterruptReason) -> Option<ResponseId> {
        let response_id = self.playback.cancel_current()?;
        self.chat.stop_generation(&response_id);

        tracing::info!(%response_id, ?reason, "assistant interrupted");
        let _ = self.events.send(SessionEvent::Interrupted {
            response_id: response_id.clone(),
            reason,
        });
        Some(response_id)
    }
}

impl std::fmt::Debug for InterruptionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptionController")
            .field("playback", &self.playback)
            .finish_non_exhaustive()
    }
}
