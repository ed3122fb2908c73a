//! Utterance transcription and prompt submission

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::events::{ChatClient, SessionEvent, SubmitOptions};
use crate::Result;
use crate::config::VoiceSettings;
use crate::voice::{Transcriber, Utterance};

/// Turns sealed utterances into raw chat prompts
///
/// Failures are reported as notices; the dispatcher keeps consuming
/// utterances until the session closes.
#[derive(Clone)]
pub struct TranscriptionDispatcher {
    transcriber: Arc<dyn Transcriber>,
    chat: Arc<dyn ChatClient>,
    settings: watch::Receiver<VoiceSettings>,
    events: broadcast::Sender<SessionEvent>,
}

impl TranscriptionDispatcher {
    #[must_use]
    pub const fn new(
        transcriber: Arc<dyn Transcriber>,
        chat: Arc<dyn ChatClient>,
        settings: watch::Receiver<VoiceSettings>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            transcriber,
            chat,
            settings,
            events,
        }
    }

    /// Transcribe one utterance and submit the text
    ///
    /// Returns the submitted text, or `None` if nothing was recognized.
    ///
    /// # Errors
    ///
    /// Returns error if encoding, transcription, or submission fails
    pub async fn dispatch(&self, utterance: &Utterance) -> Result<Option<String>> {
        let wav = utterance.to_wav()?;
        let language = self.settings.borrow().stt_language.clone();

        let text = self
            .transcriber
            .transcribe(&wav, language.as_deref())
            .await?;
        let text = text.trim();
        if text.is_empty() {
            tracing::debug!(
                duration_ms = utterance.duration().as_millis(),
                "empty transcript; nothing submitted"
            );
            return Ok(None);
        }

        self.chat.submit(text, SubmitOptions::raw()).await?;
        tracing::info!(transcript = %text, "utterance submitted");
        let _ = self.events.send(SessionEvent::Transcribed(text.to_string()));

        Ok(Some(text.to_string()))
    }

    /// Consume utterances in order until `token` is cancelled
    pub async fn run(
        self,
        mut utterances: mpsc::UnboundedReceiver<Utterance>,
        token: CancellationToken,
    ) {
        loop {
            let utterance = tokio::select! {
                () = token.cancelled() => break,
                next = utterances.recv() => match next {
                    Some(utterance) => utterance,
                    None => break,
                },
            };

            let result = tokio::select! {
                () = token.cancelled() => break,
                result = self.dispatch(&utterance) => result,
            };

            if let Err(e) = result
                && !e.is_abort()
            {
                tracing::warn!(error = %e, "transcription failed; still listening");
                let _ = self.events.send(SessionEvent::Notice(e.to_string()));
            }
        }
        tracing::debug!("transcription dispatcher stopped");
    }
}

impl std::fmt::Debug for TranscriptionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptionDispatcher").finish_non_exhaustive()
    }
}
