//! Per-response speech playback
//!
//! Each response id gets a FIFO of text fragments and one playback worker.
//! Chunks are appended as they stream in and synthesis is started
//! immediately; the worker plays fragments strictly in arrival order,
//! backing off while the head fragment is still being synthesized.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lru::LruCache;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use super::cache::{CacheEntry, CacheLookup, SpeechCache};
use super::events::{ResponseId, SessionEvent};
use crate::config::VoiceSettings;
use crate::voice::{AudioSink, LocalVoice};
use crate::{Error, Result};

/// Pending fragments of one response
#[derive(Debug)]
struct PlaybackQueue {
    fragments: VecDeque<String>,
    finished: bool,
    token: CancellationToken,
}

/// Closed response ids remembered per session
const CLOSED_ID_CAPACITY: usize = 64;

/// Recently drained or cancelled response ids
///
/// Bounded: a late chunk can only trail its own response by a little, so
/// the oldest ids are forgotten.
#[derive(Debug)]
struct ClosedIds(LruCache<ResponseId, ()>);

impl ClosedIds {
    fn new() -> Self {
        let capacity = NonZeroUsize::new(CLOSED_ID_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self(LruCache::new(capacity))
    }

    fn insert(&mut self, response_id: ResponseId) {
        self.0.put(response_id, ());
    }

    fn contains(&self, response_id: &ResponseId) -> bool {
        self.0.contains(response_id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.len()
    }
}

#[derive(Debug)]
struct QueueState {
    queues: HashMap<ResponseId, PlaybackQueue>,
    /// Response whose worker owns the output
    current: Option<ResponseId>,
    /// Ids that were drained or cancelled; never re-created
    closed: ClosedIds,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            queues: HashMap::new(),
            current: None,
            closed: ClosedIds::new(),
        }
    }
}

enum Step {
    Play(String, CacheEntry),
    Wait,
    Done,
}

/// Devices and shared channels the playback pipeline needs
pub struct PlaybackParts {
    pub cache: SpeechCache,
    pub sink: Arc<dyn AudioSink>,
    pub local_voice: Arc<dyn LocalVoice>,
    pub settings: watch::Receiver<VoiceSettings>,
    pub events: broadcast::Sender<SessionEvent>,
    pub backoff: Duration,
    pub session_token: CancellationToken,
    pub handle: Handle,
}

struct Shared {
    state: Mutex<QueueState>,
    parts: PlaybackParts,
    speaking: watch::Sender<bool>,
}

/// Speech playback queues for one session
#[derive(Clone)]
pub struct SpeechPlayback {
    shared: Arc<Shared>,
}

impl SpeechPlayback {
    #[must_use]
    pub fn new(parts: PlaybackParts) -> Self {
        let (speaking, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                parts,
                speaking,
            }),
        }
    }

    /// Create the queue for a new response and start its worker
    ///
    /// Any response still playing is cancelled first. A response id is
    /// only ever started once.
    pub fn begin_response(&self, response_id: ResponseId) {
        let previous = {
            let mut state = self.shared.lock();
            if state.queues.contains_key(&response_id) || state.closed.contains(&response_id)
            {
                tracing::debug!(%response_id, "response already started");
                return;
            }
            state.current.take()
        };
        if let Some(previous) = previous {
            self.shared.cancel(&previous);
        }

        let token = self.shared.parts.session_token.child_token();
        {
            let mut state = self.shared.lock();
            state.queues.insert(
                response_id.clone(),
                PlaybackQueue {
                    fragments: VecDeque::new(),
                    finished: false,
                    token: token.clone(),
                },
            );
            state.current = Some(response_id.clone());
        }

        tracing::debug!(%response_id, "playback queue created");
        let shared = Arc::clone(&self.shared);
        self.shared
            .parts
            .handle
            .spawn(run_worker(shared, response_id, token));
    }

    /// Append a streamed text chunk and start synthesizing it
    ///
    /// A chunk for an unseen response implicitly starts it; chunks for
    /// drained or cancelled responses are dropped.
    pub fn push_chunk(&self, response_id: &ResponseId, text: &str) {
        if text.trim().is_empty() {
            return;
        }

        let known = {
            let state = self.shared.lock();
            if state.closed.contains(response_id) {
                tracing::debug!(%response_id, "dropping chunk for closed response");
                return;
            }
            state.queues.contains_key(response_id)
        };
        if !known {
            self.begin_response(response_id.clone());
        }

        {
            let mut state = self.shared.lock();
            let Some(queue) = state.queues.get_mut(response_id) else {
                return;
            };
            queue.fragments.push_back(text.to_string());
        }

        let (voice, rate) = self.shared.voice();
        self.shared.parts.cache.request(text, &voice, rate);
    }

    /// Mark the response stream complete so its worker can drain and exit
    pub fn finish_response(&self, response_id: &ResponseId) {
        let mut state = self.shared.lock();
        if let Some(queue) = state.queues.get_mut(response_id) {
            queue.finished = true;
            tracing::debug!(
                %response_id,
                pending = queue.fragments.len(),
                "response stream finished"
            );
        }
    }

    /// Cancel the active response, silencing output before returning
    ///
    /// Returns the cancelled response id, or `None` if nothing was active.
    /// Calling it again is a no-op.
    #[must_use]
    pub fn cancel_current(&self) -> Option<ResponseId> {
        let current = self.shared.lock().current.take();
        if let Some(response_id) = current {
            self.shared.cancel(&response_id).then_some(response_id)
        } else {
            self.shared.silence();
            None
        }
    }

    /// Tear down every queue and the cache
    ///
    /// Returns the responses whose stream had not finished, so the caller
    /// can stop their generation.
    #[must_use = "unfinished responses are still generating"]
    pub fn shutdown(&self) -> Vec<ResponseId> {
        let drained: Vec<(ResponseId, PlaybackQueue)> = {
            let mut state = self.shared.lock();
            state.current = None;
            let drained: Vec<_> = state.queues.drain().collect();
            for (id, _) in &drained {
                state.closed.insert(id.clone());
            }
            drained
        };

        let mut streaming = Vec::new();
        for (id, queue) in &drained {
            queue.token.cancel();
            if !queue.finished {
                streaming.push(id.clone());
            }
        }
        self.shared.silence();
        self.shared.parts.cache.clear();
        tracing::debug!(
            cancelled = drained.len(),
            streaming = streaming.len(),
            "playback shut down"
        );
        streaming
    }

    /// Whether the assistant is currently speaking
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        *self.shared.speaking.borrow()
    }

    /// Watch the assistant-speaking flag
    #[must_use]
    pub fn speaking(&self) -> watch::Receiver<bool> {
        self.shared.speaking.subscribe()
    }

    /// Response currently owning the output
    #[must_use]
    pub fn current_response(&self) -> Option<ResponseId> {
        self.shared.lock().current.clone()
    }

    /// Number of live queues
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.shared.lock().queues.len()
    }

    #[must_use]
    pub fn cache(&self) -> &SpeechCache {
        &self.shared.parts.cache
    }
}

impl std::fmt::Debug for SpeechPlayback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechPlayback")
            .field("speaking", &self.is_speaking())
            .field("current", &self.current_response())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn voice(&self) -> (String, f32) {
        let settings = self.parts.settings.borrow();
        (settings.tts_voice.clone(), settings.playback_rate)
    }

    /// Cancel one response; returns whether it was live
    fn cancel(&self, response_id: &ResponseId) -> bool {
        let removed = {
            let mut state = self.lock();
            state.closed.insert(response_id.clone());
            if state.current.as_ref() == Some(response_id) {
                state.current = None;
            }
            state.queues.remove(response_id)
        };

        let live = removed.is_some();
        if let Some(queue) = removed {
            queue.token.cancel();
            tracing::debug!(%response_id, dropped = queue.fragments.len(), "response cancelled");
        }
        self.silence();
        live
    }

    /// Release the output device and clear the speaking flag
    fn silence(&self) {
        self.parts.sink.stop();
        self.parts.local_voice.stop();
        self.set_speaking(false);
    }

    fn set_speaking(&self, speaking: bool) {
        let changed = self.speaking.send_if_modified(|current| {
            let changed = *current != speaking;
            *current = speaking;
            changed
        });
        if changed {
            let _ = self.parts.events.send(SessionEvent::AssistantSpeaking(speaking));
        }
    }

    /// Decide the worker's next move for `response_id`
    fn next_step(&self, response_id: &ResponseId) -> Step {
        let mut state = self.lock();
        let Some(queue) = state.queues.get_mut(response_id) else {
            return Step::Done;
        };
        if queue.token.is_cancelled() {
            return Step::Done;
        }

        let Some(text) = queue.fragments.pop_front() else {
            return if queue.finished { Step::Done } else { Step::Wait };
        };

        match self.parts.cache.lookup(&text) {
            CacheLookup::Ready(entry) => {
                // Under the queue lock so a concurrent cancel always wins
                self.set_speaking(true);
                Step::Play(text, entry)
            }
            CacheLookup::Pending => {
                queue.fragments.push_front(text);
                Step::Wait
            }
            CacheLookup::Missing => {
                // Evicted before it was played
                let (voice, rate) = self.voice();
                self.parts.cache.request(&text, &voice, rate);
                queue.fragments.push_front(text);
                Step::Wait
            }
        }
    }

    async fn speak(&self, text: &str, entry: CacheEntry) -> Result<()> {
        match entry {
            CacheEntry::Audio(audio) => self.parts.sink.play(&audio).await,
            CacheEntry::LocalVoice => {
                let (_, rate) = self.voice();
                match self.parts.local_voice.speak(text, rate).await {
                    Err(Error::Unsupported(reason)) => {
                        tracing::debug!(%reason, "no voice for fragment; skipping");
                        Ok(())
                    }
                    other => other,
                }
            }
        }
    }

    /// Worker exit bookkeeping
    fn finish_worker(&self, response_id: &ResponseId) {
        let mut state = self.lock();
        state.queues.remove(response_id);
        state.closed.insert(response_id.clone());
        if state.current.as_ref() == Some(response_id) {
            state.current = None;
            drop(state);
            self.set_speaking(false);
        }
    }
}

/// Playback worker for one response
async fn run_worker(shared: Arc<Shared>, response_id: ResponseId, token: CancellationToken) {
    tracing::debug!(%response_id, "playback worker started");
    let backoff = shared.parts.backoff;
    let mut played = 0usize;

    loop {
        match shared.next_step(&response_id) {
            Step::Play(text, entry) => {
                let outcome = tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    outcome = shared.speak(&text, entry) => outcome,
                };
                match outcome {
                    Ok(()) => played += 1,
                    Err(e) if e.is_abort() => {
                        if token.is_cancelled() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            %response_id,
                            error = %e,
                            "fragment playback failed; continuing"
                        );
                    }
                }
            }
            Step::Wait => {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(backoff) => {}
                }
            }
            Step::Done => break,
        }
    }

    // Only a worker whose token is still live may touch shared state
    if !token.is_cancelled() {
        shared.finish_worker(&response_id);
    }
    tracing::debug!(
        %response_id,
        played,
        cancelled = token.is_cancelled(),
        "playback worker exited"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_ids_are_bounded() {
        let mut closed = ClosedIds::new();
        for i in 0..1000 {
            closed.insert(ResponseId::from(format!("r{i}")));
        }

        assert_eq!(closed.len(), CLOSED_ID_CAPACITY);
        assert!(closed.contains(&ResponseId::from("r999")));
        assert!(!closed.contains(&ResponseId::from("r0")));
    }
}
