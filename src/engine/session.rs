//! Voice session lifecycle
//!
//! `Closed → Opening → Active → Closing → Closed`. Opening acquires the
//! microphone (fatal on failure) and a keep-awake lock (best effort), then
//! starts the analysis loop and the transcription dispatcher. Closing tears
//! everything down even when individual steps fail, so the session can be
//! reopened cleanly.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::cache::SpeechCache;
use super::events::{ChatClient, ChatStreamEvent, EVENT_CHANNEL_CAPACITY, SessionEvent};
use super::interruption::InterruptionController;
use super::queue::{PlaybackParts, SpeechPlayback};
use super::transcription::TranscriptionDispatcher;
use crate::config::{Config, PlaybackConfig, VadConfig, VoiceSettings};
use crate::voice::{
    ActivityFrame, AudioFrameAnalyzer, AudioPlayback, AudioSink, CaptureStream, CommandLocalVoice,
    CpalDevices, KeepAwake, LocalVoice, MediaDevices, MediaStream, SpeechToText, Synthesizer,
    SystemKeepAwake, TextToSpeech, ThresholdPolicy, Transcriber, Utterance, UtteranceRecorder,
    VadEvent, VadState, VoiceActivityDetector, WakeLock,
};
use crate::{Error, Result};

/// Lifecycle state of a voice session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Closed,
    Opening,
    Active,
    Closing,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Opening => write!(f, "opening"),
            Self::Active => write!(f, "active"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

/// External collaborators a session drives
#[derive(Clone)]
pub struct Collaborators {
    pub devices: Arc<dyn MediaDevices>,
    pub transcriber: Arc<dyn Transcriber>,
    /// `None` speaks every fragment through `local_voice`
    pub synthesizer: Option<Arc<dyn Synthesizer>>,
    pub sink: Arc<dyn AudioSink>,
    pub local_voice: Arc<dyn LocalVoice>,
    pub keep_awake: Arc<dyn KeepAwake>,
    pub chat: Arc<dyn ChatClient>,
}

impl Collaborators {
    /// Production adapters: default audio devices and HTTP STT/TTS
    ///
    /// # Errors
    ///
    /// Returns error if the STT API key is missing or no output device exists
    pub fn system(config: &Config, chat: Arc<dyn ChatClient>) -> Result<Self> {
        let synthesizer = TextToSpeech::from_config(&config.tts)
            .map(|tts| Arc::new(tts) as Arc<dyn Synthesizer>);
        if synthesizer.is_none() {
            tracing::info!("no synthesis backend configured; using local voice");
        }

        Ok(Self {
            devices: Arc::new(CpalDevices),
            transcriber: Arc::new(SpeechToText::from_config(&config.stt)?),
            synthesizer,
            sink: Arc::new(AudioPlayback::new()?),
            local_voice: Arc::new(CommandLocalVoice::from_config(&config.local_voice)),
            keep_awake: Arc::new(SystemKeepAwake),
            chat,
        })
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("synthesizer", &self.synthesizer.is_some())
            .finish_non_exhaustive()
    }
}

/// Result of one analysis tick
#[derive(Debug)]
pub struct TickOutcome {
    pub frame: ActivityFrame,
    pub event: VadEvent,
    pub utterance: Option<Utterance>,
}

/// Microphone stream plus the per-session detection state
///
/// Exclusively owned by the analysis loop while the session is active.
pub struct CaptureSession {
    stream: Box<dyn CaptureStream>,
    analyzer: AudioFrameAnalyzer,
    vad: VoiceActivityDetector,
    recorder: UtteranceRecorder,
}

impl CaptureSession {
    /// Wrap an opened stream and start listening
    #[must_use]
    pub fn new(stream: Box<dyn CaptureStream>, config: &VadConfig) -> Self {
        let mut recorder = UtteranceRecorder::new(stream.sample_rate());
        recorder.start();
        Self {
            analyzer: AudioFrameAnalyzer::new(config.fft_size),
            vad: VoiceActivityDetector::new(config.silence()),
            recorder,
            stream,
        }
    }

    /// Analyze newly captured audio and advance detection
    ///
    /// `allow_onset` is consulted when a frame would start speech; returning
    /// `false` masks the frame so no utterance begins.
    pub fn tick(
        &mut self,
        now: Instant,
        policy: ThresholdPolicy,
        allow_onset: impl FnOnce() -> bool,
    ) -> TickOutcome {
        let samples = self.stream.take_samples();
        let mut frame = self.analyzer.analyze(&samples, policy);

        if self.vad.state() == VadState::Quiescent && frame.has_signal && !allow_onset() {
            frame = frame.silenced();
        }

        let event = self.vad.observe(&frame, now);
        if event == VadEvent::SpeechStarted {
            self.recorder.mark_speech_started(now);
        }
        self.recorder.push(&samples);

        let utterance = if event == VadEvent::UtteranceEnded {
            self.recorder.seal(now, true)
        } else {
            None
        };

        TickOutcome {
            frame,
            event,
            utterance,
        }
    }

    /// Current detector state
    #[must_use]
    pub const fn vad_state(&self) -> VadState {
        self.vad.state()
    }

    /// Discard any partial utterance and release the microphone
    pub fn close(mut self) {
        let _ = self.recorder.seal(Instant::now(), false);
        self.vad.reset();
        self.analyzer.reset();
        self.stream.stop();
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("vad", &self.vad.state())
            .field("recording", &self.recorder.is_recording())
            .finish_non_exhaustive()
    }
}

/// Per-frame analysis task
struct AnalysisLoop {
    capture: CaptureSession,
    vad_config: VadConfig,
    settings: watch::Receiver<VoiceSettings>,
    speaking: watch::Receiver<bool>,
    interruption: InterruptionController,
    utterances: mpsc::UnboundedSender<Utterance>,
    level: watch::Sender<f32>,
    events: broadcast::Sender<SessionEvent>,
    token: CancellationToken,
}

impl AnalysisLoop {
    async fn run(mut self) -> CaptureSession {
        let period = self.vad_config.frame_interval().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.tick();
        }

        tracing::debug!("analysis loop stopped");
        self.capture
    }

    fn tick(&mut self) {
        let speaking = *self.speaking.borrow();
        let voice_interruption = self.settings.borrow().voice_interruption;
        let policy = ThresholdPolicy::select(&self.vad_config, speaking, voice_interruption);

        let interruption = &self.interruption;
        let outcome = self.capture.tick(Instant::now(), policy, || {
            interruption.on_user_speech_onset().records()
        });

        self.level.send_replace(outcome.frame.rms);

        if outcome.event == VadEvent::SpeechStarted {
            let _ = self.events.send(SessionEvent::SpeechStarted);
        }

        if let Some(utterance) = outcome.utterance {
            tracing::debug!(
                samples = utterance.sample_count(),
                duration_ms = utterance.duration().as_millis(),
                "utterance sealed"
            );
            let _ = self.events.send(SessionEvent::UtteranceSealed {
                duration: utterance.duration(),
                samples: utterance.sample_count(),
            });
            if self.utterances.send(utterance).is_err() {
                tracing::warn!("transcription dispatcher gone; utterance dropped");
            }
        }
    }
}

/// Handles reachable from synchronous entry points
struct EngineHandles {
    playback: SpeechPlayback,
    interruption: InterruptionController,
    aux_streams: Vec<Box<dyn MediaStream>>,
}

/// Everything owned by an active session
struct ActiveSession {
    token: CancellationToken,
    analysis: JoinHandle<CaptureSession>,
    dispatcher: JoinHandle<()>,
    wake_lock: Option<WakeLock>,
}

/// A real-time voice conversation session
pub struct VoiceSession {
    vad_config: VadConfig,
    playback_config: PlaybackConfig,
    collaborators: Collaborators,
    settings: watch::Receiver<VoiceSettings>,
    state: watch::Sender<SessionState>,
    level: watch::Sender<f32>,
    events: broadcast::Sender<SessionEvent>,
    lifecycle: tokio::sync::Mutex<Option<ActiveSession>>,
    engine: Mutex<Option<EngineHandles>>,
}

impl VoiceSession {
    /// Create a closed session
    ///
    /// `settings` is read whenever a value is needed, so the host may update
    /// it while the session runs.
    #[must_use]
    pub fn new(
        config: &Config,
        collaborators: Collaborators,
        settings: watch::Receiver<VoiceSettings>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Closed);
        let (level, _) = watch::channel(0.0);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            vad_config: config.vad,
            playback_config: config.playback,
            collaborators,
            settings,
            state,
            level,
            events,
            lifecycle: tokio::sync::Mutex::new(None),
            engine: Mutex::new(None),
        }
    }

    /// Open the session and start listening
    ///
    /// # Errors
    ///
    /// Returns `Error::MediaAccess` if the microphone cannot be acquired (the
    /// session stays closed), or `Error::InvalidState` if already open
    pub async fn open(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(Error::InvalidState("session already open".to_string()));
        }

        self.set_state(SessionState::Opening);

        let stream = match self.collaborators.devices.open_microphone() {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "microphone unavailable");
                self.set_state(SessionState::Closed);
                return Err(match e {
                    Error::MediaAccess(_) => e,
                    other => Error::MediaAccess(other.to_string()),
                });
            }
        };

        let wake_lock = match self.collaborators.keep_awake.acquire() {
            Ok(lock) => Some(lock),
            Err(e) => {
                tracing::warn!(error = %e, "keep-awake unavailable; continuing without it");
                None
            }
        };

        let token = CancellationToken::new();
        let handle = Handle::current();

        let cache = SpeechCache::new(
            self.playback_config.cache_capacity,
            self.collaborators.synthesizer.clone(),
            token.clone(),
            handle.clone(),
        );
        let playback = SpeechPlayback::new(PlaybackParts {
            cache,
            sink: Arc::clone(&self.collaborators.sink),
            local_voice: Arc::clone(&self.collaborators.local_voice),
            settings: self.settings.clone(),
            events: self.events.clone(),
            backoff: self.playback_config.backoff(),
            session_token: token.clone(),
            handle,
        });
        let interruption = InterruptionController::new(
            playback.clone(),
            Arc::clone(&self.collaborators.chat),
            self.settings.clone(),
            self.events.clone(),
        );

        let (utterance_tx, utterance_rx) = mpsc::unbounded_channel();
        let dispatcher = TranscriptionDispatcher::new(
            Arc::clone(&self.collaborators.transcriber),
            Arc::clone(&self.collaborators.chat),
            self.settings.clone(),
            self.events.clone(),
        );
        let dispatcher = tokio::spawn(dispatcher.run(utterance_rx, token.clone()));

        let analysis = AnalysisLoop {
            capture: CaptureSession::new(stream, &self.vad_config),
            vad_config: self.vad_config,
            settings: self.settings.clone(),
            speaking: playback.speaking(),
            interruption: interruption.clone(),
            utterances: utterance_tx,
            level: self.level.clone(),
            events: self.events.clone(),
            token: token.clone(),
        };
        let analysis = tokio::spawn(analysis.run());

        *self.engine() = Some(EngineHandles {
            playback,
            interruption,
            aux_streams: Vec::new(),
        });
        *lifecycle = Some(ActiveSession {
            token,
            analysis,
            dispatcher,
            wake_lock,
        });

        self.set_state(SessionState::Active);
        Ok(())
    }

    /// Close the session, releasing every resource
    ///
    /// Teardown is best effort: a failing step is logged and the remaining
    /// steps still run. Closing a closed session is a no-op.
    pub async fn close(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(mut active) = lifecycle.take() else {
            return;
        };

        self.set_state(SessionState::Closing);
        active.token.cancel();

        let engine = self.engine().take();
        if let Some(engine) = &engine {
            self.shut_down_playback(&engine.playback);
        }

        match active.analysis.await {
            Ok(capture) => capture.close(),
            Err(e) => tracing::warn!(error = %e, "analysis task failed during close"),
        }
        if let Err(e) = active.dispatcher.await {
            tracing::warn!(error = %e, "dispatcher task failed during close");
        }

        if let Some(engine) = engine {
            for mut stream in engine.aux_streams {
                stream.stop();
            }
        }
        if let Some(mut lock) = active.wake_lock.take() {
            lock.release();
        }

        self.level.send_replace(0.0);
        self.set_state(SessionState::Closed);
    }

    /// Route a chat-stream lifecycle event to the playback queues
    ///
    /// Ignored unless the session is active.
    pub fn dispatch_chat_event(&self, event: ChatStreamEvent) {
        let Some(playback) = self.engine().as_ref().map(|e| e.playback.clone()) else {
            tracing::debug!(
                response_id = %event.response_id(),
                "chat event ignored; session not active"
            );
            return;
        };

        match event {
            ChatStreamEvent::Start { response_id } => playback.begin_response(response_id),
            ChatStreamEvent::Chunk { response_id, text } => {
                playback.push_chunk(&response_id, &text);
            }
            ChatStreamEvent::Finish { response_id } => playback.finish_response(&response_id),
        }
    }

    /// The user tapped the avatar; returns whether speech was cut off
    #[must_use]
    pub fn tap_avatar(&self) -> bool {
        let Some(interruption) = self.engine().as_ref().map(|e| e.interruption.clone()) else {
            return false;
        };
        interruption.on_avatar_tap()
    }

    /// Hand over a camera or screen stream to be released on close
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` if the session is not active; the
    /// stream is stopped before returning
    pub fn attach_stream(&self, mut stream: Box<dyn MediaStream>) -> Result<()> {
        let mut engine = self.engine();
        if let Some(engine) = engine.as_mut() {
            engine.aux_streams.push(stream);
            return Ok(());
        }
        drop(engine);

        stream.stop();
        Err(Error::InvalidState("no active session".to_string()))
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch lifecycle state changes
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Subscribe to session events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Latest input RMS, for level animation
    #[must_use]
    pub fn level(&self) -> watch::Receiver<f32> {
        self.level.subscribe()
    }

    /// Whether the assistant is speaking
    #[must_use]
    pub fn is_assistant_speaking(&self) -> bool {
        self.engine()
            .as_ref()
            .is_some_and(|e| e.playback.is_speaking())
    }

    /// Number of response queues still draining
    #[must_use]
    pub fn pending_responses(&self) -> usize {
        self.engine()
            .as_ref()
            .map_or(0, |e| e.playback.queue_count())
    }

    /// Snapshot of the current settings
    #[must_use]
    pub fn settings(&self) -> VoiceSettings {
        self.settings.borrow().clone()
    }

    fn engine(&self) -> MutexGuard<'_, Option<EngineHandles>> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel every queue and stop generation of responses still streaming
    fn shut_down_playback(&self, playback: &SpeechPlayback) {
        for response_id in playback.shutdown() {
            tracing::debug!(%response_id, "stopping generation on close");
            self.collaborators.chat.stop_generation(&response_id);
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(from = %previous, to = %state, "session state changed");
            let _ = self.events.send(SessionEvent::StateChanged(state));
        }
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        let engine = self.engine().take();
        if let Some(engine) = engine {
            self.shut_down_playback(&engine.playback);
            for mut stream in engine.aux_streams {
                stream.stop();
            }
        }

        // Aborting the analysis task drops the capture stream with it
        if let Some(active) = self.lifecycle.get_mut().take() {
            active.token.cancel();
            active.analysis.abort();
            active.dispatcher.abort();
            tracing::debug!("session dropped while open");
        }
    }
}

impl std::fmt::Debug for VoiceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceSession")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
