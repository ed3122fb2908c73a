//! Shared test utilities
//!
//! Hardware-free fakes for every session collaborator.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use voxline::config::VoiceSettings;
use voxline::engine::{ChatClient, Collaborators, ResponseId, SubmitOptions, VoiceSession};
use voxline::voice::{
    AudioSink, CaptureStream, KeepAwake, LocalVoice, MediaDevices, MediaStream, SAMPLE_RATE,
    SynthesizedAudio, Synthesizer, Transcriber, WakeLock,
};
use voxline::{Config, Error, Result};

/// Samples per capture chunk (16 ms at 16 kHz)
pub const CHUNK: usize = 256;

/// Generate sine wave audio samples
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn sine(frequency: f32, duration_ms: u64, amplitude: f32) -> Vec<f32> {
    let num_samples = (u64::from(SAMPLE_RATE) * duration_ms / 1000) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Generate silence
#[allow(clippy::cast_possible_truncation)]
pub fn silence(duration_ms: u64) -> Vec<f32> {
    vec![0.0; (u64::from(SAMPLE_RATE) * duration_ms / 1000) as usize]
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_for(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

// ---------------------------------------------------------------------------
// Microphone
// ---------------------------------------------------------------------------

/// Scripted microphone; each capture tick consumes one queued chunk
#[derive(Clone, Default)]
pub struct FakeMic {
    feed: Arc<Mutex<VecDeque<Vec<f32>>>>,
    opened: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    denied: Arc<AtomicBool>,
}

impl FakeMic {
    pub fn new() -> Self {
        Self::default()
    }

    /// A microphone whose permission is denied
    pub fn denied() -> Self {
        let mic = Self::default();
        mic.denied.store(true, Ordering::SeqCst);
        mic
    }

    /// Queue audio to be captured
    pub fn feed(&self, samples: &[f32]) {
        let mut feed = self.feed.lock().unwrap();
        for chunk in samples.chunks(CHUNK) {
            feed.push_back(chunk.to_vec());
        }
    }

    /// Queue a 440 Hz tone
    pub fn speak(&self, duration_ms: u64) {
        self.feed(&sine(440.0, duration_ms, 0.5));
    }

    /// Streams opened so far
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Streams currently open
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Open a stream directly, bypassing the session
    pub fn stream(&self) -> Box<dyn CaptureStream> {
        self.open_microphone().unwrap()
    }
}

impl MediaDevices for FakeMic {
    fn open_microphone(&self) -> Result<Box<dyn CaptureStream>> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(Error::MediaAccess("permission denied".to_string()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeStream {
            feed: Arc::clone(&self.feed),
            live: Arc::clone(&self.live),
            stopped: false,
        }))
    }
}

struct FakeStream {
    feed: Arc<Mutex<VecDeque<Vec<f32>>>>,
    live: Arc<AtomicUsize>,
    stopped: bool,
}

impl CaptureStream for FakeStream {
    fn take_samples(&mut self) -> Vec<f32> {
        if self.stopped {
            return Vec::new();
        }
        self.feed
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![0.0; CHUNK])
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Auxiliary camera/screen stream
#[derive(Clone, Default)]
pub struct FakeCamera {
    pub stopped: Arc<AtomicBool>,
}

impl MediaStream for FakeCamera {
    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Speaker
// ---------------------------------------------------------------------------

/// Output device that "plays" text-encoded audio for a fixed duration
pub struct FakeSink {
    duration: Duration,
    started: Mutex<Vec<String>>,
    finished: Mutex<Vec<String>>,
    active: AtomicBool,
    stops: AtomicUsize,
    current: Mutex<Option<CancellationToken>>,
}

impl FakeSink {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            started: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
            stops: AtomicUsize::new(0),
            current: Mutex::new(None),
        }
    }

    /// Fragments whose playback began, in order
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    /// Fragments played to completion, in order
    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }

    /// Whether audio is sounding right now
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for FakeSink {
    async fn play(&self, audio: &SynthesizedAudio) -> Result<()> {
        let text = String::from_utf8_lossy(&audio.data).into_owned();
        let token = CancellationToken::new();
        *self.current.lock().unwrap() = Some(token.clone());
        self.started.lock().unwrap().push(text.clone());
        self.active.store(true, Ordering::SeqCst);

        tokio::select! {
            () = token.cancelled() => Err(Error::StreamAborted),
            () = tokio::time::sleep(self.duration) => {
                self.active.store(false, Ordering::SeqCst);
                self.finished.lock().unwrap().push(text);
                Ok(())
            }
        }
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        if let Some(token) = self.current.lock().unwrap().take() {
            token.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

/// Synthesizer that encodes the text itself as the audio payload
pub struct FakeSynth {
    delays: HashMap<String, Duration>,
    default_delay: Duration,
    failing: Vec<String>,
    calls: Mutex<Vec<String>>,
}

impl FakeSynth {
    pub fn new() -> Self {
        Self {
            delays: HashMap::new(),
            default_delay: Duration::from_millis(10),
            failing: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Make synthesis of `text` take `delay`
    #[must_use]
    pub fn with_delay(mut self, text: &str, delay: Duration) -> Self {
        self.delays.insert(text.to_string(), delay);
        self
    }

    /// Make synthesis of `text` fail
    #[must_use]
    pub fn failing_on(mut self, text: &str) -> Self {
        self.failing.push(text.to_string());
        self
    }

    /// Texts synthesized, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, text: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|t| *t == text).count()
    }
}

#[async_trait]
impl Synthesizer for FakeSynth {
    async fn synthesize(&self, text: &str, _voice: &str, _speed: f32) -> Result<SynthesizedAudio> {
        self.calls.lock().unwrap().push(text.to_string());
        let delay = self.delays.get(text).copied().unwrap_or(self.default_delay);
        tokio::time::sleep(delay).await;

        if self.failing.iter().any(|t| t == text) {
            return Err(Error::Synthesis("backend unavailable".to_string()));
        }
        Ok(SynthesizedAudio {
            data: text.as_bytes().to_vec(),
            mime_type: "text/plain".to_string(),
        })
    }
}

/// Local voice that records what it spoke
pub struct FakeLocalVoice {
    duration: Duration,
    spoken: Mutex<Vec<String>>,
    stops: AtomicUsize,
}

impl FakeLocalVoice {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            spoken: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalVoice for FakeLocalVoice {
    async fn speak(&self, text: &str, _rate: f32) -> Result<()> {
        tokio::time::sleep(self.duration).await;
        self.spoken.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Transcription and chat
// ---------------------------------------------------------------------------

/// Transcriber returning scripted results, then empty text
pub struct FakeTranscriber {
    script: Mutex<VecDeque<Result<String>>>,
    calls: AtomicUsize,
    languages: Mutex<Vec<Option<String>>>,
}

impl FakeTranscriber {
    pub fn new(script: Vec<Result<String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            languages: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn languages(&self) -> Vec<Option<String>> {
        self.languages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, audio: &[u8], language: Option<&str>) -> Result<String> {
        assert_eq!(&audio[0..4], b"RIFF", "utterances are uploaded as WAV");
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.languages
            .lock()
            .unwrap()
            .push(language.map(ToString::to_string));
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(String::new()))
    }
}

/// Chat client that records submissions and stop requests
#[derive(Default)]
pub struct FakeChat {
    submitted: Mutex<Vec<(String, SubmitOptions)>>,
    stopped: Mutex<Vec<ResponseId>>,
}

impl FakeChat {
    pub fn submitted(&self) -> Vec<(String, SubmitOptions)> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<ResponseId> {
        self.stopped.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatClient for FakeChat {
    async fn submit(&self, text: &str, options: SubmitOptions) -> Result<()> {
        self.submitted
            .lock()
            .unwrap()
            .push((text.to_string(), options));
        Ok(())
    }

    fn stop_generation(&self, response_id: &ResponseId) {
        self.stopped.lock().unwrap().push(response_id.clone());
    }
}

// ---------------------------------------------------------------------------
// Keep-awake
// ---------------------------------------------------------------------------

/// Keep-awake facility that counts acquisitions and releases
#[derive(Default)]
pub struct FakeKeepAwake {
    unsupported: bool,
    acquired: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl FakeKeepAwake {
    pub fn unsupported() -> Self {
        Self {
            unsupported: true,
            ..Self::default()
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl KeepAwake for FakeKeepAwake {
    fn acquire(&self) -> Result<WakeLock> {
        if self.unsupported {
            return Err(Error::Unsupported("no wake lock".to_string()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let released = Arc::clone(&self.released);
        Ok(WakeLock::new(move || {
            released.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Knobs for building a test session
pub struct HarnessOptions {
    pub settings: VoiceSettings,
    pub mic: FakeMic,
    pub synth: Option<FakeSynth>,
    pub play_duration: Duration,
    pub transcripts: Vec<Result<String>>,
    pub keep_awake: FakeKeepAwake,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            settings: VoiceSettings::default(),
            mic: FakeMic::new(),
            synth: Some(FakeSynth::new()),
            play_duration: Duration::from_millis(300),
            transcripts: Vec::new(),
            keep_awake: FakeKeepAwake::default(),
        }
    }
}

/// A session wired to fakes, with handles to inspect them
pub struct Harness {
    pub mic: FakeMic,
    pub sink: Arc<FakeSink>,
    pub synth: Option<Arc<FakeSynth>>,
    pub local_voice: Arc<FakeLocalVoice>,
    pub transcriber: Arc<FakeTranscriber>,
    pub chat: Arc<FakeChat>,
    pub keep_awake: Arc<FakeKeepAwake>,
    pub settings: watch::Sender<VoiceSettings>,
    pub session: VoiceSession,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(HarnessOptions::default())
    }

    pub fn with(options: HarnessOptions) -> Self {
        let sink = Arc::new(FakeSink::new(options.play_duration));
        let synth = options.synth.map(Arc::new);
        let local_voice = Arc::new(FakeLocalVoice::new(options.play_duration));
        let transcriber = Arc::new(FakeTranscriber::new(options.transcripts));
        let chat = Arc::new(FakeChat::default());
        let keep_awake = Arc::new(options.keep_awake);
        let (settings, settings_rx) = watch::channel(options.settings);

        let collaborators = Collaborators {
            devices: Arc::new(options.mic.clone()),
            transcriber: transcriber.clone(),
            synthesizer: synth.clone().map(|s| s as Arc<dyn Synthesizer>),
            sink: sink.clone(),
            local_voice: local_voice.clone(),
            keep_awake: keep_awake.clone(),
            chat: chat.clone(),
        };
        let session = VoiceSession::new(&Config::default(), collaborators, settings_rx);

        Self {
            mic: options.mic,
            sink,
            synth,
            local_voice,
            transcriber,
            chat,
            keep_awake,
            settings,
            session,
        }
    }

    pub fn synth(&self) -> &FakeSynth {
        self.synth.as_deref().unwrap()
    }
}
