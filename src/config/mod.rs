//! Configuration management for the voice engine
//!
//! Values resolve as env > toml > default.

pub mod file;

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use self::file::VoxlineConfigFile;
use crate::{Error, Result};

/// Default OpenAI-compatible API base
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Default Deepgram API base
pub const DEFAULT_DEEPGRAM_BASE_URL: &str = "https://api.deepgram.com/v1";

/// Default `ElevenLabs` API base
pub const DEFAULT_ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io/v1";

/// Default Azure neural voice when the configured voice is not an Azure name
pub const DEFAULT_AZURE_VOICE: &str = "en-US-JennyNeural";

/// Voxline configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Voice activity detection policy constants
    pub vad: VadConfig,

    /// Playback worker and speech cache tuning
    pub playback: PlaybackConfig,

    /// Speech-to-text endpoint
    pub stt: SttConfig,

    /// Speech synthesis endpoint
    pub tts: TtsConfig,

    /// On-device voice fallback
    pub local_voice: LocalVoiceConfig,

    /// Initial user-facing settings
    pub settings: VoiceSettings,
}

/// Voice activity detection policy constants
///
/// The decibel window and silence duration are policy values, kept
/// overridable rather than derived.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VadConfig {
    /// Spectral floor for "active" classification (dB)
    pub floor_db: f32,

    /// Spectral ceiling used to scale intensity (dB)
    pub ceiling_db: f32,

    /// Floor applied while the assistant speaks without interruption enabled
    pub desensitized_floor_db: f32,

    /// Ceiling applied while desensitized
    pub desensitized_ceiling_db: f32,

    /// Silence required to seal an utterance (ms)
    pub silence_ms: u64,

    /// Analysis tick period (ms)
    pub frame_interval_ms: u64,

    /// Analysis window length in samples (power of two)
    pub fft_size: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            floor_db: -55.0,
            ceiling_db: -30.0,
            desensitized_floor_db: -1.0,
            desensitized_ceiling_db: 0.0,
            silence_ms: 2000,
            frame_interval_ms: 16,
            fft_size: 512,
        }
    }
}

impl VadConfig {
    /// Silence timeout as a duration
    #[must_use]
    pub const fn silence(&self) -> Duration {
        Duration::from_millis(self.silence_ms)
    }

    /// Analysis tick period as a duration
    #[must_use]
    pub const fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

/// Playback worker and speech cache tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlaybackConfig {
    /// Retry delay while waiting for synthesis or more text (ms)
    pub backoff_ms: u64,

    /// Maximum cached fragments per session
    pub cache_capacity: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            backoff_ms: 200,
            cache_capacity: 256,
        }
    }
}

impl PlaybackConfig {
    /// Backoff as a duration
    #[must_use]
    pub const fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Speech-to-text provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SttProvider {
    /// OpenAI-compatible `/audio/transcriptions`
    OpenAi,
    /// Deepgram `/listen`
    Deepgram,
    /// Azure Speech short-audio recognition
    Azure,
}

impl std::str::FromStr for SttProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" | "whisper" => Ok(Self::OpenAi),
            "deepgram" => Ok(Self::Deepgram),
            "azure" => Ok(Self::Azure),
            other => Err(Error::Config(format!("unknown STT provider: {other}"))),
        }
    }
}

impl SttProvider {
    /// Model used when none is configured
    ///
    /// For Azure this is the recognition mode in the request path.
    #[must_use]
    pub const fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "whisper-1",
            Self::Deepgram => "nova-2",
            Self::Azure => "conversation",
        }
    }
}

/// Speech synthesis provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsProvider {
    /// OpenAI-compatible `/audio/speech`
    OpenAi,
    /// `ElevenLabs` text-to-speech
    ElevenLabs,
    /// Azure Speech SSML synthesis
    Azure,
    /// No synthesis backend; use the on-device voice
    Local,
}

impl std::str::FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "elevenlabs" => Ok(Self::ElevenLabs),
            "azure" => Ok(Self::Azure),
            "local" | "browser" | "none" => Ok(Self::Local),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

impl TtsProvider {
    /// Model used when none is configured
    ///
    /// For Azure this is the `X-Microsoft-OutputFormat` value.
    #[must_use]
    pub const fn default_model(self) -> &'static str {
        match self {
            Self::ElevenLabs => "eleven_monolingual_v1",
            Self::Azure => "audio-16khz-128kbitrate-mono-mp3",
            Self::OpenAi | Self::Local => "tts-1",
        }
    }
}

/// Speech-to-text endpoint configuration
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub provider: SttProvider,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<SecretString>,
}

/// Speech synthesis endpoint configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub provider: TtsProvider,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<SecretString>,
}

impl TtsConfig {
    /// Whether a remote synthesis backend is usable
    #[must_use]
    pub fn backend_enabled(&self) -> bool {
        self.provider != TtsProvider::Local
            && !self.base_url.is_empty()
            && self
                .api_key
                .as_ref()
                .is_some_and(|k| !k.expose_secret().is_empty())
    }
}

/// On-device voice configuration
#[derive(Debug, Clone, Default, Serialize)]
pub struct LocalVoiceConfig {
    /// Explicit program; `None` searches `PATH`
    pub program: Option<String>,
}

/// User-facing voice settings (read-only to the engine)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    /// Allow the user to barge in while the assistant speaks
    pub voice_interruption: bool,

    /// Synthesis voice identifier
    pub tts_voice: String,

    /// Source language hint for transcription
    pub stt_language: Option<String>,

    /// Speech rate multiplier
    pub playback_rate: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            voice_interruption: false,
            tts_voice: "alloy".to_string(),
            stt_language: None,
            playback_rate: 1.0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::resolve(VoxlineConfigFile::default(), |_| None)
    }
}

impl Config {
    /// Load configuration from the environment and config file
    #[must_use]
    pub fn load() -> Self {
        Self::resolve(file::load_config_file(), |name| std::env::var(name).ok())
    }

    /// Resolve configuration from a parsed file and an env lookup
    #[must_use]
    pub fn resolve(fc: VoxlineConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            vad: resolve_vad(&fc, &env),
            playback: resolve_playback(&fc),
            stt: resolve_stt(&fc, &env),
            tts: resolve_tts(&fc, &env),
            local_voice: LocalVoiceConfig {
                program: env("VOXLINE_LOCAL_VOICE").or(fc.local_voice.program.clone()),
            },
            settings: resolve_settings(&fc, &env),
        }
    }

    /// Render the resolved configuration with secrets redacted
    #[must_use]
    pub fn to_redacted_json(&self) -> serde_json::Value {
        serde_json::json!({
            "vad": self.vad,
            "playback": self.playback,
            "stt": {
                "provider": self.stt.provider,
                "base_url": self.stt.base_url,
                "model": self.stt.model,
                "api_key": self.stt.api_key.as_ref().map(|_| "[REDACTED]"),
            },
            "tts": {
                "provider": self.tts.provider,
                "base_url": self.tts.base_url,
                "model": self.tts.model,
                "api_key": self.tts.api_key.as_ref().map(|_| "[REDACTED]"),
                "backend_enabled": self.tts.backend_enabled(),
            },
            "local_voice": self.local_voice,
            "settings": self.settings,
        })
    }
}

fn resolve_vad(fc: &VoxlineConfigFile, env: &impl Fn(&str) -> Option<String>) -> VadConfig {
    let defaults = VadConfig::default();
    VadConfig {
        floor_db: fc.vad.floor_db.unwrap_or(defaults.floor_db),
        ceiling_db: fc.vad.ceiling_db.unwrap_or(defaults.ceiling_db),
        desensitized_floor_db: fc
            .vad
            .desensitized_floor_db
            .unwrap_or(defaults.desensitized_floor_db),
        desensitized_ceiling_db: fc
            .vad
            .desensitized_ceiling_db
            .unwrap_or(defaults.desensitized_ceiling_db),
        silence_ms: parse_env(env, "VOXLINE_SILENCE_MS")
            .or(fc.vad.silence_ms)
            .unwrap_or(defaults.silence_ms),
        frame_interval_ms: fc
            .vad
            .frame_interval_ms
            .unwrap_or(defaults.frame_interval_ms)
            .max(1),
        fft_size: fc
            .vad
            .fft_size
            .map_or(defaults.fft_size, |n| n.max(32).next_power_of_two()),
    }
}

fn resolve_playback(fc: &VoxlineConfigFile) -> PlaybackConfig {
    let defaults = PlaybackConfig::default();
    PlaybackConfig {
        backoff_ms: fc.playback.backoff_ms.unwrap_or(defaults.backoff_ms),
        cache_capacity: fc
            .playback
            .cache_capacity
            .unwrap_or(defaults.cache_capacity)
            .max(1),
    }
}

fn resolve_stt(fc: &VoxlineConfigFile, env: &impl Fn(&str) -> Option<String>) -> SttConfig {
    let provider = env("VOXLINE_STT_PROVIDER")
        .or(fc.stt.provider.clone())
        .and_then(|p| {
            p.parse()
                .inspect_err(|e| tracing::warn!(error = %e, "ignoring STT provider"))
                .ok()
        })
        .unwrap_or(SttProvider::OpenAi);
    let api_key = match provider {
        SttProvider::OpenAi => env("OPENAI_API_KEY"),
        SttProvider::Deepgram => env("DEEPGRAM_API_KEY"),
        SttProvider::Azure => env("AZURE_SPEECH_KEY"),
    }
    .or(fc.stt.api_key.clone());
    let region = env("AZURE_SPEECH_REGION").or(fc.stt.region.clone());

    SttConfig {
        provider,
        base_url: env("VOXLINE_STT_URL")
            .or(fc.stt.base_url.clone())
            .unwrap_or_else(|| match provider {
                SttProvider::OpenAi => DEFAULT_OPENAI_BASE_URL.to_string(),
                SttProvider::Deepgram => DEFAULT_DEEPGRAM_BASE_URL.to_string(),
                SttProvider::Azure => azure_base_url(region.as_deref(), "stt"),
            }),
        model: env("VOXLINE_STT_MODEL")
            .or(fc.stt.model.clone())
            .unwrap_or_else(|| provider.default_model().to_string()),
        api_key: api_key.map(SecretString::from),
    }
}

fn resolve_tts(fc: &VoxlineConfigFile, env: &impl Fn(&str) -> Option<String>) -> TtsConfig {
    let provider = env("VOXLINE_TTS_PROVIDER")
        .or(fc.tts.provider.clone())
        .and_then(|p| {
            p.parse()
                .inspect_err(|e| tracing::warn!(error = %e, "ignoring TTS provider"))
                .ok()
        })
        .unwrap_or(TtsProvider::OpenAi);
    let api_key = match provider {
        TtsProvider::OpenAi => env("OPENAI_API_KEY"),
        TtsProvider::ElevenLabs => env("ELEVENLABS_API_KEY"),
        TtsProvider::Azure => env("AZURE_SPEECH_KEY"),
        TtsProvider::Local => None,
    }
    .or(fc.tts.api_key.clone());
    let region = env("AZURE_SPEECH_REGION").or(fc.tts.region.clone());

    TtsConfig {
        provider,
        base_url: env("VOXLINE_TTS_URL")
            .or(fc.tts.base_url.clone())
            .unwrap_or_else(|| match provider {
                TtsProvider::ElevenLabs => DEFAULT_ELEVENLABS_BASE_URL.to_string(),
                TtsProvider::Azure => azure_base_url(region.as_deref(), "tts"),
                TtsProvider::OpenAi | TtsProvider::Local => DEFAULT_OPENAI_BASE_URL.to_string(),
            }),
        model: env("VOXLINE_TTS_MODEL")
            .or(fc.tts.model.clone())
            .unwrap_or_else(|| provider.default_model().to_string()),
        api_key: api_key.map(SecretString::from),
    }
}

fn resolve_settings(
    fc: &VoxlineConfigFile,
    env: &impl Fn(&str) -> Option<String>,
) -> VoiceSettings {
    let defaults = VoiceSettings::default();
    VoiceSettings {
        voice_interruption: parse_env(env, "VOXLINE_VOICE_INTERRUPTION")
            .or(fc.settings.voice_interruption)
            .unwrap_or(defaults.voice_interruption),
        tts_voice: env("VOXLINE_TTS_VOICE")
            .or(fc.settings.tts_voice.clone())
            .unwrap_or(defaults.tts_voice),
        stt_language: env("VOXLINE_STT_LANGUAGE")
            .or(fc.settings.stt_language.clone())
            .filter(|l| !l.trim().is_empty()),
        playback_rate: fc
            .settings
            .playback_rate
            .filter(|r| r.is_finite() && *r > 0.0)
            .unwrap_or(defaults.playback_rate),
    }
}

/// Regional Azure Speech host; empty when no region is configured
fn azure_base_url(region: Option<&str>, service: &str) -> String {
    region
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map_or_else(String::new, |r| format!("https://{r}.{service}.speech.microsoft.com"))
}

/// Parse an env var, ignoring malformed values
fn parse_env<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    env(name).and_then(|v| {
        v.trim()
            .parse()
            .inspect_err(|_| tracing::warn!(var = name, value = %v, "ignoring malformed env var"))
            .ok()
    })
}
