//! TOML configuration file loading
//!
//! Supports `~/.config/voxline/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoxlineConfigFile {
    /// Voice activity detection tuning
    #[serde(default)]
    pub vad: VadFileConfig,

    /// Playback queue tuning
    #[serde(default)]
    pub playback: PlaybackFileConfig,

    /// Speech-to-text endpoint
    #[serde(default)]
    pub stt: SttFileConfig,

    /// Speech synthesis endpoint
    #[serde(default)]
    pub tts: TtsFileConfig,

    /// On-device voice fallback
    #[serde(default)]
    pub local_voice: LocalVoiceFileConfig,

    /// User-facing voice settings
    #[serde(default)]
    pub settings: SettingsFileConfig,
}

/// Voice activity detection configuration
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    pub floor_db: Option<f32>,
    pub ceiling_db: Option<f32>,
    pub desensitized_floor_db: Option<f32>,
    pub desensitized_ceiling_db: Option<f32>,
    pub silence_ms: Option<u64>,
    pub frame_interval_ms: Option<u64>,
    pub fft_size: Option<usize>,
}

/// Playback queue configuration
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    /// Retry delay while a fragment is not yet synthesized (ms)
    pub backoff_ms: Option<u64>,

    /// Maximum number of cached fragments
    pub cache_capacity: Option<usize>,
}

/// STT endpoint configuration
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    /// "openai", "deepgram" or "azure"
    pub provider: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    /// Azure Speech region (e.g. "westeurope")
    pub region: Option<String>,
}

/// TTS endpoint configuration
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    /// "openai", "elevenlabs", "azure" or "local"
    pub provider: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub region: Option<String>,
}

/// Local voice configuration
#[derive(Debug, Default, Deserialize)]
pub struct LocalVoiceFileConfig {
    /// Explicit program path (e.g. "/usr/bin/espeak-ng")
    pub program: Option<String>,
}

/// Voice settings overlay
#[derive(Debug, Default, Deserialize)]
pub struct SettingsFileConfig {
    pub voice_interruption: Option<bool>,
    pub tts_voice: Option<String>,
    pub stt_language: Option<String>,
    pub playback_rate: Option<f32>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoxlineConfigFile::default()` if the file doesn't exist or can't be parsed.
#[must_use]
pub fn load_config_file() -> VoxlineConfigFile {
    config_file_path().map_or_else(VoxlineConfigFile::default, |path| load_from(&path))
}

/// Load a config file from an explicit path, falling back to defaults
#[must_use]
pub fn load_from(path: &Path) -> VoxlineConfigFile {
    if !path.exists() {
        return VoxlineConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VoxlineConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VoxlineConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/voxline/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voxline").join("config.toml"))
}
