//! Text-to-speech (TTS) processing

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::config::{DEFAULT_AZURE_VOICE, TtsConfig, TtsProvider};
use crate::{Error, Result};

/// Playable audio returned by a synthesis backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedAudio {
    /// Encoded audio bytes
    pub data: Vec<u8>,
    /// MIME type of `data`
    pub mime_type: String,
}

impl SynthesizedAudio {
    /// Wrap MP3 bytes
    #[must_use]
    pub fn mp3(data: Vec<u8>) -> Self {
        Self {
            data,
            mime_type: "audio/mpeg".to_string(),
        }
    }
}

/// Speech synthesis endpoint
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text` with the given voice
    ///
    /// # Errors
    ///
    /// Returns `Error::Synthesis` if the service fails
    async fn synthesize(&self, text: &str, voice: &str, speed: f32) -> Result<SynthesizedAudio>;
}

/// Synthesizes speech from text over HTTP
pub struct TextToSpeech {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    provider: TtsProvider,
}

impl TextToSpeech {
    /// Create a TTS client from configuration
    ///
    /// Returns `None` when no synthesis backend is enabled.
    #[must_use]
    pub fn from_config(config: &TtsConfig) -> Option<Self> {
        if config.provider == TtsProvider::Azure && config.base_url.is_empty() {
            tracing::warn!("Azure synthesis needs AZURE_SPEECH_REGION or a base URL");
        }
        if !config.backend_enabled() {
            return None;
        }

        Some(Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone()?,
            model: config.model.clone(),
            provider: config.provider,
        })
    }

    /// Synthesize using an OpenAI-compatible endpoint
    async fn synthesize_openai(&self, text: &str, voice: &str, speed: f32) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
            response_format: &'a str,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice,
            speed: speed.clamp(0.25, 4.0),
            response_format: "mp3",
        };

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Synthesis(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Synthesis(format!("OpenAI TTS error {status}: {body}")));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| Error::Synthesis(e.to_string()))?;
        Ok(audio.to_vec())
    }

    /// Synthesize using `ElevenLabs` TTS
    async fn synthesize_elevenlabs(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!("{}/text-to-speech/{voice}", self.base_url);

        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Synthesis(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Synthesis(format!("ElevenLabs TTS error {status}: {body}")));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| Error::Synthesis(e.to_string()))?;
        Ok(audio.to_vec())
    }

    /// Synthesize using Azure Speech SSML
    async fn synthesize_azure(&self, text: &str, voice: &str, speed: f32) -> Result<Vec<u8>> {
        let voice = if voice.contains('-') {
            voice
        } else {
            DEFAULT_AZURE_VOICE
        };

        let response = self
            .client
            .post(format!("{}/cognitiveservices/v1", self.base_url))
            .header("Ocp-Apim-Subscription-Key", self.api_key.expose_secret())
            .header("Content-Type", "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", &self.model)
            .header("User-Agent", "voxline")
            .body(azure_ssml(text, voice, speed))
            .send()
            .await
            .map_err(|e| Error::Synthesis(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Synthesis(format!("Azure TTS error {status}: {body}")));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| Error::Synthesis(e.to_string()))?;
        Ok(audio.to_vec())
    }
}

/// Build the SSML document for an Azure voice
///
/// The locale comes from the voice name (`en-US-JennyNeural` speaks `en-US`).
fn azure_ssml(text: &str, voice: &str, speed: f32) -> String {
    let lang = voice.splitn(3, '-').take(2).collect::<Vec<_>>().join("-");
    let rate = (speed.clamp(0.5, 2.0) - 1.0) * 100.0;
    format!(
        "<speak version='1.0' xmlns='http://www.w3.org/2001/10/synthesis' xml:lang='{lang}'>\
         <voice name='{voice}'><prosody rate='{rate:+.0}%'>{text}</prosody></voice></speak>",
        lang = escape_xml(&lang),
        voice = escape_xml(voice),
        text = escape_xml(text),
    )
}

fn escape_xml(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '\'' => escaped.push_str("&apos;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[async_trait]
impl Synthesizer for TextToSpeech {
    async fn synthesize(&self, text: &str, voice: &str, speed: f32) -> Result<SynthesizedAudio> {
        tracing::debug!(chars = text.len(), voice, "synthesizing fragment");

        let data = match self.provider {
            TtsProvider::OpenAi => self.synthesize_openai(text, voice, speed).await?,
            // ElevenLabs doesn't use speed in the same way
            TtsProvider::ElevenLabs => self.synthesize_elevenlabs(text, voice).await?,
            TtsProvider::Azure => self.synthesize_azure(text, voice, speed).await?,
            TtsProvider::Local => {
                return Err(Error::Unsupported(
                    "local voice has no synthesis endpoint".to_string(),
                ));
            }
        };

        if data.is_empty() {
            return Err(Error::Synthesis("empty audio response".to_string()));
        }

        Ok(SynthesizedAudio::mp3(data))
    }
}

impl std::fmt::Debug for TextToSpeech {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextToSpeech")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}
