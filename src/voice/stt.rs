//! Speech-to-text (STT) processing

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::config::{SttConfig, SttProvider};
use crate::{Error, Result};

/// Speech-to-text endpoint
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe an encoded audio segment
    ///
    /// # Errors
    ///
    /// Returns `Error::Transcription` if the service fails
    async fn transcribe(&self, audio: &[u8], language: Option<&str>) -> Result<String>;
}

/// Response from an OpenAI-compatible transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// Response from Azure Speech short-audio recognition
#[derive(serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AzureResponse {
    recognition_status: String,
    #[serde(default)]
    display_text: String,
}

/// Transcribes speech to text over HTTP
pub struct SpeechToText {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    provider: SttProvider,
}

impl SpeechToText {
    /// Create an STT client from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the API key or base URL is missing
    pub fn from_config(config: &SttConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.expose_secret().is_empty())
            .ok_or_else(|| {
                Error::Config(format!("{:?} API key required for transcription", config.provider))
            })?;
        if config.base_url.is_empty() {
            return Err(Error::Config(format!(
                "{:?} transcription has no base URL (Azure needs AZURE_SPEECH_REGION)",
                config.provider
            )));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            provider: config.provider,
        })
    }

    /// Transcribe using an OpenAI-compatible endpoint
    async fn transcribe_whisper(&self, audio: &[u8], language: Option<&str>) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), language, "starting Whisper transcription");

        let mut form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Transcription(e.to_string()))?,
            )
            .text("model", self.model.clone());
        if let Some(language) = language {
            form = form.text("language", language.to_string());
        }

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Whisper request failed");
                Error::Transcription(e.to_string())
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Transcription(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse response");
            Error::Transcription(e.to_string())
        })?;

        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }

    /// Transcribe using Deepgram
    async fn transcribe_deepgram(&self, audio: &[u8], language: Option<&str>) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), language, "starting Deepgram transcription");

        let mut query = vec![("model", self.model.as_str()), ("punctuate", "true")];
        if let Some(language) = language {
            query.push(("language", language));
        }

        let response = self
            .client
            .post(format!("{}/listen", self.base_url))
            .query(&query)
            .header(
                "Authorization",
                format!("Token {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "audio/wav")
            .body(audio.to_vec())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Deepgram request failed");
                Error::Transcription(e.to_string())
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Deepgram API error");
            return Err(Error::Transcription(format!("Deepgram API error {status}: {body}")));
        }

        let result: DeepgramResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse Deepgram response");
            Error::Transcription(e.to_string())
        })?;

        let transcript = result
            .results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
            .map(|a| a.transcript.clone())
            .unwrap_or_default();

        tracing::info!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }

    /// Transcribe using Azure Speech
    ///
    /// Azure requires a locale, so `en-US` stands in when no hint is set.
    async fn transcribe_azure(&self, audio: &[u8], language: Option<&str>) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), language, "starting Azure transcription");

        let (base, mode) = (&self.base_url, &self.model);
        let url = format!("{base}/speech/recognition/{mode}/cognitiveservices/v1");
        let response = self
            .client
            .post(url)
            .query(&[
                ("language", language.unwrap_or("en-US")),
                ("format", "simple"),
            ])
            .header("Ocp-Apim-Subscription-Key", self.api_key.expose_secret())
            .header("Content-Type", "audio/wav")
            .body(audio.to_vec())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Azure request failed");
                Error::Transcription(e.to_string())
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Azure Speech error");
            return Err(Error::Transcription(format!("Azure Speech error {status}: {body}")));
        }

        let result: AzureResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse Azure response");
            Error::Transcription(e.to_string())
        })?;

        // NoMatch and InitialSilenceTimeout carry no text
        if result.recognition_status != "Success" {
            tracing::debug!(status = %result.recognition_status, "no speech recognized");
        }

        tracing::info!(transcript = %result.display_text, "transcription complete");
        Ok(result.display_text)
    }
}

#[async_trait]
impl Transcriber for SpeechToText {
    async fn transcribe(&self, audio: &[u8], language: Option<&str>) -> Result<String> {
        match self.provider {
            SttProvider::OpenAi => self.transcribe_whisper(audio, language).await,
            SttProvider::Deepgram => self.transcribe_deepgram(audio, language).await,
            SttProvider::Azure => self.transcribe_azure(audio, language).await,
        }
    }
}

impl std::fmt::Debug for SpeechToText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechToText")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_api_key() {
        let config = SttConfig {
            provider: SttProvider::OpenAi,
            base_url: "https://api.openai.com/v1/".to_string(),
            model: "whisper-1".to_string(),
            api_key: None,
        };
        assert!(matches!(SpeechToText::from_config(&config), Err(Error::Config(_))));

        let config = SttConfig {
            api_key: Some(SecretString::from("sk-test".to_string())),
            ..config
        };
        let stt = SpeechToText::from_config(&config).unwrap();
        assert_eq!(stt.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn test_azure_from_config() {
        let config = SttConfig {
            provider: SttProvider::Azure,
            base_url: "https://westeurope.stt.speech.microsoft.com".to_string(),
            model: SttProvider::Azure.default_model().to_string(),
            api_key: Some(SecretString::from("az-key".to_string())),
        };
        let stt = SpeechToText::from_config(&config).unwrap();
        assert_eq!(stt.provider, SttProvider::Azure);
        assert_eq!(stt.model, "conversation");

        let config = SttConfig {
            base_url: String::new(),
            ..config
        };
        assert!(matches!(SpeechToText::from_config(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_azure_response_without_text() {
        let result: AzureResponse =
            serde_json::from_str(r#"{"RecognitionStatus":"NoMatch","Offset":0}"#).unwrap();
        assert_eq!(result.recognition_status, "NoMatch");
        assert!(result.display_text.is_empty());
    }
}
