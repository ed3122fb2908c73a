//! Utterance buffering
//!
//! Audio is only retained once speech has been confirmed, so utterances
//! never carry leading silence.

use std::time::Duration;

use tokio::time::Instant;

use crate::{Error, Result};

/// One sealed span of user speech
#[derive(Debug, Clone)]
pub struct Utterance {
    chunks: Vec<Vec<f32>>,
    sample_rate: u32,
    started_at: Instant,
    ended_at: Instant,
}

impl Utterance {
    /// Raw audio chunks in capture order
    #[must_use]
    pub fn chunks(&self) -> &[Vec<f32>] {
        &self.chunks
    }

    /// Total number of samples
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    /// Sample rate of the audio
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Speech onset
    #[must_use]
    pub const fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Silence confirmation
    #[must_use]
    pub const fn ended_at(&self) -> Instant {
        self.ended_at
    }

    /// Wall time between onset and seal
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.ended_at.saturating_duration_since(self.started_at)
    }

    /// Concatenate chunks into one segment
    #[must_use]
    pub fn samples(&self) -> Vec<f32> {
        self.chunks.concat()
    }

    /// Encode as 16-bit PCM WAV for STT APIs
    ///
    /// # Errors
    ///
    /// Returns error if WAV encoding fails
    pub fn to_wav(&self) -> Result<Vec<u8>> {
        samples_to_wav(&self.samples(), self.sample_rate)
    }
}

#[derive(Debug)]
enum RecorderState {
    Idle,
    Buffering { speech_started_at: Option<Instant> },
}

/// Buffers audio for one utterance at a time
#[derive(Debug)]
pub struct UtteranceRecorder {
    state: RecorderState,
    chunks: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl UtteranceRecorder {
    /// Create an idle recorder
    #[must_use]
    pub const fn new(sample_rate: u32) -> Self {
        Self {
            state: RecorderState::Idle,
            chunks: Vec::new(),
            sample_rate,
        }
    }

    /// Begin buffering; a no-op if already recording
    pub fn start(&mut self) {
        if matches!(self.state, RecorderState::Idle) {
            self.chunks.clear();
            self.state = RecorderState::Buffering {
                speech_started_at: None,
            };
            tracing::trace!("recorder started");
        }
    }

    /// Speech confirmed; retain chunks from now on
    pub fn mark_speech_started(&mut self, now: Instant) {
        self.start();
        if let RecorderState::Buffering { speech_started_at } = &mut self.state
            && speech_started_at.is_none()
        {
            *speech_started_at = Some(now);
        }
    }

    /// Offer captured audio; dropped unless speech has started
    pub fn push(&mut self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        if let RecorderState::Buffering {
            speech_started_at: Some(_),
        } = self.state
        {
            self.chunks.push(samples.to_vec());
        }
    }

    /// Stop buffering and emit the utterance
    ///
    /// With `continue_listening` the recorder immediately restarts for the
    /// next utterance; without it the buffer is discarded and the recorder
    /// goes idle.
    pub fn seal(&mut self, now: Instant, continue_listening: bool) -> Option<Utterance> {
        let state = std::mem::replace(&mut self.state, RecorderState::Idle);
        let chunks = std::mem::take(&mut self.chunks);

        if !continue_listening {
            tracing::trace!(discarded = chunks.len(), "recorder stopped");
            return None;
        }

        let utterance = match state {
            RecorderState::Buffering {
                speech_started_at: Some(started_at),
            } if !chunks.is_empty() => Some(Utterance {
                chunks,
                sample_rate: self.sample_rate,
                started_at,
                ended_at: now,
            }),
            _ => None,
        };

        self.start();
        utterance
    }

    /// Whether the recorder is buffering
    #[must_use]
    pub const fn is_recording(&self) -> bool {
        matches!(self.state, RecorderState::Buffering { .. })
    }

    /// Whether audio is currently being retained
    #[must_use]
    pub const fn is_retaining(&self) -> bool {
        matches!(
            self.state,
            RecorderState::Buffering {
                speech_started_at: Some(_)
            }
        )
    }
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
