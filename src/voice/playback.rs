//! Audio playback to speakers

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use rubato::{FftFixedIn, Resampler};

use super::tts::SynthesizedAudio;
use crate::{Error, Result};

/// Sample rate for playback (matches common TTS output)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Output device for synthesized speech
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play audio to completion
    ///
    /// # Errors
    ///
    /// Returns `Error::StreamAborted` if stopped mid-playback, or an audio
    /// error if decoding or the device fails
    async fn play(&self, audio: &SynthesizedAudio) -> Result<()>;

    /// Silence and release the output immediately
    fn stop(&self);
}

/// Stop bookkeeping shared by `play` and `stop`
///
/// `stop` bumps the generation, so a playback that captured an older
/// generation before decoding never reaches the device.
#[derive(Debug, Default)]
struct StopControl {
    generation: u64,
    current: Option<Arc<AtomicBool>>,
}

impl StopControl {
    /// Register a new playback started under `generation`
    fn begin(&mut self, generation: u64) -> Result<Arc<AtomicBool>> {
        if generation != self.generation {
            return Err(Error::StreamAborted);
        }

        let stop = Arc::new(AtomicBool::new(false));
        if let Some(previous) = self.current.replace(Arc::clone(&stop)) {
            previous.store(true, Ordering::SeqCst);
        }
        Ok(stop)
    }

    /// Stop the current playback and invalidate any not yet begun
    fn stop(&mut self) -> bool {
        self.generation = self.generation.wrapping_add(1);
        self.current.take().is_some_and(|stop| {
            stop.store(true, Ordering::SeqCst);
            true
        })
    }

    fn finish(&mut self, stop: &Arc<AtomicBool>) {
        if self.current.as_ref().is_some_and(|c| Arc::ptr_eq(c, stop)) {
            self.current = None;
        }
    }
}

/// Plays audio to the default output device
pub struct AudioPlayback {
    config: StreamConfig,
    control: Mutex<StopControl>,
}

impl AudioPlayback {
    /// Create a new audio playback instance
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
            })
            .or_else(|| {
                // Fallback: try stereo
                device.supported_output_configs().ok()?.find(|c| {
                    c.channels() == 2
                        && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                        && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
                })
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = PLAYBACK_SAMPLE_RATE,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self {
            config,
            control: Mutex::new(StopControl::default()),
        })
    }

    /// Play mono f32 samples at the playback sample rate
    ///
    /// # Errors
    ///
    /// Returns error if playback fails or is stopped
    pub async fn play_samples(&self, samples: Vec<f32>) -> Result<()> {
        let generation = self.control().generation;
        self.play_from(generation, samples).await
    }

    async fn play_from(&self, generation: u64, samples: Vec<f32>) -> Result<()> {
        let stop = self.control().begin(generation)?;

        let config = self.config.clone();
        let thread_stop = Arc::clone(&stop);
        let result = tokio::task::spawn_blocking(move || {
            play_samples_blocking(&config, samples, &thread_stop)
        })
        .await
        .map_err(|e| Error::Audio(format!("playback task failed: {e}")));

        self.control().finish(&stop);
        result?
    }

    fn control(&self) -> MutexGuard<'_, StopControl> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AudioSink for AudioPlayback {
    async fn play(&self, audio: &SynthesizedAudio) -> Result<()> {
        // Captured before decoding so a stop issued meanwhile still applies
        let generation = self.control().generation;
        let (samples, rate) = decode_mp3(&audio.data)?;
        let samples = resample(&samples, rate, PLAYBACK_SAMPLE_RATE)?;
        self.play_from(generation, samples).await
    }

    fn stop(&self) {
        if self.control().stop() {
            tracing::debug!("playback stopped");
        }
    }
}

impl std::fmt::Debug for AudioPlayback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioPlayback")
            .field("channels", &self.config.channels)
            .finish_non_exhaustive()
    }
}

/// Play samples in a blocking manner
///
/// The output callback emits silence as soon as `stop` is set.
fn play_samples_blocking(
    config: &StreamConfig,
    samples: Vec<f32>,
    stop: &Arc<AtomicBool>,
) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device".to_string()))?;

    let channels = usize::from(config.channels);
    let sample_count = samples.len();
    let samples = Arc::new(samples);
    let position = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicBool::new(false));

    let stream = {
        let samples = Arc::clone(&samples);
        let position = Arc::clone(&position);
        let finished = Arc::clone(&finished);
        let stop = Arc::clone(stop);
        device
            .build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let halted = stop.load(Ordering::Relaxed);
                    let mut pos = position.load(Ordering::Relaxed);

                    for frame in data.chunks_mut(channels) {
                        let sample = if !halted && pos < samples.len() {
                            pos += 1;
                            samples[pos - 1]
                        } else {
                            finished.store(true, Ordering::Relaxed);
                            0.0
                        };

                        for out in frame.iter_mut() {
                            *out = sample;
                        }
                    }

                    position.store(pos, Ordering::Relaxed);
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?
    };

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    let duration_ms = (sample_count as u64 * 1000) / u64::from(PLAYBACK_SAMPLE_RATE);

    // Poll for completion with timeout
    let start = Instant::now();
    let timeout = Duration::from_millis(duration_ms + 500);

    while !finished.load(Ordering::Relaxed) && !stop.load(Ordering::Relaxed) {
        if start.elapsed() > timeout {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    if stop.load(Ordering::Relaxed) {
        drop(stream);
        tracing::debug!(
            played = position.load(Ordering::Relaxed),
            samples = sample_count,
            "playback aborted"
        );
        return Err(Error::StreamAborted);
    }

    // Small delay to ensure audio finishes
    std::thread::sleep(Duration::from_millis(100));

    drop(stream);
    tracing::debug!(samples = sample_count, "playback complete");

    Ok(())
}

/// Decode MP3 bytes to mono f32 samples and their sample rate
///
/// # Errors
///
/// Returns error if the data is not valid MP3
pub fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = PLAYBACK_SAMPLE_RATE;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(PLAYBACK_SAMPLE_RATE);

                // Convert i16 samples to f32 and handle stereo to mono
                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok((samples, sample_rate))
}

/// Resample audio with rubato
///
/// Compensates for the resampler's filter delay so the output lines up with
/// the input and has the expected length.
///
/// # Errors
///
/// Returns `Error::Audio` if the resampler rejects the rates
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    const CHUNK: usize = 1024;

    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = FftFixedIn::<f64>::new(from as usize, to as usize, CHUNK, 2, 1)
        .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;
    let delay = resampler.output_delay();
    let expected = (samples.len() as f64 * f64::from(to) / f64::from(from)).round() as usize;

    let input: Vec<f64> = samples.iter().map(|&s| f64::from(s)).collect();
    let mut output = Vec::with_capacity(expected + delay + CHUNK);
    let mut chunks = input.chunks(CHUNK);

    while output.len() < expected + delay {
        // Zero-pad the tail and flush the filter
        let mut block = chunks.next().map_or_else(Vec::new, <[f64]>::to_vec);
        block.resize(CHUNK, 0.0);
        let result = resampler
            .process(&[block], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend(result[0].iter().map(|&s| s as f32));
    }

    Ok(output.into_iter().skip(delay).take(expected).collect())
}
