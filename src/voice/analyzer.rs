//! Per-frame amplitude and spectral activity analysis
//!
//! Mirrors an analyser node: a sliding window of the most recent samples is
//! reduced to a time-domain RMS and a windowed FFT whose bins are compared
//! against a decibel floor.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::config::VadConfig;

/// One analysis tick; not retained
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityFrame {
    /// Time-domain root-mean-square amplitude
    pub rms: f32,

    /// Any spectral bin above the active floor
    pub has_signal: bool,

    /// Loudest bin in dB (`-inf` for digital silence)
    pub peak_db: f32,

    /// Loudest bin scaled into `[0, 1]` between floor and ceiling
    pub intensity: f32,
}

impl ActivityFrame {
    /// Same frame with activity masked off
    #[must_use]
    pub const fn silenced(self) -> Self {
        Self {
            has_signal: false,
            intensity: 0.0,
            ..self
        }
    }
}

/// Decibel window used to classify a frame as active
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdPolicy {
    pub floor_db: f32,
    pub ceiling_db: f32,
}

impl ThresholdPolicy {
    /// Normal sensitivity
    #[must_use]
    pub const fn normal(config: &VadConfig) -> Self {
        Self {
            floor_db: config.floor_db,
            ceiling_db: config.ceiling_db,
        }
    }

    /// Effectively disabled; keeps the assistant's own audio from triggering
    #[must_use]
    pub const fn desensitized(config: &VadConfig) -> Self {
        Self {
            floor_db: config.desensitized_floor_db,
            ceiling_db: config.desensitized_ceiling_db,
        }
    }

    /// Pick the policy for the current playback state
    #[must_use]
    pub const fn select(
        config: &VadConfig,
        assistant_speaking: bool,
        voice_interruption: bool,
    ) -> Self {
        if assistant_speaking && !voice_interruption {
            Self::desensitized(config)
        } else {
            Self::normal(config)
        }
    }
}

/// Derives an [`ActivityFrame`] from the live input each tick
pub struct AudioFrameAnalyzer {
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    hann_window: Vec<f32>,
    window: Vec<f32>,
    scratch: Vec<Complex<f32>>,
    latest_rms: f32,
}

impl AudioFrameAnalyzer {
    /// Create an analyzer over a window of `fft_size` samples
    #[must_use]
    pub fn new(fft_size: usize) -> Self {
        let fft_size = fft_size.max(2);
        let fft = FftPlanner::new().plan_fft_forward(fft_size);

        #[allow(clippy::cast_precision_loss)]
        let hann_window = (0..fft_size)
            .map(|i| {
                0.5 * (1.0
                    - (2.0 * std::f32::consts::PI * i as f32 / (fft_size - 1) as f32).cos())
            })
            .collect();

        Self {
            fft_size,
            fft,
            hann_window,
            window: Vec::with_capacity(fft_size * 2),
            scratch: vec![Complex::new(0.0, 0.0); fft_size],
            latest_rms: 0.0,
        }
    }

    /// Feed newly captured samples and classify the current window
    pub fn analyze(&mut self, samples: &[f32], policy: ThresholdPolicy) -> ActivityFrame {
        self.window.extend_from_slice(samples);
        if self.window.len() > self.fft_size {
            let excess = self.window.len() - self.fft_size;
            self.window.drain(..excess);
        }

        let rms = calculate_rms(&self.window);
        self.latest_rms = rms;

        let peak_db = self.peak_db();
        let has_signal = peak_db > policy.floor_db;
        let span = (policy.ceiling_db - policy.floor_db).max(f32::EPSILON);
        let intensity = if has_signal {
            ((peak_db - policy.floor_db) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };

        ActivityFrame {
            rms,
            has_signal,
            peak_db,
            intensity,
        }
    }

    /// Latest RMS value, for UI animation
    #[must_use]
    pub const fn latest_rms(&self) -> f32 {
        self.latest_rms
    }

    /// Clear the sliding window
    pub fn reset(&mut self) {
        self.window.clear();
        self.latest_rms = 0.0;
    }

    /// Loudest spectral bin of the current window in dB
    #[allow(clippy::cast_precision_loss)]
    fn peak_db(&mut self) -> f32 {
        // Zero-pad at the front so the newest samples align with the window end
        let pad = self.fft_size - self.window.len();
        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = if i < pad { 0.0 } else { self.window[i - pad] };
            *slot = Complex::new(sample * self.hann_window[i], 0.0);
        }

        self.fft.process(&mut self.scratch);

        let norm = self.fft_size as f32;
        let peak = self.scratch[..self.fft_size / 2]
            .iter()
            .map(|c| c.norm() / norm)
            .fold(0.0f32, f32::max);

        if peak > 0.0 {
            20.0 * peak.log10()
        } else {
            f32::NEG_INFINITY
        }
    }
}

impl std::fmt::Debug for AudioFrameAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrameAnalyzer")
            .field("fft_size", &self.fft_size)
            .field("latest_rms", &self.latest_rms)
            .finish_non_exhaustive()
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
