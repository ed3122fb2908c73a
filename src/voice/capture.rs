//! Audio capture from microphone

use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, StreamConfig};

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Source of microphone streams
pub trait MediaDevices: Send + Sync {
    /// Acquire the microphone
    ///
    /// # Errors
    ///
    /// Returns `Error::MediaAccess` if permission is denied or no device exists
    fn open_microphone(&self) -> Result<Box<dyn CaptureStream>>;
}

/// A live, singly-owned input stream
pub trait CaptureStream: Send {
    /// Drain samples captured since the last call
    fn take_samples(&mut self) -> Vec<f32>;

    /// Sample rate of the captured audio
    fn sample_rate(&self) -> u32;

    /// Stop capturing and release the device
    fn stop(&mut self);
}

/// Auxiliary media stream (camera, screen share) owned by a session
pub trait MediaStream: Send {
    /// Release the stream
    fn stop(&mut self);
}

/// Default host devices via cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

impl MediaDevices for CpalDevices {
    fn open_microphone(&self) -> Result<Box<dyn CaptureStream>> {
        Ok(Box::new(AudioCapture::open()?))
    }
}

/// Captures audio from the default input device
///
/// cpal streams are not `Send` on every platform, so the stream lives on a
/// dedicated thread and only the sample buffer is shared.
pub struct AudioCapture {
    buffer: Arc<Mutex<Vec<f32>>>,
    sample_rate: u32,
    shutdown: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl AudioCapture {
    /// Open the default input device and start capturing
    ///
    /// # Errors
    ///
    /// Returns `Error::MediaAccess` if the device cannot be opened
    pub fn open() -> Result<Self> {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<u32>>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let thread_buffer = Arc::clone(&buffer);
        let worker = std::thread::Builder::new()
            .name("voxline-capture".to_string())
            .spawn(move || {
                let (stream, rate) = match build_input_stream(thread_buffer) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(rate));

                // Blocks until stop() or the handle is dropped
                let _ = shutdown_rx.recv();
                drop(stream);
                tracing::debug!("audio capture stopped");
            })
            .map_err(|e| Error::MediaAccess(format!("failed to spawn capture thread: {e}")))?;

        let sample_rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                return Err(Error::MediaAccess(
                    "capture thread exited before the stream opened".to_string(),
                ));
            }
        };

        Ok(Self {
            buffer,
            sample_rate,
            shutdown: Some(shutdown_tx),
            worker: Some(worker),
        })
    }

    /// Check if currently capturing
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.shutdown.is_some()
    }
}

impl CaptureStream for AudioCapture {
    fn take_samples(&mut self) -> Vec<f32> {
        let mut buf = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *buf)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::warn!("capture thread panicked");
        }
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build and start the input stream on the calling thread
fn build_input_stream(buffer: Arc<Mutex<Vec<f32>>>) -> Result<(Stream, u32)> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::MediaAccess("no input device available".to_string()))?;

    let supported = device
        .supported_input_configs()
        .map_err(|e| Error::MediaAccess(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.sample_format() == SampleFormat::F32
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        })
        .map(|c| c.with_sample_rate(SampleRate(SAMPLE_RATE)));

    // Fallback: device default, downmixed to mono
    let supported = match supported {
        Some(c) => c,
        None => device
            .default_input_config()
            .map_err(|e| Error::MediaAccess(e.to_string()))?,
    };

    if supported.sample_format() != SampleFormat::F32 {
        return Err(Error::MediaAccess(format!(
            "unsupported input sample format: {:?}",
            supported.sample_format()
        )));
    }

    let config: StreamConfig = supported.config();
    let channels = usize::from(config.channels.max(1));
    let rate = config.sample_rate.0;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = rate,
        channels,
        "audio capture initialized"
    );

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mut buf = buffer.lock().unwrap_or_else(PoisonError::into_inner);
                if channels == 1 {
                    buf.extend_from_slice(data);
                } else {
                    #[allow(clippy::cast_precision_loss)]
                    buf.extend(
                        data.chunks(channels)
                            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
                    );
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::MediaAccess(e.to_string()))?;

    stream
        .play()
        .map_err(|e| Error::MediaAccess(e.to_string()))?;

    tracing::debug!("audio capture started");
    Ok((stream, rate))
}
