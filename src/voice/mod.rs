//! Voice processing module
//!
//! Device and service adapters for the conversation engine: microphone
//! capture, frame analysis, voice activity detection, utterance buffering,
//! STT/TTS endpoints, speaker output, and platform helpers.

mod analyzer;
mod capture;
mod keep_awake;
mod local_voice;
mod playback;
mod recorder;
mod stt;
mod tts;
mod vad;

pub use analyzer::{ActivityFrame, AudioFrameAnalyzer, ThresholdPolicy, calculate_rms};
pub use capture::{AudioCapture, CaptureStream, CpalDevices, MediaDevices, MediaStream, SAMPLE_RATE};
pub use keep_awake::{KeepAwake, SystemKeepAwake, WakeLock};
pub use local_voice::{CommandLocalVoice, LocalVoice};
pub use playback::{AudioPlayback, AudioSink, PLAYBACK_SAMPLE_RATE, decode_mp3, resample};
pub use recorder::{Utterance, UtteranceRecorder, samples_to_wav};
pub use stt::{SpeechToText, Transcriber};
pub use tts::{SynthesizedAudio, Synthesizer, TextToSpeech};
pub use vad::{VadEvent, VadState, VoiceActivityDetector};
