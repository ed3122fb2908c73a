use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc, watch};
use tracing_subscriber::EnvFilter;

use voxline::Config;
use voxline::config::VoiceSettings;
use voxline::engine::{
    ChatClient, ChatStreamEvent, Collaborators, ResponseId, SessionEvent, SubmitOptions,
    VoiceSession,
};
use voxline::voice::{
    AudioCapture, AudioFrameAnalyzer, AudioPlayback, AudioSink, CaptureStream, CommandLocalVoice,
    LocalVoice, PLAYBACK_SAMPLE_RATE, Synthesizer, TextToSpeech, ThresholdPolicy,
};

/// Voxline - real-time voice conversations with an AI assistant
#[derive(Parser)]
#[command(name = "voxline", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Let the user talk over the assistant
    #[arg(long, global = true)]
    voice_interruption: bool,

    /// Source language hint for transcription (e.g. "en")
    #[arg(long, global = true)]
    language: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Start a voice conversation (default)
    Call,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// Print the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,voxline=info",
        1 => "info,voxline=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load();
    if cli.voice_interruption {
        config.settings.voice_interruption = true;
    }
    if let Some(language) = cli.language {
        config.settings.stt_language = Some(language);
    }

    match cli.command.unwrap_or(Command::Call) {
        Command::Call => call(config).await,
        Command::TestMic { duration } => test_mic(&config, duration).await,
        Command::TestSpeaker => test_speaker().await,
        Command::TestTts { text } => test_tts(&config, &text).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config.to_redacted_json())?);
            Ok(())
        }
    }
}

/// Run a voice conversation until `quit` or Ctrl-C
async fn call(config: Config) -> anyhow::Result<()> {
    let (chat_tx, mut chat_rx) = mpsc::unbounded_channel();
    let chat = Arc::new(EchoChat::new(chat_tx));
    let collaborators = Collaborators::system(&config, chat)?;

    let (_settings_tx, settings) = watch::channel(config.settings.clone());
    let session = VoiceSession::new(&config, collaborators, settings);
    let mut events = session.subscribe();

    session.open().await?;

    println!("Listening. Speak, then pause to send.");
    println!("Commands: tap (interrupt), quit\n");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            Some(event) = chat_rx.recv() => session.dispatch_chat_event(event),
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event display lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) => match line.trim() {
                    "tap" => {
                        if !session.tap_avatar() {
                            println!("(assistant is not speaking)");
                        }
                    }
                    "quit" | "q" => break,
                    "" => {}
                    other => println!("unknown command: {other}"),
                },
                None => stdin_open = false,
            },
            _ = &mut ctrl_c => break,
        }
    }

    println!("\nClosing session...");
    session.close().await;
    Ok(())
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::SpeechStarted => println!("[listening]"),
        SessionEvent::Transcribed(text) => println!("you: {text}"),
        SessionEvent::Notice(message) => println!("! {message}"),
        SessionEvent::AssistantSpeaking(true) => println!("[assistant speaking]"),
        SessionEvent::AssistantSpeaking(false) => println!("[assistant done]"),
        SessionEvent::Interrupted { reason, .. } => println!("[interrupted: {reason:?}]"),
        SessionEvent::StateChanged(_) | SessionEvent::UtteranceSealed { .. } => {}
    }
}

/// Demo chat pipeline that streams each prompt back, sentence by sentence
struct EchoChat {
    events: mpsc::UnboundedSender<ChatStreamEvent>,
    stopped: Arc<Mutex<HashSet<ResponseId>>>,
}

impl EchoChat {
    fn new(events: mpsc::UnboundedSender<ChatStreamEvent>) -> Self {
        Self {
            events,
            stopped: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

#[async_trait]
impl ChatClient for EchoChat {
    async fn submit(&self, text: &str, _options: SubmitOptions) -> voxline::Result<()> {
        let response_id = ResponseId::generate();
        let said = text.trim_end_matches(['.', '!', '?']);
        let reply = format!("You said: {said}. I'm only an echo, but I heard you.");
        let events = self.events.clone();
        let stopped = Arc::clone(&self.stopped);

        events
            .send(ChatStreamEvent::Start {
                response_id: response_id.clone(),
            })
            .map_err(|e| voxline::Error::Chat(e.to_string()))?;

        tokio::spawn(async move {
            for sentence in split_sentences(&reply) {
                tokio::time::sleep(Duration::from_millis(150)).await;
                if stopped
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .contains(&response_id)
                {
                    return;
                }
                let _ = events.send(ChatStreamEvent::Chunk {
                    response_id: response_id.clone(),
                    text: sentence,
                });
            }
            let _ = events.send(ChatStreamEvent::Finish { response_id });
        });

        Ok(())
    }

    fn stop_generation(&self, response_id: &ResponseId) {
        self.stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(response_id.clone());
    }
}

/// Split text after sentence-ending punctuation
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            let sentence = current.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            current.clear();
        }
    }
    let rest = current.trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }
    sentences
}

/// Print per-second levels from the frame analyzer
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::open()?;
    let mut analyzer = AudioFrameAnalyzer::new(config.vad.fft_size);
    let policy = ThresholdPolicy::normal(&config.vad);

    println!("Sample rate: {} Hz", capture.sample_rate());
    println!("---");

    let mut ticker =
        tokio::time::interval(config.vad.frame_interval().max(Duration::from_millis(1)));
    for second in 1..=duration {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let (mut frames, mut active) = (0u32, 0u32);
        let (mut peak_db, mut rms_sum) = (f32::NEG_INFINITY, 0.0f32);

        while tokio::time::Instant::now() < deadline {
            ticker.tick().await;
            let frame = analyzer.analyze(&capture.take_samples(), policy);
            frames += 1;
            rms_sum += frame.rms;
            peak_db = peak_db.max(frame.peak_db);
            if frame.has_signal {
                active += 1;
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let rms = rms_sum / frames.max(1) as f32;

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (rms * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{second:2}s] RMS: {rms:.4} | Peak: {peak_db:6.1} dB | Active: {active:3}/{frames} | [{meter}]"
        );
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("Active frames are those above {} dB.", config.vad.floor_db);

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let playback = AudioPlayback::new()?;

    let frequency = 440.0_f32;
    let num_samples = usize::try_from(PLAYBACK_SAMPLE_RATE * 2)?;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / PLAYBACK_SAMPLE_RATE as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    println!("Playing {} samples at {PLAYBACK_SAMPLE_RATE} Hz...", samples.len());

    playback.play_samples(samples).await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");

    Ok(())
}

/// Synthesize and play `text`, or speak it locally without a backend
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");
    let settings: &VoiceSettings = &config.settings;

    let Some(tts) = TextToSpeech::from_config(&config.tts) else {
        println!("No synthesis backend configured; using the local voice.");
        let voice = CommandLocalVoice::from_config(&config.local_voice);
        voice.speak(text, settings.playback_rate).await?;
        return Ok(());
    };

    println!("Synthesizing speech...");
    let audio = tts
        .synthesize(text, &settings.tts_voice, settings.playback_rate)
        .await?;
    println!("Got {} bytes of {}", audio.data.len(), audio.mime_type);

    println!("Playing audio...");
    AudioPlayback::new()?.play(&audio).await?;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}
