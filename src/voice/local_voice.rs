//! On-device speech fallback
//!
//! Used when no synthesis backend is configured, or when synthesis of a
//! fragment failed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::LocalVoiceConfig;
use crate::{Error, Result};

/// Programs tried in order when none is configured
const CANDIDATES: &[&str] = &["espeak-ng", "espeak", "say"];

/// Base speaking rate in words per minute
const BASE_WPM: f32 = 175.0;

/// Local, uncached voice output
#[async_trait]
pub trait LocalVoice: Send + Sync {
    /// Speak `text` to completion
    ///
    /// # Errors
    ///
    /// Returns `Error::StreamAborted` if stopped, `Error::Unsupported` if no
    /// local voice exists
    async fn speak(&self, text: &str, rate: f32) -> Result<()>;

    /// Stop any in-flight utterance
    fn stop(&self);
}

/// Speaks through a system speech program
pub struct CommandLocalVoice {
    program: Option<PathBuf>,
    current: Mutex<Option<(u64, CancellationToken)>>,
    next_id: AtomicU64,
}

impl CommandLocalVoice {
    /// Resolve the speech program from configuration or `PATH`
    #[must_use]
    pub fn from_config(config: &LocalVoiceConfig) -> Self {
        let program = config.program.as_ref().map_or_else(
            || CANDIDATES.iter().find_map(|name| which::which(name).ok()),
            |p| Some(PathBuf::from(p)),
        );

        if let Some(path) = &program {
            tracing::debug!(program = %path.display(), "local voice available");
        } else {
            tracing::debug!("no local voice program found");
        }

        Self {
            program,
            current: Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    /// Whether a speech program was found
    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.program.is_some()
    }

    fn command(program: &PathBuf, text: &str, rate: f32) -> Command {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let wpm = (BASE_WPM * rate.clamp(0.25, 4.0)).round() as u32;

        let mut cmd = Command::new(program);
        cmd.arg("-r").arg(wpm.to_string());
        if !program.ends_with("say") {
            // espeak: read text from argv, don't print phonemes
            cmd.arg("-q").arg("--");
        }
        cmd.arg(text).kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl LocalVoice for CommandLocalVoice {
    async fn speak(&self, text: &str, rate: f32) -> Result<()> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| Error::Unsupported("no local voice program available".to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        if let Some((_, previous)) = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace((id, token.clone()))
        {
            previous.cancel();
        }

        let mut child = Self::command(program, text, rate)
            .spawn()
            .map_err(|e| Error::Audio(format!("failed to start local voice: {e}")))?;

        let result = tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(Error::Audio(format!("local voice exited with {status}"))),
                Err(e) => Err(Error::Io(e)),
            },
            () = token.cancelled() => {
                let _ = child.kill().await;
                Err(Error::StreamAborted)
            }
        };

        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|(current_id, _)| *current_id == id) {
            *current = None;
        }
        drop(current);

        result
    }

    fn stop(&self) {
        if let Some(token) = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.1.cancel();
            tracing::debug!("local voice stopped");
        }
    }
}

impl std::fmt::Debug for CommandLocalVoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandLocalVoice")
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}
