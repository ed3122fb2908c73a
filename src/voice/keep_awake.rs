//! Screen keep-awake lock
//!
//! Held for the lifetime of an active session. Acquisition is best effort:
//! platforms without an inhibitor report `Error::Unsupported`.

#[cfg_attr(
    not(any(target_os = "macos", target_os = "linux")),
    allow(unused_imports)
)]
use std::process::{Child, Command, Stdio};

use crate::{Error, Result};

/// Platform keep-awake facility
pub trait KeepAwake: Send + Sync {
    /// Acquire a lock that keeps the display awake until released
    ///
    /// # Errors
    ///
    /// Returns `Error::Unsupported` if the platform has no inhibitor
    fn acquire(&self) -> Result<WakeLock>;
}

/// A held keep-awake lock; released on `release()` or drop
pub struct WakeLock {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl WakeLock {
    /// Wrap a release action
    #[must_use]
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Release the lock; idempotent
    pub fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            tracing::debug!("wake lock released");
        }
    }

    /// Whether the lock is still held
    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.release.is_some()
    }
}

impl Drop for WakeLock {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for WakeLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeLock")
            .field("held", &self.is_held())
            .finish()
    }
}

/// Keeps the system awake with `systemd-inhibit` or `caffeinate`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemKeepAwake;

impl KeepAwake for SystemKeepAwake {
    fn acquire(&self) -> Result<WakeLock> {
        let child = spawn_inhibitor()?;
        tracing::debug!(pid = child.id(), "wake lock acquired");
        Ok(wake_lock_for(child))
    }
}

fn wake_lock_for(mut child: Child) -> WakeLock {
    WakeLock::new(move || {
        if let Err(e) = child.kill() {
            tracing::debug!(error = %e, "inhibitor already exited");
        }
        let _ = child.wait();
    })
}

#[cfg(target_os = "linux")]
fn spawn_inhibitor() -> Result<Child> {
    let program = which::which("systemd-inhibit")
        .map_err(|_| Error::Unsupported("systemd-inhibit not found".to_string()))?;

    Command::new(program)
        .args([
            "--what=idle:sleep",
            "--who=voxline",
            "--why=voice session active",
            "--mode=block",
            "sleep",
            "infinity",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| Error::Unsupported(format!("failed to start systemd-inhibit: {e}")))
}

#[cfg(target_os = "macos")]
fn spawn_inhibitor() -> Result<Child> {
    Command::new("caffeinate")
        .args(["-d", "-i"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| Error::Unsupported(format!("failed to start caffeinate: {e}")))
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn spawn_inhibitor() -> Result<Child> {
    Err(Error::Unsupported(
        "keep-awake not supported on this platform".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_release_runs_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let mut lock = WakeLock::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(lock.is_held());
        lock.release();
        lock.release();
        assert!(!lock.is_held());
        drop(lock);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        drop(WakeLock::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
