//! Session speech cache
//!
//! Keyed by exact fragment text. Synthesis is fire-and-forget: `request`
//! spawns the call and returns immediately, the playback worker polls
//! `lookup`. In-flight requests are tracked outside the LRU so identical
//! text never triggers a second call and eviction only drops finished audio.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::voice::{SynthesizedAudio, Synthesizer};

/// A playable cache entry
#[derive(Debug, Clone)]
pub enum CacheEntry {
    /// Synthesized audio, shared between identical fragments
    Audio(Arc<SynthesizedAudio>),
    /// Speak through the local voice; nothing is stored
    LocalVoice,
}

/// Result of a cache lookup
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Ready(CacheEntry),
    Pending,
    Missing,
}

struct Slots {
    ready: LruCache<String, CacheEntry>,
    pending: HashSet<String>,
}

/// Bounded per-session cache of synthesized fragments
#[derive(Clone)]
pub struct SpeechCache {
    slots: Arc<Mutex<Slots>>,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    token: CancellationToken,
    handle: Handle,
}

impl SpeechCache {
    /// Create a cache whose syntheses are cancelled with `token`
    #[must_use]
    pub fn new(
        capacity: usize,
        synthesizer: Option<Arc<dyn Synthesizer>>,
        token: CancellationToken,
        handle: Handle,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            slots: Arc::new(Mutex::new(Slots {
                ready: LruCache::new(capacity),
                pending: HashSet::new(),
            })),
            synthesizer,
            token,
            handle,
        }
    }

    /// Whether a remote synthesis backend is configured
    #[must_use]
    pub const fn has_backend(&self) -> bool {
        self.synthesizer.is_some()
    }

    /// Ensure `text` is cached or being synthesized
    pub fn request(&self, text: &str, voice: &str, speed: f32) {
        let mut slots = self.lock();
        if slots.pending.contains(text) || slots.ready.contains(text) {
            return;
        }

        let Some(synthesizer) = self.synthesizer.clone() else {
            slots.ready.put(text.to_string(), CacheEntry::LocalVoice);
            return;
        };

        slots.pending.insert(text.to_string());
        drop(slots);

        let slots = Arc::clone(&self.slots);
        let token = self.token.clone();
        let text = text.to_string();
        let voice = voice.to_string();
        self.handle.spawn(async move {
            let result = tokio::select! {
                () = token.cancelled() => return,
                result = synthesizer.synthesize(&text, &voice, speed) => result,
            };

            let entry = match result {
                Ok(audio) => CacheEntry::Audio(Arc::new(audio)),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        chars = text.len(),
                        "synthesis failed; using local voice"
                    );
                    CacheEntry::LocalVoice
                }
            };

            if token.is_cancelled() {
                return;
            }
            let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.pending.remove(&text);
            slots.ready.put(text, entry);
        });
    }

    /// Look up `text`, marking it recently used
    #[must_use]
    pub fn lookup(&self, text: &str) -> CacheLookup {
        let mut slots = self.lock();
        if let Some(entry) = slots.ready.get(text) {
            return CacheLookup::Ready(entry.clone());
        }
        if slots.pending.contains(text) {
            CacheLookup::Pending
        } else {
            CacheLookup::Missing
        }
    }

    /// Number of entries, pending included
    #[must_use]
    pub fn len(&self) -> usize {
        let slots = self.lock();
        slots.ready.len() + slots.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut slots = self.lock();
        slots.ready.clear();
        slots.pending.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SpeechCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechCache")
            .field("len", &self.len())
            .field("has_backend", &self.has_backend())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::{Error, Result};

    struct CountingSynth {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Synthesizer for CountingSynth {
        async fn synthesize(
            &self,
            text: &str,
            _voice: &str,
            _speed: f32,
        ) -> Result<SynthesizedAudio> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                return Err(Error::Synthesis("backend down".to_string()));
            }
            Ok(SynthesizedAudio::mp3(text.as_bytes().to_vec()))
        }
    }

    fn cache_with(synth: &Arc<CountingSynth>, capacity: usize) -> SpeechCache {
        let synthesizer: Arc<dyn Synthesizer> = synth.clone();
        SpeechCache::new(
            capacity,
            Some(synthesizer),
            CancellationToken::new(),
            Handle::current(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_text_synthesized_once() {
        let synth = Arc::new(CountingSynth {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let cache = cache_with(&synth, 8);

        cache.request("Hello there.", "alloy", 1.0);
        cache.request("Hello there.", "alloy", 1.0);
        assert!(matches!(cache.lookup("Hello there."), CacheLookup::Pending));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cache.request("Hello there.", "alloy", 1.0);

        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
        match cache.lookup("Hello there.") {
            CacheLookup::Ready(CacheEntry::Audio(audio)) => {
                assert_eq!(audio.data, b"Hello there.");
            }
            other => panic!("unexpected lookup: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_falls_back_to_local_voice() {
        let synth = Arc::new(CountingSynth {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let cache = cache_with(&synth, 8);

        cache.request("Sorry.", "alloy", 1.0);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(
            cache.lookup("Sorry."),
            CacheLookup::Ready(CacheEntry::LocalVoice)
        ));
    }

    #[tokio::test]
    async fn test_no_backend_uses_local_voice() {
        let cache = SpeechCache::new(8, None, CancellationToken::new(), Handle::current());
        assert!(!cache.has_backend());

        cache.request("Hi.", "alloy", 1.0);
        assert!(matches!(
            cache.lookup("Hi."),
            CacheLookup::Ready(CacheEntry::LocalVoice)
        ));
        assert!(matches!(cache.lookup("Bye."), CacheLookup::Missing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_by_capacity() {
        let synth = Arc::new(CountingSynth {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let cache = cache_with(&synth, 2);

        cache.request("one", "alloy", 1.0);
        cache.request("two", "alloy", 1.0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        cache.request("three", "alloy", 1.0);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(cache.len(), 2);
        assert!(matches!(cache.lookup("one"), CacheLookup::Missing));
        assert!(matches!(cache.lookup("three"), CacheLookup::Ready(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_synthesis_is_not_stored() {
        let synth = Arc::new(CountingSynth {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let token = CancellationToken::new();
        let synthesizer: Arc<dyn Synthesizer> = synth.clone();
        let cache = SpeechCache::new(
            8,
            Some(synthesizer),
            token.clone(),
            Handle::current(),
        );

        cache.request("late", "alloy", 1.0);
        tokio::task::yield_now().await;
        token.cancel();
        cache.clear();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_entries_survive_eviction() {
        let synth = Arc::new(CountingSynth {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let cache = cache_with(&synth, 1);

        cache.request("first", "alloy", 1.0);
        cache.request("a", "alloy", 1.0);
        cache.request("b", "alloy", 1.0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(cache.lookup("first"), CacheLookup::Pending));

        // Still in flight; must not issue a second call
        cache.request("first", "alloy", 1.0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(synth.calls.load(Ordering::SeqCst), 3);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.len(), 1);
        assert_eq!(synth.calls.load(Ordering::SeqCst), 3);
    }
}
