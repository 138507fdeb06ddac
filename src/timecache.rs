//! # Time Cache
//!
//! A set of string keys with per-entry expiry, used wherever the core needs
//! "have I seen this recently": direct-message de-duplication, the printed
//! connections rate limit, and sequence replay suppression.
//!
//! Entries expire after the configured span. A background sweep task drops
//! expired entries at an interval never longer than the span itself, so the
//! cache cannot hold an entry past twice its lifetime even if nobody reads it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::trace;

/// Longest pause between sweep passes; shorter spans sweep at the span.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

struct TimeCacheInner {
    span: Duration,
    /// Key → expiry instant.
    entries: RwLock<HashMap<String, Instant>>,
    sweeper_stopped: AtomicBool,
}

impl TimeCacheInner {
    fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().expect("time cache lock poisoned");
        let before = entries.len();
        entries.retain(|_, expiry| *expiry > now);

        let removed = before - entries.len();
        if removed > 0 {
            trace!(removed, remaining = entries.len(), "time cache sweep");
        }
    }
}

/// TTL-bounded set of recently seen keys. Construction spawns the sweep task,
/// so a cache must be created inside a runtime.
pub struct TimeCache {
    inner: Arc<TimeCacheInner>,
    cancel: watch::Sender<bool>,
}

impl TimeCache {
    pub fn new(span: Duration) -> Self {
        let inner = Arc::new(TimeCacheInner {
            span,
            entries: RwLock::new(HashMap::new()),
            sweeper_stopped: AtomicBool::new(false),
        });
        let (cancel, mut cancel_rx) = watch::channel(false);

        let sweeper = inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(span.min(DEFAULT_SWEEP_INTERVAL));
            loop {
                tokio::select! {
                    _ = ticker.tick() => sweeper.sweep(),
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            sweeper.sweeper_stopped.store(true, Ordering::SeqCst);
        });

        Self { inner, cancel }
    }

    /// Insert or refresh a key with the cache's default span.
    pub fn add(&self, key: &str) {
        self.upsert(key, self.inner.span);
    }

    /// Insert or refresh a key with an explicit span.
    pub fn upsert(&self, key: &str, span: Duration) {
        let mut entries = self
            .inner
            .entries
            .write()
            .expect("time cache lock poisoned");
        entries.insert(key.to_string(), Instant::now() + span);
    }

    /// True while the key is present and unexpired. Does not refresh.
    pub fn has(&self, key: &str) -> bool {
        let entries = self.inner.entries.read().expect("time cache lock poisoned");
        entries
            .get(key)
            .map(|expiry| *expiry > Instant::now())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner
            .entries
            .read()
            .expect("time cache lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn span(&self) -> Duration {
        self.inner.span
    }

    /// Stop the sweep task. Idempotent.
    pub fn close(&self) {
        let _ = self.cancel.send(true);
    }

    /// True once the sweep task has exited. Exposed for shutdown tests.
    pub fn sweeper_stopped(&self) -> bool {
        self.inner.sweeper_stopped.load(Ordering::SeqCst)
    }
}
