//! Cached per-topic peer lists. Fetching the peers subscribed to a topic is
//! comparatively expensive on the host library, so results are cached per
//! topic, refreshed only when a read finds them stale, and evicted entirely
//! by a background loop once nobody has asked for a topic in a while.
//! Returned lists are ordered best-rated peer first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tokio::sync::watch;
use tracing::trace;

use crate::peer::PeerId;
use crate::rating::PeersRatingHandler;

/// Synchronous lookup of the peers currently subscribed to a topic.
pub type FetchPeersHandler = Box<dyn Fn(&str) -> Vec<PeerId> + Send + Sync>;

struct CachedPeers {
    peers: Vec<PeerId>,
    last_updated: Instant,
}

struct PeersOnChannelInner {
    fetch: FetchPeersHandler,
    rating: Arc<PeersRatingHandler>,
    refresh_interval: Duration,
    ttl_interval: Duration,
    cache: RwLock<HashMap<String, CachedPeers>>,
    loop_stopped: AtomicBool,
}

impl PeersOnChannelInner {
    fn evict_expired(&self) {
        let now = Instant::now();
        let mut cache = self.cache.write().expect("peers cache lock poisoned");
        let before = cache.len();
        cache.retain(|_, entry| now.duration_since(entry.last_updated) <= self.ttl_interval);

        let removed = before - cache.len();
        if removed > 0 {
            trace!(removed, "evicted idle topic peer lists");
        }
    }
}

/// Per-topic peer list cache with TTL refresh.
pub struct PeersOnChannel {
    inner: Arc<PeersOnChannelInner>,
    cancel: watch::Sender<bool>,
}

impl PeersOnChannel {
    pub fn new(
        fetch: FetchPeersHandler,
        rating: Arc<PeersRatingHandler>,
        refresh_interval: Duration,
        ttl_interval: Duration,
    ) -> Result<Self> {
        if refresh_interval.is_zero() {
            bail!("refresh interval should be positive");
        }
        if ttl_interval < refresh_interval {
            bail!("ttl interval should not be shorter than the refresh interval");
        }

        let inner = Arc::new(PeersOnChannelInner {
            fetch,
            rating,
            refresh_interval,
            ttl_interval,
            cache: RwLock::new(HashMap::new()),
            loop_stopped: AtomicBool::new(false),
        });
        let (cancel, mut cancel_rx) = watch::channel(false);

        let sweeper = inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.ttl_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => sweeper.evict_expired(),
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            sweeper.loop_stopped.store(true, Ordering::SeqCst);
        });

        Ok(Self { inner, cancel })
    }

    /// The peers on `topic`, best-rated first. Refreshes through the fetch
    /// function when the cached list is older than the refresh interval; the
    /// fetch runs with the cache lock released.
    pub fn get_peers(&self, topic: &str) -> Vec<PeerId> {
        {
            let cache = self.inner.cache.read().expect("peers cache lock poisoned");
            if let Some(entry) = cache.get(topic) {
                if entry.last_updated.elapsed() <= self.inner.refresh_interval {
                    return entry.peers.clone();
                }
            }
        }

        let fetched = (self.inner.fetch)(topic);
        let sorted = self.inner.rating.top_rated_sort(&fetched);

        let mut cache = self.inner.cache.write().expect("peers cache lock poisoned");
        cache.insert(
            topic.to_string(),
            CachedPeers {
                peers: sorted.clone(),
                last_updated: Instant::now(),
            },
        );

        sorted
    }

    /// Stop the eviction loop. Idempotent.
    pub fn close(&self) {
        let _ = self.cancel.send(true);
    }

    /// True once the eviction loop has exited. Exposed for shutdown tests.
    pub fn loop_stopped(&self) -> bool {
        self.inner.loop_stopped.load(Ordering::SeqCst)
    }
}
