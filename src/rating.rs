//! Peer quality rating. Responses and timeouts nudge a bounded per-peer score
//! up or down; the score only influences ordering (who we ask first), never
//! connectivity, so a mis-rated peer costs latency rather than reachability.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use tracing::trace;

use crate::peer::PeerId;

/// Score added on a timely, well-formed response.
pub const INCREASE_FACTOR: i32 = 2;

/// Score subtracted on a timeout or malformed response.
pub const DECREASE_FACTOR: i32 = 1;

/// Score floor.
pub const MIN_RATING: i32 = -100;

/// Score ceiling.
pub const MAX_RATING: i32 = 100;

/// Default number of peers the rating cache remembers.
pub const DEFAULT_RATED_PEERS_CAP: usize = 1000;

/// LRU-bounded peer scores. Unrated peers score 0.
pub struct PeersRatingHandler {
    ratings: Mutex<LruCache<PeerId, i32>>,
}

impl PeersRatingHandler {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero");
        Self {
            ratings: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn increase_rating(&self, pid: &PeerId) {
        self.bump(pid, INCREASE_FACTOR);
    }

    pub fn decrease_rating(&self, pid: &PeerId) {
        self.bump(pid, -DECREASE_FACTOR);
    }

    fn bump(&self, pid: &PeerId, delta: i32) {
        let mut ratings = self.ratings.lock().expect("ratings lock poisoned");
        let current = ratings.get(pid).copied().unwrap_or(0);
        let updated = (current + delta).clamp(MIN_RATING, MAX_RATING);
        ratings.put(pid.clone(), updated);

        trace!(peer = %pid, rating = updated, "peer rating updated");
    }

    pub fn rating(&self, pid: &PeerId) -> i32 {
        let mut ratings = self.ratings.lock().expect("ratings lock poisoned");
        ratings.get(pid).copied().unwrap_or(0)
    }

    /// The provided peers reordered best-rated first; ties break on id bytes
    /// so the ordering is stable across calls.
    pub fn top_rated_sort(&self, peers: &[PeerId]) -> Vec<PeerId> {
        let mut scored: Vec<(i32, PeerId)> = peers
            .iter()
            .map(|pid| (self.rating(pid), pid.clone()))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        scored.into_iter().map(|(_, pid)| pid).collect()
    }
}

impl Default for PeersRatingHandler {
    fn default() -> Self {
        Self::new(DEFAULT_RATED_PEERS_CAP)
    }
}
