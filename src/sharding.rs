//! # Peer-Set Sharding
//!
//! The sharder decides which connections to drop whenever the peer set grows.
//! Peers are classified into six buckets (intra/cross-shard validators,
//! intra/cross-shard observers, seeders, unknown) and each bucket is trimmed
//! to its capacity, evicting the peers farthest from self on the Kademlia
//! XOR-Hamming metric.
//!
//! ## Capacity Carryover
//!
//! Unused capacity flows through the buckets in a fixed priority order:
//! intra-shard validators → cross-shard validators → intra-shard observers →
//! cross-shard observers → unknown. Seeders are strict: they neither receive
//! nor donate spare capacity, so a missing seeder never inflates another
//! bucket and a surplus of seeders is always trimmed.
//!
//! ## Variants
//!
//! | Variant | Behavior |
//! |---------|----------|
//! | [`ListsSharder`] | full bucket classification and trimming |
//! | [`OneListSharder`] | shard agnostic, one list capped at the target |
//! | [`NilListSharder`] | never trims |

use std::sync::{Arc, RwLock};

use anyhow::Result;

use crate::config::{ConfigError, SharderKind, ShardingConfig};
use crate::peer::{PeerDistance, PeerId, PeerType};
use crate::protocols::{PeerShardResolver, PreferredPeersHolder};

/// Smallest accepted target for the one-list variant.
pub const MIN_ALLOWED_CONNECTED_PEERS_ONE_LIST: usize = 3;

/// Computes eviction lists over the live peer set and answers seeder queries.
pub trait Sharder: Send + Sync {
    /// Peers that must be disconnected so the configured capacities hold.
    fn compute_eviction_list(&self, peers: &[PeerId]) -> Vec<PeerId>;

    /// True if `pid` appears in `list`.
    fn has(&self, pid: &PeerId, list: &[PeerId]) -> bool {
        list.iter().any(|p| p == pid)
    }

    /// True if the peer's pretty id appears in any configured seeder address.
    fn is_seeder(&self, pid: &PeerId) -> bool;

    /// Replace the seeder address list. Last write wins.
    fn set_seeders(&self, addresses: Vec<String>);

    /// Swap the shard resolver. Takes effect on the next classification.
    fn set_peer_shard_resolver(&self, resolver: Arc<dyn PeerShardResolver>);

    fn kind(&self) -> SharderKind;
}

/// Arguments for [`ListsSharder::new`].
pub struct ListsSharderArgs {
    pub config: ShardingConfig,
    pub self_pid: PeerId,
    pub resolver: Arc<dyn PeerShardResolver>,
    pub preferred_peers: Arc<dyn PreferredPeersHolder>,
}

/// The full bucket-classifying sharder.
pub struct ListsSharder {
    self_pid: PeerId,
    max_intra_shard_validators: usize,
    max_cross_shard_validators: usize,
    max_intra_shard_observers: usize,
    max_cross_shard_observers: usize,
    max_seeders: usize,
    max_unknown: usize,
    resolver: RwLock<Arc<dyn PeerShardResolver>>,
    seeders: RwLock<Vec<String>>,
    preferred_peers: Arc<dyn PreferredPeersHolder>,
}

#[derive(Default)]
struct BucketedPeers {
    intra_validators: Vec<PeerDistance>,
    cross_validators: Vec<PeerDistance>,
    intra_observers: Vec<PeerDistance>,
    cross_observers: Vec<PeerDistance>,
    seeders: Vec<PeerDistance>,
    unknown: Vec<PeerDistance>,
}

impl ListsSharder {
    pub fn new(args: ListsSharderArgs) -> Result<Self, ConfigError> {
        args.config.validate()?;

        Ok(Self {
            self_pid: args.self_pid,
            max_intra_shard_validators: args.config.max_intra_shard_validators as usize,
            max_cross_shard_validators: args.config.max_cross_shard_validators as usize,
            max_intra_shard_observers: args.config.max_intra_shard_observers as usize,
            max_cross_shard_observers: args.config.max_cross_shard_observers as usize,
            max_seeders: args.config.max_seeders as usize,
            max_unknown: args.config.max_unknown() as usize,
            resolver: RwLock::new(args.resolver),
            seeders: RwLock::new(Vec::new()),
            preferred_peers: args.preferred_peers,
        })
    }

    fn current_resolver(&self) -> Arc<dyn PeerShardResolver> {
        self.resolver.read().expect("resolver lock poisoned").clone()
    }

    /// Classify every peer into its bucket, skipping preferred peers entirely:
    /// they are never evicted so they never occupy a bucket slot.
    fn split_peers(&self, peers: &[PeerId]) -> BucketedPeers {
        // Snapshot the resolver so the lock is not held across its calls.
        let resolver = self.current_resolver();
        let self_info = resolver.peer_info(&self.self_pid);

        let mut grouped = BucketedPeers::default();
        for pid in peers {
            if self.preferred_peers.contains(pid) {
                continue;
            }

            let pd = PeerDistance::between(pid.clone(), &self.self_pid);
            if self.is_seeder(pid) {
                grouped.seeders.push(pd);
                continue;
            }

            let info = resolver.peer_info(pid);
            let is_cross = info.shard_id != self_info.shard_id;
            match (info.peer_type, is_cross) {
                (PeerType::Unknown, _) => grouped.unknown.push(pd),
                (PeerType::Validator, false) => grouped.intra_validators.push(pd),
                (PeerType::Validator, true) => grouped.cross_validators.push(pd),
                (PeerType::Observer, false) => grouped.intra_observers.push(pd),
                (PeerType::Observer, true) => grouped.cross_observers.push(pd),
            }
        }

        grouped
    }
}

/// Returns (used, spare) of a capacity: `used = min(existing, maximum)` and
/// whatever is left of `maximum` becomes spare for the next bucket.
fn used_and_spare(existing: usize, maximum: usize) -> (usize, usize) {
    if existing < maximum {
        (existing, maximum - existing)
    } else {
        (maximum, 0)
    }
}

/// Sort ascending by distance (ties on id bytes) and evict everything past
/// the first `keep` entries.
fn evict(mut distances: Vec<PeerDistance>, keep: usize) -> Vec<PeerId> {
    if keep >= distances.len() {
        return Vec::new();
    }

    distances.sort();
    distances.drain(keep..).map(|pd| pd.pid).collect()
}

impl Sharder for ListsSharder {
    fn compute_eviction_list(&self, peers: &[PeerId]) -> Vec<PeerId> {
        let grouped = self.split_peers(peers);

        let (num_intra_validators, spare) =
            used_and_spare(grouped.intra_validators.len(), self.max_intra_shard_validators);
        let (num_cross_validators, spare) = used_and_spare(
            grouped.cross_validators.len(),
            self.max_cross_shard_validators + spare,
        );
        let (num_intra_observers, spare) = used_and_spare(
            grouped.intra_observers.len(),
            self.max_intra_shard_observers + spare,
        );
        let (num_cross_observers, spare) = used_and_spare(
            grouped.cross_observers.len(),
            self.max_cross_shard_observers + spare,
        );
        // Seeders are strict: spare is neither consumed nor produced here.
        let (num_seeders, _) = used_and_spare(grouped.seeders.len(), self.max_seeders);
        let (num_unknown, _) = used_and_spare(grouped.unknown.len(), self.max_unknown + spare);

        let mut evicted = evict(grouped.intra_validators, num_intra_validators);
        evicted.extend(evict(grouped.cross_validators, num_cross_validators));
        evicted.extend(evict(grouped.intra_observers, num_intra_observers));
        evicted.extend(evict(grouped.cross_observers, num_cross_observers));
        evicted.extend(evict(grouped.seeders, num_seeders));
        evicted.extend(evict(grouped.unknown, num_unknown));

        evicted
    }

    fn is_seeder(&self, pid: &PeerId) -> bool {
        let pretty = pid.pretty();
        let seeders = self.seeders.read().expect("seeders lock poisoned");
        seeders.iter().any(|addr| addr.contains(&pretty))
    }

    fn set_seeders(&self, addresses: Vec<String>) {
        let mut seeders = self.seeders.write().expect("seeders lock poisoned");
        *seeders = addresses;
    }

    fn set_peer_shard_resolver(&self, resolver: Arc<dyn PeerShardResolver>) {
        let mut current = self.resolver.write().expect("resolver lock poisoned");
        *current = resolver;
    }

    fn kind(&self) -> SharderKind {
        SharderKind::ListsSharder
    }
}

/// Shard-agnostic sharder: one list, capped at the target peer count.
pub struct OneListSharder {
    self_pid: PeerId,
    max_peer_count: usize,
}

impl OneListSharder {
    pub fn new(self_pid: PeerId, max_peer_count: usize) -> Result<Self, ConfigError> {
        if max_peer_count < MIN_ALLOWED_CONNECTED_PEERS_ONE_LIST {
            return Err(ConfigError::new(
                "Sharding.TargetPeerCount",
                format!("should be at least {MIN_ALLOWED_CONNECTED_PEERS_ONE_LIST}"),
            ));
        }

        Ok(Self {
            self_pid,
            max_peer_count,
        })
    }
}

impl Sharder for OneListSharder {
    fn compute_eviction_list(&self, peers: &[PeerId]) -> Vec<PeerId> {
        let distances: Vec<PeerDistance> = peers
            .iter()
            .map(|pid| PeerDistance::between(pid.clone(), &self.self_pid))
            .collect();
        evict(distances, self.max_peer_count)
    }

    fn is_seeder(&self, _pid: &PeerId) -> bool {
        false
    }

    fn set_seeders(&self, _addresses: Vec<String>) {}

    fn set_peer_shard_resolver(&self, _resolver: Arc<dyn PeerShardResolver>) {}

    fn kind(&self) -> SharderKind {
        SharderKind::OneListSharder
    }
}

/// Sharder that never trims connections.
pub struct NilListSharder;

impl Sharder for NilListSharder {
    fn compute_eviction_list(&self, _peers: &[PeerId]) -> Vec<PeerId> {
        Vec::new()
    }

    fn is_seeder(&self, _pid: &PeerId) -> bool {
        false
    }

    fn set_seeders(&self, _addresses: Vec<String>) {}

    fn set_peer_shard_resolver(&self, _resolver: Arc<dyn PeerShardResolver>) {}

    fn kind(&self) -> SharderKind {
        SharderKind::NilListSharder
    }
}

/// Instantiate the sharder variant the configuration names.
pub fn new_sharder(args: ListsSharderArgs) -> Result<Arc<dyn Sharder>> {
    match args.config.kind {
        SharderKind::ListsSharder => Ok(Arc::new(ListsSharder::new(args)?)),
        SharderKind::OneListSharder => Ok(Arc::new(OneListSharder::new(
            args.self_pid,
            args.config.target_peer_count as usize,
        )?)),
        SharderKind::NilListSharder => Ok(Arc::new(NilListSharder)),
    }
}
