//! # Configuration
//!
//! The configuration tree consumed by the component factories. Nothing here
//! opens sockets or spawns tasks: the structs are plain data, deserializable
//! from whatever format the embedding process loads, and validation happens
//! in the constructor of the component that consumes each section, so a bad
//! value is fatal at startup and never at runtime.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Smallest accepted target for the total connected peer count.
pub const MIN_ALLOWED_CONNECTED_PEERS_LIST_SHARDER: u32 = 5;

/// Smallest accepted per-bucket validator capacity.
pub const MIN_ALLOWED_VALIDATORS: u32 = 1;

/// Smallest accepted per-bucket observer capacity.
pub const MIN_ALLOWED_OBSERVERS: u32 = 1;

/// Connection slots always reserved for unclassified peers.
pub const MIN_UNKNOWN_PEERS: u32 = 1;

/// Smallest accepted discovery refresh interval.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Smallest accepted connections-watcher entry lifetime.
pub const MIN_TIME_TO_LIVE: Duration = Duration::from_secs(1);

/// Error raised when a configuration section fails validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration for {}: {}", self.field, self.reason)
    }
}

impl std::error::Error for ConfigError {}

/// Which sharder variant the factory instantiates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharderKind {
    /// Classifies peers into semantic buckets and trims per-bucket.
    ListsSharder,
    /// Shard agnostic, trims against a single list.
    OneListSharder,
    /// Never trims connections.
    NilListSharder,
}

/// Which kad discovery variant the factory instantiates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KadDhtKind {
    Legacy,
    Optimized,
}

/// Which connections watcher the factory instantiates.
/// `Empty` is the unset value and behaves as `Disabled`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionWatcherKind {
    Print,
    Disabled,
    Empty,
}

/// Peer-set governance capacities. The per-bucket maxima plus the reserved
/// unknown slot must fit inside `target_peer_count`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardingConfig {
    pub kind: SharderKind,
    pub target_peer_count: u32,
    pub max_intra_shard_validators: u32,
    pub max_cross_shard_validators: u32,
    pub max_intra_shard_observers: u32,
    pub max_cross_shard_observers: u32,
    pub max_seeders: u32,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            kind: SharderKind::ListsSharder,
            target_peer_count: 36,
            max_intra_shard_validators: 7,
            max_cross_shard_validators: 3,
            max_intra_shard_observers: 2,
            max_cross_shard_observers: 1,
            max_seeders: 2,
        }
    }
}

impl ShardingConfig {
    /// Peers the unknown bucket may hold after the classified buckets and the
    /// reserved slot are accounted for. Only meaningful on validated configs.
    pub fn max_unknown(&self) -> u32 {
        self.target_peer_count.saturating_sub(self.classified_total())
    }

    fn classified_total(&self) -> u32 {
        self.max_intra_shard_validators
            + self.max_cross_shard_validators
            + self.max_intra_shard_observers
            + self.max_cross_shard_observers
            + self.max_seeders
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_peer_count < MIN_ALLOWED_CONNECTED_PEERS_LIST_SHARDER {
            return Err(ConfigError::new(
                "Sharding.TargetPeerCount",
                format!("should be at least {MIN_ALLOWED_CONNECTED_PEERS_LIST_SHARDER}"),
            ));
        }
        if self.max_intra_shard_validators < MIN_ALLOWED_VALIDATORS {
            return Err(ConfigError::new(
                "Sharding.MaxIntraShardValidators",
                format!("should be at least {MIN_ALLOWED_VALIDATORS}"),
            ));
        }
        if self.max_cross_shard_validators < MIN_ALLOWED_VALIDATORS {
            return Err(ConfigError::new(
                "Sharding.MaxCrossShardValidators",
                format!("should be at least {MIN_ALLOWED_VALIDATORS}"),
            ));
        }
        if self.max_intra_shard_observers < MIN_ALLOWED_OBSERVERS {
            return Err(ConfigError::new(
                "Sharding.MaxIntraShardObservers",
                format!("should be at least {MIN_ALLOWED_OBSERVERS}"),
            ));
        }
        if self.max_cross_shard_observers < MIN_ALLOWED_OBSERVERS {
            return Err(ConfigError::new(
                "Sharding.MaxCrossShardObservers",
                format!("should be at least {MIN_ALLOWED_OBSERVERS}"),
            ));
        }
        if self.classified_total() + MIN_UNKNOWN_PEERS > self.target_peer_count {
            return Err(ConfigError::new(
                "Sharding.TargetPeerCount",
                format!(
                    "validators + observers + seeders + {MIN_UNKNOWN_PEERS} reserved unknown \
                     exceed the target of {}",
                    self.target_peer_count
                ),
            ));
        }

        Ok(())
    }
}

/// Kademlia discovery settings. Intervals are carried in whole seconds the way
/// the deployment tooling writes them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KadDhtConfig {
    pub enabled: bool,
    pub kind: KadDhtKind,
    pub refresh_interval_sec: u32,
    pub routing_table_refresh_interval_sec: u32,
    pub protocol_ids: Vec<String>,
    pub initial_peer_list: Vec<String>,
    pub bucket_size: u32,
}

impl Default for KadDhtConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: KadDhtKind::Optimized,
            refresh_interval_sec: 10,
            routing_table_refresh_interval_sec: 300,
            protocol_ids: Vec::new(),
            initial_peer_list: Vec::new(),
            bucket_size: 100,
        }
    }
}

impl KadDhtConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.refresh_interval_sec))
    }

    pub fn routing_table_refresh_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.routing_table_refresh_interval_sec))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.refresh_interval() < MIN_REFRESH_INTERVAL {
            return Err(ConfigError::new(
                "KadDht.RefreshIntervalInSec",
                "should be at least 1 second",
            ));
        }
        if self.routing_table_refresh_interval() < MIN_REFRESH_INTERVAL {
            return Err(ConfigError::new(
                "KadDht.RoutingTableRefreshIntervalInSec",
                "should be at least 1 second",
            ));
        }
        if self.protocol_ids.is_empty() {
            return Err(ConfigError::new(
                "KadDht.ProtocolIDs",
                "should not be empty when discovery is enabled",
            ));
        }

        Ok(())
    }
}

/// Connections watcher settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionWatcherConfig {
    pub kind: ConnectionWatcherKind,
    pub time_to_live: Duration,
}

impl Default for ConnectionWatcherConfig {
    fn default() -> Self {
        Self {
            kind: ConnectionWatcherKind::Empty,
            time_to_live: Duration::from_secs(600),
        }
    }
}

impl ConnectionWatcherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.time_to_live < MIN_TIME_TO_LIVE {
            return Err(ConfigError::new(
                "ConnectionWatcher.TimeToLive",
                format!("should be at least {MIN_TIME_TO_LIVE:?}"),
            ));
        }

        Ok(())
    }
}

/// Transport resource ceilings. Resolved once at startup into concrete limits
/// handed to the transport layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ResourceLimiterConfig {
    /// Scale with the machine: a fraction of total memory, OS fd limit.
    DefaultAutoscale,
    /// No limits; only for throwaway test processes.
    Infinite,
    /// Explicit ceilings.
    DefaultWithScale { memory_mb: u32, max_fd: u32 },
}

impl Default for ResourceLimiterConfig {
    fn default() -> Self {
        ResourceLimiterConfig::DefaultAutoscale
    }
}

/// Concrete ceilings resolved from a [`ResourceLimiterConfig`].
/// `None` means unbounded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: Option<u64>,
    pub max_fd: Option<u32>,
}

impl ResourceLimiterConfig {
    pub fn resolve(&self) -> Result<ResourceLimits, ConfigError> {
        match self {
            ResourceLimiterConfig::DefaultAutoscale => Ok(ResourceLimits {
                memory_bytes: None,
                max_fd: None,
            }),
            ResourceLimiterConfig::Infinite => Ok(ResourceLimits {
                memory_bytes: None,
                max_fd: None,
            }),
            ResourceLimiterConfig::DefaultWithScale { memory_mb, max_fd } => {
                if *memory_mb == 0 {
                    return Err(ConfigError::new(
                        "ResourceLimiter.MemoryMB",
                        "should not be zero when scaling explicitly",
                    ));
                }
                if *max_fd == 0 {
                    return Err(ConfigError::new(
                        "ResourceLimiter.MaxFD",
                        "should not be zero when scaling explicitly",
                    ));
                }
                Ok(ResourceLimits {
                    memory_bytes: Some(u64::from(*memory_mb) * 1024 * 1024),
                    max_fd: Some(*max_fd),
                })
            }
        }
    }
}

/// Root of the peer-to-peer configuration tree.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct P2pConfig {
    pub sharding: ShardingConfig,
    pub kad_dht: KadDhtConfig,
    pub connection_watcher: ConnectionWatcherConfig,
    pub resource_limiter: ResourceLimiterConfig,
}
