//! # Shardnet - Peer-to-Peer Communication Core
//!
//! Shardnet is the communication layer of a sharded chain node: it governs
//! which peers stay connected and moves signed messages between the
//! application and the gossip library.
//!
//! - **Peer-set governance**: live peers are classified into semantic buckets
//!   (intra/cross-shard validators and observers, seeders, unknown) and
//!   trimmed to configured capacities whenever a connection opens
//! - **Fan-out**: outbound broadcasts flow through named, bounded channels
//!   drained round-robin into one signing publish routine
//! - **Validation**: inbound messages are decoded, signature-checked against
//!   the originator's identity, bounded by a timestamp window and throttled
//!   before parallel dispatch to topic processors
//! - **Direct delivery**: a sequence-numbered unicast path with duplicate
//!   suppression, sharing the processor table with the broadcast path
//!
//! ## Architecture
//!
//! Every long-lived activity is a task owning a cancellation receiver;
//! `close()` on a component stops its tasks and is idempotent. State shared
//! between tasks sits behind RW-locks that are never held across calls into
//! external collaborators. The collaborators themselves (transport, gossip
//! library, shard registry, blacklist) are reached only through the traits in
//! [`protocols`].
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `config` | configuration tree and validation |
//! | `peer` | peer ids, shard classification, XOR-Hamming distances |
//! | `message` | wire envelope, canonical signed payload, bounded codec |
//! | `crypto` | secp256k1-over-SHA-256 signer and key ↔ id conversion |
//! | `protocols` | contracts to external collaborators |
//! | `sharding` | bucket classification and eviction lists |
//! | `monitor` | connection events, denial sweeps, reconnect throttling |
//! | `discovery` | kad bootstrap loops and seeder reconnection |
//! | `loadbalancer` | named outbound channels, round-robin consumer |
//! | `direct` | sequence-numbered unicast with de-dup |
//! | `handler` | topic table, signing, dispatch, blacklisting |
//! | `peers_on_channel` | cached per-topic peer lists |
//! | `watcher` | informational connection watchers |
//! | `timecache` / `throttler` / `rating` | shared small building blocks |

pub mod config;
pub mod crypto;
pub mod direct;
pub mod discovery;
pub mod handler;
pub mod loadbalancer;
pub mod message;
pub mod monitor;
pub mod peer;
pub mod peers_on_channel;
pub mod protocols;
pub mod rating;
pub mod sharding;
pub mod throttler;
pub mod timecache;
pub mod watcher;

pub use config::{
    ConnectionWatcherConfig, ConnectionWatcherKind, KadDhtConfig, KadDhtKind, P2pConfig,
    ResourceLimiterConfig, ShardingConfig, SharderKind,
};
pub use crypto::{P2pKeyConverter, P2pSigner, RegistryKeyConverter, SigningError};
pub use direct::DirectSender;
pub use discovery::{
    new_peer_discoverer, ContinuousKadDhtDiscoverer, DiscovererReconnecter, DiscoveryError,
    NilDiscoverer, OptimizedKadDhtDiscoverer, PeerDiscoverer,
};
pub use handler::{MessagesHandler, MessagesHandlerArgs, MessagesHandlerConfig};
pub use loadbalancer::OutgoingChannelLoadBalancer;
pub use message::{BroadcastMethod, Message, SendableData, TopicPayload};
pub use monitor::{ConnectionMonitor, ConnectionMonitorArgs};
pub use peer::{PeerDistance, PeerId, PeerInfo, PeerType};
pub use peers_on_channel::PeersOnChannel;
pub use protocols::{
    ConnectionsHost, DirectTransport, KadDhtHandler, MessageProcessor, PeerBlacklistHandler,
    PeerDenialEvaluator, PeerShardResolver, PreferredPeersHolder, Reconnecter, TopicPublisher,
};
pub use rating::PeersRatingHandler;
pub use sharding::{new_sharder, ListsSharder, ListsSharderArgs, NilListSharder, Sharder};
pub use throttler::NumMessagesThrottler;
pub use timecache::TimeCache;
pub use watcher::{new_connections_watcher, ConnectionsWatcher, PrintConnectionsWatcher};
