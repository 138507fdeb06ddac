//! Contracts to the external collaborators of the communication core.
//!
//! The gossip/Kademlia library, the transport, and the node's registries are
//! all external; this module pins down exactly what each one must provide.
//! Components depend only on these traits, never on each other's concrete
//! types, which also keeps every piece testable against in-memory stubs.
//!
//! ## Contracts
//!
//! | Trait | Provided by | Consumed by |
//! |-------|-------------|-------------|
//! | [`ConnectionsHost`] | transport / host library | monitor, discovery, sharder callers |
//! | [`TopicPublisher`] | gossip library | messages handler |
//! | [`DirectTransport`] | transport direct-stream layer | direct sender |
//! | [`KadDhtHandler`] | Kademlia library | optimized discoverer |
//! | [`PeerShardResolver`] | node's validator registry | sharder |
//! | [`PreferredPeersHolder`] | node configuration | sharder, monitor |
//! | [`PeerDenialEvaluator`] | blacklist cache | monitor |
//! | [`PeerBlacklistHandler`] | blacklist cache | messages handler |
//! | [`MessageProcessor`] | application subsystems | messages handler, direct sender |
//! | [`Reconnecter`] | discoverers | monitor |

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::message::Message;
use crate::peer::{PeerId, PeerInfo};

/// Non-owning handle over the live connection set.
///
/// The host library outlives every component holding this handle; components
/// never assume they can keep the network alive through it.
#[async_trait]
pub trait ConnectionsHost: Send + Sync {
    /// Currently connected peers, unordered.
    fn peers(&self) -> Vec<PeerId>;

    /// Close the connection to a peer. Closing an unknown peer is a no-op.
    async fn close_peer(&self, pid: &PeerId) -> Result<()>;

    /// Dial a multiaddress.
    async fn connect_to_peer(&self, address: &str) -> Result<()>;

    /// Connected peers subscribed to a topic, for the peers-on-channel cache.
    fn connected_peers_on_topic(&self, topic: &str) -> Vec<PeerId>;
}

/// Publish side of the gossip library.
#[async_trait]
pub trait TopicPublisher: Send + Sync {
    /// Create the underlying pubsub subscription for a topic. Idempotent.
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Hand a serialized envelope to the gossip layer for fan-out.
    async fn publish(&self, topic: &str, envelope: Vec<u8>) -> Result<()>;
}

/// Direct-stream side of the transport.
#[async_trait]
pub trait DirectTransport: Send + Sync {
    /// Open (or reuse) the dedicated direct stream to `to` and send one frame.
    async fn send_direct(&self, to: &PeerId, envelope: Vec<u8>) -> Result<()>;
}

/// The Kademlia routing-table handle used by the optimized discoverer.
#[async_trait]
pub trait KadDhtHandler: Send + Sync {
    /// Walk the routing table and refresh stale buckets.
    async fn bootstrap(&self) -> Result<()>;
}

/// Resolves a peer id to its shard membership and role.
/// Implementations are in-memory lookups; results may change between calls.
pub trait PeerShardResolver: Send + Sync {
    fn peer_info(&self, pid: &PeerId) -> PeerInfo;
}

/// Peers explicitly protected from eviction, held outside this crate.
pub trait PreferredPeersHolder: Send + Sync {
    fn contains(&self, pid: &PeerId) -> bool;

    /// Record the address a preferred peer connected from.
    fn put_connection_address(&self, pid: &PeerId, address: &str);

    fn remove(&self, pid: &PeerId);
}

/// Decides whether a peer is currently denied a connection.
pub trait PeerDenialEvaluator: Send + Sync {
    fn is_denied(&self, pid: &PeerId) -> bool;
}

/// Write side of the denial list: protocol violators are parked here.
pub trait PeerBlacklistHandler: Send + Sync {
    fn blacklist_peer(&self, pid: &PeerId, duration: Duration);
}

/// A registered consumer of inbound messages on a topic.
///
/// Processors for the same topic run in parallel over a snapshot of the
/// registration table; an error from any of them rejects the message and
/// blacklists its source, so a processor must only fail on genuine protocol
/// violations.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process_received_message(&self, message: &Message, from: &PeerId) -> Result<()>;
}

/// A component able to re-establish network presence when connectivity drops.
#[async_trait]
pub trait Reconnecter: Send + Sync {
    async fn reconnect_to_network(&self);
}

/// Denial evaluator that denies nothing; the monitor's starting state until
/// the node wires the real blacklist in.
pub struct DisabledPeerDenialEvaluator;

impl PeerDenialEvaluator for DisabledPeerDenialEvaluator {
    fn is_denied(&self, _pid: &PeerId) -> bool {
        false
    }
}
