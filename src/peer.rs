//! # Peer Identity and Classification
//!
//! Core identity types shared by every subsystem: an opaque [`PeerId`]
//! (serialized public key hash), the [`PeerInfo`] classification resolved by an
//! external shard resolver, and [`PeerDistance`] used by the sharder to rank
//! peers on the Kademlia XOR metric.
//!
//! ## Distance Metric
//!
//! Peer ids are first mapped onto the Kademlia keyspace by hashing their raw
//! bytes with SHA-256. The distance between two peers is the Hamming weight of
//! the XOR of their kad-ids: the number of differing bits, lower = closer.
//! Ordering is made total by breaking distance ties on the raw id bytes so that
//! eviction sorting is deterministic.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of trailing characters of the pretty id used in log rendering.
pub const DISPLAY_LAST_PID_CHARS: usize = 12;

/// Opaque peer identifier. Equality and ordering are defined on the raw bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Base58 rendering of the raw id, the form used inside multiaddresses.
    pub fn pretty(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    /// Projection onto the Kademlia keyspace.
    pub fn kad_id(&self) -> [u8; 32] {
        let digest = Sha256::digest(&self.0);
        digest.into()
    }

    /// XOR-Hamming distance between the kad-ids of `self` and `other`.
    pub fn distance_to(&self, other: &PeerId) -> u32 {
        let a = self.kad_id();
        let b = other.kad_id();
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x ^ y).count_ones())
            .sum()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pretty = self.pretty();
        if pretty.len() <= DISPLAY_LAST_PID_CHARS {
            return write!(f, "{pretty}");
        }
        write!(f, "…{}", &pretty[pretty.len() - DISPLAY_LAST_PID_CHARS..])
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Role of a peer inside the network, as reported by the shard resolver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerType {
    Validator,
    Observer,
    Unknown,
}

/// Classification of a peer: its role and the shard it operates in.
/// Resolved externally and allowed to change over time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_type: PeerType,
    pub shard_id: u32,
}

impl PeerInfo {
    pub fn unknown() -> Self {
        Self {
            peer_type: PeerType::Unknown,
            shard_id: 0,
        }
    }
}

/// A peer paired with its XOR-Hamming distance to self.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerDistance {
    pub pid: PeerId,
    pub distance: u32,
}

impl PeerDistance {
    pub fn between(pid: PeerId, reference: &PeerId) -> Self {
        let distance = pid.distance_to(reference);
        Self { pid, distance }
    }
}

impl PartialOrd for PeerDistance {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerDistance {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance
            .cmp(&other.distance)
            .then_with(|| self.pid.cmp(&other.pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(seed: u8) -> PeerId {
        PeerId::from_bytes(vec![seed; 8])
    }

    #[test]
    fn distance_is_symmetric_and_zero_to_self() {
        let a = pid(1);
        let b = pid(2);

        assert_eq!(a.distance_to(&b), b.distance_to(&a));
        assert_eq!(a.distance_to(&a), 0);
    }

    #[test]
    fn distance_counts_differing_bits() {
        let a = pid(1);
        let b = pid(2);

        let expected: u32 = a
            .kad_id()
            .iter()
            .zip(b.kad_id().iter())
            .map(|(x, y)| (x ^ y).count_ones())
            .sum();
        assert_eq!(a.distance_to(&b), expected);
        assert!(expected > 0);
    }

    #[test]
    fn peer_distance_orders_by_distance_then_id() {
        let near = PeerDistance {
            pid: pid(9),
            distance: 3,
        };
        let far = PeerDistance {
            pid: pid(1),
            distance: 90,
        };
        assert!(near < far);

        let tie_low = PeerDistance {
            pid: PeerId::from_bytes(vec![1]),
            distance: 7,
        };
        let tie_high = PeerDistance {
            pid: PeerId::from_bytes(vec![2]),
            distance: 7,
        };
        assert!(tie_low < tie_high);
    }

    #[test]
    fn display_renders_trailing_pretty_chars() {
        let long = PeerId::from_bytes(vec![0xAB; 32]);
        let rendered = format!("{long}");
        let pretty = long.pretty();

        assert!(rendered.ends_with(&pretty[pretty.len() - DISPLAY_LAST_PID_CHARS..]));
        assert!(rendered.starts_with('…'));

        let short = PeerId::from_bytes(vec![1]);
        assert_eq!(format!("{short}"), short.pretty());
    }

    #[test]
    fn pretty_is_base58_of_raw_bytes() {
        let p = pid(42);
        let decoded = bs58::decode(p.pretty()).into_vec().unwrap();
        assert_eq!(decoded, p.as_bytes());
    }
}
