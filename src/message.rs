//! # Wire Message Envelope
//!
//! Serialization types for everything that crosses the wire. The envelope is
//! the gossip-compatible framing shared by broadcast and direct delivery; the
//! [`TopicPayload`] inside it is the canonical blob that gets signed.
//!
//! ## Envelope Layout
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `from` | originator peer id bytes |
//! | `data` | application bytes |
//! | `payload` | serialized `TopicPayload { data, timestamp }`, the signed blob |
//! | `seq_no` | big-endian sequence number, 8 bytes |
//! | `topic` | topic the message was sent on |
//! | `signature` | signature over SHA-256(payload) |
//! | `key` | signer's public key when not recoverable from `from` |
//!
//! ## Security Limits
//!
//! All wire-facing deserialization goes through [`deserialize_bounded`] which
//! caps the decode buffer, so a hostile peer cannot force an allocation larger
//! than `MAX_DESERIALIZE_SIZE`.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::peer::PeerId;

/// Width of the wire sequence number in bytes.
pub const SEQUENCE_NUMBER_SIZE: usize = 8;

/// Maximum size of an application message carried in a single envelope (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization.
/// Slightly larger than MAX_MESSAGE_SIZE to allow for envelope overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_MESSAGE_SIZE as u64) + 4096;

/// Name of the outbound channel that always exists.
pub const DEFAULT_CHANNEL: &str = "default";

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
/// Use this instead of raw bincode::deserialize for anything wire-facing.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// How a message reached (or will reach) its destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BroadcastMethod {
    Direct,
    Broadcast,
}

/// The canonical signed blob: application bytes plus the send timestamp.
/// The timestamp bounds how long a captured message can be replayed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicPayload {
    pub data: Vec<u8>,
    pub timestamp: i64,
}

/// The wire envelope, compatible with the gossip library message framing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Originator peer id bytes (serialized public key hash).
    pub from: Vec<u8>,
    /// Application bytes, also carried inside `payload`.
    pub data: Vec<u8>,
    /// Serialized [`TopicPayload`]; the blob the signature covers.
    pub payload: Vec<u8>,
    /// Big-endian sequence number, `SEQUENCE_NUMBER_SIZE` bytes.
    pub seq_no: Vec<u8>,
    pub topic: String,
    /// Signature over SHA-256(payload).
    pub signature: Vec<u8>,
    /// Signer's public key; empty when recoverable from `from`.
    pub key: Vec<u8>,
    /// The connected peer the message arrived from (not serialized identity).
    pub peer: PeerId,
    pub timestamp: i64,
    pub broadcast_method: BroadcastMethod,
}

impl Message {
    /// The originator as a [`PeerId`].
    pub fn from_pid(&self) -> PeerId {
        PeerId::from_bytes(self.from.clone())
    }

    /// The sequence number as a u64, tolerating short encodings.
    pub fn seq_no_u64(&self) -> u64 {
        let mut buf = [0u8; SEQUENCE_NUMBER_SIZE];
        let len = self.seq_no.len().min(SEQUENCE_NUMBER_SIZE);
        buf[SEQUENCE_NUMBER_SIZE - len..].copy_from_slice(&self.seq_no[self.seq_no.len() - len..]);
        u64::from_be_bytes(buf)
    }
}

/// An outbound item queued on a load balancer channel. The optional private
/// key and pid ride along so signing can happen at publish time with the key
/// the caller asked for.
#[derive(Clone, Debug)]
pub struct SendableData {
    pub buf: Vec<u8>,
    pub topic: String,
    pub sk: Option<Vec<u8>>,
    pub pid: Option<PeerId>,
}

impl SendableData {
    pub fn new(topic: impl Into<String>, buf: Vec<u8>) -> Self {
        Self {
            buf,
            topic: topic.into(),
            sk: None,
            pid: None,
        }
    }
}

/// Encode a sequence counter value as the wire sequence number.
pub fn encode_seq_no(counter: u64) -> Vec<u8> {
    counter.to_be_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        Message {
            from: vec![1, 2, 3],
            data: b"payload data".to_vec(),
            payload: vec![9; 40],
            seq_no: encode_seq_no(77),
            topic: "headers".to_string(),
            signature: vec![5; 64],
            key: vec![7; 33],
            peer: PeerId::from_bytes(vec![1, 2, 3]),
            timestamp: 1_000,
            broadcast_method: BroadcastMethod::Broadcast,
        }
    }

    #[test]
    fn envelope_round_trip_preserves_fields() {
        let msg = sample_message();
        let bytes = serialize(&msg).unwrap();
        let decoded: Message = deserialize_bounded(&bytes).unwrap();

        assert_eq!(decoded, msg);
        assert_eq!(decoded.seq_no_u64(), 77);
    }

    #[test]
    fn truncated_and_garbage_input_rejected() {
        let msg = sample_message();
        let bytes = serialize(&msg).unwrap();

        let truncated = &bytes[..bytes.len() / 2];
        assert!(deserialize_bounded::<Message>(truncated).is_err());

        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(deserialize_bounded::<Message>(&garbage).is_err());
    }

    #[test]
    fn seq_no_tolerates_short_encodings() {
        let mut msg = sample_message();
        msg.seq_no = vec![0x01, 0x00];
        assert_eq!(msg.seq_no_u64(), 256);

        msg.seq_no = Vec::new();
        assert_eq!(msg.seq_no_u64(), 0);
    }

    #[test]
    fn seq_no_wraps_at_u64_boundary() {
        assert_eq!(encode_seq_no(u64::MAX), vec![0xFF; 8]);
        let next = u64::MAX.wrapping_add(1);
        assert_eq!(encode_seq_no(next), vec![0; 8]);
    }

    #[test]
    fn topic_payload_round_trip() {
        let payload = TopicPayload {
            data: b"inner".to_vec(),
            timestamp: 123_456,
        };
        let bytes = serialize(&payload).unwrap();
        let decoded: TopicPayload = deserialize_bounded(&bytes).unwrap();
        assert_eq!(decoded, payload);
    }
}
