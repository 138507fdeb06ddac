//! # Direct Sender
//!
//! Unicast delivery outside the pub/sub fan-out. Every outbound frame gets a
//! fresh sequence number from a node-local monotonic counter; the receive
//! path drops any `(from, seq_no)` pair it has already seen within the cache
//! window, so a peer replaying a frame gets silence instead of a second
//! dispatch.
//!
//! The inbound handler is registered after construction: the messages handler
//! consumes the direct sender for its send path while the direct sender
//! forwards received frames back into the handler, and late registration is
//! what breaks that cycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use tracing::trace;

use crate::crypto::P2pSigner;
use crate::message::{
    self, encode_seq_no, BroadcastMethod, Message, TopicPayload, MAX_MESSAGE_SIZE,
    SEQUENCE_NUMBER_SIZE,
};
use crate::peer::PeerId;
use crate::protocols::{DirectTransport, MessageProcessor};
use crate::timecache::TimeCache;

/// Window inside which a repeated `(from, seq_no)` pair is dropped.
pub const SEEN_MESSAGES_SPAN: Duration = Duration::from_secs(120);

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Sequence-numbered unicast sender with duplicate suppression on receive.
pub struct DirectSender {
    transport: Arc<dyn DirectTransport>,
    signer: Arc<P2pSigner>,
    counter: AtomicU64,
    seen_messages: TimeCache,
    processor: RwLock<Option<Arc<dyn MessageProcessor>>>,
}

impl DirectSender {
    pub fn new(transport: Arc<dyn DirectTransport>, signer: Arc<P2pSigner>) -> Self {
        Self {
            transport,
            signer,
            // Random start so a restarted node does not collide with its own
            // recently cached sequence numbers on remote peers.
            counter: AtomicU64::new(rand::random()),
            seen_messages: TimeCache::new(SEEN_MESSAGES_SPAN),
            processor: RwLock::new(None),
        }
    }

    /// Register the inbound handler. Exactly one registration is accepted.
    pub fn register_direct_message_processor(
        &self,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<()> {
        let mut current = self.processor.write().expect("processor lock poisoned");
        if current.is_some() {
            bail!("a direct message processor is already registered");
        }
        *current = Some(processor);

        Ok(())
    }

    fn next_seq_no(&self) -> Vec<u8> {
        encode_seq_no(self.counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Build, sign and dispatch one direct frame to `to`.
    pub async fn send(&self, topic: &str, buf: Vec<u8>, to: &PeerId) -> Result<()> {
        if topic.is_empty() {
            bail!("topic name cannot be empty");
        }
        if buf.len() > MAX_MESSAGE_SIZE {
            bail!(
                "message of {} bytes exceeds the maximum of {MAX_MESSAGE_SIZE}",
                buf.len()
            );
        }

        let timestamp = unix_timestamp();
        let payload = message::serialize(&TopicPayload {
            data: buf.clone(),
            timestamp,
        })?;
        let signature = self
            .signer
            .sign(&payload)
            .context("failed to sign direct message")?;

        let own_pid = self.signer.own_peer_id();
        let envelope = Message {
            from: own_pid.as_bytes().to_vec(),
            data: buf,
            payload,
            seq_no: self.next_seq_no(),
            topic: topic.to_string(),
            signature,
            key: self.signer.public_key_bytes(),
            peer: own_pid,
            timestamp,
            broadcast_method: BroadcastMethod::Direct,
        };
        let frame = message::serialize(&envelope)?;

        self.transport.send_direct(to, frame).await
    }

    /// Validate shape, suppress duplicates and forward to the registered
    /// handler. Duplicates are dropped silently.
    pub async fn process_received_direct_message(
        &self,
        msg: Message,
        from: &PeerId,
    ) -> Result<()> {
        if msg.topic.is_empty() {
            bail!("direct message carries no topic");
        }
        if msg.from.is_empty() {
            bail!("direct message carries no originator");
        }
        if msg.seq_no.is_empty() || msg.seq_no.len() > SEQUENCE_NUMBER_SIZE {
            bail!("direct message carries a malformed sequence number");
        }
        if msg.payload.is_empty() {
            bail!("direct message carries no payload");
        }

        let seen_key = format!("{}-{}", hex::encode(&msg.from), hex::encode(&msg.seq_no));
        if self.seen_messages.has(&seen_key) {
            trace!(peer = %from, "dropping duplicate direct message");
            return Ok(());
        }
        self.seen_messages.add(&seen_key);

        let processor = {
            let current = self.processor.read().expect("processor lock poisoned");
            current.clone()
        };
        let Some(processor) = processor else {
            bail!("no direct message processor registered");
        };

        processor.process_received_message(&msg, from).await
    }

    /// Stop the duplicate-suppression sweep. Idempotent.
    pub fn close(&self) {
        self.seen_messages.close();
    }

    /// True once the sweep task has exited. Exposed for shutdown tests.
    pub fn sweeper_stopped(&self) -> bool {
        self.seen_messages.sweeper_stopped()
    }
}
