//! # Messages Handler
//!
//! The seam between application topics and the gossip layer, in both
//! directions.
//!
//! ## Outbound
//!
//! `broadcast*` calls queue a [`SendableData`] on the load balancer; a single
//! publish task drains the queue, stamps each item with a timestamp, signs
//! the canonical payload (with the node key, or the private key the caller
//! attached) and hands the serialized envelope to the gossip publisher. The
//! queue is the only buffering: one publish is in flight per drained item.
//!
//! ## Inbound
//!
//! `handle_received_message` is the pubsub validator. It decodes and
//! shape-checks the envelope, verifies the signature against the originator's
//! claimed identity, rejects messages outside the timestamp window, acquires
//! a throttler slot, and runs every processor registered on the topic in
//! parallel over a snapshot of the registration table. Any processor error,
//! like any signature or shape violation, blacklists the sending peer for
//! [`WRONG_MESSAGE_BLACKLIST_DURATION`] and tells pubsub not to relay.
//!
//! Direct (unicast) frames arrive through the [`DirectSender`] after its own
//! de-duplication and are dispatched through the same processor table.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::crypto::{P2pSigner, SigningError};
use crate::direct::DirectSender;
use crate::loadbalancer::OutgoingChannelLoadBalancer;
use crate::message::{
    self, encode_seq_no, BroadcastMethod, Message, SendableData, TopicPayload, DEFAULT_CHANNEL,
    MAX_MESSAGE_SIZE,
};
use crate::peer::PeerId;
use crate::protocols::{MessageProcessor, PeerBlacklistHandler, TopicPublisher};
use crate::throttler::NumMessagesThrottler;

/// How long a peer stays blacklisted after sending a message that violates
/// the protocol.
pub const WRONG_MESSAGE_BLACKLIST_DURATION: Duration = Duration::from_secs(7200);

/// Default clock-skew allowance for messages dated in the future.
pub const DEFAULT_ACCEPT_MESSAGES_IN_ADVANCE: Duration = Duration::from_secs(5);

/// Default age beyond which a message is stale; mirrors the pubsub layer's
/// own seen-messages window so we never process what pubsub would still relay.
pub const DEFAULT_PUBSUB_TIME_CACHE_DURATION: Duration = Duration::from_secs(120);

/// Default bound on concurrently processed inbound messages.
pub const DEFAULT_MAX_INFLIGHT_MESSAGES: u32 = 1000;

/// Tuning knobs of the messages handler.
#[derive(Clone, Debug)]
pub struct MessagesHandlerConfig {
    pub accept_messages_in_advance: Duration,
    pub pubsub_time_cache_duration: Duration,
    pub max_inflight_messages: u32,
}

impl Default for MessagesHandlerConfig {
    fn default() -> Self {
        Self {
            accept_messages_in_advance: DEFAULT_ACCEPT_MESSAGES_IN_ADVANCE,
            pubsub_time_cache_duration: DEFAULT_PUBSUB_TIME_CACHE_DURATION,
            max_inflight_messages: DEFAULT_MAX_INFLIGHT_MESSAGES,
        }
    }
}

/// Arguments for [`MessagesHandler::new`].
pub struct MessagesHandlerArgs {
    pub signer: Arc<P2pSigner>,
    pub publisher: Arc<dyn TopicPublisher>,
    pub direct_sender: Arc<DirectSender>,
    pub load_balancer: Arc<OutgoingChannelLoadBalancer>,
    pub blacklist: Arc<dyn PeerBlacklistHandler>,
    pub config: MessagesHandlerConfig,
}

type TopicProcessors = HashMap<String, Arc<dyn MessageProcessor>>;

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct HandlerInner {
    signer: Arc<P2pSigner>,
    publisher: Arc<dyn TopicPublisher>,
    direct_sender: Arc<DirectSender>,
    load_balancer: Arc<OutgoingChannelLoadBalancer>,
    blacklist: Arc<dyn PeerBlacklistHandler>,
    topics: RwLock<HashMap<String, TopicProcessors>>,
    subscribed: RwLock<HashSet<String>>,
    throttler: NumMessagesThrottler,
    seq_counter: AtomicU64,
    config: MessagesHandlerConfig,
    publish_loop_stopped: AtomicBool,
}

impl HandlerInner {
    /// Snapshot the processors of a topic so they can run without the table
    /// lock held.
    fn processors_for(&self, topic: &str) -> Option<TopicProcessors> {
        let topics = self.topics.read().expect("topics lock poisoned");
        topics.get(topic).filter(|p| !p.is_empty()).cloned()
    }

    fn has_processors(&self, topic: &str) -> bool {
        let topics = self.topics.read().expect("topics lock poisoned");
        topics.get(topic).map(|p| !p.is_empty()).unwrap_or(false)
    }

    fn validate_message_by_timestamp(&self, msg: &Message) -> Result<()> {
        let now = unix_timestamp();
        let max_accepted = now + self.config.accept_messages_in_advance.as_secs() as i64;
        if msg.timestamp > max_accepted {
            bail!(
                "message timestamp {} is too far in the future (now {now})",
                msg.timestamp
            );
        }

        let min_accepted = now - self.config.pubsub_time_cache_duration.as_secs() as i64;
        if msg.timestamp < min_accepted {
            bail!("message timestamp {} is stale (now {now})", msg.timestamp);
        }

        Ok(())
    }

    /// Decode and shape-check a raw envelope, then verify its signature.
    /// `from` is the connected peer that delivered the envelope; it ends up
    /// in the message's `peer` field and may differ from the originator.
    fn transform_and_check(&self, raw: &[u8], topic: &str, from: &PeerId) -> Result<Message> {
        let mut msg: Message =
            message::deserialize_bounded(raw).context("undecodable message envelope")?;

        if msg.topic != topic {
            bail!(
                "message topic {} does not match the arrival topic {topic}",
                msg.topic
            );
        }
        if msg.from.is_empty() {
            bail!("message carries no originator");
        }

        let payload: TopicPayload = message::deserialize_bounded(&msg.payload)
            .context("undecodable canonical payload")?;
        if payload.data != msg.data {
            bail!("message data does not match the signed payload");
        }

        msg.timestamp = payload.timestamp;
        msg.peer = from.clone();
        msg.broadcast_method = BroadcastMethod::Broadcast;

        let originator = msg.from_pid();
        if !msg.key.is_empty() {
            let derived = self.signer.key_converter().register_public_key(&msg.key)?;
            if derived != originator {
                bail!(SigningError::PeerIdMismatch);
            }
        }
        self.signer
            .verify(&msg.payload, &originator, &msg.signature)?;

        Ok(msg)
    }

    /// Run every processor of the topic in parallel; the first error wins.
    async fn dispatch(&self, msg: Arc<Message>, from: &PeerId) -> Result<()> {
        let Some(processors) = self.processors_for(&msg.topic) else {
            bail!("no processors registered on topic {}", msg.topic);
        };

        let mut tasks = Vec::with_capacity(processors.len());
        for (identifier, processor) in processors {
            let msg = msg.clone();
            let from = from.clone();
            tasks.push(tokio::spawn(async move {
                processor
                    .process_received_message(&msg, &from)
                    .await
                    .map_err(|error| anyhow!("processor {identifier}: {error}"))
            }));
        }

        let mut failure = None;
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => failure = Some(error),
                Err(join_error) => failure = Some(anyhow!("processor panicked: {join_error}")),
            }
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn blacklist_for_protocol_violation(&self, pid: &PeerId, reason: &anyhow::Error) {
        warn!(peer = %pid, error = %reason, "blacklisting peer for a protocol violation");
        self.blacklist
            .blacklist_peer(pid, WRONG_MESSAGE_BLACKLIST_DURATION);
    }

    /// Sign and publish one queued outbound item.
    async fn publish_sendable(&self, data: SendableData) -> Result<()> {
        let timestamp = unix_timestamp();
        let payload = message::serialize(&TopicPayload {
            data: data.buf.clone(),
            timestamp,
        })?;

        let (signature, from, key) = match &data.sk {
            Some(sk) => {
                let (pid, key_bytes) = self.signer.identity_from_private_key(sk)?;
                let signature = self.signer.sign_using_private_key(sk, &payload)?;
                (signature, pid, key_bytes)
            }
            None => (
                self.signer.sign(&payload)?,
                self.signer.own_peer_id(),
                self.signer.public_key_bytes(),
            ),
        };

        let envelope = Message {
            from: from.as_bytes().to_vec(),
            data: data.buf,
            payload,
            seq_no: encode_seq_no(self.seq_counter.fetch_add(1, Ordering::SeqCst)),
            topic: data.topic.clone(),
            signature,
            key,
            peer: from,
            timestamp,
            broadcast_method: BroadcastMethod::Broadcast,
        };

        self.publisher
            .publish(&data.topic, message::serialize(&envelope)?)
            .await
    }

    fn check_sendable(&self, topic: &str, buf: &[u8]) -> Result<()> {
        if topic.is_empty() {
            bail!("topic name cannot be empty");
        }
        if buf.len() > MAX_MESSAGE_SIZE {
            bail!(
                "message of {} bytes exceeds the maximum of {MAX_MESSAGE_SIZE}",
                buf.len()
            );
        }

        Ok(())
    }

    /// Validate a private key broadcast request and build its queue item.
    fn sendable_using_private_key(
        &self,
        topic: &str,
        buf: Vec<u8>,
        pid: &PeerId,
        sk: Vec<u8>,
    ) -> Result<SendableData> {
        self.check_sendable(topic, &buf)?;

        let (derived, key_bytes) = self.signer.identity_from_private_key(&sk)?;
        if derived != *pid {
            bail!(SigningError::PeerIdMismatch);
        }
        // Learn the key now so locally looped-back messages verify.
        self.signer.key_converter().register_public_key(&key_bytes)?;

        Ok(SendableData {
            buf,
            topic: topic.to_string(),
            sk: Some(sk),
            pid: Some(pid.clone()),
        })
    }
}

/// Dispatches frames the direct sender accepted into the processor table.
/// Holds a weak reference: the handler owns the sender, not the reverse.
struct DirectMessageDispatcher {
    inner: Weak<HandlerInner>,
}

#[async_trait]
impl MessageProcessor for DirectMessageDispatcher {
    async fn process_received_message(&self, msg: &Message, from: &PeerId) -> Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            bail!("messages handler was dropped");
        };

        inner.validate_message_by_timestamp(msg)?;
        if !inner.has_processors(&msg.topic) {
            bail!("no processors registered on topic {}", msg.topic);
        }

        let result = inner.dispatch(Arc::new(msg.clone()), from).await;
        if let Err(error) = &result {
            inner.blacklist_for_protocol_violation(from, error);
        }

        result
    }
}

/// Topic registration, signing, fan-out and inbound dispatch.
pub struct MessagesHandler {
    inner: Arc<HandlerInner>,
    cancel: watch::Sender<bool>,
}

impl MessagesHandler {
    /// Builds the handler and registers it as the direct sender's inbound
    /// processor, closing the construction cycle between the two.
    pub fn new(args: MessagesHandlerArgs) -> Result<Self> {
        let throttler = NumMessagesThrottler::new(args.config.max_inflight_messages)?;
        if args.config.pubsub_time_cache_duration.is_zero() {
            bail!("pubsub time cache duration should be positive");
        }

        let inner = Arc::new(HandlerInner {
            signer: args.signer,
            publisher: args.publisher,
            direct_sender: args.direct_sender,
            load_balancer: args.load_balancer,
            blacklist: args.blacklist,
            topics: RwLock::new(HashMap::new()),
            subscribed: RwLock::new(HashSet::new()),
            throttler,
            seq_counter: AtomicU64::new(rand::random()),
            config: args.config,
            publish_loop_stopped: AtomicBool::new(false),
        });

        inner
            .direct_sender
            .register_direct_message_processor(Arc::new(DirectMessageDispatcher {
                inner: Arc::downgrade(&inner),
            }))?;

        let (cancel, mut cancel_rx) = watch::channel(false);
        let publish_inner = inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = publish_inner.load_balancer.collect_one_element() => {
                        match item {
                            Some(data) => {
                                if let Err(error) = publish_inner.publish_sendable(data).await {
                                    debug!(%error, "failed to publish queued message");
                                }
                            }
                            None => break,
                        }
                    }
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("closing the publish loop");
            publish_inner.publish_loop_stopped.store(true, Ordering::SeqCst);
        });

        Ok(Self { inner, cancel })
    }

    // ========================================================================
    // Topic lifecycle
    // ========================================================================

    /// Idempotently create a topic; optionally attach the pubsub
    /// subscription feeding [`Self::handle_received_message`].
    pub async fn create_topic(&self, name: &str, create_subscription: bool) -> Result<()> {
        if name.is_empty() {
            bail!("topic name cannot be empty");
        }

        {
            let mut topics = self.inner.topics.write().expect("topics lock poisoned");
            topics.entry(name.to_string()).or_default();
        }

        if create_subscription {
            let already = {
                let subscribed = self.inner.subscribed.read().expect("subscribed lock poisoned");
                subscribed.contains(name)
            };
            if !already {
                self.inner.publisher.subscribe(name).await?;
                let mut subscribed =
                    self.inner.subscribed.write().expect("subscribed lock poisoned");
                subscribed.insert(name.to_string());
            }
        }

        Ok(())
    }

    /// Attach a processor under `(topic, identifier)`. The same identifier
    /// cannot be registered twice on one topic.
    pub fn register_message_processor(
        &self,
        topic: &str,
        identifier: &str,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<()> {
        if topic.is_empty() {
            bail!("topic name cannot be empty");
        }

        let mut topics = self.inner.topics.write().expect("topics lock poisoned");
        let entry = topics.entry(topic.to_string()).or_default();
        if entry.contains_key(identifier) {
            bail!("processor {identifier} is already registered on topic {topic}");
        }
        entry.insert(identifier.to_string(), processor);

        Ok(())
    }

    /// Detach a processor. Unknown topics and identifiers are a no-op.
    pub fn unregister_message_processor(&self, topic: &str, identifier: &str) {
        let mut topics = self.inner.topics.write().expect("topics lock poisoned");
        if let Some(entry) = topics.get_mut(topic) {
            entry.remove(identifier);
        }
    }

    pub fn unregister_all_message_processors(&self) {
        let mut topics = self.inner.topics.write().expect("topics lock poisoned");
        for entry in topics.values_mut() {
            entry.clear();
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Queue a broadcast on the default channel, dropping on backpressure.
    pub fn broadcast(&self, topic: &str, buf: Vec<u8>) -> Result<()> {
        self.broadcast_on_channel(DEFAULT_CHANNEL, topic, buf)
    }

    /// Queue a broadcast on a named channel, dropping on backpressure.
    pub fn broadcast_on_channel(&self, channel: &str, topic: &str, buf: Vec<u8>) -> Result<()> {
        self.inner.check_sendable(topic, &buf)?;
        self.inner
            .load_balancer
            .try_send_on_channel(channel, SendableData::new(topic, buf))
    }

    /// Queue a broadcast, waiting for channel space.
    pub async fn broadcast_on_channel_blocking(
        &self,
        channel: &str,
        topic: &str,
        buf: Vec<u8>,
    ) -> Result<()> {
        self.inner.check_sendable(topic, &buf)?;
        self.inner
            .load_balancer
            .send_on_channel(channel, SendableData::new(topic, buf))
            .await
    }

    /// Like [`Self::broadcast`], signing with the provided key; `pid` must be
    /// the identity derived from that key.
    pub fn broadcast_using_private_key(
        &self,
        topic: &str,
        buf: Vec<u8>,
        pid: &PeerId,
        sk: Vec<u8>,
    ) -> Result<()> {
        self.broadcast_on_channel_using_private_key(DEFAULT_CHANNEL, topic, buf, pid, sk)
    }

    pub fn broadcast_on_channel_using_private_key(
        &self,
        channel: &str,
        topic: &str,
        buf: Vec<u8>,
        pid: &PeerId,
        sk: Vec<u8>,
    ) -> Result<()> {
        let data = self.inner.sendable_using_private_key(topic, buf, pid, sk)?;
        self.inner.load_balancer.try_send_on_channel(channel, data)
    }

    pub async fn broadcast_on_channel_blocking_using_private_key(
        &self,
        channel: &str,
        topic: &str,
        buf: Vec<u8>,
        pid: &PeerId,
        sk: Vec<u8>,
    ) -> Result<()> {
        let data = self.inner.sendable_using_private_key(topic, buf, pid, sk)?;
        self.inner.load_balancer.send_on_channel(channel, data).await
    }

    /// Send one frame directly to a connected peer, outside pub/sub.
    pub async fn send_to_connected_peer(
        &self,
        topic: &str,
        buf: Vec<u8>,
        pid: &PeerId,
    ) -> Result<()> {
        self.inner.check_sendable(topic, &buf)?;
        self.inner.direct_sender.send(topic, buf, pid).await
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// The pubsub validator: returns true when the message may be relayed.
    pub async fn handle_received_message(&self, topic: &str, raw: &[u8], from: &PeerId) -> bool {
        let msg = match self.inner.transform_and_check(raw, topic, from) {
            Ok(msg) => msg,
            Err(error) => {
                self.inner.blacklist_for_protocol_violation(from, &error);
                return false;
            }
        };

        if let Err(error) = self.inner.validate_message_by_timestamp(&msg) {
            trace!(peer = %from, %error, "rejecting message outside the timestamp window");
            return false;
        }

        // Nothing to validate against: reject without penalizing the sender.
        if !self.inner.has_processors(topic) {
            trace!(topic, "no processors registered, rejecting message");
            return false;
        }

        if !self.inner.throttler.can_process() {
            debug!(topic, "inbound processing saturated, rejecting message");
            return false;
        }
        self.inner.throttler.start_processing();

        let result = self.inner.dispatch(Arc::new(msg), from).await;
        self.inner.throttler.end_processing();

        match result {
            Ok(()) => true,
            Err(error) => {
                self.inner.blacklist_for_protocol_violation(from, &error);
                false
            }
        }
    }

    /// Stop the publish loop and the owned outbound components. Idempotent.
    pub fn close(&self) {
        let _ = self.cancel.send(true);
        self.inner.load_balancer.close();
        self.inner.direct_sender.close();
    }

    /// True once the publish loop has exited. Exposed for shutdown tests.
    pub fn publish_loop_stopped(&self) -> bool {
        self.inner.publish_loop_stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    use crate::crypto::RegistryKeyConverter;
    use crate::message::deserialize_bounded;
    use crate::protocols::DirectTransport;

    #[derive(Default)]
    struct StubPublisher {
        published: Mutex<Vec<(String, Vec<u8>)>>,
        subscriptions: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TopicPublisher for StubPublisher {
        async fn subscribe(&self, topic: &str) -> Result<()> {
            self.subscriptions.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        async fn publish(&self, topic: &str, envelope: Vec<u8>) -> Result<()> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), envelope));
            Ok(())
        }
    }

    struct NullTransport;

    #[async_trait]
    impl DirectTransport for NullTransport {
        async fn send_direct(&self, _to: &PeerId, _envelope: Vec<u8>) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingBlacklist {
        entries: Mutex<Vec<(PeerId, Duration)>>,
    }

    impl PeerBlacklistHandler for RecordingBlacklist {
        fn blacklist_peer(&self, pid: &PeerId, duration: Duration) {
            self.entries.lock().unwrap().push((pid.clone(), duration));
        }
    }

    #[derive(Default)]
    struct CountingProcessor {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl MessageProcessor for CountingProcessor {
        async fn process_received_message(&self, _msg: &Message, _from: &PeerId) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("message content violates the protocol");
            }
            Ok(())
        }
    }

    struct Fixture {
        handler: MessagesHandler,
        publisher: Arc<StubPublisher>,
        blacklist: Arc<RecordingBlacklist>,
        signer: Arc<P2pSigner>,
    }

    fn fixture_with(config: MessagesHandlerConfig) -> Fixture {
        let signer = Arc::new(P2pSigner::generate(Arc::new(RegistryKeyConverter::new())));
        let publisher = Arc::new(StubPublisher::default());
        let blacklist = Arc::new(RecordingBlacklist::default());
        let direct_sender = Arc::new(DirectSender::new(Arc::new(NullTransport), signer.clone()));
        let load_balancer = Arc::new(OutgoingChannelLoadBalancer::new(64).unwrap());

        let handler = MessagesHandler::new(MessagesHandlerArgs {
            signer: signer.clone(),
            publisher: publisher.clone(),
            direct_sender,
            load_balancer,
            blacklist: blacklist.clone(),
            config,
        })
        .unwrap();

        Fixture {
            handler,
            publisher,
            blacklist,
            signer,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MessagesHandlerConfig::default())
    }

    /// Build a raw envelope the way a remote node would.
    fn remote_envelope(remote: &P2pSigner, topic: &str, data: &[u8], timestamp: i64) -> Vec<u8> {
        let payload = message::serialize(&TopicPayload {
            data: data.to_vec(),
            timestamp,
        })
        .unwrap();
        let signature = remote.sign(&payload).unwrap();
        let pid = remote.own_peer_id();

        let envelope = Message {
            from: pid.as_bytes().to_vec(),
            data: data.to_vec(),
            payload,
            seq_no: encode_seq_no(1),
            topic: topic.to_string(),
            signature,
            key: remote.public_key_bytes(),
            peer: pid,
            timestamp,
            broadcast_method: BroadcastMethod::Broadcast,
        };
        message::serialize(&envelope).unwrap()
    }

    fn remote_signer() -> P2pSigner {
        P2pSigner::generate(Arc::new(RegistryKeyConverter::new()))
    }

    #[tokio::test]
    async fn create_topic_is_idempotent_and_subscribes_once() {
        let fx = fixture();

        fx.handler.create_topic("headers", true).await.unwrap();
        fx.handler.create_topic("headers", true).await.unwrap();
        fx.handler.create_topic("txs", false).await.unwrap();

        assert_eq!(
            fx.publisher.subscriptions.lock().unwrap().as_slice(),
            &["headers".to_string()]
        );

        fx.handler.close();
    }

    #[tokio::test]
    async fn duplicate_processor_identifier_rejected() {
        let fx = fixture();
        let processor = Arc::new(CountingProcessor::default());

        fx.handler
            .register_message_processor("headers", "interceptor", processor.clone())
            .unwrap();
        assert!(fx
            .handler
            .register_message_processor("headers", "interceptor", processor.clone())
            .is_err());
        // Same identifier on a different topic is fine.
        fx.handler
            .register_message_processor("txs", "interceptor", processor)
            .unwrap();

        fx.handler.close();
    }

    #[tokio::test]
    async fn broadcast_publishes_signed_envelope() {
        let fx = fixture();

        fx.handler.broadcast("headers", b"block 42".to_vec()).unwrap();

        // Let the load balancer and publish loop run.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let published = fx.publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let (topic, raw) = &published[0];
        assert_eq!(topic, "headers");

        let envelope: Message = deserialize_bounded(raw).unwrap();
        assert_eq!(envelope.data, b"block 42");
        assert_eq!(envelope.from, fx.signer.own_peer_id().as_bytes());
        assert!(fx
            .signer
            .verify(&envelope.payload, &fx.signer.own_peer_id(), &envelope.signature)
            .is_ok());

        fx.handler.close();
    }

    #[tokio::test]
    async fn broadcast_using_private_key_enforces_identity() {
        let fx = fixture();
        let other = remote_signer();
        let sk = {
            use k256::ecdsa::SigningKey;
            SigningKey::random(&mut rand::rngs::OsRng).to_bytes().to_vec()
        };
        let (derived_pid, _) = fx.signer.identity_from_private_key(&sk).unwrap();

        // Mismatched pid is refused before anything is queued.
        assert!(fx
            .handler
            .broadcast_using_private_key("headers", b"x".to_vec(), &other.own_peer_id(), sk.clone())
            .is_err());

        fx.handler
            .broadcast_using_private_key("headers", b"x".to_vec(), &derived_pid, sk)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let published = fx.publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let envelope: Message = deserialize_bounded(&published[0].1).unwrap();
        assert_eq!(envelope.from, derived_pid.as_bytes());
        // The substitute key verifies against the derived identity.
        assert!(fx
            .signer
            .verify(&envelope.payload, &derived_pid, &envelope.signature)
            .is_ok());

        fx.handler.close();
    }

    #[tokio::test]
    async fn valid_message_dispatches_to_all_processors() {
        let fx = fixture();
        let first = Arc::new(CountingProcessor::default());
        let second = Arc::new(CountingProcessor::default());
        fx.handler
            .register_message_processor("headers", "first", first.clone())
            .unwrap();
        fx.handler
            .register_message_processor("headers", "second", second.clone())
            .unwrap();

        let remote = remote_signer();
        let raw = remote_envelope(&remote, "headers", b"payload", unix_timestamp());
        let from = remote.own_peer_id();

        assert!(fx.handler.handle_received_message("headers", &raw, &from).await);
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert!(fx.blacklist.entries.lock().unwrap().is_empty());

        fx.handler.close();
    }

    /// A message relayed by a third party keeps the relay in `peer` and the
    /// signed originator in `from`.
    #[tokio::test]
    async fn relay_peer_is_kept_distinct_from_originator() {
        struct CapturingProcessor {
            seen: Mutex<Vec<(PeerId, Vec<u8>)>>,
        }

        #[async_trait]
        impl MessageProcessor for CapturingProcessor {
            async fn process_received_message(&self, msg: &Message, _from: &PeerId) -> Result<()> {
                self.seen
                    .lock()
                    .unwrap()
                    .push((msg.peer.clone(), msg.from.clone()));
                Ok(())
            }
        }

        let fx = fixture();
        let capturing = Arc::new(CapturingProcessor {
            seen: Mutex::new(Vec::new()),
        });
        fx.handler
            .register_message_processor("headers", "capturing", capturing.clone())
            .unwrap();

        let originator = remote_signer();
        let raw = remote_envelope(&originator, "headers", b"forwarded", unix_timestamp());
        // Delivered by a relay that is not the signer.
        let relay = PeerId::from_bytes(vec![0xEE; 32]);
        assert_ne!(relay, originator.own_peer_id());

        assert!(fx.handler.handle_received_message("headers", &raw, &relay).await);

        let seen = capturing.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, relay);
        assert_eq!(seen[0].1, originator.own_peer_id().as_bytes());

        fx.handler.close();
    }

    #[tokio::test]
    async fn failing_processor_blacklists_source_once() {
        let fx = fixture();
        fx.handler
            .register_message_processor(
                "headers",
                "rejecting",
                Arc::new(CountingProcessor {
                    fail: true,
                    ..Default::default()
                }),
            )
            .unwrap();

        let remote = remote_signer();
        let raw = remote_envelope(&remote, "headers", b"payload", unix_timestamp());
        let from = remote.own_peer_id();

        assert!(!fx.handler.handle_received_message("headers", &raw, &from).await);

        let entries = fx.blacklist.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, from);
        assert_eq!(entries[0].1, WRONG_MESSAGE_BLACKLIST_DURATION);

        fx.handler.close();
    }

    #[tokio::test]
    async fn tampered_payload_is_rejected_and_blacklisted() {
        let fx = fixture();
        fx.handler
            .register_message_processor("headers", "observer", Arc::new(CountingProcessor::default()))
            .unwrap();

        let remote = remote_signer();
        let raw = remote_envelope(&remote, "headers", b"original", unix_timestamp());
        let mut envelope: Message = deserialize_bounded(&raw).unwrap();
        // Tamper with the payload after signing.
        envelope.payload = message::serialize(&TopicPayload {
            data: b"altered".to_vec(),
            timestamp: envelope.timestamp,
        })
        .unwrap();
        envelope.data = b"altered".to_vec();
        let tampered = message::serialize(&envelope).unwrap();

        let from = remote.own_peer_id();
        assert!(!fx.handler.handle_received_message("headers", &tampered, &from).await);
        assert_eq!(fx.blacklist.entries.lock().unwrap().len(), 1);

        fx.handler.close();
    }

    #[tokio::test]
    async fn timestamp_window_is_enforced() {
        let fx = fixture_with(MessagesHandlerConfig {
            accept_messages_in_advance: Duration::from_secs(5),
            pubsub_time_cache_duration: Duration::from_secs(120),
            max_inflight_messages: 10,
        });
        fx.handler
            .register_message_processor("headers", "observer", Arc::new(CountingProcessor::default()))
            .unwrap();

        let remote = remote_signer();
        let from = remote.own_peer_id();
        let now = unix_timestamp();

        // Inside the window on both edges.
        for ts in [now - 6, now + 5] {
            let raw = remote_envelope(&remote, "headers", b"ok", ts);
            assert!(fx.handler.handle_received_message("headers", &raw, &from).await);
        }

        // Too far in the future and too stale.
        for ts in [now + 30, now - 150] {
            let raw = remote_envelope(&remote, "headers", b"bad", ts);
            assert!(!fx.handler.handle_received_message("headers", &raw, &from).await);
        }

        // Window rejections do not blacklist.
        assert!(fx.blacklist.entries.lock().unwrap().is_empty());

        fx.handler.close();
    }

    #[tokio::test]
    async fn direct_frames_flow_through_the_processor_table() {
        let fx = fixture();
        let processor = Arc::new(CountingProcessor::default());
        fx.handler
            .register_message_processor("txs", "executor", processor.clone())
            .unwrap();

        let remote = remote_signer();
        let from = remote.own_peer_id();
        let msg = Message {
            from: from.as_bytes().to_vec(),
            data: b"direct".to_vec(),
            payload: message::serialize(&TopicPayload {
                data: b"direct".to_vec(),
                timestamp: unix_timestamp(),
            })
            .unwrap(),
            seq_no: encode_seq_no(9),
            topic: "txs".to_string(),
            signature: vec![0; 64],
            key: Vec::new(),
            peer: from.clone(),
            timestamp: unix_timestamp(),
            broadcast_method: BroadcastMethod::Direct,
        };

        fx.handler
            .inner
            .direct_sender
            .process_received_direct_message(msg, &from)
            .await
            .unwrap();

        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        fx.handler.close();
    }

    #[tokio::test]
    async fn close_stops_publish_loop_and_is_idempotent() {
        let fx = fixture();
        assert!(!fx.handler.publish_loop_stopped());

        fx.handler.close();
        fx.handler.close();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(fx.handler.publish_loop_stopped());
    }
}
