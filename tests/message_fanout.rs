//! Integration tests for the message fan-out path: broadcasts queued through
//! the load balancer come out of the publisher as signed envelopes that a
//! second node's handler accepts and dispatches, and protocol violations
//! blacklist the sender.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use shardnet::handler::{
    MessagesHandler, MessagesHandlerArgs, MessagesHandlerConfig, WRONG_MESSAGE_BLACKLIST_DURATION,
};
use shardnet::{
    DirectSender, DirectTransport, Message, MessageProcessor, OutgoingChannelLoadBalancer,
    P2pSigner, PeerBlacklistHandler, PeerId, RegistryKeyConverter, TopicPublisher,
};

#[derive(Default)]
struct CapturingPublisher {
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl TopicPublisher for CapturingPublisher {
    async fn subscribe(&self, _topic: &str) -> Result<()> {
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

struct LoopbackTransport;

#[async_trait]
impl DirectTransport for LoopbackTransport {
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

struct RecordingProcessor {
    calls: AtomicU32,
    payloads: Mutex<Vec<Vec<u8>>>,
    reject: bool,
}

impl RecordingProcessor {
    fn accepting() -> Self {
        Self {
            calls: AtomicU32::new(0),
            payloads: Mutex::new(Vec::new()),
            reject: false,
        }
    }

    fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::accepting()
        }
    }
}

#[async_trait]
impl MessageProcessor for RecordingProcessor {
    async fn process_received_message(&self, msg: &Message, _from: &PeerId) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().unwrap().push(msg.data.clone());
        if self.reject {
            bail!("payload violates the protocol");
        }
        Ok(())
    }
}

struct Node {
    handler: MessagesHandler,
    publisher: Arc<CapturingPublisher>,
    blacklist: Arc<RecordingBlacklist>,
    load_balancer: Arc<OutgoingChannelLoadBalancer>,
    signer: Arc<P2pSigner>,
}

fn node() -> Node {
    let signer = Arc::new(P2pSigner::generate(Arc::new(RegistryKeyConverter::new())));
    let publisher = Arc::new(CapturingPublisher::default());
    let blacklist = Arc::new(RecordingBlacklist::default());
    let load_balancer = Arc::new(OutgoingChannelLoadBalancer::new(64).unwrap());

    let handler = MessagesHandler::new(MessagesHandlerArgs {
        signer: signer.clone(),
        publisher: publisher.clone(),
        direct_sender: Arc::new(DirectSender::new(Arc::new(LoopbackTransport), signer.clone())),
        load_balancer: load_balancer.clone(),
        blacklist: blacklist.clone(),
        config: MessagesHandlerConfig::default(),
    })
    .unwrap();

    Node {
        handler,
        publisher,
        blacklist,
        load_balancer,
        signer,
    }
}

async fn published_envelopes(node: &Node, expected: usize) -> Vec<(String, Vec<u8>)> {
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let published = node.publisher.published.lock().unwrap();
        if published.len() >= expected {
            return published.clone();
        }
    }
    node.publisher.published.lock().unwrap().clone()
}

/// An envelope published by one node is accepted verbatim by another.
#[tokio::test]
async fn broadcast_round_trips_between_two_nodes() {
    let sender = node();
    let receiver = node();

    let processor = Arc::new(RecordingProcessor::accepting());
    receiver.handler.create_topic("headers", true).await.unwrap();
    receiver
        .handler
        .register_message_processor("headers", "interceptor", processor.clone())
        .unwrap();

    sender
        .handler
        .broadcast("headers", b"block 7 header".to_vec())
        .unwrap();

    let published = published_envelopes(&sender, 1).await;
    assert_eq!(published.len(), 1);
    let (topic, raw) = &published[0];

    let relay = sender.signer.own_peer_id();
    assert!(
        receiver
            .handler
            .handle_received_message(topic, raw, &relay)
            .await
    );

    assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        processor.payloads.lock().unwrap().as_slice(),
        &[b"block 7 header".to_vec()]
    );
    assert!(receiver.blacklist.entries.lock().unwrap().is_empty());

    sender.handler.close();
    receiver.handler.close();
}

/// Channels drain fairly: three channels with three queued items each come
/// out interleaved, never three-in-a-row from one channel.
#[tokio::test]
async fn named_channels_share_the_publisher_fairly() {
    let sender = node();

    for channel in ["a", "b", "c"] {
        sender.load_balancer.add_channel(channel).await.unwrap();
    }
    for round in 0..3u8 {
        for channel in ["a", "b", "c"] {
            sender
                .handler
                .broadcast_on_channel(channel, channel, vec![round])
                .unwrap();
        }
    }

    let published = published_envelopes(&sender, 9).await;
    assert_eq!(published.len(), 9);

    let topics: Vec<&str> = published.iter().map(|(t, _)| t.as_str()).collect();
    let expected: Vec<&str> = vec!["a", "b", "c", "a", "b", "c", "a", "b", "c"];
    assert_eq!(topics, expected);

    sender.handler.close();
}

/// A tampered envelope blacklists its sender for exactly the protocol
/// violation duration.
#[tokio::test]
async fn tampered_signature_blacklists_the_sender() {
    let sender = node();
    let receiver = node();

    receiver
        .handler
        .register_message_processor("headers", "interceptor", Arc::new(RecordingProcessor::accepting()))
        .unwrap();

    sender
        .handler
        .broadcast("headers", b"honest data".to_vec())
        .unwrap();
    let published = published_envelopes(&sender, 1).await;
    let (topic, raw) = &published[0];

    // Flip payload bytes after signing.
    let mut envelope: Message = shardnet::message::deserialize_bounded(raw).unwrap();
    let tampered_data = b"dishonest data".to_vec();
    envelope.payload = shardnet::message::serialize(&shardnet::TopicPayload {
        data: tampered_data.clone(),
        timestamp: envelope.timestamp,
    })
    .unwrap();
    envelope.data = tampered_data;
    let tampered = shardnet::message::serialize(&envelope).unwrap();

    let relay = sender.signer.own_peer_id();
    assert!(
        !receiver
            .handler
            .handle_received_message(topic, &tampered, &relay)
            .await
    );

    let entries = receiver.blacklist.entries.lock().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, relay);
    assert_eq!(entries[0].1, WRONG_MESSAGE_BLACKLIST_DURATION);

    sender.handler.close();
    receiver.handler.close();
}

/// A processor rejection also blacklists, and only once even with several
/// processors registered.
#[tokio::test]
async fn processor_rejection_blacklists_once() {
    let sender = node();
    let receiver = node();

    receiver
        .handler
        .register_message_processor("txs", "validating", Arc::new(RecordingProcessor::rejecting()))
        .unwrap();
    receiver
        .handler
        .register_message_processor("txs", "logging", Arc::new(RecordingProcessor::accepting()))
        .unwrap();

    sender.handler.broadcast("txs", b"bad tx".to_vec()).unwrap();
    let published = published_envelopes(&sender, 1).await;
    let (topic, raw) = &published[0];

    let relay = sender.signer.own_peer_id();
    assert!(
        !receiver
            .handler
            .handle_received_message(topic, raw, &relay)
            .await
    );
    assert_eq!(receiver.blacklist.entries.lock().unwrap().len(), 1);

    sender.handler.close();
    receiver.handler.close();
}
