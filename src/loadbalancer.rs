//! # Outgoing Channel Load Balancer
//!
//! Named FIFO queues for outbound messages, drained by a single consumer task
//! in strict round-robin: one item per channel per cycle, empty channels
//! skipped. Drained items land in one bounded output channel that the
//! messages handler's publish routine pulls from, so exactly one publish per
//! queued item is ever in flight.
//!
//! A `default` channel always exists and cannot be removed. Producers either
//! block until their item is queued (blocking sends) or get a backpressure
//! error when the channel is full (non-blocking sends).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, bail, Result};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tracing::debug;

use crate::message::{SendableData, DEFAULT_CHANNEL};

/// Default bound of every outbound queue, in queued items.
pub const DEFAULT_MAX_SEND_BUFF_SIZE: usize = 1024;

enum LbCommand {
    Add(String, mpsc::Receiver<SendableData>, oneshot::Sender<()>),
    Remove(String, oneshot::Sender<()>),
}

/// Round-robin fan-in over named outbound channels.
pub struct OutgoingChannelLoadBalancer {
    buff_size: usize,
    senders: RwLock<HashMap<String, mpsc::Sender<SendableData>>>,
    cmd_tx: mpsc::Sender<LbCommand>,
    main_rx: Mutex<mpsc::Receiver<SendableData>>,
    notify: Arc<Notify>,
    cancel: watch::Sender<bool>,
    loop_stopped: Arc<AtomicBool>,
}

impl OutgoingChannelLoadBalancer {
    pub fn new(buff_size: usize) -> Result<Self> {
        if buff_size < 1 {
            bail!("send buffer size should be at least 1");
        }

        let (default_tx, default_rx) = mpsc::channel(buff_size);
        let (main_tx, main_rx) = mpsc::channel(buff_size);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (cancel, cancel_rx) = watch::channel(false);
        let notify = Arc::new(Notify::new());
        let loop_stopped = Arc::new(AtomicBool::new(false));

        let mut senders = HashMap::new();
        senders.insert(DEFAULT_CHANNEL.to_string(), default_tx);

        tokio::spawn(consumer_loop(
            vec![(DEFAULT_CHANNEL.to_string(), default_rx)],
            main_tx,
            cmd_rx,
            notify.clone(),
            cancel_rx,
            loop_stopped.clone(),
        ));

        Ok(Self {
            buff_size,
            senders: RwLock::new(senders),
            cmd_tx,
            main_rx: Mutex::new(main_rx),
            notify,
            cancel,
            loop_stopped,
        })
    }

    /// Register a new named channel. The default channel cannot be shadowed
    /// and a name can only be added once.
    pub async fn add_channel(&self, name: &str) -> Result<()> {
        if name == DEFAULT_CHANNEL {
            bail!("the default channel always exists");
        }

        let rx = {
            let mut senders = self.senders.write().expect("senders lock poisoned");
            if senders.contains_key(name) {
                bail!("channel {name} already exists");
            }
            let (tx, rx) = mpsc::channel(self.buff_size);
            senders.insert(name.to_string(), tx);
            rx
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(LbCommand::Add(name.to_string(), rx, ack_tx))
            .await
            .map_err(|_| anyhow!("load balancer is closed"))?;
        ack_rx.await.map_err(|_| anyhow!("load balancer is closed"))
    }

    /// Remove a named channel; queued items not yet drained are discarded.
    pub async fn remove_channel(&self, name: &str) -> Result<()> {
        if name == DEFAULT_CHANNEL {
            bail!("the default channel cannot be removed");
        }

        {
            let mut senders = self.senders.write().expect("senders lock poisoned");
            if senders.remove(name).is_none() {
                bail!("channel {name} does not exist");
            }
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(LbCommand::Remove(name.to_string(), ack_tx))
            .await
            .map_err(|_| anyhow!("load balancer is closed"))?;
        ack_rx.await.map_err(|_| anyhow!("load balancer is closed"))
    }

    fn channel_or_default(&self, name: &str) -> mpsc::Sender<SendableData> {
        let senders = self.senders.read().expect("senders lock poisoned");
        senders
            .get(name)
            .or_else(|| senders.get(DEFAULT_CHANNEL))
            .expect("default channel always exists")
            .clone()
    }

    /// Queue an item, waiting for space. Unknown channels fall back to the
    /// default channel.
    pub async fn send_on_channel(&self, channel: &str, data: SendableData) -> Result<()> {
        let tx = self.channel_or_default(channel);
        tx.send(data)
            .await
            .map_err(|_| anyhow!("load balancer is closed"))?;
        self.notify.notify_one();

        Ok(())
    }

    /// Queue an item without waiting; a full channel is a backpressure error
    /// and the item is dropped.
    pub fn try_send_on_channel(&self, channel: &str, data: SendableData) -> Result<()> {
        let tx = self.channel_or_default(channel);
        match tx.try_send(data) {
            Ok(()) => {
                self.notify.notify_one();
                Ok(())
            }
            Err(TrySendError::Full(_)) => bail!("outbound channel {channel} is full"),
            Err(TrySendError::Closed(_)) => bail!("load balancer is closed"),
        }
    }

    /// Pull the next drained item. Returns `None` once the balancer is closed
    /// and the output queue ran dry.
    pub async fn collect_one_element(&self) -> Option<SendableData> {
        self.main_rx.lock().await.recv().await
    }

    /// Stop the consumer task. Idempotent; queued items are discarded.
    pub fn close(&self) {
        let _ = self.cancel.send(true);
    }

    /// True once the consumer task has exited. Exposed for shutdown tests.
    pub fn loop_stopped(&self) -> bool {
        self.loop_stopped.load(Ordering::SeqCst)
    }
}

async fn consumer_loop(
    mut channels: Vec<(String, mpsc::Receiver<SendableData>)>,
    main_tx: mpsc::Sender<SendableData>,
    mut cmd_rx: mpsc::Receiver<LbCommand>,
    notify: Arc<Notify>,
    mut cancel_rx: watch::Receiver<bool>,
    loop_stopped: Arc<AtomicBool>,
) {
    'outer: loop {
        tokio::select! {
            _ = notify.notified() => {
                if drain_round_robin(&mut channels, &main_tx, &mut cancel_rx)
                    .await
                    .is_err()
                {
                    break 'outer;
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(LbCommand::Add(name, rx, ack)) => {
                        channels.push((name, rx));
                        let _ = ack.send(());
                    }
                    Some(LbCommand::Remove(name, ack)) => {
                        channels.retain(|(n, _)| *n != name);
                        let _ = ack.send(());
                    }
                    None => break 'outer,
                }
            }
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break 'outer;
                }
            }
        }
    }

    debug!("closing the load balancer consumer loop");
    loop_stopped.store(true, Ordering::SeqCst);
}

/// One item per channel per cycle until every channel reads empty. A close
/// signal aborts even a drain blocked on a full output queue.
async fn drain_round_robin(
    channels: &mut [(String, mpsc::Receiver<SendableData>)],
    main_tx: &mpsc::Sender<SendableData>,
    cancel_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let mut drained_any = false;
        for (_, rx) in channels.iter_mut() {
            match rx.try_recv() {
                Ok(item) => {
                    drained_any = true;
                    tokio::select! {
                        sent = main_tx.send(item) => {
                            sent.map_err(|_| anyhow!("output channel closed"))?;
                        }
                        changed = cancel_rx.changed() => {
                            if changed.is_err() || *cancel_rx.borrow() {
                                bail!("load balancer closed during drain");
                            }
                        }
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }
        }

        if !drained_any {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(topic: &str, tag: u8) -> SendableData {
        SendableData::new(topic, vec![tag])
    }

    #[tokio::test]
    async fn default_channel_exists_and_is_protected() {
        let lb = OutgoingChannelLoadBalancer::new(8).unwrap();

        assert!(lb.add_channel(DEFAULT_CHANNEL).await.is_err());
        assert!(lb.remove_channel(DEFAULT_CHANNEL).await.is_err());

        lb.close();
    }

    #[tokio::test]
    async fn add_and_remove_channels() {
        let lb = OutgoingChannelLoadBalancer::new(8).unwrap();

        lb.add_channel("headers").await.unwrap();
        assert!(lb.add_channel("headers").await.is_err());

        lb.remove_channel("headers").await.unwrap();
        assert!(lb.remove_channel("headers").await.is_err());

        lb.close();
    }

    #[tokio::test]
    async fn unknown_channel_falls_back_to_default() {
        let lb = OutgoingChannelLoadBalancer::new(8).unwrap();

        lb.send_on_channel("no-such-channel", item("topic", 1))
            .await
            .unwrap();
        let collected = lb.collect_one_element().await.unwrap();
        assert_eq!(collected.buf, vec![1]);

        lb.close();
    }

    #[tokio::test]
    async fn round_robin_drains_one_item_per_channel_per_cycle() {
        let lb = OutgoingChannelLoadBalancer::new(16).unwrap();
        lb.add_channel("a").await.unwrap();
        lb.add_channel("b").await.unwrap();
        lb.add_channel("c").await.unwrap();

        // Queue everything before the consumer gets a chance to drain.
        for round in 0..3u8 {
            for channel in ["a", "b", "c"] {
                lb.try_send_on_channel(channel, item(channel, round)).unwrap();
            }
        }

        let mut order = Vec::new();
        for _ in 0..9 {
            let data = lb.collect_one_element().await.unwrap();
            order.push((data.topic.clone(), data.buf[0]));
        }

        let expected: Vec<(String, u8)> = (0..3u8)
            .flat_map(|round| {
                ["a", "b", "c"]
                    .into_iter()
                    .map(move |ch| (ch.to_string(), round))
            })
            .collect();
        assert_eq!(order, expected);

        lb.close();
    }

    #[tokio::test]
    async fn try_send_reports_backpressure_when_full() {
        let lb = OutgoingChannelLoadBalancer::new(1).unwrap();
        lb.add_channel("busy").await.unwrap();

        // Fill the single slot, and possibly the output queue, without
        // letting the consumer run.
        lb.try_send_on_channel("busy", item("busy", 0)).unwrap();
        let mut saw_full = false;
        for tag in 1..8u8 {
            if lb.try_send_on_channel("busy", item("busy", tag)).is_err() {
                saw_full = true;
                break;
            }
        }
        assert!(saw_full, "expected a backpressure error");

        lb.close();
    }

    #[tokio::test]
    async fn close_stops_consumer_and_collect_returns_none() {
        let lb = OutgoingChannelLoadBalancer::new(4).unwrap();
        assert!(!lb.loop_stopped());

        lb.close();
        lb.close();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(lb.loop_stopped());
        assert!(lb.collect_one_element().await.is_none());
    }
}
