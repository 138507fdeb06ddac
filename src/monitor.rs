//! # Connection Monitor
//!
//! Observes connect/disconnect events from the host, keeps the peer set
//! inside the sharder's capacities, sweeps denied peers, and drives the
//! reconnect-to-network machinery when connectivity drops below threshold.
//!
//! ## Event Handling
//!
//! `handle_connected` closes denied peers on the spot, records the connection
//! with the watcher and the preferred-peers holder, then applies the
//! sharder's eviction list. `handle_disconnected` signals the reconnect
//! channel when the peer count falls under the configured threshold; the
//! signal is non-blocking, so event delivery never stalls on the monitor
//! loop.
//!
//! ## The Loop
//!
//! A single task owns three timers and the reconnect signal: a one-second
//! sweep closing peers that became denied after connecting, the reconnect
//! request itself (gated by a flag), and the five-second rearm timer that
//! spaces reconnect attempts apart.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::peer::PeerId;
use crate::protocols::{
    ConnectionsHost, DisabledPeerDenialEvaluator, PeerDenialEvaluator, PreferredPeersHolder,
    Reconnecter,
};
use crate::sharding::Sharder;
use crate::watcher::ConnectionsWatcher;

/// Cadence of the denied-peer sweep.
pub const DURATION_CHECK_CONNECTIONS: Duration = Duration::from_secs(1);

/// Minimum spacing between reconnect-to-network attempts.
pub const DURATION_BETWEEN_RECONNECT_ATTEMPTS: Duration = Duration::from_secs(5);

/// Arguments for [`ConnectionMonitor::new`].
pub struct ConnectionMonitorArgs {
    pub host: Arc<dyn ConnectionsHost>,
    pub sharder: Arc<dyn Sharder>,
    pub preferred_peers: Arc<dyn PreferredPeersHolder>,
    pub connections_watcher: Arc<dyn ConnectionsWatcher>,
    pub reconnecters: Vec<Arc<dyn Reconnecter>>,
    pub threshold_min_connected_peers: usize,
}

struct MonitorInner {
    host: Arc<dyn ConnectionsHost>,
    sharder: Arc<dyn Sharder>,
    preferred_peers: Arc<dyn PreferredPeersHolder>,
    connections_watcher: Arc<dyn ConnectionsWatcher>,
    reconnecters: Vec<Arc<dyn Reconnecter>>,
    threshold_min_connected_peers: AtomicUsize,
    denial_evaluator: RwLock<Arc<dyn PeerDenialEvaluator>>,
    reconnect_tx: mpsc::Sender<()>,
    loop_stopped: AtomicBool,
}

impl MonitorInner {
    fn current_denial_evaluator(&self) -> Arc<dyn PeerDenialEvaluator> {
        self.denial_evaluator
            .read()
            .expect("denial evaluator lock poisoned")
            .clone()
    }

    /// Sweep the live peer set, closing anyone the evaluator now denies.
    async fn check_connections(&self) {
        let evaluator = self.current_denial_evaluator();
        for pid in self.host.peers() {
            if evaluator.is_denied(&pid) {
                trace!(peer = %pid, "dropping connection to denied peer");
                let _ = self.host.close_peer(&pid).await;
            }
        }
    }

    async fn reconnect_to_network(&self) {
        for reconnecter in &self.reconnecters {
            reconnecter.reconnect_to_network().await;
        }
    }
}

/// Watches the connection set. Construction registers nothing by itself: the
/// host library is expected to route its notifications into
/// [`ConnectionMonitor::handle_connected`] / [`handle_disconnected`](ConnectionMonitor::handle_disconnected).
pub struct ConnectionMonitor {
    inner: Arc<MonitorInner>,
    cancel: watch::Sender<bool>,
}

impl ConnectionMonitor {
    pub fn new(args: ConnectionMonitorArgs) -> Self {
        // Capacity one: coalescing queued reconnect requests is the point.
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let (cancel, cancel_rx) = watch::channel(false);

        let inner = Arc::new(MonitorInner {
            host: args.host,
            sharder: args.sharder,
            preferred_peers: args.preferred_peers,
            connections_watcher: args.connections_watcher,
            reconnecters: args.reconnecters,
            threshold_min_connected_peers: AtomicUsize::new(args.threshold_min_connected_peers),
            denial_evaluator: RwLock::new(Arc::new(DisabledPeerDenialEvaluator)),
            reconnect_tx,
            loop_stopped: AtomicBool::new(false),
        });

        tokio::spawn(process_loop(inner.clone(), reconnect_rx, cancel_rx));

        Self { inner, cancel }
    }

    /// Called by the host when a connection opens.
    pub async fn handle_connected(&self, pid: &PeerId, address: &str) {
        let evaluator = self.inner.current_denial_evaluator();
        if evaluator.is_denied(pid) {
            trace!(peer = %pid, "refusing connection from denied peer");
            let _ = self.inner.host.close_peer(pid).await;
            return;
        }

        self.inner.connections_watcher.new_known_connection(pid, address);
        self.inner.preferred_peers.put_connection_address(pid, address);

        let all_peers = self.inner.host.peers();
        let evicted = self.inner.sharder.compute_eviction_list(&all_peers);
        for evicted_pid in &evicted {
            let _ = self.inner.host.close_peer(evicted_pid).await;
        }
    }

    /// Called by the host when a connection closes.
    pub async fn handle_disconnected(&self, pid: &PeerId) {
        self.inner.preferred_peers.remove(pid);
        self.do_reconnection_if_needed();
    }

    fn do_reconnection_if_needed(&self) {
        if !self.is_connected_to_the_network() {
            // A full channel means a request is already pending; drop ours.
            let _ = self.inner.reconnect_tx.try_send(());
        }
    }

    pub fn is_connected_to_the_network(&self) -> bool {
        self.inner.host.peers().len() >= self.threshold_min_connected_peers()
    }

    pub fn threshold_min_connected_peers(&self) -> usize {
        self.inner.threshold_min_connected_peers.load(Ordering::SeqCst)
    }

    /// Update the connectivity threshold, possibly triggering a reconnect.
    pub fn set_threshold_min_connected_peers(&self, threshold: usize) {
        self.inner
            .threshold_min_connected_peers
            .store(threshold, Ordering::SeqCst);
        self.do_reconnection_if_needed();
    }

    /// Swap the denial evaluator. Takes effect on the next event or sweep.
    pub fn set_peer_denial_evaluator(&self, evaluator: Arc<dyn PeerDenialEvaluator>) {
        let mut current = self
            .inner
            .denial_evaluator
            .write()
            .expect("denial evaluator lock poisoned");
        *current = evaluator;
    }

    /// Stop the monitor loop. Idempotent.
    pub fn close(&self) {
        let _ = self.cancel.send(true);
    }

    /// True once the loop task has exited. Exposed for shutdown tests.
    pub fn loop_stopped(&self) -> bool {
        self.inner.loop_stopped.load(Ordering::SeqCst)
    }
}

async fn process_loop(
    inner: Arc<MonitorInner>,
    mut reconnect_rx: mpsc::Receiver<()>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let mut check_timer = tokio::time::interval(DURATION_CHECK_CONNECTIONS);
    let mut rearm_timer = tokio::time::interval(DURATION_BETWEEN_RECONNECT_ATTEMPTS);
    // An interval's first tick completes immediately; consume both so the
    // first sweep and rearm happen one full period after construction.
    check_timer.tick().await;
    rearm_timer.tick().await;
    let mut can_reconnect = true;

    loop {
        tokio::select! {
            _ = check_timer.tick() => {
                inner.check_connections().await;
            }
            request = reconnect_rx.recv() => {
                if request.is_none() {
                    break;
                }
                if !can_reconnect {
                    debug!("too early for a new reconnect to network attempt");
                    continue;
                }

                debug!("reconnecting to network");
                inner.reconnect_to_network().await;
                rearm_timer.reset();
                can_reconnect = false;
            }
            _ = rearm_timer.tick() => {
                can_reconnect = true;
            }
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
        }
    }

    debug!("closing the connection monitor main loop");
    inner.loop_stopped.store(true, Ordering::SeqCst);
}
