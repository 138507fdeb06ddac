//! # Peer Discovery
//!
//! Kademlia-driven discovery keeps the routing table warm and the seeder
//! connections alive. Two working variants share one contract plus a nil
//! variant for networks that disable discovery entirely:
//!
//! | Variant | Strategy |
//! |---------|----------|
//! | [`ContinuousKadDhtDiscoverer`] | walk the initial peer list round-robin on every refresh tick |
//! | [`OptimizedKadDhtDiscoverer`] | periodic kad bootstrap plus a dedicated seeder-reconnection timer |
//! | [`NilDiscoverer`] | discovery disabled |
//!
//! `bootstrap` is idempotent-failing: the first call starts the discovery
//! task, every later call returns [`DiscoveryError::AlreadyStarted`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::config::{KadDhtConfig, KadDhtKind, MIN_REFRESH_INTERVAL};
use crate::protocols::{ConnectionsHost, KadDhtHandler, Reconnecter};
use crate::sharding::Sharder;

/// Seeder reconnection cadence while the kad handler has not yet
/// bootstrapped successfully.
pub const SEEDERS_RECONNECTION_FAST: Duration = Duration::from_secs(1);

/// Seeder reconnection cadence in steady state.
pub const SEEDERS_RECONNECTION_STEADY: Duration = Duration::from_secs(5);

/// Error kinds of the discovery subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryError {
    /// `bootstrap` was called on an already started discoverer.
    AlreadyStarted,
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryError::AlreadyStarted => write!(f, "discovery was already started"),
        }
    }
}

impl std::error::Error for DiscoveryError {}

/// The discovery contract: start once, force reconnects on demand.
#[async_trait]
pub trait PeerDiscoverer: Send + Sync {
    /// Start the discovery task. A second call fails with
    /// [`DiscoveryError::AlreadyStarted`].
    async fn bootstrap(&self) -> Result<()>;

    /// Force a reconnection pass outside the regular cadence.
    async fn reconnect_to_network(&self);

    fn name(&self) -> &'static str;

    /// Stop the discovery task. Idempotent.
    fn close(&self);
}

/// Adapter handing a discoverer to the connection monitor as a plain
/// [`Reconnecter`].
pub struct DiscovererReconnecter(pub Arc<dyn PeerDiscoverer>);

#[async_trait]
impl Reconnecter for DiscovererReconnecter {
    async fn reconnect_to_network(&self) {
        self.0.reconnect_to_network().await;
    }
}

fn take_started(flag: &AtomicBool) -> Result<()> {
    if flag
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        bail!(DiscoveryError::AlreadyStarted);
    }

    Ok(())
}

// ============================================================================
// Continuous variant
// ============================================================================

struct ContinuousInner {
    host: Arc<dyn ConnectionsHost>,
    initial_peer_list: Vec<String>,
    loop_stopped: AtomicBool,
}

impl ContinuousInner {
    /// Try peers starting at `index` until one dials successfully; every
    /// attempt advances the cursor so failures rotate through the list.
    async fn connect_one(&self, index: &mut usize) {
        if self.initial_peer_list.is_empty() {
            return;
        }

        for _ in 0..self.initial_peer_list.len() {
            let address = &self.initial_peer_list[*index % self.initial_peer_list.len()];
            *index = index.wrapping_add(1);

            match self.host.connect_to_peer(address).await {
                Ok(()) => {
                    trace!(%address, "connected to initial peer");
                    return;
                }
                Err(error) => {
                    debug!(%address, %error, "failed to connect to initial peer");
                }
            }
        }
    }
}

/// Discoverer that re-dials the initial peer list on a fixed cadence.
pub struct ContinuousKadDhtDiscoverer {
    inner: Arc<ContinuousInner>,
    refresh_interval: Duration,
    started: AtomicBool,
    cancel: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl ContinuousKadDhtDiscoverer {
    pub fn new(
        host: Arc<dyn ConnectionsHost>,
        initial_peer_list: Vec<String>,
        refresh_interval: Duration,
    ) -> Result<Self> {
        if refresh_interval < MIN_REFRESH_INTERVAL {
            bail!("peers refresh interval should be at least {MIN_REFRESH_INTERVAL:?}");
        }
        if initial_peer_list.is_empty() {
            warn!("discovery started with an empty initial peer list");
        }

        let (cancel, cancel_rx) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(ContinuousInner {
                host,
                initial_peer_list,
                loop_stopped: AtomicBool::new(false),
            }),
            refresh_interval,
            started: AtomicBool::new(false),
            cancel,
            cancel_rx,
        })
    }

    /// True once the discovery task has exited. Exposed for shutdown tests.
    pub fn loop_stopped(&self) -> bool {
        self.inner.loop_stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerDiscoverer for ContinuousKadDhtDiscoverer {
    async fn bootstrap(&self) -> Result<()> {
        take_started(&self.started)?;

        let inner = self.inner.clone();
        let refresh_interval = self.refresh_interval;
        let mut cancel_rx = self.cancel_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh_interval);
            let mut index = 0usize;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        inner.connect_one(&mut index).await;
                    }
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            inner.loop_stopped.store(true, Ordering::SeqCst);
        });

        Ok(())
    }

    async fn reconnect_to_network(&self) {
        let mut index = 0usize;
        self.inner.connect_one(&mut index).await;
    }

    fn name(&self) -> &'static str {
        "continuous kad-dht discovery"
    }

    fn close(&self) {
        let _ = self.cancel.send(true);
    }
}

// ============================================================================
// Optimized variant
// ============================================================================

/// Arguments for [`OptimizedKadDhtDiscoverer::new`].
pub struct OptimizedKadDhtArgs {
    pub host: Arc<dyn ConnectionsHost>,
    pub kad_handler: Arc<dyn KadDhtHandler>,
    pub sharder: Arc<dyn Sharder>,
    pub initial_peer_list: Vec<String>,
    /// Cadence of the kad routing walk.
    pub refresh_interval: Duration,
    /// Steady-state cadence of the seeder reconnection pass.
    pub seeders_reconnection_interval: Duration,
}

struct OptimizedInner {
    host: Arc<dyn ConnectionsHost>,
    kad_handler: Arc<dyn KadDhtHandler>,
    initial_peer_list: Vec<String>,
    loop_stopped: AtomicBool,
}

impl OptimizedInner {
    /// Returns true on success so the loop can relax the seeder cadence.
    async fn kad_bootstrap(&self) -> bool {
        match self.kad_handler.bootstrap().await {
            Ok(()) => true,
            Err(error) => {
                debug!(%error, "kad bootstrap failed, will retry");
                false
            }
        }
    }

    /// Dial every configured seeder. Transient failures are logged and the
    /// address is retried on the next pass.
    async fn reconnect_seeders(&self) {
        for address in &self.initial_peer_list {
            if let Err(error) = self.host.connect_to_peer(address).await {
                debug!(%address, %error, "failed to reconnect to seeder");
            }
        }
    }
}

/// Discoverer pairing periodic kad bootstraps with seeder keep-alive dials.
pub struct OptimizedKadDhtDiscoverer {
    inner: Arc<OptimizedInner>,
    refresh_interval: Duration,
    seeders_reconnection_interval: Duration,
    started: AtomicBool,
    force_tx: mpsc::Sender<()>,
    force_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
    cancel: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl OptimizedKadDhtDiscoverer {
    pub fn new(args: OptimizedKadDhtArgs) -> Result<Self> {
        if args.refresh_interval < MIN_REFRESH_INTERVAL {
            bail!("kad refresh interval should be at least {MIN_REFRESH_INTERVAL:?}");
        }
        if args.seeders_reconnection_interval.is_zero() {
            bail!("seeders reconnection interval should be positive");
        }
        if args.sharder.kind() == crate::config::SharderKind::NilListSharder {
            bail!("optimized kad discovery requires a kademlia-capable sharder");
        }

        let (force_tx, force_rx) = mpsc::channel(1);
        let (cancel, cancel_rx) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(OptimizedInner {
                host: args.host,
                kad_handler: args.kad_handler,
                initial_peer_list: args.initial_peer_list,
                loop_stopped: AtomicBool::new(false),
            }),
            refresh_interval: args.refresh_interval,
            seeders_reconnection_interval: args.seeders_reconnection_interval,
            started: AtomicBool::new(false),
            force_tx,
            force_rx: tokio::sync::Mutex::new(Some(force_rx)),
            cancel,
            cancel_rx,
        })
    }

    /// True once the discovery task has exited. Exposed for shutdown tests.
    pub fn loop_stopped(&self) -> bool {
        self.inner.loop_stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerDiscoverer for OptimizedKadDhtDiscoverer {
    async fn bootstrap(&self) -> Result<()> {
        take_started(&self.started)?;

        let mut force_rx = self
            .force_rx
            .lock()
            .await
            .take()
            .expect("force receiver is present until first bootstrap");

        let inner = self.inner.clone();
        let refresh_interval = self.refresh_interval;
        let steady_interval = self.seeders_reconnection_interval;
        let mut cancel_rx = self.cancel_rx.clone();
        tokio::spawn(async move {
            // Initial kad handler warm-up; failures fall back to the fast
            // seeder cadence until a later bootstrap succeeds.
            let mut bootstrapped = inner.kad_bootstrap().await;

            let mut kad_timer = tokio::time::interval(refresh_interval);
            // The warm-up above stands in for the interval's immediate tick.
            kad_timer.tick().await;
            let mut seeder_cadence = if bootstrapped {
                steady_interval
            } else {
                SEEDERS_RECONNECTION_FAST.min(steady_interval)
            };
            let mut seeder_timer = tokio::time::interval(seeder_cadence);
            seeder_timer.tick().await;

            loop {
                tokio::select! {
                    _ = kad_timer.tick() => {
                        bootstrapped = inner.kad_bootstrap().await || bootstrapped;
                    }
                    _ = seeder_timer.tick() => {
                        inner.reconnect_seeders().await;

                        let wanted = if bootstrapped {
                            steady_interval
                        } else {
                            SEEDERS_RECONNECTION_FAST.min(steady_interval)
                        };
                        if wanted != seeder_cadence {
                            seeder_cadence = wanted;
                            seeder_timer = tokio::time::interval(wanted);
                            // Skip the new interval's immediate first tick.
                            seeder_timer.tick().await;
                        }
                    }
                    request = force_rx.recv() => {
                        if request.is_none() {
                            break;
                        }
                        debug!("forcing an out-of-band kad bootstrap");
                        bootstrapped = inner.kad_bootstrap().await || bootstrapped;
                        inner.reconnect_seeders().await;
                    }
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            inner.loop_stopped.store(true, Ordering::SeqCst);
        });

        Ok(())
    }

    async fn reconnect_to_network(&self) {
        // Coalesce with any pending force request.
        let _ = self.force_tx.try_send(());
    }

    fn name(&self) -> &'static str {
        "optimized kad-dht discovery"
    }

    fn close(&self) {
        let _ = self.cancel.send(true);
    }
}

// ============================================================================
// Nil variant and factory
// ============================================================================

/// Discoverer used when discovery is disabled.
pub struct NilDiscoverer;

#[async_trait]
impl PeerDiscoverer for NilDiscoverer {
    async fn bootstrap(&self) -> Result<()> {
        Ok(())
    }

    async fn reconnect_to_network(&self) {}

    fn name(&self) -> &'static str {
        "no peer discovery"
    }

    fn close(&self) {}
}

/// Arguments for [`new_peer_discoverer`].
pub struct DiscovererFactoryArgs {
    pub config: KadDhtConfig,
    pub host: Arc<dyn ConnectionsHost>,
    pub sharder: Arc<dyn Sharder>,
    /// Required for the optimized variant.
    pub kad_handler: Option<Arc<dyn KadDhtHandler>>,
}

/// Instantiate the discoverer variant the configuration names.
pub fn new_peer_discoverer(args: DiscovererFactoryArgs) -> Result<Arc<dyn PeerDiscoverer>> {
    args.config.validate()?;

    if !args.config.enabled {
        return Ok(Arc::new(NilDiscoverer));
    }

    match args.config.kind {
        KadDhtKind::Legacy => Ok(Arc::new(ContinuousKadDhtDiscoverer::new(
            args.host,
            args.config.initial_peer_list.clone(),
            args.config.refresh_interval(),
        )?)),
        KadDhtKind::Optimized => {
            let Some(kad_handler) = args.kad_handler else {
                bail!("optimized kad discovery requires a kad handler");
            };
            Ok(Arc::new(OptimizedKadDhtDiscoverer::new(
                OptimizedKadDhtArgs {
                    host: args.host,
                    kad_handler,
                    sharder: args.sharder,
                    initial_peer_list: args.config.initial_peer_list.clone(),
                    refresh_interval: args.config.refresh_interval(),
                    seeders_reconnection_interval: SEEDERS_RECONNECTION_STEADY,
                },
            )?))
        }
    }
}
