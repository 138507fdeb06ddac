//! # Connections Watcher
//!
//! Purely informational observer of newly seen connections. The `print`
//! variant logs each `(peer, multiaddress)` pair at most once per TTL so the
//! log stays readable on churny networks; the `disabled` variant (and the
//! unset config value) swallows everything.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::config::{ConnectionWatcherConfig, ConnectionWatcherKind};
use crate::peer::PeerId;
use crate::timecache::TimeCache;

/// Records observed new connections. Implementations must tolerate repeated
/// observations of the same peer.
pub trait ConnectionsWatcher: Send + Sync {
    fn new_known_connection(&self, pid: &PeerId, address: &str);

    /// Stop any background work. Idempotent.
    fn close(&self);
}

/// Watcher that does nothing.
pub struct DisabledConnectionsWatcher;

impl ConnectionsWatcher for DisabledConnectionsWatcher {
    fn new_known_connection(&self, _pid: &PeerId, _address: &str) {}

    fn close(&self) {}
}

/// Watcher that logs each connection once per TTL.
pub struct PrintConnectionsWatcher {
    seen: TimeCache,
}

impl PrintConnectionsWatcher {
    pub fn new(time_to_live: Duration) -> Self {
        Self {
            seen: TimeCache::new(time_to_live),
        }
    }

    /// True once the internal sweep task has exited. Exposed for shutdown tests.
    pub fn sweeper_stopped(&self) -> bool {
        self.seen.sweeper_stopped()
    }
}

impl ConnectionsWatcher for PrintConnectionsWatcher {
    fn new_known_connection(&self, pid: &PeerId, address: &str) {
        let key = pid.pretty();
        if self.seen.has(&key) {
            return;
        }
        self.seen.add(&key);

        info!(peer = %pid, %address, "new known connection");
    }

    fn close(&self) {
        self.seen.close();
    }
}

/// Instantiate the watcher variant the configuration names.
pub fn new_connections_watcher(
    config: &ConnectionWatcherConfig,
) -> Result<Arc<dyn ConnectionsWatcher>> {
    config.validate()?;

    match config.kind {
        ConnectionWatcherKind::Print => {
            Ok(Arc::new(PrintConnectionsWatcher::new(config.time_to_live)))
        }
        ConnectionWatcherKind::Disabled | ConnectionWatcherKind::Empty => {
            Ok(Arc::new(DisabledConnectionsWatcher))
        }
    }
}
