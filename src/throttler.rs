//! Bounded in-flight counter gating inbound message processing. When the
//! bound is hit the caller rejects the message instead of queueing it, so the
//! gossip layer stops relaying on our behalf under load.

use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{bail, Result};

/// Counting gate for concurrent message processing.
pub struct NumMessagesThrottler {
    max: u32,
    in_flight: AtomicU32,
}

impl NumMessagesThrottler {
    pub fn new(max: u32) -> Result<Self> {
        if max < 1 {
            bail!("throttler bound should be at least 1");
        }

        Ok(Self {
            max,
            in_flight: AtomicU32::new(0),
        })
    }

    /// True while a free slot exists. Advisory: pair with `start_processing`.
    pub fn can_process(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) < self.max
    }

    pub fn start_processing(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_processing(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_rejects_zero_bound() {
        assert!(NumMessagesThrottler::new(0).is_err());
        assert!(NumMessagesThrottler::new(1).is_ok());
    }

    #[test]
    fn slots_fill_and_free() {
        let throttler = NumMessagesThrottler::new(2).unwrap();

        assert!(throttler.can_process());
        throttler.start_processing();
        assert!(throttler.can_process());
        throttler.start_processing();
        assert!(!throttler.can_process());

        throttler.end_processing();
        assert!(throttler.can_process());
        assert_eq!(throttler.in_flight(), 1);
    }
}
