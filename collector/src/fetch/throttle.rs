//! Proactive request spacing
//!
//! Some vendors publish a per-second budget that is cheaper to respect than
//! to discover through 429s. [`MinInterval`] hands out request slots at
//! least `interval` apart, shared across every task using the same fetcher.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Minimum spacing between consecutive requests
#[derive(Debug)]
pub struct MinInterval {
    interval: Duration,
    /// Earliest instant the next request may start
    next_slot: Mutex<Option<Instant>>,
}

impl MinInterval {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Reserve the next slot and sleep until it arrives
    ///
    /// Returns how long the caller slept.
    pub async fn wait(&self) -> Duration {
        let delay = self.reserve(Instant::now());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        delay
    }

    fn reserve(&self, now: Instant) -> Duration {
        let mut next = self.next_slot.lock();
        let start = match *next {
            Some(slot) if slot > now => slot,
            _ => now,
        };
        *next = Some(start + self.interval);
        start - now
    }
}
