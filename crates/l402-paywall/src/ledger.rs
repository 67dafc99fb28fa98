//! Free-tier usage counters, per identity per fixed window.

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    count: u32,
    window_start: Instant,
}

/// Per-identity fixed-window counters.
///
/// `try_consume` runs its check-and-increment under the map's per-key entry
/// guard, so two concurrent requests can never both take the last slot.
#[derive(Debug, Default)]
pub struct RateLedger {
    entries: DashMap<String, WindowEntry>,
}

impl RateLedger {
    pub fn new() -> Self {
        RateLedger::default()
    }

    /// Consumes one unit of allowance for `key` if any remains in the current
    /// window. An elapsed window resets the counter. A zero limit always
    /// denies.
    pub fn try_consume(&self, key: &str, limit: u32, window: Duration) -> bool {
        if limit == 0 {
            return false;
        }
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry {
                count: 0,
                window_start: Instant::now(),
            });
        if entry.window_start.elapsed() > window {
            entry.count = 0;
            entry.window_start = Instant::now();
        }
        if entry.count < limit {
            entry.count += 1;
            true
        } else {
            false
        }
    }

    /// Drops entries whose window has elapsed.
    pub fn purge_expired(&self, window: Duration) {
        self.entries
            .retain(|_, entry| entry.window_start.elapsed() <= window);
    }

    pub fn tracked_identities(&self) -> usize {
        self.entries.len()
    }
}
