//! Low-cardinality id trackers for operational visibility.
//!
//! Two instances exist in the daemon: one for datacenters game servers
//! have reported from, one for datacenter ids we could not resolve
//! against the directory. Unknown ids are tracked, not rejected, so an
//! operator can spot a missing directory row before a buyer complains.
//! A single mutex is plenty at this write rate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::maps::unix_time;

/// A set of ids with last-seen timestamps.
#[derive(Debug, Default)]
pub struct IdTracker {
    ids: Mutex<HashMap<u64, u64>>,
}

impl IdTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an id, refreshing its last-seen time.
    pub fn add(&self, id: u64) {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.insert(id, unix_time());
    }

    pub fn len(&self) -> usize {
        let ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All tracked ids as sorted, zero-padded hex strings.
    pub fn get_all(&self) -> Vec<String> {
        let ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        let mut sorted: Vec<u64> = ids.keys().copied().collect();
        sorted.sort_unstable();
        sorted.into_iter().map(|id| format!("{id:016x}")).collect()
    }

    /// Delete up to `budget` ids not seen for `timeout_seconds`.
    pub fn sweep(&self, now: u64, timeout_seconds: u64, budget: usize) -> usize {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());

        let expired: Vec<u64> = ids
            .iter()
            .filter(|(_, seen)| now.saturating_sub(**seen) >= timeout_seconds)
            .map(|(id, _)| *id)
            .take(budget)
            .collect();

        for id in &expired {
            ids.remove(id);
        }
        expired.len()
    }

    /// Background eviction loop, one bounded sweep per tick.
    pub async fn timeout_loop(
        self: Arc<Self>,
        timeout_seconds: u64,
        tick: Duration,
        budget: usize,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    return;
                }

                _ = interval.tick() => {
                    self.sweep(unix_time(), timeout_seconds, budget);
                }
            }
        }
    }
}
