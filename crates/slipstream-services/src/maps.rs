//! Sharded concurrent maps for per-session, per-server and per-relay state.
//!
//! The packet path hits these maps once or twice per datagram, so each
//! map is split into a fixed number of shards and every operation locks
//! exactly one shard. Eviction is amortized: a background sweep deletes
//! a small budget of expired entries per tick instead of stopping the
//! world. Cross-shard reads (`len`, `get_all`) are eventually consistent
//! snapshots, never transactions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;

use slipstream_core::crypto;
use slipstream_core::wire::SdkVersion;

use crate::locate::Location;

// Shard counts are sized for expected key cardinality and contention.
pub const SESSION_MAP_SHARDS: usize = 4096;
pub const SERVER_MAP_SHARDS: usize = 100_000;
pub const VETO_MAP_SHARDS: usize = 1000;
pub const RELAY_MAP_SHARDS: usize = 10;

/// Current unix time in seconds.
pub fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Map values that the sweeper can age out.
pub trait Expiring {
    fn last_update(&self) -> u64;
}

// ── Entries ───────────────────────────────────────────────────────────────────

/// Server-side state for one client session, keyed by session id.
///
/// The authoritative per-slice state rides in the client's session data
/// blob; this entry holds what the blob cannot carry back to us: the
/// client's location, loss/out-of-order baselines, the cached response
/// for retry replay, and running totals for the end-of-session summary.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEntry {
    pub session_id: u64,
    pub buyer_id: u64,
    pub user_hash: u64,
    pub datacenter_id: u64,
    pub sdk_version: SdkVersion,
    pub client_address: SocketAddr,
    pub server_address: SocketAddr,

    /// Route revision counter, bumped on every new token set.
    pub session_version: u8,
    /// Relay ids of the committed route, empty when direct.
    pub route_relays: Vec<u64>,
    /// Predicted cost of the committed route, 0 when direct.
    pub route_cost: i32,
    /// Relay names of the committed route, for portal reporting.
    pub route_relay_names: Vec<String>,
    /// Near relays picked at session start, echoed in every response.
    pub near_relay_ids: Vec<u64>,

    /// The only slice number the next update may carry.
    pub expected_slice: u32,
    /// Framed response bytes of the previously answered slice.
    pub cached_response: Vec<u8>,
    pub cached_response_slice: u32,

    pub location: Location,

    // Sticky flags, set once and never cleared.
    pub ever_on_next: bool,
    pub fell_back_to_direct: bool,

    // Session totals for the summary written at eviction.
    pub envelope_bytes_up_sum: u64,
    pub envelope_bytes_down_sum: u64,
    pub duration_on_next: u32,
    pub session_events: u64,

    // Counter baselines; deltas are computed against these each slice.
    pub packets_sent_client_to_server: u64,
    pub packets_sent_server_to_client: u64,
    pub packets_lost_client_to_server: u64,
    pub packets_lost_server_to_client: u64,
    pub packets_out_of_order_client_to_server: u64,
    pub packets_out_of_order_server_to_client: u64,

    pub start_timestamp: u64,
    pub last_update: u64,
}

impl Expiring for SessionEntry {
    fn last_update(&self) -> u64 {
        self.last_update
    }
}

/// State for one game server, keyed by `server_key(address)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEntry {
    pub server_address: SocketAddr,
    pub buyer_id: u64,
    pub datacenter_id: u64,
    pub sdk_version: SdkVersion,
    pub num_sessions: u32,
    pub init_timestamp: u64,
    pub last_update: u64,
}

impl Expiring for ServerEntry {
    fn last_update(&self) -> u64 {
        self.last_update
    }
}

/// A relay currently present in the route matrix, keyed by relay id.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayEntry {
    pub relay_id: u64,
    pub name: String,
    pub address: SocketAddr,
    pub last_update: u64,
}

impl Expiring for RelayEntry {
    fn last_update(&self) -> u64 {
        self.last_update
    }
}

/// Map key for a server entry.
pub fn server_key(address: &SocketAddr) -> u64 {
    crypto::fnv1a(&[address.to_string().as_bytes()])
}

// ── ShardedMap ────────────────────────────────────────────────────────────────

/// Fixed-shard concurrent map with amortized timeout eviction.
///
/// Keys are expected to already be well distributed (random session
/// ids, fnv hashes of names or addresses), so the shard index is just
/// `key % shard_count`.
#[derive(Debug)]
pub struct ShardedMap<V> {
    shards: Vec<RwLock<HashMap<u64, V>>>,
    len: AtomicU64,
}

impl<V> ShardedMap<V> {
    pub fn new(shard_count: usize) -> Self {
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(RwLock::new(HashMap::new()));
        }
        Self {
            shards,
            len: AtomicU64::new(0),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, key: u64) -> &RwLock<HashMap<u64, V>> {
        &self.shards[(key % self.shards.len() as u64) as usize]
    }

    /// Upsert. The entry count is incremented only on first insert, and
    /// the existence check runs under the shard's write lock so the
    /// count can never double-increment.
    pub fn update(&self, key: u64, value: V) {
        let mut shard = self.shard(key).write().unwrap_or_else(|e| e.into_inner());
        if shard.insert(key, value).is_none() {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get(&self, key: u64) -> Option<V>
    where
        V: Clone,
    {
        let shard = self.shard(key).read().unwrap_or_else(|e| e.into_inner());
        shard.get(&key).cloned()
    }

    pub fn contains(&self, key: u64) -> bool {
        let shard = self.shard(key).read().unwrap_or_else(|e| e.into_inner());
        shard.contains_key(&key)
    }

    pub fn remove(&self, key: u64) -> Option<V> {
        let mut shard = self.shard(key).write().unwrap_or_else(|e| e.into_inner());
        let removed = shard.remove(&key);
        if removed.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Live entry count. Exact once no operations are in flight.
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every entry, shard by shard. The view is eventually
    /// consistent: entries may move underneath between shards.
    pub fn for_each(&self, mut f: impl FnMut(u64, &V)) {
        for shard in &self.shards {
            let shard = shard.read().unwrap_or_else(|e| e.into_inner());
            for (key, value) in shard.iter() {
                f(*key, value);
            }
        }
    }

    /// Clone out all entries. Same consistency caveats as `for_each`.
    pub fn get_all(&self) -> Vec<(u64, V)>
    where
        V: Clone,
    {
        let mut out = Vec::with_capacity(self.len() as usize);
        self.for_each(|key, value| out.push((key, value.clone())));
        out
    }
}

impl<V: Expiring> ShardedMap<V> {
    /// Delete up to `budget` expired entries from one shard. Returns the
    /// evicted entries so the caller can run cleanup outside the lock.
    pub fn sweep_shard(
        &self,
        shard_index: usize,
        now: u64,
        timeout_seconds: u64,
        budget: usize,
    ) -> Vec<(u64, V)> {
        let mut shard = self.shards[shard_index]
            .write()
            .unwrap_or_else(|e| e.into_inner());

        let mut expired = Vec::new();
        for (key, value) in shard.iter() {
            if now.saturating_sub(value.last_update()) >= timeout_seconds {
                expired.push(*key);
                if expired.len() >= budget {
                    break;
                }
            }
        }

        let mut evicted = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(value) = shard.remove(&key) {
                self.len.fetch_sub(1, Ordering::Relaxed);
                evicted.push((key, value));
            }
        }
        evicted
    }

    /// Sweep every shard with a per-shard deletion budget.
    pub fn sweep_all(&self, now: u64, timeout_seconds: u64, per_shard_budget: usize) -> Vec<(u64, V)> {
        let mut evicted = Vec::new();
        for index in 0..self.shards.len() {
            evicted.extend(self.sweep_shard(index, now, timeout_seconds, per_shard_budget));
        }
        evicted
    }
}

/// How much of the map one sweep tick covers.
#[derive(Debug, Clone, Copy)]
pub enum Sweep {
    /// Scan every shard, deleting at most this many entries per shard.
    AllShards { per_shard_budget: usize },
    /// Scan a single shard per tick (round robin) with this budget.
    OneShardPerTick { budget: usize },
}

impl<V: Expiring + Send + Sync + 'static> ShardedMap<V> {
    /// Background eviction loop. Each evicted entry is handed to
    /// `cleanup` after the shard lock is released.
    pub async fn timeout_loop(
        self: Arc<Self>,
        timeout_seconds: u64,
        tick: Duration,
        sweep: Sweep,
        mut shutdown: broadcast::Receiver<()>,
        cleanup: impl Fn(u64, V) + Send + 'static,
    ) {
        let mut interval = tokio::time::interval(tick);
        let mut cursor = 0usize;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    return;
                }

                _ = interval.tick() => {
                    let now = unix_time();
                    let evicted = match sweep {
                        Sweep::AllShards { per_shard_budget } => {
                            self.sweep_all(now, timeout_seconds, per_shard_budget)
                        }
                        Sweep::OneShardPerTick { budget } => {
                            let evicted = self.sweep_shard(cursor, now, timeout_seconds, budget);
                            cursor = (cursor + 1) % self.shard_count();
                            evicted
                        }
                    };
                    for (key, value) in evicted {
                        cleanup(key, value);
                    }
                }
            }
        }
    }
}

// ── Per-buyer session counts ──────────────────────────────────────────────────

/// Live session count per buyer, fed by session insert and eviction.
#[derive(Debug, Default)]
pub struct BuyerCounts {
    counts: DashMap<u64, i64>,
}

impl BuyerCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, buyer_id: u64) {
        *self.counts.entry(buyer_id).or_insert(0) += 1;
    }

    pub fn decrement(&self, buyer_id: u64) {
        if let Some(mut count) = self.counts.get_mut(&buyer_id) {
            *count -= 1;
        }
    }

    pub fn get(&self, buyer_id: u64) -> i64 {
        self.counts.get(&buyer_id).map(|c| *c).unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<(u64, i64)> {
        self.counts.iter().map(|e| (*e.key(), *e.value())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Probe {
        value: u32,
        last_update: u64,
    }

    impl Expiring for Probe {
        fn last_update(&self) -> u64 {
            self.last_update
        }
    }

    fn probe(value: u32, last_update: u64) -> Probe {
        Probe { value, last_update }
    }

    #[test]
    fn update_counts_first_insert_only() {
        let map = ShardedMap::new(16);
        assert_eq!(map.len(), 0);

        map.update(1, probe(10, 0));
        assert_eq!(map.len(), 1);

        // Overwrite does not change the count.
        map.update(1, probe(20, 0));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(1).unwrap().value, 20);

        map.update(17, probe(30, 0)); // same shard as key 1 with 16 shards
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn remove_decrements_once() {
        let map = ShardedMap::new(16);
        map.update(5, probe(1, 0));
        assert_eq!(map.remove(5).unwrap().value, 1);
        assert_eq!(map.len(), 0);
        assert!(map.remove(5).is_none());
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn get_all_sees_every_shard() {
        let map = ShardedMap::new(4);
        for key in 0..20u64 {
            map.update(key, probe(key as u32, 0));
        }
        let mut all = map.get_all();
        all.sort_by_key(|(key, _)| *key);
        assert_eq!(all.len(), 20);
        assert_eq!(all[7].0, 7);
        assert_eq!(all[7].1.value, 7);
    }

    #[test]
    fn sweep_respects_timeout_boundary() {
        let map = ShardedMap::new(4);
        map.update(1, probe(1, 100)); // stale
        map.update(2, probe(2, 150)); // exactly at the boundary: evicted
        map.update(3, probe(3, 151)); // fresh

        let evicted = map.sweep_all(210, 60, 10);
        let mut keys: Vec<u64> = evicted.iter().map(|(k, _)| *k).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![1, 2]);
        assert_eq!(map.len(), 1);
        assert!(map.get(3).is_some());
    }

    #[test]
    fn sweep_budget_bounds_deletions_per_shard() {
        // One shard so every key collides; all entries are expired.
        let map = ShardedMap::new(1);
        for key in 0..10u64 {
            map.update(key, probe(0, 0));
        }

        let first = map.sweep_all(1000, 60, 3);
        assert_eq!(first.len(), 3);
        assert_eq!(map.len(), 7);

        // Repeated ticks drain the rest.
        let mut total = first.len();
        while total < 10 {
            let evicted = map.sweep_all(1000, 60, 3);
            assert!(evicted.len() <= 3);
            total += evicted.len();
        }
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn one_shard_sweep_round_robin() {
        let map = ShardedMap::new(4);
        for key in 0..8u64 {
            map.update(key, probe(0, 0));
        }

        // Sweeping shard 0 only touches keys 0 and 4.
        let evicted = map.sweep_shard(0, 1000, 60, 10);
        let mut keys: Vec<u64> = evicted.iter().map(|(k, _)| *k).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![0, 4]);
        assert_eq!(map.len(), 6);
    }

    #[tokio::test]
    async fn timeout_loop_exits_on_shutdown() {
        let map: Arc<ShardedMap<Probe>> = Arc::new(ShardedMap::new(4));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(map.clone().timeout_loop(
            60,
            Duration::from_millis(10),
            Sweep::AllShards {
                per_shard_budget: 3,
            },
            shutdown_rx,
            |_, _| {},
        ));

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn timeout_loop_runs_cleanup_for_evicted_entries() {
        let map: Arc<ShardedMap<Probe>> = Arc::new(ShardedMap::new(4));
        map.update(1, probe(7, 0)); // stale since the epoch

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (evicted_tx, mut evicted_rx) = tokio::sync::mpsc::unbounded_channel();

        let handle = tokio::spawn(map.clone().timeout_loop(
            60,
            Duration::from_millis(5),
            Sweep::AllShards {
                per_shard_budget: 3,
            },
            shutdown_rx,
            move |key, value: Probe| {
                let _ = evicted_tx.send((key, value.value));
            },
        ));

        let (key, value) = evicted_rx.recv().await.unwrap();
        assert_eq!(key, 1);
        assert_eq!(value, 7);
        assert_eq!(map.len(), 0);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn buyer_counts_track_increments_and_decrements() {
        let counts = BuyerCounts::new();
        counts.increment(42);
        counts.increment(42);
        counts.increment(7);
        assert_eq!(counts.get(42), 2);
        assert_eq!(counts.get(7), 1);
        assert_eq!(counts.get(99), 0);

        counts.decrement(42);
        assert_eq!(counts.get(42), 1);

        let mut snapshot = counts.snapshot();
        snapshot.sort_unstable();
        assert_eq!(snapshot, vec![(7, 1), (42, 1)]);
    }

    #[test]
    fn server_key_distinguishes_addresses() {
        let a: SocketAddr = "10.0.0.1:40000".parse().unwrap();
        let b: SocketAddr = "10.0.0.1:40001".parse().unwrap();
        assert_ne!(server_key(&a), server_key(&b));
        assert_eq!(server_key(&a), server_key(&a));
    }
}
