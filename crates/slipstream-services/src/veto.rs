//! Multipath veto store.
//!
//! Users whose links overload under multipath get flagged by the
//! post-session path; later sessions for the same user must not run
//! multipath again. The store is sharded like the other hot maps, but
//! the packet path never reads it directly: it reads per-buyer copies
//! out of [`VetoSnapshots`], rebuilt on an interval, so a reply is never
//! blocked behind the writer.
//!
//! A veto recorded while slice N is in flight may therefore not be seen
//! until a snapshot rebuild later; decisions in between run on the
//! previous copy.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;

use slipstream_core::crypto;

use crate::maps::{unix_time, Expiring, ShardedMap, VETO_MAP_SHARDS};

/// One vetoed user, keyed by [`veto_key`].
#[derive(Debug, Clone, PartialEq)]
pub struct VetoEntry {
    pub buyer_id: u64,
    pub user_hash: u64,
    pub last_update: u64,
}

impl Expiring for VetoEntry {
    fn last_update(&self) -> u64 {
        self.last_update
    }
}

/// Map key scoping a user hash to one buyer.
pub fn veto_key(buyer_id: u64, user_hash: u64) -> u64 {
    crypto::fnv1a(&[&buyer_id.to_le_bytes(), &user_hash.to_le_bytes()])
}

// ── Live store ────────────────────────────────────────────────────────────────

/// Sharded store of multipath-vetoed users. Written by the post-session
/// workers, swept on the veto timeout, copied out by the snapshot
/// refresher.
#[derive(Debug)]
pub struct VetoMap {
    map: Arc<ShardedMap<VetoEntry>>,
}

impl VetoMap {
    pub fn new() -> Self {
        Self { map: Arc::new(ShardedMap::new(VETO_MAP_SHARDS)) }
    }

    /// Record (or refresh) a veto for this user.
    pub fn veto_user(&self, buyer_id: u64, user_hash: u64) {
        self.map.update(
            veto_key(buyer_id, user_hash),
            VetoEntry { buyer_id, user_hash, last_update: unix_time() },
        );
    }

    pub fn is_vetoed(&self, buyer_id: u64, user_hash: u64) -> bool {
        self.map.contains(veto_key(buyer_id, user_hash))
    }

    pub fn len(&self) -> u64 {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Copy of one buyer's veto set. Full scan; callers are the snapshot
    /// refresher and tests, never the packet path.
    pub fn get_map_copy(&self, buyer_id: u64) -> HashMap<u64, bool> {
        let mut out = HashMap::new();
        self.map.for_each(|_, entry| {
            if entry.buyer_id == buyer_id {
                out.insert(entry.user_hash, true);
            }
        });
        out
    }

    /// Handle for spawning the shared timeout loop.
    pub fn shard_map(&self) -> Arc<ShardedMap<VetoEntry>> {
        self.map.clone()
    }
}

impl Default for VetoMap {
    fn default() -> Self {
        Self::new()
    }
}

// ── Hot-path snapshots ────────────────────────────────────────────────────────

/// Per-buyer veto sets for the packet path, swapped whole on rebuild.
/// Readers clone one Arc per lookup and hold no lock while deciding.
#[derive(Debug, Default)]
pub struct VetoSnapshots {
    current: RwLock<Arc<HashMap<u64, Arc<HashMap<u64, bool>>>>>,
}

impl VetoSnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Veto set for one buyer; empty when the buyer has no vetoed users.
    pub fn for_buyer(&self, buyer_id: u64) -> Arc<HashMap<u64, bool>> {
        let snapshots = self.current.read().unwrap_or_else(|e| e.into_inner());
        snapshots.get(&buyer_id).cloned().unwrap_or_default()
    }

    /// Rebuild every buyer's set from the live store.
    pub fn rebuild(&self, map: &VetoMap) {
        let mut grouped: HashMap<u64, HashMap<u64, bool>> = HashMap::new();
        map.map.for_each(|_, entry| {
            grouped.entry(entry.buyer_id).or_default().insert(entry.user_hash, true);
        });
        let snapshots: HashMap<u64, Arc<HashMap<u64, bool>>> = grouped
            .into_iter()
            .map(|(buyer_id, set)| (buyer_id, Arc::new(set)))
            .collect();
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(snapshots);
    }

    /// Interval rebuild; exits on shutdown.
    pub async fn refresh_loop(
        self: Arc<Self>,
        map: Arc<VetoMap>,
        every: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    return;
                }

                _ = interval.tick() => {
                    self.rebuild(&map);
                }
            }
        }
    }
}
