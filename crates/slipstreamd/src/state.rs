//! Shared daemon state.
//!
//! One `Arc<BackendState>` is threaded through every reader task and
//! handler. Everything inside is already concurrency-safe (sharded
//! maps, snapshot holders, atomics), so handlers never take a daemon
//! wide lock.

use std::net::SocketAddr;
use std::sync::Arc;

use slipstream_core::{BackendKeys, SlipstreamConfig};
use slipstream_services::maps::BuyerCounts;
use slipstream_services::tokens::InternalIpPolicy;
use slipstream_services::trackers::IdTracker;
use slipstream_services::{
    DirectoryHolder, IpLocator, MatrixHolder, Metrics, PostSessionHandler, RelayEntry, ServerEntry,
    SessionEntry, ShardedMap, UserSessionMap, VetoMap, VetoSnapshots,
};

use crate::magic::MagicKeeper;

pub struct BackendState {
    pub config: SlipstreamConfig,
    pub keys: BackendKeys,
    /// The address clients send to, as seen from outside. Baked into
    /// the v5 packet filters on both directions.
    pub public_address: SocketAddr,

    pub sessions: Arc<ShardedMap<SessionEntry>>,
    pub servers: Arc<ShardedMap<ServerEntry>>,
    pub relays: Arc<ShardedMap<RelayEntry>>,
    pub buyer_counts: Arc<BuyerCounts>,
    pub user_sessions: Arc<UserSessionMap>,

    pub matrix: Arc<MatrixHolder>,
    pub directory: Arc<DirectoryHolder>,

    pub veto: Arc<VetoMap>,
    pub veto_snapshots: Arc<VetoSnapshots>,

    /// Datacenters that resolved against the directory, and ones that
    /// did not. Both lists show up on the status endpoint.
    pub datacenter_tracker: Arc<IdTracker>,
    pub unknown_datacenter_tracker: Arc<IdTracker>,

    pub locator: Arc<dyn IpLocator>,
    pub magic: Arc<MagicKeeper>,
    pub postsession: Arc<PostSessionHandler>,
    pub internal_ips: InternalIpPolicy,
    pub metrics: Arc<Metrics>,
}
