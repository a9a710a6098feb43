//! slipstreamd — session routing backend.
//!
//! Listens for SDK traffic on a pool of UDP sockets, answers server
//! and session updates across both packet generations, and keeps the
//! routing inputs (directory, route matrix) fresh in the background.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use slipstream_core::SlipstreamConfig;
use slipstream_services::billing::LogBiller;
use slipstream_services::database::Directory;
use slipstream_services::maps::{
    unix_time, BuyerCounts, Sweep, RELAY_MAP_SHARDS, SERVER_MAP_SHARDS, SESSION_MAP_SHARDS,
};
use slipstream_services::postsession::LogPublisher;
use slipstream_services::tokens::InternalIpPolicy;
use slipstream_services::trackers::IdTracker;
use slipstream_services::{
    DirectoryHolder, MatrixHolder, Metrics, NullIsland, PostSessionHandler, Publisher, ShardedMap,
    UserSessionMap, VetoMap, VetoSnapshots,
};

mod dispatch;
mod magic;
mod readers;
mod refresh;
mod servers;
mod sessions;
mod state;
mod status;
#[cfg(test)]
mod testutil;

use magic::MagicKeeper;
use readers::PacketReader;
use state::BackendState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = SlipstreamConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = SlipstreamConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SlipstreamConfig::default()
    });

    let keys = config.keys.resolve().context("failed to resolve keys")?;
    tracing::info!(
        backend_public_key = hex::encode(keys.signing.public_bytes()),
        router_public_key = hex::encode(keys.router.public),
        "keys ready"
    );

    let public_address = config
        .network
        .public_address
        .parse()
        .with_context(|| format!("invalid public address {}", config.network.public_address))?;

    // The directory must exist before the first packet; the matrix
    // holder starts empty and fills on the refresh loop's first tick.
    let directory = match Directory::load(&config.routing.database_path) {
        Ok(directory) => {
            tracing::info!(
                path = %config.routing.database_path.display(),
                created_at = %directory.created_at,
                "directory loaded"
            );
            directory
        }
        Err(e) => {
            tracing::warn!(
                path = %config.routing.database_path.display(),
                error = %e,
                "could not load directory, starting empty"
            );
            Directory::default()
        }
    };

    let metrics = Arc::new(Metrics::new());
    let postsession = Arc::new(PostSessionHandler::new(
        &config.postsession,
        vec![Arc::new(LogPublisher) as Arc<dyn Publisher>],
        Arc::new(LogBiller),
        metrics.clone(),
    ));
    let internal_ips = InternalIpPolicy::new(
        config.routing.enable_internal_ips,
        config.routing.internal_ip_sellers.clone(),
    );

    let state = Arc::new(BackendState {
        keys,
        public_address,
        sessions: Arc::new(ShardedMap::new(SESSION_MAP_SHARDS)),
        servers: Arc::new(ShardedMap::new(SERVER_MAP_SHARDS)),
        relays: Arc::new(ShardedMap::new(RELAY_MAP_SHARDS)),
        buyer_counts: Arc::new(BuyerCounts::new()),
        user_sessions: Arc::new(UserSessionMap::new()),
        matrix: Arc::new(MatrixHolder::empty()),
        directory: Arc::new(DirectoryHolder::new(directory)),
        veto: Arc::new(VetoMap::new()),
        veto_snapshots: Arc::new(VetoSnapshots::new()),
        datacenter_tracker: Arc::new(IdTracker::new()),
        unknown_datacenter_tracker: Arc::new(IdTracker::new()),
        locator: Arc::new(NullIsland),
        magic: Arc::new(MagicKeeper::new()),
        postsession,
        internal_ips,
        metrics,
        config,
    });

    // ── Shutdown channel ─────────────────────────────────────────────────────

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── UDP readers ──────────────────────────────────────────────────────────

    let sockets = readers::bind_reader_sockets(
        &state.config.network.bind_address,
        state.config.network.port,
        state.config.network.num_sockets.max(1),
        state.config.network.recv_buffer_bytes,
    )?;
    tracing::info!(
        bind = %state.config.network.bind_address,
        port = state.config.network.port,
        readers = sockets.len(),
        "listening for SDK traffic"
    );

    let reader_tasks: Vec<JoinHandle<Result<()>>> = sockets
        .into_iter()
        .map(|socket| {
            tokio::spawn(PacketReader::new(socket, state.clone(), shutdown_tx.subscribe()).run())
        })
        .collect();

    // ── Background loops ─────────────────────────────────────────────────────

    tokio::spawn(state.magic.clone().rotation_loop(shutdown_tx.subscribe()));
    tokio::spawn(refresh::matrix_refresh_loop(state.clone(), shutdown_tx.subscribe()));
    tokio::spawn(refresh::directory_refresh_loop(state.clone(), shutdown_tx.subscribe()));
    tokio::spawn(state.veto_snapshots.clone().refresh_loop(
        state.veto.clone(),
        Duration::from_secs(10),
        shutdown_tx.subscribe(),
    ));

    // Session eviction doubles as end-of-session detection: the summary
    // billing row is written here and nowhere else.
    {
        let postsession = state.postsession.clone();
        let buyer_counts = state.buyer_counts.clone();
        tokio::spawn(state.sessions.clone().timeout_loop(
            state.config.timeouts.session_seconds,
            Duration::from_secs(1),
            Sweep::AllShards { per_shard_budget: 3 },
            shutdown_tx.subscribe(),
            move |_, entry| {
                tracing::debug!(
                    session_id = format_args!("{:016x}", entry.session_id),
                    "session ended"
                );
                postsession.send_billing_entry(sessions::summary_billing_entry(&entry, unix_time()));
                buyer_counts.decrement(entry.buyer_id);
            },
        ));
    }
    tokio::spawn(state.servers.clone().timeout_loop(
        state.config.timeouts.server_seconds,
        Duration::from_secs(1),
        Sweep::AllShards { per_shard_budget: 3 },
        shutdown_tx.subscribe(),
        |_, _| {},
    ));
    tokio::spawn(state.relays.clone().timeout_loop(
        state.config.timeouts.relay_seconds,
        Duration::from_secs(1),
        Sweep::OneShardPerTick { budget: 10 },
        shutdown_tx.subscribe(),
        |_, _| {},
    ));
    tokio::spawn(state.veto.shard_map().timeout_loop(
        state.config.timeouts.veto_hours * 3600,
        Duration::from_secs(1),
        Sweep::AllShards { per_shard_budget: 3 },
        shutdown_tx.subscribe(),
        |_, _| {},
    ));

    tokio::spawn(state.datacenter_tracker.clone().timeout_loop(
        state.config.timeouts.tracker_minutes * 60,
        Duration::from_secs(60),
        100,
        shutdown_tx.subscribe(),
    ));
    tokio::spawn(state.unknown_datacenter_tracker.clone().timeout_loop(
        state.config.timeouts.tracker_minutes * 60,
        Duration::from_secs(60),
        100,
        shutdown_tx.subscribe(),
    ));
    tokio::spawn(
        state
            .user_sessions
            .clone()
            .sweep_loop(Duration::from_secs(60), shutdown_tx.subscribe()),
    );

    let _workers = state.postsession.spawn_workers(&shutdown_tx);

    // Status HTTP endpoint
    let status_task = {
        let state = state.clone();
        let port = state.config.network.status_port;
        tokio::spawn(status::serve(state, port))
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        (r, i, _) = futures::future::select_all(reader_tasks) => {
            tracing::error!(reader = i, "packet reader exited: {:?}", r);
        }
        r = status_task => tracing::error!("status server exited: {:?}", r),
    }

    Ok(())
}
