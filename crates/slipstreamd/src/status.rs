//! HTTP status endpoint — exposes daemon state as JSON.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::routing::get;
use axum::{extract::State, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;

use crate::state::BackendState;

// ── /health ───────────────────────────────────────────────────────────────────

async fn handle_health() -> &'static str {
    "ok"
}

// ── /version ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct VersionResponse {
    pub version: &'static str,
    pub backend_public_key: String,
    pub router_public_key: String,
}

async fn handle_version(State(state): State<Arc<BackendState>>) -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        backend_public_key: hex::encode(state.keys.signing.public_bytes()),
        router_public_key: hex::encode(state.keys.router.public),
    })
}

// ── /status ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub sessions: u64,
    pub next_sessions: u64,
    pub servers: u64,
    pub relays: u64,
    pub vetoed_users: u64,
    pub buyers: Vec<BuyerInfo>,
    pub datacenters: Vec<String>,
    pub unknown_datacenters: Vec<String>,
    pub backlog: BacklogInfo,
    pub counters: BTreeMap<&'static str, u64>,
}

#[derive(Serialize)]
pub struct BuyerInfo {
    pub buyer_id: String,
    pub sessions: i64,
}

/// Post-session queue depths; a sustained non-zero value means the
/// workers are not keeping up.
#[derive(Serialize)]
pub struct BacklogInfo {
    pub billing: usize,
    pub counts: usize,
    pub portal: usize,
}

async fn handle_status(State(state): State<Arc<BackendState>>) -> Json<StatusResponse> {
    let mut next_sessions = 0u64;
    state.sessions.for_each(|_, entry| {
        if !entry.route_relays.is_empty() {
            next_sessions += 1;
        }
    });

    let mut buyers: Vec<BuyerInfo> = state
        .buyer_counts
        .snapshot()
        .into_iter()
        .map(|(buyer_id, sessions)| BuyerInfo {
            buyer_id: format!("{buyer_id:016x}"),
            sessions,
        })
        .collect();
    buyers.sort_by(|a, b| a.buyer_id.cmp(&b.buyer_id));

    let (billing, counts, portal) = state.postsession.backlog();

    Json(StatusResponse {
        sessions: state.sessions.len(),
        next_sessions,
        servers: state.servers.len(),
        relays: state.relays.len(),
        vetoed_users: state.veto.len(),
        buyers,
        datacenters: state.datacenter_tracker.get_all(),
        unknown_datacenters: state.unknown_datacenter_tracker.get_all(),
        backlog: BacklogInfo { billing, counts, portal },
        counters: state.metrics.snapshot(),
    })
}

// ── Router ────────────────────────────────────────────────────────────────────

pub async fn serve(state: Arc<BackendState>, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/version", get(handle_version))
        .route("/status", get(handle_status))
        .with_state(state);

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(port, "status endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}
