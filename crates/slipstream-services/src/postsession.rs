//! Post-session fan-out: billing and portal telemetry off the packet path.
//!
//! The UDP reply must never wait on a billing backend or a dashboard
//! publisher. Handlers drop finished slice records into bounded queues
//! and move on; a worker pool drains the queues into pluggable sinks.
//! A full queue sheds the record and bumps a counter, it never blocks
//! the caller. Delivery is at most once: past the retry budget an entry
//! is gone.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use slipstream_core::config::PostSessionConfig;

use crate::billing::{Biller, BillingEntry};
use crate::metrics::Metrics;

pub const SESSION_COUNTS_TOPIC: &str = "session_counts";
pub const PORTAL_DATA_TOPIC: &str = "portal_session_data";

// ── Portal DTOs ───────────────────────────────────────────────────────────────

/// Per-server session census for the operator dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionCounts {
    pub server_id: u64,
    pub buyer_id: u64,
    pub num_sessions: u32,
}

/// One slice's dashboard row. Everything the portal needs to draw the
/// session: who, where, and how the direct and next paths compared.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortalData {
    pub timestamp: u64,
    pub session_id: u64,
    pub user_hash: u64,
    pub buyer_id: u64,
    pub datacenter_name: String,
    pub latitude: f32,
    pub longitude: f32,
    pub client_addr: String,
    pub server_addr: String,
    pub sdk_version: String,
    pub on_next: bool,
    pub ever_on_next: bool,
    pub direct_rtt: f32,
    pub direct_jitter: f32,
    pub direct_packet_loss: f32,
    pub next_rtt: f32,
    pub next_jitter: f32,
    pub next_packet_loss: f32,
    pub route_relay_names: Vec<String>,
}

// ── Publishers ────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PublishError {
    /// Transient; another attempt against the same publisher may land.
    #[error("transient publish failure: {0}")]
    Retry(String),
    /// Permanent for this payload; the whole chain is abandoned.
    #[error("publish failed: {0}")]
    Fatal(String),
}

/// Outbound telemetry sink, e.g. a pubsub topic or a message queue.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Push one payload to `topic`, returning the byte count accepted.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<usize, PublishError>;
}

/// Logs payload sizes instead of publishing. Stands in when no portal
/// endpoint is configured, so the pipeline still drains.
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<usize, PublishError> {
        tracing::debug!(topic, bytes = payload.len(), "portal publish (log only)");
        Ok(payload.len())
    }
}

#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("exceeded retry count on portal data")]
    RetriesExhausted,
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Ordered fallback chain over the configured portal publishers.
///
/// Each entry starts at the round robin index. A transient failure
/// retries the same publisher until its budget runs out, then the next
/// publisher in the ring gets the entry; a fatal failure abandons the
/// entry immediately. The index only advances on success, keeping load
/// spread across healthy publishers.
pub struct PublisherChain {
    publishers: Vec<Arc<dyn Publisher>>,
    next_index: AtomicUsize,
    max_retries: u32,
    metrics: Arc<Metrics>,
}

impl PublisherChain {
    /// An empty chain fails every transmit; callers that have no portal
    /// configured should pass a [`LogPublisher`] instead.
    pub fn new(publishers: Vec<Arc<dyn Publisher>>, max_retries: u32, metrics: Arc<Metrics>) -> Self {
        Self { publishers, next_index: AtomicUsize::new(0), max_retries, metrics }
    }

    pub async fn transmit(&self, topic: &str, payload: &[u8]) -> Result<usize, TransmitError> {
        let count = self.publishers.len();
        let start = self.next_index.load(Ordering::Relaxed);

        for i in 0..count {
            let index = (start + i) % count;
            let publisher = &self.publishers[index];

            let mut retries = 0;
            while retries < self.max_retries + 1 {
                match publisher.publish(topic, payload).await {
                    Ok(bytes) => {
                        self.next_index.store((start + 1) % count, Ordering::Relaxed);
                        return Ok(bytes);
                    }
                    Err(PublishError::Retry(reason)) => {
                        self.metrics.portal_retries.inc();
                        tracing::debug!(topic, publisher = index, %reason, "retrying portal publish");
                        retries += 1;
                    }
                    Err(err) => return Err(TransmitError::Publish(err)),
                }
            }
            // Budget spent on this publisher; the next one in the ring
            // gets the entry.
        }

        Err(TransmitError::RetriesExhausted)
    }
}

// ── Handler ───────────────────────────────────────────────────────────────────

/// Fan-out stage between the session handler and the slow sinks.
///
/// Send methods are synchronous and never block; workers spawned by
/// [`PostSessionHandler::spawn_workers`] drain the queues until shutdown.
/// Queued entries are not drained on shutdown.
pub struct PostSessionHandler {
    billing_tx: mpsc::Sender<BillingEntry>,
    counts_tx: mpsc::Sender<SessionCounts>,
    portal_tx: mpsc::Sender<PortalData>,

    billing_rx: SharedReceiver<BillingEntry>,
    counts_rx: SharedReceiver<SessionCounts>,
    portal_rx: SharedReceiver<PortalData>,

    worker_count: usize,
    biller: Arc<dyn Biller>,
    chain: Arc<PublisherChain>,
    metrics: Arc<Metrics>,
}

/// Workers share one receiver per queue, taking turns under a lock.
type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

impl PostSessionHandler {
    pub fn new(
        config: &PostSessionConfig,
        publishers: Vec<Arc<dyn Publisher>>,
        biller: Arc<dyn Biller>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (billing_tx, billing_rx) = mpsc::channel(config.queue_capacity);
        let (counts_tx, counts_rx) = mpsc::channel(config.queue_capacity);
        let (portal_tx, portal_rx) = mpsc::channel(config.queue_capacity);

        let chain = Arc::new(PublisherChain::new(publishers, config.max_retries, metrics.clone()));

        Self {
            billing_tx,
            counts_tx,
            portal_tx,
            billing_rx: Arc::new(Mutex::new(billing_rx)),
            counts_rx: Arc::new(Mutex::new(counts_rx)),
            portal_rx: Arc::new(Mutex::new(portal_rx)),
            worker_count: config.worker_count,
            biller,
            chain,
            metrics,
        }
    }

    /// Start the worker pool: `worker_count` tasks per queue. Workers
    /// stop on shutdown broadcast or when every sender is gone.
    pub fn spawn_workers(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.worker_count * 3);
        for _ in 0..self.worker_count {
            handles.push(tokio::spawn(billing_worker(
                self.billing_rx.clone(),
                self.biller.clone(),
                self.metrics.clone(),
                shutdown.subscribe(),
            )));
            handles.push(tokio::spawn(portal_worker(
                SESSION_COUNTS_TOPIC,
                self.counts_rx.clone(),
                self.chain.clone(),
                self.metrics.clone(),
                shutdown.subscribe(),
            )));
            handles.push(tokio::spawn(portal_worker(
                PORTAL_DATA_TOPIC,
                self.portal_rx.clone(),
                self.chain.clone(),
                self.metrics.clone(),
                shutdown.subscribe(),
            )));
        }
        handles
    }

    pub fn send_billing_entry(&self, entry: BillingEntry) {
        if self.billing_tx.try_send(entry).is_ok() {
            self.metrics.billing_entries_sent.inc();
        } else {
            self.metrics.billing_buffer_full.inc();
        }
    }

    pub fn send_portal_counts(&self, counts: SessionCounts) {
        if self.counts_tx.try_send(counts).is_ok() {
            self.metrics.portal_entries_sent.inc();
        } else {
            self.metrics.portal_buffer_full.inc();
        }
    }

    pub fn send_portal_data(&self, data: PortalData) {
        if self.portal_tx.try_send(data).is_ok() {
            self.metrics.portal_entries_sent.inc();
        } else {
            self.metrics.portal_buffer_full.inc();
        }
    }

    /// Queue depths for the status endpoint.
    pub fn backlog(&self) -> (usize, usize, usize) {
        (
            self.billing_tx.max_capacity() - self.billing_tx.capacity(),
            self.counts_tx.max_capacity() - self.counts_tx.capacity(),
            self.portal_tx.max_capacity() - self.portal_tx.capacity(),
        )
    }
}

// ── Recent sessions per user ──────────────────────────────────────────────────

/// How long a session id stays visible in user lookups after its last
/// refresh.
pub const USER_SESSION_SECONDS: u64 = 60 * 60;

/// Most recent session ids kept per user hash.
pub const MAX_SESSIONS_PER_USER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
struct UserSession {
    session_id: u64,
    added_at: u64,
}

/// Recent session ids per user hash, so the portal can answer "show me
/// this user's last sessions". Written on the packet path at session
/// start; DashMap keeps inserts from contending with the sweeper.
#[derive(Default)]
pub struct UserSessionMap {
    users: DashMap<u64, Vec<UserSession>>,
}

impl UserSessionMap {
    pub fn new() -> Self {
        Self { users: DashMap::new() }
    }

    /// Record a session for a user. Re-adding an id refreshes its
    /// timestamp; past the per-user cap the oldest id falls off.
    pub fn add(&self, user_hash: u64, session_id: u64, now: u64) {
        let mut sessions = self.users.entry(user_hash).or_default();
        if let Some(existing) = sessions.iter_mut().find(|s| s.session_id == session_id) {
            existing.added_at = now;
            return;
        }
        if sessions.len() >= MAX_SESSIONS_PER_USER {
            sessions.remove(0);
        }
        sessions.push(UserSession { session_id, added_at: now });
    }

    /// Session ids for one user, newest first.
    pub fn sessions_for_user(&self, user_hash: u64) -> Vec<u64> {
        self.users
            .get(&user_hash)
            .map(|sessions| sessions.iter().rev().map(|s| s.session_id).collect())
            .unwrap_or_default()
    }

    pub fn num_users(&self) -> u64 {
        self.users.len() as u64
    }

    /// Drop ids past the retention window, and users with none left.
    pub fn sweep(&self, now: u64) {
        self.users.retain(|_, sessions| {
            sessions.retain(|s| s.added_at + USER_SESSION_SECONDS > now);
            !sessions.is_empty()
        });
    }

    pub async fn sweep_loop(
        self: Arc<Self>,
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
                    self.sweep(crate::maps::unix_time());
                }
            }
        }
    }
}

async fn recv_shared<T>(rx: &SharedReceiver<T>) -> Option<T> {
    rx.lock().await.recv().await
}

async fn billing_worker(
    rx: SharedReceiver<BillingEntry>,
    biller: Arc<dyn Biller>,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let entry = tokio::select! {
            _ = shutdown.recv() => return,
            entry = recv_shared(&rx) => match entry {
                Some(entry) => entry,
                None => return,
            },
        };

        if let Err(err) = biller.bill(&entry).await {
            tracing::error!(%err, session_id = entry.session_id, "could not submit billing entry");
            metrics.billing_failure.inc();
        }
    }
}

async fn portal_worker<T: Serialize>(
    topic: &'static str,
    rx: SharedReceiver<T>,
    chain: Arc<PublisherChain>,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let item = tokio::select! {
            _ = shutdown.recv() => return,
            item = recv_shared(&rx) => match item {
                Some(item) => item,
                None => return,
            },
        };

        let payload = match serde_json::to_vec(&item) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(topic, %err, "could not serialize portal entry");
                metrics.portal_failure.inc();
                continue;
            }
        };

        match chain.transmit(topic, &payload).await {
            Ok(bytes) => tracing::debug!(topic, bytes, "published portal entry"),
            Err(err) => {
                tracing::error!(topic, %err, "could not publish portal entry");
                metrics.portal_failure.inc();
            }
        }
    }
}
