//! Slipstream integration suite.
//!
//! Cross-crate flows that no single unit test covers: a slice decision
//! feeding sealed tokens that relays can actually open, the session
//! blob surviving the trip through the client, the post-session pipeline
//! draining to real sinks, v5 obfuscation end to end, map eviction, and
//! slice pricing against a directory. Everything runs in-process; the
//! daemon's packet handlers have their own tests beside the handlers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use slipstream_core::config::PostSessionConfig;
use slipstream_core::crypto::{BoxKeypair, SigningKeypair};
use slipstream_core::packets5::{
    advanced_packet_filter, basic_packet_filter, frame_packet5, open_frame5, verify_frame5,
};
use slipstream_core::route::{InternalConfig, RouteShader, RouteState};
use slipstream_core::session_data::{
    read_session_data, write_session_data, SessionData, SESSION_DATA_VERSION,
};
use slipstream_core::token::{
    read_continue_token, read_route_token, ENCRYPTED_CONTINUE_TOKEN_BYTES,
    ENCRYPTED_ROUTE_TOKEN_BYTES,
};
use slipstream_core::wire::{self, address_filter_bytes, unpack_address, SdkVersion};

use slipstream_services::billing::{
    envelope_bytes, route_relay_prices_per_gb, total_price_nibblins, BillError, Biller,
    BillingEntry, NEXT_PRICE_NIBBLINS_PER_GB,
};
use slipstream_services::database::{
    Buyer, Datacenter, Directory, DirectoryFile, Relay, Seller,
};
use slipstream_services::decision::{self, NearRelayPings, SliceStats};
use slipstream_services::maps::{unix_time, ServerEntry, ShardedMap, Sweep};
use slipstream_services::matrix::{route_hash, tri_matrix_length, RouteEntry, RouteMatrix};
use slipstream_services::metrics::Metrics;
use slipstream_services::postsession::{
    PortalData, PostSessionHandler, PublishError, Publisher, SessionCounts,
};
use slipstream_services::tokens::{self, InternalIpPolicy};

// ── Fixtures ──────────────────────────────────────────────────────────────────

const BUYER_ID: u64 = 0x1001;
const SELLER_ID: u64 = 0x2001;
const DATACENTER_ID: u64 = 0x3001;
const OTHER_DATACENTER_ID: u64 = 0x3002;
const RELAY_A: u64 = 0x4001;
const RELAY_B: u64 = 0x4002;

fn backend_keypair() -> SigningKeypair {
    SigningKeypair::from_private_bytes(&[3u8; 32])
}

fn buyer_keypair() -> SigningKeypair {
    SigningKeypair::from_private_bytes(&[7u8; 32])
}

fn router_keypair() -> BoxKeypair {
    BoxKeypair::from_private_bytes(&[4u8; 32])
}

fn relay_a_box() -> BoxKeypair {
    BoxKeypair::from_private_bytes(&[1u8; 32])
}

fn relay_b_box() -> BoxKeypair {
    BoxKeypair::from_private_bytes(&[2u8; 32])
}

fn client_box() -> BoxKeypair {
    BoxKeypair::from_private_bytes(&[5u8; 32])
}

fn server_box() -> BoxKeypair {
    BoxKeypair::from_private_bytes(&[6u8; 32])
}

fn client_addr() -> SocketAddr {
    "50.60.70.80:30000".parse().unwrap()
}

fn server_addr() -> SocketAddr {
    "120.30.40.50:40000".parse().unwrap()
}

fn backend_addr() -> SocketAddr {
    "185.10.10.10:40000".parse().unwrap()
}

fn relay_a_addr() -> SocketAddr {
    "10.0.0.1:40000".parse().unwrap()
}

fn relay_b_addr() -> SocketAddr {
    "10.0.0.2:40000".parse().unwrap()
}

/// One live buyer and one seller with two relays. Relay B carries a
/// price override so pricing picks between the two sources.
fn fixture_directory() -> Directory {
    let file = DirectoryFile {
        created_at: "integration".to_string(),
        buyers: vec![Buyer {
            id: BUYER_ID,
            name: "Raptor Interactive".to_string(),
            code: "raptor".to_string(),
            live: true,
            debug: false,
            public_key: buyer_keypair().public_bytes(),
            route_shader: RouteShader::default(),
            internal_config: Default::default(),
        }],
        sellers: vec![Seller {
            id: SELLER_ID,
            name: "Amazing".to_string(),
            code: "amazing".to_string(),
            egress_price_nibblins_per_gb: 100_000_000,
        }],
        datacenters: vec![
            Datacenter {
                id: DATACENTER_ID,
                name: "amazing.ohio".to_string(),
                alias: String::new(),
                native: String::new(),
                latitude: 0.0,
                longitude: 0.0,
                seller_id: SELLER_ID,
            },
            Datacenter {
                id: OTHER_DATACENTER_ID,
                name: "amazing.chicago".to_string(),
                alias: String::new(),
                native: String::new(),
                latitude: 0.0,
                longitude: 0.0,
                seller_id: SELLER_ID,
            },
        ],
        relays: vec![
            Relay {
                id: RELAY_A,
                name: "amazing.ohio.a".to_string(),
                public_addr: relay_a_addr(),
                internal_addr: None,
                public_key: relay_a_box().public,
                seller_id: SELLER_ID,
                datacenter_id: DATACENTER_ID,
                egress_price_override: 0,
            },
            Relay {
                id: RELAY_B,
                name: "amazing.chicago.a".to_string(),
                public_addr: relay_b_addr(),
                internal_addr: None,
                public_key: relay_b_box().public,
                seller_id: SELLER_ID,
                datacenter_id: OTHER_DATACENTER_ID,
                egress_price_override: 250_000_000,
            },
        ],
        datacenter_aliases: Vec::new(),
    };
    Directory::build(file).unwrap()
}

/// Two relays and a single A -> B route costing 50 ms between them.
fn fixture_matrix() -> RouteMatrix {
    let mut relay_id_to_index = HashMap::new();
    relay_id_to_index.insert(RELAY_A, 0);
    relay_id_to_index.insert(RELAY_B, 1);

    let mut route_entries = vec![RouteEntry::default(); tri_matrix_length(2)];
    let entry = &mut route_entries[0];
    entry.direct_cost = 50;
    entry.num_routes = 1;
    entry.route_cost[0] = 50;
    entry.route_num_relays[0] = 2;
    entry.route_relays[0][0] = 1;
    entry.route_relays[0][1] = 0;
    entry.route_hash[0] = route_hash(&[1, 0]);

    RouteMatrix {
        relay_ids: vec![RELAY_A, RELAY_B],
        relay_id_to_index,
        relay_addresses: vec![relay_a_addr(), relay_b_addr()],
        relay_names: vec!["amazing.ohio.a".to_string(), "amazing.chicago.a".to_string()],
        relay_latitudes: vec![0.0, 0.0],
        relay_longitudes: vec![0.0, 0.0],
        relay_datacenter_ids: vec![DATACENTER_ID, OTHER_DATACENTER_ID],
        route_entries,
        created_at: 1_700_000_000,
        dest_relays: vec![true, true],
        ..RouteMatrix::default()
    }
}

// ── Session blob ──────────────────────────────────────────────────────────────

#[test]
fn session_blob_survives_a_full_round_trip() {
    let mut data = SessionData {
        session_id: 0xC0FFEE,
        slice_number: 9,
        expire_timestamp: 1_700_000_100,
        session_version: 3,
        envelope_bytes_up_sum: 11_000,
        envelope_bytes_down_sum: 5_500,
        session_duration: 90,
        start_timestamp: 1_700_000_000,
        duration_on_next: 40,
        session_events: 0b1010,
        summary_written: true,
        ..SessionData::default()
    };
    data.route_state.next = true;
    data.route_state.committed = true;
    data.route_state.reduce_latency = true;

    let bytes = write_session_data(&data).unwrap();
    let back = read_session_data(&bytes).unwrap();

    assert_eq!(back.version, SESSION_DATA_VERSION);
    assert_eq!(back.session_id, 0xC0FFEE);
    assert_eq!(back.slice_number, 9);
    assert_eq!(back.session_version, 3);
    assert_eq!(back.envelope_bytes_up_sum, 11_000);
    assert_eq!(back.envelope_bytes_down_sum, 5_500);
    assert_eq!(back.session_duration, 90);
    assert_eq!(back.start_timestamp, 1_700_000_000);
    assert_eq!(back.duration_on_next, 40);
    assert_eq!(back.session_events, 0b1010);
    assert!(back.summary_written);
    assert!(back.route_state.next && back.route_state.committed);
    assert!(back.route_state.reduce_latency);

    // Expiry is exclusive at the boundary.
    assert!(back.fresh(1_700_000_099));
    assert!(!back.fresh(1_700_000_100));

    assert!(read_session_data(&[]).is_err());
}

// ── Decision to tokens ────────────────────────────────────────────────────────

/// The full acceleration path: a slice report turns into a route, the
/// route into a hop list, the hop list into sealed tokens, and each hop
/// can open exactly its own token with its own private key.
#[test]
fn decision_route_feeds_sealed_tokens_relays_can_open() {
    let directory = fixture_directory();
    let matrix = fixture_matrix();

    let mut state = RouteState::default();
    let pings = NearRelayPings { ids: &[RELAY_A], rtt: &[10], jitter: &[0], packet_loss: &[0] };
    let mut candidates = decision::reframe_relays(
        &mut state,
        &matrix.relay_id_to_index,
        1,
        100,
        0,
        0,
        &pings,
        &[RELAY_B],
    );

    let stats = SliceStats { direct_latency: 100, ..SliceStats::default() };
    let route = decision::take_next(
        &matrix.route_entries,
        &RouteShader::default(),
        &InternalConfig::default(),
        &mut state,
        &HashMap::new(),
        7,
        stats,
        &mut candidates,
    )
    .expect("a 100ms direct session should accelerate through a 60ms route");

    assert_eq!(route.num_relays, 2);
    assert_eq!(route.relays[..2], [0, 1]);
    assert!(state.next && state.committed);

    let policy = InternalIpPolicy::new(false, Vec::new());
    let hops = tokens::build_hop_list(
        &directory,
        client_addr(),
        client_box().public,
        server_addr(),
        server_box().public,
        &route.relays[..route.num_relays as usize],
        &matrix.relay_ids,
        &policy,
    )
    .expect("every relay in the route is in the directory");

    assert_eq!(hops.num_tokens(), 4);
    assert_eq!(
        hops.addresses,
        vec![client_addr(), relay_a_addr(), relay_b_addr(), server_addr()]
    );

    let router = router_keypair();
    let sealed = tokens::next_tokens(&hops, 1_700_000_020, 0x5E55, 1, 1024, 512, router.private_bytes())
        .unwrap();
    assert_eq!(sealed.len(), 4 * ENCRYPTED_ROUTE_TOKEN_BYTES);

    // Relay A holds token 1 and forwards to relay B.
    let token_a = read_route_token(
        &sealed[ENCRYPTED_ROUTE_TOKEN_BYTES..2 * ENCRYPTED_ROUTE_TOKEN_BYTES],
        &router.public,
        relay_a_box().private_bytes(),
    )
    .unwrap();
    assert_eq!({ token_a.session_id }, 0x5E55);
    assert_eq!(token_a.session_version, 1);
    assert_eq!({ token_a.kbps_up }, 1024);
    assert_eq!({ token_a.kbps_down }, 512);
    assert_eq!(unpack_address(&token_a.next_address).unwrap(), Some(relay_b_addr()));

    // Relay B forwards to the game server.
    let token_b = read_route_token(
        &sealed[2 * ENCRYPTED_ROUTE_TOKEN_BYTES..3 * ENCRYPTED_ROUTE_TOKEN_BYTES],
        &router.public,
        relay_b_box().private_bytes(),
    )
    .unwrap();
    assert_eq!(unpack_address(&token_b.next_address).unwrap(), Some(server_addr()));

    // A hop cannot open a token sealed for another hop.
    assert!(read_route_token(
        &sealed[..ENCRYPTED_ROUTE_TOKEN_BYTES],
        &router.public,
        relay_a_box().private_bytes(),
    )
    .is_err());

    // A stay decision keeps the same hops on cheap continue tokens.
    let sealed = tokens::continue_tokens(&hops, 1_700_000_030, 0x5E55, 1, router.private_bytes())
        .unwrap();
    assert_eq!(sealed.len(), 4 * ENCRYPTED_CONTINUE_TOKEN_BYTES);

    let token_s = read_continue_token(
        &sealed[3 * ENCRYPTED_CONTINUE_TOKEN_BYTES..],
        &router.public,
        server_box().private_bytes(),
    )
    .unwrap();
    assert_eq!({ token_s.expire_timestamp }, 1_700_000_030);
    assert_eq!({ token_s.session_id }, 0x5E55);
    assert_eq!(token_s.session_version, 1);
}

// ── Post-session pipeline ─────────────────────────────────────────────────────

#[derive(Default)]
struct CountingPublisher {
    entries: AtomicUsize,
    bytes: AtomicUsize,
}

#[async_trait]
impl Publisher for CountingPublisher {
    async fn publish(&self, _topic: &str, payload: &[u8]) -> Result<usize, PublishError> {
        self.entries.fetch_add(1, Ordering::SeqCst);
        self.bytes.fetch_add(payload.len(), Ordering::SeqCst);
        Ok(payload.len())
    }
}

#[derive(Default)]
struct CountingBiller {
    entries: AtomicUsize,
}

#[async_trait]
impl Biller for CountingBiller {
    async fn bill(&self, _entry: &BillingEntry) -> Result<(), BillError> {
        self.entries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn postsession_drains_to_the_publisher_chain() {
    let publisher = Arc::new(CountingPublisher::default());
    let biller = Arc::new(CountingBiller::default());
    let config = PostSessionConfig { worker_count: 2, queue_capacity: 64, max_retries: 3 };
    let handler = PostSessionHandler::new(
        &config,
        vec![publisher.clone() as Arc<dyn Publisher>],
        biller.clone() as Arc<dyn Biller>,
        Arc::new(Metrics::new()),
    );

    let (shutdown_tx, _keep) = broadcast::channel(1);
    let workers = handler.spawn_workers(&shutdown_tx);
    assert_eq!(workers.len(), config.worker_count * 3);

    handler.send_billing_entry(BillingEntry { session_id: 1, ..BillingEntry::default() });
    handler.send_billing_entry(BillingEntry {
        session_id: 1,
        summary: true,
        ..BillingEntry::default()
    });
    handler.send_portal_counts(SessionCounts {
        server_id: 9,
        buyer_id: BUYER_ID,
        num_sessions: 4,
    });
    handler.send_portal_data(PortalData { session_id: 1, ..PortalData::default() });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while biller.entries.load(Ordering::SeqCst) < 2 || publisher.entries.load(Ordering::SeqCst) < 2
    {
        assert!(tokio::time::Instant::now() < deadline, "pipeline failed to drain");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(biller.entries.load(Ordering::SeqCst), 2);
    assert_eq!(publisher.entries.load(Ordering::SeqCst), 2);
    assert!(publisher.bytes.load(Ordering::SeqCst) > 0);
    assert_eq!(handler.backlog(), (0, 0, 0));

    shutdown_tx.send(()).unwrap();
    for worker in workers {
        worker.await.unwrap();
    }
}

// ── v5 obfuscation ────────────────────────────────────────────────────────────

#[test]
fn v5_frame_passes_the_filters_only_with_the_right_magic() {
    let keypair = backend_keypair();
    let magic = [0x11u8; 8];
    let payload = b"slice report";
    let framed = frame_packet5(
        wire::PACKET5_SESSION_UPDATE_REQUEST,
        payload,
        &keypair,
        &magic,
        &server_addr(),
        &backend_addr(),
    );

    assert!(basic_packet_filter(&framed));

    let from = address_filter_bytes(&server_addr());
    let to = address_filter_bytes(&backend_addr());
    assert!(advanced_packet_filter(&framed, &magic, &from, &to));

    // A rotated-out magic no longer matches.
    assert!(!advanced_packet_filter(&framed, &[0x22u8; 8], &from, &to));
    // Neither does the frame reflected back at its sender.
    assert!(!advanced_packet_filter(&framed, &magic, &to, &from));

    let frame = open_frame5(&framed).unwrap();
    assert_eq!(frame.packet_type, wire::PACKET5_SESSION_UPDATE_REQUEST);
    assert_eq!(frame.payload, payload);

    assert!(verify_frame5(&framed, &keypair.public_bytes()));
    assert!(!verify_frame5(&framed, &buyer_keypair().public_bytes()));
}

// ── Map eviction ──────────────────────────────────────────────────────────────

fn server_entry(last_update: u64) -> ServerEntry {
    ServerEntry {
        server_address: server_addr(),
        buyer_id: BUYER_ID,
        datacenter_id: DATACENTER_ID,
        sdk_version: SdkVersion::new(4, 0, 6),
        num_sessions: 0,
        init_timestamp: last_update,
        last_update,
    }
}

#[tokio::test]
async fn sweeper_reports_evictions_through_the_cleanup_hook() {
    let map: Arc<ShardedMap<ServerEntry>> = Arc::new(ShardedMap::new(16));
    let now = unix_time();
    for key in 0..3u64 {
        map.update(key, server_entry(now - 120));
    }
    map.update(7, server_entry(now));

    let (shutdown_tx, _keep) = broadcast::channel(1);
    let (evicted_tx, mut evicted_rx) = tokio::sync::mpsc::unbounded_channel();
    let sweeper = tokio::spawn(map.clone().timeout_loop(
        30,
        Duration::from_millis(10),
        Sweep::AllShards { per_shard_budget: 8 },
        shutdown_tx.subscribe(),
        move |key, _entry| {
            let _ = evicted_tx.send(key);
        },
    ));

    let mut evicted = Vec::new();
    for _ in 0..3 {
        let key = tokio::time::timeout(Duration::from_secs(5), evicted_rx.recv())
            .await
            .expect("stale entries evicted within the deadline")
            .expect("cleanup channel open");
        evicted.push(key);
    }
    evicted.sort_unstable();
    assert_eq!(evicted, vec![0, 1, 2]);

    assert_eq!(map.len(), 1);
    assert!(map.get(7).is_some());

    shutdown_tx.send(()).unwrap();
    sweeper.await.unwrap();
}

// ── Pricing ───────────────────────────────────────────────────────────────────

#[test]
fn route_prices_follow_the_relay_sellers() {
    let directory = fixture_directory();

    // Relay A prices at its seller's list, relay B at its override, and
    // a relay missing from the directory prices at zero.
    let prices = route_relay_prices_per_gb(&directory, &[RELAY_A, RELAY_B, 0xFFFF]);
    assert_eq!(prices, [100_000_000, 250_000_000, 0, 0, 0]);

    assert_eq!(envelope_bytes(1024, 512, 10), (1_280_000, 640_000));

    // Half a gigabyte each way: both relays plus the platform fee, once.
    let total = total_price_nibblins(&prices, 2, 500_000_000, 500_000_000);
    assert_eq!(total, 100_000_000 + 250_000_000 + NEXT_PRICE_NIBBLINS_PER_GB);

    // Direct slices cost nothing.
    assert_eq!(total_price_nibblins(&prices, 0, 500_000_000, 500_000_000), 0);
}
