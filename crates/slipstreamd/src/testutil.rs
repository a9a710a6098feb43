//! Shared handler-test fixtures: a two-relay world with one route
//! between its datacenters, and a backend state wired to stand-in
//! publishers and a null locator.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use slipstream_core::config::SlipstreamConfig;
use slipstream_core::crypto::{BoxKeypair, SigningKeypair};
use slipstream_core::packets4::frame_packet;
use slipstream_core::packets5::frame_packet5;
use slipstream_core::route::RouteShader;
use slipstream_core::wire::{write_payload, Packet, SdkVersion};
use slipstream_services::database::{
    Buyer, Datacenter, DatacenterAlias, Directory, DirectoryFile, Relay, Seller,
};
use slipstream_services::maps::{unix_time, BuyerCounts, SessionEntry, ShardedMap};
use slipstream_services::matrix::{route_hash, tri_matrix_length, RouteEntry, RouteMatrix};
use slipstream_services::tokens::InternalIpPolicy;
use slipstream_services::trackers::IdTracker;
use slipstream_services::{
    DirectoryHolder, Location, MatrixHolder, Metrics, NoOpBiller, NullIsland, PostSessionHandler,
    Publisher, UserSessionMap, VetoMap, VetoSnapshots,
};

use crate::magic::MagicKeeper;
use crate::state::BackendState;

pub const BUYER_ID: u64 = 0x1111;
pub const DEAD_BUYER_ID: u64 = 0x2222;
pub const DEBUG_BUYER_ID: u64 = 0x3333;

pub const SELLER_ID: u64 = 1;
pub const DATACENTER_ID: u64 = 100;
pub const OTHER_DATACENTER_ID: u64 = 200;
pub const EMPTY_DATACENTER_ID: u64 = 300;
pub const DATACENTER_NAME: &str = "amazing.ohio";
pub const DATACENTER_ALIAS: &str = "fleet-east";

pub const RELAY_A: u64 = 1000;
pub const RELAY_B: u64 = 2000;

pub fn buyer_keypair() -> SigningKeypair {
    SigningKeypair::from_private_bytes(&[7u8; 32])
}

pub fn dead_buyer_keypair() -> SigningKeypair {
    SigningKeypair::from_private_bytes(&[8u8; 32])
}

pub fn client_addr() -> SocketAddr {
    "10.100.0.1:30000".parse().unwrap()
}

pub fn server_addr() -> SocketAddr {
    "10.1.0.100:50000".parse().unwrap()
}

pub fn relay_a_addr() -> SocketAddr {
    "10.1.0.1:40000".parse().unwrap()
}

pub fn relay_b_addr() -> SocketAddr {
    "10.2.0.1:40000".parse().unwrap()
}

pub fn test_directory() -> Directory {
    let file = DirectoryFile {
        created_at: "test".to_string(),
        buyers: vec![
            Buyer {
                id: BUYER_ID,
                name: "Raptor Interactive".to_string(),
                code: "raptor".to_string(),
                live: true,
                debug: false,
                public_key: buyer_keypair().public_bytes(),
                route_shader: RouteShader::default(),
                internal_config: Default::default(),
            },
            Buyer {
                id: DEAD_BUYER_ID,
                name: "Sunset Softworks".to_string(),
                code: "sunset".to_string(),
                live: false,
                debug: false,
                public_key: dead_buyer_keypair().public_bytes(),
                route_shader: RouteShader::default(),
                internal_config: Default::default(),
            },
            Buyer {
                id: DEBUG_BUYER_ID,
                name: "Raptor QA".to_string(),
                code: "raptor-qa".to_string(),
                live: true,
                debug: true,
                public_key: SigningKeypair::from_private_bytes(&[9u8; 32]).public_bytes(),
                route_shader: RouteShader { force_next: true, ..RouteShader::default() },
                internal_config: Default::default(),
            },
        ],
        sellers: vec![Seller {
            id: SELLER_ID,
            name: "Amazing".to_string(),
            code: "amazing".to_string(),
            egress_price_nibblins_per_gb: 100_000_000,
        }],
        datacenters: vec![
            Datacenter {
                id: DATACENTER_ID,
                name: DATACENTER_NAME.to_string(),
                alias: "us-east-2".to_string(),
                native: "ohio-1".to_string(),
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
            Datacenter {
                id: EMPTY_DATACENTER_ID,
                name: "amazing.reno".to_string(),
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
                public_key: BoxKeypair::from_private_bytes(&[1u8; 32]).public,
                seller_id: SELLER_ID,
                datacenter_id: DATACENTER_ID,
                egress_price_override: 0,
            },
            Relay {
                id: RELAY_B,
                name: "amazing.chicago.a".to_string(),
                public_addr: relay_b_addr(),
                internal_addr: None,
                public_key: BoxKeypair::from_private_bytes(&[2u8; 32]).public,
                seller_id: SELLER_ID,
                datacenter_id: OTHER_DATACENTER_ID,
                egress_price_override: 0,
            },
        ],
        datacenter_aliases: vec![DatacenterAlias {
            buyer_id: BUYER_ID,
            alias: DATACENTER_ALIAS.to_string(),
            datacenter_id: DATACENTER_ID,
        }],
    };
    Directory::build(file).unwrap()
}

/// Relay A (index 0) sits in the server's datacenter; relay B (index 1)
/// is one hop away. The single matrix entry carries one route, B -> A,
/// costing 10 ms between the relays.
pub fn test_matrix(created_at: u64) -> RouteMatrix {
    let mut relay_id_to_index = HashMap::new();
    relay_id_to_index.insert(RELAY_A, 0);
    relay_id_to_index.insert(RELAY_B, 1);

    let mut route_entries = vec![RouteEntry::default(); tri_matrix_length(2)];
    let entry = &mut route_entries[0];
    entry.direct_cost = 50;
    entry.num_routes = 1;
    entry.route_cost[0] = 10;
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
        created_at,
        dest_relays: vec![true, true],
        ..RouteMatrix::default()
    }
}

/// A bare direct session entry for map-level tests. Handler tests
/// should create entries through slice 0 instead.
pub fn test_session_entry(session_id: u64) -> SessionEntry {
    let now = unix_time();
    SessionEntry {
        session_id,
        buyer_id: BUYER_ID,
        user_hash: 0xABCD,
        datacenter_id: DATACENTER_ID,
        sdk_version: SdkVersion::new(4, 0, 6),
        client_address: client_addr(),
        server_address: server_addr(),
        session_version: 0,
        route_relays: Vec::new(),
        route_cost: 0,
        route_relay_names: Vec::new(),
        near_relay_ids: Vec::new(),
        expected_slice: 1,
        cached_response: Vec::new(),
        cached_response_slice: 0,
        location: Location::default(),
        ever_on_next: false,
        fell_back_to_direct: false,
        envelope_bytes_up_sum: 0,
        envelope_bytes_down_sum: 0,
        duration_on_next: 0,
        session_events: 0,
        packets_sent_client_to_server: 0,
        packets_sent_server_to_client: 0,
        packets_lost_client_to_server: 0,
        packets_lost_server_to_client: 0,
        packets_out_of_order_client_to_server: 0,
        packets_out_of_order_server_to_client: 0,
        start_timestamp: now,
        last_update: now,
    }
}

pub fn test_state() -> Arc<BackendState> {
    test_state_with_matrix(test_matrix(unix_time()))
}

pub fn test_state_with_matrix(matrix: RouteMatrix) -> Arc<BackendState> {
    let config = SlipstreamConfig::default();
    let keys = config.keys.resolve().unwrap();
    let public_address: SocketAddr = config.network.public_address.parse().unwrap();
    let internal_ips = InternalIpPolicy::new(
        config.routing.enable_internal_ips,
        config.routing.internal_ip_sellers.clone(),
    );
    let metrics = Arc::new(Metrics::new());
    let postsession = Arc::new(PostSessionHandler::new(
        &config.postsession,
        vec![Arc::new(slipstream_services::postsession::LogPublisher) as Arc<dyn Publisher>],
        Arc::new(NoOpBiller),
        metrics.clone(),
    ));

    Arc::new(BackendState {
        config,
        keys,
        public_address,
        sessions: Arc::new(ShardedMap::new(8)),
        servers: Arc::new(ShardedMap::new(8)),
        relays: Arc::new(ShardedMap::new(8)),
        buyer_counts: Arc::new(BuyerCounts::new()),
        user_sessions: Arc::new(UserSessionMap::new()),
        matrix: Arc::new(MatrixHolder::new(matrix)),
        directory: Arc::new(DirectoryHolder::new(test_directory())),
        veto: Arc::new(VetoMap::new()),
        veto_snapshots: Arc::new(VetoSnapshots::new()),
        datacenter_tracker: Arc::new(IdTracker::new()),
        unknown_datacenter_tracker: Arc::new(IdTracker::new()),
        locator: Arc::new(NullIsland),
        magic: Arc::new(MagicKeeper::new()),
        postsession,
        internal_ips,
        metrics,
    })
}

/// Frame a v4 request signed by the default test buyer.
pub fn frame_v4_request<P: Packet>(packet: &mut P) -> Vec<u8> {
    frame_v4_signed(packet, &buyer_keypair())
}

pub fn frame_v4_signed<P: Packet>(packet: &mut P, keypair: &SigningKeypair) -> Vec<u8> {
    let payload = write_payload(packet).unwrap();
    frame_packet(P::PACKET_TYPE, &payload, keypair)
}

/// Frame a v5 request with the backend's current magic, addressed from
/// `from` to the backend's public address, signed by the default buyer.
pub fn frame_v5_request<P: Packet>(
    state: &BackendState,
    packet: &mut P,
    from: SocketAddr,
) -> Vec<u8> {
    frame_v5_signed(state, packet, from, &buyer_keypair())
}

pub fn frame_v5_signed<P: Packet>(
    state: &BackendState,
    packet: &mut P,
    from: SocketAddr,
    keypair: &SigningKeypair,
) -> Vec<u8> {
    let payload = write_payload(packet).unwrap();
    frame_packet5(
        P::PACKET_TYPE,
        &payload,
        keypair,
        &state.magic.values().current,
        &from,
        &state.public_address,
    )
}
