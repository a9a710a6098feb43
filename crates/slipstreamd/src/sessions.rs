//! Session update handling: the per-slice decision pipeline.
//!
//! Every 10 seconds a client reports one slice of measurements. The
//! handler validates the report, restores the session blob the client
//! carried back, runs the route decision against the current matrix,
//! seals tokens for whatever route was granted, and returns a response
//! with the re-encoded blob inside. All mutable per-slice state lives
//! in the blob; the session map only keeps what the blob cannot carry.

use std::net::SocketAddr;
use std::sync::Arc;

use slipstream_core::crypto::{self, verify_signature_parts};
use slipstream_core::packets4::{
    frame_packet, open_frame, verify_frame, NearRelayAddress, SessionResponsePacket,
    SessionUpdatePacket,
};
use slipstream_core::packets5::{
    frame_packet5, open_frame5, verify_frame5, NearRelayToken5, SessionResponsePacket5,
    SessionUpdateRequestPacket5, MAX_SESSION_DEBUG_BYTES, ZERO_MAGIC,
};
use slipstream_core::route::RouteState;
use slipstream_core::session_data::{read_session_data, write_session_data, SessionData};
use slipstream_core::wire::{
    self, read_payload, write_payload, RouteType, SdkVersion, MAX_NEAR_RELAYS, SLICE_SECONDS,
};
use slipstream_services::billing::{
    envelope_bytes, route_relay_prices_per_gb, total_price_nibblins, Nibblin,
};
use slipstream_services::database::{Buyer, Directory};
use slipstream_services::decision::{self, NearRelayPings, NextRoute, SliceStats};
use slipstream_services::matrix::{RouteMatrix, MAX_RELAYS_PER_ROUTE};
use slipstream_services::maps::{unix_time, SessionEntry};
use slipstream_services::{BillingEntry, Location, PortalData};

use crate::state::BackendState;

/// How long a near relay ping token stays valid (seconds).
const NEAR_RELAY_PING_SECONDS: u64 = 15;

// ── Normalized slice request ──────────────────────────────────────────────────

/// One slice report, normalized across packet generations so the
/// pipeline never has to care which wire format it came in on.
struct SliceRequest {
    sdk_version: SdkVersion,
    buyer_id: u64,
    datacenter_id: u64,
    session_id: u64,
    slice_number: u32,
    session_data: Vec<u8>,
    client_address: SocketAddr,
    server_address: SocketAddr,
    client_route_public_key: [u8; 32],
    server_route_public_key: [u8; 32],
    user_hash: u64,

    direct_rtt: f32,
    direct_jitter: f32,
    direct_packet_loss: f32,

    next: bool,
    next_rtt: f32,
    next_jitter: f32,
    next_packet_loss: f32,

    reported: bool,
    fallback_to_direct: bool,
    /// Reason bits, only carried by the older generation.
    fallback_flags: Option<u64>,
    client_ping_timed_out: bool,
    session_events: u64,

    packets_sent_client_to_server: u64,
    packets_sent_server_to_client: u64,
    packets_lost_client_to_server: u64,
    packets_lost_server_to_client: u64,
    out_of_order_client_to_server: u64,
    out_of_order_server_to_client: u64,

    near_relay_ids: Vec<u64>,
    near_relay_rtt: Vec<i32>,
    near_relay_jitter: Vec<i32>,
    near_relay_packet_loss: Vec<i32>,
}

impl SliceRequest {
    /// Missing server address means tokens can never be built, so the
    /// report is unusable.
    fn from_v4(packet: &SessionUpdatePacket, from: SocketAddr) -> Option<Self> {
        let server_address = packet.server_address?;
        let mut near_relay_ids = Vec::with_capacity(packet.near_relay_pings.len());
        let mut near_relay_rtt = Vec::with_capacity(packet.near_relay_pings.len());
        let mut near_relay_jitter = Vec::with_capacity(packet.near_relay_pings.len());
        let mut near_relay_packet_loss = Vec::with_capacity(packet.near_relay_pings.len());
        for ping in &packet.near_relay_pings {
            near_relay_ids.push(ping.relay_id);
            near_relay_rtt.push(i32::from(ping.rtt));
            near_relay_jitter.push(i32::from(ping.jitter));
            near_relay_packet_loss.push(i32::from(ping.packet_loss_percent));
        }
        Some(Self {
            sdk_version: packet.sdk_version,
            buyer_id: packet.buyer_id,
            datacenter_id: packet.datacenter_id,
            session_id: packet.session_id,
            slice_number: packet.slice_number,
            session_data: packet.session_data.clone(),
            client_address: packet.client_address.unwrap_or(from),
            server_address,
            client_route_public_key: packet.client_route_public_key,
            server_route_public_key: packet.server_route_public_key,
            user_hash: packet.user_hash,
            direct_rtt: packet.direct_rtt,
            direct_jitter: packet.direct_jitter,
            direct_packet_loss: packet.direct_packet_loss,
            next: packet.next,
            next_rtt: packet.next_rtt,
            next_jitter: packet.next_jitter,
            next_packet_loss: packet.next_packet_loss,
            reported: packet.reported,
            fallback_to_direct: packet.fallback_to_direct,
            fallback_flags: Some(packet.fallback_flags),
            client_ping_timed_out: packet.client_ping_timed_out,
            session_events: packet.session_events,
            packets_sent_client_to_server: packet.packets_sent_client_to_server,
            packets_sent_server_to_client: packet.packets_sent_server_to_client,
            packets_lost_client_to_server: packet.packets_lost_client_to_server,
            packets_lost_server_to_client: packet.packets_lost_server_to_client,
            out_of_order_client_to_server: packet.out_of_order_client_to_server,
            out_of_order_server_to_client: packet.out_of_order_server_to_client,
            near_relay_ids,
            near_relay_rtt,
            near_relay_jitter,
            near_relay_packet_loss,
        })
    }

    fn from_v5(packet: &SessionUpdateRequestPacket5, from: SocketAddr) -> Option<Self> {
        let server_address = packet.server_address?;
        let mut near_relay_ids = Vec::with_capacity(packet.near_relay_pings.len());
        let mut near_relay_rtt = Vec::with_capacity(packet.near_relay_pings.len());
        let mut near_relay_jitter = Vec::with_capacity(packet.near_relay_pings.len());
        let mut near_relay_packet_loss = Vec::with_capacity(packet.near_relay_pings.len());
        for ping in &packet.near_relay_pings {
            near_relay_ids.push(ping.relay_id);
            near_relay_rtt.push(i32::from(ping.rtt));
            near_relay_jitter.push(i32::from(ping.jitter));
            near_relay_packet_loss.push(ping.packet_loss.round() as i32);
        }
        Some(Self {
            sdk_version: packet.sdk_version,
            buyer_id: packet.buyer_id,
            datacenter_id: packet.datacenter_id,
            session_id: packet.session_id,
            slice_number: packet.slice_number,
            session_data: packet.session_data.clone(),
            client_address: packet.client_address.unwrap_or(from),
            server_address,
            client_route_public_key: packet.client_route_public_key,
            server_route_public_key: packet.server_route_public_key,
            user_hash: packet.user_hash,
            direct_rtt: packet.direct_rtt,
            direct_jitter: packet.direct_jitter,
            direct_packet_loss: packet.direct_packet_loss,
            next: packet.next,
            next_rtt: packet.next_rtt,
            next_jitter: packet.next_jitter,
            next_packet_loss: packet.next_packet_loss,
            reported: packet.reported,
            fallback_to_direct: packet.fallback_to_direct,
            fallback_flags: None,
            client_ping_timed_out: packet.client_ping_timed_out,
            session_events: packet.session_events,
            packets_sent_client_to_server: packet.packets_sent_client_to_server,
            packets_sent_server_to_client: packet.packets_sent_server_to_client,
            packets_lost_client_to_server: packet.packets_lost_client_to_server,
            packets_lost_server_to_client: packet.packets_lost_server_to_client,
            out_of_order_client_to_server: packet.out_of_order_client_to_server,
            out_of_order_server_to_client: packet.out_of_order_server_to_client,
            near_relay_ids,
            near_relay_rtt,
            near_relay_jitter,
            near_relay_packet_loss,
        })
    }
}

// ── Wrappers per packet generation ────────────────────────────────────────────

pub fn handle_session_update(
    state: &Arc<BackendState>,
    data: &[u8],
    from: SocketAddr,
) -> Option<Vec<u8>> {
    state.metrics.session_update_packets.inc();

    let frame = match open_frame(data) {
        Ok(frame) => frame,
        Err(_) => {
            state.metrics.bad_packet_filter.inc();
            return None;
        }
    };
    let packet: SessionUpdatePacket = match read_payload(frame.payload) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::debug!(error = %e, "unreadable session update");
            state.metrics.read_packet_failure.inc();
            return None;
        }
    };

    let directory = state.directory.snapshot();
    let matrix = state.matrix.snapshot();
    let now = unix_time();

    let buyer = admit(state, &directory, packet.buyer_id, |public| {
        verify_frame(data, public)
    })?;
    if !packet.sdk_version.at_least(4, 0, 0) {
        state.metrics.sdk_too_old.inc();
        return None;
    }
    if matrix_is_stale(state, &matrix, now) {
        state.metrics.stale_route_matrix.inc();
        return None;
    }

    let request = match SliceRequest::from_v4(&packet, from) {
        Some(request) => request,
        None => {
            state.metrics.read_packet_failure.inc();
            return None;
        }
    };

    match process_slice(state, &directory, &matrix, buyer, &request, now)? {
        SliceReply::Replay(bytes) => Some(bytes),
        SliceReply::Fresh(outcome) => {
            let mut response = SessionResponsePacket {
                session_id: request.session_id,
                slice_number: request.slice_number,
                route_type: outcome.route_type,
                multipath: outcome.multipath,
                committed: outcome.committed,
                tokens: outcome.tokens.clone(),
                session_data: outcome.blob_bytes.clone(),
                near_relays: outcome
                    .near_relays
                    .iter()
                    .map(|&(relay_id, address)| NearRelayAddress { relay_id, address })
                    .collect(),
            };
            let payload = match write_payload(&mut response) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(error = %e, "could not write session response");
                    state.metrics.write_response_failure.inc();
                    return None;
                }
            };
            let framed = frame_packet(wire::PACKET_SESSION_RESPONSE, &payload, &state.keys.signing);
            finish_slice(state, &request, *outcome, framed, now)
        }
    }
}

pub fn handle_session_update5(
    state: &Arc<BackendState>,
    data: &[u8],
    from: SocketAddr,
) -> Option<Vec<u8>> {
    state.metrics.session_update_packets.inc();

    let frame = match open_frame5(data) {
        Ok(frame) => frame,
        Err(_) => {
            state.metrics.bad_packet_filter.inc();
            return None;
        }
    };
    let packet: SessionUpdateRequestPacket5 = match read_payload(frame.payload) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::debug!(error = %e, "unreadable session update");
            state.metrics.read_packet_failure.inc();
            return None;
        }
    };

    let directory = state.directory.snapshot();
    let matrix = state.matrix.snapshot();
    let now = unix_time();

    let buyer = admit(state, &directory, packet.buyer_id, |public| {
        verify_frame5(data, public)
    })?;
    if !packet.sdk_version.at_least(5, 0, 0) {
        state.metrics.sdk_too_old.inc();
        return None;
    }
    if matrix_is_stale(state, &matrix, now) {
        state.metrics.stale_route_matrix.inc();
        return None;
    }

    // The blob was signed by us when it was handed out; a client cannot
    // forge or alter one.
    if !packet.session_data.is_empty()
        && !verify_signature_parts(
            &state.keys.signing.public_bytes(),
            &[&packet.session_data],
            &packet.session_data_signature,
        )
    {
        state.metrics.read_session_data_failure.inc();
        return None;
    }

    let request = match SliceRequest::from_v5(&packet, from) {
        Some(request) => request,
        None => {
            state.metrics.read_packet_failure.inc();
            return None;
        }
    };

    match process_slice(state, &directory, &matrix, buyer, &request, now)? {
        SliceReply::Replay(bytes) => Some(bytes),
        SliceReply::Fresh(outcome) => {
            // Ping tokens are only needed once, when the relay set is
            // announced on the first slice.
            let near_relays = if request.slice_number == 0 {
                near_relay_tokens(state, &request, &outcome.near_relays, now)
            } else {
                Vec::new()
            };
            let near_relay_expire_timestamp = if near_relays.is_empty() {
                0
            } else {
                now + NEAR_RELAY_PING_SECONDS
            };
            let mut response = SessionResponsePacket5 {
                session_id: request.session_id,
                slice_number: request.slice_number,
                session_data: outcome.blob_bytes.clone(),
                session_data_signature: state.keys.signing.sign(&outcome.blob_bytes),
                route_type: outcome.route_type,
                near_relays,
                near_relay_expire_timestamp,
                multipath: outcome.multipath,
                tokens: outcome.tokens.clone(),
                debug: outcome.debug.clone().unwrap_or_default(),
            };
            let payload = match write_payload(&mut response) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(error = %e, "could not write session response");
                    state.metrics.write_response_failure.inc();
                    return None;
                }
            };
            let framed = frame_packet5(
                wire::PACKET5_SESSION_RESPONSE,
                &payload,
                &state.keys.signing,
                &ZERO_MAGIC,
                &state.public_address,
                &from,
            );
            finish_slice(state, &request, *outcome, framed, now)
        }
    }
}

/// Buyer lookup, liveness and signature admission shared by both
/// generations. `verify` closes over the raw datagram.
fn admit<'a>(
    state: &BackendState,
    directory: &'a Directory,
    buyer_id: u64,
    verify: impl Fn(&[u8; 32]) -> bool,
) -> Option<&'a Buyer> {
    let Some(buyer) = directory.buyer_by_id(buyer_id) else {
        state.metrics.buyer_not_found.inc();
        return None;
    };
    if !buyer.live {
        state.metrics.buyer_not_live.inc();
        return None;
    }
    if !verify(&buyer.public_key) {
        state.metrics.signature_check_failed.inc();
        return None;
    }
    Some(buyer)
}

fn matrix_is_stale(state: &BackendState, matrix: &RouteMatrix, now: u64) -> bool {
    matrix.is_stale(now, state.config.routing.matrix_stale_seconds)
}

/// Store the entry and send-side bookkeeping shared by both wrappers.
/// The response is cached on the entry before the map write so a retry
/// arriving right after the write already sees it.
fn finish_slice(
    state: &BackendState,
    request: &SliceRequest,
    outcome: SliceOutcome,
    framed: Vec<u8>,
    now: u64,
) -> Option<Vec<u8>> {
    let mut entry = outcome.entry;
    entry.cached_response = framed.clone();
    entry.cached_response_slice = request.slice_number;
    state.sessions.update(request.session_id, entry);
    if outcome.new_session {
        state.buyer_counts.increment(request.buyer_id);
        state.user_sessions.add(request.user_hash, request.session_id, now);
    }
    Some(framed)
}

/// Sealed ping tokens for the announced near relays. The client port is
/// zeroed because ping traffic may leave from a different socket.
fn near_relay_tokens(
    state: &BackendState,
    request: &SliceRequest,
    near_relays: &[(u64, Option<SocketAddr>)],
    now: u64,
) -> Vec<NearRelayToken5> {
    let mut client = request.client_address;
    client.set_port(0);
    let client_bytes = wire::address_filter_bytes(&client);
    let expire = now + NEAR_RELAY_PING_SECONDS;
    near_relays
        .iter()
        .map(|&(relay_id, address)| {
            let ping_token = match address {
                Some(addr) => crypto::ping_token(
                    &state.keys.ping_key,
                    expire,
                    &client_bytes,
                    &wire::address_filter_bytes(&addr),
                ),
                None => [0u8; 32],
            };
            NearRelayToken5 { relay_id, address, ping_token }
        })
        .collect()
}

// ── The slice pipeline ────────────────────────────────────────────────────────

/// Everything a processed slice produced, before generation-specific
/// framing.
struct SliceOutcome {
    entry: SessionEntry,
    new_session: bool,
    blob_bytes: Vec<u8>,
    route_type: RouteType,
    multipath: bool,
    committed: bool,
    tokens: Vec<u8>,
    near_relays: Vec<(u64, Option<SocketAddr>)>,
    debug: Option<String>,
}

enum SliceReply {
    Fresh(Box<SliceOutcome>),
    /// The slice was already answered; resend the cached bytes verbatim.
    Replay(Vec<u8>),
}

fn process_slice(
    state: &BackendState,
    directory: &Directory,
    matrix: &RouteMatrix,
    buyer: &Buyer,
    request: &SliceRequest,
    now: u64,
) -> Option<SliceReply> {
    match state.sessions.get(request.session_id) {
        Some(entry) if request.slice_number == entry.expected_slice => {
            let outcome =
                process_existing_slice(state, directory, matrix, buyer, request, entry, now)?;
            Some(SliceReply::Fresh(Box::new(outcome)))
        }
        Some(entry) if request.slice_number.wrapping_add(1) == entry.expected_slice => {
            // A retry of the slice we already answered. Replay the exact
            // bytes; reprocessing would bill twice and could decide
            // differently.
            if entry.cached_response_slice == request.slice_number
                && !entry.cached_response.is_empty()
            {
                return Some(SliceReply::Replay(entry.cached_response));
            }
            state.metrics.bad_slice_number.inc();
            None
        }
        Some(_) => {
            state.metrics.bad_slice_number.inc();
            None
        }
        None if request.slice_number == 0 => {
            let outcome = process_new_session(state, directory, matrix, buyer, request, now);
            Some(SliceReply::Fresh(Box::new(outcome)))
        }
        None => {
            state.metrics.bad_session_id.inc();
            None
        }
    }
}

fn process_new_session(
    state: &BackendState,
    directory: &Directory,
    matrix: &RouteMatrix,
    buyer: &Buyer,
    request: &SliceRequest,
    now: u64,
) -> SliceOutcome {
    let mut route_state = RouteState::default();

    let location = match state.locator.locate(request.client_address.ip()) {
        Ok(location) => location,
        Err(e) => {
            tracing::debug!(error = %e, "could not locate client");
            state.metrics.client_locate_failure.inc();
            route_state.location_veto = true;
            Location::default()
        }
    };

    let datacenter = directory.datacenter_for_buyer(request.buyer_id, request.datacenter_id);
    match datacenter {
        Some(datacenter) => state.datacenter_tracker.add(datacenter.id),
        None => {
            state.metrics.datacenter_not_found.inc();
            state.unknown_datacenter_tracker.add(request.datacenter_id);
        }
    }

    // Near relays are picked once, from the client's location toward the
    // server's datacenter, and stay fixed for the session's lifetime.
    let mut near_relays: Vec<(u64, Option<SocketAddr>)> = Vec::new();
    if !buyer.route_shader.disabled && !route_state.location_veto {
        if let Some(datacenter) = datacenter {
            let (ids, addresses) = matrix.near_relays(
                request.direct_rtt,
                location.latitude,
                location.longitude,
                datacenter.latitude,
                datacenter.longitude,
                MAX_NEAR_RELAYS,
            );
            if ids.is_empty() {
                state.metrics.near_relay_locate_failure.inc();
            }
            near_relays = ids.into_iter().zip(addresses.into_iter().map(Some)).collect();
        }
    }

    let entry = SessionEntry {
        session_id: request.session_id,
        buyer_id: request.buyer_id,
        user_hash: request.user_hash,
        datacenter_id: datacenter.map(|d| d.id).unwrap_or(request.datacenter_id),
        sdk_version: request.sdk_version,
        client_address: request.client_address,
        server_address: request.server_address,
        session_version: 0,
        route_relays: Vec::new(),
        route_cost: 0,
        route_relay_names: Vec::new(),
        near_relay_ids: near_relays.iter().map(|&(id, _)| id).collect(),
        expected_slice: 1,
        cached_response: Vec::new(),
        cached_response_slice: 0,
        location: location.clone(),
        ever_on_next: false,
        fell_back_to_direct: false,
        envelope_bytes_up_sum: 0,
        envelope_bytes_down_sum: 0,
        duration_on_next: 0,
        session_events: request.session_events,
        packets_sent_client_to_server: request.packets_sent_client_to_server,
        packets_sent_server_to_client: request.packets_sent_server_to_client,
        packets_lost_client_to_server: request.packets_lost_client_to_server,
        packets_lost_server_to_client: request.packets_lost_server_to_client,
        packets_out_of_order_client_to_server: request.out_of_order_client_to_server,
        packets_out_of_order_server_to_client: request.out_of_order_server_to_client,
        start_timestamp: now,
        last_update: now,
    };

    let mut blob = SessionData {
        session_id: request.session_id,
        slice_number: 1,
        expire_timestamp: now + 2 * SLICE_SECONDS,
        session_version: 0,
        route_state,
        session_duration: SLICE_SECONDS as u32,
        start_timestamp: now,
        session_events: request.session_events,
        ..SessionData::default()
    };

    state.metrics.direct_slices.inc();
    submit_slice_records(state, directory, request, &entry, &blob, RouteType::Direct, false, 0.0, 0, 0, now);

    let blob_bytes = encode_blob(state, &mut blob);
    let debug = buyer
        .debug
        .then(|| debug_summary(RouteType::Direct, &blob.route_state, &entry));

    SliceOutcome {
        entry,
        new_session: true,
        blob_bytes,
        route_type: RouteType::Direct,
        multipath: false,
        committed: false,
        tokens: Vec::new(),
        near_relays,
        debug,
    }
}

fn process_existing_slice(
    state: &BackendState,
    directory: &Directory,
    matrix: &RouteMatrix,
    buyer: &Buyer,
    request: &SliceRequest,
    mut entry: SessionEntry,
    now: u64,
) -> Option<SliceOutcome> {
    let mut blob = match read_session_data(&request.session_data) {
        Ok(blob) => blob,
        Err(e) => {
            tracing::debug!(error = %e, "unreadable session data");
            state.metrics.read_session_data_failure.inc();
            return None;
        }
    };
    if blob.session_id != request.session_id || blob.session_version != entry.session_version {
        state.metrics.bad_session_id.inc();
        return None;
    }
    if blob.slice_number != request.slice_number {
        state.metrics.bad_slice_number.inc();
        return None;
    }
    if !blob.fresh(now) {
        state.metrics.read_session_data_failure.inc();
        return None;
    }

    // What the session was doing during the slice being reported.
    let was_on_next = blob.route_state.next;

    let real_packet_loss = real_packet_loss(request, &entry);

    let mut skip_decision = false;
    if request.fallback_to_direct {
        if !entry.fell_back_to_direct {
            entry.fell_back_to_direct = true;
            blob.route_state.next = false;
            blob.route_state.veto = true;
            match request.fallback_flags {
                Some(flags) => state.metrics.record_fallback_flags(flags),
                None => state.metrics.fallback_to_direct.inc(),
            }
        }
        skip_decision = true;
    }
    if request.client_ping_timed_out {
        state.metrics.client_ping_timed_out.inc();
        skip_decision = true;
    }

    let dest_relay_ids = matrix.datacenter_relays(entry.datacenter_id);
    if dest_relay_ids.is_empty() && !skip_decision {
        state.metrics.no_relays_in_datacenter.inc();
        skip_decision = true;
    }

    let mut route_type = RouteType::Direct;
    let mut tokens = Vec::new();
    let mut route_switched = false;

    if !skip_decision {
        let direct_latency = request.direct_rtt.ceil() as i32;
        let direct_jitter = request.direct_jitter.ceil() as i32;
        let direct_packet_loss = request.direct_packet_loss.round() as i32;

        let pings = NearRelayPings {
            ids: &request.near_relay_ids,
            rtt: &request.near_relay_rtt,
            jitter: &request.near_relay_jitter,
            packet_loss: &request.near_relay_packet_loss,
        };
        let mut candidates = decision::reframe_relays(
            &mut blob.route_state,
            &matrix.relay_id_to_index,
            request.slice_number as i32,
            direct_latency,
            direct_jitter,
            direct_packet_loss,
            &pings,
            &dest_relay_ids,
        );

        let stats = SliceStats {
            direct_latency,
            next_latency: request.next_rtt.ceil() as i32,
            predicted_latency: entry.route_cost,
            direct_packet_loss: real_packet_loss,
            next_packet_loss: request.next_packet_loss,
        };

        if blob.route_state.next && entry.route_relays.is_empty() {
            // Blob and entry disagree about being on a route. Trust the
            // entry and shut acceleration down for this session.
            state.metrics.next_without_route_relays.inc();
            blob.route_state.next = false;
            blob.route_state.veto = true;
        } else if blob.route_state.next && !request.next {
            // The SDK walked away from the route on its own.
            state.metrics.sdk_aborted.inc();
            blob.route_state.next = false;
            blob.route_state.veto = true;
        } else if !blob.route_state.next {
            let multipath_veto = state.veto_snapshots.for_buyer(request.buyer_id);
            if let Some(route) = decision::take_next(
                &matrix.route_entries,
                &buyer.route_shader,
                &buyer.internal_config,
                &mut blob.route_state,
                &multipath_veto,
                request.user_hash,
                stats,
                &mut candidates,
            ) {
                blob.session_version = blob.session_version.wrapping_add(1);
                match build_tokens(state, directory, matrix, request, &route, blob.session_version, RouteType::New, buyer, now) {
                    Some(sealed) => {
                        tokens = sealed;
                        route_type = RouteType::New;
                        store_route(&mut entry, matrix, &route);
                    }
                    None => {
                        // Stay direct this slice; the next report will
                        // abort the phantom route and self-heal.
                        state.metrics.token_build_failure.inc();
                    }
                }
            }
        } else {
            let mut relays = [0i32; MAX_RELAYS_PER_ROUTE];
            let current = if decision::reframe_route(
                &mut blob.route_state,
                &matrix.relay_id_to_index,
                &entry.route_relays,
                &mut relays,
            ) {
                NextRoute {
                    cost: entry.route_cost,
                    num_relays: entry.route_relays.len() as i32,
                    relays,
                }
            } else {
                state.metrics.route_does_not_exist.inc();
                NextRoute::default()
            };

            let before = blob.route_state.clone();
            let (route, switched) = decision::stay_on_next(
                &matrix.route_entries,
                &buyer.route_shader,
                &buyer.internal_config,
                &mut blob.route_state,
                request.user_hash,
                stats,
                current,
                &mut candidates,
            );
            match route {
                Some(route) => {
                    let (kind, bump) = if switched {
                        state.metrics.route_switched.inc();
                        (RouteType::New, true)
                    } else {
                        (RouteType::Continue, false)
                    };
                    if bump {
                        blob.session_version = blob.session_version.wrapping_add(1);
                    }
                    match build_tokens(state, directory, matrix, request, &route, blob.session_version, kind, buyer, now) {
                        Some(sealed) => {
                            tokens = sealed;
                            route_type = kind;
                            route_switched = switched;
                            if switched {
                                store_route(&mut entry, matrix, &route);
                            } else {
                                entry.route_cost = route.cost;
                            }
                        }
                        None => {
                            state.metrics.token_build_failure.inc();
                        }
                    }
                }
                None => {
                    record_vetoes(state, &before, &blob.route_state, request);
                    clear_route(&mut entry);
                }
            }
        }
    }

    let on_next = route_type != RouteType::Direct;
    if on_next {
        state.metrics.next_slices.inc();
    } else {
        state.metrics.direct_slices.inc();
    }
    if request.next {
        entry.ever_on_next = true;
    }

    blob.session_duration = blob.session_duration.saturating_add(SLICE_SECONDS as u32);
    if was_on_next {
        blob.duration_on_next = blob.duration_on_next.saturating_add(SLICE_SECONDS as u32);
    }
    blob.session_events |= request.session_events;
    entry.duration_on_next = blob.duration_on_next;
    entry.session_events = blob.session_events;

    // Envelope is granted for the token lifetime, so the slice that
    // issues a fresh route is billed for the doubled window.
    let mut envelope_up = 0u64;
    let mut envelope_down = 0u64;
    if on_next {
        let granted_seconds = match route_type {
            RouteType::New => 2 * SLICE_SECONDS,
            _ => SLICE_SECONDS,
        };
        let (up, down) = envelope_bytes(
            u64::from(buyer.route_shader.bandwidth_envelope_up_kbps),
            u64::from(buyer.route_shader.bandwidth_envelope_down_kbps),
            granted_seconds,
        );
        envelope_up = up;
        envelope_down = down;
        blob.envelope_bytes_up_sum += up;
        blob.envelope_bytes_down_sum += down;
    }
    entry.envelope_bytes_up_sum = blob.envelope_bytes_up_sum;
    entry.envelope_bytes_down_sum = blob.envelope_bytes_down_sum;

    submit_slice_records(
        state,
        directory,
        request,
        &entry,
        &blob,
        route_type,
        route_switched,
        real_packet_loss,
        envelope_up,
        envelope_down,
        now,
    );

    // Write-back. The blob the client carries is the authoritative copy
    // of everything decided this slice.
    entry.packets_sent_client_to_server = request.packets_sent_client_to_server;
    entry.packets_sent_server_to_client = request.packets_sent_server_to_client;
    entry.packets_lost_client_to_server = request.packets_lost_client_to_server;
    entry.packets_lost_server_to_client = request.packets_lost_server_to_client;
    entry.packets_out_of_order_client_to_server = request.out_of_order_client_to_server;
    entry.packets_out_of_order_server_to_client = request.out_of_order_server_to_client;
    entry.sdk_version = request.sdk_version;
    entry.client_address = request.client_address;
    entry.server_address = request.server_address;
    entry.session_version = blob.session_version;
    entry.expected_slice = request.slice_number + 1;
    entry.last_update = now;

    blob.slice_number = request.slice_number + 1;
    blob.expire_timestamp = now + 2 * SLICE_SECONDS;

    let blob_bytes = encode_blob(state, &mut blob);

    let near_relays = entry
        .near_relay_ids
        .iter()
        .map(|&id| {
            let address = matrix
                .relay_id_to_index
                .get(&id)
                .map(|&index| matrix.relay_addresses[index as usize]);
            (id, address)
        })
        .collect();

    let debug = buyer
        .debug
        .then(|| debug_summary(route_type, &blob.route_state, &entry));

    Some(SliceOutcome {
        entry,
        new_session: false,
        blob_bytes,
        route_type,
        multipath: on_next && blob.route_state.multipath,
        committed: on_next && blob.route_state.committed,
        tokens,
        near_relays,
        debug,
    })
}

// ── Pipeline helpers ──────────────────────────────────────────────────────────

/// Worst-direction loss over the game packet counters since the last
/// slice, in percent. Counters are cumulative, so deltas are taken
/// against the entry's baselines.
fn real_packet_loss(request: &SliceRequest, entry: &SessionEntry) -> f32 {
    let sent_up = request
        .packets_sent_client_to_server
        .saturating_sub(entry.packets_sent_client_to_server);
    let lost_up = request
        .packets_lost_client_to_server
        .saturating_sub(entry.packets_lost_client_to_server);
    let sent_down = request
        .packets_sent_server_to_client
        .saturating_sub(entry.packets_sent_server_to_client);
    let lost_down = request
        .packets_lost_server_to_client
        .saturating_sub(entry.packets_lost_server_to_client);

    let loss_up = if sent_up > 0 { lost_up as f32 / sent_up as f32 * 100.0 } else { 0.0 };
    let loss_down = if sent_down > 0 { lost_down as f32 / sent_down as f32 * 100.0 } else { 0.0 };
    loss_up.max(loss_down)
}

/// Seal route tokens for a granted route. `None` means the route cannot
/// be expressed (a relay vanished from the directory, or sealing
/// failed) and the slice falls back to direct.
#[allow(clippy::too_many_arguments)]
fn build_tokens(
    state: &BackendState,
    directory: &Directory,
    matrix: &RouteMatrix,
    request: &SliceRequest,
    route: &NextRoute,
    session_version: u8,
    kind: RouteType,
    buyer: &Buyer,
    now: u64,
) -> Option<Vec<u8>> {
    let hops = slipstream_services::tokens::build_hop_list(
        directory,
        request.client_address,
        request.client_route_public_key,
        request.server_address,
        request.server_route_public_key,
        &route.relays[..route.num_relays as usize],
        &matrix.relay_ids,
        &state.internal_ips,
    )?;
    let result = match kind {
        RouteType::New => slipstream_services::tokens::next_tokens(
            &hops,
            now + 2 * SLICE_SECONDS,
            request.session_id,
            session_version,
            buyer.route_shader.bandwidth_envelope_up_kbps,
            buyer.route_shader.bandwidth_envelope_down_kbps,
            state.keys.router.private_bytes(),
        ),
        _ => slipstream_services::tokens::continue_tokens(
            &hops,
            now + SLICE_SECONDS,
            request.session_id,
            session_version,
            state.keys.router.private_bytes(),
        ),
    };
    match result {
        Ok(tokens) => Some(tokens),
        Err(e) => {
            tracing::debug!(error = %e, "could not seal route tokens");
            None
        }
    }
}

fn store_route(entry: &mut SessionEntry, matrix: &RouteMatrix, route: &NextRoute) {
    entry.route_relays.clear();
    entry.route_relay_names.clear();
    for &index in &route.relays[..route.num_relays as usize] {
        entry.route_relays.push(matrix.relay_ids[index as usize]);
        entry.route_relay_names.push(matrix.relay_names[index as usize].clone());
    }
    entry.route_cost = route.cost;
}

fn clear_route(entry: &mut SessionEntry) {
    entry.route_relays.clear();
    entry.route_relay_names.clear();
    entry.route_cost = 0;
}

/// Count veto transitions and propagate the multipath overload veto to
/// the whole user, so their other sessions stop multipathing too.
fn record_vetoes(state: &BackendState, before: &RouteState, after: &RouteState, request: &SliceRequest) {
    if after.no_route && !before.no_route {
        state.metrics.no_route_veto.inc();
    }
    if after.mispredict && !before.mispredict {
        state.metrics.mispredict_veto.inc();
    }
    if after.latency_worse && !before.latency_worse {
        state.metrics.latency_worse_veto.inc();
    }
    if after.multipath_overload && !before.multipath_overload {
        state.metrics.multipath_overload_veto.inc();
        state.veto.veto_user(request.buyer_id, request.user_hash);
    }
}

fn encode_blob(state: &BackendState, blob: &mut SessionData) -> Vec<u8> {
    match write_session_data(blob) {
        Ok(bytes) => bytes,
        Err(e) => {
            // A blob we cannot encode would strand the session, so the
            // client gets an empty one and restarts clean.
            tracing::error!(error = %e, "could not write session data");
            state.metrics.write_response_failure.inc();
            Vec::new()
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn submit_slice_records(
    state: &BackendState,
    directory: &Directory,
    request: &SliceRequest,
    entry: &SessionEntry,
    blob: &SessionData,
    route_type: RouteType,
    route_switched: bool,
    real_packet_loss: f32,
    envelope_up: u64,
    envelope_down: u64,
    now: u64,
) {
    let on_next = route_type != RouteType::Direct;

    let mut route_relay_ids = [0u64; MAX_RELAYS_PER_ROUTE];
    for (slot, id) in route_relay_ids.iter_mut().zip(entry.route_relays.iter()) {
        *slot = *id;
    }
    let relay_prices = if on_next {
        route_relay_prices_per_gb(directory, &entry.route_relays)
    } else {
        [0 as Nibblin; MAX_RELAYS_PER_ROUTE]
    };
    let total_price = total_price_nibblins(
        &relay_prices,
        if on_next { entry.route_relays.len() as i32 } else { 0 },
        envelope_up,
        envelope_down,
    );

    state.postsession.send_billing_entry(BillingEntry {
        timestamp: now,
        buyer_id: request.buyer_id,
        user_hash: request.user_hash,
        session_id: request.session_id,
        slice_number: request.slice_number,
        datacenter_id: entry.datacenter_id,
        latitude: entry.location.latitude,
        longitude: entry.location.longitude,
        direct_rtt: request.direct_rtt,
        direct_jitter: request.direct_jitter,
        direct_packet_loss: request.direct_packet_loss,
        real_packet_loss,
        next: on_next,
        committed: blob.route_state.committed,
        multipath: blob.route_state.multipath,
        initial: route_type == RouteType::New,
        fallback_to_direct: request.fallback_to_direct,
        reported: request.reported,
        route_changed: route_switched,
        next_rtt: request.next_rtt,
        next_jitter: request.next_jitter,
        next_packet_loss: request.next_packet_loss,
        predicted_rtt: entry.route_cost as f32,
        session_duration: blob.session_duration,
        duration_on_next: blob.duration_on_next,
        session_events: blob.session_events,
        envelope_bytes_up: envelope_up,
        envelope_bytes_down: envelope_down,
        num_route_relays: entry.route_relays.len() as u32,
        route_relay_ids,
        relay_prices,
        total_price,
        summary: false,
    });

    let datacenter_name = directory
        .datacenter_for_buyer(request.buyer_id, entry.datacenter_id)
        .map(|d| d.name.clone())
        .unwrap_or_default();
    state.postsession.send_portal_data(PortalData {
        timestamp: now,
        session_id: request.session_id,
        user_hash: request.user_hash,
        buyer_id: request.buyer_id,
        datacenter_name,
        latitude: entry.location.latitude,
        longitude: entry.location.longitude,
        client_addr: request.client_address.to_string(),
        server_addr: request.server_address.to_string(),
        sdk_version: request.sdk_version.to_string(),
        on_next,
        ever_on_next: entry.ever_on_next,
        direct_rtt: request.direct_rtt,
        direct_jitter: request.direct_jitter,
        direct_packet_loss: request.direct_packet_loss,
        next_rtt: request.next_rtt,
        next_jitter: request.next_jitter,
        next_packet_loss: request.next_packet_loss,
        route_relay_names: entry.route_relay_names.clone(),
    });
}

fn debug_summary(route_type: RouteType, route_state: &RouteState, entry: &SessionEntry) -> String {
    let mut out = match route_type {
        RouteType::New => format!(
            "new route through {} ({} ms predicted)",
            entry.route_relay_names.join(" -> "),
            entry.route_cost,
        ),
        RouteType::Continue => format!(
            "continuing through {} ({} ms predicted)",
            entry.route_relay_names.join(" -> "),
            entry.route_cost,
        ),
        RouteType::Direct => {
            let mut reasons = Vec::new();
            if route_state.veto {
                reasons.push("veto");
            }
            if route_state.location_veto {
                reasons.push("no location");
            }
            if route_state.disabled {
                reasons.push("shader disabled");
            }
            if route_state.not_selected {
                reasons.push("not selected");
            }
            if route_state.b_side {
                reasons.push("ab test b side");
            }
            if reasons.is_empty() {
                "direct".to_owned()
            } else {
                format!("direct ({})", reasons.join(", "))
            }
        }
    };
    out.truncate(MAX_SESSION_DEBUG_BYTES);
    out
}

// ── Session eviction ──────────────────────────────────────────────────────────

/// The summary billing row written once, when a session ages out of the
/// session map.
pub fn summary_billing_entry(entry: &SessionEntry, now: u64) -> BillingEntry {
    let mut route_relay_ids = [0u64; MAX_RELAYS_PER_ROUTE];
    for (slot, id) in route_relay_ids.iter_mut().zip(entry.route_relays.iter()) {
        *slot = *id;
    }
    BillingEntry {
        timestamp: now,
        buyer_id: entry.buyer_id,
        user_hash: entry.user_hash,
        session_id: entry.session_id,
        slice_number: entry.expected_slice,
        datacenter_id: entry.datacenter_id,
        latitude: entry.location.latitude,
        longitude: entry.location.longitude,
        next: entry.ever_on_next,
        fallback_to_direct: entry.fell_back_to_direct,
        session_duration: entry.expected_slice * SLICE_SECONDS as u32,
        duration_on_next: entry.duration_on_next,
        session_events: entry.session_events,
        envelope_bytes_up: entry.envelope_bytes_up_sum,
        envelope_bytes_down: entry.envelope_bytes_down_sum,
        num_route_relays: entry.route_relays.len() as u32,
        route_relay_ids,
        summary: true,
        ..BillingEntry::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, BUYER_ID, DATACENTER_ID, RELAY_A, RELAY_B};
    use slipstream_core::packets4::NearRelayPing;
    use slipstream_core::packets5::NearRelayPing5;

    fn base_update(session_id: u64, slice_number: u32) -> SessionUpdatePacket {
        SessionUpdatePacket {
            sdk_version: SdkVersion::new(4, 0, 6),
            buyer_id: BUYER_ID,
            datacenter_id: DATACENTER_ID,
            session_id,
            slice_number,
            session_data: Vec::new(),
            client_address: Some(testutil::client_addr()),
            server_address: Some(testutil::server_addr()),
            client_route_public_key: [1u8; 32],
            server_route_public_key: [2u8; 32],
            user_hash: 0xABCD,
            direct_rtt: 100.0,
            direct_jitter: 5.0,
            direct_packet_loss: 0.0,
            ..SessionUpdatePacket::default()
        }
    }

    fn base_update5(session_id: u64, slice_number: u32) -> SessionUpdateRequestPacket5 {
        SessionUpdateRequestPacket5 {
            sdk_version: SdkVersion::new(5, 0, 0),
            buyer_id: BUYER_ID,
            datacenter_id: DATACENTER_ID,
            session_id,
            slice_number,
            session_data: Vec::new(),
            client_address: Some(testutil::client_addr()),
            server_address: Some(testutil::server_addr()),
            client_route_public_key: [1u8; 32],
            server_route_public_key: [2u8; 32],
            user_hash: 0xABCD,
            direct_rtt: 100.0,
            direct_jitter: 5.0,
            direct_packet_loss: 0.0,
            ..SessionUpdateRequestPacket5::default()
        }
    }

    /// Pings that make the two-hop route through relay B the only
    /// candidate, well under the direct RTT.
    fn good_pings() -> Vec<NearRelayPing> {
        vec![NearRelayPing { relay_id: RELAY_B, rtt: 10, jitter: 1, packet_loss_percent: 0 }]
    }

    fn send_v4(
        state: &Arc<BackendState>,
        packet: &mut SessionUpdatePacket,
    ) -> Option<SessionResponsePacket> {
        let framed = testutil::frame_v4_request(packet);
        let data = handle_session_update(state, &framed, testutil::client_addr())?;
        let frame = open_frame(&data).unwrap();
        assert_eq!(frame.packet_type, wire::PACKET_SESSION_RESPONSE);
        Some(read_payload(frame.payload).unwrap())
    }

    fn send_v5(
        state: &Arc<BackendState>,
        packet: &mut SessionUpdateRequestPacket5,
    ) -> Option<SessionResponsePacket5> {
        let framed = testutil::frame_v5_request(state, packet, testutil::client_addr());
        let data = handle_session_update5(state, &framed, testutil::client_addr())?;
        let frame = open_frame5(&data).unwrap();
        assert_eq!(frame.packet_type, wire::PACKET5_SESSION_RESPONSE);
        Some(read_payload(frame.payload).unwrap())
    }

    /// Run slice 0 and return the blob for slice 1.
    fn start_session(state: &Arc<BackendState>, session_id: u64) -> Vec<u8> {
        let response = send_v4(state, &mut base_update(session_id, 0)).unwrap();
        assert_eq!(response.route_type, RouteType::Direct);
        response.session_data
    }

    #[test]
    fn first_slice_answers_direct_and_registers_the_session() {
        let state = testutil::test_state();
        let response = send_v4(&state, &mut base_update(1, 0)).unwrap();

        assert_eq!(response.session_id, 1);
        assert_eq!(response.slice_number, 0);
        assert_eq!(response.route_type, RouteType::Direct);
        assert!(response.tokens.is_empty());
        assert!(!response.near_relays.is_empty());

        let blob = read_session_data(&response.session_data).unwrap();
        assert_eq!(blob.session_id, 1);
        assert_eq!(blob.slice_number, 1);
        assert!(blob.fresh(unix_time()));

        assert_eq!(state.sessions.len(), 1);
        assert_eq!(state.buyer_counts.get(BUYER_ID), 1);
        assert_eq!(state.user_sessions.sessions_for_user(0xABCD), vec![1]);
        assert_eq!(state.metrics.direct_slices.get(), 1);
    }

    #[test]
    fn second_slice_takes_a_route_when_next_wins() {
        let state = testutil::test_state();
        let blob_bytes = start_session(&state, 7);

        let mut packet = base_update(7, 1);
        packet.session_data = blob_bytes;
        packet.near_relay_pings = good_pings();
        let response = send_v4(&state, &mut packet).unwrap();

        assert_eq!(response.route_type, RouteType::New);
        assert!(!response.tokens.is_empty());

        let blob = read_session_data(&response.session_data).unwrap();
        assert!(blob.route_state.next);
        assert_eq!(blob.session_version, 1);

        let entry = state.sessions.get(7).unwrap();
        assert_eq!(entry.route_relays, vec![RELAY_B, RELAY_A]);
        assert!(entry.route_cost > 0);
        assert_eq!(state.metrics.next_slices.get(), 1);
    }

    #[test]
    fn third_slice_continues_the_route() {
        let state = testutil::test_state();
        let blob_bytes = start_session(&state, 8);

        let mut packet = base_update(8, 1);
        packet.session_data = blob_bytes;
        packet.near_relay_pings = good_pings();
        let response = send_v4(&state, &mut packet).unwrap();
        assert_eq!(response.route_type, RouteType::New);

        let mut packet = base_update(8, 2);
        packet.session_data = response.session_data;
        packet.near_relay_pings = good_pings();
        packet.next = true;
        packet.next_rtt = 20.0;
        let response = send_v4(&state, &mut packet).unwrap();

        assert_eq!(response.route_type, RouteType::Continue);
        assert!(!response.tokens.is_empty());
        let blob = read_session_data(&response.session_data).unwrap();
        assert!(blob.route_state.next);
        // The route was kept, not reissued.
        assert_eq!(blob.session_version, 1);
        assert_eq!(blob.duration_on_next, 10);
        assert_eq!(state.metrics.next_slices.get(), 2);
        assert_eq!(state.metrics.route_switched.get(), 0);
    }

    #[test]
    fn replayed_slice_gets_the_cached_response_bytes() {
        let state = testutil::test_state();
        let blob_bytes = start_session(&state, 9);

        let mut packet = base_update(9, 1);
        packet.session_data = blob_bytes;
        let framed = testutil::frame_v4_request(&mut packet);

        let first = handle_session_update(&state, &framed, testutil::client_addr()).unwrap();
        let second = handle_session_update(&state, &framed, testutil::client_addr()).unwrap();
        assert_eq!(first, second);

        // Only one slice was processed and billed.
        assert_eq!(state.metrics.direct_slices.get(), 2);
    }

    #[test]
    fn slice_from_the_past_is_dropped() {
        let state = testutil::test_state();
        let blob_bytes = start_session(&state, 11);

        let mut packet = base_update(11, 1);
        packet.session_data = blob_bytes.clone();
        send_v4(&state, &mut packet).unwrap();

        // Slice 0 again, two behind the expected slice 2.
        let mut stale = base_update(11, 0);
        stale.session_data = blob_bytes;
        assert!(send_v4(&state, &mut stale).is_none());
        assert_eq!(state.metrics.bad_slice_number.get(), 1);
    }

    #[test]
    fn unknown_session_with_nonzero_slice_is_dropped() {
        let state = testutil::test_state();
        assert!(send_v4(&state, &mut base_update(13, 3)).is_none());
        assert_eq!(state.metrics.bad_session_id.get(), 1);
        assert_eq!(state.sessions.len(), 0);
    }

    #[test]
    fn expired_blob_is_dropped() {
        let state = testutil::test_state();
        let blob_bytes = start_session(&state, 15);

        let mut blob = read_session_data(&blob_bytes).unwrap();
        blob.expire_timestamp = unix_time() - 1;
        let mut packet = base_update(15, 1);
        packet.session_data = write_session_data(&blob).unwrap();

        assert!(send_v4(&state, &mut packet).is_none());
        assert_eq!(state.metrics.read_session_data_failure.get(), 1);
    }

    #[test]
    fn stale_matrix_drops_session_updates() {
        let state = testutil::test_state_with_matrix(testutil::test_matrix(1));
        assert!(send_v4(&state, &mut base_update(17, 0)).is_none());
        assert_eq!(state.metrics.stale_route_matrix.get(), 1);
    }

    #[test]
    fn fallback_to_direct_vetoes_the_session() {
        let state = testutil::test_state();
        let blob_bytes = start_session(&state, 19);

        let mut packet = base_update(19, 1);
        packet.session_data = blob_bytes;
        packet.fallback_to_direct = true;
        packet.fallback_flags = 1;
        packet.near_relay_pings = good_pings();
        let response = send_v4(&state, &mut packet).unwrap();

        assert_eq!(response.route_type, RouteType::Direct);
        let blob = read_session_data(&response.session_data).unwrap();
        assert!(blob.route_state.veto);
        assert!(!blob.route_state.next);
        assert!(state.sessions.get(19).unwrap().fell_back_to_direct);
        assert_eq!(state.metrics.fallback_bad_route_token.get(), 1);
    }

    #[test]
    fn sdk_walking_off_the_route_is_a_veto() {
        let state = testutil::test_state();
        let blob_bytes = start_session(&state, 21);

        let mut packet = base_update(21, 1);
        packet.session_data = blob_bytes;
        packet.near_relay_pings = good_pings();
        let response = send_v4(&state, &mut packet).unwrap();
        assert_eq!(response.route_type, RouteType::New);

        // Client reports next=false while the blob says on next.
        let mut abort = base_update(21, 2);
        abort.session_data = response.session_data;
        abort.near_relay_pings = good_pings();
        abort.next = false;
        let response = send_v4(&state, &mut abort).unwrap();

        assert_eq!(response.route_type, RouteType::Direct);
        assert_eq!(state.metrics.sdk_aborted.get(), 1);
        let blob = read_session_data(&response.session_data).unwrap();
        assert!(blob.route_state.veto);
    }

    #[test]
    fn v5_first_slice_returns_signed_blob_and_ping_tokens() {
        let state = testutil::test_state();
        let response = send_v5(&state, &mut base_update5(23, 0)).unwrap();

        assert_eq!(response.route_type, RouteType::Direct);
        assert!(!response.near_relays.is_empty());
        assert!(response.near_relay_expire_timestamp > unix_time());
        for relay in &response.near_relays {
            assert!(relay.address.is_some());
            assert_ne!(relay.ping_token, [0u8; 32]);
        }
        assert!(verify_signature_parts(
            &state.keys.signing.public_bytes(),
            &[&response.session_data],
            &response.session_data_signature,
        ));
    }

    #[test]
    fn v5_second_slice_takes_a_route() {
        let state = testutil::test_state();
        let first = send_v5(&state, &mut base_update5(25, 0)).unwrap();

        let mut packet = base_update5(25, 1);
        packet.session_data = first.session_data.clone();
        packet.session_data_signature = first.session_data_signature;
        packet.near_relay_pings =
            vec![NearRelayPing5 { relay_id: RELAY_B, rtt: 10, jitter: 1, packet_loss: 0.0 }];
        let response = send_v5(&state, &mut packet).unwrap();

        assert_eq!(response.route_type, RouteType::New);
        assert!(!response.tokens.is_empty());
        // Near relays are only announced on the first slice.
        assert!(response.near_relays.is_empty());
    }

    #[test]
    fn v5_tampered_blob_is_dropped() {
        let state = testutil::test_state();
        let first = send_v5(&state, &mut base_update5(27, 0)).unwrap();

        let mut packet = base_update5(27, 1);
        packet.session_data = first.session_data;
        packet.session_data_signature = [0u8; 64];
        assert!(send_v5(&state, &mut packet).is_none());
        assert_eq!(state.metrics.read_session_data_failure.get(), 1);
    }

    #[test]
    fn summary_entry_carries_session_totals() {
        let state = testutil::test_state();
        let blob_bytes = start_session(&state, 29);

        let mut packet = base_update(29, 1);
        packet.session_data = blob_bytes;
        packet.near_relay_pings = good_pings();
        packet.session_events = 0b101;
        send_v4(&state, &mut packet).unwrap();

        let entry = state.sessions.get(29).unwrap();
        let summary = summary_billing_entry(&entry, unix_time());
        assert!(summary.summary);
        assert_eq!(summary.session_id, 29);
        assert_eq!(summary.buyer_id, BUYER_ID);
        assert_eq!(summary.slice_number, 2);
        assert_eq!(summary.session_duration, 20);
        assert_eq!(summary.session_events, 0b101);
        // The route issued on slice 1 covers the doubled token window.
        assert!(summary.envelope_bytes_up > 0);
        assert_eq!(summary.route_relay_ids[0], RELAY_B);
        assert_eq!(summary.route_relay_ids[1], RELAY_A);
    }
}
