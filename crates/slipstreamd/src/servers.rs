//! Server init and update handling.
//!
//! A server announces itself once at startup (init) and then refreshes
//! its presence every few seconds (update). Init resolves the
//! datacenter the server claims to run in; update keeps the server row
//! alive and feeds live session counts to the portal. A server in a
//! datacenter we cannot resolve is still accepted, it just never gets
//! routes until the directory catches up.

use std::net::SocketAddr;
use std::sync::Arc;

use slipstream_core::packets4::{
    frame_packet, open_frame, verify_frame, ServerInitRequestPacket, ServerInitResponsePacket,
    ServerUpdatePacket, INIT_RESPONSE_BUYER_NOT_LIVE, INIT_RESPONSE_OK, INIT_RESPONSE_SDK_TOO_OLD,
    INIT_RESPONSE_UNKNOWN_BUYER,
};
use slipstream_core::packets5::{
    frame_packet5, open_frame5, verify_frame5, ServerInitRequestPacket5, ServerInitResponsePacket5,
    ServerUpdateRequestPacket5, ServerUpdateResponsePacket5, ZERO_MAGIC,
};
use slipstream_core::wire::{self, read_payload, write_payload, SdkVersion};
use slipstream_services::database::Directory;
use slipstream_services::maps::{self, unix_time, ServerEntry};
use slipstream_services::SessionCounts;

use crate::state::BackendState;

pub fn handle_server_init(
    state: &Arc<BackendState>,
    data: &[u8],
    from: SocketAddr,
) -> Option<Vec<u8>> {
    state.metrics.server_init_packets.inc();

    let frame = match open_frame(data) {
        Ok(frame) => frame,
        Err(_) => {
            state.metrics.bad_packet_filter.inc();
            return None;
        }
    };
    let packet: ServerInitRequestPacket = match read_payload(frame.payload) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::debug!(error = %e, "unreadable server init");
            state.metrics.read_packet_failure.inc();
            return None;
        }
    };

    let directory = state.directory.snapshot();
    let now = unix_time();

    // Unknown and dormant buyers get a coded response before any
    // signature check, so a misconfigured server learns what is wrong.
    let Some(buyer) = directory.buyer_by_id(packet.buyer_id) else {
        state.metrics.buyer_not_found.inc();
        return init_response(state, packet.request_id, INIT_RESPONSE_UNKNOWN_BUYER);
    };
    if !buyer.live {
        state.metrics.buyer_not_live.inc();
        return init_response(state, packet.request_id, INIT_RESPONSE_BUYER_NOT_LIVE);
    }
    if !verify_frame(data, &buyer.public_key) {
        state.metrics.signature_check_failed.inc();
        return None;
    }
    if !packet.sdk_version.at_least(4, 0, 0) {
        state.metrics.sdk_too_old.inc();
        return init_response(state, packet.request_id, INIT_RESPONSE_SDK_TOO_OLD);
    }

    let datacenter_id = register_datacenter(
        state,
        &directory,
        packet.buyer_id,
        packet.datacenter_id,
        &packet.datacenter_name,
    );

    upsert_server(
        state,
        from,
        packet.buyer_id,
        datacenter_id,
        packet.sdk_version,
        0,
        now,
        true,
    );

    tracing::debug!(
        buyer_id = format_args!("{:016x}", packet.buyer_id),
        address = %from,
        "server init"
    );

    init_response(state, packet.request_id, INIT_RESPONSE_OK)
}

/// Updates are fire-and-forget in the older generation; nothing is sent
/// back, so every failed check is a silent drop.
pub fn handle_server_update(
    state: &Arc<BackendState>,
    data: &[u8],
    from: SocketAddr,
) -> Option<Vec<u8>> {
    state.metrics.server_update_packets.inc();

    let frame = match open_frame(data) {
        Ok(frame) => frame,
        Err(_) => {
            state.metrics.bad_packet_filter.inc();
            return None;
        }
    };
    let packet: ServerUpdatePacket = match read_payload(frame.payload) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::debug!(error = %e, "unreadable server update");
            state.metrics.read_packet_failure.inc();
            return None;
        }
    };

    let directory = state.directory.snapshot();
    let now = unix_time();

    let Some(buyer) = directory.buyer_by_id(packet.buyer_id) else {
        state.metrics.buyer_not_found.inc();
        return None;
    };
    if !buyer.live {
        state.metrics.buyer_not_live.inc();
        return None;
    }
    if !verify_frame(data, &buyer.public_key) {
        state.metrics.signature_check_failed.inc();
        return None;
    }
    if !packet.sdk_version.at_least(4, 0, 0) {
        state.metrics.sdk_too_old.inc();
        return None;
    }

    let address = packet.server_address.unwrap_or(from);
    let datacenter_id =
        register_datacenter(state, &directory, packet.buyer_id, packet.datacenter_id, "");

    upsert_server(
        state,
        address,
        packet.buyer_id,
        datacenter_id,
        packet.sdk_version,
        packet.num_sessions,
        now,
        false,
    );

    state.postsession.send_portal_counts(SessionCounts {
        server_id: maps::server_key(&address),
        buyer_id: packet.buyer_id,
        num_sessions: packet.num_sessions,
    });

    None
}

pub fn handle_server_init5(
    state: &Arc<BackendState>,
    data: &[u8],
    from: SocketAddr,
) -> Option<Vec<u8>> {
    state.metrics.server_init_packets.inc();

    let frame = match open_frame5(data) {
        Ok(frame) => frame,
        Err(_) => {
            state.metrics.bad_packet_filter.inc();
            return None;
        }
    };
    let packet: ServerInitRequestPacket5 = match read_payload(frame.payload) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::debug!(error = %e, "unreadable server init");
            state.metrics.read_packet_failure.inc();
            return None;
        }
    };

    let directory = state.directory.snapshot();
    let now = unix_time();

    let Some(buyer) = directory.buyer_by_id(packet.buyer_id) else {
        state.metrics.buyer_not_found.inc();
        return init_response5(state, packet.request_id, INIT_RESPONSE_UNKNOWN_BUYER, from);
    };
    if !buyer.live {
        state.metrics.buyer_not_live.inc();
        return init_response5(state, packet.request_id, INIT_RESPONSE_BUYER_NOT_LIVE, from);
    }
    if !verify_frame5(data, &buyer.public_key) {
        state.metrics.signature_check_failed.inc();
        return None;
    }
    if !packet.sdk_version.at_least(5, 0, 0) {
        state.metrics.sdk_too_old.inc();
        return init_response5(state, packet.request_id, INIT_RESPONSE_SDK_TOO_OLD, from);
    }

    let datacenter_id = register_datacenter(
        state,
        &directory,
        packet.buyer_id,
        packet.datacenter_id,
        &packet.datacenter_name,
    );

    upsert_server(
        state,
        from,
        packet.buyer_id,
        datacenter_id,
        packet.sdk_version,
        0,
        now,
        true,
    );

    tracing::debug!(
        buyer_id = format_args!("{:016x}", packet.buyer_id),
        address = %from,
        "server init"
    );

    init_response5(state, packet.request_id, INIT_RESPONSE_OK, from)
}

/// The newer generation acknowledges updates so servers can pick up the
/// rotating magic without waiting for the next init.
pub fn handle_server_update5(
    state: &Arc<BackendState>,
    data: &[u8],
    from: SocketAddr,
) -> Option<Vec<u8>> {
    state.metrics.server_update_packets.inc();

    let frame = match open_frame5(data) {
        Ok(frame) => frame,
        Err(_) => {
            state.metrics.bad_packet_filter.inc();
            return None;
        }
    };
    let packet: ServerUpdateRequestPacket5 = match read_payload(frame.payload) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::debug!(error = %e, "unreadable server update");
            state.metrics.read_packet_failure.inc();
            return None;
        }
    };

    let directory = state.directory.snapshot();
    let now = unix_time();

    let Some(buyer) = directory.buyer_by_id(packet.buyer_id) else {
        state.metrics.buyer_not_found.inc();
        return None;
    };
    if !buyer.live {
        state.metrics.buyer_not_live.inc();
        return None;
    }
    if !verify_frame5(data, &buyer.public_key) {
        state.metrics.signature_check_failed.inc();
        return None;
    }
    if !packet.sdk_version.at_least(5, 0, 0) {
        state.metrics.sdk_too_old.inc();
        return None;
    }

    let address = packet.server_address.unwrap_or(from);
    let datacenter_id =
        register_datacenter(state, &directory, packet.buyer_id, packet.datacenter_id, "");

    upsert_server(
        state,
        address,
        packet.buyer_id,
        datacenter_id,
        packet.sdk_version,
        packet.num_sessions,
        now,
        false,
    );

    state.postsession.send_portal_counts(SessionCounts {
        server_id: maps::server_key(&address),
        buyer_id: packet.buyer_id,
        num_sessions: packet.num_sessions,
    });

    let magic = state.magic.values();
    let mut response = ServerUpdateResponsePacket5 {
        request_id: packet.request_id,
        upcoming_magic: magic.upcoming,
        current_magic: magic.current,
        previous_magic: magic.previous,
    };
    let payload = match write_payload(&mut response) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(error = %e, "could not write server update response");
            state.metrics.write_response_failure.inc();
            return None;
        }
    };
    Some(frame_packet5(
        wire::PACKET5_SERVER_UPDATE_RESPONSE,
        &payload,
        &state.keys.signing,
        &ZERO_MAGIC,
        &state.public_address,
        &from,
    ))
}

fn init_response(state: &BackendState, request_id: u64, response: u8) -> Option<Vec<u8>> {
    let mut packet = ServerInitResponsePacket { request_id, response };
    let payload = match write_payload(&mut packet) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(error = %e, "could not write server init response");
            state.metrics.write_response_failure.inc();
            return None;
        }
    };
    Some(frame_packet(
        wire::PACKET_SERVER_INIT_RESPONSE,
        &payload,
        &state.keys.signing,
    ))
}

fn init_response5(
    state: &BackendState,
    request_id: u64,
    response: u8,
    from: SocketAddr,
) -> Option<Vec<u8>> {
    let magic = state.magic.values();
    let mut packet = ServerInitResponsePacket5 {
        request_id,
        response,
        upcoming_magic: magic.upcoming,
        current_magic: magic.current,
        previous_magic: magic.previous,
    };
    let payload = match write_payload(&mut packet) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(error = %e, "could not write server init response");
            state.metrics.write_response_failure.inc();
            return None;
        }
    };
    Some(frame_packet5(
        wire::PACKET5_SERVER_INIT_RESPONSE,
        &payload,
        &state.keys.signing,
        &ZERO_MAGIC,
        &state.public_address,
        &from,
    ))
}

/// Map whatever the server told us about its datacenter onto a
/// directory id. Name wins over raw id; an id we cannot resolve is kept
/// as-is and tracked so operators can see what is out there. Init and
/// update both succeed either way.
fn register_datacenter(
    state: &BackendState,
    directory: &Directory,
    buyer_id: u64,
    datacenter_id: u64,
    datacenter_name: &str,
) -> u64 {
    if !datacenter_name.is_empty() {
        if let Some(id) = directory.resolve_datacenter(buyer_id, datacenter_name) {
            state.datacenter_tracker.add(id);
            return id;
        }
    }
    if directory.datacenter_exists(datacenter_id) {
        state.datacenter_tracker.add(datacenter_id);
        return datacenter_id;
    }
    tracing::debug!(
        datacenter_id = format_args!("{datacenter_id:016x}"),
        name = datacenter_name,
        "unknown datacenter"
    );
    state.metrics.datacenter_not_found.inc();
    state.unknown_datacenter_tracker.add(datacenter_id);
    datacenter_id
}

/// Init starts the row over; update refreshes it but keeps the original
/// init timestamp so uptime survives address-stable restarts of us, not
/// of the server.
#[allow(clippy::too_many_arguments)]
fn upsert_server(
    state: &BackendState,
    address: SocketAddr,
    buyer_id: u64,
    datacenter_id: u64,
    sdk_version: SdkVersion,
    num_sessions: u32,
    now: u64,
    reset: bool,
) {
    let key = maps::server_key(&address);
    let init_timestamp = if reset {
        now
    } else {
        state
            .servers
            .get(key)
            .map(|entry| entry.init_timestamp)
            .unwrap_or(now)
    };
    state.servers.update(
        key,
        ServerEntry {
            server_address: address,
            buyer_id,
            datacenter_id,
            sdk_version,
            num_sessions,
            init_timestamp,
            last_update: now,
        },
    );
}
