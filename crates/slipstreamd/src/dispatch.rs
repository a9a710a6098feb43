//! Datagram entry point.
//!
//! First byte picks the handler. Packets from the current SDK carry
//! chonkle and pittle bytes that must pass the basic and advanced
//! filters before any parsing happens; previous-generation packets go
//! straight to their handlers, which verify length, anti-junk hash and
//! signature themselves.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use slipstream_core::packets4::MIN_FRAMED_PACKET_BYTES;
use slipstream_core::packets5::{advanced_packet_filter, basic_packet_filter};
use slipstream_core::wire::{
    self, PACKET5_SERVER_INIT_REQUEST, PACKET5_SERVER_UPDATE_REQUEST,
    PACKET5_SESSION_UPDATE_REQUEST, PACKET_SERVER_INIT_REQUEST, PACKET_SERVER_UPDATE,
    PACKET_SESSION_UPDATE,
};

use crate::magic::MagicValues;
use crate::servers;
use crate::sessions;
use crate::state::BackendState;

pub async fn handle_datagram(
    state: &Arc<BackendState>,
    socket: &UdpSocket,
    data: &[u8],
    from: SocketAddr,
) {
    state.metrics.packets_received.inc();

    if data.len() < MIN_FRAMED_PACKET_BYTES {
        state.metrics.packets_too_small.inc();
        return;
    }

    let response = match data[0] {
        PACKET_SERVER_INIT_REQUEST => servers::handle_server_init(state, data, from),
        PACKET_SERVER_UPDATE => servers::handle_server_update(state, data, from),
        PACKET_SESSION_UPDATE => sessions::handle_session_update(state, data, from),

        PACKET5_SERVER_INIT_REQUEST | PACKET5_SERVER_UPDATE_REQUEST
        | PACKET5_SESSION_UPDATE_REQUEST => {
            if !passes_packet_filters(&state.magic.values(), state.public_address, data, from) {
                state.metrics.bad_packet_filter.inc();
                return;
            }
            match data[0] {
                PACKET5_SERVER_INIT_REQUEST => servers::handle_server_init5(state, data, from),
                PACKET5_SERVER_UPDATE_REQUEST => servers::handle_server_update5(state, data, from),
                _ => sessions::handle_session_update5(state, data, from),
            }
        }

        _ => {
            state.metrics.packets_unknown_type.inc();
            return;
        }
    };

    if let Some(response) = response {
        if let Err(e) = socket.send_to(&response, from).await {
            tracing::warn!(error = %e, to = %from, "failed to send response");
        }
    }
}

/// Chonkle and pittle are bound to (magic, from, to). Any of the three
/// live magics passes, so a sender one rotation behind is still heard.
fn passes_packet_filters(
    magic: &MagicValues,
    public_address: SocketAddr,
    data: &[u8],
    from: SocketAddr,
) -> bool {
    if !basic_packet_filter(data) {
        return false;
    }
    let from_bytes = wire::address_filter_bytes(&from);
    let to_bytes = wire::address_filter_bytes(&public_address);
    magic
        .accepted()
        .iter()
        .any(|magic| advanced_packet_filter(data, magic, &from_bytes, &to_bytes))
}
