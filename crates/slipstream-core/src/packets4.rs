//! The v4 packet generation.
//!
//! Frame layout: `[type u8][hash 8][payload][signature 64]`.
//!
//! The hash is a cheap keyed anti-junk check written after signing (it
//! covers the signature); the signature covers the type byte and payload
//! only, so hashing after signing and verifying before un-hashing both
//! work. Requests are signed by the buyer key, responses by the backend
//! key.

use std::net::SocketAddr;

use crate::crypto::{
    self, SigningKeypair, KEY_BYTES, PACKET_HASH_BYTES, PACKET_HASH_KEY, SIGNATURE_BYTES,
};
use crate::stream::{Stream, WireError};
use crate::token::{ENCRYPTED_CONTINUE_TOKEN_BYTES, ENCRYPTED_ROUTE_TOKEN_BYTES};
use crate::wire::{
    serialize_address, Packet, RouteType, SdkVersion, MAX_NEAR_RELAYS, MAX_SESSION_DATA_BYTES,
    MAX_TOKENS,
};

/// Bytes before the payload: type byte + anti-junk hash.
pub const PACKET_PREFIX_BYTES: usize = 1 + PACKET_HASH_BYTES;

/// Smallest framed packet we will look at: prefix + one payload byte + sig.
pub const MIN_FRAMED_PACKET_BYTES: usize = PACKET_PREFIX_BYTES + 1 + SIGNATURE_BYTES;

// Server init response codes.
pub const INIT_RESPONSE_OK: u8 = 0;
pub const INIT_RESPONSE_UNKNOWN_BUYER: u8 = 1;
pub const INIT_RESPONSE_BUYER_NOT_LIVE: u8 = 2;
pub const INIT_RESPONSE_SDK_TOO_OLD: u8 = 3;
pub const INIT_RESPONSE_UNKNOWN_DATACENTER: u8 = 4;

pub const MAX_DATACENTER_NAME_BYTES: usize = 256;

/// Highest platform id a client can report (unknown = 0).
pub const MAX_PLATFORM_ID: i64 = 10;

/// Connection types: 0 unknown, 1 wired, 2 wifi, 3 cellular.
pub const MAX_CONNECTION_TYPE: i64 = 3;

// Fallback-to-direct reason bits carried in `fallback_flags`.
pub const FALLBACK_FLAG_BAD_ROUTE_TOKEN: u64 = 1 << 0;
pub const FALLBACK_FLAG_NO_NEXT_ROUTE_TO_CONTINUE: u64 = 1 << 1;
pub const FALLBACK_FLAG_PREVIOUS_UPDATE_STILL_PENDING: u64 = 1 << 2;
pub const FALLBACK_FLAG_BAD_CONTINUE_TOKEN: u64 = 1 << 3;
pub const FALLBACK_FLAG_ROUTE_EXPIRED: u64 = 1 << 4;
pub const FALLBACK_FLAG_ROUTE_REQUEST_TIMED_OUT: u64 = 1 << 5;
pub const FALLBACK_FLAG_CONTINUE_REQUEST_TIMED_OUT: u64 = 1 << 6;
pub const FALLBACK_FLAG_CLIENT_TIMED_OUT: u64 = 1 << 7;
pub const FALLBACK_FLAG_UPGRADE_RESPONSE_TIMED_OUT: u64 = 1 << 8;
pub const FALLBACK_FLAG_ROUTE_UPDATE_TIMED_OUT: u64 = 1 << 9;
pub const FALLBACK_FLAG_DIRECT_PONG_TIMED_OUT: u64 = 1 << 10;
pub const FALLBACK_FLAG_NEXT_PONG_TIMED_OUT: u64 = 1 << 11;

// ── Framing ───────────────────────────────────────────────────────────────────

/// Assemble, sign, and hash a complete datagram.
pub fn frame_packet(packet_type: u8, payload: &[u8], keypair: &SigningKeypair) -> Vec<u8> {
    let mut data = Vec::with_capacity(PACKET_PREFIX_BYTES + payload.len() + SIGNATURE_BYTES);
    data.push(packet_type);
    data.extend_from_slice(&[0u8; PACKET_HASH_BYTES]);
    data.extend_from_slice(payload);

    let signature = keypair.sign_parts(&[&data[..1], &data[PACKET_PREFIX_BYTES..]]);
    data.extend_from_slice(&signature);

    let hash = crypto::packet_hash(&PACKET_HASH_KEY, &[&data[..1], &data[PACKET_PREFIX_BYTES..]]);
    data[1..PACKET_PREFIX_BYTES].copy_from_slice(&hash.to_le_bytes());
    data
}

/// Cheap first-line filter: does the embedded hash match?
pub fn is_tagged_packet(data: &[u8]) -> bool {
    if data.len() < MIN_FRAMED_PACKET_BYTES {
        return false;
    }
    let stored = u64::from_le_bytes(data[1..PACKET_PREFIX_BYTES].try_into().unwrap_or_default());
    let computed =
        crypto::packet_hash(&PACKET_HASH_KEY, &[&data[..1], &data[PACKET_PREFIX_BYTES..]]);
    stored == computed
}

#[derive(Debug)]
pub struct Frame<'a> {
    pub packet_type: u8,
    pub payload: &'a [u8],
}

/// Validate length and hash, and slice out the payload. Signature checking
/// is separate because the verifying key depends on the packet contents.
pub fn open_frame(data: &[u8]) -> Result<Frame<'_>, WireError> {
    if data.len() < MIN_FRAMED_PACKET_BYTES {
        return Err(WireError::TooShort { len: data.len(), min: MIN_FRAMED_PACKET_BYTES });
    }
    if !is_tagged_packet(data) {
        return Err(WireError::BadSignature);
    }
    Ok(Frame {
        packet_type: data[0],
        payload: &data[PACKET_PREFIX_BYTES..data.len() - SIGNATURE_BYTES],
    })
}

/// Verify the trailing signature of a framed packet.
pub fn verify_frame(data: &[u8], public: &[u8; KEY_BYTES]) -> bool {
    if data.len() < MIN_FRAMED_PACKET_BYTES {
        return false;
    }
    let signature = &data[data.len() - SIGNATURE_BYTES..];
    crypto::verify_signature_parts(
        public,
        &[&data[..1], &data[PACKET_PREFIX_BYTES..data.len() - SIGNATURE_BYTES]],
        signature,
    )
}

// ── Server packets ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerInitRequestPacket {
    pub sdk_version: SdkVersion,
    pub buyer_id: u64,
    pub request_id: u64,
    pub datacenter_id: u64,
    pub datacenter_name: String,
}

impl Packet for ServerInitRequestPacket {
    const PACKET_TYPE: u8 = crate::wire::PACKET_SERVER_INIT_REQUEST;

    fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<(), WireError> {
        self.sdk_version.serialize(stream)?;
        stream.serialize_u64(&mut self.buyer_id)?;
        stream.serialize_u64(&mut self.request_id)?;
        stream.serialize_u64(&mut self.datacenter_id)?;
        stream.serialize_string(&mut self.datacenter_name, MAX_DATACENTER_NAME_BYTES)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerInitResponsePacket {
    pub request_id: u64,
    pub response: u8,
}

impl Packet for ServerInitResponsePacket {
    const PACKET_TYPE: u8 = crate::wire::PACKET_SERVER_INIT_RESPONSE;

    fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<(), WireError> {
        stream.serialize_u64(&mut self.request_id)?;
        let mut code = i64::from(self.response);
        stream.serialize_int_range(&mut code, 0, INIT_RESPONSE_UNKNOWN_DATACENTER as i64)?;
        self.response = code as u8;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerUpdatePacket {
    pub sdk_version: SdkVersion,
    pub buyer_id: u64,
    pub datacenter_id: u64,
    pub num_sessions: u32,
    pub server_address: Option<SocketAddr>,
}

impl Packet for ServerUpdatePacket {
    const PACKET_TYPE: u8 = crate::wire::PACKET_SERVER_UPDATE;

    fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<(), WireError> {
        self.sdk_version.serialize(stream)?;
        stream.serialize_u64(&mut self.buyer_id)?;
        stream.serialize_u64(&mut self.datacenter_id)?;
        stream.serialize_u32(&mut self.num_sessions)?;
        serialize_address(stream, &mut self.server_address)?;
        Ok(())
    }
}

// ── Session update ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NearRelayPing {
    pub relay_id: u64,
    pub rtt: u8,
    pub jitter: u8,
    pub packet_loss_percent: u8,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionUpdatePacket {
    pub sdk_version: SdkVersion,
    pub buyer_id: u64,
    pub datacenter_id: u64,
    pub session_id: u64,
    pub slice_number: u32,
    pub retry_number: u32,
    pub session_data: Vec<u8>,
    pub client_address: Option<SocketAddr>,
    pub server_address: Option<SocketAddr>,
    /// Ephemeral box public keys the route tokens are built against.
    pub client_route_public_key: [u8; KEY_BYTES],
    pub server_route_public_key: [u8; KEY_BYTES],
    pub user_hash: u64,
    pub platform_id: u8,
    pub connection_type: u8,

    pub direct_rtt: f32,
    pub direct_jitter: f32,
    pub direct_packet_loss: f32,

    pub next: bool,
    pub next_rtt: f32,
    pub next_jitter: f32,
    pub next_packet_loss: f32,
    pub next_kbps_up: u32,
    pub next_kbps_down: u32,

    pub reported: bool,

    // >= 4.0.2
    pub fallback_to_direct: bool,
    pub fallback_flags: u64,

    pub packets_sent_client_to_server: u64,
    pub packets_sent_server_to_client: u64,

    // >= 4.0.3
    pub packets_lost_client_to_server: u64,
    pub packets_lost_server_to_client: u64,

    // >= 4.0.4
    pub session_events: u64,

    // >= 4.0.5
    pub out_of_order_client_to_server: u64,
    pub out_of_order_server_to_client: u64,

    // >= 4.0.6
    pub client_ping_timed_out: bool,

    pub near_relay_pings: Vec<NearRelayPing>,
    pub client_ping_timestamp: u64,
}

impl Packet for SessionUpdatePacket {
    const PACKET_TYPE: u8 = crate::wire::PACKET_SESSION_UPDATE;

    fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<(), WireError> {
        self.sdk_version.serialize(stream)?;
        stream.serialize_u64(&mut self.buyer_id)?;
        stream.serialize_u64(&mut self.datacenter_id)?;
        stream.serialize_u64(&mut self.session_id)?;
        stream.serialize_u32(&mut self.slice_number)?;
        let mut retry = i64::from(self.retry_number);
        stream.serialize_int_range(&mut retry, 0, 255)?;
        self.retry_number = retry as u32;
        stream.serialize_byte_vec(&mut self.session_data, MAX_SESSION_DATA_BYTES)?;
        serialize_address(stream, &mut self.client_address)?;
        serialize_address(stream, &mut self.server_address)?;
        stream.serialize_bytes(&mut self.client_route_public_key)?;
        stream.serialize_bytes(&mut self.server_route_public_key)?;
        stream.serialize_u64(&mut self.user_hash)?;
        let mut platform = i64::from(self.platform_id);
        stream.serialize_int_range(&mut platform, 0, MAX_PLATFORM_ID)?;
        self.platform_id = platform as u8;
        let mut connection = i64::from(self.connection_type);
        stream.serialize_int_range(&mut connection, 0, MAX_CONNECTION_TYPE)?;
        self.connection_type = connection as u8;

        stream.serialize_f32(&mut self.direct_rtt)?;
        stream.serialize_f32(&mut self.direct_jitter)?;
        stream.serialize_f32(&mut self.direct_packet_loss)?;

        stream.serialize_bool(&mut self.next)?;
        if self.next {
            stream.serialize_f32(&mut self.next_rtt)?;
            stream.serialize_f32(&mut self.next_jitter)?;
            stream.serialize_f32(&mut self.next_packet_loss)?;
            stream.serialize_u32(&mut self.next_kbps_up)?;
            stream.serialize_u32(&mut self.next_kbps_down)?;
        }

        stream.serialize_bool(&mut self.reported)?;

        if self.sdk_version.at_least(4, 0, 2) {
            stream.serialize_bool(&mut self.fallback_to_direct)?;
            if self.fallback_to_direct {
                stream.serialize_u64(&mut self.fallback_flags)?;
            }
        }

        stream.serialize_u64(&mut self.packets_sent_client_to_server)?;
        stream.serialize_u64(&mut self.packets_sent_server_to_client)?;

        if self.sdk_version.at_least(4, 0, 3) {
            let mut has_lost = self.packets_lost_client_to_server != 0
                || self.packets_lost_server_to_client != 0;
            stream.serialize_bool(&mut has_lost)?;
            if has_lost {
                stream.serialize_u64(&mut self.packets_lost_client_to_server)?;
                stream.serialize_u64(&mut self.packets_lost_server_to_client)?;
            }
        }

        if self.sdk_version.at_least(4, 0, 4) {
            let mut has_events = self.session_events != 0;
            stream.serialize_bool(&mut has_events)?;
            if has_events {
                stream.serialize_u64(&mut self.session_events)?;
            }
        }

        if self.sdk_version.at_least(4, 0, 5) {
            let mut has_out_of_order = self.out_of_order_client_to_server != 0
                || self.out_of_order_server_to_client != 0;
            stream.serialize_bool(&mut has_out_of_order)?;
            if has_out_of_order {
                stream.serialize_u64(&mut self.out_of_order_client_to_server)?;
                stream.serialize_u64(&mut self.out_of_order_server_to_client)?;
            }
        }

        if self.sdk_version.at_least(4, 0, 6) {
            stream.serialize_bool(&mut self.client_ping_timed_out)?;
        }

        let mut has_pings = !self.near_relay_pings.is_empty();
        stream.serialize_bool(&mut has_pings)?;
        if has_pings {
            let mut count = self.near_relay_pings.len() as i64;
            stream.serialize_int_range(&mut count, 1, MAX_NEAR_RELAYS as i64)?;
            if !stream.is_writing() {
                self.near_relay_pings = vec![NearRelayPing::default(); count as usize];
            }
            for ping in self.near_relay_pings.iter_mut() {
                stream.serialize_u64(&mut ping.relay_id)?;
                stream.serialize_u8(&mut ping.rtt)?;
                stream.serialize_u8(&mut ping.jitter)?;
                stream.serialize_u8(&mut ping.packet_loss_percent)?;
            }
        }

        stream.serialize_u64(&mut self.client_ping_timestamp)?;
        Ok(())
    }
}

// ── Session response ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NearRelayAddress {
    pub relay_id: u64,
    pub address: Option<SocketAddr>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionResponsePacket {
    pub session_id: u64,
    pub slice_number: u32,
    pub route_type: RouteType,
    pub multipath: bool,
    pub committed: bool,
    /// Sealed tokens, concatenated. Stride depends on `route_type`.
    pub tokens: Vec<u8>,
    pub session_data: Vec<u8>,
    pub near_relays: Vec<NearRelayAddress>,
}

impl Packet for SessionResponsePacket {
    const PACKET_TYPE: u8 = crate::wire::PACKET_SESSION_RESPONSE;

    fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<(), WireError> {
        stream.serialize_u64(&mut self.session_id)?;
        stream.serialize_u32(&mut self.slice_number)?;

        let mut route = self.route_type as i64;
        stream.serialize_int_range(&mut route, 0, 2)?;
        self.route_type = RouteType::try_from(route as u8)?;

        stream.serialize_bool(&mut self.multipath)?;
        stream.serialize_bool(&mut self.committed)?;

        if self.route_type != RouteType::Direct {
            let stride = match self.route_type {
                RouteType::New => ENCRYPTED_ROUTE_TOKEN_BYTES,
                _ => ENCRYPTED_CONTINUE_TOKEN_BYTES,
            };
            let mut count = (self.tokens.len() / stride) as i64;
            stream.serialize_int_range(&mut count, 1, MAX_TOKENS as i64)?;
            if !stream.is_writing() {
                self.tokens = vec![0u8; count as usize * stride];
            }
            stream.serialize_bytes(&mut self.tokens)?;
        }

        stream.serialize_byte_vec(&mut self.session_data, MAX_SESSION_DATA_BYTES)?;

        let mut count = self.near_relays.len() as i64;
        stream.serialize_int_range(&mut count, 0, MAX_NEAR_RELAYS as i64)?;
        if !stream.is_writing() {
            self.near_relays = vec![NearRelayAddress::default(); count as usize];
        }
        for near in self.near_relays.iter_mut() {
            stream.serialize_u64(&mut near.relay_id)?;
            serialize_address(stream, &mut near.address)?;
        }
        Ok(())
    }
}
