//! The v5 packet generation.
//!
//! Frame layout: `[type u8][chonkle 15][payload][signature 64][pittle 2]`.
//!
//! The chonkle and pittle are stateless obfuscation bytes derived from the
//! packet header addresses and length. Middleboxes that mangle either end
//! of a datagram get caught by the cheap filters before any crypto runs.
//! The signature covers the type byte and the payload, nothing else, so
//! the obfuscation bytes can be regenerated per hop.
//!
//! Payloads begin with the 3-byte SDK version followed by a raw
//! little-endian buyer id, so handlers can pick the verifying key with a
//! fixed-offset peek before parsing anything.

use std::net::SocketAddr;

use crate::crypto::{self, SigningKeypair, KEY_BYTES, SIGNATURE_BYTES};
use crate::stream::{Stream, WireError};
use crate::token::{ENCRYPTED_CONTINUE_TOKEN_BYTES, ENCRYPTED_ROUTE_TOKEN_BYTES};
use crate::wire::{
    address_filter_bytes, serialize_address, Packet, RouteType, SdkVersion, MAX_NEAR_RELAYS,
    MAX_SESSION_DATA_BYTES, MAX_TOKENS,
};

pub const CHONKLE_BYTES: usize = 15;
pub const PITTLE_BYTES: usize = 2;

/// Bytes before the payload: type byte + chonkle.
pub const PACKET5_PREFIX_BYTES: usize = 1 + CHONKLE_BYTES;

/// Bytes after the payload: signature + pittle.
pub const PACKET5_TRAILER_BYTES: usize = SIGNATURE_BYTES + PITTLE_BYTES;

/// Smallest framed packet worth looking at: prefix + version + buyer id
/// prefix of the payload + trailer.
pub const MIN_FRAMED_PACKET5_BYTES: usize = PACKET5_PREFIX_BYTES + 3 + 4 + PACKET5_TRAILER_BYTES;

/// Responses from this service are chonkled with the zero magic; the magic
/// triple only governs relay-facing traffic.
pub const ZERO_MAGIC: [u8; 8] = [0u8; 8];

pub const MAX_SESSION_DEBUG_BYTES: usize = 256;

// Server init response codes, shared with the v4 generation.
pub use crate::packets4::{
    INIT_RESPONSE_BUYER_NOT_LIVE, INIT_RESPONSE_OK, INIT_RESPONSE_SDK_TOO_OLD,
    INIT_RESPONSE_UNKNOWN_BUYER, INIT_RESPONSE_UNKNOWN_DATACENTER,
};
pub use crate::packets4::{MAX_CONNECTION_TYPE, MAX_DATACENTER_NAME_BYTES, MAX_PLATFORM_ID};

// ── Obfuscation bytes ─────────────────────────────────────────────────────────

/// Two tail bytes derived from the endpoint addresses and packet length.
pub fn generate_pittle(from: &[u8], to: &[u8], packet_length: usize) -> [u8; PITTLE_BYTES] {
    let length_bytes = (packet_length as u16).to_le_bytes();

    let mut sum: u16 = 0;
    for &byte in from.iter().chain(to.iter()).chain(length_bytes.iter()) {
        sum = sum.wrapping_add(u16::from(byte));
    }

    let sum_bytes = sum.to_le_bytes();
    let mut out = [0u8; PITTLE_BYTES];
    out[0] = 1 | (sum_bytes[0] ^ sum_bytes[1] ^ 193);
    out[1] = 1 | ((255 - out[0]) ^ 113);
    out
}

/// Fifteen header bytes expanded from a keyed hash of the magic, the
/// endpoint addresses, and the packet length. Each output byte lands in a
/// fixed narrow range so junk traffic fails [`basic_packet_filter`] with
/// high probability without any per-packet state.
pub fn generate_chonkle(
    magic: &[u8; 8],
    from: &[u8],
    to: &[u8],
    packet_length: usize,
) -> [u8; CHONKLE_BYTES] {
    let length_bytes = (packet_length as u16).to_le_bytes();
    let hash = crypto::fnv1a(&[magic, from, to, &length_bytes]);
    let data = hash.to_le_bytes();

    let mut out = [0u8; CHONKLE_BYTES];
    out[0] = ((data[6] & 0xC0) >> 6) + 42;
    out[1] = (data[3] & 0x1F) + 200;
    out[2] = ((data[2] & 0xFC) >> 2) + 5;
    out[3] = data[0];
    out[4] = (data[2] & 0x03) + 78;
    out[5] = (data[4] & 0x7F) + 96;
    out[6] = ((data[1] & 0xFC) >> 2) + 100;
    out[7] = if data[7] & 1 == 0 { 79 } else { 7 };
    out[8] = if data[4] & 0x80 == 0 { 37 } else { 83 };
    out[9] = (data[5] & 0x07) + 124;
    out[10] = ((data[1] & 0xE0) >> 5) + 175;
    out[11] = (data[6] & 0x3F) + 33;
    out[12] = match data[1] & 0x03 {
        0 => 97,
        1 => 5,
        2 => 43,
        _ => 13,
    };
    out[13] = ((data[5] & 0xF8) >> 3) + 210;
    out[14] = ((data[7] & 0xFE) >> 1) + 17;
    out
}

/// Range checks over the chonkle bytes and the pittle self-relation.
/// Rejects nearly all random or truncated datagrams without touching the
/// addresses.
pub fn basic_packet_filter(data: &[u8]) -> bool {
    if data.len() < PACKET5_PREFIX_BYTES + PITTLE_BYTES {
        return false;
    }

    if data[1] < 0x2A || data[1] > 0x2D {
        return false;
    }
    if data[2] < 0xC8 || data[2] > 0xE7 {
        return false;
    }
    if data[3] < 0x05 || data[3] > 0x44 {
        return false;
    }
    // data[4] carries a free hash byte.
    if data[5] < 0x4E || data[5] > 0x51 {
        return false;
    }
    if data[6] < 0x60 || data[6] > 0xDF {
        return false;
    }
    if data[7] < 0x64 || data[7] > 0xE3 {
        return false;
    }
    if data[8] != 0x07 && data[8] != 0x4F {
        return false;
    }
    if data[9] != 0x25 && data[9] != 0x53 {
        return false;
    }
    if data[10] < 0x7C || data[10] > 0x83 {
        return false;
    }
    if data[11] < 0xAF || data[11] > 0xB6 {
        return false;
    }
    if data[12] < 0x21 || data[12] > 0x60 {
        return false;
    }
    if data[13] != 0x61 && data[13] != 0x05 && data[13] != 0x2B && data[13] != 0x0D {
        return false;
    }
    if data[14] < 0xD2 || data[14] > 0xF1 {
        return false;
    }
    if data[15] < 0x11 || data[15] > 0x90 {
        return false;
    }

    let pittle = &data[data.len() - PITTLE_BYTES..];
    pittle[1] == 1 | ((255 - pittle[0]) ^ 113)
}

/// Regenerate the obfuscation bytes for a specific magic and endpoint pair
/// and compare. A packet from a sender holding a stale magic passes when
/// the caller retries with the previous value.
pub fn advanced_packet_filter(data: &[u8], magic: &[u8; 8], from: &[u8], to: &[u8]) -> bool {
    if data.len() < PACKET5_PREFIX_BYTES + PITTLE_BYTES {
        return false;
    }
    let pittle = generate_pittle(from, to, data.len());
    let chonkle = generate_chonkle(magic, from, to, data.len());
    data[data.len() - PITTLE_BYTES..] == pittle && data[1..PACKET5_PREFIX_BYTES] == chonkle
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Assemble, sign, and obfuscate a complete v5 datagram.
pub fn frame_packet5(
    packet_type: u8,
    payload: &[u8],
    keypair: &SigningKeypair,
    magic: &[u8; 8],
    from: &SocketAddr,
    to: &SocketAddr,
) -> Vec<u8> {
    let total = PACKET5_PREFIX_BYTES + payload.len() + PACKET5_TRAILER_BYTES;
    let mut data = Vec::with_capacity(total);
    data.push(packet_type);
    data.extend_from_slice(&[0u8; CHONKLE_BYTES]);
    data.extend_from_slice(payload);

    let signature = keypair.sign_parts(&[&data[..1], payload]);
    data.extend_from_slice(&signature);
    data.extend_from_slice(&[0u8; PITTLE_BYTES]);

    let from_bytes = address_filter_bytes(from);
    let to_bytes = address_filter_bytes(to);
    let chonkle = generate_chonkle(magic, &from_bytes, &to_bytes, total);
    data[1..PACKET5_PREFIX_BYTES].copy_from_slice(&chonkle);
    let pittle = generate_pittle(&from_bytes, &to_bytes, total);
    data[total - PITTLE_BYTES..].copy_from_slice(&pittle);
    data
}

#[derive(Debug)]
pub struct Frame5<'a> {
    pub packet_type: u8,
    pub payload: &'a [u8],
}

/// Slice a filtered datagram into type and payload. Run the packet filters
/// and [`verify_frame5`] separately; this only checks the length.
pub fn open_frame5(data: &[u8]) -> Result<Frame5<'_>, WireError> {
    if data.len() < MIN_FRAMED_PACKET5_BYTES {
        return Err(WireError::TooShort { len: data.len(), min: MIN_FRAMED_PACKET5_BYTES });
    }
    Ok(Frame5 {
        packet_type: data[0],
        payload: &data[PACKET5_PREFIX_BYTES..data.len() - PACKET5_TRAILER_BYTES],
    })
}

/// Verify the signature of a framed v5 packet.
pub fn verify_frame5(data: &[u8], public: &[u8; KEY_BYTES]) -> bool {
    if data.len() < MIN_FRAMED_PACKET5_BYTES {
        return false;
    }
    let payload = &data[PACKET5_PREFIX_BYTES..data.len() - PACKET5_TRAILER_BYTES];
    let signature = &data[data.len() - PACKET5_TRAILER_BYTES..data.len() - PITTLE_BYTES];
    crypto::verify_signature_parts(public, &[&data[..1], payload], signature)
}

/// Raw little-endian buyer id at its fixed payload offset, read before the
/// packet is parsed so the verifying key can be looked up.
pub fn peek_buyer_id5(data: &[u8]) -> Option<u64> {
    let start = PACKET5_PREFIX_BYTES + 3;
    let bytes = data.get(start..start + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

// ── Server packets ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerInitRequestPacket5 {
    pub sdk_version: SdkVersion,
    pub buyer_id: u64,
    pub request_id: u64,
    pub datacenter_id: u64,
    pub datacenter_name: String,
}

impl Packet for ServerInitRequestPacket5 {
    const PACKET_TYPE: u8 = crate::wire::PACKET5_SERVER_INIT_REQUEST;

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
pub struct ServerInitResponsePacket5 {
    pub request_id: u64,
    pub response: u8,
    pub upcoming_magic: [u8; 8],
    pub current_magic: [u8; 8],
    pub previous_magic: [u8; 8],
}

impl Packet for ServerInitResponsePacket5 {
    const PACKET_TYPE: u8 = crate::wire::PACKET5_SERVER_INIT_RESPONSE;

    fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<(), WireError> {
        stream.serialize_u64(&mut self.request_id)?;
        stream.serialize_u8(&mut self.response)?;
        stream.serialize_bytes(&mut self.upcoming_magic)?;
        stream.serialize_bytes(&mut self.current_magic)?;
        stream.serialize_bytes(&mut self.previous_magic)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerUpdateRequestPacket5 {
    pub sdk_version: SdkVersion,
    pub buyer_id: u64,
    pub request_id: u64,
    pub datacenter_id: u64,
    pub match_id: u64,
    pub num_sessions: u32,
    pub server_address: Option<SocketAddr>,
}

impl Packet for ServerUpdateRequestPacket5 {
    const PACKET_TYPE: u8 = crate::wire::PACKET5_SERVER_UPDATE_REQUEST;

    fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<(), WireError> {
        self.sdk_version.serialize(stream)?;
        stream.serialize_u64(&mut self.buyer_id)?;
        stream.serialize_u64(&mut self.request_id)?;
        stream.serialize_u64(&mut self.datacenter_id)?;
        stream.serialize_u64(&mut self.match_id)?;
        stream.serialize_u32(&mut self.num_sessions)?;
        serialize_address(stream, &mut self.server_address)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerUpdateResponsePacket5 {
    pub request_id: u64,
    pub upcoming_magic: [u8; 8],
    pub current_magic: [u8; 8],
    pub previous_magic: [u8; 8],
}

impl Packet for ServerUpdateResponsePacket5 {
    const PACKET_TYPE: u8 = crate::wire::PACKET5_SERVER_UPDATE_RESPONSE;

    fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<(), WireError> {
        stream.serialize_u64(&mut self.request_id)?;
        stream.serialize_bytes(&mut self.upcoming_magic)?;
        stream.serialize_bytes(&mut self.current_magic)?;
        stream.serialize_bytes(&mut self.previous_magic)?;
        Ok(())
    }
}

// ── Session update ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NearRelayPing5 {
    pub relay_id: u64,
    pub rtt: u8,
    pub jitter: u8,
    pub packet_loss: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionUpdateRequestPacket5 {
    pub sdk_version: SdkVersion,
    pub buyer_id: u64,
    pub datacenter_id: u64,
    pub session_id: u64,
    pub slice_number: u32,
    pub retry_number: u32,
    pub session_data: Vec<u8>,
    pub session_data_signature: [u8; SIGNATURE_BYTES],
    pub client_address: Option<SocketAddr>,
    pub server_address: Option<SocketAddr>,
    pub client_route_public_key: [u8; KEY_BYTES],
    pub server_route_public_key: [u8; KEY_BYTES],
    pub user_hash: u64,
    pub platform_id: u8,
    pub connection_type: u8,

    pub next: bool,
    pub reported: bool,
    pub fallback_to_direct: bool,
    pub client_bandwidth_over_limit: bool,
    pub server_bandwidth_over_limit: bool,
    pub client_ping_timed_out: bool,

    pub session_events: u64,
    pub internal_events: u64,

    pub direct_rtt: f32,
    pub direct_jitter: f32,
    pub direct_packet_loss: f32,
    pub direct_max_packet_loss_seen: f32,

    pub next_rtt: f32,
    pub next_jitter: f32,
    pub next_packet_loss: f32,

    pub near_relay_pings: Vec<NearRelayPing5>,

    pub direct_kbps_up: u32,
    pub direct_kbps_down: u32,
    pub next_kbps_up: u32,
    pub next_kbps_down: u32,

    pub packets_sent_client_to_server: u64,
    pub packets_sent_server_to_client: u64,
    pub packets_lost_client_to_server: u64,
    pub packets_lost_server_to_client: u64,
    pub out_of_order_client_to_server: u64,
    pub out_of_order_server_to_client: u64,

    pub jitter_client_to_server: f32,
    pub jitter_server_to_client: f32,
}

impl Default for SessionUpdateRequestPacket5 {
    fn default() -> Self {
        Self {
            sdk_version: SdkVersion::default(),
            buyer_id: 0,
            datacenter_id: 0,
            session_id: 0,
            slice_number: 0,
            retry_number: 0,
            session_data: Vec::new(),
            session_data_signature: [0u8; SIGNATURE_BYTES],
            client_address: None,
            server_address: None,
            client_route_public_key: [0u8; KEY_BYTES],
            server_route_public_key: [0u8; KEY_BYTES],
            user_hash: 0,
            platform_id: 0,
            connection_type: 0,
            next: false,
            reported: false,
            fallback_to_direct: false,
            client_bandwidth_over_limit: false,
            server_bandwidth_over_limit: false,
            client_ping_timed_out: false,
            session_events: 0,
            internal_events: 0,
            direct_rtt: 0.0,
            direct_jitter: 0.0,
            direct_packet_loss: 0.0,
            direct_max_packet_loss_seen: 0.0,
            next_rtt: 0.0,
            next_jitter: 0.0,
            next_packet_loss: 0.0,
            near_relay_pings: Vec::new(),
            direct_kbps_up: 0,
            direct_kbps_down: 0,
            next_kbps_up: 0,
            next_kbps_down: 0,
            packets_sent_client_to_server: 0,
            packets_sent_server_to_client: 0,
            packets_lost_client_to_server: 0,
            packets_lost_server_to_client: 0,
            out_of_order_client_to_server: 0,
            out_of_order_server_to_client: 0,
            jitter_client_to_server: 0.0,
            jitter_server_to_client: 0.0,
        }
    }
}

impl Packet for SessionUpdateRequestPacket5 {
    const PACKET_TYPE: u8 = crate::wire::PACKET5_SESSION_UPDATE_REQUEST;

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
        if !self.session_data.is_empty() {
            stream.serialize_bytes(&mut self.session_data_signature)?;
        }

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

        stream.serialize_bool(&mut self.next)?;
        stream.serialize_bool(&mut self.reported)?;
        stream.serialize_bool(&mut self.fallback_to_direct)?;
        stream.serialize_bool(&mut self.client_bandwidth_over_limit)?;
        stream.serialize_bool(&mut self.server_bandwidth_over_limit)?;
        stream.serialize_bool(&mut self.client_ping_timed_out)?;

        let mut has_pings = !self.near_relay_pings.is_empty();
        stream.serialize_bool(&mut has_pings)?;

        let mut has_session_events = self.session_events != 0;
        let mut has_internal_events = self.internal_events != 0;
        let mut has_lost = self.packets_lost_client_to_server != 0
            || self.packets_lost_server_to_client != 0;
        let mut has_out_of_order = self.out_of_order_client_to_server != 0
            || self.out_of_order_server_to_client != 0;
        stream.serialize_bool(&mut has_session_events)?;
        stream.serialize_bool(&mut has_internal_events)?;
        stream.serialize_bool(&mut has_lost)?;
        stream.serialize_bool(&mut has_out_of_order)?;

        if has_session_events {
            stream.serialize_u64(&mut self.session_events)?;
        }
        if has_internal_events {
            stream.serialize_u64(&mut self.internal_events)?;
        }

        stream.serialize_f32(&mut self.direct_rtt)?;
        stream.serialize_f32(&mut self.direct_jitter)?;
        stream.serialize_f32(&mut self.direct_packet_loss)?;
        stream.serialize_f32(&mut self.direct_max_packet_loss_seen)?;

        if self.next {
            stream.serialize_f32(&mut self.next_rtt)?;
            stream.serialize_f32(&mut self.next_jitter)?;
            stream.serialize_f32(&mut self.next_packet_loss)?;
        }

        if has_pings {
            let mut count = self.near_relay_pings.len() as i64;
            stream.serialize_int_range(&mut count, 1, MAX_NEAR_RELAYS as i64)?;
            if !stream.is_writing() {
                self.near_relay_pings = vec![NearRelayPing5::default(); count as usize];
            }
            for ping in self.near_relay_pings.iter_mut() {
                stream.serialize_u64(&mut ping.relay_id)?;
                stream.serialize_u8(&mut ping.rtt)?;
                stream.serialize_u8(&mut ping.jitter)?;
                stream.serialize_f32(&mut ping.packet_loss)?;
            }
        }

        stream.serialize_u32(&mut self.direct_kbps_up)?;
        stream.serialize_u32(&mut self.direct_kbps_down)?;
        if self.next {
            stream.serialize_u32(&mut self.next_kbps_up)?;
            stream.serialize_u32(&mut self.next_kbps_down)?;
        }

        stream.serialize_u64(&mut self.packets_sent_client_to_server)?;
        stream.serialize_u64(&mut self.packets_sent_server_to_client)?;
        if has_lost {
            stream.serialize_u64(&mut self.packets_lost_client_to_server)?;
            stream.serialize_u64(&mut self.packets_lost_server_to_client)?;
        }
        if has_out_of_order {
            stream.serialize_u64(&mut self.out_of_order_client_to_server)?;
            stream.serialize_u64(&mut self.out_of_order_server_to_client)?;
        }

        stream.serialize_f32(&mut self.jitter_client_to_server)?;
        stream.serialize_f32(&mut self.jitter_server_to_client)?;
        Ok(())
    }
}

// ── Session response ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct NearRelayToken5 {
    pub relay_id: u64,
    pub address: Option<SocketAddr>,
    pub ping_token: [u8; crypto::PING_TOKEN_BYTES],
}

impl Default for NearRelayToken5 {
    fn default() -> Self {
        Self { relay_id: 0, address: None, ping_token: [0u8; crypto::PING_TOKEN_BYTES] }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionResponsePacket5 {
    pub session_id: u64,
    pub slice_number: u32,
    pub session_data: Vec<u8>,
    pub session_data_signature: [u8; SIGNATURE_BYTES],
    pub route_type: RouteType,
    pub near_relays: Vec<NearRelayToken5>,
    pub near_relay_expire_timestamp: u64,
    pub multipath: bool,
    /// Sealed tokens, concatenated. Stride depends on `route_type`.
    pub tokens: Vec<u8>,
    pub debug: String,
}

impl Default for SessionResponsePacket5 {
    fn default() -> Self {
        Self {
            session_id: 0,
            slice_number: 0,
            session_data: Vec::new(),
            session_data_signature: [0u8; SIGNATURE_BYTES],
            route_type: RouteType::Direct,
            near_relays: Vec::new(),
            near_relay_expire_timestamp: 0,
            multipath: false,
            tokens: Vec::new(),
            debug: String::new(),
        }
    }
}

impl Packet for SessionResponsePacket5 {
    const PACKET_TYPE: u8 = crate::wire::PACKET5_SESSION_RESPONSE;

    fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<(), WireError> {
        stream.serialize_u64(&mut self.session_id)?;
        stream.serialize_u32(&mut self.slice_number)?;

        stream.serialize_byte_vec(&mut self.session_data, MAX_SESSION_DATA_BYTES)?;
        if !self.session_data.is_empty() {
            stream.serialize_bytes(&mut self.session_data_signature)?;
        }

        let mut route = self.route_type as i64;
        stream.serialize_int_range(&mut route, 0, 2)?;
        self.route_type = RouteType::try_from(route as u8)?;

        let mut has_near_relays = !self.near_relays.is_empty();
        stream.serialize_bool(&mut has_near_relays)?;
        if has_near_relays {
            let mut count = self.near_relays.len() as i64;
            stream.serialize_int_range(&mut count, 1, MAX_NEAR_RELAYS as i64)?;
            if !stream.is_writing() {
                self.near_relays = vec![NearRelayToken5::default(); count as usize];
            }
            for near in self.near_relays.iter_mut() {
                stream.serialize_u64(&mut near.relay_id)?;
                serialize_address(stream, &mut near.address)?;
                stream.serialize_bytes(&mut near.ping_token)?;
            }
            stream.serialize_u64(&mut self.near_relay_expire_timestamp)?;
        }

        if self.route_type != RouteType::Direct {
            stream.serialize_bool(&mut self.multipath)?;
            let stride = match self.route_type {
                RouteType::New => ENCRYPTED_ROUTE_TOKEN_BYTES,
                _ => ENCRYPTED_CONTINUE_TOKEN_BYTES,
            };
            let mut count = (self.tokens.len() / stride) as i64;
            stream.serialize_int_range(&mut count, 0, MAX_TOKENS as i64)?;
            if !stream.is_writing() {
                self.tokens = vec![0u8; count as usize * stride];
            }
            stream.serialize_bytes(&mut self.tokens)?;
        }

        let mut has_debug = !self.debug.is_empty();
        stream.serialize_bool(&mut has_debug)?;
        stream.serialize_string(&mut self.debug, MAX_SESSION_DEBUG_BYTES)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{read_payload, write_payload};

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn generated_frames_pass_both_filters() {
        let from = address_filter_bytes(&addr("50.0.0.1:30000"));
        let to = address_filter_bytes(&addr("35.0.0.2:40000"));
        let magic = [7u8; 8];

        for length in [18usize, 89, 250, 1000, 4096] {
            let mut data = vec![0u8; length];
            data[0] = 104;
            let chonkle = generate_chonkle(&magic, &from, &to, length);
            data[1..PACKET5_PREFIX_BYTES].copy_from_slice(&chonkle);
            let pittle = generate_pittle(&from, &to, length);
            data[length - PITTLE_BYTES..].copy_from_slice(&pittle);

            assert!(basic_packet_filter(&data), "length {length}");
            assert!(advanced_packet_filter(&data, &magic, &from, &to), "length {length}");
            assert!(!advanced_packet_filter(&data, &[0u8; 8], &from, &to));
            assert!(!advanced_packet_filter(&data, &magic, &to, &from));
        }
    }

    #[test]
    fn random_bytes_fail_basic_filter() {
        use rand::RngCore;
        let mut rng = rand::thread_rng();
        let mut data = [0u8; 256];
        for _ in 0..1000 {
            rng.fill_bytes(&mut data);
            assert!(!basic_packet_filter(&data));
        }
    }

    #[test]
    fn frame_round_trip_sign_and_peek() {
        let keypair = SigningKeypair::generate();
        let from = addr("50.0.0.1:30000");
        let to = addr("35.0.0.2:40000");

        let mut packet = ServerUpdateRequestPacket5 {
            sdk_version: SdkVersion::new(5, 0, 1),
            buyer_id: 0xB0B0_1234,
            request_id: 42,
            datacenter_id: 0xDD,
            match_id: 9,
            num_sessions: 17,
            server_address: Some(to),
        };
        let payload = write_payload(&mut packet).unwrap();
        let framed = frame_packet5(
            ServerUpdateRequestPacket5::PACKET_TYPE,
            &payload,
            &keypair,
            &ZERO_MAGIC,
            &from,
            &to,
        );

        assert!(basic_packet_filter(&framed));
        let from_bytes = address_filter_bytes(&from);
        let to_bytes = address_filter_bytes(&to);
        assert!(advanced_packet_filter(&framed, &ZERO_MAGIC, &from_bytes, &to_bytes));
        assert_eq!(peek_buyer_id5(&framed), Some(0xB0B0_1234));
        assert!(verify_frame5(&framed, &keypair.public_bytes()));
        assert!(!verify_frame5(&framed, &SigningKeypair::generate().public_bytes()));

        let frame = open_frame5(&framed).unwrap();
        assert_eq!(frame.packet_type, ServerUpdateRequestPacket5::PACKET_TYPE);
        let decoded: ServerUpdateRequestPacket5 = read_payload(frame.payload).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn init_and_update_responses_carry_magic() {
        let mut response = ServerInitResponsePacket5 {
            request_id: 3,
            response: INIT_RESPONSE_OK,
            upcoming_magic: [1u8; 8],
            current_magic: [2u8; 8],
            previous_magic: [3u8; 8],
        };
        let decoded: ServerInitResponsePacket5 =
            read_payload(&write_payload(&mut response).unwrap()).unwrap();
        assert_eq!(decoded, response);

        let mut response = ServerUpdateResponsePacket5 {
            request_id: 4,
            upcoming_magic: [4u8; 8],
            current_magic: [5u8; 8],
            previous_magic: [6u8; 8],
        };
        let decoded: ServerUpdateResponsePacket5 =
            read_payload(&write_payload(&mut response).unwrap()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn session_update_round_trip() {
        let mut packet = SessionUpdateRequestPacket5 {
            sdk_version: SdkVersion::new(5, 0, 0),
            buyer_id: 77,
            datacenter_id: 0xDC,
            session_id: 0x5E55_1011,
            slice_number: 12,
            retry_number: 1,
            session_data: vec![3u8; 200],
            session_data_signature: [9u8; SIGNATURE_BYTES],
            client_address: Some(addr("100.64.3.3:30000")),
            server_address: Some(addr("35.1.1.1:40000")),
            client_route_public_key: [1u8; KEY_BYTES],
            server_route_public_key: [2u8; KEY_BYTES],
            user_hash: 0xFEED,
            platform_id: 3,
            connection_type: 2,
            next: true,
            reported: true,
            client_ping_timed_out: false,
            session_events: 0x10,
            direct_rtt: 80.0,
            direct_jitter: 7.0,
            direct_packet_loss: 1.0,
            direct_max_packet_loss_seen: 2.5,
            next_rtt: 60.0,
            next_jitter: 3.0,
            next_packet_loss: 0.0,
            near_relay_pings: vec![NearRelayPing5 {
                relay_id: 11,
                rtt: 25,
                jitter: 3,
                packet_loss: 0.5,
            }],
            direct_kbps_up: 120,
            direct_kbps_down: 480,
            next_kbps_up: 256,
            next_kbps_down: 1024,
            packets_sent_client_to_server: 5000,
            packets_sent_server_to_client: 5100,
            packets_lost_client_to_server: 4,
            packets_lost_server_to_client: 0,
            jitter_client_to_server: 2.0,
            jitter_server_to_client: 2.5,
            ..SessionUpdateRequestPacket5::default()
        };
        let payload = write_payload(&mut packet).unwrap();
        let decoded: SessionUpdateRequestPacket5 = read_payload(&payload).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn session_update_empty_data_skips_signature() {
        let mut with_data = SessionUpdateRequestPacket5 {
            session_data: vec![1u8; 100],
            session_data_signature: [7u8; SIGNATURE_BYTES],
            ..SessionUpdateRequestPacket5::default()
        };
        let mut without = SessionUpdateRequestPacket5::default();
        let longer = write_payload(&mut with_data).unwrap();
        let shorter = write_payload(&mut without).unwrap();
        assert!(longer.len() > shorter.len() + 100);

        let decoded: SessionUpdateRequestPacket5 = read_payload(&shorter).unwrap();
        assert_eq!(decoded.session_data_signature, [0u8; SIGNATURE_BYTES]);
    }

    #[test]
    fn session_response_round_trip_with_ping_tokens() {
        let mut packet = SessionResponsePacket5 {
            session_id: 500,
            slice_number: 2,
            session_data: vec![8u8; 120],
            session_data_signature: [3u8; SIGNATURE_BYTES],
            route_type: RouteType::New,
            near_relays: vec![
                NearRelayToken5 {
                    relay_id: 1,
                    address: Some(addr("10.0.0.1:40000")),
                    ping_token: [0xAA; crypto::PING_TOKEN_BYTES],
                },
                NearRelayToken5 {
                    relay_id: 2,
                    address: Some(addr("10.0.0.2:40000")),
                    ping_token: [0xBB; crypto::PING_TOKEN_BYTES],
                },
            ],
            near_relay_expire_timestamp: 1_800_000_000,
            multipath: true,
            tokens: vec![0x11; 4 * ENCRYPTED_ROUTE_TOKEN_BYTES],
            debug: "session takes next".to_string(),
        };
        let payload = write_payload(&mut packet).unwrap();
        let decoded: SessionResponsePacket5 = read_payload(&payload).unwrap();
        assert_eq!(decoded, packet);

        let mut direct = SessionResponsePacket5::default();
        let payload = write_payload(&mut direct).unwrap();
        let decoded: SessionResponsePacket5 = read_payload(&payload).unwrap();
        assert_eq!(decoded, direct);
    }

    #[test]
    fn min_framed_length_enforced() {
        assert_eq!(MIN_FRAMED_PACKET5_BYTES, 89);
        let short = vec![0u8; MIN_FRAMED_PACKET5_BYTES - 1];
        assert!(open_frame5(&short).is_err());
        assert!(!verify_frame5(&short, &[0u8; KEY_BYTES]));
        assert_eq!(peek_buyer_id5(&[0u8; 10]), None);
    }
}
