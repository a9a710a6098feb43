//! Shared wire constants and primitives for both packet generations.
//!
//! These values ARE the protocol. Packet-type bytes, size limits, and the
//! 19-byte packed address format are shared between the v4 and v5
//! generations and between the backend and every SDK in the field.
//! Changing anything here is a breaking change.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::stream::{ReadStream, Stream, WireError, WriteStream};

/// Hard ceiling on any datagram we read or write.
pub const MAX_PACKET_BYTES: usize = 4096;

/// Session-state blobs may not exceed this many bytes.
pub const MAX_SESSION_DATA_BYTES: usize = 511;

/// Most route tokens a single response can carry (client + 5 relays + server).
pub const MAX_TOKENS: usize = 7;

/// Most relays a single route may traverse.
pub const MAX_ROUTE_RELAYS: usize = 5;

/// Most near relays reported to or by a client.
pub const MAX_NEAR_RELAYS: usize = 32;

/// Seconds per accounting slice.
pub const SLICE_SECONDS: u64 = 10;

// v4 generation packet types.
pub const PACKET_SERVER_INIT_REQUEST: u8 = 220;
pub const PACKET_SERVER_INIT_RESPONSE: u8 = 221;
pub const PACKET_SERVER_UPDATE: u8 = 222;
pub const PACKET_SESSION_UPDATE: u8 = 223;
pub const PACKET_SESSION_RESPONSE: u8 = 224;

// v5 generation packet types. Disjoint from v4 so one socket can split
// generations on the first byte.
pub const PACKET5_SERVER_INIT_REQUEST: u8 = 100;
pub const PACKET5_SERVER_INIT_RESPONSE: u8 = 101;
pub const PACKET5_SERVER_UPDATE_REQUEST: u8 = 102;
pub const PACKET5_SERVER_UPDATE_RESPONSE: u8 = 103;
pub const PACKET5_SESSION_UPDATE_REQUEST: u8 = 104;
pub const PACKET5_SESSION_RESPONSE: u8 = 105;

/// What the response tells the client to do with its traffic this slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RouteType {
    #[default]
    Direct = 0,
    /// Fresh route: the response carries full route tokens.
    New = 1,
    /// Unchanged route: the response carries continue tokens.
    Continue = 2,
}

impl TryFrom<u8> for RouteType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(RouteType::Direct),
            1 => Ok(RouteType::New),
            2 => Ok(RouteType::Continue),
            other => Err(WireError::OutOfRange { value: i64::from(other), min: 0, max: 2 }),
        }
    }
}

// ── SDK version ───────────────────────────────────────────────────────────────

/// Three-part SDK version carried in every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SdkVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl SdkVersion {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self { major, minor, patch }
    }

    fn ordinal(self) -> u32 {
        (u32::from(self.major) << 16) | (u32::from(self.minor) << 8) | u32::from(self.patch)
    }

    pub fn at_least(self, major: u8, minor: u8, patch: u8) -> bool {
        self.ordinal() >= Self::new(major, minor, patch).ordinal()
    }

    pub fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<(), WireError> {
        stream.serialize_u8(&mut self.major)?;
        stream.serialize_u8(&mut self.minor)?;
        stream.serialize_u8(&mut self.patch)?;
        Ok(())
    }
}

impl std::fmt::Display for SdkVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Oldest v4 SDK the backend will talk to.
pub const MIN_SDK_VERSION: SdkVersion = SdkVersion::new(4, 0, 0);

/// Oldest v5 SDK the backend will talk to.
pub const MIN_SDK5_VERSION: SdkVersion = SdkVersion::new(5, 0, 0);

// ── Packet payloads ───────────────────────────────────────────────────────────

/// One bit-packed packet payload (the part between framing and trailer).
pub trait Packet: Default {
    const PACKET_TYPE: u8;
    fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<(), WireError>;
}

pub fn write_payload<P: Packet>(packet: &mut P) -> Result<Vec<u8>, WireError> {
    let mut stream = WriteStream::with_capacity(256);
    packet.serialize(&mut stream)?;
    Ok(stream.finish())
}

pub fn read_payload<P: Packet>(payload: &[u8]) -> Result<P, WireError> {
    let mut stream = ReadStream::new(payload);
    let mut packet = P::default();
    packet.serialize(&mut stream)?;
    Ok(packet)
}

// ── Addresses ─────────────────────────────────────────────────────────────────

/// Packed socket-address size inside fixed-layout records (route tokens).
/// One type byte, up to 16 address bytes, 2 port bytes.
pub const ADDRESS_BYTES: usize = 19;

const ADDRESS_NONE: u8 = 0;
const ADDRESS_IPV4: u8 = 1;
const ADDRESS_IPV6: u8 = 2;

/// Pack an optional socket address into the fixed 19-byte form.
pub fn pack_address(addr: Option<SocketAddr>) -> [u8; ADDRESS_BYTES] {
    let mut out = [0u8; ADDRESS_BYTES];
    match addr {
        None => {}
        Some(SocketAddr::V4(v4)) => {
            out[0] = ADDRESS_IPV4;
            out[1..5].copy_from_slice(&v4.ip().octets());
            out[5..7].copy_from_slice(&v4.port().to_le_bytes());
        }
        Some(SocketAddr::V6(v6)) => {
            out[0] = ADDRESS_IPV6;
            out[1..17].copy_from_slice(&v6.ip().octets());
            out[17..19].copy_from_slice(&v6.port().to_le_bytes());
        }
    }
    out
}

/// Unpack the fixed 19-byte form. The all-zero record is `None`.
pub fn unpack_address(packed: &[u8; ADDRESS_BYTES]) -> Result<Option<SocketAddr>, WireError> {
    match packed[0] {
        ADDRESS_NONE => Ok(None),
        ADDRESS_IPV4 => {
            let octets: [u8; 4] = packed[1..5].try_into().unwrap_or_default();
            let port = u16::from_le_bytes([packed[5], packed[6]]);
            Ok(Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)))
        }
        ADDRESS_IPV6 => {
            let octets: [u8; 16] = packed[1..17].try_into().unwrap_or_default();
            let port = u16::from_le_bytes([packed[17], packed[18]]);
            Ok(Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)))
        }
        other => Err(WireError::BadAddressType(other)),
    }
}

/// Bit-stream codec for addresses inside packets. Two-bit type tag, then
/// octets and port; absent addresses cost two bits.
pub fn serialize_address<S: Stream>(
    stream: &mut S,
    addr: &mut Option<SocketAddr>,
) -> Result<(), WireError> {
    let mut kind: u32 = match addr {
        None => u32::from(ADDRESS_NONE),
        Some(SocketAddr::V4(_)) => u32::from(ADDRESS_IPV4),
        Some(SocketAddr::V6(_)) => u32::from(ADDRESS_IPV6),
    };
    stream.serialize_bits(&mut kind, 2)?;

    match kind as u8 {
        ADDRESS_NONE => {
            *addr = None;
            Ok(())
        }
        ADDRESS_IPV4 => {
            let (mut octets, mut port) = match addr {
                Some(SocketAddr::V4(v4)) => (v4.ip().octets(), v4.port()),
                _ => ([0u8; 4], 0),
            };
            for octet in octets.iter_mut() {
                stream.serialize_u8(octet)?;
            }
            stream.serialize_u16(&mut port)?;
            *addr = Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port));
            Ok(())
        }
        ADDRESS_IPV6 => {
            let (mut octets, mut port) = match addr {
                Some(SocketAddr::V6(v6)) => (v6.ip().octets(), v6.port()),
                _ => ([0u8; 16], 0),
            };
            for octet in octets.iter_mut() {
                stream.serialize_u8(octet)?;
            }
            stream.serialize_u16(&mut port)?;
            *addr = Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port));
            Ok(())
        }
        other => Err(WireError::BadAddressType(other)),
    }
}

/// Address bytes fed into v5 packet filters and ping tokens:
/// ip octets then big-endian port.
pub fn address_filter_bytes(addr: &SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(18);
    match addr.ip() {
        IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}
