//! Hop list assembly for route and continue tokens.
//!
//! A route decision comes back as matrix indices. Before tokens can be
//! written those indices have to become concrete addresses and public
//! keys: client first, then each relay, then the game server. The build
//! is all or nothing; a route with any unresolvable relay is worthless
//! and the caller falls back to a direct response.

use std::collections::HashSet;
use std::net::SocketAddr;

use slipstream_core::crypto::KEY_BYTES;
use slipstream_core::token::{self, TokenError};

use crate::database::Directory;

/// Which sellers may carry traffic over their cloud-internal addresses.
/// Internal addresses are cheaper and often faster, but only reachable
/// between machines of the same operator.
#[derive(Debug, Clone, Default)]
pub struct InternalIpPolicy {
    pub enabled: bool,
    pub sellers: HashSet<String>,
}

impl InternalIpPolicy {
    pub fn new(enabled: bool, sellers: impl IntoIterator<Item = String>) -> Self {
        Self { enabled, sellers: sellers.into_iter().collect() }
    }
}

/// Ordered hop list for a route: client at index 0, server last.
#[derive(Debug, Clone)]
pub struct HopList {
    pub addresses: Vec<SocketAddr>,
    pub public_keys: Vec<[u8; KEY_BYTES]>,
}

impl HopList {
    /// Number of tokens this route needs: relays plus client and server.
    pub fn num_tokens(&self) -> usize {
        self.addresses.len()
    }
}

/// Resolves a route's matrix indices into the ordered hop list.
///
/// `route_relays` holds indices into `all_relay_ids`, the matrix's relay
/// id table. Returns `None` when any relay cannot be resolved to a live
/// directory record; a partially built route is never returned.
///
/// A relay hop gets its internal address only when the policy enables
/// the feature, the relay's seller is allow-listed, and the previous hop
/// is a relay of the same seller. The first relay's previous hop is the
/// client, so it always uses its public address.
pub fn build_hop_list(
    directory: &Directory,
    client_addr: SocketAddr,
    client_public_key: [u8; KEY_BYTES],
    server_addr: SocketAddr,
    server_public_key: [u8; KEY_BYTES],
    route_relays: &[i32],
    all_relay_ids: &[u64],
    policy: &InternalIpPolicy,
) -> Option<HopList> {
    let num_tokens = route_relays.len() + 2;
    let mut addresses = Vec::with_capacity(num_tokens);
    let mut public_keys = Vec::with_capacity(num_tokens);

    addresses.push(client_addr);
    public_keys.push(client_public_key);

    let mut previous_seller: Option<u64> = None;
    for &relay_index in route_relays {
        let relay_id = usize::try_from(relay_index)
            .ok()
            .and_then(|index| all_relay_ids.get(index))?;
        let relay = directory.relay_by_id(*relay_id)?;

        let allow_listed = directory
            .seller_of(relay)
            .map_or(false, |seller| policy.sellers.contains(&seller.name));

        let mut address = relay.public_addr;
        if policy.enabled && allow_listed && previous_seller == Some(relay.seller_id) {
            if let Some(internal) = relay.internal_addr {
                address = internal;
            }
        }

        addresses.push(address);
        public_keys.push(relay.public_key);
        previous_seller = Some(relay.seller_id);
    }

    addresses.push(server_addr);
    public_keys.push(server_public_key);

    Some(HopList { addresses, public_keys })
}

/// Seal a full chain of route tokens for a new or changed route.
pub fn next_tokens(
    hops: &HopList,
    expire_timestamp: u64,
    session_id: u64,
    session_version: u8,
    kbps_up: u32,
    kbps_down: u32,
    router_private: &[u8; KEY_BYTES],
) -> Result<Vec<u8>, TokenError> {
    let addresses: Vec<Option<SocketAddr>> =
        hops.addresses.iter().copied().map(Some).collect();
    token::write_route_tokens(
        expire_timestamp,
        session_id,
        session_version,
        kbps_up,
        kbps_down,
        &addresses,
        &hops.public_keys,
        router_private,
    )
}

/// Seal continue tokens for an unchanged route. Cheaper for every relay
/// to verify, which is why stay decisions prefer them.
pub fn continue_tokens(
    hops: &HopList,
    expire_timestamp: u64,
    session_id: u64,
    session_version: u8,
    router_private: &[u8; KEY_BYTES],
) -> Result<Vec<u8>, TokenError> {
    token::write_continue_tokens(
        expire_timestamp,
        session_id,
        session_version,
        &hops.public_keys,
        router_private,
    )
}
