//! Route-matrix snapshot.
//!
//! The route optimizer runs out of process and publishes a binary matrix
//! of the whole relay topology every few seconds: which relays exist,
//! where they sit, and the best precomputed multi-hop routes between
//! every relay pair. The daemon loads each publication, never mutates
//! it, and swaps the snapshot behind [`MatrixHolder`] so packet handlers
//! always see a complete, consistent table.
//!
//! Route entries are triangular: one [`RouteEntry`] per unordered relay
//! pair at [`tri_matrix_index`], read in reverse when the hops run the
//! other way.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use slipstream_core::stream::{ReadStream, Stream, WireError, WriteStream};
use slipstream_core::wire::serialize_address;

/// Binary format version accepted by [`RouteMatrix::from_bytes`].
pub const ROUTE_MATRIX_VERSION: u32 = 5;

/// Cost meaning "pair not routable".
pub const INVALID_ROUTE_COST: i32 = 10_000;

/// Routes kept per relay pair.
pub const MAX_ROUTES_PER_ENTRY: usize = 16;

/// Hops in a single route.
pub const MAX_RELAYS_PER_ROUTE: usize = 5;

/// Flat milliseconds added to every next cost so marginal routes lose
/// against direct.
pub const COST_BIAS: i32 = 3;

pub const MAX_RELAY_NAME_BYTES: usize = 63;

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("route matrix is malformed: {0}")]
    Wire(#[from] WireError),
    #[error("route matrix has {got} entries, expected {expected} for {relays} relays")]
    EntryCount { got: usize, expected: usize, relays: usize },
    #[error("route {route} of entry {entry} references relay index {index} of {relays}")]
    RelayIndexOutOfRange { entry: usize, route: usize, index: i32, relays: usize },
}

// ── Triangular indexing ───────────────────────────────────────────────────────

/// Entries needed for a triangular matrix over `size` relays.
pub fn tri_matrix_length(size: usize) -> usize {
    size * size.saturating_sub(1) / 2
}

/// Flat entry index for the unordered relay pair `(i, j)`, `i != j`.
pub fn tri_matrix_index(i: usize, j: usize) -> usize {
    let (i, j) = if i <= j { (j, i) } else { (i, j) };
    i * (i + 1) / 2 - i + j
}

/// FNV-style hash over a route's relay indices, stored per route so a
/// session's current route can be matched against a fresh matrix.
pub fn route_hash(relays: &[i32]) -> u32 {
    const PRIME: u32 = 16_777_619;
    let mut hash: u32 = 0;
    for &relay in relays {
        for shift in [24, 16, 8, 0] {
            hash ^= (relay as u32 >> shift) & 0xFF;
            hash = hash.wrapping_mul(PRIME);
        }
    }
    hash
}

// ── Geo math ──────────────────────────────────────────────────────────────────

/// Great-circle distance in kilometers.
pub fn haversine_distance(lat1: f64, long1: f64, lat2: f64, long2: f64) -> f64 {
    let lat1 = lat1.to_radians();
    let lat2 = lat2.to_radians();
    let delta_lat = lat2 - lat1;
    let delta_long = (long2 - long1).to_radians();
    let lat_sine = (delta_lat / 2.0).sin();
    let long_sine = (delta_long / 2.0).sin();
    let a = lat_sine * lat_sine + lat1.cos() * lat2.cos() * long_sine * long_sine;
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    6371.0 * c
}

/// Milliseconds for light to travel `a -> b -> c` along great circles.
pub fn speed_of_light_time_ms(
    a_lat: f64,
    a_long: f64,
    b_lat: f64,
    b_long: f64,
    c_lat: f64,
    c_long: f64,
) -> f64 {
    let total_km =
        haversine_distance(a_lat, a_long, b_lat, b_long) + haversine_distance(b_lat, b_long, c_lat, c_long);
    total_km / 299_792.458 * 1000.0
}

// ── Route entries ─────────────────────────────────────────────────────────────

/// Precomputed routes for one relay pair. `route_cost[0]` is the best
/// route; the rest are kept sorted so selection can break early.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    pub direct_cost: i32,
    pub num_routes: i32,
    pub route_cost: [i32; MAX_ROUTES_PER_ENTRY],
    pub route_num_relays: [i32; MAX_ROUTES_PER_ENTRY],
    pub route_relays: [[i32; MAX_RELAYS_PER_ROUTE]; MAX_ROUTES_PER_ENTRY],
    pub route_hash: [u32; MAX_ROUTES_PER_ENTRY],
}

impl Default for RouteEntry {
    fn default() -> Self {
        Self {
            direct_cost: -1,
            num_routes: 0,
            route_cost: [0; MAX_ROUTES_PER_ENTRY],
            route_num_relays: [0; MAX_ROUTES_PER_ENTRY],
            route_relays: [[0; MAX_RELAYS_PER_ROUTE]; MAX_ROUTES_PER_ENTRY],
            route_hash: [0; MAX_ROUTES_PER_ENTRY],
        }
    }
}

impl RouteEntry {
    fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<(), WireError> {
        let mut cost = i64::from(self.direct_cost);
        stream.serialize_int_range(&mut cost, -1, i64::from(INVALID_ROUTE_COST))?;
        self.direct_cost = cost as i32;

        let mut num_routes = i64::from(self.num_routes);
        stream.serialize_int_range(&mut num_routes, 0, MAX_ROUTES_PER_ENTRY as i64)?;
        self.num_routes = num_routes as i32;

        for i in 0..self.num_routes as usize {
            let mut cost = i64::from(self.route_cost[i]);
            stream.serialize_int_range(&mut cost, -1, i64::from(INVALID_ROUTE_COST))?;
            self.route_cost[i] = cost as i32;

            let mut hops = i64::from(self.route_num_relays[i]);
            stream.serialize_int_range(&mut hops, 0, MAX_RELAYS_PER_ROUTE as i64)?;
            self.route_num_relays[i] = hops as i32;

            stream.serialize_u32(&mut self.route_hash[i])?;

            for j in 0..self.route_num_relays[i] as usize {
                let mut index = i64::from(self.route_relays[i][j]);
                stream.serialize_int_range(&mut index, 0, i64::from(i32::MAX))?;
                self.route_relays[i][j] = index as i32;
            }
        }
        Ok(())
    }
}

// ── RouteMatrix ───────────────────────────────────────────────────────────────

/// One optimizer publication. Relay arrays are parallel, indexed by the
/// compact matrix index that route entries reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteMatrix {
    pub version: u32,
    pub relay_ids: Vec<u64>,
    pub relay_id_to_index: HashMap<u64, i32>,
    pub relay_addresses: Vec<SocketAddr>,
    pub relay_names: Vec<String>,
    pub relay_latitudes: Vec<f32>,
    pub relay_longitudes: Vec<f32>,
    pub relay_datacenter_ids: Vec<u64>,
    pub route_entries: Vec<RouteEntry>,
    pub created_at: u64,
    pub dest_relays: Vec<bool>,
}

impl RouteMatrix {
    fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<(), WireError> {
        stream.serialize_u32(&mut self.version)?;
        if !stream.is_writing() && self.version != ROUTE_MATRIX_VERSION {
            return Err(WireError::UnsupportedVersion {
                version: self.version,
                min: ROUTE_MATRIX_VERSION,
                max: ROUTE_MATRIX_VERSION,
            });
        }

        let mut num_relays = self.relay_ids.len() as u32;
        stream.serialize_u32(&mut num_relays)?;
        let num_relays = num_relays as usize;

        if !stream.is_writing() {
            self.relay_id_to_index = HashMap::with_capacity(num_relays);
            self.relay_ids = vec![0; num_relays];
            self.relay_addresses = Vec::with_capacity(num_relays);
            self.relay_names = vec![String::new(); num_relays];
            self.relay_latitudes = vec![0.0; num_relays];
            self.relay_longitudes = vec![0.0; num_relays];
            self.relay_datacenter_ids = vec![0; num_relays];
        }

        for i in 0..num_relays {
            stream.serialize_u64(&mut self.relay_ids[i])?;

            let mut address = self.relay_addresses.get(i).copied();
            serialize_address(stream, &mut address)?;
            if !stream.is_writing() {
                // An addressless relay cannot carry traffic; reject the file.
                self.relay_addresses.push(address.ok_or(WireError::BadAddressType(0))?);
            }

            stream.serialize_string(&mut self.relay_names[i], MAX_RELAY_NAME_BYTES)?;
            stream.serialize_f32(&mut self.relay_latitudes[i])?;
            stream.serialize_f32(&mut self.relay_longitudes[i])?;
            stream.serialize_u64(&mut self.relay_datacenter_ids[i])?;

            if !stream.is_writing() {
                self.relay_id_to_index.insert(self.relay_ids[i], i as i32);
            }
        }

        let mut num_entries = self.route_entries.len() as u32;
        stream.serialize_u32(&mut num_entries)?;
        if !stream.is_writing() {
            self.route_entries = vec![RouteEntry::default(); num_entries as usize];
        }
        for entry in self.route_entries.iter_mut() {
            entry.serialize(stream)?;
        }

        stream.serialize_u64(&mut self.created_at)?;

        if !stream.is_writing() {
            self.dest_relays = vec![false; num_relays];
        }
        for flag in self.dest_relays.iter_mut() {
            stream.serialize_bool(flag)?;
        }
        Ok(())
    }

    /// Decode a published matrix, rejecting unsupported versions and
    /// entries that do not line up with the relay table.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MatrixError> {
        let mut matrix = RouteMatrix::default();
        let mut stream = ReadStream::new(data);
        matrix.serialize(&mut stream)?;

        let num_relays = matrix.relay_ids.len();
        let expected = tri_matrix_length(num_relays);
        if matrix.route_entries.len() != expected {
            return Err(MatrixError::EntryCount {
                got: matrix.route_entries.len(),
                expected,
                relays: num_relays,
            });
        }
        for (e, entry) in matrix.route_entries.iter().enumerate() {
            for r in 0..entry.num_routes as usize {
                for j in 0..entry.route_num_relays[r] as usize {
                    let index = entry.route_relays[r][j];
                    if index < 0 || index as usize >= num_relays {
                        return Err(MatrixError::RelayIndexOutOfRange {
                            entry: e,
                            route: r,
                            index,
                            relays: num_relays,
                        });
                    }
                }
            }
        }
        Ok(matrix)
    }

    /// Encode at the current version.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let mut copy = self.clone();
        copy.version = ROUTE_MATRIX_VERSION;
        let mut stream = WriteStream::new();
        copy.serialize(&mut stream)?;
        Ok(stream.finish())
    }

    pub fn num_relays(&self) -> usize {
        self.relay_ids.len()
    }

    /// Compact matrix index for a relay id, if the relay is in this
    /// publication.
    pub fn relay_index(&self, relay_id: u64) -> Option<i32> {
        self.relay_id_to_index.get(&relay_id).copied()
    }

    /// True once the optimizer has missed enough publications that this
    /// snapshot cannot be trusted.
    pub fn is_stale(&self, now: u64, stale_seconds: u64) -> bool {
        self.created_at + stale_seconds < now
    }

    /// Relays pinned in the given datacenter.
    pub fn datacenter_relays(&self, datacenter_id: u64) -> Vec<u64> {
        self.relay_datacenter_ids
            .iter()
            .enumerate()
            .filter(|(_, &dc)| dc == datacenter_id)
            .map(|(i, _)| self.relay_ids[i])
            .collect()
    }

    /// Up to `max_near_relays` relays worth pinging from the client,
    /// ranked by distance. A relay qualifies when a detour through it at
    /// 2/3 the speed of light still lands within 30 ms of direct.
    ///
    /// Latitudes and longitudes are quantized to whole degrees first so
    /// noise in the low bits cannot reorder the ranking between slices.
    pub fn near_relays(
        &self,
        direct_latency: f32,
        client_latitude: f32,
        client_longitude: f32,
        server_latitude: f32,
        server_longitude: f32,
        max_near_relays: usize,
    ) -> (Vec<u64>, Vec<SocketAddr>) {
        const DISTANCE_THRESHOLD_KM: i64 = 2500;
        const LATENCY_THRESHOLD_MS: f32 = 30.0;

        let source_lat = client_latitude as i64 as f64;
        let source_long = client_longitude as i64 as f64;
        let dest_lat = server_latitude as i64 as f64;
        let dest_long = server_longitude as i64 as f64;

        // Unknown direct latency is approximated as twice the speed of
        // light along the great circle.
        let mut direct_latency = direct_latency;
        if direct_latency <= 0.0 {
            let direct_km = haversine_distance(source_lat, source_long, dest_lat, dest_long);
            direct_latency = (direct_km / 299_792.458 * 1000.0) as f32 * 2.0;
        }

        struct Candidate {
            id: u64,
            address: SocketAddr,
            distance: i64,
            latitude: f64,
            longitude: f64,
        }

        let mut candidates: Vec<Candidate> = (0..self.relay_ids.len())
            .map(|i| {
                let latitude = self.relay_latitudes[i] as i64 as f64;
                let longitude = self.relay_longitudes[i] as i64 as f64;
                Candidate {
                    id: self.relay_ids[i],
                    address: self.relay_addresses[i],
                    distance: haversine_distance(source_lat, source_long, latitude, longitude)
                        as i64,
                    latitude,
                    longitude,
                }
            })
            .collect();

        candidates.sort_by_key(|c| c.distance);

        let mut ids = Vec::with_capacity(max_near_relays);
        let mut addresses = Vec::with_capacity(max_near_relays);
        let mut chosen = HashSet::new();

        for candidate in &candidates {
            if ids.len() == max_near_relays {
                break;
            }
            if candidate.distance > DISTANCE_THRESHOLD_KM {
                break;
            }
            let detour = 1.5
                * speed_of_light_time_ms(
                    source_lat,
                    source_long,
                    candidate.latitude,
                    candidate.longitude,
                    dest_lat,
                    dest_long,
                ) as f32;
            if detour > direct_latency + LATENCY_THRESHOLD_MS {
                continue;
            }
            ids.push(candidate.id);
            addresses.push(candidate.address);
            chosen.insert(candidate.id);
        }

        if ids.len() == max_near_relays {
            return (ids, addresses);
        }

        // Short on relays near the client. Re-rank by distance from the
        // server; for long hauls the best entry point is often at the
        // destination end (South America through Miami, say).
        for candidate in candidates.iter_mut() {
            candidate.distance =
                haversine_distance(dest_lat, dest_long, candidate.latitude, candidate.longitude)
                    as i64;
        }
        candidates.sort_by_key(|c| c.distance);

        for candidate in &candidates {
            if ids.len() == max_near_relays {
                break;
            }
            if chosen.contains(&candidate.id) {
                continue;
            }
            let detour = 1.5
                * speed_of_light_time_ms(
                    source_lat,
                    source_long,
                    candidate.latitude,
                    candidate.longitude,
                    dest_lat,
                    dest_long,
                ) as f32;
            if detour > direct_latency + LATENCY_THRESHOLD_MS {
                continue;
            }
            ids.push(candidate.id);
            addresses.push(candidate.address);
        }

        (ids, addresses)
    }
}

// ── Shared handle ─────────────────────────────────────────────────────────────

/// Shared matrix snapshot, swapped whole by the refresh loop.
#[derive(Debug)]
pub struct MatrixHolder {
    current: RwLock<Arc<RouteMatrix>>,
}

impl MatrixHolder {
    pub fn new(matrix: RouteMatrix) -> Self {
        Self { current: RwLock::new(Arc::new(matrix)) }
    }

    /// Placeholder before the first load; `created_at` of zero reads as
    /// stale, so handlers drop until a real matrix arrives.
    pub fn empty() -> Self {
        Self::new(RouteMatrix::default())
    }

    /// Current snapshot. Cheap; clones one Arc.
    pub fn snapshot(&self) -> Arc<RouteMatrix> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the snapshot. Readers holding the old Arc are unaffected.
    pub fn swap(&self, matrix: RouteMatrix) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(matrix);
    }
}
