//! Buyer/seller/datacenter/relay directory.
//!
//! The directory is the commercial half of the routing picture: who is
//! allowed to accelerate traffic (buyers), who gets paid for carrying it
//! (sellers), and where the relays physically sit (datacenters). It is
//! loaded from a JSON file produced by an external admin pipeline,
//! re-read on an interval, and swapped atomically so the packet path
//! always sees a consistent snapshot.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use slipstream_core::crypto;
use slipstream_core::route::{InternalConfig, RouteShader};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("failed to read directory file {path}: {source}")]
    ReadFailed {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse directory JSON: {0}")]
    ParseFailed(#[from] serde_json::Error),
    #[error("invalid directory: {0}")]
    Invalid(String),
}

// ── Entities ──────────────────────────────────────────────────────────────────

/// A customer whose traffic we accelerate.
///
/// The wire identifies buyers by the 8-byte id prefix of their 40-byte
/// public key blob; the directory stores the id and the 32-byte ed25519
/// verify key separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Buyer {
    pub id: u64,
    pub name: String,
    pub code: String,
    pub live: bool,
    pub debug: bool,
    #[serde(with = "hex_key")]
    pub public_key: [u8; 32],
    #[serde(default)]
    pub route_shader: RouteShader,
    #[serde(default)]
    pub internal_config: InternalConfig,
}

/// An operator who runs relays and bills us for egress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seller {
    pub id: u64,
    pub name: String,
    pub code: String,
    /// Egress price in nibblins per gigabyte of envelope traffic.
    #[serde(default)]
    pub egress_price_nibblins_per_gb: u64,
}

/// A physical location where relays and game servers live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datacenter {
    pub id: u64,
    pub name: String,
    /// Alternate name accepted from server init packets, e.g. a cloud
    /// provider's own zone name. Empty means no alias.
    #[serde(default)]
    pub alias: String,
    /// The seller's native name for this location.
    #[serde(default)]
    pub native: String,
    pub latitude: f32,
    pub longitude: f32,
    pub seller_id: u64,
}

/// A relay node that can carry accelerated traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relay {
    pub id: u64,
    pub name: String,
    pub public_addr: SocketAddr,
    /// Cloud-internal address, reachable only from machines of the same
    /// seller. Used by the token builder's internal-IP rule.
    #[serde(default)]
    pub internal_addr: Option<SocketAddr>,
    #[serde(with = "hex_key")]
    pub public_key: [u8; 32],
    pub seller_id: u64,
    pub datacenter_id: u64,
    /// Per-relay egress price in nibblins per gigabyte. Zero means the
    /// seller's list price applies.
    #[serde(default)]
    pub egress_price_override: u64,
}

/// Per-buyer datacenter alias, e.g. buyer-specific server fleet names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatacenterAlias {
    pub buyer_id: u64,
    pub alias: String,
    pub datacenter_id: u64,
}

// ── Directory file & snapshot ─────────────────────────────────────────────────

/// JSON shape of the directory file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryFile {
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub buyers: Vec<Buyer>,
    #[serde(default)]
    pub sellers: Vec<Seller>,
    #[serde(default)]
    pub datacenters: Vec<Datacenter>,
    #[serde(default)]
    pub relays: Vec<Relay>,
    #[serde(default)]
    pub datacenter_aliases: Vec<DatacenterAlias>,
}

/// Immutable, indexed view of the directory.
///
/// Built once per load and shared behind an `Arc`; lookups never take a
/// lock on the packet path.
#[derive(Debug, Default)]
pub struct Directory {
    pub created_at: String,

    buyers: HashMap<u64, Buyer>,
    sellers: HashMap<u64, Seller>,
    datacenters: HashMap<u64, Datacenter>,
    relays: HashMap<u64, Relay>,

    datacenters_by_name: HashMap<String, u64>,
    datacenters_by_alias: HashMap<String, u64>,
    buyer_aliases: HashMap<u64, HashMap<String, u64>>,
    datacenter_relays: HashMap<u64, Vec<u64>>,
}

impl Directory {
    /// Index a parsed directory file, validating cross references.
    pub fn build(file: DirectoryFile) -> Result<Self, DirectoryError> {
        let mut dir = Directory {
            created_at: file.created_at,
            ..Directory::default()
        };

        for seller in file.sellers {
            if dir.sellers.insert(seller.id, seller).is_some() {
                return Err(DirectoryError::Invalid("duplicate seller id".into()));
            }
        }

        for buyer in file.buyers {
            if dir.buyers.insert(buyer.id, buyer).is_some() {
                return Err(DirectoryError::Invalid("duplicate buyer id".into()));
            }
        }

        for datacenter in file.datacenters {
            if !dir.sellers.contains_key(&datacenter.seller_id) {
                return Err(DirectoryError::Invalid(format!(
                    "datacenter {} references unknown seller {}",
                    datacenter.name, datacenter.seller_id
                )));
            }
            dir.datacenters_by_name
                .insert(datacenter.name.clone(), datacenter.id);
            if !datacenter.alias.is_empty() {
                dir.datacenters_by_alias
                    .insert(datacenter.alias.clone(), datacenter.id);
            }
            if dir.datacenters.insert(datacenter.id, datacenter).is_some() {
                return Err(DirectoryError::Invalid("duplicate datacenter id".into()));
            }
        }

        for relay in file.relays {
            if !dir.sellers.contains_key(&relay.seller_id) {
                return Err(DirectoryError::Invalid(format!(
                    "relay {} references unknown seller {}",
                    relay.name, relay.seller_id
                )));
            }
            if !dir.datacenters.contains_key(&relay.datacenter_id) {
                return Err(DirectoryError::Invalid(format!(
                    "relay {} references unknown datacenter {}",
                    relay.name, relay.datacenter_id
                )));
            }
            dir.datacenter_relays
                .entry(relay.datacenter_id)
                .or_default()
                .push(relay.id);
            if dir.relays.insert(relay.id, relay).is_some() {
                return Err(DirectoryError::Invalid("duplicate relay id".into()));
            }
        }

        for alias in file.datacenter_aliases {
            if !dir.datacenters.contains_key(&alias.datacenter_id) {
                return Err(DirectoryError::Invalid(format!(
                    "alias {} references unknown datacenter {}",
                    alias.alias, alias.datacenter_id
                )));
            }
            dir.buyer_aliases
                .entry(alias.buyer_id)
                .or_default()
                .insert(alias.alias, alias.datacenter_id);
        }

        Ok(dir)
    }

    /// Parse and index a directory from JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self, DirectoryError> {
        let file: DirectoryFile = serde_json::from_slice(data)?;
        Self::build(file)
    }

    /// Load a directory from a JSON file on disk.
    pub fn load(path: &Path) -> Result<Self, DirectoryError> {
        let data = std::fs::read(path).map_err(|source| DirectoryError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&data)
    }

    // ── Lookups ───────────────────────────────────────────────────────────────

    pub fn buyer_by_id(&self, buyer_id: u64) -> Option<&Buyer> {
        self.buyers.get(&buyer_id)
    }

    pub fn relay_by_id(&self, relay_id: u64) -> Option<&Relay> {
        self.relays.get(&relay_id)
    }

    pub fn datacenter_exists(&self, datacenter_id: u64) -> bool {
        self.datacenters.contains_key(&datacenter_id)
    }

    /// The seller operating a relay.
    pub fn seller_of(&self, relay: &Relay) -> Option<&Seller> {
        self.sellers.get(&relay.seller_id)
    }

    /// Relay ids homed in a datacenter, in file order.
    pub fn datacenter_relays(&self, datacenter_id: u64) -> &[u64] {
        self.datacenter_relays
            .get(&datacenter_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Resolve a datacenter name as sent by a game server.
    ///
    /// Tries the canonical name first, then global aliases, then the
    /// per-buyer alias table. Returns the datacenter id.
    pub fn resolve_datacenter(&self, buyer_id: u64, name: &str) -> Option<u64> {
        if let Some(id) = self.datacenters_by_name.get(name) {
            return Some(*id);
        }
        if let Some(id) = self.datacenters_by_alias.get(name) {
            return Some(*id);
        }
        self.buyer_aliases
            .get(&buyer_id)
            .and_then(|aliases| aliases.get(name))
            .copied()
    }

    /// Resolve a datacenter id as sent in a session update.
    ///
    /// Clients hash whatever name their server handed them, so the id may
    /// be either a real datacenter id or the hash of a buyer-scoped alias.
    pub fn datacenter_for_buyer(&self, buyer_id: u64, datacenter_id: u64) -> Option<&Datacenter> {
        if let Some(datacenter) = self.datacenters.get(&datacenter_id) {
            return Some(datacenter);
        }
        let aliases = self.buyer_aliases.get(&buyer_id)?;
        for (alias, target) in aliases {
            if crypto::hash_id(alias) == datacenter_id {
                return self.datacenters.get(target);
            }
        }
        None
    }

    pub fn num_buyers(&self) -> usize {
        self.buyers.len()
    }

    pub fn num_relays(&self) -> usize {
        self.relays.len()
    }
}

// ── Shared handle ─────────────────────────────────────────────────────────────

/// Shared directory snapshot, swapped whole by the refresh loop.
#[derive(Debug)]
pub struct DirectoryHolder {
    current: RwLock<Arc<Directory>>,
}

impl DirectoryHolder {
    pub fn new(directory: Directory) -> Self {
        Self {
            current: RwLock::new(Arc::new(directory)),
        }
    }

    /// Current snapshot. Cheap; clones one Arc.
    pub fn snapshot(&self) -> Arc<Directory> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the snapshot. Readers holding the old Arc are unaffected.
    pub fn swap(&self, directory: Directory) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(directory);
    }
}

// ── Serde helpers ─────────────────────────────────────────────────────────────

mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(de)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::custom("key must be 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_file() -> DirectoryFile {
        let file = r#"{
            "created_at": "2025-06-01T00:00:00Z",
            "sellers": [
                { "id": 1, "name": "Amazing Cloud", "code": "amazing", "egress_price_nibblins_per_gb": 100000000 },
                { "id": 2, "name": "Budget Metal", "code": "budget" }
            ],
            "buyers": [
                {
                    "id": 12345, "name": "Test Buyer", "code": "test",
                    "live": true, "debug": false,
                    "public_key": "0101010101010101010101010101010101010101010101010101010101010101"
                }
            ],
            "datacenters": [
                { "id": 100, "name": "amazing.ohio", "alias": "us-east-2", "latitude": 40.0, "longitude": -83.0, "seller_id": 1 },
                { "id": 200, "name": "budget.chicago", "latitude": 41.8, "longitude": -87.6, "seller_id": 2 }
            ],
            "relays": [
                {
                    "id": 1000, "name": "amazing.ohio.1", "public_addr": "10.0.0.1:40000",
                    "internal_addr": "192.168.1.1:40000",
                    "public_key": "0202020202020202020202020202020202020202020202020202020202020202",
                    "seller_id": 1, "datacenter_id": 100
                },
                {
                    "id": 2000, "name": "budget.chicago.1", "public_addr": "10.0.0.2:40000",
                    "public_key": "0303030303030303030303030303030303030303030303030303030303030303",
                    "seller_id": 2, "datacenter_id": 200
                }
            ],
            "datacenter_aliases": [
                { "buyer_id": 12345, "alias": "fleet-east", "datacenter_id": 100 }
            ]
        }"#;
        serde_json::from_str(file).unwrap()
    }

    #[test]
    fn build_and_lookup() {
        let dir = Directory::build(test_file()).unwrap();

        assert_eq!(dir.num_buyers(), 1);
        assert_eq!(dir.num_relays(), 2);

        let buyer = dir.buyer_by_id(12345).unwrap();
        assert!(buyer.live);
        assert_eq!(buyer.public_key, [1u8; 32]);

        let relay = dir.relay_by_id(1000).unwrap();
        assert_eq!(relay.name, "amazing.ohio.1");
        assert!(relay.internal_addr.is_some());

        let seller = dir.seller_of(relay).unwrap();
        assert_eq!(seller.code, "amazing");
        assert_eq!(seller.egress_price_nibblins_per_gb, 100_000_000);

        assert!(dir.datacenter_exists(100));
        assert!(!dir.datacenter_exists(999));

        assert_eq!(dir.datacenter_relays(100), &[1000]);
        assert_eq!(dir.datacenter_relays(999), &[] as &[u64]);
    }

    #[test]
    fn datacenter_resolution_order() {
        let dir = Directory::build(test_file()).unwrap();

        // Canonical name.
        assert_eq!(dir.resolve_datacenter(12345, "amazing.ohio"), Some(100));
        // Global alias.
        assert_eq!(dir.resolve_datacenter(12345, "us-east-2"), Some(100));
        // Buyer-scoped alias, invisible to other buyers.
        assert_eq!(dir.resolve_datacenter(12345, "fleet-east"), Some(100));
        assert_eq!(dir.resolve_datacenter(777, "fleet-east"), None);
        // Unknown.
        assert_eq!(dir.resolve_datacenter(12345, "nowhere"), None);
    }

    #[test]
    fn datacenter_id_resolution() {
        let dir = Directory::build(test_file()).unwrap();

        // Real datacenter id.
        assert_eq!(dir.datacenter_for_buyer(12345, 100).unwrap().name, "amazing.ohio");
        // Hash of a buyer-scoped alias, invisible to other buyers.
        let alias_id = crypto::hash_id("fleet-east");
        assert_eq!(dir.datacenter_for_buyer(12345, alias_id).unwrap().id, 100);
        assert!(dir.datacenter_for_buyer(777, alias_id).is_none());
        // Unknown.
        assert!(dir.datacenter_for_buyer(12345, 0xDEAD).is_none());
    }

    #[test]
    fn rejects_dangling_references() {
        let mut file = test_file();
        file.relays[0].seller_id = 42;
        assert!(Directory::build(file).is_err());

        let mut file = test_file();
        file.relays[0].datacenter_id = 42;
        assert!(Directory::build(file).is_err());

        let mut file = test_file();
        file.datacenter_aliases[0].datacenter_id = 42;
        assert!(Directory::build(file).is_err());
    }

    #[test]
    fn holder_swaps_snapshots() {
        let holder = DirectoryHolder::new(Directory::build(test_file()).unwrap());
        let before = holder.snapshot();
        assert_eq!(before.num_relays(), 2);

        let mut file = test_file();
        file.relays.pop();
        holder.swap(Directory::build(file).unwrap());

        // Old snapshot is still intact; new one reflects the swap.
        assert_eq!(before.num_relays(), 2);
        assert_eq!(holder.snapshot().num_relays(), 1);
    }

    #[test]
    fn buyer_key_round_trips_through_json() {
        let dir = Directory::build(test_file()).unwrap();
        let buyer = dir.buyer_by_id(12345).unwrap();
        let json = serde_json::to_string(buyer).unwrap();
        let back: Buyer = serde_json::from_str(&json).unwrap();
        assert_eq!(back.public_key, buyer.public_key);
        assert_eq!(back.route_shader, buyer.route_shader);
    }
}
