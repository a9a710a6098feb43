//! Configuration system for Slipstream.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SLIPSTREAM_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/slipstream/config.toml
//!   3. ~/.config/slipstream/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::crypto::{self, BoxKeypair, CryptoError, SigningKeypair, KEY_BYTES};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlipstreamConfig {
    pub network: NetworkConfig,
    pub routing: RoutingConfig,
    pub keys: KeysConfig,
    pub postsession: PostSessionConfig,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Bind address for the UDP service.
    pub bind_address: String,
    /// UDP port for SDK traffic.
    pub port: u16,
    /// Number of reader sockets sharing the port.
    pub num_sockets: usize,
    /// Kernel receive buffer per socket, in bytes.
    pub recv_buffer_bytes: usize,
    /// Address game servers reach this service at. Fed into the v5
    /// packet filters, so it must match what senders see.
    pub public_address: String,
    /// HTTP port for health and status.
    pub status_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Relay/buyer/datacenter directory, JSON.
    pub database_path: PathBuf,
    /// Cost matrix snapshot produced by the optimizer.
    pub matrix_path: PathBuf,
    pub matrix_refresh_seconds: u64,
    pub database_refresh_seconds: u64,
    /// A matrix older than this is no longer used for new routes.
    pub matrix_stale_seconds: u64,
    /// Allow route tokens to carry relay internal addresses.
    pub enable_internal_ips: bool,
    /// Seller names whose relays may be reached on internal addresses.
    pub internal_ip_sellers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Hex ed25519 private key for signing responses. Empty = generate
    /// at startup.
    pub backend_private_key: String,
    /// Hex x25519 private key for sealing route tokens. Empty = generate
    /// at startup.
    pub router_private_key: String,
    /// Hex 32-byte key for near relay ping tokens. Empty = generate at
    /// startup.
    pub ping_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostSessionConfig {
    /// Worker tasks draining the post-session queue.
    pub worker_count: usize,
    /// Queue capacity; sessions past it are dropped and counted.
    pub queue_capacity: usize,
    /// Portal publish attempts before a session is given up on.
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub session_seconds: u64,
    pub server_seconds: u64,
    pub relay_seconds: u64,
    pub veto_hours: u64,
    pub tracker_minutes: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 40000,
            num_sockets: 16,
            recv_buffer_bytes: 1_000_000,
            public_address: "127.0.0.1:40000".to_string(),
            status_port: 40100,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("database.json"),
            matrix_path: PathBuf::from("routes.bin"),
            matrix_refresh_seconds: 1,
            database_refresh_seconds: 10,
            matrix_stale_seconds: 30,
            enable_internal_ips: false,
            internal_ip_sellers: Vec::new(),
        }
    }
}

impl Default for PostSessionConfig {
    fn default() -> Self {
        Self {
            worker_count: 1000,
            queue_capacity: 1_000_000,
            max_retries: 10,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            session_seconds: 60,
            server_seconds: 90,
            relay_seconds: 60,
            veto_hours: 24,
            tracker_minutes: 10,
        }
    }
}

// ── Keys ──────────────────────────────────────────────────────────────────────

/// Key material resolved from [`KeysConfig`].
#[derive(Debug)]
pub struct BackendKeys {
    pub signing: SigningKeypair,
    pub router: BoxKeypair,
    pub ping_key: [u8; KEY_BYTES],
}

impl KeysConfig {
    /// Parse configured keys, generating fresh ones for any left empty.
    pub fn resolve(&self) -> Result<BackendKeys, CryptoError> {
        let signing = if self.backend_private_key.is_empty() {
            SigningKeypair::generate()
        } else {
            SigningKeypair::from_private_bytes(&crypto::key_from_hex(&self.backend_private_key)?)
        };
        let router = if self.router_private_key.is_empty() {
            BoxKeypair::generate()
        } else {
            BoxKeypair::from_private_bytes(&crypto::key_from_hex(&self.router_private_key)?)
        };
        let ping_key = if self.ping_key.is_empty() {
            crypto::random_key()
        } else {
            crypto::key_from_hex(&self.ping_key)?
        };
        Ok(BackendKeys { signing, router, ping_key })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("bad key in [keys]: {0}")]
    BadKey(#[from] CryptoError),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SlipstreamConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            SlipstreamConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SLIPSTREAM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SlipstreamConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SLIPSTREAM_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SLIPSTREAM_NETWORK__BIND_ADDRESS") {
            self.network.bind_address = v;
        }
        if let Ok(v) = std::env::var("SLIPSTREAM_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("SLIPSTREAM_NETWORK__NUM_SOCKETS") {
            if let Ok(n) = v.parse() {
                self.network.num_sockets = n;
            }
        }
        if let Ok(v) = std::env::var("SLIPSTREAM_NETWORK__PUBLIC_ADDRESS") {
            self.network.public_address = v;
        }
        if let Ok(v) = std::env::var("SLIPSTREAM_NETWORK__STATUS_PORT") {
            if let Ok(p) = v.parse() {
                self.network.status_port = p;
            }
        }
        if let Ok(v) = std::env::var("SLIPSTREAM_ROUTING__DATABASE_PATH") {
            self.routing.database_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SLIPSTREAM_ROUTING__MATRIX_PATH") {
            self.routing.matrix_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SLIPSTREAM_ROUTING__ENABLE_INTERNAL_IPS") {
            if let Ok(b) = v.parse() {
                self.routing.enable_internal_ips = b;
            }
        }
        if let Ok(v) = std::env::var("SLIPSTREAM_KEYS__BACKEND_PRIVATE_KEY") {
            self.keys.backend_private_key = v;
        }
        if let Ok(v) = std::env::var("SLIPSTREAM_KEYS__ROUTER_PRIVATE_KEY") {
            self.keys.router_private_key = v;
        }
        if let Ok(v) = std::env::var("SLIPSTREAM_KEYS__PING_KEY") {
            self.keys.ping_key = v;
        }
        if let Ok(v) = std::env::var("SLIPSTREAM_POSTSESSION__WORKER_COUNT") {
            if let Ok(n) = v.parse() {
                self.postsession.worker_count = n;
            }
        }
    }
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("slipstream")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = SlipstreamConfig::default();
        assert_eq!(config.network.port, 40000);
        assert_eq!(config.network.num_sockets, 16);
        assert_eq!(config.timeouts.session_seconds, 60);
        assert_eq!(config.timeouts.server_seconds, 90);
        assert_eq!(config.postsession.queue_capacity, 1_000_000);
    }

    #[test]
    fn empty_keys_generate() {
        let keys = KeysConfig::default().resolve().unwrap();
        assert_ne!(keys.signing.public_bytes(), [0u8; KEY_BYTES]);
        assert_ne!(keys.router.public, [0u8; KEY_BYTES]);
        assert_ne!(keys.ping_key, [0u8; KEY_BYTES]);
    }

    #[test]
    fn configured_keys_round_trip() {
        let seed = crypto::random_key();
        let config = KeysConfig {
            backend_private_key: hex::encode(seed),
            router_private_key: hex::encode(seed),
            ping_key: hex::encode(seed),
        };
        let keys = config.resolve().unwrap();
        assert_eq!(keys.ping_key, seed);
        assert_eq!(
            keys.signing.public_bytes(),
            SigningKeypair::from_private_bytes(&seed).public_bytes()
        );

        let bad = KeysConfig { ping_key: "abc".to_string(), ..KeysConfig::default() };
        assert!(bad.resolve().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let text = "[network]\nport = 41000\n\n[timeouts]\nsession_seconds = 5\n";
        let config: SlipstreamConfig = toml::from_str(text).unwrap();
        assert_eq!(config.network.port, 41000);
        assert_eq!(config.network.num_sockets, 16);
        assert_eq!(config.timeouts.session_seconds, 5);
        assert_eq!(config.timeouts.server_seconds, 90);
    }
}
