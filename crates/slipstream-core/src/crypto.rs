//! Cryptographic primitives for the backend.
//!
//! Three key families are in play:
//!   backend keypair — ed25519, signs responses and session blobs
//!   buyer keypair   — ed25519 with an 8-byte buyer-id prefix, signs requests
//!   router keypair  — x25519, seals route tokens to relay public keys
//!
//! Sealed boxes are X25519 ECDH -> blake3 KDF -> XChaCha20-Poly1305 with a
//! 24-byte nonce and 16-byte tag, so sealed sizes are plaintext + 40.
//!
//! All private key material is ZeroizeOnDrop. No unsafe code.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

pub const KEY_BYTES: usize = 32;
pub const SIGNATURE_BYTES: usize = 64;
pub const NONCE_BYTES: usize = 24;
pub const MAC_BYTES: usize = 16;
pub const PING_TOKEN_BYTES: usize = 32;
pub const PACKET_HASH_BYTES: usize = 8;

/// Well-known anti-junk hash key. Not a secret: the hash exists to shed
/// random internet noise before parsing, not to authenticate.
pub const PACKET_HASH_KEY: [u8; 32] = [
    0x17, 0x2a, 0xe3, 0x51, 0x64, 0x09, 0xdd, 0x4c, 0x8f, 0x2b, 0x77, 0x0a, 0xc5, 0x9e, 0x13, 0x60,
    0x3d, 0xb1, 0x58, 0xe6, 0x2f, 0x94, 0x4b, 0xd0, 0x6c, 0x81, 0x36, 0xfa, 0x25, 0x7d, 0xc8, 0x02,
];

const TOKEN_SEAL_CONTEXT: &str = "slipstream 2025-01 route token seal";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("seal failed")]
    SealFailed,
    #[error("open failed: bad key, nonce, or tampered ciphertext")]
    OpenFailed,
    #[error("bad key length: {0} bytes")]
    BadKeyLength(usize),
    #[error("key is not valid hex")]
    BadKeyEncoding,
}

// ── Hashing ───────────────────────────────────────────────────────────────────

/// fnv1a-64 over the concatenation of `parts`.
pub fn fnv1a(parts: &[&[u8]]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for part in parts {
        for &byte in *part {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}

/// Stable 64-bit id for relay and datacenter names.
pub fn hash_id(name: &str) -> u64 {
    fnv1a(&[name.as_bytes()])
}

/// Keyed anti-junk packet hash.
pub fn packet_hash(key: &[u8], parts: &[&[u8]]) -> u64 {
    let mut all: Vec<&[u8]> = Vec::with_capacity(parts.len() + 1);
    all.push(key);
    all.extend_from_slice(parts);
    fnv1a(&all)
}

/// Ping token handed to clients so relays can verify ping traffic without
/// a backend round trip: blake3 keyed hash over expiry and both endpoints.
pub fn ping_token(
    key: &[u8; KEY_BYTES],
    expire_timestamp: u64,
    client_addr: &[u8],
    relay_addr: &[u8],
) -> [u8; PING_TOKEN_BYTES] {
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(&expire_timestamp.to_le_bytes());
    hasher.update(client_addr);
    hasher.update(relay_addr);
    *hasher.finalize().as_bytes()
}

// ── Signing (ed25519) ─────────────────────────────────────────────────────────

/// Backend / buyer signing keypair.
pub struct SigningKeypair {
    signing: SigningKey,
}

impl SigningKeypair {
    pub fn generate() -> Self {
        Self { signing: SigningKey::generate(&mut OsRng) }
    }

    pub fn from_private_bytes(bytes: &[u8; KEY_BYTES]) -> Self {
        Self { signing: SigningKey::from_bytes(bytes) }
    }

    pub fn public_bytes(&self) -> [u8; KEY_BYTES] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn private_bytes(&self) -> Zeroizing<[u8; KEY_BYTES]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_BYTES] {
        self.signing.sign(message).to_bytes()
    }

    /// Sign a message assembled from multiple slices without the caller
    /// having to concatenate them first.
    pub fn sign_parts(&self, parts: &[&[u8]]) -> [u8; SIGNATURE_BYTES] {
        let mut message = Vec::new();
        for part in parts {
            message.extend_from_slice(part);
        }
        self.signing.sign(&message).to_bytes()
    }
}

impl std::fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKeypair({})", hex::encode(self.public_bytes()))
    }
}

pub fn verify_signature(public: &[u8; KEY_BYTES], message: &[u8], signature: &[u8]) -> bool {
    let Ok(verifying) = VerifyingKey::from_bytes(public) else {
        return false;
    };
    let Ok(sig_bytes) = <&[u8; SIGNATURE_BYTES]>::try_from(signature) else {
        return false;
    };
    verifying.verify(message, &Signature::from_bytes(sig_bytes)).is_ok()
}

pub fn verify_signature_parts(public: &[u8; KEY_BYTES], parts: &[&[u8]], signature: &[u8]) -> bool {
    let mut message = Vec::new();
    for part in parts {
        message.extend_from_slice(part);
    }
    verify_signature(public, &message, signature)
}

// ── Sealed boxes (x25519 + XChaCha20-Poly1305) ────────────────────────────────

/// Router keypair used to seal route tokens against relay public keys.
pub struct BoxKeypair {
    private: Zeroizing<[u8; KEY_BYTES]>,
    pub public: [u8; KEY_BYTES],
}

impl BoxKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        Self { private: Zeroizing::new(secret.to_bytes()), public }
    }

    pub fn from_private_bytes(bytes: &[u8; KEY_BYTES]) -> Self {
        let secret = StaticSecret::from(*bytes);
        let public = PublicKey::from(&secret).to_bytes();
        Self { private: Zeroizing::new(*bytes), public }
    }

    pub fn private_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.private
    }
}

impl std::fmt::Debug for BoxKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BoxKeypair({})", hex::encode(self.public))
    }
}

fn seal_key(our_private: &[u8; KEY_BYTES], their_public: &[u8; KEY_BYTES]) -> Key {
    let secret = StaticSecret::from(*our_private);
    let shared = secret.diffie_hellman(&PublicKey::from(*their_public));
    let derived = blake3::derive_key(TOKEN_SEAL_CONTEXT, shared.as_bytes());
    *Key::from_slice(&derived)
}

/// Seal `plaintext` between our private key and their public key.
/// Output is ciphertext || 16-byte tag.
pub fn seal(
    plaintext: &[u8],
    nonce: &[u8; NONCE_BYTES],
    their_public: &[u8; KEY_BYTES],
    our_private: &[u8; KEY_BYTES],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(&seal_key(our_private, their_public));
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::SealFailed)
}

pub fn open(
    sealed: &[u8],
    nonce: &[u8; NONCE_BYTES],
    their_public: &[u8; KEY_BYTES],
    our_private: &[u8; KEY_BYTES],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(&seal_key(our_private, their_public));
    cipher
        .decrypt(XNonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::OpenFailed)
}

pub fn generate_nonce() -> [u8; NONCE_BYTES] {
    let mut nonce = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn random_key() -> [u8; KEY_BYTES] {
    let mut key = [0u8; KEY_BYTES];
    OsRng.fill_bytes(&mut key);
    key
}

/// Decode a hex-encoded 32-byte key.
pub fn key_from_hex(text: &str) -> Result<[u8; KEY_BYTES], CryptoError> {
    let bytes = hex::decode(text.trim()).map_err(|_| CryptoError::BadKeyEncoding)?;
    bytes.as_slice().try_into().map_err(|_| CryptoError::BadKeyLength(bytes.len()))
}
