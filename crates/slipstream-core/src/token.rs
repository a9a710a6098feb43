//! Route and continue tokens.
//!
//! A route token tells one hop where to forward next and carries the
//! per-session key material; a continue token just extends the life of a
//! route the hop already knows. Tokens are sealed individually to each
//! hop's public key, so a relay can open its own token and nothing else.
//!
//! Record layouts are fixed and part of the wire format:
//!   route token     76 bytes, sealed 116 (24 nonce + 76 + 16 tag)
//!   continue token  17 bytes, sealed  57

use static_assertions::assert_eq_size;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::crypto::{self, CryptoError, KEY_BYTES, MAC_BYTES, NONCE_BYTES};
use crate::wire::{pack_address, ADDRESS_BYTES, MAX_TOKENS};

use std::net::SocketAddr;

pub const ROUTE_TOKEN_BYTES: usize = 76;
pub const ENCRYPTED_ROUTE_TOKEN_BYTES: usize = NONCE_BYTES + ROUTE_TOKEN_BYTES + MAC_BYTES;
pub const CONTINUE_TOKEN_BYTES: usize = 17;
pub const ENCRYPTED_CONTINUE_TOKEN_BYTES: usize = NONCE_BYTES + CONTINUE_TOKEN_BYTES + MAC_BYTES;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("{0} hops exceeds the {MAX_TOKENS} token limit")]
    TooManyTokens(usize),
    #[error("{addresses} addresses but {keys} public keys")]
    MismatchedInputs { addresses: usize, keys: usize },
    #[error("sealed token has wrong length {0}")]
    BadLength(usize),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Per-hop forwarding record. One route token per hop, client first.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct RouteTokenRecord {
    pub expire_timestamp: u64,
    pub session_id: u64,
    pub session_version: u8,
    pub kbps_up: u32,
    pub kbps_down: u32,
    /// Packed address of the next hop; all zero on the final hop.
    pub next_address: [u8; ADDRESS_BYTES],
    /// Session private key, identical in every token of the route.
    pub private_key: [u8; KEY_BYTES],
}

assert_eq_size!(RouteTokenRecord, [u8; ROUTE_TOKEN_BYTES]);

/// Keep-alive record for an unchanged route.
#[derive(Debug, Clone, PartialEq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ContinueTokenRecord {
    pub expire_timestamp: u64,
    pub session_id: u64,
    pub session_version: u8,
}

assert_eq_size!(ContinueTokenRecord, [u8; CONTINUE_TOKEN_BYTES]);

fn seal_record(
    record_bytes: &[u8],
    their_public: &[u8; KEY_BYTES],
    our_private: &[u8; KEY_BYTES],
) -> Result<Vec<u8>, TokenError> {
    let nonce = crypto::generate_nonce();
    let sealed = crypto::seal(record_bytes, &nonce, their_public, our_private)?;
    let mut out = Vec::with_capacity(NONCE_BYTES + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn open_record(
    sealed: &[u8],
    expected_len: usize,
    their_public: &[u8; KEY_BYTES],
    our_private: &[u8; KEY_BYTES],
) -> Result<Vec<u8>, TokenError> {
    if sealed.len() != expected_len {
        return Err(TokenError::BadLength(sealed.len()));
    }
    let nonce: [u8; NONCE_BYTES] = sealed[..NONCE_BYTES].try_into().unwrap_or_default();
    Ok(crypto::open(&sealed[NONCE_BYTES..], &nonce, their_public, our_private)?)
}

/// Open a single sealed route token (relay side, and tests).
pub fn read_route_token(
    sealed: &[u8],
    their_public: &[u8; KEY_BYTES],
    our_private: &[u8; KEY_BYTES],
) -> Result<RouteTokenRecord, TokenError> {
    let plain = open_record(sealed, ENCRYPTED_ROUTE_TOKEN_BYTES, their_public, our_private)?;
    RouteTokenRecord::read_from(plain.as_slice())
        .ok_or(TokenError::BadLength(plain.len()))
}

pub fn read_continue_token(
    sealed: &[u8],
    their_public: &[u8; KEY_BYTES],
    our_private: &[u8; KEY_BYTES],
) -> Result<ContinueTokenRecord, TokenError> {
    let plain = open_record(sealed, ENCRYPTED_CONTINUE_TOKEN_BYTES, their_public, our_private)?;
    ContinueTokenRecord::read_from(plain.as_slice())
        .ok_or(TokenError::BadLength(plain.len()))
}

/// Write the full token chain for a route.
///
/// `addresses[i]` and `public_keys[i]` describe hop i, client first and
/// game server last. Every token carries the same freshly generated session
/// private key, and token i forwards to `addresses[i + 1]`. Output is the
/// concatenation of the sealed tokens, hop order preserved.
pub fn write_route_tokens(
    expire_timestamp: u64,
    session_id: u64,
    session_version: u8,
    kbps_up: u32,
    kbps_down: u32,
    addresses: &[Option<SocketAddr>],
    public_keys: &[[u8; KEY_BYTES]],
    router_private: &[u8; KEY_BYTES],
) -> Result<Vec<u8>, TokenError> {
    if addresses.len() != public_keys.len() {
        return Err(TokenError::MismatchedInputs {
            addresses: addresses.len(),
            keys: public_keys.len(),
        });
    }
    if addresses.len() > MAX_TOKENS {
        return Err(TokenError::TooManyTokens(addresses.len()));
    }

    let session_private = crypto::random_key();
    let mut out = Vec::with_capacity(addresses.len() * ENCRYPTED_ROUTE_TOKEN_BYTES);
    for (i, public_key) in public_keys.iter().enumerate() {
        let next_address = match addresses.get(i + 1) {
            Some(next) => pack_address(*next),
            None => [0u8; ADDRESS_BYTES],
        };
        let record = RouteTokenRecord {
            expire_timestamp,
            session_id,
            session_version,
            kbps_up,
            kbps_down,
            next_address,
            private_key: session_private,
        };
        out.extend_from_slice(&seal_record(record.as_bytes(), public_key, router_private)?);
    }
    Ok(out)
}

/// Write continue tokens for every hop of an existing route.
pub fn write_continue_tokens(
    expire_timestamp: u64,
    session_id: u64,
    session_version: u8,
    public_keys: &[[u8; KEY_BYTES]],
    router_private: &[u8; KEY_BYTES],
) -> Result<Vec<u8>, TokenError> {
    if public_keys.len() > MAX_TOKENS {
        return Err(TokenError::TooManyTokens(public_keys.len()));
    }
    let mut out = Vec::with_capacity(public_keys.len() * ENCRYPTED_CONTINUE_TOKEN_BYTES);
    for public_key in public_keys {
        let record = ContinueTokenRecord { expire_timestamp, session_id, session_version };
        out.extend_from_slice(&seal_record(record.as_bytes(), public_key, router_private)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::BoxKeypair;
    use crate::wire::unpack_address;

    #[test]
    fn route_token_chain_round_trip() {
        let router = BoxKeypair::generate();
        let hops: Vec<BoxKeypair> = (0..4).map(|_| BoxKeypair::generate()).collect();
        let addresses: Vec<Option<SocketAddr>> = vec![
            Some("10.0.0.1:30000".parse().unwrap()),
            Some("10.0.0.2:40000".parse().unwrap()),
            Some("10.0.0.3:40000".parse().unwrap()),
            Some("10.0.0.4:50000".parse().unwrap()),
        ];
        let keys: Vec<[u8; 32]> = hops.iter().map(|k| k.public).collect();

        let tokens = write_route_tokens(
            1_700_000_020,
            77,
            2,
            1024,
            512,
            &addresses,
            &keys,
            router.private_bytes(),
        )
        .unwrap();
        assert_eq!(tokens.len(), 4 * ENCRYPTED_ROUTE_TOKEN_BYTES);

        let mut session_keys = Vec::new();
        for (i, hop) in hops.iter().enumerate() {
            let sealed = &tokens
                [i * ENCRYPTED_ROUTE_TOKEN_BYTES..(i + 1) * ENCRYPTED_ROUTE_TOKEN_BYTES];
            let record = read_route_token(sealed, &router.public, hop.private_bytes()).unwrap();
            assert_eq!({ record.expire_timestamp }, 1_700_000_020);
            assert_eq!({ record.session_id }, 77);
            assert_eq!(record.session_version, 2);
            assert_eq!({ record.kbps_up }, 1024);
            assert_eq!({ record.kbps_down }, 512);

            let next = unpack_address(&record.next_address).unwrap();
            if i + 1 < hops.len() {
                assert_eq!(next, addresses[i + 1]);
            } else {
                assert_eq!(next, None);
            }
            session_keys.push(record.private_key);
        }
        // One session key, shared by all hops.
        assert!(session_keys.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[test]
    fn hops_cannot_open_each_others_tokens() {
        let router = BoxKeypair::generate();
        let hop_a = BoxKeypair::generate();
        let hop_b = BoxKeypair::generate();
        let addresses = vec![Some("10.0.0.1:30000".parse().unwrap()), None];
        let keys = vec![hop_a.public, hop_b.public];

        let tokens =
            write_route_tokens(1, 2, 3, 4, 5, &addresses, &keys, router.private_bytes()).unwrap();
        let first = &tokens[..ENCRYPTED_ROUTE_TOKEN_BYTES];
        assert!(read_route_token(first, &router.public, hop_a.private_bytes()).is_ok());
        assert!(read_route_token(first, &router.public, hop_b.private_bytes()).is_err());
    }

    #[test]
    fn continue_tokens_round_trip() {
        let router = BoxKeypair::generate();
        let hop = BoxKeypair::generate();
        let tokens =
            write_continue_tokens(9999, 1234, 7, &[hop.public], router.private_bytes()).unwrap();
        assert_eq!(tokens.len(), ENCRYPTED_CONTINUE_TOKEN_BYTES);

        let record = read_continue_token(&tokens, &router.public, hop.private_bytes()).unwrap();
        assert_eq!({ record.expire_timestamp }, 9999);
        assert_eq!({ record.session_id }, 1234);
        assert_eq!(record.session_version, 7);
    }

    #[test]
    fn token_limits_enforced() {
        let router = BoxKeypair::generate();
        let addresses = vec![None; MAX_TOKENS + 1];
        let keys = vec![[0u8; 32]; MAX_TOKENS + 1];
        assert_eq!(
            write_route_tokens(0, 0, 0, 0, 0, &addresses, &keys, router.private_bytes()),
            Err(TokenError::TooManyTokens(MAX_TOKENS + 1))
        );
        assert_eq!(
            write_route_tokens(0, 0, 0, 0, 0, &addresses[..2], &keys, router.private_bytes()),
            Err(TokenError::MismatchedInputs { addresses: 2, keys: MAX_TOKENS + 1 })
        );
        assert_eq!(
            write_continue_tokens(0, 0, 0, &keys, router.private_bytes()),
            Err(TokenError::TooManyTokens(MAX_TOKENS + 1))
        );
    }

    #[test]
    fn truncated_sealed_token_rejects() {
        let router = BoxKeypair::generate();
        let hop = BoxKeypair::generate();
        let tokens =
            write_continue_tokens(1, 2, 3, &[hop.public], router.private_bytes()).unwrap();
        assert_eq!(
            read_continue_token(&tokens[..40], &router.public, hop.private_bytes()),
            Err(TokenError::BadLength(40))
        );
    }
}
