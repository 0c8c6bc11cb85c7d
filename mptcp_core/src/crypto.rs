//! Key, token and join-proof derivation.
//!
//! Every connection owns a random 64-bit key. The key is never used as an
//! identifier directly: SHA-1 over the key yields the 32-bit token that
//! joining subflows present, and the 64-bit initial data sequence number.
//! Joins are authenticated with HMAC-SHA1 keyed by both peers' keys.

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha1::{Digest, Sha1};

type HmacSha1 = Hmac<Sha1>;

/// Length of the full join proof carried in the third MP_JOIN ACK
pub const JOIN_PROOF_LEN: usize = 20;

/// Length of the truncated proof carried in the MP_JOIN SYN-ACK
pub const TRUNCATED_PROOF_LEN: usize = 8;

/// Full HMAC-SHA1 output
pub type JoinProof = [u8; JOIN_PROOF_LEN];

/// Key plus the values derived from it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyMaterial {
    pub key: u64,
    pub token: u32,
    pub idsn: u64,
}

impl KeyMaterial {
    /// Derive token and IDSN for an existing key
    pub fn from_key(key: u64) -> Self {
        let (token, idsn) = derive(key);
        Self { key, token, idsn }
    }

    /// Draw a fresh key from `source`
    pub fn generate(source: &dyn KeySource) -> Self {
        Self::from_key(source.next_key())
    }
}

/// Source of connection keys.
///
/// The token table draws keys through this trait so collision handling can
/// be exercised with scripted keys.
pub trait KeySource: Send + Sync {
    fn next_key(&self) -> u64;
}

/// Keys from the operating system CSPRNG
#[derive(Debug, Default, Clone, Copy)]
pub struct OsKeySource;

impl KeySource for OsKeySource {
    fn next_key(&self) -> u64 {
        generate_key()
    }
}

/// Generate a cryptographically random 64-bit key
pub fn generate_key() -> u64 {
    OsRng.next_u64()
}

/// Generate a random nonce for MP_JOIN
pub fn generate_nonce() -> u32 {
    OsRng.next_u32()
}

/// Derive `(token, idsn)` from a key.
///
/// Token is the most significant 32 bits of SHA-1(key), the IDSN the least
/// significant 64 bits. The key is hashed in network byte order.
pub fn derive(key: u64) -> (u32, u64) {
    let digest = Sha1::digest(key.to_be_bytes());

    let mut token = [0u8; 4];
    token.copy_from_slice(&digest[..4]);
    let mut idsn = [0u8; 8];
    idsn.copy_from_slice(&digest[12..20]);

    (u32::from_be_bytes(token), u64::from_be_bytes(idsn))
}

fn join_mac(key_a: u64, key_b: u64, nonce_a: u32, nonce_b: u32) -> HmacSha1 {
    // zero padding to the SHA-1 block size leaves the HMAC unchanged
    let mut key = [0u8; 64];
    key[..8].copy_from_slice(&key_a.to_be_bytes());
    key[8..16].copy_from_slice(&key_b.to_be_bytes());

    let mut mac = <HmacSha1 as KeyInit>::new(&key.into());
    mac.update(&nonce_a.to_be_bytes());
    mac.update(&nonce_b.to_be_bytes());
    mac
}

/// HMAC-SHA1 over `nonce_a || nonce_b`, keyed by `key_a || key_b`
pub fn join_proof(key_a: u64, key_b: u64, nonce_a: u32, nonce_b: u32) -> JoinProof {
    let tag = join_mac(key_a, key_b, nonce_a, nonce_b).finalize().into_bytes();
    let mut out = [0u8; JOIN_PROOF_LEN];
    out.copy_from_slice(&tag);
    out
}

/// Most significant 64 bits of [`join_proof`], as carried in the SYN-ACK
pub fn truncated_join_proof(key_a: u64, key_b: u64, nonce_a: u32, nonce_b: u32) -> u64 {
    let proof = join_proof(key_a, key_b, nonce_a, nonce_b);
    let mut head = [0u8; TRUNCATED_PROOF_LEN];
    head.copy_from_slice(&proof[..TRUNCATED_PROOF_LEN]);
    u64::from_be_bytes(head)
}

/// Constant-time check of a full proof
pub fn verify_join_proof(
    proof: &[u8],
    key_a: u64,
    key_b: u64,
    nonce_a: u32,
    nonce_b: u32,
) -> bool {
    join_mac(key_a, key_b, nonce_a, nonce_b).verify_slice(proof).is_ok()
}

/// Constant-time check of a truncated SYN-ACK proof
pub fn verify_truncated_join_proof(
    truncated: u64,
    key_a: u64,
    key_b: u64,
    nonce_a: u32,
    nonce_b: u32,
) -> bool {
    join_mac(key_a, key_b, nonce_a, nonce_b)
        .verify_truncated_left(&truncated.to_be_bytes())
        .is_ok()
}
