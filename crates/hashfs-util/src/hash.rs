//! SHA-1 hashing helpers shared by every store. A "hash" in this engine is
//! always `SHA1(cluster_uuid_string || payload)` (§3), never a bare digest of
//! the payload alone — the cluster id salts every content address so two
//! clusters storing the same bytes never collide on disk.

use sha1::{Digest, Sha1};

pub const HASH_BYTES: usize = 20;

pub type Hash = [u8; HASH_BYTES];

/// Hash a sequence of byte slices as if they were concatenated, without an
/// intermediate allocation.
pub fn hash_parts(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha1::new();
    for p in parts {
        hasher.update(p);
    }
    let digest = hasher.finalize();
    let mut out = [0u8; HASH_BYTES];
    out.copy_from_slice(&digest);
    out
}

/// Content hash of a block payload, salted with the cluster id string per §3/§6.
pub fn hash_buf(cluster_uuid_str: &str, payload: &[u8]) -> Hash {
    hash_parts(&[cluster_uuid_str.as_bytes(), payload])
}

pub fn to_hex(h: &[u8]) -> String {
    hex::encode(h)
}

pub fn from_hex(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(s)
}
