//! Opaque signed upload tokens (§4.4):
//! `<uuid-36>:<rand-32hex>:<replica-8hex>:<expiry-16hex>:<hmac-40hex>`.
//!
//! The HMAC covers the token body up to and including the last `':'`
//! before the signature, so a client can never forge a longer expiry or a
//! different replica count without knowing the cluster's root auth key.

use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};

use hashfs_util::{einval, Result};

type HmacSha1 = Hmac<Sha1>;

const UUID_CHARS: usize = 36;
const RAND_HEX_CHARS: usize = 32;
const REPLICA_HEX_CHARS: usize = 8;
const EXPIRY_HEX_CHARS: usize = 16;
const HMAC_HEX_CHARS: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub uuid: String,
    pub rand: [u8; 16],
    pub replica: u32,
    pub expiry: u64,
}

impl Token {
    /// Produces the wire form handed back to a client, with a fresh HMAC.
    pub fn encode(&self, hmac_key: &[u8]) -> String {
        let body = self.signed_body();
        let mut mac = HmacSha1::new_from_slice(hmac_key).expect("HMAC accepts any key length");
        mac.update(body.as_bytes());
        let sig = mac.finalize().into_bytes();
        format!("{body}{}", hex::encode(sig))
    }

    fn signed_body(&self) -> String {
        format!(
            "{}:{}:{:08x}:{:016x}:",
            self.uuid,
            hex::encode(self.rand),
            self.replica,
            self.expiry
        )
    }

    /// Parses and verifies a token produced by [`Token::encode`]. A
    /// malformed field and a signature mismatch both come back as `EINVAL`
    /// — there is nothing a caller should learn from telling them apart.
    pub fn decode(text: &str, hmac_key: &[u8]) -> Result<Token> {
        let fields: Vec<&str> = text.split(':').collect();
        let [uuid, rand_hex, replica_hex, expiry_hex, hmac_hex] = match fields.as_slice() {
            [a, b, c, d, e] => [*a, *b, *c, *d, *e],
            _ => return Err(einval("malformed token: wrong field count")),
        };
        if uuid.len() != UUID_CHARS
            || rand_hex.len() != RAND_HEX_CHARS
            || replica_hex.len() != REPLICA_HEX_CHARS
            || expiry_hex.len() != EXPIRY_HEX_CHARS
            || hmac_hex.len() != HMAC_HEX_CHARS
        {
            return Err(einval("malformed token: wrong field width"));
        }

        let body_len = text.len() - hmac_hex.len();
        let mut mac = HmacSha1::new_from_slice(hmac_key).expect("HMAC accepts any key length");
        mac.update(text[..body_len].as_bytes());
        let expected = hex::decode(hmac_hex).map_err(|e| einval(format!("bad hmac field: {e}")))?;
        mac.verify_slice(&expected).map_err(|_| einval("token signature mismatch"))?;

        let rand_bytes = hex::decode(rand_hex).map_err(|e| einval(format!("bad rand field: {e}")))?;
        let mut rand = [0u8; 16];
        rand.copy_from_slice(&rand_bytes);
        let replica = u32::from_str_radix(replica_hex, 16).map_err(|e| einval(format!("bad replica field: {e}")))?;
        let expiry = u64::from_str_radix(expiry_hex, 16).map_err(|e| einval(format!("bad expiry field: {e}")))?;

        Ok(Token {
            uuid: uuid.to_string(),
            rand,
            replica,
            expiry,
        })
    }
}

/// `SHA1("" ∥ cluster_root_auth_key)`: turns a root auth key of any length
/// into the fixed 20-byte key the HMAC is keyed with.
pub fn derive_hmac_key(cluster_root_auth_key: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(cluster_root_auth_key);
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// Renders 16 raw bytes as a hyphenated UUID-shaped string for the token's
/// `uuid` field, without pulling in a UUID crate for formatting alone.
pub fn format_uuid(bytes: &[u8; 16]) -> String {
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Token {
        Token {
            uuid: format_uuid(&[0x11; 16]),
            rand: [0x22; 16],
            replica: 2,
            expiry: 1_700_000_000,
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let key = derive_hmac_key(b"root-key");
        let encoded = sample().encode(&key);
        assert_eq!(encoded.len(), UUID_CHARS + RAND_HEX_CHARS + REPLICA_HEX_CHARS + EXPIRY_HEX_CHARS + HMAC_HEX_CHARS + 4);
        let decoded = Token::decode(&encoded, &key).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn tampered_field_fails_verification() {
        let key = derive_hmac_key(b"root-key");
        let mut encoded = sample().encode(&key);
        let pos = encoded.find(':').unwrap() + 1;
        encoded.replace_range(pos..pos + 2, "ff");
        assert!(Token::decode(&encoded, &key).is_err());
    }

    #[test]
    fn wrong_key_fails_verification() {
        let encoded = sample().encode(&derive_hmac_key(b"root-key"));
        assert!(Token::decode(&encoded, &derive_hmac_key(b"other-key")).is_err());
    }

    #[test]
    fn malformed_field_count_is_einval() {
        let key = derive_hmac_key(b"root-key");
        let err = Token::decode("not-a-token", &key).unwrap_err();
        assert_eq!(err.code, hashfs_util::Code::EInval);
    }
}
