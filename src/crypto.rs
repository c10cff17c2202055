//! Address/hash newtypes and the SECP256k1 + SHA-2 + base64 primitives every
//! other module signs, hashes, or compares against.
//!
//! Hashes are lowercase hex strings, not raw bytes: `txid`/`tkid`/block hash
//! are *truncated* hex digests, so there is no well-formed byte array to
//! round-trip through once truncated. Keeping them as `String` mirrors what
//! the original source actually stores and compares.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use secp256k1::{
    ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;

/// Full 64-character hex SHA-256 digest, used for block hashes and
/// `previous_hash`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct BlockHash(pub String);

/// First 32 hex characters of a transaction's core-data SHA-256 digest.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct TxId(pub String);

/// First 16 hex characters of a token's identity SHA-256 digest.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct TkId(pub String);

/// 66-character hex encoding of a 33-byte compressed SECP256k1 public key.
/// Doubles as account identifier and poll identifier.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Address(pub String);

macro_rules! hexlike_display {
    ($t:ty) => {
        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($t), self.0)
            }
        }

        impl $t {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $t {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $t {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

hexlike_display!(BlockHash);
hexlike_display!(TxId);
hexlike_display!(TkId);
hexlike_display!(Address);

/// The sentinel `from_address` carried by every coinbase transaction.
pub const COINBASE_SENTINEL: &str = "blockchain";

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn sha512_hex(data: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn base64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn base64_decode(data: &str) -> Option<Vec<u8>> {
    STANDARD.decode(data).ok()
}

/// A signing capability keyed by address. The credential store that backs
/// this is an external collaborator (see `spec.md` §1); this crate only
/// needs the two operations below.
pub trait Signer: Send + Sync {
    fn address(&self) -> Address;
    fn sign(&self, data: &[u8]) -> String;
}

/// A `Signer` backed by a locally held SECP256k1 secret key. Stand-in for
/// whatever the real credential store does (per-user key encryption, poll
/// key derivation) — out of scope here.
pub struct LocalKeySigner {
    secret: SecretKey,
    address: Address,
}

impl LocalKeySigner {
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        let (secret, public) = secp.generate_keypair(&mut rng);
        let address = address_from_pubkey(&public);
        LocalKeySigner { secret, address }
    }

    pub fn from_secret(secret: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public = PublicKey::from_secret_key(&secp, &secret);
        let address = address_from_pubkey(&public);
        LocalKeySigner { secret, address }
    }
}

impl Signer for LocalKeySigner {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn sign(&self, data: &[u8]) -> String {
        sign_with_secret(&self.secret, data)
    }
}

pub fn address_from_pubkey(public: &PublicKey) -> Address {
    Address(hex::encode(public.serialize()))
}

fn digest_message(data: &[u8]) -> Message {
    let digest = {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize()
    };
    // `digest` is exactly 32 bytes (SHA-256 output size).
    Message::from_digest_slice(&digest).expect("sha256 digest is 32 bytes")
}

pub fn sign_with_secret(secret: &SecretKey, data: &[u8]) -> String {
    let secp = Secp256k1::new();
    let msg = digest_message(data);
    let sig = secp.sign_ecdsa(&msg, secret);
    base64_encode(&sig.serialize_compact())
}

/// Verifies `sig` (base64-encoded compact SECP256k1 ECDSA signature) over
/// `data` under the public key encoded in `address`. Malformed hex,
/// malformed base64, and a malformed key are all treated as "does not
/// verify" rather than propagated as errors (spec.md §7: cryptographic
/// errors are validation errors).
pub fn verify(address: &Address, data: &[u8], sig: &str) -> bool {
    let Some(key_bytes) = hex::decode(&address.0).ok() else {
        return false;
    };
    let Some(public) = PublicKey::from_slice(&key_bytes).ok() else {
        return false;
    };
    let Some(sig_bytes) = base64_decode(sig) else {
        return false;
    };
    let Some(signature) = Signature::from_compact(&sig_bytes).ok() else {
        return false;
    };

    let secp = Secp256k1::new();
    let msg = digest_message(data);
    secp.verify_ecdsa(&msg, &signature, &public).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let signer = LocalKeySigner::generate();
        let data = b"3Cfoo66hexchars0000000000000000000000000000000000000000000000000";
        let sig = signer.sign(data);

        assert!(verify(&signer.address(), data, &sig));
    }

    #[test]
    fn flipped_signature_fails_to_verify() {
        let signer = LocalKeySigner::generate();
        let data = b"hello votechain";
        let mut sig = signer.sign(data);

        // Flip one base64 character; still valid base64 but a different
        // signature.
        let mut chars: Vec<char> = sig.chars().collect();
        chars[0] = if chars[0] == 'A' { 'B' } else { 'A' };
        sig = chars.into_iter().collect();

        assert!(!verify(&signer.address(), data, &sig));
    }

    #[test]
    fn sha256_hex_is_64_lowercase_hex_chars() {
        let digest = sha256_hex(b"abc");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn sha512_hex_node_id_prefix_is_8_chars() {
        let digest = sha512_hex(b"127.0.0.154846");
        let id = &digest[..8];
        assert_eq!(id.len(), 8);
    }
}
