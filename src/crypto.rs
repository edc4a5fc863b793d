//! Hashing, addressing and recoverable-signature primitives.
//!
//! The consensus core treats these as a trait-shaped collaborator boundary
//! (spec §1, §6): everything here is a thin, concrete stand-in so the rest
//! of the crate has something real to call.

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey as Secp256k1PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use std::fmt;

/// A 32-byte digest, typically SHA-256 over the canonical JSON encoding of a value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A 20-byte account/validator address, the low 20 bytes of `keccak256(pubkey)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes[bytes.len() - 20..]);
        Address(out)
    }

    pub const ZERO: Address = Address([0u8; 20]);
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

// Serialized as a `0x`-prefixed hex string rather than the derived byte-array
// encoding: `Address` is used as a `BTreeMap` key (`Block::validators`,
// `Config::genesis_validators`), and both `serde_json` and `toml` require map
// keys to serialize through `serialize_str`.
impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        if bytes.len() != 20 {
            return Err(serde::de::Error::custom("address must be 20 bytes"));
        }
        Ok(Address::from_slice(&bytes))
    }
}

/// secp256k1 public key (33-byte compressed encoding on the wire).
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(pub Secp256k1PublicKey);

impl PublicKey {
    pub fn to_address(&self) -> Address {
        let uncompressed = self.0.serialize_uncompressed();
        // Skip the leading 0x04 tag, matching the usual "hash the coordinates" derivation.
        let mut hasher = Keccak256::new();
        hasher.update(&uncompressed[1..]);
        let digest = hasher.finalize();
        Address::from_slice(&digest)
    }
}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.serialize().hash(state);
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.serialize().cmp(&other.0.serialize())
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0.serialize())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        let pk = Secp256k1PublicKey::from_slice(&bytes)
            .map_err(|e| serde::de::Error::custom(format!("{:?}", e)))?;
        Ok(PublicKey(pk))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pub({})", hex::encode(self.0.serialize()))
    }
}

/// secp256k1 private key.
#[derive(Clone)]
pub struct PrivateKey(pub SecretKey);

impl PrivateKey {
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        let (sk, _pk) = secp.generate_keypair(&mut rng);
        PrivateKey(sk)
    }

    pub fn public_key(&self) -> PublicKey {
        let secp = Secp256k1::new();
        PublicKey(Secp256k1PublicKey::from_secret_key(&secp, &self.0))
    }
}

/// Recoverable ECDSA signature (65 bytes on the wire: 64-byte compact sig + recovery id).
#[derive(Clone, PartialEq, Eq)]
pub struct Signature(pub RecoverableSignature);

impl std::hash::Hash for Signature {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        let (id, bytes) = self.0.serialize_compact();
        bytes.hash(state);
        id.to_i32().hash(state);
    }
}

impl Signature {
    fn to_bytes(&self) -> [u8; 65] {
        let (id, bytes) = self.0.serialize_compact();
        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&bytes);
        out[64] = id.to_i32() as u8;
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() != 65 {
            return Err("signature must be 65 bytes".into());
        }
        let id = RecoveryId::from_i32(bytes[64] as i32).map_err(|e| e.to_string())?;
        let sig = RecoverableSignature::from_compact(&bytes[..64], id).map_err(|e| e.to_string())?;
        Ok(Signature(sig))
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        Signature::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sig({})", hex::encode(self.to_bytes()))
    }
}

impl Default for Signature {
    fn default() -> Self {
        // A recoverable signature has no meaningful zero value; sign a fixed
        // message with a fixed key so `Default` is at least well-formed.
        let sk = SecretKey::from_slice(&[1u8; 32]).unwrap();
        sign(&PrivateKey(sk), &[0u8; 32])
    }
}

fn message_from_bytes(message: &[u8]) -> Message {
    // Transactions/votes sign over an arbitrary-length payload; reduce it to
    // the 32-byte digest the secp256k1 API requires.
    let mut hasher = Sha256::new();
    hasher.update(message);
    let digest: [u8; 32] = hasher.finalize().into();
    Message::from_digest(digest)
}

/// Sign an arbitrary message with a private key, producing a recoverable signature.
pub fn sign(priv_key: &PrivateKey, message: &[u8]) -> Signature {
    let secp = Secp256k1::new();
    let msg = message_from_bytes(message);
    Signature(secp.sign_ecdsa_recoverable(&msg, &priv_key.0))
}

/// Verify a signature against a known public key.
pub fn verify(pub_key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
    recover(message, signature).map(|addr| addr == pub_key.to_address()).unwrap_or(false)
}

/// Recover the signer's address from a message and its recoverable signature.
pub fn recover(message: &[u8], signature: &Signature) -> Option<Address> {
    let secp = Secp256k1::new();
    let msg = message_from_bytes(message);
    let pk = secp.recover_ecdsa(&msg, &signature.0).ok()?;
    Some(PublicKey(pk).to_address())
}

/// Hash any serializable value via its canonical (field-order-stable) JSON encoding.
pub fn hash_data<T: Serialize>(data: &T) -> Hash {
    let serialized = serde_json::to_vec(data).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(serialized);
    Hash(hasher.finalize().into())
}

/// Hash raw bytes directly (used for content that isn't itself `Serialize`, e.g. concatenated seeds).
pub fn hash_bytes(bytes: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Hash(hasher.finalize().into())
}

pub fn generate_keypair() -> (PublicKey, PrivateKey) {
    let sk = PrivateKey::generate();
    let pk = sk.public_key();
    (pk, sk)
}

/// Deterministic keypair derivation from a small integer id, for static test/genesis committees.
pub fn generate_keypair_from_id(id: u64) -> (PublicKey, PrivateKey) {
    let mut seed = [0u8; 32];
    seed[24..32].copy_from_slice(&id.to_be_bytes());
    seed[0] = 1; // avoid the all-zero scalar, which is not a valid secret key
    let sk = SecretKey::from_slice(&seed).expect("deterministic seed is a valid scalar");
    let pk = PrivateKey(sk).public_key();
    (pk, PrivateKey(sk))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_recover_roundtrip() {
        let (pk, sk) = generate_keypair();
        let msg = b"triarch-vote-payload";
        let sig = sign(&sk, msg);
        assert!(verify(&pk, msg, &sig));
        assert_eq!(recover(msg, &sig), Some(pk.to_address()));
    }

    #[test]
    fn recover_fails_on_tampered_message() {
        let (pk, sk) = generate_keypair();
        let sig = sign(&sk, b"original");
        assert!(!verify(&pk, b"tampered", &sig));
    }

    #[test]
    fn deterministic_keys_are_stable() {
        let (pk_a, _) = generate_keypair_from_id(7);
        let (pk_b, _) = generate_keypair_from_id(7);
        assert_eq!(pk_a, pk_b);
        let (pk_c, _) = generate_keypair_from_id(8);
        assert_ne!(pk_a, pk_c);
    }

    #[test]
    fn signature_serde_roundtrip() {
        let (_, sk) = generate_keypair();
        let sig = sign(&sk, b"payload");
        let encoded = serde_json::to_vec(&sig).unwrap();
        let decoded: Signature = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(sig, decoded);
    }
}
