//! # Items: Identifiers, Descriptors, and Signed Metadata
//!
//! Core value types carried on the wire and held in overlay state:
//!
//! - [`Key`]: content address, a hash-algorithm tag plus 32-byte hash
//! - [`Tag`]: named 32-byte channel identifier for multicast metadata
//! - [`Node`]: peer descriptor, an opaque id plus reachable URIs
//! - [`Signer`]: rendered signature string identifying a certificate holder
//! - [`Certificate`] / [`Keypair`]: Ed25519 attestation over a record digest
//! - [`BroadcastMetadata`] / [`UnicastMetadata`] / [`MulticastMetadata`]:
//!   the three signed announcement shapes
//!
//! ## Validity
//!
//! Items arriving off the wire pass through `is_valid()` before touching any
//! state; invalid items are dropped individually without affecting the frame
//! or the session. Certificate verification is separate from shape validity
//! and reports a typed [`CertificateError`].
//!
//! ## Signing model
//!
//! A metadata record's certificate signs a domain-separated BLAKE3 digest of
//! the record's content fields (everything except the certificate itself).
//! Domain separation prevents a signature from one record kind being replayed
//! on another.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature as EdSignature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Maximum opaque node id length in bytes.
pub const MAX_NODE_ID_LENGTH: usize = 32;

/// Maximum URIs carried by one node descriptor.
pub const MAX_NODE_URI_COUNT: usize = 32;

/// Maximum length of a single URI string.
pub const MAX_URI_LENGTH: usize = 256;

/// Exact tag id length in bytes.
pub const TAG_ID_LENGTH: usize = 32;

/// Maximum tag name length in bytes.
pub const MAX_TAG_NAME_LENGTH: usize = 256;

/// Maximum metadata type-string length in bytes.
pub const MAX_TYPE_LENGTH: usize = 256;

/// Maximum certificate nickname length in bytes.
pub const MAX_NICKNAME_LENGTH: usize = 256;

/// Maximum opaque proof-of-work token length in bytes.
pub const MAX_POW_LENGTH: usize = 64;

/// Domain separation prefix for broadcast metadata digests.
const BROADCAST_SIGN_DOMAIN: &[u8] = b"osmos-broadcast-v1:";

/// Domain separation prefix for unicast metadata digests.
const UNICAST_SIGN_DOMAIN: &[u8] = b"osmos-unicast-v1:";

/// Domain separation prefix for multicast metadata digests.
const MULTICAST_SIGN_DOMAIN: &[u8] = b"osmos-multicast-v1:";

/// Domain separation prefix for stock hashes (per-peer already-sent marks).
const STOCK_HASH_DOMAIN: &[u8] = b"osmos-stock-v1:";

/// Milliseconds since the Unix epoch; timestamp basis for metadata records.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Truncated hex rendering of an id for log fields.
pub(crate) fn short_hex(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(8)])
}

// ============================================================================
// Key
// ============================================================================

/// Hash algorithm tag carried with every content address.
///
/// Exactly one algorithm is live at a time; unknown discriminants fail
/// deserialization and the surrounding item is dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Blake3,
}

/// Content address of a block: algorithm tag plus 32-byte hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    pub algorithm: HashAlgorithm,
    pub hash: [u8; 32],
}

impl Key {
    pub fn new(algorithm: HashAlgorithm, hash: [u8; 32]) -> Self {
        Self { algorithm, hash }
    }

    /// Hashes `content` with the live algorithm.
    pub fn from_content(content: &[u8]) -> Self {
        Self {
            algorithm: HashAlgorithm::Blake3,
            hash: *blake3::hash(content).as_bytes(),
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", hex::encode(&self.hash[..8]))
    }
}

// ============================================================================
// Tag
// ============================================================================

/// Named channel identifier for multicast metadata.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub id: [u8; TAG_ID_LENGTH],
}

impl Tag {
    pub fn new(name: impl Into<String>, id: [u8; TAG_ID_LENGTH]) -> Self {
        Self { name: name.into(), id }
    }

    /// Both fields are required: a non-empty bounded name and a non-zero id.
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty()
            && self.name.len() <= MAX_TAG_NAME_LENGTH
            && self.id.iter().any(|b| *b != 0)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({}/{})", self.name, hex::encode(&self.id[..8]))
    }
}

// ============================================================================
// Node descriptor
// ============================================================================

/// Peer descriptor exchanged during the handshake and gossiped in node lists.
///
/// Equality and hashing go by id bytes only: two sightings of the same id
/// with different URI sets are the same node.
#[derive(Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Vec<u8>,
    pub uris: Vec<String>,
}

impl Node {
    pub fn new(id: Vec<u8>, uris: Vec<String>) -> Self {
        Self { id, uris }
    }

    /// Shape check applied to every descriptor taken off the wire.
    /// Zero URIs is valid (the node is merely unroutable).
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty()
            && self.id.len() <= MAX_NODE_ID_LENGTH
            && self.uris.len() <= MAX_NODE_URI_COUNT
            && self.uris.iter().all(|u| !u.is_empty() && u.len() <= MAX_URI_LENGTH)
    }

    pub fn is_routable(&self) -> bool {
        !self.uris.is_empty()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = self.id.len().min(8);
        write!(
            f,
            "Node({}, {} uris)",
            hex::encode(&self.id[..shown]),
            self.uris.len()
        )
    }
}

// ============================================================================
// Signer strings
// ============================================================================

/// Rendered signature string: `nickname@hex(blake3(verifying key))`.
///
/// This is the index key for broadcast/unicast metadata and, hashed, the
/// Kademlia target for routing metadata toward its signer.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signer(pub String);

impl Signer {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// BLAKE3 of the rendered string; the placement target for this signer.
    pub fn hash(&self) -> [u8; 32] {
        *blake3::hash(self.0.as_bytes()).as_bytes()
    }

    /// `nickname@64-hex-chars`, nickname non-empty, bounded, `@`-free.
    pub fn is_valid(&self) -> bool {
        let Some((nickname, digest)) = self.0.rsplit_once('@') else {
            return false;
        };
        !nickname.is_empty()
            && nickname.len() <= MAX_NICKNAME_LENGTH
            && !nickname.contains('@')
            && digest.len() == 64
            && digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    }
}

impl fmt::Display for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = self.0.len().min(24);
        write!(f, "Signer({})", &self.0[..shown])
    }
}

// ============================================================================
// Certificates
// ============================================================================

/// Error type for certificate verification failures.
///
/// Kept distinct from shape validity so callers can tell a forged or corrupt
/// record apart from a malformed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateError {
    /// The embedded public key is not a valid Ed25519 point.
    InvalidPublicKey,
    /// The nickname is empty, over-long, or contains `@`.
    InvalidNickname,
    /// Cryptographic verification failed.
    VerificationFailed,
}

impl fmt::Display for CertificateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateError::InvalidPublicKey => write!(f, "certificate public key is invalid"),
            CertificateError::InvalidNickname => write!(f, "certificate nickname is invalid"),
            CertificateError::VerificationFailed => {
                write!(f, "certificate signature verification failed")
            }
        }
    }
}

impl std::error::Error for CertificateError {}

/// Nickname-carrying Ed25519 signing key; the author side of a certificate.
#[derive(Clone)]
pub struct Keypair {
    nickname: String,
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate(nickname: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(nickname: impl Into<String>, bytes: &[u8; 32]) -> Self {
        Self {
            nickname: nickname.into(),
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The signature string this keypair's certificates will carry.
    pub fn signer(&self) -> Signer {
        signer_string(&self.nickname, &self.signing_key.verifying_key())
    }

    fn sign(&self, digest: &[u8; 32]) -> Certificate {
        Certificate {
            nickname: self.nickname.clone(),
            verifying_key: self.signing_key.verifying_key().to_bytes(),
            signature: self.signing_key.sign(digest).to_bytes(),
        }
    }
}

fn signer_string(nickname: &str, verifying_key: &VerifyingKey) -> Signer {
    let digest = blake3::hash(&verifying_key.to_bytes());
    Signer(format!("{}@{}", nickname, hex::encode(digest.as_bytes())))
}

/// Serde plumbing for the 64-byte signature field: serde's built-in array
/// impls stop at 32 elements, so mirror its tuple encoding for length 64.
mod signature_bytes {
    use std::fmt;

    use serde::de::{Error as _, SeqAccess, Visitor};
    use serde::ser::SerializeTuple;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(64)?;
        for byte in bytes {
            tuple.serialize_element(byte)?;
        }
        tuple.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 64], D::Error> {
        struct ArrayVisitor;

        impl<'de> Visitor<'de> for ArrayVisitor {
            type Value = [u8; 64];

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("an array of 64 bytes")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut bytes = [0u8; 64];
                for (index, slot) in bytes.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| A::Error::invalid_length(index, &self))?;
                }
                Ok(bytes)
            }
        }

        deserializer.deserialize_tuple(64, ArrayVisitor)
    }
}

/// Detached attestation on a metadata record: who signed it and the proof.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Certificate {
    pub nickname: String,
    pub verifying_key: [u8; 32],
    #[serde(with = "signature_bytes")]
    pub signature: [u8; 64],
}

impl Certificate {
    /// Renders the signature string identifying this certificate's holder.
    pub fn signer(&self) -> Signer {
        Signer(format!(
            "{}@{}",
            self.nickname,
            hex::encode(blake3::hash(&self.verifying_key).as_bytes())
        ))
    }

    /// Verifies `digest` against the embedded key.
    pub fn verify(&self, digest: &[u8; 32]) -> Result<(), CertificateError> {
        if self.nickname.is_empty()
            || self.nickname.len() > MAX_NICKNAME_LENGTH
            || self.nickname.contains('@')
        {
            return Err(CertificateError::InvalidNickname);
        }

        let verifying_key = VerifyingKey::from_bytes(&self.verifying_key)
            .map_err(|_| CertificateError::InvalidPublicKey)?;

        let signature = EdSignature::from_bytes(&self.signature);
        verifying_key
            .verify(digest, &signature)
            .map_err(|_| CertificateError::VerificationFailed)
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Certificate({}@{})",
            self.nickname,
            hex::encode(&self.verifying_key[..8])
        )
    }
}

// ============================================================================
// Metadata records
// ============================================================================

fn digest_with(domain: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domain);
    for part in parts {
        // Length-prefix each part so field boundaries cannot be shifted.
        hasher.update(&(part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Announcement indexed by its signer alone: one record per signer per type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastMetadata {
    pub type_name: String,
    pub creation_time: u64,
    pub key: Key,
    pub certificate: Certificate,
}

impl BroadcastMetadata {
    pub fn new(
        type_name: impl Into<String>,
        creation_time: u64,
        key: Key,
        keypair: &Keypair,
    ) -> Self {
        let type_name = type_name.into();
        let digest = Self::digest(&type_name, creation_time, &key);
        Self {
            type_name,
            creation_time,
            key,
            certificate: keypair.sign(&digest),
        }
    }

    fn digest(type_name: &str, creation_time: u64, key: &Key) -> [u8; 32] {
        digest_with(
            BROADCAST_SIGN_DOMAIN,
            &[
                type_name.as_bytes(),
                &creation_time.to_be_bytes(),
                &key.hash,
            ],
        )
    }

    pub fn signer(&self) -> Signer {
        self.certificate.signer()
    }

    pub fn is_valid(&self) -> bool {
        !self.type_name.is_empty() && self.type_name.len() <= MAX_TYPE_LENGTH
    }

    pub fn verify(&self) -> Result<(), CertificateError> {
        let digest = Self::digest(&self.type_name, self.creation_time, &self.key);
        self.certificate.verify(&digest)
    }

    /// Hash marking this exact record in per-peer stock sets.
    pub fn stock_hash(&self) -> [u8; 32] {
        digest_with(
            STOCK_HASH_DOMAIN,
            &[
                BROADCAST_SIGN_DOMAIN,
                self.type_name.as_bytes(),
                &self.creation_time.to_be_bytes(),
                &self.key.hash,
                &self.certificate.verifying_key,
                &self.certificate.signature,
            ],
        )
    }
}

/// Announcement addressed to one target signer, indexed by (target, signer).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnicastMetadata {
    pub type_name: String,
    pub target: Signer,
    pub creation_time: u64,
    pub key: Key,
    pub certificate: Certificate,
}

impl UnicastMetadata {
    pub fn new(
        type_name: impl Into<String>,
        target: Signer,
        creation_time: u64,
        key: Key,
        keypair: &Keypair,
    ) -> Self {
        let type_name = type_name.into();
        let digest = Self::digest(&type_name, &target, creation_time, &key);
        Self {
            type_name,
            target,
            creation_time,
            key,
            certificate: keypair.sign(&digest),
        }
    }

    fn digest(type_name: &str, target: &Signer, creation_time: u64, key: &Key) -> [u8; 32] {
        digest_with(
            UNICAST_SIGN_DOMAIN,
            &[
                type_name.as_bytes(),
                target.as_str().as_bytes(),
                &creation_time.to_be_bytes(),
                &key.hash,
            ],
        )
    }

    pub fn signer(&self) -> Signer {
        self.certificate.signer()
    }

    pub fn is_valid(&self) -> bool {
        !self.type_name.is_empty()
            && self.type_name.len() <= MAX_TYPE_LENGTH
            && self.target.is_valid()
    }

    pub fn verify(&self) -> Result<(), CertificateError> {
        let digest = Self::digest(&self.type_name, &self.target, self.creation_time, &self.key);
        self.certificate.verify(&digest)
    }

    pub fn stock_hash(&self) -> [u8; 32] {
        digest_with(
            STOCK_HASH_DOMAIN,
            &[
                UNICAST_SIGN_DOMAIN,
                self.type_name.as_bytes(),
                self.target.as_str().as_bytes(),
                &self.creation_time.to_be_bytes(),
                &self.key.hash,
                &self.certificate.verifying_key,
                &self.certificate.signature,
            ],
        )
    }
}

/// Announcement on a tag channel, indexed by (tag, signer).
///
/// Carries an opaque proof-of-work token; validating it is the embedder's
/// concern, the overlay only bounds and transports it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MulticastMetadata {
    pub type_name: String,
    pub tag: Tag,
    pub creation_time: u64,
    pub key: Key,
    pub pow: Option<Vec<u8>>,
    pub certificate: Certificate,
}

impl MulticastMetadata {
    pub fn new(
        type_name: impl Into<String>,
        tag: Tag,
        creation_time: u64,
        key: Key,
        pow: Option<Vec<u8>>,
        keypair: &Keypair,
    ) -> Self {
        let type_name = type_name.into();
        let digest = Self::digest(&type_name, &tag, creation_time, &key, pow.as_deref());
        Self {
            type_name,
            tag,
            creation_time,
            key,
            pow,
            certificate: keypair.sign(&digest),
        }
    }

    fn digest(
        type_name: &str,
        tag: &Tag,
        creation_time: u64,
        key: &Key,
        pow: Option<&[u8]>,
    ) -> [u8; 32] {
        digest_with(
            MULTICAST_SIGN_DOMAIN,
            &[
                type_name.as_bytes(),
                tag.name.as_bytes(),
                &tag.id,
                &creation_time.to_be_bytes(),
                &key.hash,
                pow.unwrap_or_default(),
            ],
        )
    }

    pub fn signer(&self) -> Signer {
        self.certificate.signer()
    }

    pub fn is_valid(&self) -> bool {
        !self.type_name.is_empty()
            && self.type_name.len() <= MAX_TYPE_LENGTH
            && self.tag.is_valid()
            && self.pow.as_ref().map_or(true, |p| !p.is_empty() && p.len() <= MAX_POW_LENGTH)
    }

    pub fn verify(&self) -> Result<(), CertificateError> {
        let digest = Self::digest(
            &self.type_name,
            &self.tag,
            self.creation_time,
            &self.key,
            self.pow.as_deref(),
        );
        self.certificate.verify(&digest)
    }

    pub fn stock_hash(&self) -> [u8; 32] {
        digest_with(
            STOCK_HASH_DOMAIN,
            &[
                MULTICAST_SIGN_DOMAIN,
                self.type_name.as_bytes(),
                self.tag.name.as_bytes(),
                &self.tag.id,
                &self.creation_time.to_be_bytes(),
                &self.key.hash,
                self.pow.as_deref().unwrap_or_default(),
                &self.certificate.verifying_key,
                &self.certificate.signature,
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_key(seed: u8) -> Key {
        Key::new(HashAlgorithm::Blake3, [seed; 32])
    }

    fn test_tag(seed: u8) -> Tag {
        Tag::new(format!("tag-{}", seed), [seed; 32])
    }

    #[test]
    fn key_from_content_is_deterministic() {
        let a = Key::from_content(b"hello");
        let b = Key::from_content(b"hello");
        let c = Key::from_content(b"world");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.algorithm, HashAlgorithm::Blake3);
    }

    #[test]
    fn node_equality_goes_by_id_only() {
        let a = Node::new(vec![1, 2, 3], vec!["tcp:a:1".into()]);
        let b = Node::new(vec![1, 2, 3], vec!["tcp:b:2".into()]);
        let c = Node::new(vec![9, 9, 9], vec!["tcp:a:1".into()]);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn node_validity_bounds() {
        assert!(Node::new(vec![1], vec![]).is_valid());
        assert!(!Node::new(vec![], vec![]).is_valid());
        assert!(!Node::new(vec![0; 33], vec![]).is_valid());

        let too_many = (0..33).map(|i| format!("tcp:h:{}", i)).collect();
        assert!(!Node::new(vec![1], too_many).is_valid());

        assert!(!Node::new(vec![1], vec!["x".repeat(257)]).is_valid());
        assert!(!Node::new(vec![1], vec![]).is_routable());
        assert!(Node::new(vec![1], vec!["tcp:h:1".into()]).is_routable());
    }

    #[test]
    fn tag_requires_name_and_nonzero_id() {
        assert!(test_tag(7).is_valid());
        assert!(!Tag::new("", [7; 32]).is_valid());
        assert!(!Tag::new("t", [0; 32]).is_valid());
        assert!(!Tag::new("x".repeat(257), [7; 32]).is_valid());
    }

    #[test]
    fn signer_string_shape() {
        let keypair = Keypair::generate("alice");
        let signer = keypair.signer();

        assert!(signer.is_valid());
        assert!(signer.as_str().starts_with("alice@"));
        assert_eq!(signer, keypair.signer(), "deterministic rendering");

        assert!(!Signer("no-at-sign".into()).is_valid());
        assert!(!Signer("@deadbeef".into()).is_valid());
        assert!(!Signer(format!("bob@{}", "z".repeat(64))).is_valid());
        assert!(!Signer("bob@abcd".into()).is_valid());
    }

    #[test]
    fn certificate_matches_keypair_signer() {
        let keypair = Keypair::generate("carol");
        let metadata = BroadcastMetadata::new("profile", now_ms(), test_key(1), &keypair);

        assert_eq!(metadata.signer(), keypair.signer());
    }

    #[test]
    fn broadcast_metadata_verifies_and_detects_tamper() {
        let keypair = Keypair::generate("dave");
        let mut metadata = BroadcastMetadata::new("profile", now_ms(), test_key(2), &keypair);

        assert!(metadata.verify().is_ok());

        metadata.key = test_key(3);
        assert_eq!(metadata.verify(), Err(CertificateError::VerificationFailed));
    }

    #[test]
    fn unicast_metadata_binds_target() {
        let author = Keypair::generate("erin");
        let target = Keypair::generate("frank").signer();
        let mut metadata =
            UnicastMetadata::new("mail", target, now_ms(), test_key(4), &author);

        assert!(metadata.verify().is_ok());
        assert!(metadata.is_valid());

        metadata.target = Keypair::generate("mallory").signer();
        assert_eq!(metadata.verify(), Err(CertificateError::VerificationFailed));
    }

    #[test]
    fn multicast_metadata_covers_pow_token() {
        let keypair = Keypair::generate("grace");
        let mut metadata = MulticastMetadata::new(
            "chat",
            test_tag(5),
            now_ms(),
            test_key(5),
            Some(vec![0xAB; 8]),
            &keypair,
        );

        assert!(metadata.verify().is_ok());

        metadata.pow = None;
        assert_eq!(metadata.verify(), Err(CertificateError::VerificationFailed));
    }

    #[test]
    fn multicast_validity_bounds_pow_and_tag() {
        let keypair = Keypair::generate("heidi");
        let good = MulticastMetadata::new("chat", test_tag(6), 1, test_key(6), None, &keypair);
        assert!(good.is_valid());

        let oversized_pow = MulticastMetadata::new(
            "chat",
            test_tag(6),
            1,
            test_key(6),
            Some(vec![1; MAX_POW_LENGTH + 1]),
            &keypair,
        );
        assert!(!oversized_pow.is_valid());

        let bad_tag =
            MulticastMetadata::new("chat", Tag::new("", [1; 32]), 1, test_key(6), None, &keypair);
        assert!(!bad_tag.is_valid());
    }

    #[test]
    fn stock_hash_distinguishes_records() {
        let keypair = Keypair::generate("ivan");
        let a = BroadcastMetadata::new("profile", 1000, test_key(7), &keypair);
        let b = BroadcastMetadata::new("profile", 2000, test_key(7), &keypair);

        assert_ne!(a.stock_hash(), b.stock_hash());
        assert_eq!(a.stock_hash(), a.clone().stock_hash());
    }

    #[test]
    fn corrupt_certificate_key_is_reported_distinctly() {
        let keypair = Keypair::generate("judy");
        let mut metadata = BroadcastMetadata::new("profile", 1, test_key(8), &keypair);

        metadata.certificate.nickname = String::new();
        assert_eq!(metadata.verify(), Err(CertificateError::InvalidNickname));
    }
}
