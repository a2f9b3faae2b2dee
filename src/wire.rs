//! # Wire Protocol Frames
//!
//! Frame bodies and codec for the overlay's session protocol. Every frame on
//! an established session is `u32` big-endian length, then a 1-byte frame
//! type, then a bincode body. Handshake exchanges reuse the length prefix
//! with raw bodies and are described in `session`.
//!
//! ## Frame Types
//!
//! | Id | Frame | Body |
//! |----|-------|------|
//! | 0  | `Alive` | empty |
//! | 1  | `Cancel` | empty |
//! | 2  | `Ping` | nonce bytes |
//! | 3  | `Pong` | nonce bytes |
//! | 4  | `Nodes` | node descriptors |
//! | 5  | `BlocksLink` | keys the sender diffuses |
//! | 6  | `BlocksRequest` | keys the sender wants |
//! | 7  | `Block` | key + payload |
//! | 8  | `BroadcastMetadatasRequest` | signature strings |
//! | 9  | `BroadcastMetadatas` | records |
//! | 10 | `UnicastMetadatasRequest` | signature strings |
//! | 11 | `UnicastMetadatas` | records |
//! | 12 | `MulticastMetadatasRequest` | tags |
//! | 13 | `MulticastMetadatas` | records |
//!
//! Unknown type bytes decode to `Ok(None)` so newer peers can speak to older
//! ones; the receiver drops the frame and keeps the session.
//!
//! ## Security Limits
//!
//! - `MAX_FRAME_SIZE` bounds every deserialization buffer (prevents OOM)
//! - Collection caps are applied on both sides: senders truncate before
//!   serializing, receivers truncate after deserializing
//! - Ping/pong nonces and block payloads over their bounds fail decoding

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::item::{
    BroadcastMetadata, Key, MulticastMetadata, Node, Signer, Tag, UnicastMetadata,
};

/// Maximum block payload carried by one `Block` frame (32 MiB).
pub const MAX_BLOCK_SIZE: usize = 32 * 1024 * 1024;

/// Maximum frame body size. Slightly larger than `MAX_BLOCK_SIZE` to allow
/// for the key and framing overhead.
pub const MAX_FRAME_SIZE: u64 = (MAX_BLOCK_SIZE as u64) + 4096;

/// Maximum node descriptors in one `Nodes` frame.
pub const MAX_NODE_COUNT: usize = 1024;

/// Maximum keys in one `BlocksLink` frame.
pub const MAX_BLOCK_LINK_COUNT: usize = 8192;

/// Maximum keys in one `BlocksRequest` frame.
pub const MAX_BLOCK_REQUEST_COUNT: usize = 8192;

/// Maximum signature strings or tags in one metadata-request frame.
pub const MAX_METADATA_REQUEST_COUNT: usize = 1024;

/// Maximum records in one metadata frame.
pub const MAX_METADATA_COUNT: usize = 1024;

/// Maximum ping/pong nonce length in bytes.
pub const MAX_PING_NONCE_LENGTH: usize = 32;

/// Maximum raw session id length exchanged during the handshake.
pub const MAX_SESSION_ID_LENGTH: usize = 32;

/// Protocol version bit for the current frame set.
pub const PROTOCOL_VERSION_1: u32 = 0x01;

const TYPE_ALIVE: u8 = 0;
const TYPE_CANCEL: u8 = 1;
const TYPE_PING: u8 = 2;
const TYPE_PONG: u8 = 3;
pub(crate) const TYPE_NODES: u8 = 4;
const TYPE_BLOCKS_LINK: u8 = 5;
const TYPE_BLOCKS_REQUEST: u8 = 6;
const TYPE_BLOCK: u8 = 7;
const TYPE_BROADCAST_METADATAS_REQUEST: u8 = 8;
const TYPE_BROADCAST_METADATAS: u8 = 9;
const TYPE_UNICAST_METADATAS_REQUEST: u8 = 10;
const TYPE_UNICAST_METADATAS: u8 = 11;
const TYPE_MULTICAST_METADATAS_REQUEST: u8 = 12;
const TYPE_MULTICAST_METADATAS: u8 = 13;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE)
        .with_fixint_encoding()
}

/// Serialize a handshake body with the session's bincode options.
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize with size bounds enforced.
/// SECURITY: Use this instead of raw bincode::deserialize.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

fn decode_error(message: &str) -> bincode::Error {
    Box::new(bincode::ErrorKind::Custom(message.to_string()))
}

fn clamp<T>(items: &[T], cap: usize) -> &[T] {
    &items[..items.len().min(cap)]
}

/// First handshake exchange: supported protocol versions as a bitmask.
/// The negotiated set is the bitwise AND of both sides' masks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDocument {
    pub versions: u32,
}

impl VersionDocument {
    pub fn current() -> Self {
        Self { versions: PROTOCOL_VERSION_1 }
    }

    pub fn negotiate(&self, other: &VersionDocument) -> Option<u32> {
        let common = self.versions & other.versions;
        (common != 0).then_some(common)
    }
}

/// One frame on an established session.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Alive,
    Cancel,
    Ping { nonce: Vec<u8> },
    Pong { nonce: Vec<u8> },
    Nodes { nodes: Vec<Node> },
    BlocksLink { keys: Vec<Key> },
    BlocksRequest { keys: Vec<Key> },
    Block { key: Key, payload: Vec<u8> },
    BroadcastMetadatasRequest { signers: Vec<Signer> },
    BroadcastMetadatas { metadatas: Vec<BroadcastMetadata> },
    UnicastMetadatasRequest { signers: Vec<Signer> },
    UnicastMetadatas { metadatas: Vec<UnicastMetadata> },
    MulticastMetadatasRequest { tags: Vec<Tag> },
    MulticastMetadatas { metadatas: Vec<MulticastMetadata> },
}

impl Frame {
    pub fn type_byte(&self) -> u8 {
        match self {
            Frame::Alive => TYPE_ALIVE,
            Frame::Cancel => TYPE_CANCEL,
            Frame::Ping { .. } => TYPE_PING,
            Frame::Pong { .. } => TYPE_PONG,
            Frame::Nodes { .. } => TYPE_NODES,
            Frame::BlocksLink { .. } => TYPE_BLOCKS_LINK,
            Frame::BlocksRequest { .. } => TYPE_BLOCKS_REQUEST,
            Frame::Block { .. } => TYPE_BLOCK,
            Frame::BroadcastMetadatasRequest { .. } => TYPE_BROADCAST_METADATAS_REQUEST,
            Frame::BroadcastMetadatas { .. } => TYPE_BROADCAST_METADATAS,
            Frame::UnicastMetadatasRequest { .. } => TYPE_UNICAST_METADATAS_REQUEST,
            Frame::UnicastMetadatas { .. } => TYPE_UNICAST_METADATAS,
            Frame::MulticastMetadatasRequest { .. } => TYPE_MULTICAST_METADATAS_REQUEST,
            Frame::MulticastMetadatas { .. } => TYPE_MULTICAST_METADATAS,
        }
    }

    /// Frame family for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Alive => "alive",
            Frame::Cancel => "cancel",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
            Frame::Nodes { .. } => "nodes",
            Frame::BlocksLink { .. } => "blocks_link",
            Frame::BlocksRequest { .. } => "blocks_request",
            Frame::Block { .. } => "block",
            Frame::BroadcastMetadatasRequest { .. } => "broadcast_metadatas_request",
            Frame::BroadcastMetadatas { .. } => "broadcast_metadatas",
            Frame::UnicastMetadatasRequest { .. } => "unicast_metadatas_request",
            Frame::UnicastMetadatas { .. } => "unicast_metadatas",
            Frame::MulticastMetadatasRequest { .. } => "multicast_metadatas_request",
            Frame::MulticastMetadatas { .. } => "multicast_metadatas",
        }
    }

    /// Encodes `[type byte][bincode body]`. Collections over their wire cap
    /// are truncated; nonces and payloads over their bound are an error.
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        let body = match self {
            Frame::Alive | Frame::Cancel => Vec::new(),
            Frame::Ping { nonce } | Frame::Pong { nonce } => {
                if nonce.len() > MAX_PING_NONCE_LENGTH {
                    return Err(decode_error("ping nonce too long"));
                }
                serialize(nonce)?
            }
            Frame::Nodes { nodes } => serialize(&clamp(nodes, MAX_NODE_COUNT))?,
            Frame::BlocksLink { keys } => serialize(&clamp(keys, MAX_BLOCK_LINK_COUNT))?,
            Frame::BlocksRequest { keys } => serialize(&clamp(keys, MAX_BLOCK_REQUEST_COUNT))?,
            Frame::Block { key, payload } => {
                if payload.len() > MAX_BLOCK_SIZE {
                    return Err(decode_error("block payload too large"));
                }
                serialize(&(key, payload))?
            }
            Frame::BroadcastMetadatasRequest { signers } => {
                serialize(&clamp(signers, MAX_METADATA_REQUEST_COUNT))?
            }
            Frame::BroadcastMetadatas { metadatas } => {
                serialize(&clamp(metadatas, MAX_METADATA_COUNT))?
            }
            Frame::UnicastMetadatasRequest { signers } => {
                serialize(&clamp(signers, MAX_METADATA_REQUEST_COUNT))?
            }
            Frame::UnicastMetadatas { metadatas } => {
                serialize(&clamp(metadatas, MAX_METADATA_COUNT))?
            }
            Frame::MulticastMetadatasRequest { tags } => {
                serialize(&clamp(tags, MAX_METADATA_REQUEST_COUNT))?
            }
            Frame::MulticastMetadatas { metadatas } => {
                serialize(&clamp(metadatas, MAX_METADATA_COUNT))?
            }
        };

        let mut frame = Vec::with_capacity(1 + body.len());
        frame.push(self.type_byte());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decodes one framed payload (without the length prefix).
    ///
    /// `Ok(None)` means an unknown type byte; the caller drops the frame and
    /// keeps the session. `Err` means a malformed body for a known type.
    pub fn decode(bytes: &[u8]) -> Result<Option<Frame>, bincode::Error> {
        let Some((&type_byte, body)) = bytes.split_first() else {
            return Err(decode_error("empty frame"));
        };

        let frame = match type_byte {
            TYPE_ALIVE => Frame::Alive,
            TYPE_CANCEL => Frame::Cancel,
            TYPE_PING | TYPE_PONG => {
                let nonce: Vec<u8> = deserialize_bounded(body)?;
                if nonce.len() > MAX_PING_NONCE_LENGTH {
                    return Err(decode_error("ping nonce too long"));
                }
                if type_byte == TYPE_PING {
                    Frame::Ping { nonce }
                } else {
                    Frame::Pong { nonce }
                }
            }
            TYPE_NODES => {
                let mut nodes: Vec<Node> = deserialize_bounded(body)?;
                nodes.truncate(MAX_NODE_COUNT);
                Frame::Nodes { nodes }
            }
            TYPE_BLOCKS_LINK => {
                let mut keys: Vec<Key> = deserialize_bounded(body)?;
                keys.truncate(MAX_BLOCK_LINK_COUNT);
                Frame::BlocksLink { keys }
            }
            TYPE_BLOCKS_REQUEST => {
                let mut keys: Vec<Key> = deserialize_bounded(body)?;
                keys.truncate(MAX_BLOCK_REQUEST_COUNT);
                Frame::BlocksRequest { keys }
            }
            TYPE_BLOCK => {
                let (key, payload): (Key, Vec<u8>) = deserialize_bounded(body)?;
                if payload.len() > MAX_BLOCK_SIZE {
                    return Err(decode_error("block payload too large"));
                }
                Frame::Block { key, payload }
            }
            TYPE_BROADCAST_METADATAS_REQUEST => {
                let mut signers: Vec<Signer> = deserialize_bounded(body)?;
                signers.truncate(MAX_METADATA_REQUEST_COUNT);
                Frame::BroadcastMetadatasRequest { signers }
            }
            TYPE_BROADCAST_METADATAS => {
                let mut metadatas: Vec<BroadcastMetadata> = deserialize_bounded(body)?;
                metadatas.truncate(MAX_METADATA_COUNT);
                Frame::BroadcastMetadatas { metadatas }
            }
            TYPE_UNICAST_METADATAS_REQUEST => {
                let mut signers: Vec<Signer> = deserialize_bounded(body)?;
                signers.truncate(MAX_METADATA_REQUEST_COUNT);
                Frame::UnicastMetadatasRequest { signers }
            }
            TYPE_UNICAST_METADATAS => {
                let mut metadatas: Vec<UnicastMetadata> = deserialize_bounded(body)?;
                metadatas.truncate(MAX_METADATA_COUNT);
                Frame::UnicastMetadatas { metadatas }
            }
            TYPE_MULTICAST_METADATAS_REQUEST => {
                let mut tags: Vec<Tag> = deserialize_bounded(body)?;
                tags.truncate(MAX_METADATA_REQUEST_COUNT);
                Frame::MulticastMetadatasRequest { tags }
            }
            TYPE_MULTICAST_METADATAS => {
                let mut metadatas: Vec<MulticastMetadata> = deserialize_bounded(body)?;
                metadatas.truncate(MAX_METADATA_COUNT);
                Frame::MulticastMetadatas { metadatas }
            }
            _ => return Ok(None),
        };

        Ok(Some(frame))
    }
}
