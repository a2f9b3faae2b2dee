//! # Osmos - Content-Addressed Block Diffusion Overlay
//!
//! Osmos spreads immutable, content-addressed blocks and signed metadata
//! records over a peer-to-peer overlay:
//!
//! - **Blocks**: opaque payloads addressed by the BLAKE3 hash of their content
//! - **Metadata**: Ed25519-signed records (broadcast, unicast, multicast) gated by a trust oracle
//! - **Routing**: Kademlia-style XOR metric over opaque node ids
//! - **Exchange**: periodic push scheduling; no request/response round trips
//! - **Transport**: pluggable byte streams (TCP out of the box, in-memory for tests)
//!
//! ## Architecture
//!
//! The overlay is push-only. Peers volunteer announcements, requests, and
//! content to the connected peers closest to each key, and everything
//! arrives through periodic drains rather than RPC:
//! - [`Overlay`] owns the sessions and all exchange state behind one lock
//! - Each session gets typed inbound channels and a paced outbound drain task
//! - Blocks flow toward the peers whose ids are nearest their keys
//!
//! ## Security Model
//!
//! - Block integrity is the key itself: payloads are re-hashed on arrival
//! - Metadata authenticity is an Ed25519 certificate over a domain-separated digest
//! - The metadata index only retains records from signers and tags the trust oracle names
//! - Per-peer intake caps and expiring sets bound every data structure
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `overlay` | Connection orchestration, scheduling, and exchange |
//! | `session` | Framed session over one transport stream, handshake, keepalive |
//! | `wire` | Frame catalogue and the bounded binary codec |
//! | `item` | Keys, node descriptors, signers, signed metadata records |
//! | `index` | Trust-gated metadata index |
//! | `kademlia` | XOR-metric routing table and nearest-node search |
//! | `state` | Per-peer exchange bookkeeping |
//! | `store` | Block store and trust oracle traits plus in-memory impls |
//! | `transport` | Connector and acceptor abstractions, TCP and in-memory |
//! | `volatile` | Sets whose entries expire after a survival time |

mod index;
mod item;
mod kademlia;
mod overlay;
mod session;
mod state;
mod store;
mod transport;
mod volatile;
mod wire;

pub use item::{
    BroadcastMetadata, Certificate, CertificateError, HashAlgorithm, Key, Keypair,
    MulticastMetadata, Node, Signer, Tag, UnicastMetadata,
};
pub use overlay::{ConnectionInfo, Overlay, OverlayConfig, OverlayInfo};
pub use session::{Direction, Session, SessionEvents};
pub use store::{BlockStore, MemoryBlockStore, StaticTrust, TrustOracle};
pub use transport::{memory, Acceptor, Connector, Duplex, TcpAcceptor, TcpConnector};
pub use wire::VersionDocument;
