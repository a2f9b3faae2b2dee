//! External collaborator traits for content storage and trust.
//!
//! The overlay consumes these through narrow interfaces so the real
//! implementations (disk-backed cache, application trust database) stay
//! outside the crate:
//!
//! | Concern | Trait | Purpose |
//! |---------|-------|---------|
//! | Blocks | [`BlockStore`] | Content-addressed byte cache |
//! | Trust | [`TrustOracle`] | Signers/tags exempt from metadata GC |
//!
//! [`MemoryBlockStore`] and [`StaticTrust`] are the in-process
//! implementations used by tests and the demo binary.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::item::{Key, Signer, Tag};

/// Content-addressed block cache.
#[async_trait]
pub trait BlockStore: Send + Sync + 'static {
    /// Fetch a block. `Ok(None)` means not present; `Err` is a storage fault.
    async fn get(&self, key: &Key) -> Result<Option<Vec<u8>>>;

    /// Store a block. Implementations verify that the payload hashes to the
    /// key before accepting it.
    async fn put(&self, key: Key, payload: Vec<u8>) -> Result<()>;

    async fn contains(&self, key: &Key) -> bool;

    /// Pin a block against eviction. Pins nest; one `unlock` per `lock`.
    async fn lock(&self, key: &Key);

    async fn unlock(&self, key: &Key);

    /// Snapshot of every stored key.
    async fn keys(&self) -> Vec<Key>;

    /// The subset of `keys` present locally, input order preserved.
    async fn intersect(&self, keys: &[Key]) -> Vec<Key>;

    /// The subset of `keys` missing locally, input order preserved.
    async fn difference(&self, keys: &[Key]) -> Vec<Key>;
}

/// Source of the trusted signers and tags that metadata GC never evicts.
#[async_trait]
pub trait TrustOracle: Send + Sync + 'static {
    async fn trusted_signers(&self) -> Vec<Signer>;

    async fn trusted_tags(&self) -> Vec<Tag>;
}

#[derive(Default)]
struct StoredBlock {
    payload: Vec<u8>,
    locks: u32,
}

/// Unbounded in-memory [`BlockStore`].
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: Mutex<HashMap<Key, StoredBlock>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn lock_count(&self, key: &Key) -> u32 {
        self.blocks
            .lock()
            .map(|blocks| blocks.get(key).map_or(0, |b| b.locks))
            .unwrap_or(0)
    }
}

fn poisoned() -> anyhow::Error {
    anyhow::anyhow!("block store mutex poisoned")
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        let blocks = self.blocks.lock().map_err(|_| poisoned())?;
        Ok(blocks.get(key).map(|b| b.payload.clone()))
    }

    async fn put(&self, key: Key, payload: Vec<u8>) -> Result<()> {
        if Key::from_content(&payload) != key {
            bail!("payload does not hash to key");
        }
        let mut blocks = self.blocks.lock().map_err(|_| poisoned())?;
        blocks.entry(key).or_default().payload = payload;
        Ok(())
    }

    async fn contains(&self, key: &Key) -> bool {
        self.blocks
            .lock()
            .map(|blocks| blocks.contains_key(key))
            .unwrap_or(false)
    }

    async fn lock(&self, key: &Key) {
        if let Ok(mut blocks) = self.blocks.lock() {
            if let Some(block) = blocks.get_mut(key) {
                block.locks += 1;
            }
        }
    }

    async fn unlock(&self, key: &Key) {
        if let Ok(mut blocks) = self.blocks.lock() {
            if let Some(block) = blocks.get_mut(key) {
                block.locks = block.locks.saturating_sub(1);
            }
        }
    }

    async fn keys(&self) -> Vec<Key> {
        self.blocks
            .lock()
            .map(|blocks| blocks.keys().copied().collect())
            .unwrap_or_default()
    }

    async fn intersect(&self, keys: &[Key]) -> Vec<Key> {
        self.blocks
            .lock()
            .map(|blocks| {
                keys.iter()
                    .filter(|key| blocks.contains_key(key))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn difference(&self, keys: &[Key]) -> Vec<Key> {
        self.blocks
            .lock()
            .map(|blocks| {
                keys.iter()
                    .filter(|key| !blocks.contains_key(key))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Fixed trust lists, handed in at construction.
#[derive(Default)]
pub struct StaticTrust {
    signers: Vec<Signer>,
    tags: Vec<Tag>,
}

impl StaticTrust {
    pub fn new(signers: Vec<Signer>, tags: Vec<Tag>) -> Self {
        Self { signers, tags }
    }
}

#[async_trait]
impl TrustOracle for StaticTrust {
    async fn trusted_signers(&self) -> Vec<Signer> {
        self.signers.clone()
    }

    async fn trusted_tags(&self) -> Vec<Tag> {
        self.tags.clone()
    }
}
