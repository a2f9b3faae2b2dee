//! # Metadata Index
//!
//! Trust-gated, capacity-bounded store for the three signed record kinds.
//! Each store is layered `type -> bucket key -> certificate signer -> record`:
//!
//! - broadcast: bucket key is the signer itself, one record per signer,
//!   newest creation time wins
//! - unicast: bucket key is the target signature string, a bounded record
//!   set per certificate signer
//! - multicast: bucket key is the tag, same bounded sets
//!
//! ## Acceptance
//!
//! [`set_broadcast_metadata`](MetadataIndex::set_broadcast_metadata) and
//! friends reject records dated more than 30 minutes into the future and
//! records with an invalid shape (`Ok(false)`). Records this side already
//! holds (same or older creation time, or an exact duplicate) short-circuit
//! without touching the certificate (`Ok(true)`). Anything new must pass
//! certificate verification or the error surfaces to the caller; it is never
//! swallowed into a bool.
//!
//! ## Eviction
//!
//! Types stay alive by being queried: the typed getters stamp recency into a
//! 32-entry LRU per store, and [`refresh`](MetadataIndex::refresh) drops any
//! type that has fallen out. Within surviving types, trusted bucket keys and
//! certificate signers are always kept, untrusted ones are randomly sampled
//! down to fixed caps, and record sets keep only their newest entries.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;

use lru::LruCache;
use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::item::{
    now_ms, BroadcastMetadata, CertificateError, MulticastMetadata, Signer, Tag, UnicastMetadata,
};

/// Tolerated clock skew: records dated further than this into the future
/// are rejected. The boundary is inclusive, exactly 30 minutes is accepted.
const MAX_FUTURE_TIME_MS: u64 = 30 * 60 * 1000;

/// Types kept per store across a refresh, most recently queried first.
const MAX_ALIVE_TYPE_COUNT: usize = 32;

/// Untrusted bucket keys kept per type.
const MAX_UNTRUSTED_BUCKET_COUNT: usize = 1024;

/// Untrusted certificate signers kept per bucket.
const MAX_UNTRUSTED_SIGNER_COUNT: usize = 32;

/// Records kept per certificate signer, newest first.
const MAX_RECORD_COUNT: usize = 32;

fn too_far_in_future(creation_time: u64) -> bool {
    creation_time > now_ms() + MAX_FUTURE_TIME_MS
}

/// Removes random untrusted keys until at most `cap` untrusted remain.
fn sample_untrusted<K, V>(map: &mut HashMap<K, V>, trusted: &HashSet<K>, cap: usize)
where
    K: Clone + Eq + std::hash::Hash,
{
    let mut untrusted: Vec<K> = map
        .keys()
        .filter(|key| !trusted.contains(*key))
        .cloned()
        .collect();
    let excess = untrusted.len().saturating_sub(cap);
    if excess == 0 {
        return;
    }
    untrusted.shuffle(&mut thread_rng());
    for key in untrusted.into_iter().take(excess) {
        map.remove(&key);
    }
}

/// Keeps the `MAX_RECORD_COUNT` newest records of a set.
fn keep_newest<T, F>(records: &mut HashSet<T>, creation_time: F)
where
    T: Clone + Eq + std::hash::Hash,
    F: Fn(&T) -> u64,
{
    if records.len() <= MAX_RECORD_COUNT {
        return;
    }
    let mut ordered: Vec<T> = records.iter().cloned().collect();
    ordered.sort_by_key(|record| creation_time(record));
    for record in ordered.into_iter().take(records.len() - MAX_RECORD_COUNT) {
        records.remove(&record);
    }
}

type BroadcastStore = HashMap<String, HashMap<Signer, BroadcastMetadata>>;
type UnicastStore = HashMap<String, HashMap<Signer, HashMap<Signer, HashSet<UnicastMetadata>>>>;
type MulticastStore = HashMap<String, HashMap<Tag, HashMap<Signer, HashSet<MulticastMetadata>>>>;

pub struct MetadataIndex {
    broadcast: BroadcastStore,
    unicast: UnicastStore,
    multicast: MulticastStore,
    broadcast_types: LruCache<String, ()>,
    unicast_types: LruCache<String, ()>,
    multicast_types: LruCache<String, ()>,
}

impl MetadataIndex {
    pub fn new() -> Self {
        let alive = NonZeroUsize::new(MAX_ALIVE_TYPE_COUNT).unwrap_or(NonZeroUsize::MIN);
        Self {
            broadcast: HashMap::new(),
            unicast: HashMap::new(),
            multicast: HashMap::new(),
            broadcast_types: LruCache::new(alive),
            unicast_types: LruCache::new(alive),
            multicast_types: LruCache::new(alive),
        }
    }

    /// Total records across all three stores.
    pub fn count(&self) -> usize {
        let broadcast: usize = self.broadcast.values().map(|dic| dic.len()).sum();
        let unicast: usize = self
            .unicast
            .values()
            .flat_map(|dic| dic.values())
            .flat_map(|dic| dic.values())
            .map(|set| set.len())
            .sum();
        let multicast: usize = self
            .multicast
            .values()
            .flat_map(|dic| dic.values())
            .flat_map(|dic| dic.values())
            .map(|set| set.len())
            .sum();
        broadcast + unicast + multicast
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    pub fn set_broadcast_metadata(
        &mut self,
        metadata: BroadcastMetadata,
    ) -> Result<bool, CertificateError> {
        if !metadata.is_valid() || too_far_in_future(metadata.creation_time) {
            return Ok(false);
        }

        let bucket = self
            .broadcast
            .entry(metadata.type_name.clone())
            .or_default();
        let signer = metadata.signer();

        match bucket.get(&signer) {
            Some(existing) if metadata.creation_time <= existing.creation_time => {}
            _ => {
                metadata.verify()?;
                bucket.insert(signer, metadata);
            }
        }
        Ok(true)
    }

    pub fn set_unicast_metadata(
        &mut self,
        metadata: UnicastMetadata,
    ) -> Result<bool, CertificateError> {
        if !metadata.is_valid() || too_far_in_future(metadata.creation_time) {
            return Ok(false);
        }

        let records = self
            .unicast
            .entry(metadata.type_name.clone())
            .or_default()
            .entry(metadata.target.clone())
            .or_default()
            .entry(metadata.signer())
            .or_default();

        if !records.contains(&metadata) {
            metadata.verify()?;
            records.insert(metadata);
        }
        Ok(true)
    }

    pub fn set_multicast_metadata(
        &mut self,
        metadata: MulticastMetadata,
    ) -> Result<bool, CertificateError> {
        if !metadata.is_valid() || too_far_in_future(metadata.creation_time) {
            return Ok(false);
        }

        let records = self
            .multicast
            .entry(metadata.type_name.clone())
            .or_default()
            .entry(metadata.tag.clone())
            .or_default()
            .entry(metadata.signer())
            .or_default();

        if !records.contains(&metadata) {
            metadata.verify()?;
            records.insert(metadata);
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Typed getters, stamping the queried type's recency
    // ------------------------------------------------------------------

    pub fn broadcast_metadata(
        &mut self,
        signer: &Signer,
        type_name: &str,
    ) -> Option<BroadcastMetadata> {
        self.broadcast_types.put(type_name.to_string(), ());
        self.broadcast
            .get(type_name)
            .and_then(|dic| dic.get(signer))
            .cloned()
    }

    pub fn unicast_metadatas(
        &mut self,
        target: &Signer,
        type_name: &str,
    ) -> Vec<UnicastMetadata> {
        self.unicast_types.put(type_name.to_string(), ());
        self.unicast
            .get(type_name)
            .and_then(|dic| dic.get(target))
            .map(|dic| dic.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn multicast_metadatas(&mut self, tag: &Tag, type_name: &str) -> Vec<MulticastMetadata> {
        self.multicast_types.put(type_name.to_string(), ());
        self.multicast
            .get(type_name)
            .and_then(|dic| dic.get(tag))
            .map(|dic| dic.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Enumeration for the gossip scheduler (no recency stamp)
    // ------------------------------------------------------------------

    pub fn broadcast_signers(&self) -> Vec<Signer> {
        let set: HashSet<&Signer> = self.broadcast.values().flat_map(|dic| dic.keys()).collect();
        set.into_iter().cloned().collect()
    }

    pub fn unicast_targets(&self) -> Vec<Signer> {
        let set: HashSet<&Signer> = self.unicast.values().flat_map(|dic| dic.keys()).collect();
        set.into_iter().cloned().collect()
    }

    pub fn multicast_tags(&self) -> Vec<Tag> {
        let set: HashSet<&Tag> = self.multicast.values().flat_map(|dic| dic.keys()).collect();
        set.into_iter().cloned().collect()
    }

    /// Every broadcast record for `signer`, across types.
    pub fn broadcast_metadatas_for(&self, signer: &Signer) -> Vec<BroadcastMetadata> {
        self.broadcast
            .values()
            .filter_map(|dic| dic.get(signer))
            .cloned()
            .collect()
    }

    /// Every unicast record addressed to `target`, across types.
    pub fn unicast_metadatas_for(&self, target: &Signer) -> Vec<UnicastMetadata> {
        self.unicast
            .values()
            .filter_map(|dic| dic.get(target))
            .flat_map(|dic| dic.values())
            .flatten()
            .cloned()
            .collect()
    }

    /// Every multicast record on `tag`, across types.
    pub fn multicast_metadatas_for(&self, tag: &Tag) -> Vec<MulticastMetadata> {
        self.multicast
            .values()
            .filter_map(|dic| dic.get(tag))
            .flat_map(|dic| dic.values())
            .flatten()
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Trust-gated eviction
    // ------------------------------------------------------------------

    /// Prunes each store: drop types outside the recency window, keep all
    /// trusted bucket keys and signers, sample untrusted ones down to their
    /// caps, keep the newest records per set.
    pub fn refresh(&mut self, trusted_signers: &HashSet<Signer>, trusted_tags: &HashSet<Tag>) {
        // Broadcast
        {
            let alive: HashSet<String> =
                self.broadcast_types.iter().map(|(k, _)| k.clone()).collect();
            self.broadcast.retain(|type_name, _| alive.contains(type_name));

            for dic in self.broadcast.values_mut() {
                sample_untrusted(dic, trusted_signers, MAX_UNTRUSTED_BUCKET_COUNT);
            }
        }

        // Unicast
        {
            let alive: HashSet<String> =
                self.unicast_types.iter().map(|(k, _)| k.clone()).collect();
            self.unicast.retain(|type_name, _| alive.contains(type_name));

            for dic in self.unicast.values_mut() {
                sample_untrusted(dic, trusted_signers, MAX_UNTRUSTED_BUCKET_COUNT);
                for dic2 in dic.values_mut() {
                    sample_untrusted(dic2, trusted_signers, MAX_UNTRUSTED_SIGNER_COUNT);
                    for records in dic2.values_mut() {
                        keep_newest(records, |m| m.creation_time);
                    }
                }
            }
        }

        // Multicast
        {
            let alive: HashSet<String> =
                self.multicast_types.iter().map(|(k, _)| k.clone()).collect();
            self.multicast.retain(|type_name, _| alive.contains(type_name));

            for dic in self.multicast.values_mut() {
                sample_untrusted(dic, trusted_tags, MAX_UNTRUSTED_BUCKET_COUNT);
                for dic2 in dic.values_mut() {
                    sample_untrusted(dic2, trusted_signers, MAX_UNTRUSTED_SIGNER_COUNT);
                    for records in dic2.values_mut() {
                        keep_newest(records, |m| m.creation_time);
                    }
                }
            }
        }
    }
}

impl Default for MetadataIndex {
    fn default() -> Self {
        Self::new()
    }
}
