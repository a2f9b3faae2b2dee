//! # Kademlia-style Placement and Routing
//!
//! XOR-metric machinery behind every placement decision in the overlay:
//!
//! - [`search`]: rank candidate nodes by XOR distance to a target and keep
//!   the closest few. Deterministic: the result does not depend on the
//!   input order.
//! - [`RoutingTable`]: known-node memory bucketed by distance from the base
//!   node, feeding the connect loop with dial candidates.
//!
//! ## Bucket Organization
//!
//! Buckets are indexed by the number of leading zero bits in the XOR
//! distance between the base id and the node id:
//!
//! - Bucket 0: distance has 0 leading zeros (furthest, 50% of keyspace)
//! - Bucket 1: distance has 1 leading zero (25% of keyspace)
//! - ...
//! - Bucket 255: closest
//!
//! Ids are at most 32 bytes and may differ in length; shorter ids compare
//! as if zero-padded on the right.

use std::cmp::Ordering;

use crate::item::Node;

/// Nodes per bucket.
const BUCKET_CAPACITY: usize = 20;

/// One bucket per possible leading-zero count of a 32-byte distance.
const BUCKET_COUNT: usize = 256;

fn byte_at(id: &[u8], index: usize) -> u8 {
    id.get(index).copied().unwrap_or(0)
}

/// Compares two ids by XOR distance from `target`; ties break on raw id
/// bytes so the order is total.
pub fn distance_cmp(target: &[u8], a: &[u8], b: &[u8]) -> Ordering {
    let len = target.len().max(a.len()).max(b.len());
    for i in 0..len {
        let t = byte_at(target, i);
        let da = byte_at(a, i) ^ t;
        let db = byte_at(b, i) ^ t;
        match da.cmp(&db) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    a.cmp(b)
}

/// Ranks `candidates` by XOR distance to `target` and returns the closest
/// `count`, nearest first.
pub fn search(target: &[u8], candidates: &[Node], count: usize) -> Vec<Node> {
    if count == 0 || candidates.is_empty() {
        return Vec::new();
    }

    let mut ranked: Vec<&Node> = candidates.iter().collect();
    ranked.sort_by(|a, b| distance_cmp(target, &a.id, &b.id));
    ranked.into_iter().take(count).cloned().collect()
}

fn bucket_index(base: &[u8], id: &[u8]) -> usize {
    let len = base.len().max(id.len());
    for i in 0..len {
        let dist = byte_at(base, i) ^ byte_at(id, i);
        if dist != 0 {
            return (i * 8 + dist.leading_zeros() as usize).min(BUCKET_COUNT - 1);
        }
    }
    BUCKET_COUNT - 1
}

#[derive(Debug, Default)]
struct Bucket {
    // Ordered least- to most-recently live.
    nodes: Vec<Node>,
}

impl Bucket {
    fn position(&self, id: &[u8]) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    fn refresh(&mut self, node: Node) -> bool {
        if let Some(pos) = self.position(&node.id) {
            self.nodes.remove(pos);
            self.nodes.push(node);
            true
        } else {
            false
        }
    }
}

/// Known-node table bucketed by XOR distance from the base node's id.
///
/// `add` is polite and drops the newcomer when its bucket is full; `live`
/// records first-hand evidence and evicts the bucket's least-recently-live
/// node instead.
#[derive(Debug)]
pub struct RoutingTable {
    base_id: Vec<u8>,
    buckets: Vec<Bucket>,
    len: usize,
}

impl RoutingTable {
    pub fn new(base_id: Vec<u8>) -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        buckets.resize_with(BUCKET_COUNT, Bucket::default);
        Self { base_id, buckets, len: 0 }
    }

    pub fn base_id(&self) -> &[u8] {
        &self.base_id
    }

    /// Replaces the base id and re-buckets every stored node.
    pub fn set_base_id(&mut self, base_id: Vec<u8>) {
        if base_id == self.base_id {
            return;
        }
        let nodes: Vec<Node> = self
            .buckets
            .iter_mut()
            .flat_map(|bucket| bucket.nodes.drain(..))
            .collect();
        self.base_id = base_id;
        self.len = 0;
        for node in nodes {
            self.live(node);
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, id: &[u8]) -> bool {
        self.buckets[bucket_index(&self.base_id, id)]
            .position(id)
            .is_some()
    }

    /// Inserts a second-hand sighting. Refreshes an existing entry; a full
    /// bucket rejects the newcomer. Self-id and invalid descriptors are
    /// never stored.
    pub fn add(&mut self, node: Node) -> bool {
        if node.id == self.base_id || !node.is_valid() {
            return false;
        }
        let bucket = &mut self.buckets[bucket_index(&self.base_id, &node.id)];
        if bucket.refresh(node.clone()) {
            return true;
        }
        if bucket.nodes.len() >= BUCKET_CAPACITY {
            return false;
        }
        bucket.nodes.push(node);
        self.len += 1;
        true
    }

    /// Inserts first-hand evidence of a live node, evicting the bucket's
    /// least-recently-live entry when full.
    pub fn live(&mut self, node: Node) -> bool {
        if node.id == self.base_id || !node.is_valid() {
            return false;
        }
        let bucket = &mut self.buckets[bucket_index(&self.base_id, &node.id)];
        if bucket.refresh(node.clone()) {
            return true;
        }
        if bucket.nodes.len() >= BUCKET_CAPACITY {
            bucket.nodes.remove(0);
            self.len -= 1;
        }
        bucket.nodes.push(node);
        self.len += 1;
        true
    }

    pub fn remove(&mut self, id: &[u8]) -> bool {
        let bucket = &mut self.buckets[bucket_index(&self.base_id, id)];
        if let Some(pos) = bucket.position(id) {
            bucket.nodes.remove(pos);
            self.len -= 1;
            true
        } else {
            false
        }
    }

    /// Owned snapshot of every stored node, in bucket order. Callers that
    /// need random iteration shuffle the snapshot.
    pub fn nodes(&self) -> Vec<Node> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.nodes.iter().cloned())
            .collect()
    }
}
