//! # Per-Peer State Table
//!
//! Process-wide directory of [`PeerState`] keyed by node id. State is created
//! lazily on first lookup and survives session churn: a peer that reconnects
//! with the same session id resumes its record, one with a new session id is
//! wiped first.
//!
//! Two families of collections live on each state:
//!
//! - **Pull sets** (sliding 30 min TTL): what the remote announced or asked
//!   for. Written by inbound handlers, read by the scheduler.
//! - **Stock sets** (sliding 1 h TTL): what this side already sent, so the
//!   per-peer drain never repeats itself.
//!
//! Push queues (scheduler output awaiting drain) also live here so the whole
//! per-peer picture sits behind one lock; the scheduler replaces batch queues
//! wholesale, which keeps re-running a phase from growing them.
//!
//! The table is bounded: a periodic sweep trims every TTL set and, above
//! `MAX_PEER_STATE_COUNT` entries, evicts the least-recently-touched states
//! that are not protected by a live session.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::item::{now_ms, Key, Signer, Tag};
use crate::volatile::VolatileSet;

/// Entries kept after a capacity cull.
pub const MAX_PEER_STATE_COUNT: usize = 128;

/// Sliding window for pull sets (what the remote announced/requested).
const PULL_SET_SURVIVAL: Duration = Duration::from_secs(30 * 60);

/// Sliding window for stock sets (what this side already sent).
const STOCK_SET_SURVIVAL: Duration = Duration::from_secs(60 * 60);

/// State for one remote node, live or not.
pub struct PeerState {
    pub session_id: Vec<u8>,
    pub priority: i64,
    pub last_pull_time_ms: u64,
    /// Cumulative byte counts folded in when a session closes.
    pub received_byte_count: u64,
    pub sent_byte_count: u64,

    pub stock_blocks: VolatileSet<Key>,
    pub stock_broadcast_metadatas: VolatileSet<[u8; 32]>,
    pub stock_unicast_metadatas: VolatileSet<[u8; 32]>,
    pub stock_multicast_metadatas: VolatileSet<[u8; 32]>,
    pub pull_block_links: VolatileSet<Key>,
    pub pull_block_requests: VolatileSet<Key>,
    pub pull_broadcast_metadata_requests: VolatileSet<Signer>,
    pub pull_unicast_metadata_requests: VolatileSet<Signer>,
    pub pull_multicast_metadata_requests: VolatileSet<Tag>,

    pub push_block_links: HashSet<Key>,
    pub push_block_requests: HashSet<Key>,
    pub push_broadcast_metadata_requests: HashSet<Signer>,
    pub push_unicast_metadata_requests: HashSet<Signer>,
    pub push_multicast_metadata_requests: HashSet<Tag>,
    pub diffusion_blocks: VecDeque<Key>,
    pub upload_blocks: VecDeque<Key>,

    last_touch: Instant,
}

impl PeerState {
    fn new() -> Self {
        Self::with_survival(PULL_SET_SURVIVAL, STOCK_SET_SURVIVAL)
    }

    fn with_survival(pull: Duration, stock: Duration) -> Self {
        Self {
            session_id: Vec::new(),
            priority: 0,
            last_pull_time_ms: now_ms(),
            received_byte_count: 0,
            sent_byte_count: 0,
            stock_blocks: VolatileSet::new(stock),
            stock_broadcast_metadatas: VolatileSet::new(stock),
            stock_unicast_metadatas: VolatileSet::new(stock),
            stock_multicast_metadatas: VolatileSet::new(stock),
            pull_block_links: VolatileSet::new(pull),
            pull_block_requests: VolatileSet::new(pull),
            pull_broadcast_metadata_requests: VolatileSet::new(pull),
            pull_unicast_metadata_requests: VolatileSet::new(pull),
            pull_multicast_metadata_requests: VolatileSet::new(pull),
            push_block_links: HashSet::new(),
            push_block_requests: HashSet::new(),
            push_broadcast_metadata_requests: HashSet::new(),
            push_unicast_metadata_requests: HashSet::new(),
            push_multicast_metadata_requests: HashSet::new(),
            diffusion_blocks: VecDeque::new(),
            upload_blocks: VecDeque::new(),
            last_touch: Instant::now(),
        }
    }

    /// Queues a key for diffusion push unless it is already queued.
    pub fn enqueue_diffusion_block(&mut self, key: Key) -> bool {
        if self.diffusion_blocks.contains(&key) {
            return false;
        }
        self.diffusion_blocks.push_back(key);
        true
    }

    /// Trims every TTL set.
    pub fn trim(&mut self) {
        self.stock_blocks.trim();
        self.stock_broadcast_metadatas.trim();
        self.stock_unicast_metadatas.trim();
        self.stock_multicast_metadatas.trim();
        self.pull_block_links.trim();
        self.pull_block_requests.trim();
        self.pull_broadcast_metadata_requests.trim();
        self.pull_unicast_metadata_requests.trim();
        self.pull_multicast_metadata_requests.trim();
    }
}

/// Directory of per-peer state, bounded and self-expiring.
pub struct PeerStateTable {
    states: HashMap<Vec<u8>, PeerState>,
}

impl PeerStateTable {
    pub fn new() -> Self {
        Self { states: HashMap::new() }
    }

    /// Looks a state up, creating it on first contact. Stamps the touch time
    /// used by the capacity cull.
    pub fn state(&mut self, id: &[u8]) -> &mut PeerState {
        let state = self
            .states
            .entry(id.to_vec())
            .or_insert_with(PeerState::new);
        state.last_touch = Instant::now();
        state
    }

    /// Like [`state`](Self::state), but wipes a surviving record whose
    /// session id differs from `session_id` before stamping the new one.
    pub fn state_for_session(&mut self, id: &[u8], session_id: &[u8]) -> &mut PeerState {
        if self
            .states
            .get(id)
            .is_some_and(|s| !s.session_id.is_empty() && s.session_id != session_id)
        {
            self.states.remove(id);
        }
        let state = self.state(id);
        state.session_id = session_id.to_vec();
        state.last_pull_time_ms = now_ms();
        state
    }

    pub fn get(&self, id: &[u8]) -> Option<&PeerState> {
        self.states.get(id)
    }

    pub fn remove(&mut self, id: &[u8]) -> Option<PeerState> {
        self.states.remove(id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Iterates every state without stamping touch times.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Vec<u8>, &mut PeerState)> {
        self.states.iter_mut()
    }

    /// Trim sweep plus capacity cull. Over `MAX_PEER_STATE_COUNT` entries,
    /// the least-recently-touched states outside `protected` are dropped
    /// until the table fits.
    pub fn sweep(&mut self, protected: &HashSet<Vec<u8>>) {
        for state in self.states.values_mut() {
            state.trim();
        }

        if self.states.len() <= MAX_PEER_STATE_COUNT {
            return;
        }

        let mut evictable: Vec<(Vec<u8>, Instant)> = self
            .states
            .iter()
            .filter(|(id, _)| !protected.contains(*id))
            .map(|(id, state)| (id.clone(), state.last_touch))
            .collect();
        evictable.sort_by_key(|(_, touch)| *touch);

        let excess = self.states.len() - MAX_PEER_STATE_COUNT;
        for (id, _) in evictable.into_iter().take(excess) {
            self.states.remove(&id);
        }
    }
}

impl Default for PeerStateTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::HashAlgorithm;

    fn test_key(seed: u8) -> Key {
        Key::new(HashAlgorithm::Blake3, [seed; 32])
    }

    #[test]
    fn lazy_creation_reuses_state() {
        let mut table = PeerStateTable::new();

        table.state(b"peer-a").priority = 7;
        assert_eq!(table.len(), 1);
        assert_eq!(table.state(b"peer-a").priority, 7);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn session_change_wipes_the_record() {
        let mut table = PeerStateTable::new();

        {
            let state = table.state_for_session(b"peer-a", b"session-1");
            state.priority = 9;
            state.pull_block_requests.insert(test_key(1));
        }

        // Same session id resumes the record.
        let resumed = table.state_for_session(b"peer-a", b"session-1");
        assert_eq!(resumed.priority, 9);
        assert!(resumed.pull_block_requests.contains(&test_key(1)));

        // A different session id starts fresh.
        let fresh = table.state_for_session(b"peer-a", b"session-2");
        assert_eq!(fresh.priority, 0);
        assert!(!fresh.pull_block_requests.contains(&test_key(1)));
        assert_eq!(fresh.session_id, b"session-2");
    }

    #[test]
    fn cull_evicts_least_recently_touched() {
        let mut table = PeerStateTable::new();

        table.state(b"old-1");
        table.state(b"old-2");
        std::thread::sleep(Duration::from_millis(10));
        for i in 0..MAX_PEER_STATE_COUNT {
            table.state(format!("peer-{i}").as_bytes());
        }
        assert_eq!(table.len(), MAX_PEER_STATE_COUNT + 2);

        table.sweep(&HashSet::new());

        assert_eq!(table.len(), MAX_PEER_STATE_COUNT);
        assert!(table.get(b"old-1").is_none());
        assert!(table.get(b"old-2").is_none());
        assert!(table.get(b"peer-0").is_some());
    }

    #[test]
    fn protected_states_survive_cull() {
        let mut table = PeerStateTable::new();

        table.state(b"old-live");
        table.state(b"old-idle");
        std::thread::sleep(Duration::from_millis(10));
        for i in 0..MAX_PEER_STATE_COUNT {
            table.state(format!("peer-{i}").as_bytes());
        }

        let protected: HashSet<Vec<u8>> = [b"old-live".to_vec()].into();
        table.sweep(&protected);

        assert!(table.get(b"old-live").is_some());
        assert!(table.get(b"old-idle").is_none());
    }

    #[test]
    fn sweep_trims_expired_set_entries() {
        let mut state = PeerState::with_survival(
            Duration::from_millis(30),
            Duration::from_millis(30),
        );
        state.pull_block_links.insert(test_key(1));
        state.stock_blocks.insert(test_key(2));

        std::thread::sleep(Duration::from_millis(50));
        state.trim();

        assert!(state.pull_block_links.is_empty());
        assert!(state.stock_blocks.is_empty());
    }

    #[test]
    fn diffusion_queue_deduplicates() {
        let mut table = PeerStateTable::new();
        let state = table.state(b"peer-a");

        assert!(state.enqueue_diffusion_block(test_key(1)));
        assert!(!state.enqueue_diffusion_block(test_key(1)));
        assert!(state.enqueue_diffusion_block(test_key(2)));
        assert_eq!(state.diffusion_blocks.len(), 2);
    }
}
