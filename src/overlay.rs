//! Connection orchestration: dialing, admission, scheduling, and exchange.
//!
//! The overlay owns every live [`Session`] plus the bookkeeping that decides
//! which peer is told what. Three long-lived tasks drive it:
//!
//! | Task | Cadence | Work |
//! |------|---------|------|
//! | connect loop | 1s | dials one eligible node while below the outbound limit |
//! | accept loop | per connection | admits inbound sessions below the inbound limit |
//! | scheduler | 1s | runs the phases below when they come due |
//!
//! Scheduler phases:
//!
//! | Phase | Cadence | Work |
//! |-------|---------|------|
//! | trim | 5s | expire volatile entries everywhere |
//! | sweep | 30s | drop state for peers that are gone |
//! | mediation | 5min | step live peer priorities back toward the band |
//! | health check | 5min | disconnect the lowest ranked peer when crowded |
//! | trust refresh | 30s | re-pin the metadata index to the trust oracle |
//! | diffusion | 60s | hand stored blocks to the nearest connected peer |
//! | upload | 10s | queue requested blocks per peer |
//! | download | 60s | assign link and request announcements by distance |
//! | metadata upload | 3min | seed our records toward their natural holders |
//! | metadata download | 60s | route wanted record requests by distance |
//!
//! Each registered peer additionally gets a drain task that turns the
//! per-peer queues in `PeerState` into outgoing frames, paced per kind.
//!
//! Lock discipline: `Core` sits behind one std mutex and is never held
//! across an await. Phases snapshot under the lock, do their async work,
//! then re-lock to apply the result.

use std::{
    collections::{HashMap, HashSet},
    mem,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use rand::{seq::SliceRandom, thread_rng, Rng};
use tokio::{
    sync::{mpsc, Mutex as TokioMutex},
    task::JoinHandle,
    time::{interval, sleep, timeout, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};

use crate::{
    index::MetadataIndex,
    item::{
        now_ms, short_hex, BroadcastMetadata, CertificateError, Key, MulticastMetadata, Node,
        Signer, Tag, UnicastMetadata,
    },
    kademlia::{self, RoutingTable},
    session::{Direction, Session, SessionEvents},
    state::PeerStateTable,
    store::{BlockStore, TrustOracle},
    transport::{Acceptor, Connector},
    volatile::VolatileSet,
    wire,
};

/// Below this many peers diffusion stays off; the network is too small to
/// shed responsibility without losing reach.
const MIN_DIFFUSION_PEERS: usize = 12;
/// Below this many peers the block and metadata exchange phases stay off.
const MIN_EXCHANGE_PEERS: usize = 3;
/// Routing entries are only evicted on failure once the table holds more
/// than this many nodes.
const ROUTE_HOLD_COUNT: usize = 100;
/// How many of a node's URIs one connect attempt will try.
const MAX_DIAL_URI_COUNT: usize = 12;
/// Per-frame intake cap for learned nodes.
const NODE_INTAKE_COUNT: usize = 128;
/// How many proven-reachable nodes lead a node push.
const PREFERRED_NODE_COUNT: usize = 64;
/// Total nodes per node push.
const NODE_PUSH_COUNT: usize = 128;
/// Keys sampled from each pending set per diffusion pass.
const DIFFUSION_SAMPLE_COUNT: usize = 256;
/// Hard cap on blocks held for onward diffusion; overflow is evicted at
/// random.
const PENDING_DIFFUSION_CAP: usize = 10_000;
/// Blocks queued per peer per upload pass.
const UPLOAD_BATCH_COUNT: usize = 128;
/// Own wanted keys considered per download pass.
const REQUEST_POOL_CAP: usize = 2048;
/// Relayed announcements are spread over peers at this fan-out factor.
const LINK_FAN_FACTOR: usize = 8;
/// Priorities outside [-band, band] are stepped back by mediation.
const PRIORITY_BAND: i64 = 32;
/// Upload throttle: send chance is (priority + offset) / range.
const UPLOAD_PRIORITY_OFFSET: i64 = 256;
const UPLOAD_PRIORITY_RANGE: f64 = 512.0;

const WAITING_SURVIVAL: Duration = Duration::from_secs(30);
const CUTTING_SURVIVAL: Duration = Duration::from_secs(10 * 60);
const REMOVED_SURVIVAL: Duration = Duration::from_secs(30 * 60);
const SUCCEEDED_URI_SURVIVAL: Duration = Duration::from_secs(60 * 60);
const PENDING_DOWNLOAD_SURVIVAL: Duration = Duration::from_secs(30 * 60);
const WANTED_METADATA_SURVIVAL: Duration = Duration::from_secs(3 * 60);
const RELAY_BLOCK_SURVIVAL: Duration = Duration::from_secs(30 * 60);

type TakeOnce<T> = TokioMutex<Option<mpsc::UnboundedReceiver<T>>>;

/// Cadences for the overlay's periodic work. Defaults match the wire
/// protocol's pacing; tests shrink them to milliseconds.
#[derive(Clone, Debug)]
pub struct OverlayConfig {
    /// Total session budget, split half outbound, half inbound (inbound
    /// gets the odd slot).
    pub connection_limit: usize,
    pub dial_timeout: Duration,
    pub connect_tick: Duration,
    pub scheduler_tick: Duration,
    pub drain_tick: Duration,
    pub trim_interval: Duration,
    pub sweep_interval: Duration,
    pub mediation_interval: Duration,
    pub health_check_interval: Duration,
    pub trust_refresh_interval: Duration,
    pub diffusion_interval: Duration,
    pub upload_interval: Duration,
    pub download_interval: Duration,
    pub metadata_upload_interval: Duration,
    pub metadata_download_interval: Duration,
    pub drain_node_interval: Duration,
    pub drain_batch_interval: Duration,
    pub drain_block_interval: Duration,
    pub drain_metadata_interval: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            connection_limit: 32,
            dial_timeout: Duration::from_secs(10),
            connect_tick: Duration::from_secs(1),
            scheduler_tick: Duration::from_secs(1),
            drain_tick: Duration::from_secs(1),
            trim_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(30),
            mediation_interval: Duration::from_secs(5 * 60),
            health_check_interval: Duration::from_secs(5 * 60),
            trust_refresh_interval: Duration::from_secs(30),
            diffusion_interval: Duration::from_secs(60),
            upload_interval: Duration::from_secs(10),
            download_interval: Duration::from_secs(60),
            metadata_upload_interval: Duration::from_secs(3 * 60),
            metadata_download_interval: Duration::from_secs(60),
            drain_node_interval: Duration::from_secs(3 * 60),
            drain_batch_interval: Duration::from_secs(60),
            drain_block_interval: Duration::from_secs(5),
            drain_metadata_interval: Duration::from_secs(60),
        }
    }
}

/// Point-in-time totals across the whole overlay.
#[derive(Clone, Debug, Default)]
pub struct OverlayInfo {
    pub connected_peer_count: usize,
    pub outbound_peer_count: usize,
    pub inbound_peer_count: usize,
    pub routing_node_count: usize,
    pub metadata_count: usize,
    pub pending_download_count: usize,
    pub pending_upload_count: usize,
    pub pending_diffusion_count: usize,
    pub sent_byte_count: u64,
    pub received_byte_count: u64,
    pub connect_count: u64,
    pub accept_count: u64,
    pub push_node_count: u64,
    pub pull_node_count: u64,
    pub push_block_link_count: u64,
    pub pull_block_link_count: u64,
    pub push_block_request_count: u64,
    pub pull_block_request_count: u64,
    pub push_block_count: u64,
    pub pull_block_count: u64,
    pub push_metadata_request_count: u64,
    pub pull_metadata_request_count: u64,
    pub push_metadata_count: u64,
    pub pull_metadata_count: u64,
    pub relay_block_count: u64,
}

/// Point-in-time view of one live session.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub node: Node,
    pub uri: String,
    pub direction: Direction,
    pub priority: i64,
    pub round_trip_time: Option<Duration>,
    pub sent_byte_count: u64,
    pub received_byte_count: u64,
}

#[derive(Default)]
struct Counters {
    connect: AtomicU64,
    accept: AtomicU64,
    push_node: AtomicU64,
    pull_node: AtomicU64,
    push_block_link: AtomicU64,
    pull_block_link: AtomicU64,
    push_block_request: AtomicU64,
    pull_block_request: AtomicU64,
    push_block: AtomicU64,
    pull_block: AtomicU64,
    push_metadata_request: AtomicU64,
    pull_metadata_request: AtomicU64,
    push_metadata: AtomicU64,
    pull_metadata: AtomicU64,
    relay_block: AtomicU64,
}

struct PeerHandle {
    session: Arc<Session>,
    /// Set when we dropped the peer on purpose; suppresses the cutting
    /// re-dial hint on unregister.
    evicted: bool,
    tasks: Vec<JoinHandle<()>>,
}

/// Everything the scheduler mutates, behind one lock.
struct Core {
    base_node: Node,
    routing: RoutingTable,
    states: PeerStateTable,
    index: MetadataIndex,
    sessions: HashMap<Vec<u8>, PeerHandle>,
    /// Ids with a dial in flight right now.
    connecting: HashSet<Vec<u8>>,
    /// Ids dialed recently; not retried until the entry expires.
    waiting: VolatileSet<Vec<u8>>,
    /// Nodes that dropped without being evicted; preferred dial targets.
    cutting: VolatileSet<Node>,
    /// Nodes that failed every URI; refused inbound and skipped outbound.
    removed: VolatileSet<Node>,
    /// URIs that completed a handshake recently.
    succeeded_uris: VolatileSet<String>,
    pending_download: VolatileSet<Key>,
    pending_upload: HashSet<Key>,
    pending_diffusion: HashSet<Key>,
    wanted_broadcasts: VolatileSet<Signer>,
    wanted_unicasts: VolatileSet<Signer>,
    wanted_multicasts: VolatileSet<Tag>,
    /// Keys another peer asked us for; sending one of these counts as a
    /// relay.
    relay_blocks: VolatileSet<Key>,
    /// Byte totals folded in from sessions that already closed.
    sent_total: u64,
    received_total: u64,
}

struct Inner {
    config: OverlayConfig,
    store: Arc<dyn BlockStore>,
    trust: Arc<dyn TrustOracle>,
    connector: Arc<dyn Connector>,
    acceptor: Arc<dyn Acceptor>,
    running: AtomicBool,
    trust_refreshing: AtomicBool,
    core: StdMutex<Core>,
    counters: Counters,
    uploaded_tx: mpsc::UnboundedSender<Key>,
    uploaded_rx: TakeOnce<Key>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// The peer-to-peer exchange engine: block distribution, signed metadata
/// replication, and the connection management underneath both.
#[derive(Clone)]
pub struct Overlay {
    inner: Arc<Inner>,
}

impl Overlay {
    pub fn new(
        config: OverlayConfig,
        base_node: Node,
        store: Arc<dyn BlockStore>,
        trust: Arc<dyn TrustOracle>,
        connector: Arc<dyn Connector>,
        acceptor: Arc<dyn Acceptor>,
    ) -> Self {
        let (uploaded_tx, uploaded_rx) = mpsc::unbounded_channel();
        let core = Core {
            routing: RoutingTable::new(base_node.id.clone()),
            base_node,
            states: PeerStateTable::new(),
            index: MetadataIndex::new(),
            sessions: HashMap::new(),
            connecting: HashSet::new(),
            waiting: VolatileSet::new(WAITING_SURVIVAL),
            cutting: VolatileSet::new(CUTTING_SURVIVAL),
            removed: VolatileSet::new(REMOVED_SURVIVAL),
            succeeded_uris: VolatileSet::new(SUCCEEDED_URI_SURVIVAL),
            pending_download: VolatileSet::new(PENDING_DOWNLOAD_SURVIVAL),
            pending_upload: HashSet::new(),
            pending_diffusion: HashSet::new(),
            wanted_broadcasts: VolatileSet::new(WANTED_METADATA_SURVIVAL),
            wanted_unicasts: VolatileSet::new(WANTED_METADATA_SURVIVAL),
            wanted_multicasts: VolatileSet::new(WANTED_METADATA_SURVIVAL),
            relay_blocks: VolatileSet::new(RELAY_BLOCK_SURVIVAL),
            sent_total: 0,
            received_total: 0,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                trust,
                connector,
                acceptor,
                running: AtomicBool::new(false),
                trust_refreshing: AtomicBool::new(false),
                core: StdMutex::new(core),
                counters: Counters::default(),
                uploaded_tx,
                uploaded_rx: TokioMutex::new(Some(uploaded_rx)),
                tasks: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// Spawns the connect, accept, and scheduler tasks. Must be called
    /// from within a tokio runtime. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let base = self.inner.lock_core().base_node.clone();
        {
            let mut tasks = guard(&self.inner.tasks);
            tasks.push(tokio::spawn(Arc::clone(&self.inner).connect_loop()));
            tasks.push(tokio::spawn(Arc::clone(&self.inner).accept_loop()));
            tasks.push(tokio::spawn(Arc::clone(&self.inner).scheduler_loop()));
        }
        info!(peer = %short_hex(&base.id), "overlay started");
    }

    /// Stops all tasks and closes every session. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = mem::take(&mut *guard(&self.inner.tasks));
        for task in &tasks {
            task.abort();
        }
        let (sessions, peer_tasks) = {
            let mut core = self.inner.lock_core();
            let drained: Vec<PeerHandle> = core.sessions.drain().map(|(_, handle)| handle).collect();
            let mut sessions = Vec::with_capacity(drained.len());
            let mut peer_tasks = Vec::new();
            for handle in drained {
                core.sent_total += handle.session.sent_byte_count();
                core.received_total += handle.session.received_byte_count();
                sessions.push(handle.session);
                peer_tasks.extend(handle.tasks);
            }
            (sessions, peer_tasks)
        };
        for session in &sessions {
            session.close().await;
        }
        for task in peer_tasks {
            task.abort();
        }
        info!("overlay stopped");
    }

    /// Marks `key` wanted. The download scheduler routes requests for it
    /// until a copy arrives or the interest expires.
    pub fn download(&self, key: Key) {
        self.inner.lock_core().pending_download.insert(key);
    }

    /// Marks `key` (already present in the block store) for upload. The
    /// diffusion scheduler hands it toward its natural holders.
    pub fn upload(&self, key: Key) {
        self.inner.lock_core().pending_upload.insert(key);
    }

    pub fn is_download_waiting(&self, key: &Key) -> bool {
        self.inner.lock_core().pending_download.contains(key)
    }

    pub fn is_upload_waiting(&self, key: &Key) -> bool {
        let core = self.inner.lock_core();
        core.pending_upload.contains(key) || core.pending_diffusion.contains(key)
    }

    /// Replaces our own descriptor, rekeying the routing table to the new
    /// id. Used once the listen URI is known.
    pub fn set_base_node(&self, node: Node) {
        let mut core = self.inner.lock_core();
        core.routing.set_base_id(node.id.clone());
        core.base_node = node;
    }

    pub fn base_node(&self) -> Node {
        self.inner.lock_core().base_node.clone()
    }

    /// Seeds the routing table, typically with bootstrap nodes. Invalid
    /// and unroutable descriptors are skipped.
    pub fn set_other_nodes(&self, nodes: Vec<Node>) {
        let mut core = self.inner.lock_core();
        for node in nodes {
            if node.is_valid() && node.is_routable() {
                core.routing.add(node);
            }
        }
    }

    pub fn upload_broadcast_metadata(
        &self,
        metadata: BroadcastMetadata,
    ) -> Result<bool, CertificateError> {
        self.inner.lock_core().index.set_broadcast_metadata(metadata)
    }

    pub fn upload_unicast_metadata(
        &self,
        metadata: UnicastMetadata,
    ) -> Result<bool, CertificateError> {
        self.inner.lock_core().index.set_unicast_metadata(metadata)
    }

    pub fn upload_multicast_metadata(
        &self,
        metadata: MulticastMetadata,
    ) -> Result<bool, CertificateError> {
        self.inner.lock_core().index.set_multicast_metadata(metadata)
    }

    /// Local lookup that also registers interest: the signer joins the
    /// wanted set so the next metadata download pass requests it from the
    /// network.
    pub fn broadcast_metadata(&self, signer: &Signer, type_name: &str) -> Option<BroadcastMetadata> {
        let mut core = self.inner.lock_core();
        core.wanted_broadcasts.insert(signer.clone());
        core.index.broadcast_metadata(signer, type_name)
    }

    pub fn unicast_metadatas(&self, target: &Signer, type_name: &str) -> Vec<UnicastMetadata> {
        let mut core = self.inner.lock_core();
        core.wanted_unicasts.insert(target.clone());
        core.index.unicast_metadatas(target, type_name)
    }

    pub fn multicast_metadatas(&self, tag: &Tag, type_name: &str) -> Vec<MulticastMetadata> {
        let mut core = self.inner.lock_core();
        core.wanted_multicasts.insert(tag.clone());
        core.index.multicast_metadatas(tag, type_name)
    }

    /// Takes the upload notification stream. Yields each key whose upload
    /// responsibility was handed to another peer. Returns `None` after the
    /// first call.
    pub async fn block_uploaded(&self) -> Option<mpsc::UnboundedReceiver<Key>> {
        self.inner.uploaded_rx.lock().await.take()
    }

    pub fn info(&self) -> OverlayInfo {
        let core = self.inner.lock_core();
        let counters = &self.inner.counters;
        let mut sent = core.sent_total;
        let mut received = core.received_total;
        let mut outbound = 0;
        let mut inbound = 0;
        for handle in core.sessions.values() {
            sent += handle.session.sent_byte_count();
            received += handle.session.received_byte_count();
            match handle.session.direction() {
                Direction::Out => outbound += 1,
                Direction::In => inbound += 1,
            }
        }
        OverlayInfo {
            connected_peer_count: core.sessions.len(),
            outbound_peer_count: outbound,
            inbound_peer_count: inbound,
            routing_node_count: core.routing.len(),
            metadata_count: core.index.count(),
            pending_download_count: core.pending_download.len(),
            pending_upload_count: core.pending_upload.len(),
            pending_diffusion_count: core.pending_diffusion.len(),
            sent_byte_count: sent,
            received_byte_count: received,
            connect_count: counters.connect.load(Ordering::Relaxed),
            accept_count: counters.accept.load(Ordering::Relaxed),
            push_node_count: counters.push_node.load(Ordering::Relaxed),
            pull_node_count: counters.pull_node.load(Ordering::Relaxed),
            push_block_link_count: counters.push_block_link.load(Ordering::Relaxed),
            pull_block_link_count: counters.pull_block_link.load(Ordering::Relaxed),
            push_block_request_count: counters.push_block_request.load(Ordering::Relaxed),
            pull_block_request_count: counters.pull_block_request.load(Ordering::Relaxed),
            push_block_count: counters.push_block.load(Ordering::Relaxed),
            pull_block_count: counters.pull_block.load(Ordering::Relaxed),
            push_metadata_request_count: counters.push_metadata_request.load(Ordering::Relaxed),
            pull_metadata_request_count: counters.pull_metadata_request.load(Ordering::Relaxed),
            push_metadata_count: counters.push_metadata.load(Ordering::Relaxed),
            pull_metadata_count: counters.pull_metadata.load(Ordering::Relaxed),
            relay_block_count: counters.relay_block.load(Ordering::Relaxed),
        }
    }

    pub fn connection_info(&self) -> Vec<ConnectionInfo> {
        let core = self.inner.lock_core();
        core.sessions
            .values()
            .map(|handle| {
                let session = &handle.session;
                let state = core.states.get(&session.remote_node().id);
                ConnectionInfo {
                    node: session.remote_node().clone(),
                    uri: session.uri().to_string(),
                    direction: session.direction(),
                    priority: state.map(|state| state.priority).unwrap_or_default(),
                    round_trip_time: session.round_trip_time(),
                    sent_byte_count: session.sent_byte_count(),
                    received_byte_count: session.received_byte_count(),
                }
            })
            .collect()
    }
}

impl Inner {
    fn lock_core(&self) -> MutexGuard<'_, Core> {
        guard(&self.core)
    }

    // ------------------------------------------------------------------
    // Connection management
    // ------------------------------------------------------------------

    async fn connect_loop(self: Arc<Self>) {
        let mut tick = interval(self.config.connect_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while self.running.load(Ordering::SeqCst) {
            tick.tick().await;
            self.connect_once().await;
        }
    }

    async fn connect_once(self: &Arc<Self>) {
        let Some(node) = self.pick_dial_target() else {
            return;
        };
        self.counters.connect.fetch_add(1, Ordering::Relaxed);

        let mut uris: Vec<String> = node.uris.iter().take(MAX_DIAL_URI_COUNT).cloned().collect();
        uris.shuffle(&mut thread_rng());
        {
            // Proven URIs first; stable sort keeps the shuffle inside each
            // group.
            let core = self.lock_core();
            uris.sort_by_key(|uri| !core.succeeded_uris.contains(uri));
        }

        let mut registered = false;
        for uri in &uris {
            match self.dial(&node, uri).await {
                Ok(_) => {
                    registered = true;
                    break;
                }
                Err(error) => {
                    trace!(peer = %short_hex(&node.id), %uri, %error, "dial failed");
                }
            }
        }

        let mut core = self.lock_core();
        core.connecting.remove(&node.id);
        if !registered {
            remove_node(&mut core, &node);
            debug!(peer = %short_hex(&node.id), "every dial attempt failed");
        }
    }

    fn pick_dial_target(&self) -> Option<Node> {
        let mut core = self.lock_core();
        let outbound = core
            .sessions
            .values()
            .filter(|handle| handle.session.direction() == Direction::Out)
            .count()
            + core.connecting.len();
        if outbound >= self.config.connection_limit / 2 {
            return None;
        }
        // Recently dropped peers are re-dialed before anyone else.
        let mut pool = core.cutting.snapshot();
        retain_eligible(&core, &mut pool);
        if pool.is_empty() {
            pool = core.routing.nodes();
            retain_eligible(&core, &mut pool);
        }
        let node = pool.choose(&mut thread_rng()).cloned()?;
        core.connecting.insert(node.id.clone());
        core.waiting.insert(node.id.clone());
        Some(node)
    }

    /// Dials one URI and registers the resulting session. `Ok` means the
    /// handshake completed; the node stays in good standing even if
    /// registration then declined the session.
    async fn dial(self: &Arc<Self>, node: &Node, uri: &str) -> Result<bool> {
        let stream = timeout(self.config.dial_timeout, self.connector.connect(uri))
            .await
            .context("dial timed out")??;
        let base_node = self.lock_core().base_node.clone();
        let (session, events) =
            Session::connect(stream, uri.to_string(), base_node, Direction::Out).await?;
        self.lock_core().succeeded_uris.insert(uri.to_string());
        if session.remote_node().id != node.id {
            trace!(
                peer = %short_hex(&node.id),
                actual = %short_hex(&session.remote_node().id),
                "peer answered with a different id"
            );
        }
        Ok(self.register(session, events).await)
    }

    async fn accept_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            match self.acceptor.accept().await {
                Ok((stream, uri)) => {
                    let inbound = self
                        .lock_core()
                        .sessions
                        .values()
                        .filter(|handle| handle.session.direction() == Direction::In)
                        .count();
                    if inbound >= (self.config.connection_limit + 1) / 2 {
                        trace!(%uri, "inbound connection refused, limit reached");
                        continue;
                    }
                    self.counters.accept.fetch_add(1, Ordering::Relaxed);
                    let inner = Arc::clone(&self);
                    tokio::spawn(async move {
                        let base_node = inner.lock_core().base_node.clone();
                        match Session::connect(stream, uri.clone(), base_node, Direction::In).await
                        {
                            Ok((session, events)) => {
                                inner.register(session, events).await;
                            }
                            Err(error) => debug!(%uri, %error, "inbound handshake failed"),
                        }
                    });
                }
                Err(error) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(%error, "accept failed");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Admits a handshaken session: binds its state, joins the routing
    /// table, and spawns the event and drain tasks. Returns false when the
    /// session was refused and closed instead.
    async fn register(self: &Arc<Self>, session: Session, events: SessionEvents) -> bool {
        let session = Arc::new(session);
        let node = session.remote_node().clone();
        let refusal = {
            let mut core = self.lock_core();
            let refusal = self.admission_refusal(&core, &session, &node);
            if refusal.is_none() {
                core.states
                    .state_for_session(&node.id, session.receive_session_id());
                if node.is_routable() {
                    // A completed handshake is first-hand evidence, strong
                    // enough to evict a stale entry from a full bucket.
                    core.routing.live(node.clone());
                }
                core.cutting.remove(&node);
                let mut handle = PeerHandle {
                    session: Arc::clone(&session),
                    evicted: false,
                    tasks: Vec::with_capacity(2),
                };
                handle.tasks.push(tokio::spawn(
                    Arc::clone(self).peer_events_loop(Arc::clone(&session), events),
                ));
                handle.tasks.push(tokio::spawn(
                    Arc::clone(self).peer_drain_loop(Arc::clone(&session)),
                ));
                core.sessions.insert(node.id.clone(), handle);
            }
            refusal
        };
        match refusal {
            Some(reason) => {
                debug!(
                    peer = %short_hex(&node.id),
                    direction = %session.direction(),
                    reason,
                    "refusing session"
                );
                session.close().await;
                false
            }
            None => {
                info!(
                    peer = %short_hex(&node.id),
                    direction = %session.direction(),
                    uri = %session.uri(),
                    "peer connected"
                );
                true
            }
        }
    }

    fn admission_refusal(
        &self,
        core: &Core,
        session: &Session,
        node: &Node,
    ) -> Option<&'static str> {
        if node.id == core.base_node.id {
            return Some("session with ourselves");
        }
        if core.sessions.contains_key(&node.id) {
            return Some("peer already connected");
        }
        if session.direction() == Direction::In && core.removed.contains(node) {
            return Some("peer was recently removed");
        }
        let same_direction = core
            .sessions
            .values()
            .filter(|handle| handle.session.direction() == session.direction())
            .count();
        let cap = match session.direction() {
            Direction::Out => self.config.connection_limit / 2,
            Direction::In => (self.config.connection_limit + 1) / 2,
        };
        if same_direction >= cap {
            return Some("connection limit reached");
        }
        None
    }

    /// Tears one session out of the overlay, folding its byte counters
    /// into the running totals. Peers that were not evicted on purpose
    /// become preferred re-dial targets.
    async fn unregister(self: &Arc<Self>, session: &Arc<Session>) {
        let node = session.remote_node().clone();
        let handle = {
            let mut core = self.lock_core();
            let matching = core
                .sessions
                .get(&node.id)
                .is_some_and(|handle| Arc::ptr_eq(&handle.session, session));
            if matching {
                core.sessions.remove(&node.id)
            } else {
                None
            }
        };
        session.close().await;
        let Some(handle) = handle else {
            return;
        };
        {
            let mut core = self.lock_core();
            let sent = session.sent_byte_count();
            let received = session.received_byte_count();
            core.sent_total += sent;
            core.received_total += received;
            let state = core.states.state(&node.id);
            state.sent_byte_count += sent;
            state.received_byte_count += received;
            if !handle.evicted {
                core.cutting.insert(node.clone());
            }
        }
        info!(
            peer = %short_hex(&node.id),
            direction = %session.direction(),
            "peer disconnected"
        );
        // Handles are dropped, not aborted: the loops exit on their own
        // once the session is closed.
        drop(handle);
    }

    // ------------------------------------------------------------------
    // Per-peer tasks
    // ------------------------------------------------------------------

    async fn peer_events_loop(self: Arc<Self>, session: Arc<Session>, mut events: SessionEvents) {
        let peer = session.remote_node().id.clone();
        loop {
            tokio::select! {
                _ = &mut events.closed => break,
                maybe = events.nodes.recv() => match maybe {
                    Some(nodes) => self.on_nodes(&peer, nodes),
                    None => break,
                },
                maybe = events.block_links.recv() => match maybe {
                    Some(keys) => self.on_block_links(&peer, keys),
                    None => break,
                },
                maybe = events.block_requests.recv() => match maybe {
                    Some(keys) => self.on_block_requests(&peer, keys),
                    None => break,
                },
                maybe = events.blocks.recv() => match maybe {
                    Some((key, payload)) => self.on_block(&peer, key, payload).await,
                    None => break,
                },
                maybe = events.broadcast_metadata_requests.recv() => match maybe {
                    Some(signers) => self.on_broadcast_metadata_requests(&peer, signers),
                    None => break,
                },
                maybe = events.broadcast_metadatas.recv() => match maybe {
                    Some(records) => self.on_broadcast_metadatas(&peer, records),
                    None => break,
                },
                maybe = events.unicast_metadata_requests.recv() => match maybe {
                    Some(signers) => self.on_unicast_metadata_requests(&peer, signers),
                    None => break,
                },
                maybe = events.unicast_metadatas.recv() => match maybe {
                    Some(records) => self.on_unicast_metadatas(&peer, records),
                    None => break,
                },
                maybe = events.multicast_metadata_requests.recv() => match maybe {
                    Some(tags) => self.on_multicast_metadata_requests(&peer, tags),
                    None => break,
                },
                maybe = events.multicast_metadatas.recv() => match maybe {
                    Some(records) => self.on_multicast_metadatas(&peer, records),
                    None => break,
                },
                maybe = events.cancels.recv() => {
                    if maybe.is_some() {
                        self.on_cancel(&session);
                    }
                    break;
                },
            }
        }
        self.unregister(&session).await;
    }

    async fn peer_drain_loop(self: Arc<Self>, session: Arc<Session>) {
        let peer = session.remote_node().id.clone();
        let mut tick = interval(self.config.drain_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut nodes_due = Phase::new(self.config.drain_node_interval);
        let mut batches_due = Phase::new(self.config.drain_batch_interval);
        let mut diffusion_due = Phase::new(self.config.drain_block_interval);
        let mut metadatas_due = Phase::new(self.config.drain_metadata_interval);
        while !session.is_closed() {
            tick.tick().await;
            if session.is_closed() {
                break;
            }
            let result = self
                .drain_peer(
                    &session,
                    &peer,
                    nodes_due.due(),
                    batches_due.due(),
                    diffusion_due.due(),
                    metadatas_due.due(),
                )
                .await;
            if let Err(error) = result {
                trace!(peer = %short_hex(&peer), %error, "peer drain stopped");
                break;
            }
        }
    }

    async fn drain_peer(
        &self,
        session: &Arc<Session>,
        peer: &[u8],
        push_nodes: bool,
        push_batches: bool,
        push_diffusion: bool,
        push_metadatas: bool,
    ) -> Result<()> {
        if push_nodes {
            let nodes = self.collect_node_push();
            if !nodes.is_empty() {
                self.counters
                    .push_node
                    .fetch_add(nodes.len() as u64, Ordering::Relaxed);
                session.push_nodes(nodes).await?;
            }
        }
        if push_batches {
            self.drain_batches(session, peer).await?;
        }
        if push_diffusion {
            let key = {
                let mut core = self.lock_core();
                core.states.state(peer).diffusion_blocks.pop_front()
            };
            if let Some(key) = key {
                self.push_block_to_peer(session, peer, key, false).await?;
            }
        }
        // The upload queue drains every tick, throttled by peer priority:
        // peers that pull more than they give are served less often.
        let key = {
            let mut core = self.lock_core();
            let state = core.states.state(peer);
            if state.upload_blocks.is_empty() {
                None
            } else {
                let chance = ((state.priority + UPLOAD_PRIORITY_OFFSET) as f64
                    / UPLOAD_PRIORITY_RANGE)
                    .clamp(0.0, 1.0);
                if thread_rng().gen_bool(chance) {
                    state.upload_blocks.pop_front()
                } else {
                    None
                }
            }
        };
        if let Some(key) = key {
            self.push_block_to_peer(session, peer, key, true).await?;
        }
        if push_metadatas {
            self.drain_metadatas(session, peer).await?;
        }
        Ok(())
    }

    /// Nodes worth advertising: up to 64 with a recently proven URI, then
    /// random routing entries until the push holds 128.
    fn collect_node_push(&self) -> Vec<Node> {
        let core = self.lock_core();
        let mut pool = core.routing.nodes();
        pool.shuffle(&mut thread_rng());
        let mut push: Vec<Node> = Vec::new();
        for node in &pool {
            if push.len() >= PREFERRED_NODE_COUNT {
                break;
            }
            if node.uris.iter().any(|uri| core.succeeded_uris.contains(uri)) {
                push.push(node.clone());
            }
        }
        for node in pool {
            if push.len() >= NODE_PUSH_COUNT {
                break;
            }
            if !push.contains(&node) {
                push.push(node);
            }
        }
        push
    }

    async fn drain_batches(&self, session: &Arc<Session>, peer: &[u8]) -> Result<()> {
        let (links, requests, broadcasts, unicasts, multicasts) = {
            let mut core = self.lock_core();
            let state = core.states.state(peer);
            let links: Vec<Key> = mem::take(&mut state.push_block_links).into_iter().collect();
            let requests: Vec<Key> = mem::take(&mut state.push_block_requests)
                .into_iter()
                .collect();
            let broadcasts: Vec<Signer> = mem::take(&mut state.push_broadcast_metadata_requests)
                .into_iter()
                .collect();
            let unicasts: Vec<Signer> = mem::take(&mut state.push_unicast_metadata_requests)
                .into_iter()
                .collect();
            let multicasts: Vec<Tag> = mem::take(&mut state.push_multicast_metadata_requests)
                .into_iter()
                .collect();
            (links, requests, broadcasts, unicasts, multicasts)
        };
        if !links.is_empty() {
            self.counters
                .push_block_link
                .fetch_add(links.len() as u64, Ordering::Relaxed);
            session.push_blocks_link(links).await?;
        }
        if !requests.is_empty() {
            self.counters
                .push_block_request
                .fetch_add(requests.len() as u64, Ordering::Relaxed);
            session.push_blocks_request(requests).await?;
        }
        // A sent metadata request clears the wanted entry; the reply (or
        // the user asking again) re-arms it.
        if !broadcasts.is_empty() {
            self.counters
                .push_metadata_request
                .fetch_add(broadcasts.len() as u64, Ordering::Relaxed);
            session
                .push_broadcast_metadatas_request(broadcasts.clone())
                .await?;
            let mut core = self.lock_core();
            for signer in &broadcasts {
                core.wanted_broadcasts.remove(signer);
            }
        }
        if !unicasts.is_empty() {
            self.counters
                .push_metadata_request
                .fetch_add(unicasts.len() as u64, Ordering::Relaxed);
            session
                .push_unicast_metadatas_request(unicasts.clone())
                .await?;
            let mut core = self.lock_core();
            for signer in &unicasts {
                core.wanted_unicasts.remove(signer);
            }
        }
        if !multicasts.is_empty() {
            self.counters
                .push_metadata_request
                .fetch_add(multicasts.len() as u64, Ordering::Relaxed);
            session
                .push_multicast_metadatas_request(multicasts.clone())
                .await?;
            let mut core = self.lock_core();
            for tag in &multicasts {
                core.wanted_multicasts.remove(tag);
            }
        }
        Ok(())
    }

    /// Sends the records this peer asked for, skipping anything already in
    /// its stock set.
    async fn drain_metadatas(&self, session: &Arc<Session>, peer: &[u8]) -> Result<()> {
        let (broadcasts, unicasts, multicasts) = {
            let mut core = self.lock_core();
            let Core { states, index, .. } = &mut *core;
            let state = states.state(peer);
            let mut broadcasts = Vec::new();
            'broadcasts: for signer in state.pull_broadcast_metadata_requests.snapshot() {
                for record in index.broadcast_metadatas_for(&signer) {
                    if broadcasts.len() >= wire::MAX_METADATA_COUNT {
                        break 'broadcasts;
                    }
                    if !state
                        .stock_broadcast_metadatas
                        .contains(&record.stock_hash())
                    {
                        broadcasts.push(record);
                    }
                }
            }
            let mut unicasts = Vec::new();
            'unicasts: for target in state.pull_unicast_metadata_requests.snapshot() {
                for record in index.unicast_metadatas_for(&target) {
                    if unicasts.len() >= wire::MAX_METADATA_COUNT {
                        break 'unicasts;
                    }
                    if !state.stock_unicast_metadatas.contains(&record.stock_hash()) {
                        unicasts.push(record);
                    }
                }
            }
            let mut multicasts = Vec::new();
            'multicasts: for tag in state.pull_multicast_metadata_requests.snapshot() {
                for record in index.multicast_metadatas_for(&tag) {
                    if multicasts.len() >= wire::MAX_METADATA_COUNT {
                        break 'multicasts;
                    }
                    if !state
                        .stock_multicast_metadatas
                        .contains(&record.stock_hash())
                    {
                        multicasts.push(record);
                    }
                }
            }
            (broadcasts, unicasts, multicasts)
        };
        if !broadcasts.is_empty() {
            self.counters
                .push_metadata
                .fetch_add(broadcasts.len() as u64, Ordering::Relaxed);
            let hashes: Vec<[u8; 32]> = broadcasts.iter().map(|record| record.stock_hash()).collect();
            session.push_broadcast_metadatas(broadcasts).await?;
            let mut core = self.lock_core();
            core.states
                .state(peer)
                .stock_broadcast_metadatas
                .extend(hashes);
        }
        if !unicasts.is_empty() {
            self.counters
                .push_metadata
                .fetch_add(unicasts.len() as u64, Ordering::Relaxed);
            let hashes: Vec<[u8; 32]> = unicasts.iter().map(|record| record.stock_hash()).collect();
            session.push_unicast_metadatas(unicasts).await?;
            let mut core = self.lock_core();
            core.states
                .state(peer)
                .stock_unicast_metadatas
                .extend(hashes);
        }
        if !multicasts.is_empty() {
            self.counters
                .push_metadata
                .fetch_add(multicasts.len() as u64, Ordering::Relaxed);
            let hashes: Vec<[u8; 32]> = multicasts.iter().map(|record| record.stock_hash()).collect();
            session.push_multicast_metadatas(multicasts).await?;
            let mut core = self.lock_core();
            core.states
                .state(peer)
                .stock_multicast_metadatas
                .extend(hashes);
        }
        Ok(())
    }

    /// Reads one block and pushes it. A missing or unreadable block is not
    /// fatal; a send failure is, so the drain loop stops. `upload` marks a
    /// requested block as opposed to a diffused one.
    async fn push_block_to_peer(
        &self,
        session: &Arc<Session>,
        peer: &[u8],
        key: Key,
        upload: bool,
    ) -> Result<()> {
        self.lock_core().states.state(peer).stock_blocks.insert(key);
        let payload = match self.store.get(&key).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                self.lock_core().states.state(peer).stock_blocks.remove(&key);
                return Ok(());
            }
            Err(error) => {
                debug!(key = ?key, %error, "block read failed");
                self.lock_core().states.state(peer).stock_blocks.remove(&key);
                return Ok(());
            }
        };
        if let Err(error) = session.push_block(key, payload).await {
            self.lock_core().states.state(peer).stock_blocks.remove(&key);
            return Err(error);
        }
        self.counters.push_block.fetch_add(1, Ordering::Relaxed);
        let uploaded = {
            let mut core = self.lock_core();
            let relayed = core.relay_blocks.contains(&key);
            let state = core.states.state(peer);
            state.pull_block_requests.remove(&key);
            if upload {
                state.priority -= 1;
                if relayed {
                    self.counters.relay_block.fetch_add(1, Ordering::Relaxed);
                }
            }
            core.pending_diffusion.remove(&key);
            core.pending_upload.remove(&key)
        };
        if uploaded {
            let _ = self.uploaded_tx.send(key);
            trace!(key = ?key, peer = %short_hex(peer), "block upload satisfied");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scheduler
    // ------------------------------------------------------------------

    async fn scheduler_loop(self: Arc<Self>) {
        let mut tick = interval(self.config.scheduler_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut trim = Phase::new(self.config.trim_interval);
        let mut sweep = Phase::new(self.config.sweep_interval);
        let mut mediation = Phase::new(self.config.mediation_interval);
        let mut health = Phase::new(self.config.health_check_interval);
        let mut trust = Phase::new(self.config.trust_refresh_interval);
        let mut diffusion = Phase::new(self.config.diffusion_interval);
        let mut upload = Phase::new(self.config.upload_interval);
        let mut download = Phase::new(self.config.download_interval);
        let mut metadata_upload = Phase::new(self.config.metadata_upload_interval);
        let mut metadata_download = Phase::new(self.config.metadata_download_interval);
        while self.running.load(Ordering::SeqCst) {
            tick.tick().await;
            if trim.due() {
                self.trim_phase();
            }
            if sweep.due() {
                self.sweep_phase();
            }
            if mediation.due() {
                self.mediate_priorities();
            }
            if health.due() {
                self.health_check().await;
            }
            if trust.due() {
                self.refresh_trust();
            }
            if diffusion.due() {
                self.diffusion_phase().await;
            }
            if upload.due() {
                self.upload_phase().await;
            }
            if download.due() {
                self.download_phase().await;
            }
            if metadata_upload.due() {
                self.metadata_upload_phase();
            }
            if metadata_download.due() {
                self.metadata_download_phase();
            }
        }
    }

    fn trim_phase(&self) {
        let mut core = self.lock_core();
        let Core {
            states,
            waiting,
            cutting,
            removed,
            succeeded_uris,
            pending_download,
            wanted_broadcasts,
            wanted_unicasts,
            wanted_multicasts,
            relay_blocks,
            ..
        } = &mut *core;
        waiting.trim();
        cutting.trim();
        removed.trim();
        succeeded_uris.trim();
        pending_download.trim();
        wanted_broadcasts.trim();
        wanted_unicasts.trim();
        wanted_multicasts.trim();
        relay_blocks.trim();
        for (_, state) in states.iter_mut() {
            state.trim();
        }
    }

    fn sweep_phase(&self) {
        let mut core = self.lock_core();
        let Core {
            sessions, states, ..
        } = &mut *core;
        let live: HashSet<Vec<u8>> = sessions.keys().cloned().collect();
        states.sweep(&live);
    }

    /// Steps every connected peer's priority one unit back toward the
    /// band. Old grudges and old favors both fade.
    fn mediate_priorities(&self) {
        let mut core = self.lock_core();
        let Core {
            sessions, states, ..
        } = &mut *core;
        for (id, state) in states.iter_mut() {
            if !sessions.contains_key(id) {
                continue;
            }
            if state.priority > PRIORITY_BAND {
                state.priority -= 1;
            } else if state.priority < -PRIORITY_BAND {
                state.priority += 1;
            }
        }
    }

    /// When well over capacity, drops the peer with the worst (priority,
    /// last pull time) rank to make room for someone better.
    async fn health_check(&self) {
        let victim = {
            let mut core = self.lock_core();
            if core.sessions.len() * 3 <= self.config.connection_limit {
                None
            } else {
                let Core {
                    sessions, states, ..
                } = &mut *core;
                let mut ranked: Vec<(i64, u64, Vec<u8>)> = sessions
                    .keys()
                    .map(|id| {
                        let state = states.state(id);
                        (state.priority, state.last_pull_time_ms, id.clone())
                    })
                    .collect();
                ranked.sort();
                ranked.first().and_then(|(_, _, id)| {
                    sessions.get_mut(id).map(|handle| {
                        handle.evicted = true;
                        Arc::clone(&handle.session)
                    })
                })
            }
        };
        if let Some(session) = victim {
            debug!(
                peer = %short_hex(&session.remote_node().id),
                "dropping lowest ranked peer"
            );
            let _ = session.push_cancel().await;
            session.close().await;
        }
    }

    /// Re-pins the metadata index to the oracle's current answer. The
    /// oracle may block on I/O, so the refresh runs detached behind a
    /// single-flight guard.
    fn refresh_trust(self: &Arc<Self>) {
        if self.trust_refreshing.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let signers: HashSet<Signer> = inner.trust.trusted_signers().await.into_iter().collect();
            let tags: HashSet<Tag> = inner.trust.trusted_tags().await.into_iter().collect();
            {
                let mut core = inner.lock_core();
                core.index.refresh(&signers, &tags);
            }
            inner.trust_refreshing.store(false, Ordering::SeqCst);
        });
    }

    /// Samples pending uploads and relays and queues each stored block on
    /// the connected peer closest to it. When we are closer than every
    /// peer, the responsibility is already where it belongs.
    async fn diffusion_phase(&self) {
        let samples = {
            let mut core = self.lock_core();
            if core.sessions.len() <= MIN_DIFFUSION_PEERS {
                return;
            }
            if core.pending_diffusion.len() > PENDING_DIFFUSION_CAP {
                let mut keys: Vec<Key> = core.pending_diffusion.iter().copied().collect();
                keys.shuffle(&mut thread_rng());
                for key in keys.into_iter().skip(PENDING_DIFFUSION_CAP) {
                    core.pending_diffusion.remove(&key);
                }
            }
            let mut upload_sample: Vec<Key> = core.pending_upload.iter().copied().collect();
            upload_sample.shuffle(&mut thread_rng());
            upload_sample.truncate(DIFFUSION_SAMPLE_COUNT);
            let mut diffusion_sample: Vec<Key> = core.pending_diffusion.iter().copied().collect();
            diffusion_sample.shuffle(&mut thread_rng());
            diffusion_sample.truncate(DIFFUSION_SAMPLE_COUNT);
            upload_sample.extend(diffusion_sample);
            upload_sample
        };

        let mut stored = Vec::new();
        let mut missing = Vec::new();
        for key in samples {
            if self.store.contains(&key).await {
                stored.push(key);
            } else {
                missing.push(key);
            }
        }

        let mut completed = Vec::new();
        {
            let mut core = self.lock_core();
            // Interest in blocks we no longer hold is stale either way.
            for key in &missing {
                core.pending_upload.remove(key);
                core.pending_diffusion.remove(key);
            }
            let base = core.base_node.clone();
            let mut candidates: Vec<Node> = core
                .sessions
                .values()
                .map(|handle| handle.session.remote_node().clone())
                .collect();
            candidates.push(base.clone());
            let Core {
                states,
                pending_upload,
                pending_diffusion,
                ..
            } = &mut *core;
            for key in stored {
                let target = kademlia::search(&key.hash, &candidates, 1)
                    .into_iter()
                    .next()
                    .filter(|node| node.id != base.id);
                match target {
                    Some(node) => {
                        states.state(&node.id).enqueue_diffusion_block(key);
                    }
                    None => {
                        pending_diffusion.remove(&key);
                        if pending_upload.remove(&key) {
                            completed.push(key);
                        }
                    }
                }
            }
        }
        for key in completed {
            let _ = self.uploaded_tx.send(key);
        }
    }

    /// Rebuilds each peer's upload queue from the blocks it asked for that
    /// we actually hold.
    async fn upload_phase(&self) {
        let requested = {
            let mut core = self.lock_core();
            if core.sessions.len() < MIN_EXCHANGE_PEERS {
                return;
            }
            let Core {
                sessions, states, ..
            } = &mut *core;
            let mut requested: Vec<(Vec<u8>, Vec<Key>)> = Vec::with_capacity(sessions.len());
            for id in sessions.keys() {
                requested.push((id.clone(), states.state(id).pull_block_requests.snapshot()));
            }
            requested
        };
        let mut queues = Vec::with_capacity(requested.len());
        for (id, keys) in requested {
            let mut available = self.store.intersect(&keys).await;
            available.truncate(UPLOAD_BATCH_COUNT);
            queues.push((id, available));
        }
        let mut core = self.lock_core();
        for (id, available) in queues {
            core.states.state(&id).upload_blocks = available.into_iter().collect();
        }
    }

    /// Distributes announcements and requests over the connected peers by
    /// XOR distance. Links go to the single closest peer; requests go to
    /// the two closest plus anyone who announced the key.
    async fn download_phase(&self) {
        let (pending, peers) = {
            let core = self.lock_core();
            if core.sessions.len() < MIN_EXCHANGE_PEERS {
                return;
            }
            (
                core.pending_download.snapshot(),
                core.sessions.keys().cloned().collect::<Vec<_>>(),
            )
        };
        let mut local_keys = self.store.keys().await;
        let mut missing = self.store.difference(&pending).await;

        let mut core = self.lock_core();
        let Core {
            sessions, states, ..
        } = &mut *core;
        let peer_count = sessions.len().max(1);
        let connected: Vec<Node> = sessions
            .values()
            .map(|handle| handle.session.remote_node().clone())
            .collect();

        // Link pool: our own holdings plus a slice of each peer's
        // announcements, relayed onward.
        local_keys.shuffle(&mut thread_rng());
        local_keys.truncate(wire::MAX_BLOCK_LINK_COUNT);
        let mut link_pool = local_keys;
        let per_peer_links = wire::MAX_BLOCK_LINK_COUNT * LINK_FAN_FACTOR / peer_count;
        for id in &peers {
            let mut relayed = states.state(id).pull_block_links.snapshot();
            relayed.shuffle(&mut thread_rng());
            relayed.truncate(per_peer_links);
            link_pool.extend(relayed);
        }

        // Request pool: our own wants plus a slice of each peer's wants,
        // relayed onward.
        missing.shuffle(&mut thread_rng());
        missing.truncate(REQUEST_POOL_CAP);
        let mut request_pool = missing;
        let per_peer_requests = REQUEST_POOL_CAP * LINK_FAN_FACTOR / peer_count;
        for id in &peers {
            let mut relayed = states.state(id).pull_block_requests.snapshot();
            relayed.shuffle(&mut thread_rng());
            relayed.truncate(per_peer_requests);
            request_pool.extend(relayed);
        }

        let mut link_push: HashMap<Vec<u8>, HashSet<Key>> = HashMap::new();
        for key in link_pool {
            for node in kademlia::search(&key.hash, &connected, 1) {
                link_push.entry(node.id).or_default().insert(key);
            }
        }
        let mut request_push: HashMap<Vec<u8>, HashSet<Key>> = HashMap::new();
        for key in request_pool {
            let mut targets: Vec<Vec<u8>> = kademlia::search(&key.hash, &connected, 2)
                .into_iter()
                .map(|node| node.id)
                .collect();
            for id in &peers {
                if states.state(id).pull_block_links.contains(&key) && !targets.contains(id) {
                    targets.push(id.clone());
                }
            }
            for id in targets {
                request_push.entry(id).or_default().insert(key);
            }
        }

        for id in &peers {
            let mut links: Vec<Key> = link_push
                .remove(id)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default();
            links.truncate(wire::MAX_BLOCK_LINK_COUNT);
            let mut requests: Vec<Key> = request_push
                .remove(id)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default();
            requests.truncate(wire::MAX_BLOCK_REQUEST_COUNT);
            let state = states.state(id);
            state.push_block_links = links.into_iter().collect();
            state.push_block_requests = requests.into_iter().collect();
        }
    }

    /// Plants our record identities in the pull sets of the two peers
    /// closest to each one, so the metadata drain offers them the actual
    /// records. Replication follows the same distance rule as lookup.
    fn metadata_upload_phase(&self) {
        let mut core = self.lock_core();
        let connected: Vec<Node> = core
            .sessions
            .values()
            .map(|handle| handle.session.remote_node().clone())
            .collect();
        if connected.is_empty() {
            return;
        }
        let broadcast_signers = core.index.broadcast_signers();
        let unicast_targets = core.index.unicast_targets();
        let multicast_tags = core.index.multicast_tags();
        let Core { states, .. } = &mut *core;
        for signer in broadcast_signers {
            for node in kademlia::search(&signer.hash(), &connected, 2) {
                states
                    .state(&node.id)
                    .pull_broadcast_metadata_requests
                    .insert(signer.clone());
            }
        }
        for target in unicast_targets {
            for node in kademlia::search(&target.hash(), &connected, 2) {
                states
                    .state(&node.id)
                    .pull_unicast_metadata_requests
                    .insert(target.clone());
            }
        }
        for tag in multicast_tags {
            for node in kademlia::search(&tag.id, &connected, 2) {
                states
                    .state(&node.id)
                    .pull_multicast_metadata_requests
                    .insert(tag.clone());
            }
        }
    }

    /// Routes wanted record requests to the two peers closest to each
    /// identity. Push sets are replaced wholesale; the wanted sets expire
    /// on their own if nobody answers.
    fn metadata_download_phase(&self) {
        let mut core = self.lock_core();
        if core.sessions.len() < MIN_EXCHANGE_PEERS {
            return;
        }
        let connected: Vec<Node> = core
            .sessions
            .values()
            .map(|handle| handle.session.remote_node().clone())
            .collect();
        let Core {
            states,
            sessions,
            wanted_broadcasts,
            wanted_unicasts,
            wanted_multicasts,
            ..
        } = &mut *core;

        let mut broadcast_push: HashMap<Vec<u8>, HashSet<Signer>> = HashMap::new();
        let mut signers = wanted_broadcasts.snapshot();
        signers.shuffle(&mut thread_rng());
        signers.truncate(wire::MAX_METADATA_REQUEST_COUNT);
        for signer in signers {
            for node in kademlia::search(&signer.hash(), &connected, 2) {
                broadcast_push
                    .entry(node.id)
                    .or_default()
                    .insert(signer.clone());
            }
        }
        let mut unicast_push: HashMap<Vec<u8>, HashSet<Signer>> = HashMap::new();
        let mut targets = wanted_unicasts.snapshot();
        targets.shuffle(&mut thread_rng());
        targets.truncate(wire::MAX_METADATA_REQUEST_COUNT);
        for target in targets {
            for node in kademlia::search(&target.hash(), &connected, 2) {
                unicast_push
                    .entry(node.id)
                    .or_default()
                    .insert(target.clone());
            }
        }
        let mut multicast_push: HashMap<Vec<u8>, HashSet<Tag>> = HashMap::new();
        let mut tags = wanted_multicasts.snapshot();
        tags.shuffle(&mut thread_rng());
        tags.truncate(wire::MAX_METADATA_REQUEST_COUNT);
        for tag in tags {
            for node in kademlia::search(&tag.id, &connected, 2) {
                multicast_push.entry(node.id).or_default().insert(tag.clone());
            }
        }

        for id in sessions.keys() {
            let state = states.state(id);
            state.push_broadcast_metadata_requests = broadcast_push
                .remove(id)
                .unwrap_or_default()
                .into_iter()
                .take(wire::MAX_METADATA_REQUEST_COUNT)
                .collect();
            state.push_unicast_metadata_requests = unicast_push
                .remove(id)
                .unwrap_or_default()
                .into_iter()
                .take(wire::MAX_METADATA_REQUEST_COUNT)
                .collect();
            state.push_multicast_metadata_requests = multicast_push
                .remove(id)
                .unwrap_or_default()
                .into_iter()
                .take(wire::MAX_METADATA_REQUEST_COUNT)
                .collect();
        }
    }

    // ------------------------------------------------------------------
    // Inbound frame handlers
    // ------------------------------------------------------------------

    fn on_nodes(&self, peer: &[u8], nodes: Vec<Node>) {
        self.counters
            .pull_node
            .fetch_add(nodes.len() as u64, Ordering::Relaxed);
        let mut core = self.lock_core();
        let mut added = 0usize;
        for node in nodes.into_iter().take(NODE_INTAKE_COUNT) {
            if !node.is_valid() || !node.is_routable() || core.removed.contains(&node) {
                continue;
            }
            if core.routing.add(node) {
                added += 1;
            }
        }
        if added > 0 {
            trace!(peer = %short_hex(peer), added, "learned nodes");
        }
    }

    fn on_block_links(&self, peer: &[u8], keys: Vec<Key>) {
        self.counters
            .pull_block_link
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        let mut core = self.lock_core();
        let state = core.states.state(peer);
        if pull_burst(state.pull_block_links.len(), wire::MAX_BLOCK_LINK_COUNT) {
            warn!(peer = %short_hex(peer), "block link burst dropped");
            return;
        }
        state
            .pull_block_links
            .extend(keys.into_iter().take(wire::MAX_BLOCK_LINK_COUNT));
    }

    fn on_block_requests(&self, peer: &[u8], keys: Vec<Key>) {
        self.counters
            .pull_block_request
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        let mut core = self.lock_core();
        let state = core.states.state(peer);
        if pull_burst(state.pull_block_requests.len(), wire::MAX_BLOCK_REQUEST_COUNT) {
            warn!(peer = %short_hex(peer), "block request burst dropped");
            return;
        }
        state
            .pull_block_requests
            .extend(keys.into_iter().take(wire::MAX_BLOCK_REQUEST_COUNT));
    }

    fn on_broadcast_metadata_requests(&self, peer: &[u8], signers: Vec<Signer>) {
        self.counters
            .pull_metadata_request
            .fetch_add(signers.len() as u64, Ordering::Relaxed);
        let mut core = self.lock_core();
        let state = core.states.state(peer);
        if pull_burst(
            state.pull_broadcast_metadata_requests.len(),
            wire::MAX_METADATA_REQUEST_COUNT,
        ) {
            warn!(peer = %short_hex(peer), "metadata request burst dropped");
            return;
        }
        state.pull_broadcast_metadata_requests.extend(
            signers
                .into_iter()
                .take(wire::MAX_METADATA_REQUEST_COUNT)
                .filter(Signer::is_valid),
        );
    }

    fn on_unicast_metadata_requests(&self, peer: &[u8], signers: Vec<Signer>) {
        self.counters
            .pull_metadata_request
            .fetch_add(signers.len() as u64, Ordering::Relaxed);
        let mut core = self.lock_core();
        let state = core.states.state(peer);
        if pull_burst(
            state.pull_unicast_metadata_requests.len(),
            wire::MAX_METADATA_REQUEST_COUNT,
        ) {
            warn!(peer = %short_hex(peer), "metadata request burst dropped");
            return;
        }
        state.pull_unicast_metadata_requests.extend(
            signers
                .into_iter()
                .take(wire::MAX_METADATA_REQUEST_COUNT)
                .filter(Signer::is_valid),
        );
    }

    fn on_multicast_metadata_requests(&self, peer: &[u8], tags: Vec<Tag>) {
        self.counters
            .pull_metadata_request
            .fetch_add(tags.len() as u64, Ordering::Relaxed);
        let mut core = self.lock_core();
        let state = core.states.state(peer);
        if pull_burst(
            state.pull_multicast_metadata_requests.len(),
            wire::MAX_METADATA_REQUEST_COUNT,
        ) {
            warn!(peer = %short_hex(peer), "metadata request burst dropped");
            return;
        }
        state.pull_multicast_metadata_requests.extend(
            tags.into_iter()
                .take(wire::MAX_METADATA_REQUEST_COUNT)
                .filter(Tag::is_valid),
        );
    }

    fn on_broadcast_metadatas(&self, peer: &[u8], records: Vec<BroadcastMetadata>) {
        self.counters
            .pull_metadata
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        let mut core = self.lock_core();
        let Core { states, index, .. } = &mut *core;
        let state = states.state(peer);
        if pull_burst(state.stock_broadcast_metadatas.len(), wire::MAX_METADATA_COUNT) {
            warn!(peer = %short_hex(peer), "metadata burst dropped");
            return;
        }
        for record in records.into_iter().take(wire::MAX_METADATA_COUNT) {
            let stock_hash = record.stock_hash();
            match index.set_broadcast_metadata(record) {
                Ok(true) => {
                    state.stock_broadcast_metadatas.insert(stock_hash);
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(peer = %short_hex(peer), %error, "rejected broadcast metadata");
                }
            }
        }
    }

    fn on_unicast_metadatas(&self, peer: &[u8], records: Vec<UnicastMetadata>) {
        self.counters
            .pull_metadata
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        let mut core = self.lock_core();
        let Core { states, index, .. } = &mut *core;
        let state = states.state(peer);
        if pull_burst(state.stock_unicast_metadatas.len(), wire::MAX_METADATA_COUNT) {
            warn!(peer = %short_hex(peer), "metadata burst dropped");
            return;
        }
        for record in records.into_iter().take(wire::MAX_METADATA_COUNT) {
            let stock_hash = record.stock_hash();
            match index.set_unicast_metadata(record) {
                Ok(true) => {
                    state.stock_unicast_metadatas.insert(stock_hash);
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(peer = %short_hex(peer), %error, "rejected unicast metadata");
                }
            }
        }
    }

    fn on_multicast_metadatas(&self, peer: &[u8], records: Vec<MulticastMetadata>) {
        self.counters
            .pull_metadata
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        let mut core = self.lock_core();
        let Core { states, index, .. } = &mut *core;
        let state = states.state(peer);
        if pull_burst(state.stock_multicast_metadatas.len(), wire::MAX_METADATA_COUNT) {
            warn!(peer = %short_hex(peer), "metadata burst dropped");
            return;
        }
        for record in records.into_iter().take(wire::MAX_METADATA_COUNT) {
            let stock_hash = record.stock_hash();
            match index.set_multicast_metadata(record) {
                Ok(true) => {
                    state.stock_multicast_metadatas.insert(stock_hash);
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(peer = %short_hex(peer), %error, "rejected multicast metadata");
                }
            }
        }
    }

    /// A received block satisfies a want, feeds a relay, or joins the
    /// diffusion backlog. Peers that deliver wanted blocks earn priority.
    async fn on_block(&self, peer: &[u8], key: Key, payload: Vec<u8>) {
        self.counters.pull_block.fetch_add(1, Ordering::Relaxed);
        // The key is the integrity check: content that does not hash back
        // to it never touches the store.
        if Key::from_content(&payload) != key {
            warn!(peer = %short_hex(peer), key = ?key, "block content does not match its key");
            return;
        }
        if let Err(error) = self.store.put(key, payload).await {
            debug!(key = ?key, %error, "failed to store received block");
            return;
        }
        let mut core = self.lock_core();
        let Core {
            states,
            sessions,
            pending_download,
            pending_diffusion,
            relay_blocks,
            ..
        } = &mut *core;
        states.state(peer).stock_blocks.insert(key);
        let wanted = pending_download.contains(&key);
        let mut requested = false;
        for id in sessions.keys() {
            if states.state(id).pull_block_requests.contains(&key) {
                requested = true;
                break;
            }
        }
        if wanted || requested {
            let state = states.state(peer);
            state.last_pull_time_ms = now_ms();
            state.priority += 1;
            if requested {
                relay_blocks.insert(key);
            }
            pending_download.remove(&key);
        } else {
            pending_diffusion.insert(key);
        }
        trace!(
            peer = %short_hex(peer),
            key = ?key,
            wanted,
            requested,
            "received block"
        );
    }

    /// The peer wants out. Mark the session evicted so unregister does not
    /// queue it for re-dial.
    fn on_cancel(&self, session: &Arc<Session>) {
        let node = session.remote_node().clone();
        let mut core = self.lock_core();
        if let Some(handle) = core.sessions.get_mut(&node.id) {
            if Arc::ptr_eq(&handle.session, session) {
                handle.evicted = true;
            }
        }
        remove_node(&mut core, &node);
        debug!(peer = %short_hex(&node.id), "peer requested disconnect");
    }
}

/// One scheduler deadline. The first `due()` fires immediately.
struct Phase {
    interval: Duration,
    last: Option<Instant>,
}

impl Phase {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    fn due(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

fn guard<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A pull set that already holds more than one full frame per surviving
/// minute is being flooded; the incoming batch is dropped wholesale.
fn pull_burst(len: usize, frame_cap: usize) -> bool {
    len > frame_cap * 30
}

fn retain_eligible(core: &Core, pool: &mut Vec<Node>) {
    pool.retain(|node| {
        node.id != core.base_node.id
            && node.is_routable()
            && !core.sessions.contains_key(&node.id)
            && !core.connecting.contains(&node.id)
            && !core.waiting.contains(&node.id)
            && !core.removed.contains(node)
    });
}

fn remove_node(core: &mut Core, node: &Node) {
    core.removed.insert(node.clone());
    core.cutting.remove(node);
    if core.routing.len() > ROUTE_HOLD_COUNT {
        core.routing.remove(&node.id);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::item::{HashAlgorithm, Keypair};
    use crate::store::{MemoryBlockStore, StaticTrust};
    use crate::transport::memory::MemoryNet;

    fn node(id_byte: u8, uri: &str) -> Node {
        let uris = if uri.is_empty() {
            Vec::new()
        } else {
            vec![uri.to_string()]
        };
        Node::new(vec![id_byte; 32], uris)
    }

    fn test_overlay(limit: usize) -> Overlay {
        let net = MemoryNet::new();
        let acceptor = net.bind("mem:overlay");
        Overlay::new(
            OverlayConfig {
                connection_limit: limit,
                ..OverlayConfig::default()
            },
            node(1, "mem:overlay"),
            Arc::new(MemoryBlockStore::new()),
            Arc::new(StaticTrust::new(Vec::new(), Vec::new())),
            Arc::new(net.connector()),
            Arc::new(acceptor),
        )
    }

    async fn session_pair(
        local: Node,
        remote: Node,
    ) -> ((Session, SessionEvents), (Session, SessionEvents)) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let left = Session::connect(Box::new(a), "mem:left".to_string(), local, Direction::Out);
        let right = Session::connect(Box::new(b), "mem:right".to_string(), remote, Direction::In);
        let (left, right) = tokio::join!(left, right);
        (left.unwrap(), right.unwrap())
    }

    fn insert_session(overlay: &Overlay, peer: &Node, session: Session) {
        overlay.inner.lock_core().sessions.insert(
            peer.id.clone(),
            PeerHandle {
                session: Arc::new(session),
                evicted: false,
                tasks: Vec::new(),
            },
        );
    }

    #[test]
    fn download_and_upload_mark_interest() {
        let overlay = test_overlay(32);
        let key = Key::from_content(b"blob");
        assert!(!overlay.is_download_waiting(&key));
        assert!(!overlay.is_upload_waiting(&key));

        overlay.download(key);
        overlay.upload(key);

        assert!(overlay.is_download_waiting(&key));
        assert!(overlay.is_upload_waiting(&key));
    }

    #[test]
    fn metadata_upload_and_lookup_roundtrip() {
        let overlay = test_overlay(32);
        let keypair = Keypair::generate("alice");
        let key = Key::from_content(b"profile");
        let record = BroadcastMetadata::new("profile", now_ms(), key, &keypair);

        assert!(overlay.upload_broadcast_metadata(record.clone()).unwrap());
        assert_eq!(
            overlay.broadcast_metadata(&keypair.signer(), "profile"),
            Some(record)
        );
        // The lookup registered interest for the download scheduler.
        assert!(overlay
            .inner
            .lock_core()
            .wanted_broadcasts
            .contains(&keypair.signer()));
    }

    #[test]
    fn set_other_nodes_skips_unroutable_descriptors() {
        let overlay = test_overlay(32);
        overlay.set_other_nodes(vec![
            node(10, "mem:a"),
            node(11, ""),
            Node::new(Vec::new(), vec!["mem:b".to_string()]),
        ]);
        assert_eq!(overlay.info().routing_node_count, 1);
    }

    #[test]
    fn link_burst_is_dropped_wholesale() {
        let overlay = test_overlay(32);
        let peer = vec![9u8; 32];

        overlay
            .inner
            .on_block_links(&peer, vec![Key::from_content(b"a")]);
        assert_eq!(
            overlay
                .inner
                .lock_core()
                .states
                .state(&peer)
                .pull_block_links
                .len(),
            1
        );

        let flooded = wire::MAX_BLOCK_LINK_COUNT * 30 + 1;
        {
            let mut core = overlay.inner.lock_core();
            let state = core.states.state(&peer);
            for index in 0..flooded {
                state
                    .pull_block_links
                    .insert(Key::from_content(&index.to_le_bytes()));
            }
        }
        let before = overlay
            .inner
            .lock_core()
            .states
            .state(&peer)
            .pull_block_links
            .len();

        overlay
            .inner
            .on_block_links(&peer, vec![Key::from_content(b"z")]);
        let after = overlay
            .inner
            .lock_core()
            .states
            .state(&peer)
            .pull_block_links
            .len();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn register_rejects_self_duplicates_and_over_limit() {
        let overlay = test_overlay(4);
        let base = overlay.base_node();

        // A peer that presents our own id is refused.
        let ((own, own_events), _keep0) = session_pair(base.clone(), base.clone()).await;
        assert!(!overlay.inner.register(own, own_events).await);

        let ((first, first_events), _keep1) = session_pair(base.clone(), node(10, "")).await;
        assert!(overlay.inner.register(first, first_events).await);

        let ((dup, dup_events), _keep2) = session_pair(base.clone(), node(10, "")).await;
        assert!(!overlay.inner.register(dup, dup_events).await);

        // Outbound cap is limit / 2 = 2.
        let ((second, second_events), _keep3) = session_pair(base.clone(), node(11, "")).await;
        assert!(overlay.inner.register(second, second_events).await);
        let ((third, third_events), _keep4) = session_pair(base.clone(), node(12, "")).await;
        assert!(!overlay.inner.register(third, third_events).await);
    }

    #[tokio::test]
    async fn register_rejects_recently_removed_inbound_peers() {
        let overlay = test_overlay(32);
        let base = overlay.base_node();
        let peer = node(10, "");
        overlay.inner.lock_core().removed.insert(peer.clone());

        // The right half of the pair is the inbound side; its remote is
        // the removed peer.
        let (_keep, (inbound, inbound_events)) = session_pair(peer, base).await;
        assert!(!overlay.inner.register(inbound, inbound_events).await);
    }

    #[tokio::test]
    async fn health_check_drops_the_lowest_ranked_peer() {
        let overlay = test_overlay(6);
        let base = overlay.base_node();
        let peers = [node(10, ""), node(11, ""), node(12, "")];
        let mut keep = Vec::new();
        for (rank, peer) in peers.iter().enumerate() {
            let ((local, local_events), remote) = session_pair(base.clone(), peer.clone()).await;
            insert_session(&overlay, peer, local);
            overlay.inner.lock_core().states.state(&peer.id).priority = rank as i64 * 10 - 10;
            keep.push((local_events, remote));
        }

        overlay.inner.health_check().await;

        let core = overlay.inner.lock_core();
        let victim = core.sessions.get(&peers[0].id).unwrap();
        assert!(victim.evicted);
        assert!(victim.session.is_closed());
        assert!(!core.sessions.get(&peers[1].id).unwrap().session.is_closed());
        assert!(!core.sessions.get(&peers[2].id).unwrap().session.is_closed());
    }

    #[tokio::test]
    async fn mediation_steps_live_priorities_toward_the_band() {
        let overlay = test_overlay(32);
        let base = overlay.base_node();
        let peer = node(10, "");
        let ((local, _local_events), _remote) = session_pair(base, peer.clone()).await;
        insert_session(&overlay, &peer, local);
        {
            let mut core = overlay.inner.lock_core();
            core.states.state(&peer.id).priority = 50;
            core.states.state(b"offline".as_ref()).priority = -50;
        }

        overlay.inner.mediate_priorities();

        let mut core = overlay.inner.lock_core();
        assert_eq!(core.states.state(&peer.id).priority, 49);
        assert_eq!(
            core.states.state(b"offline".as_ref()).priority,
            -50,
            "disconnected peers keep their priority"
        );
    }

    #[tokio::test]
    async fn upload_phase_queues_requested_blocks() {
        let overlay = test_overlay(32);
        let base = overlay.base_node();
        let key = Key::from_content(b"payload");
        overlay.inner.store.put(key, b"payload".to_vec()).await.unwrap();

        let peers = [node(10, ""), node(11, ""), node(12, "")];
        let mut keep = Vec::new();
        for peer in &peers {
            let ((local, local_events), remote) = session_pair(base.clone(), peer.clone()).await;
            insert_session(&overlay, peer, local);
            keep.push((local_events, remote));
        }
        overlay
            .inner
            .lock_core()
            .states
            .state(&peers[0].id)
            .pull_block_requests
            .insert(key);

        overlay.inner.upload_phase().await;

        let mut core = overlay.inner.lock_core();
        assert_eq!(
            core.states.state(&peers[0].id).upload_blocks,
            VecDeque::from(vec![key])
        );
        assert!(core.states.state(&peers[1].id).upload_blocks.is_empty());
        assert!(core.states.state(&peers[2].id).upload_blocks.is_empty());
    }

    #[tokio::test]
    async fn diffusion_routes_by_distance_and_completes_local_uploads() {
        let overlay = test_overlay(64);
        let base = overlay.base_node();
        let mut keep = Vec::new();
        for index in 0..13u8 {
            let peer = node(0x80 + index, "");
            let ((local, local_events), remote) = session_pair(base.clone(), peer.clone()).await;
            insert_session(&overlay, &peer, local);
            keep.push((local_events, remote));
        }

        // One key sits at a peer's id, the other at our own.
        let near_peer = Key::new(HashAlgorithm::Blake3, [0x80; 32]);
        let near_base = Key::new(HashAlgorithm::Blake3, [1; 32]);
        overlay
            .inner
            .store
            .put(near_peer, b"a".to_vec())
            .await
            .unwrap();
        overlay
            .inner
            .store
            .put(near_base, b"b".to_vec())
            .await
            .unwrap();
        overlay.upload(near_peer);
        overlay.upload(near_base);
        let mut uploaded = overlay.block_uploaded().await.unwrap();

        overlay.inner.diffusion_phase().await;

        {
            let mut core = overlay.inner.lock_core();
            assert_eq!(
                core.states.state(&[0x80u8; 32]).diffusion_blocks,
                VecDeque::from(vec![near_peer]),
                "the block lands on the peer closest to its key"
            );
            assert!(
                core.pending_upload.contains(&near_peer),
                "responsibility is shed on send, not on queueing"
            );
            assert!(
                !core.pending_upload.contains(&near_base),
                "we are the closest node, so this upload is already done"
            );
        }
        assert_eq!(uploaded.try_recv().ok(), Some(near_base));

        // Re-running placement while the send is still pending must not
        // duplicate the queue entry or re-complete the local upload.
        overlay.inner.diffusion_phase().await;
        {
            let mut core = overlay.inner.lock_core();
            assert_eq!(
                core.states.state(&[0x80u8; 32]).diffusion_blocks,
                VecDeque::from(vec![near_peer])
            );
        }
        assert!(uploaded.try_recv().is_err());
    }

    #[tokio::test]
    async fn mismatched_block_content_is_rejected() {
        let overlay = test_overlay(32);
        let peer = vec![9u8; 32];
        let key = Key::from_content(b"real");

        overlay.inner.on_block(&peer, key, b"forged".to_vec()).await;
        assert!(!overlay.inner.store.contains(&key).await);
        assert!(overlay.inner.lock_core().pending_diffusion.is_empty());

        overlay.inner.on_block(&peer, key, b"real".to_vec()).await;
        assert!(overlay.inner.store.contains(&key).await);
        assert!(overlay.inner.lock_core().pending_diffusion.contains(&key));
    }

    #[tokio::test]
    async fn delivered_blocks_reward_the_sender() {
        let overlay = test_overlay(32);
        let base = overlay.base_node();
        let sender = vec![9u8; 32];

        let wanted = Key::from_content(b"wanted");
        overlay.download(wanted);
        overlay
            .inner
            .on_block(&sender, wanted, b"wanted".to_vec())
            .await;

        {
            let mut core = overlay.inner.lock_core();
            assert!(
                !core.pending_download.contains(&wanted),
                "the want is satisfied"
            );
            assert!(
                !core.pending_diffusion.contains(&wanted),
                "a wanted block is not diffusion backlog"
            );
            let state = core.states.state(&sender);
            assert_eq!(state.priority, 1, "delivering a wanted block earns priority");
            assert!(state.last_pull_time_ms > 0);
        }

        // A block some connected peer asked for counts the same way and is
        // marked for relay.
        let asker = node(10, "");
        let ((local, _local_events), _remote) = session_pair(base, asker.clone()).await;
        insert_session(&overlay, &asker, local);
        let relayed = Key::from_content(b"relayed");
        overlay
            .inner
            .lock_core()
            .states
            .state(&asker.id)
            .pull_block_requests
            .insert(relayed);

        overlay
            .inner
            .on_block(&sender, relayed, b"relayed".to_vec())
            .await;

        let mut core = overlay.inner.lock_core();
        assert!(core.relay_blocks.contains(&relayed));
        assert_eq!(core.states.state(&sender).priority, 2);
    }

    #[tokio::test]
    async fn collect_node_push_prefers_proven_uris() {
        let overlay = test_overlay(32);
        {
            let mut core = overlay.inner.lock_core();
            for index in 0..200u8 {
                core.routing
                    .add(node(index.wrapping_add(10), &format!("mem:{index}")));
            }
            core.routing.add(node(2, "mem:proven"));
            core.succeeded_uris.insert("mem:proven".to_string());
        }

        let push = overlay.inner.collect_node_push();

        assert!(!push.is_empty());
        assert!(push.len() <= NODE_PUSH_COUNT);
        assert_eq!(
            push[0].id,
            vec![2u8; 32],
            "the node with a proven URI leads the push"
        );
    }
}
