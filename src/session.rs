//! Established peer sessions over a [`Duplex`] transport stream.
//!
//! A session starts with a three step handshake, each step a length
//! prefixed chunk in both directions: a version document (the common
//! version set is the bitwise AND), a random raw session id, and the
//! local node descriptor. The whole handshake runs under one deadline.
//! After that the stream is split; a receive loop demultiplexes frames
//! into one typed channel per frame kind, and push methods write frames
//! under a shared writer lock.
//!
//! Timing constants:
//!
//! | Constant | Value | Purpose |
//! |----------|-------|---------|
//! | `HANDSHAKE_TIMEOUT` | 30 s | whole handshake deadline |
//! | `SEND_TIMEOUT` | 6 min | one push, lock wait included |
//! | `RECEIVE_TIMEOUT` | 6 min | silence allowed between frames |
//! | `KEEPALIVE_AFTER` | 3 min | outbound idle before an alive frame |
//! | `KEEPALIVE_INTERVAL` | 30 s | idle check cadence |
//! | `MIN_RECEIVE_INTERVAL` | 300 ms | receive loop pacing floor |
//!
//! A frame that fails to decode is logged and dropped; the framing layer
//! stays intact because the length prefix was already consumed. Transport
//! errors, oversized frames and deadline misses are fatal and close the
//! session. Close is idempotent and fires the `closed` notification once.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex, Notify};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::item::{
    short_hex, BroadcastMetadata, Key, MulticastMetadata, Node, Signer, Tag, UnicastMetadata,
};
use crate::transport::Duplex;
use crate::wire::{
    self, Frame, VersionDocument, MAX_FRAME_SIZE, MAX_PING_NONCE_LENGTH, MAX_SESSION_ID_LENGTH,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const SEND_TIMEOUT: Duration = Duration::from_secs(6 * 60);
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(6 * 60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_AFTER: Duration = Duration::from_secs(3 * 60);
const MIN_RECEIVE_INTERVAL: Duration = Duration::from_millis(300);

/// Upper bound on a handshake chunk. Version documents and node
/// descriptors are small; anything larger is a protocol violation.
const MAX_HANDSHAKE_CHUNK_LENGTH: u64 = 64 * 1024;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Which side opened the underlying transport stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::In => "in",
            Direction::Out => "out",
        })
    }
}

/// Typed inbound channels for one session. The receive loop pushes each
/// decoded frame into the channel for its kind; consumers subscribe once
/// and never inspect raw frames. `closed` fires exactly once, whether the
/// session was closed locally or died on a transport error.
pub struct SessionEvents {
    pub nodes: mpsc::Receiver<Vec<Node>>,
    pub block_links: mpsc::Receiver<Vec<Key>>,
    pub block_requests: mpsc::Receiver<Vec<Key>>,
    pub blocks: mpsc::Receiver<(Key, Vec<u8>)>,
    pub broadcast_metadata_requests: mpsc::Receiver<Vec<Signer>>,
    pub broadcast_metadatas: mpsc::Receiver<Vec<BroadcastMetadata>>,
    pub unicast_metadata_requests: mpsc::Receiver<Vec<Signer>>,
    pub unicast_metadatas: mpsc::Receiver<Vec<UnicastMetadata>>,
    pub multicast_metadata_requests: mpsc::Receiver<Vec<Tag>>,
    pub multicast_metadatas: mpsc::Receiver<Vec<MulticastMetadata>>,
    pub cancels: mpsc::Receiver<()>,
    pub closed: oneshot::Receiver<()>,
}

struct EventSenders {
    nodes: mpsc::Sender<Vec<Node>>,
    block_links: mpsc::Sender<Vec<Key>>,
    block_requests: mpsc::Sender<Vec<Key>>,
    blocks: mpsc::Sender<(Key, Vec<u8>)>,
    broadcast_metadata_requests: mpsc::Sender<Vec<Signer>>,
    broadcast_metadatas: mpsc::Sender<Vec<BroadcastMetadata>>,
    unicast_metadata_requests: mpsc::Sender<Vec<Signer>>,
    unicast_metadatas: mpsc::Sender<Vec<UnicastMetadata>>,
    multicast_metadata_requests: mpsc::Sender<Vec<Tag>>,
    multicast_metadatas: mpsc::Sender<Vec<MulticastMetadata>>,
    cancels: mpsc::Sender<()>,
}

impl SessionEvents {
    fn new() -> (Self, EventSenders, oneshot::Sender<()>) {
        let (nodes_tx, nodes) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (block_links_tx, block_links) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (block_requests_tx, block_requests) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (blocks_tx, blocks) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (broadcast_requests_tx, broadcast_metadata_requests) =
            mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (broadcast_tx, broadcast_metadatas) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (unicast_requests_tx, unicast_metadata_requests) =
            mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (unicast_tx, unicast_metadatas) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (multicast_requests_tx, multicast_metadata_requests) =
            mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (multicast_tx, multicast_metadatas) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (cancels_tx, cancels) = mpsc::channel(4);
        let (close_tx, closed) = oneshot::channel();
        let events = SessionEvents {
            nodes,
            block_links,
            block_requests,
            blocks,
            broadcast_metadata_requests,
            broadcast_metadatas,
            unicast_metadata_requests,
            unicast_metadatas,
            multicast_metadata_requests,
            multicast_metadatas,
            cancels,
            closed,
        };
        let senders = EventSenders {
            nodes: nodes_tx,
            block_links: block_links_tx,
            block_requests: block_requests_tx,
            blocks: blocks_tx,
            broadcast_metadata_requests: broadcast_requests_tx,
            broadcast_metadatas: broadcast_tx,
            unicast_metadata_requests: unicast_requests_tx,
            unicast_metadatas: unicast_tx,
            multicast_metadata_requests: multicast_requests_tx,
            multicast_metadatas: multicast_tx,
            cancels: cancels_tx,
        };
        (events, senders, close_tx)
    }
}

struct Shared {
    writer: TokioMutex<Option<WriteHalf<Box<dyn Duplex>>>>,
    closed: AtomicBool,
    close_notify: Notify,
    close_tx: StdMutex<Option<oneshot::Sender<()>>>,
    epoch: Instant,
    last_send_ms: AtomicU64,
    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
    ping_probe: StdMutex<Option<(Vec<u8>, Instant)>>,
    round_trip: StdMutex<Option<Duration>>,
    peer: String,
}

impl Shared {
    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("session with {} is closed", self.peer);
        }
        let body = frame.encode().context("frame encoding failed")?;
        let sent = timeout(SEND_TIMEOUT, async {
            let mut guard = self.writer.lock().await;
            let writer = guard
                .as_mut()
                .ok_or_else(|| anyhow!("session with {} is closed", self.peer))?;
            write_chunk(writer, &body).await
        })
        .await;
        match sent {
            Ok(Ok(())) => {
                self.sent_bytes
                    .fetch_add(4 + body.len() as u64, Ordering::Relaxed);
                self.last_send_ms
                    .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(err)) => {
                debug!(peer = %self.peer, kind = %frame.kind(), error = %err, "send failed");
                self.close().await;
                Err(err)
            }
            Err(_) => {
                debug!(peer = %self.peer, kind = %frame.kind(), "send timed out");
                self.close().await;
                bail!("sending {} frame to {} timed out", frame.kind(), self.peer)
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_notify.notify_waiters();
        self.writer.lock().await.take();
        if let Ok(mut slot) = self.close_tx.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(());
            }
        }
        debug!(peer = %self.peer, "session closed");
    }

    fn outbound_idle(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_send_ms.load(Ordering::Relaxed)))
    }
}

struct Handshake {
    versions: u32,
    send_session_id: Vec<u8>,
    receive_session_id: Vec<u8>,
    remote_node: Node,
}

/// One established peer session. Cheap to share behind an [`Arc`]; all
/// methods take `&self`.
pub struct Session {
    remote_node: Node,
    uri: String,
    direction: Direction,
    versions: u32,
    send_session_id: Vec<u8>,
    receive_session_id: Vec<u8>,
    shared: Arc<Shared>,
}

impl Session {
    /// Runs the handshake on `stream` and spawns the receive and
    /// keepalive tasks. A ping with a random nonce is sent right away;
    /// the matching pong sets [`Session::round_trip_time`].
    pub async fn connect(
        stream: Box<dyn Duplex>,
        uri: String,
        base_node: Node,
        direction: Direction,
    ) -> Result<(Session, SessionEvents)> {
        Self::establish(stream, uri, base_node, direction, VersionDocument::current()).await
    }

    async fn establish(
        mut stream: Box<dyn Duplex>,
        uri: String,
        base_node: Node,
        direction: Direction,
        versions: VersionDocument,
    ) -> Result<(Session, SessionEvents)> {
        let handshake = match timeout(
            HANDSHAKE_TIMEOUT,
            handshake(&mut stream, &base_node, versions),
        )
        .await
        {
            Ok(result) => result.with_context(|| format!("handshake with {uri} failed"))?,
            Err(_) => bail!("handshake with {uri} timed out"),
        };
        let peer = short_hex(&handshake.remote_node.id);
        debug!(
            peer = %peer,
            uri = %uri,
            direction = %direction,
            versions = handshake.versions,
            "session established"
        );

        let (reader, writer) = tokio::io::split(stream);
        let (events, senders, close_tx) = SessionEvents::new();
        let shared = Arc::new(Shared {
            writer: TokioMutex::new(Some(writer)),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            close_tx: StdMutex::new(Some(close_tx)),
            epoch: Instant::now(),
            last_send_ms: AtomicU64::new(0),
            sent_bytes: AtomicU64::new(0),
            received_bytes: AtomicU64::new(0),
            ping_probe: StdMutex::new(None),
            round_trip: StdMutex::new(None),
            peer,
        });
        tokio::spawn(receive_loop(Arc::clone(&shared), reader, senders));
        tokio::spawn(keepalive_loop(Arc::clone(&shared)));

        let session = Session {
            remote_node: handshake.remote_node,
            uri,
            direction,
            versions: handshake.versions,
            send_session_id: handshake.send_session_id,
            receive_session_id: handshake.receive_session_id,
            shared,
        };
        session.ping().await?;
        Ok((session, events))
    }

    async fn ping(&self) -> Result<()> {
        let mut nonce = vec![0u8; MAX_PING_NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);
        if let Ok(mut probe) = self.shared.ping_probe.lock() {
            *probe = Some((nonce.clone(), Instant::now()));
        }
        self.shared.send_frame(&Frame::Ping { nonce }).await
    }

    pub fn remote_node(&self) -> &Node {
        &self.remote_node
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn negotiated_versions(&self) -> u32 {
        self.versions
    }

    /// The random id this side generated for the handshake.
    pub fn send_session_id(&self) -> &[u8] {
        &self.send_session_id
    }

    /// The id the peer generated. A change across reconnects means the
    /// peer restarted and its exchange state is stale.
    pub fn receive_session_id(&self) -> &[u8] {
        &self.receive_session_id
    }

    pub fn round_trip_time(&self) -> Option<Duration> {
        self.shared.round_trip.lock().ok().and_then(|probe| *probe)
    }

    pub fn sent_byte_count(&self) -> u64 {
        self.shared.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn received_byte_count(&self) -> u64 {
        self.shared.received_bytes.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Closes the session. Safe to call more than once; later calls and
    /// pushes after the first return immediately.
    pub async fn close(&self) {
        self.shared.close().await;
    }

    /// Sends node descriptors. Counts over the wire cap are truncated by
    /// the frame codec, not rejected.
    pub async fn push_nodes(&self, nodes: Vec<Node>) -> Result<()> {
        self.shared.send_frame(&Frame::Nodes { nodes }).await
    }

    pub async fn push_blocks_link(&self, keys: Vec<Key>) -> Result<()> {
        self.shared.send_frame(&Frame::BlocksLink { keys }).await
    }

    pub async fn push_blocks_request(&self, keys: Vec<Key>) -> Result<()> {
        self.shared.send_frame(&Frame::BlocksRequest { keys }).await
    }

    /// Sends one block. The payload travels uncompressed; the receiver
    /// re-hashes it against `key`.
    pub async fn push_block(&self, key: Key, payload: Vec<u8>) -> Result<()> {
        self.shared.send_frame(&Frame::Block { key, payload }).await
    }

    pub async fn push_broadcast_metadatas_request(&self, signers: Vec<Signer>) -> Result<()> {
        self.shared
            .send_frame(&Frame::BroadcastMetadatasRequest { signers })
            .await
    }

    pub async fn push_broadcast_metadatas(&self, metadatas: Vec<BroadcastMetadata>) -> Result<()> {
        self.shared
            .send_frame(&Frame::BroadcastMetadatas { metadatas })
            .await
    }

    pub async fn push_unicast_metadatas_request(&self, signers: Vec<Signer>) -> Result<()> {
        self.shared
            .send_frame(&Frame::UnicastMetadatasRequest { signers })
            .await
    }

    pub async fn push_unicast_metadatas(&self, metadatas: Vec<UnicastMetadata>) -> Result<()> {
        self.shared
            .send_frame(&Frame::UnicastMetadatas { metadatas })
            .await
    }

    pub async fn push_multicast_metadatas_request(&self, tags: Vec<Tag>) -> Result<()> {
        self.shared
            .send_frame(&Frame::MulticastMetadatasRequest { tags })
            .await
    }

    pub async fn push_multicast_metadatas(&self, metadatas: Vec<MulticastMetadata>) -> Result<()> {
        self.shared
            .send_frame(&Frame::MulticastMetadatas { metadatas })
            .await
    }

    /// Asks the peer to drop this connection.
    pub async fn push_cancel(&self) -> Result<()> {
        self.shared.send_frame(&Frame::Cancel).await
    }
}

/// SECURITY: every inbound chunk is length checked against `limit`
/// before its body is allocated or read.
async fn read_chunk<S>(stream: &mut S, limit: u64) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut length_bytes = [0u8; 4];
    stream
        .read_exact(&mut length_bytes)
        .await
        .context("transport closed")?;
    let length = u64::from(u32::from_be_bytes(length_bytes));
    if length > limit {
        bail!("chunk length {length} exceeds limit {limit}");
    }
    let mut body = vec![0u8; length as usize];
    stream
        .read_exact(&mut body)
        .await
        .context("transport closed mid-chunk")?;
    Ok(body)
}

async fn write_chunk<S>(stream: &mut S, body: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let length = u32::try_from(body.len()).context("chunk exceeds u32 length")?;
    stream.write_all(&length.to_be_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

async fn handshake(
    stream: &mut Box<dyn Duplex>,
    base_node: &Node,
    local: VersionDocument,
) -> Result<Handshake> {
    let encoded = wire::serialize(&local).context("version document encoding failed")?;
    write_chunk(stream, &encoded).await?;
    let remote: VersionDocument =
        wire::deserialize_bounded(&read_chunk(stream, MAX_HANDSHAKE_CHUNK_LENGTH).await?)
            .context("malformed version document")?;
    let versions = local
        .negotiate(&remote)
        .ok_or_else(|| anyhow!("no common protocol version"))?;

    let mut send_session_id = vec![0u8; MAX_SESSION_ID_LENGTH];
    OsRng.fill_bytes(&mut send_session_id);
    write_chunk(stream, &send_session_id).await?;
    let receive_session_id = read_chunk(stream, MAX_SESSION_ID_LENGTH as u64).await?;
    if receive_session_id.is_empty() {
        bail!("peer sent an empty session id");
    }

    let encoded = wire::serialize(base_node).context("node descriptor encoding failed")?;
    write_chunk(stream, &encoded).await?;
    let remote_node: Node =
        wire::deserialize_bounded(&read_chunk(stream, MAX_HANDSHAKE_CHUNK_LENGTH).await?)
            .context("malformed node descriptor")?;
    if !remote_node.is_valid() {
        bail!("peer sent an invalid node descriptor");
    }

    Ok(Handshake {
        versions,
        send_session_id,
        receive_session_id,
        remote_node,
    })
}

async fn receive_loop(
    shared: Arc<Shared>,
    mut reader: ReadHalf<Box<dyn Duplex>>,
    senders: EventSenders,
) {
    let reason;
    loop {
        if shared.closed.load(Ordering::SeqCst) {
            reason = "session closed";
            break;
        }
        let started = Instant::now();
        let body = tokio::select! {
            _ = shared.close_notify.notified() => {
                reason = "session closed";
                break;
            }
            read = timeout(RECEIVE_TIMEOUT, read_chunk(&mut reader, MAX_FRAME_SIZE)) => {
                match read {
                    Ok(Ok(body)) => body,
                    Ok(Err(err)) => {
                        debug!(peer = %shared.peer, error = %err, "receive failed");
                        reason = "transport error";
                        break;
                    }
                    Err(_) => {
                        reason = "receive timed out";
                        break;
                    }
                }
            }
        };
        shared
            .received_bytes
            .fetch_add(4 + body.len() as u64, Ordering::Relaxed);
        match Frame::decode(&body) {
            Err(err) => warn!(peer = %shared.peer, error = %err, "dropping malformed frame"),
            Ok(None) => trace!(peer = %shared.peer, "dropping frame of unknown type"),
            Ok(Some(frame)) => {
                trace!(peer = %shared.peer, kind = %frame.kind(), "received frame");
                if !dispatch(&shared, &senders, frame).await {
                    reason = "events dropped";
                    break;
                }
            }
        }
        // Paced reads keep one peer from monopolizing the executor.
        let elapsed = started.elapsed();
        if elapsed < MIN_RECEIVE_INTERVAL {
            tokio::time::sleep(MIN_RECEIVE_INTERVAL - elapsed).await;
        }
    }
    debug!(peer = %shared.peer, reason, "receive loop ended");
    shared.close().await;
}

/// Routes one frame. Returns `false` when the event receivers are gone
/// and the session should shut down.
async fn dispatch(shared: &Arc<Shared>, senders: &EventSenders, frame: Frame) -> bool {
    match frame {
        Frame::Alive => true,
        Frame::Cancel => senders.cancels.send(()).await.is_ok(),
        Frame::Ping { nonce } => {
            // A failed reply marks the session closed; the loop sees the
            // flag on its next pass.
            let _ = shared.send_frame(&Frame::Pong { nonce }).await;
            true
        }
        Frame::Pong { nonce } => {
            if let Ok(mut probe) = shared.ping_probe.lock() {
                let matched = probe
                    .as_ref()
                    .is_some_and(|(expected, _)| *expected == nonce);
                if matched {
                    if let Some((_, sent_at)) = probe.take() {
                        let elapsed = sent_at.elapsed();
                        if let Ok(mut round_trip) = shared.round_trip.lock() {
                            *round_trip = Some(elapsed);
                        }
                        trace!(
                            peer = %shared.peer,
                            rtt_ms = elapsed.as_millis() as u64,
                            "round trip measured"
                        );
                    }
                }
            }
            true
        }
        Frame::Nodes { nodes } => senders.nodes.send(nodes).await.is_ok(),
        Frame::BlocksLink { keys } => senders.block_links.send(keys).await.is_ok(),
        Frame::BlocksRequest { keys } => senders.block_requests.send(keys).await.is_ok(),
        Frame::Block { key, payload } => senders.blocks.send((key, payload)).await.is_ok(),
        Frame::BroadcastMetadatasRequest { signers } => senders
            .broadcast_metadata_requests
            .send(signers)
            .await
            .is_ok(),
        Frame::BroadcastMetadatas { metadatas } => {
            senders.broadcast_metadatas.send(metadatas).await.is_ok()
        }
        Frame::UnicastMetadatasRequest { signers } => senders
            .unicast_metadata_requests
            .send(signers)
            .await
            .is_ok(),
        Frame::UnicastMetadatas { metadatas } => {
            senders.unicast_metadatas.send(metadatas).await.is_ok()
        }
        Frame::MulticastMetadatasRequest { tags } => senders
            .multicast_metadata_requests
            .send(tags)
            .await
            .is_ok(),
        Frame::MulticastMetadatas { metadatas } => {
            senders.multicast_metadatas.send(metadatas).await.is_ok()
        }
    }
}

async fn keepalive_loop(shared: Arc<Shared>) {
    let mut ticks = interval(KEEPALIVE_INTERVAL);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.close_notify.notified() => break,
            _ = ticks.tick() => {
                if shared.closed.load(Ordering::SeqCst) {
                    break;
                }
                if shared.outbound_idle() >= KEEPALIVE_AFTER
                    && shared.send_frame(&Frame::Alive).await.is_err()
                {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{PROTOCOL_VERSION_1, TYPE_NODES};
    use tokio::io::DuplexStream;

    fn node(id_byte: u8, uri: &str) -> Node {
        Node {
            id: vec![id_byte; 32],
            uris: if uri.is_empty() {
                Vec::new()
            } else {
                vec![uri.to_string()]
            },
        }
    }

    async fn pair() -> ((Session, SessionEvents), (Session, SessionEvents)) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let left = Session::connect(
            Box::new(a),
            "tcp:left".to_string(),
            node(1, "tcp:left"),
            Direction::Out,
        );
        let right = Session::connect(
            Box::new(b),
            "tcp:right".to_string(),
            node(2, "tcp:right"),
            Direction::In,
        );
        let (left, right) = tokio::join!(left, right);
        (left.unwrap(), right.unwrap())
    }

    async fn recv<T>(receiver: &mut mpsc::Receiver<T>) -> T {
        timeout(Duration::from_secs(30), receiver.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    async fn raw_handshake(raw: &mut DuplexStream, descriptor: &Node) {
        let versions = wire::serialize(&VersionDocument::current()).unwrap();
        write_chunk(raw, &versions).await.unwrap();
        read_chunk(raw, MAX_HANDSHAKE_CHUNK_LENGTH).await.unwrap();
        write_chunk(raw, &[9u8; 16]).await.unwrap();
        read_chunk(raw, MAX_HANDSHAKE_CHUNK_LENGTH).await.unwrap();
        let encoded = wire::serialize(descriptor).unwrap();
        write_chunk(raw, &encoded).await.unwrap();
        read_chunk(raw, MAX_HANDSHAKE_CHUNK_LENGTH).await.unwrap();
    }

    #[tokio::test]
    async fn handshake_crosses_nodes_and_session_ids() {
        let ((left, _left_events), (right, _right_events)) = pair().await;
        assert_eq!(left.remote_node().id, vec![2u8; 32]);
        assert_eq!(right.remote_node().id, vec![1u8; 32]);
        assert_eq!(left.negotiated_versions(), PROTOCOL_VERSION_1);
        assert_eq!(left.receive_session_id(), right.send_session_id());
        assert_eq!(right.receive_session_id(), left.send_session_id());
        assert_eq!(left.direction(), Direction::Out);
        assert_eq!(right.direction(), Direction::In);
    }

    #[tokio::test]
    async fn disjoint_versions_refuse_to_connect() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let left = Session::establish(
            Box::new(a),
            "tcp:left".to_string(),
            node(1, "tcp:left"),
            Direction::Out,
            VersionDocument { versions: 0b01 },
        );
        let right = Session::establish(
            Box::new(b),
            "tcp:right".to_string(),
            node(2, "tcp:right"),
            Direction::In,
            VersionDocument { versions: 0b10 },
        );
        let (left, right) = tokio::join!(left, right);
        assert!(left.is_err());
        assert!(right.is_err());
    }

    #[tokio::test]
    async fn frames_reach_typed_channels() {
        let ((left, _left_events), (_right, mut right_events)) = pair().await;

        left.push_nodes(vec![node(7, "tcp:x")]).await.unwrap();
        let nodes = recv(&mut right_events.nodes).await;
        assert_eq!(nodes, vec![node(7, "tcp:x")]);

        let key = Key::from_content(b"payload");
        left.push_blocks_request(vec![key.clone()]).await.unwrap();
        assert_eq!(recv(&mut right_events.block_requests).await, vec![key.clone()]);

        left.push_block(key.clone(), b"payload".to_vec()).await.unwrap();
        let (got_key, payload) = recv(&mut right_events.blocks).await;
        assert_eq!(got_key, key);
        assert_eq!(payload, b"payload");

        left.push_cancel().await.unwrap();
        recv(&mut right_events.cancels).await;
    }

    #[tokio::test]
    async fn node_push_is_capped_at_the_wire_limit() {
        let ((left, _left_events), (right, mut right_events)) = pair().await;
        let many: Vec<Node> = (0..2000u16)
            .map(|i| Node {
                id: vec![i as u8, (i >> 8) as u8, 3, 4],
                uris: Vec::new(),
            })
            .collect();
        left.push_nodes(many).await.unwrap();
        let nodes = recv(&mut right_events.nodes).await;
        assert_eq!(nodes.len(), wire::MAX_NODE_COUNT);

        // The session survives an over-cap push.
        left.push_cancel().await.unwrap();
        recv(&mut right_events.cancels).await;
        assert!(!right.is_closed());
    }

    #[tokio::test]
    async fn ping_measures_round_trip() {
        let ((left, _left_events), (right, _right_events)) = pair().await;
        for _ in 0..100 {
            if left.round_trip_time().is_some() && right.round_trip_time().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(left.round_trip_time().is_some());
        assert!(right.round_trip_time().is_some());
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_are_skipped() {
        let (session_side, mut raw) = tokio::io::duplex(256 * 1024);
        let connect = Session::connect(
            Box::new(session_side),
            "tcp:peer".to_string(),
            node(1, "tcp:a"),
            Direction::In,
        );
        let descriptor = node(2, "tcp:b");
        let script = raw_handshake(&mut raw, &descriptor);
        let (connected, ()) = tokio::join!(connect, script);
        let (session, mut events) = connected.unwrap();

        // Garbage body, unknown type byte, then a well formed frame.
        write_chunk(&mut raw, &[TYPE_NODES, 0xFF, 0xFF, 0xFF])
            .await
            .unwrap();
        write_chunk(&mut raw, &[0x7F]).await.unwrap();
        let valid = Frame::Nodes {
            nodes: vec![node(3, "tcp:c")],
        }
        .encode()
        .unwrap();
        write_chunk(&mut raw, &valid).await.unwrap();

        let nodes = recv(&mut events.nodes).await;
        assert_eq!(nodes, vec![node(3, "tcp:c")]);
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn oversized_session_id_is_fatal() {
        let (session_side, mut raw) = tokio::io::duplex(64 * 1024);
        let connect = Session::connect(
            Box::new(session_side),
            "tcp:peer".to_string(),
            node(1, "tcp:a"),
            Direction::Out,
        );
        let script = async {
            let versions = wire::serialize(&VersionDocument::current()).unwrap();
            write_chunk(&mut raw, &versions).await.unwrap();
            read_chunk(&mut raw, MAX_HANDSHAKE_CHUNK_LENGTH).await.unwrap();
            write_chunk(&mut raw, &[1u8; MAX_SESSION_ID_LENGTH + 1])
                .await
                .unwrap();
            read_chunk(&mut raw, MAX_HANDSHAKE_CHUNK_LENGTH).await.unwrap();
        };
        let (connected, ()) = tokio::join!(connect, script);
        assert!(connected.is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_later_pushes() {
        let ((left, left_events), (right, _right_events)) = pair().await;
        left.close().await;
        left.close().await;
        assert!(left.is_closed());
        assert!(left.push_nodes(vec![node(9, "tcp:z")]).await.is_err());

        let SessionEvents { closed, .. } = left_events;
        timeout(Duration::from_secs(5), closed)
            .await
            .expect("close notification timed out")
            .expect("close notification dropped");

        // The peer sees the dropped writer as a transport error.
        for _ in 0..100 {
            if right.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(right.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_hits_the_receive_deadline() {
        let (session_side, mut raw) = tokio::io::duplex(64 * 1024);
        let connect = Session::connect(
            Box::new(session_side),
            "tcp:peer".to_string(),
            node(1, "tcp:a"),
            Direction::In,
        );
        let descriptor = node(2, "tcp:b");
        let script = raw_handshake(&mut raw, &descriptor);
        let (connected, ()) = tokio::join!(connect, script);
        let (session, events) = connected.unwrap();

        // The raw side stays open but silent; virtual time runs to the
        // receive deadline without waiting six real minutes.
        timeout(RECEIVE_TIMEOUT + Duration::from_secs(60), events.closed)
            .await
            .expect("session outlived the receive deadline")
            .expect("close notification dropped");
        assert!(session.is_closed());
    }
}
