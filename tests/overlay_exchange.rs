//! End-to-end exchange tests over the in-memory transport.
//!
//! Each test stands up real overlays wired through `memory::MemoryNet`.
//! Scheduler cadences are shrunk so exchanges settle in seconds, but stay
//! above the per-session receive pacing floor (300 ms per frame): pushing
//! frames faster than a peer may read them only builds backlog. Meshes are
//! brought up in stages, higher id first, so every dial targets a node
//! that is already listening and never dials back.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use osmos::{
    memory::MemoryNet, BlockStore, BroadcastMetadata, Key, Keypair, MemoryBlockStore, Node,
    Overlay, OverlayConfig, Signer, StaticTrust,
};
use tokio::time::{sleep, timeout};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(90);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn fast_config(connection_limit: usize) -> OverlayConfig {
    OverlayConfig {
        connection_limit,
        dial_timeout: Duration::from_secs(2),
        connect_tick: Duration::from_millis(50),
        scheduler_tick: Duration::from_millis(50),
        drain_tick: Duration::from_millis(50),
        trim_interval: Duration::from_millis(500),
        sweep_interval: Duration::from_secs(5),
        mediation_interval: Duration::from_secs(60),
        health_check_interval: Duration::from_secs(60),
        trust_refresh_interval: Duration::from_secs(60),
        diffusion_interval: Duration::from_secs(1),
        upload_interval: Duration::from_secs(1),
        download_interval: Duration::from_millis(1500),
        metadata_upload_interval: Duration::from_secs(1),
        metadata_download_interval: Duration::from_secs(1),
        drain_node_interval: Duration::from_secs(2),
        drain_batch_interval: Duration::from_millis(500),
        drain_block_interval: Duration::from_millis(250),
        drain_metadata_interval: Duration::from_millis(500),
    }
}

fn overlay_with(
    net: &MemoryNet,
    id_byte: u8,
    config: OverlayConfig,
    trusted_signers: Vec<Signer>,
) -> (Overlay, Arc<MemoryBlockStore>) {
    let uri = format!("mem:n{id_byte}");
    let store = Arc::new(MemoryBlockStore::new());
    let overlay = Overlay::new(
        config,
        Node::new(vec![id_byte; 32], vec![uri.clone()]),
        store.clone(),
        Arc::new(StaticTrust::new(trusted_signers, Vec::new())),
        Arc::new(net.connector_as(&uri)),
        Arc::new(net.bind(&uri)),
    );
    (overlay, store)
}

fn overlay_on(
    net: &MemoryNet,
    id_byte: u8,
    connection_limit: usize,
    trusted_signers: Vec<Signer>,
) -> (Overlay, Arc<MemoryBlockStore>) {
    overlay_with(net, id_byte, fast_config(connection_limit), trusted_signers)
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(POLL_INTERVAL).await;
    }
}

/// Seeds each overlay with every later one, then starts them back to
/// front, gating on each stage so only the newest node ever dials.
async fn bring_up_mesh(overlays: &[Overlay]) {
    for (index, overlay) in overlays.iter().enumerate() {
        let higher: Vec<Node> = overlays[index + 1..]
            .iter()
            .map(|other| other.base_node())
            .collect();
        overlay.set_other_nodes(higher);
    }
    for index in (0..overlays.len()).rev() {
        overlays[index].start();
        let expected = overlays.len() - 1 - index;
        wait_for(&format!("node {index} to join the mesh"), || {
            overlays[index].info().connected_peer_count == expected
        })
        .await;
    }
    let full = overlays.len() - 1;
    wait_for("the mesh to form", || {
        overlays
            .iter()
            .all(|overlay| overlay.info().connected_peer_count == full)
    })
    .await;
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_millis() as u64
}

// =============================================================================
// Test: mesh formation, discovery, disconnect
// =============================================================================

/// Three nodes in a line. The ends only know the middle; node pushes must
/// teach them about each other, and one end must dial the other.
#[tokio::test]
async fn three_nodes_discover_each_other_through_the_middle() {
    let net = MemoryNet::new();
    let (left, _left_store) = overlay_on(&net, 10, 8, Vec::new());
    let (middle, _middle_store) = overlay_on(&net, 11, 8, Vec::new());
    // The right node's outbound budget (limit / 2 = 1) is spent on the
    // middle, so the left node always initiates the discovered link.
    let (right, _right_store) = overlay_on(&net, 12, 2, Vec::new());

    left.set_other_nodes(vec![middle.base_node()]);
    right.set_other_nodes(vec![middle.base_node()]);
    middle.start();
    left.start();
    right.start();

    wait_for("the line to connect", || {
        left.info().connected_peer_count >= 1 && right.info().connected_peer_count >= 1
    })
    .await;

    // Discovery: the middle advertises both ends to each other.
    wait_for("the ends to learn each other", || {
        left.info().routing_node_count >= 2 && right.info().routing_node_count >= 2
    })
    .await;
    wait_for("the discovered link to form", || {
        left.info().connected_peer_count == 2 && right.info().connected_peer_count == 2
    })
    .await;

    let snapshot = left.info();
    assert!(snapshot.push_node_count > 0, "node pushes were sent");
    assert!(snapshot.pull_node_count > 0, "node pushes were received");
    assert!(snapshot.sent_byte_count > 0);
    assert!(snapshot.received_byte_count > 0);
    for connection in left.connection_info() {
        assert!(!connection.uri.is_empty());
        assert!(!connection.node.id.is_empty());
    }

    // Stopping one end tears its sessions down on the survivors too.
    left.stop().await;
    wait_for("the middle to notice the disconnect", || {
        middle.info().connected_peer_count == 1
    })
    .await;

    middle.stop().await;
    right.stop().await;
}

// =============================================================================
// Test: block upload / download across a mesh
// =============================================================================

/// Four fully meshed nodes. Node 10 uploads a block, node 13 wants it;
/// announcements and requests must route it across, relaying if needed.
#[tokio::test]
async fn blocks_flow_from_uploader_to_downloader() {
    let net = MemoryNet::new();
    let mut overlays = Vec::new();
    let mut stores = Vec::new();
    for id_byte in 10u8..14 {
        let (overlay, store) = overlay_on(&net, id_byte, 8, Vec::new());
        overlays.push(overlay);
        stores.push(store);
    }
    bring_up_mesh(&overlays).await;

    let payload = b"shared payload".to_vec();
    let key = Key::from_content(&payload);
    stores[0]
        .put(key, payload.clone())
        .await
        .expect("seeding the uploader store failed");
    let mut uploaded = overlays[0]
        .block_uploaded()
        .await
        .expect("uploaded stream already taken");
    overlays[0].upload(key);
    overlays[3].download(key);
    assert!(overlays[3].is_download_waiting(&key));

    let deadline = Instant::now() + SETTLE_TIMEOUT;
    while !stores[3].contains(&key).await {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for the block to arrive"
        );
        sleep(POLL_INTERVAL).await;
    }
    let arrived = stores[3]
        .get(&key)
        .await
        .expect("downloader store read failed")
        .expect("block missing after arrival");
    assert_eq!(arrived, payload);
    assert!(!overlays[3].is_download_waiting(&key));

    // The uploader learns its responsibility was handed off.
    let completed = timeout(SETTLE_TIMEOUT, uploaded.recv())
        .await
        .expect("timed out waiting for upload completion")
        .expect("uploaded channel closed");
    assert_eq!(completed, key);

    for overlay in &overlays {
        overlay.stop().await;
    }
}

// =============================================================================
// Test: metadata replication
// =============================================================================

/// A signed broadcast record published on one node becomes readable on
/// another that asks for the signer, with every hop re-verifying it.
#[tokio::test]
async fn metadata_replicates_to_interested_nodes() {
    let keypair = Keypair::generate("alice");
    let signer = keypair.signer();
    let net = MemoryNet::new();
    let mut overlays = Vec::new();
    for id_byte in 20u8..24 {
        let (overlay, _store) = overlay_on(&net, id_byte, 8, vec![signer.clone()]);
        overlays.push(overlay);
    }
    bring_up_mesh(&overlays).await;

    let record = BroadcastMetadata::new(
        "profile",
        unix_ms(),
        Key::from_content(b"profile body"),
        &keypair,
    );
    assert!(overlays[0]
        .upload_broadcast_metadata(record.clone())
        .expect("publishing a valid record failed"));

    // Each poll re-arms the wanted set until the record arrives.
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    loop {
        if let Some(found) = overlays[3].broadcast_metadata(&signer, "profile") {
            assert_eq!(found, record);
            break;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for the record to replicate"
        );
        sleep(POLL_INTERVAL).await;
    }

    for overlay in &overlays {
        overlay.stop().await;
    }
}

// =============================================================================
// Test: periodic metadata refresh
// =============================================================================

/// The metadata index is a query-driven cache: the periodic refresh
/// reclaims record types nobody has looked up, while a single lookup
/// pins a type through later refreshes.
#[tokio::test]
async fn periodic_refresh_reclaims_unqueried_record_types() {
    let keypair = Keypair::generate("alice");
    let signer = keypair.signer();
    let net = MemoryNet::new();
    let config = OverlayConfig {
        trust_refresh_interval: Duration::from_millis(200),
        ..fast_config(8)
    };
    let (overlay, _store) = overlay_with(&net, 30, config, vec![signer.clone()]);

    let record = BroadcastMetadata::new(
        "profile",
        unix_ms(),
        Key::from_content(b"profile body"),
        &keypair,
    );
    assert!(overlay
        .upload_broadcast_metadata(record.clone())
        .expect("publishing a valid record failed"));
    assert_eq!(overlay.info().metadata_count, 1);
    overlay.start();

    wait_for("the unqueried type to be reclaimed", || {
        overlay.info().metadata_count == 0
    })
    .await;

    // One lookup pins the type; a re-published record now survives.
    assert!(overlay.broadcast_metadata(&signer, "profile").is_none());
    assert!(overlay
        .upload_broadcast_metadata(record.clone())
        .expect("republishing the record failed"));
    sleep(Duration::from_millis(600)).await;
    assert_eq!(overlay.broadcast_metadata(&signer, "profile"), Some(record));
    assert_eq!(overlay.info().metadata_count, 1);

    overlay.stop().await;
}
