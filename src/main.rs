use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rand::{rngs::OsRng, RngCore};
use tokio::time::{self, Duration};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use osmos::{
    MemoryBlockStore, Node, Overlay, OverlayConfig, Signer, StaticTrust, Tag, TcpAcceptor,
    TcpConnector,
};

#[derive(Clone, Debug)]
struct BootstrapPeer {
    uri: String,
    id: Vec<u8>,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (uri, id_part) = s
            .rsplit_once('/')
            .context("bootstrap peer must include an id (format: tcp:IP:PORT/HEXID)")?;

        let id = hex::decode(id_part).context("invalid hex id")?;
        if id.is_empty() || id.len() > 32 {
            anyhow::bail!("id must be 1 to 32 bytes of hex");
        }

        Ok(BootstrapPeer {
            uri: uri.to_string(),
            id,
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "osmos")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    #[arg(short, long, default_value = "32")]
    connection_limit: usize,

    /// Signers whose metadata this node will index and serve.
    #[arg(long = "trust-signer", value_name = "SIGNER")]
    trusted_signers: Vec<String>,

    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let acceptor = TcpAcceptor::bind(&args.bind.to_string()).await?;
    let listen_uri = format!("tcp:{}", acceptor.local_addr()?);

    let mut id = vec![0u8; 32];
    OsRng.fill_bytes(&mut id);
    let base_node = Node::new(id, vec![listen_uri.clone()]);
    info!(id = %hex::encode(&base_node.id), uri = %listen_uri, "node identity");

    let trusted_signers: Vec<Signer> = args
        .trusted_signers
        .iter()
        .map(|signer| Signer(signer.clone()))
        .collect();

    let overlay = Overlay::new(
        OverlayConfig {
            connection_limit: args.connection_limit,
            ..OverlayConfig::default()
        },
        base_node,
        Arc::new(MemoryBlockStore::new()),
        Arc::new(StaticTrust::new(trusted_signers, Vec::<Tag>::new())),
        Arc::new(TcpConnector),
        Arc::new(acceptor),
    );

    overlay.set_other_nodes(
        args.bootstrap
            .iter()
            .map(|peer| Node::new(peer.id.clone(), vec![peer.uri.clone()]))
            .collect(),
    );
    overlay.start();

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let snapshot = overlay.info();
                info!(
                    peers = snapshot.connected_peer_count,
                    routing = snapshot.routing_node_count,
                    metadata = snapshot.metadata_count,
                    sent_bytes = snapshot.sent_byte_count,
                    received_bytes = snapshot.received_byte_count,
                    pushed_blocks = snapshot.push_block_count,
                    pulled_blocks = snapshot.pull_block_count,
                    "telemetry snapshot"
                );
            }
        }
    }

    overlay.stop().await;
    Ok(())
}
