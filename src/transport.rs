//! Connection establishment seams.
//!
//! The overlay never opens sockets itself: a [`Connector`] turns a URI into
//! an established byte stream and an [`Acceptor`] produces the server-side
//! equivalent. Authentication, encryption, and compression belong to the
//! implementations behind these traits.
//!
//! Two implementations ship here: plain TCP (`tcp:host:port` URIs) for the
//! demo binary, and [`memory::MemoryNet`] wiring in-process duplex pairs for
//! tests.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// Established bidirectional byte stream.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

/// Dials a URI and returns an established stream.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, uri: &str) -> Result<Box<dyn Duplex>>;
}

/// Accepts inbound streams, each labeled with the remote's URI.
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    async fn accept(&self) -> Result<(Box<dyn Duplex>, String)>;
}

fn parse_tcp_uri(uri: &str) -> Result<&str> {
    match uri.strip_prefix("tcp:") {
        Some(addr) if !addr.is_empty() => Ok(addr),
        _ => bail!("unsupported uri scheme: {uri}"),
    }
}

/// Plain TCP dialer for `tcp:host:port` URIs.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, uri: &str) -> Result<Box<dyn Duplex>> {
        let addr = parse_tcp_uri(uri)?;
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("tcp connect to {addr}"))?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }
}

/// Plain TCP listener.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("tcp bind on {addr}"))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener.local_addr().context("tcp local addr")
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> Result<(Box<dyn Duplex>, String)> {
        let (stream, remote) = self.listener.accept().await.context("tcp accept")?;
        stream.set_nodelay(true).ok();
        Ok((Box::new(stream), format!("tcp:{remote}")))
    }
}

pub mod memory {
    //! In-process network for tests: `bind` registers an endpoint, `connect`
    //! hands it one half of a fresh duplex pair.

    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    use super::{Acceptor, Connector, Duplex};

    const STREAM_BUFFER_SIZE: usize = 256 * 1024;

    type Inbound = (DuplexStream, String);

    /// Shared endpoint registry. Clones talk to the same network.
    #[derive(Clone, Default)]
    pub struct MemoryNet {
        endpoints: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Inbound>>>>,
    }

    impl MemoryNet {
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers `uri` and returns its acceptor. Re-binding a URI
        /// replaces the previous endpoint.
        pub fn bind(&self, uri: &str) -> MemoryAcceptor {
            let (tx, rx) = mpsc::unbounded_channel();
            if let Ok(mut endpoints) = self.endpoints.lock() {
                endpoints.insert(uri.to_string(), tx);
            }
            MemoryAcceptor { inbound: tokio::sync::Mutex::new(rx) }
        }

        /// Anonymous dialer into this network.
        pub fn connector(&self) -> MemoryConnector {
            MemoryConnector { net: self.clone(), label: "mem:remote".to_string() }
        }

        /// Dialer whose connections are labeled `label` on the accept side.
        pub fn connector_as(&self, label: &str) -> MemoryConnector {
            MemoryConnector { net: self.clone(), label: label.to_string() }
        }
    }

    #[derive(Clone)]
    pub struct MemoryConnector {
        net: MemoryNet,
        label: String,
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, uri: &str) -> Result<Box<dyn Duplex>> {
            let endpoint = self
                .net
                .endpoints
                .lock()
                .ok()
                .and_then(|endpoints| endpoints.get(uri).cloned())
                .with_context(|| format!("no memory endpoint at {uri}"))?;

            let (local, remote) = tokio::io::duplex(STREAM_BUFFER_SIZE);
            endpoint
                .send((remote, self.label.clone()))
                .ok()
                .with_context(|| format!("memory endpoint {uri} closed"))?;
            Ok(Box::new(local))
        }
    }

    pub struct MemoryAcceptor {
        inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    }

    #[async_trait]
    impl Acceptor for MemoryAcceptor {
        async fn accept(&self) -> Result<(Box<dyn Duplex>, String)> {
            let mut inbound = self.inbound.lock().await;
            let (stream, label) = inbound.recv().await.context("memory network closed")?;
            Ok((Box::new(stream), label))
        }
    }
}
