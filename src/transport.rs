//! # Transports
//!
//! Two implementations of [`Transport`]:
//!
//! | Transport | Addresses | Use |
//! |-----------|-----------|-----|
//! | [`QuicTransport`] | `ip:port` | real deployments; mTLS over QUIC |
//! | [`MemoryTransport`] | `mem:<n>` | in-process tests and simulations |
//!
//! ## QUIC Links
//!
//! One QUIC connection per link, carrying a single bidirectional stream. The
//! dialer opens the stream; the acceptor sees it once the dialer's first frame
//! arrives. Handshakes on the accept side run concurrently so a slow or
//! hostile client cannot hold up other peers.
//!
//! The connection handle travels with the write half so the connection lives
//! exactly as long as the link does.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use quinn::{ClientConfig, Connection, Endpoint, SendStream};
use tokio::io::AsyncWrite;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, trace};

use crate::crypto::{
    create_client_config, create_server_config, extract_verified_identity,
    generate_ed25519_cert, identity_to_sni,
};
use crate::identity::{Identity, Keypair};
use crate::protocols::{PeerStream, Transport};

/// Authenticated-but-unclaimed inbound links waiting for `accept()`.
const ACCEPT_QUEUE: usize = 64;

/// Limit on a single inbound handshake plus stream open.
const ACCEPT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// QUIC
// ============================================================================

pub struct QuicTransport {
    identity: Identity,
    endpoint: Endpoint,
    client_config: ClientConfig,
    local_addr: SocketAddr,
    incoming: Mutex<mpsc::Receiver<PeerStream>>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl QuicTransport {
    /// Bind a QUIC endpoint on `addr` that both accepts and dials.
    pub fn bind(addr: SocketAddr, keypair: &Keypair) -> Result<Self> {
        let (certs, key) = generate_ed25519_cert(keypair)?;
        let server_config = create_server_config(certs.clone(), key.clone_key())?;
        let client_config = create_client_config(certs, key)?;

        let endpoint = Endpoint::server(server_config, addr)
            .with_context(|| format!("failed to bind QUIC endpoint on {addr}"))?;
        let local_addr = endpoint
            .local_addr()
            .context("failed to read bound address")?;

        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
        let accept_task = tokio::spawn(accept_loop(endpoint.clone(), tx));

        Ok(Self {
            identity: keypair.identity(),
            endpoint,
            client_config,
            local_addr,
            incoming: Mutex::new(rx),
            accept_task,
        })
    }

    pub fn local_socket_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(endpoint: Endpoint, tx: mpsc::Sender<PeerStream>) {
    while let Some(incoming) = endpoint.accept().await {
        let tx = tx.clone();
        tokio::spawn(async move {
            let remote = incoming.remote_address();
            let result = tokio::time::timeout(ACCEPT_HANDSHAKE_TIMEOUT, async {
                let connection = incoming.await.context("handshake failed")?;
                let peer = extract_verified_identity(&connection)
                    .context("peer presented no usable certificate")?;
                let (send, recv) = connection
                    .accept_bi()
                    .await
                    .context("peer never opened a stream")?;
                anyhow::Ok(PeerStream {
                    peer,
                    addr: remote.to_string(),
                    reader: Box::new(recv),
                    writer: Box::new(QuicWriter { send, connection }),
                })
            })
            .await;

            match result {
                Ok(Ok(stream)) => {
                    trace!(
                        peer = %hex::encode(&stream.peer.as_bytes()[..8]),
                        addr = %remote,
                        "accepted QUIC link"
                    );
                    let _ = tx.send(stream).await;
                }
                Ok(Err(e)) => debug!(addr = %remote, error = %e, "inbound QUIC link rejected"),
                Err(_) => debug!(addr = %remote, "inbound QUIC handshake timed out"),
            }
        });
    }
    debug!("QUIC endpoint closed, accept loop exiting");
}

#[async_trait]
impl Transport for QuicTransport {
    fn local_identity(&self) -> Identity {
        self.identity
    }

    fn local_addr(&self) -> String {
        self.local_addr.to_string()
    }

    async fn dial(&self, peer: Identity, addr: &str) -> Result<PeerStream> {
        let socket_addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid peer address: {addr}"))?;
        let sni = identity_to_sni(&peer);

        let connection = self
            .endpoint
            .connect_with(self.client_config.clone(), socket_addr, &sni)
            .context("failed to start QUIC connection")?
            .await
            .context("QUIC handshake failed")?;

        // The certificate verifier already pinned the key to the SNI; this
        // catches a verifier that was bypassed.
        let verified = extract_verified_identity(&connection)
            .context("peer presented no usable certificate")?;
        if verified != peer {
            connection.close(0u32.into(), b"identity mismatch");
            anyhow::bail!("peer at {addr} is {verified}, expected {peer}");
        }

        let (send, recv) = connection
            .open_bi()
            .await
            .context("failed to open link stream")?;

        Ok(PeerStream {
            peer,
            addr: addr.to_string(),
            reader: Box::new(recv),
            writer: Box::new(QuicWriter { send, connection }),
        })
    }

    async fn accept(&self) -> Option<PeerStream> {
        self.incoming.lock().await.recv().await
    }

    async fn close(&self) {
        self.accept_task.abort();
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

/// Write half of a QUIC link. Holds the connection open while the link lives.
struct QuicWriter {
    send: SendStream,
    connection: Connection,
}

impl AsyncWrite for QuicWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}

impl Drop for QuicWriter {
    fn drop(&mut self) {
        self.connection.close(0u32.into(), b"link closed");
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Per-direction buffer of an in-memory link.
const MEMORY_LINK_BUFFER: usize = 256 * 1024;

/// A private network of [`MemoryTransport`]s living in one process.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<StdMutex<MemoryRegistry>>,
}

#[derive(Default)]
struct MemoryRegistry {
    next_addr: u64,
    listeners: HashMap<String, (Identity, mpsc::Sender<PeerStream>)>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node with `identity` under a fresh `mem:<n>` address.
    pub fn bind(&self, identity: Identity) -> MemoryTransport {
        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
        let addr = {
            let mut registry = self.lock();
            registry.next_addr += 1;
            let addr = format!("mem:{}", registry.next_addr);
            registry.listeners.insert(addr.clone(), (identity, tx));
            addr
        };
        MemoryTransport {
            network: self.clone(),
            identity,
            addr,
            incoming: Mutex::new(rx),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryRegistry> {
        // A poisoned registry only means a test thread panicked mid-update.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    identity: Identity,
    addr: String,
    incoming: Mutex<mpsc::Receiver<PeerStream>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_identity(&self) -> Identity {
        self.identity
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }

    async fn dial(&self, peer: Identity, addr: &str) -> Result<PeerStream> {
        let listener = self
            .network
            .lock()
            .listeners
            .get(addr)
            .map(|(identity, tx)| (*identity, tx.clone()));
        let Some((remote, tx)) = listener else {
            anyhow::bail!("no node listening on {addr}");
        };
        if remote != peer {
            anyhow::bail!("peer at {addr} is {remote}, expected {peer}");
        }

        let (ours, theirs) = tokio::io::duplex(MEMORY_LINK_BUFFER);
        let (our_reader, our_writer) = tokio::io::split(ours);
        let (their_reader, their_writer) = tokio::io::split(theirs);

        tx.send(PeerStream {
            peer: self.identity,
            addr: self.addr.clone(),
            reader: Box::new(their_reader),
            writer: Box::new(their_writer),
        })
        .await
        .map_err(|_| anyhow::anyhow!("node at {addr} stopped accepting"))?;

        Ok(PeerStream {
            peer,
            addr: addr.to_string(),
            reader: Box::new(our_reader),
            writer: Box::new(our_writer),
        })
    }

    async fn accept(&self) -> Option<PeerStream> {
        self.incoming.lock().await.recv().await
    }

    async fn close(&self) {
        // Dropping the registered sender ends `accept()` once queued links drain.
        self.network.lock().listeners.remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn memory_dial_connects_both_ends() {
        let network = MemoryNetwork::new();
        let a = network.bind(Keypair::generate().identity());
        let b = network.bind(Keypair::generate().identity());

        let mut outbound = a.dial(b.local_identity(), &b.local_addr()).await.unwrap();
        let mut inbound = b.accept().await.unwrap();

        assert_eq!(outbound.peer, b.local_identity());
        assert_eq!(inbound.peer, a.local_identity());
        assert_eq!(inbound.addr, a.local_addr());

        outbound.writer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        inbound.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn memory_dial_checks_identity() {
        let network = MemoryNetwork::new();
        let a = network.bind(Keypair::generate().identity());
        let b = network.bind(Keypair::generate().identity());

        let wrong = Keypair::generate().identity();
        assert!(a.dial(wrong, &b.local_addr()).await.is_err());
        assert!(a.dial(b.local_identity(), "mem:999").await.is_err());
    }

    #[tokio::test]
    async fn closed_memory_transport_is_unreachable() {
        let network = MemoryNetwork::new();
        let a = network.bind(Keypair::generate().identity());
        let b = network.bind(Keypair::generate().identity());

        b.close().await;
        assert!(a.dial(b.local_identity(), &b.local_addr()).await.is_err());
        assert!(b.accept().await.is_none());
    }

    #[tokio::test]
    async fn quic_dial_authenticates_both_sides() {
        let ka = Keypair::generate();
        let kb = Keypair::generate();
        let a = QuicTransport::bind("127.0.0.1:0".parse().unwrap(), &ka).unwrap();
        let b = QuicTransport::bind("127.0.0.1:0".parse().unwrap(), &kb).unwrap();

        let mut outbound = a.dial(kb.identity(), &b.local_addr()).await.unwrap();
        outbound.writer.write_all(b"hi").await.unwrap();
        outbound.writer.flush().await.unwrap();

        let mut inbound = tokio::time::timeout(Duration::from_secs(5), b.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.peer, ka.identity());

        let mut buf = [0u8; 2];
        inbound.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn quic_dial_rejects_wrong_identity() {
        let a = QuicTransport::bind("127.0.0.1:0".parse().unwrap(), &Keypair::generate()).unwrap();
        let b = QuicTransport::bind("127.0.0.1:0".parse().unwrap(), &Keypair::generate()).unwrap();

        let impostor = Keypair::generate().identity();
        assert!(a.dial(impostor, &b.local_addr()).await.is_err());

        a.close().await;
        b.close().await;
    }
}
