//! Transport seam between the gossip core and the network.
//!
//! The core only ever sees authenticated, ordered, reliable byte streams to
//! named peers. Anything that can produce those implements [`Transport`]:
//!
//! | Implementation | Module | Purpose |
//! |----------------|--------|---------|
//! | `QuicTransport` | `transport` | mTLS QUIC links on a UDP socket |
//! | `MemoryTransport` | `transport` | in-process links for tests and simulations |

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::identity::Identity;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A bidirectional stream to a peer whose identity the transport has verified.
pub struct PeerStream {
    pub peer: Identity,
    /// Address the stream was dialled on, or the observed remote address for
    /// accepted streams.
    pub addr: String,
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl std::fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerStream")
            .field("peer", &self.peer)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_identity(&self) -> Identity;

    /// Address other nodes can dial to reach this one.
    fn local_addr(&self) -> String;

    /// Open a stream to `peer` at `addr`. Fails if the remote end does not
    /// prove it holds `peer`.
    async fn dial(&self, peer: Identity, addr: &str) -> Result<PeerStream>;

    /// Next inbound stream. `None` once the transport is closed.
    async fn accept(&self) -> Option<PeerStream>;

    /// Stop accepting and release the underlying socket.
    async fn close(&self);
}
