//! # Meshcast - Local-Swarm Publish/Subscribe
//!
//! Meshcast connects the nodes of a local network into a swarm and broadcasts
//! topic messages across it:
//!
//! - **Identity**: Ed25519 keypairs; a node's identity is its public key
//! - **Discovery**: multicast beacons find peers sharing a service tag
//! - **Membership**: every discovered peer is linked and joins every topic
//! - **Gossip**: flood-fill forwarding with a bounded seen-set for dedup
//! - **Transport**: mutually authenticated QUIC, or an in-memory network for tests
//!
//! ## Architecture
//!
//! Long-lived state lives in actors:
//! - Each topic and the discovery bridge has a cheap-to-clone handle and a
//!   private actor
//! - Handles talk to actors over bounded channels
//! - Actors own their state and process commands one at a time
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `identity` | Keypairs and identities |
//! | `crypto` | TLS certificate generation and verification |
//! | `mdns` | LAN beacon discovery |
//! | `discovery` | Peer records, dialing, link tie-break |
//! | `membership` | Joined topics and live links |
//! | `gossip` | Per-topic dissemination, publish and subscribe |
//! | `cache` | Bounded seen-set |
//! | `transport` | QUIC and in-memory transports |
//! | `protocols` | Transport trait and link stream types |
//! | `messages` | Wire frames and message fingerprints |

mod cache;
mod crypto;
mod discovery;
mod gossip;
mod identity;
mod mdns;
mod membership;
mod messages;
mod node;
mod protocols;
mod transport;

pub use cache::{DEFAULT_SEEN_CAPACITY, DEFAULT_SEEN_TTL, SeenSet};
pub use discovery::{
    ConnectionState, DEFAULT_DIAL_TIMEOUT, DiscoveryConfig, MAX_KNOWN_PEERS, PeerFound, PeerRecord,
};
pub use gossip::{
    DEFAULT_SUBSCRIBER_BUFFER, DEFAULT_WRITE_TIMEOUT, GossipConfig, PublishError, ReceivedMessage,
    Subscription, Topic,
};
pub use identity::{Identity, Keypair};
pub use mdns::{DEFAULT_DISCOVERY_INTERVAL, DISCOVERY_SERVICE_TAG, Mdns, MdnsConfig};
pub use messages::{MAX_MESSAGE_SIZE, MAX_TOPIC_LENGTH, MessageId, fingerprint};
pub use node::{Node, NodeConfig};
pub use protocols::{BoxedReader, BoxedWriter, PeerStream, Transport};
pub use transport::{MemoryNetwork, MemoryTransport, QuicTransport};
