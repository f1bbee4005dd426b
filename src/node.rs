//! # High-Level Node API
//!
//! A [`Node`] wires a transport, a discovery source, the discovery bridge and
//! topic membership into one handle.
//!
//! ## Quick Start
//!
//! ```ignore
//! // QUIC on a random port, LAN discovery on.
//! let node = Node::bind("0.0.0.0:0").await?;
//!
//! let topic = node.join("test").await?;
//! let mut sub = topic.subscribe().await?;
//! topic.publish(b"heartbeat".to_vec()).await?;
//!
//! while let Some(msg) = sub.recv().await {
//!     println!("{} says {:?}", msg.source, msg.data);
//! }
//! ```
//!
//! ## Custom Transports
//!
//! [`Node::start`] takes any [`Transport`] and any stream of [`PeerFound`]
//! events, which is how tests run whole swarms on a `MemoryNetwork`.
//!
//! ## Lifecycle
//!
//! | Call | Effect |
//! |------|--------|
//! | `start` / `bind` | accept links, consume discovery events |
//! | `join` | create topic, seed with every connected peer |
//! | `leave` | drop topic state; later publishes fail with `NotJoined` |
//! | `stop` | close every link, end every topic, release the socket |

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::discovery::{ConnectionState, DiscoveryBridge, DiscoveryConfig, PeerFound, PeerRecord};
use crate::gossip::{GossipConfig, PublishError, Subscription, Topic};
use crate::identity::{Identity, Keypair};
use crate::mdns::{Mdns, MdnsConfig};
use crate::membership::Membership;
use crate::messages::{MessageId, is_valid_topic};
use crate::protocols::Transport;
use crate::transport::QuicTransport;

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub gossip: GossipConfig,
    pub discovery: DiscoveryConfig,
    /// LAN discovery; `None` disables it (peers then come from `add_peer`).
    pub mdns: Option<MdnsConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            gossip: GossipConfig::default(),
            discovery: DiscoveryConfig::default(),
            mdns: Some(MdnsConfig::default()),
        }
    }
}

pub struct Node {
    identity: Identity,
    local_addr: String,
    transport: Arc<dyn Transport>,
    membership: Arc<Membership>,
    bridge: DiscoveryBridge,
    accept_task: JoinHandle<()>,
    mdns: Option<Mdns>,
    stopped: AtomicBool,
}

impl Node {
    /// Bind a QUIC node with a fresh identity and default configuration.
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_config(addr, Keypair::generate(), NodeConfig::default()).await
    }

    /// Bind a QUIC node on `addr` and, if configured, start LAN discovery for
    /// it.
    pub async fn bind_with_config(
        addr: &str,
        keypair: Keypair,
        config: NodeConfig,
    ) -> Result<Self> {
        let addr: SocketAddr = addr.parse().context("invalid socket address")?;
        let transport = QuicTransport::bind(addr, &keypair)?;
        let port = transport.local_socket_addr().port();

        let (mdns, discovery_rx) = match &config.mdns {
            Some(mdns_config) => {
                let (mdns, rx) = Mdns::spawn(mdns_config.clone(), keypair.identity(), port)
                    .context("failed to start LAN discovery")?;
                (Some(mdns), rx)
            }
            None => {
                let (_tx, rx) = mpsc::channel(1);
                (None, rx)
            }
        };

        let mut node = Self::start(transport, discovery_rx, config);
        node.mdns = mdns;
        Ok(node)
    }

    /// Run a node over `transport`, treating every event from `discovery` as
    /// a peer to connect to.
    pub fn start<T: Transport>(
        transport: T,
        discovery: mpsc::Receiver<PeerFound>,
        config: NodeConfig,
    ) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let identity = transport.local_identity();
        let local_addr = transport.local_addr();

        let (link_down_tx, link_down_rx) = mpsc::unbounded_channel();
        let membership = Arc::new(Membership::new(
            identity,
            config.gossip.clone(),
            link_down_tx.clone(),
        ));
        let bridge = DiscoveryBridge::spawn(
            transport.clone(),
            membership.clone(),
            config.discovery.clone(),
            config.gossip.write_timeout,
            discovery,
            link_down_tx,
            link_down_rx,
        );

        let accept_task = {
            let transport = transport.clone();
            let bridge = bridge.clone();
            tokio::spawn(async move {
                while let Some(stream) = transport.accept().await {
                    debug!(
                        peer = %hex::encode(&stream.peer.as_bytes()[..8]),
                        addr = %stream.addr,
                        "inbound link"
                    );
                    bridge.inbound(stream).await;
                }
                debug!("transport closed, accept loop exiting");
            })
        };

        info!(identity = %identity, addr = %local_addr, "node started");

        Self {
            identity,
            local_addr,
            transport,
            membership,
            bridge,
            accept_task,
            mdns: None,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(PublishError::Stopped.into());
        }
        Ok(())
    }

    /// Join `topic`. Joining twice returns the same topic.
    pub async fn join(&self, topic: &str) -> Result<Topic> {
        self.ensure_running()?;
        self.membership.join(topic).await
    }

    /// Leave `topic`, ending its subscriptions. Leaving a topic that was
    /// never joined is a no-op.
    pub async fn leave(&self, topic: &str) -> Result<()> {
        self.ensure_running()?;
        if !self.membership.leave(topic).await {
            debug!(topic = %topic, "leave for topic that was not joined");
        }
        Ok(())
    }

    pub async fn topic(&self, topic: &str) -> Option<Topic> {
        self.membership.topic(topic).await
    }

    /// Names of joined topics, sorted.
    pub async fn topics(&self) -> Vec<String> {
        self.membership.topic_names().await
    }

    /// Publish on a joined topic.
    pub async fn publish(&self, topic: &str, data: impl Into<Vec<u8>>) -> Result<MessageId> {
        self.ensure_running()?;
        if !is_valid_topic(topic) {
            return Err(PublishError::InvalidTopic.into());
        }
        let handle = self
            .membership
            .topic(topic)
            .await
            .ok_or(PublishError::NotJoined)?;
        handle.publish(data).await
    }

    /// Subscribe to `topic`, joining it first if necessary.
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.join(topic).await?.subscribe().await
    }

    /// Connect to a peer at a known address, as if it had been discovered.
    pub async fn add_peer(&self, peer: Identity, addr: &str) -> Result<()> {
        self.ensure_running()?;
        self.bridge
            .peer_found(PeerFound {
                peer,
                addr: addr.to_string(),
            })
            .await;
        Ok(())
    }

    /// Peers with a live link.
    pub async fn connected_peers(&self) -> Vec<Identity> {
        self.bridge
            .records()
            .await
            .into_iter()
            .filter(|r| r.state == ConnectionState::Connected)
            .map(|r| r.peer)
            .collect()
    }

    pub async fn peer_state(&self, peer: &Identity) -> Option<ConnectionState> {
        self.bridge.record(*peer).await.map(|r| r.state)
    }

    pub async fn known_peers(&self) -> Vec<PeerRecord> {
        self.bridge.records().await
    }

    /// Close every link and topic and release the transport. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mdns) = &self.mdns {
            mdns.quit();
        }
        self.accept_task.abort();
        self.bridge.quit().await;
        self.membership.shutdown().await;
        self.transport.close().await;
        info!(identity = %self.identity, "node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DEFAULT_SEEN_CAPACITY, DEFAULT_SEEN_TTL};
    use crate::discovery::DEFAULT_DIAL_TIMEOUT;
    use crate::gossip::DEFAULT_WRITE_TIMEOUT;
    use crate::mdns::DISCOVERY_SERVICE_TAG;
    use crate::messages::MAX_MESSAGE_SIZE;
    use crate::transport::MemoryNetwork;
    use std::time::Duration;

    #[test]
    fn default_config_values() {
        let config = NodeConfig::default();
        assert_eq!(config.gossip.seen_capacity, DEFAULT_SEEN_CAPACITY);
        assert_eq!(config.gossip.seen_ttl, DEFAULT_SEEN_TTL);
        assert_eq!(config.gossip.write_timeout, DEFAULT_WRITE_TIMEOUT);
        assert_eq!(config.gossip.max_message_size, MAX_MESSAGE_SIZE);
        assert_eq!(config.discovery.dial_timeout, DEFAULT_DIAL_TIMEOUT);
        assert_eq!(
            config.mdns.as_ref().map(|m| m.service_tag.as_str()),
            Some(DISCOVERY_SERVICE_TAG)
        );
        assert_eq!(DEFAULT_SEEN_TTL, Duration::from_secs(120));
    }

    fn memory_node(network: &MemoryNetwork) -> Node {
        let transport = network.bind(Keypair::generate().identity());
        let (_tx, rx) = mpsc::channel(1);
        Node::start(transport, rx, NodeConfig { mdns: None, ..Default::default() })
    }

    #[tokio::test]
    async fn publish_requires_join() {
        let network = MemoryNetwork::new();
        let node = memory_node(&network);

        let err = node.publish("test", b"x".to_vec()).await.unwrap_err();
        assert_eq!(err.downcast_ref::<PublishError>(), Some(&PublishError::NotJoined));

        let err = node.publish("", b"x".to_vec()).await.unwrap_err();
        assert_eq!(err.downcast_ref::<PublishError>(), Some(&PublishError::InvalidTopic));

        node.join("test").await.unwrap();
        node.publish("test", b"x".to_vec()).await.unwrap();

        node.leave("test").await.unwrap();
        let err = node.publish("test", b"x".to_vec()).await.unwrap_err();
        assert_eq!(err.downcast_ref::<PublishError>(), Some(&PublishError::NotJoined));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_final() {
        let network = MemoryNetwork::new();
        let node = memory_node(&network);
        let topic = node.join("test").await.unwrap();
        let mut sub = topic.subscribe().await.unwrap();

        node.stop().await;
        node.stop().await;

        assert!(node.is_stopped());
        assert!(sub.recv().await.is_none());
        let err = node.publish("test", b"x".to_vec()).await.unwrap_err();
        assert_eq!(err.downcast_ref::<PublishError>(), Some(&PublishError::Stopped));
        assert!(node.topics().await.is_empty());
    }

    #[tokio::test]
    async fn discovering_ourselves_is_ignored() {
        let network = MemoryNetwork::new();
        let node = memory_node(&network);
        node.add_peer(node.identity(), node.local_addr()).await.unwrap();
        assert!(node.peer_state(&node.identity()).await.is_none());
        assert!(node.connected_peers().await.is_empty());
    }
}
