//! # Topic Membership
//!
//! Tracks which peer links each joined topic forwards to.
//!
//! - [`PeerLink`]: the write half of an established link, shared by every
//!   topic the peer is a member of
//! - [`TopicState`]: per-topic member set, owned by that topic's actor
//! - [`Membership`]: registry of joined topics plus the set of live links;
//!   joining a topic seeds it with every live link, and registering a link
//!   adds it to every joined topic
//!
//! Peers are members of *all* local topics. Nothing is negotiated with the
//! remote side, so a peer that never joined a topic simply drops what it
//! receives for it.
//!
//! Each link carries a numeric id. Removal requests name the id they refer to
//! so that the teardown of a replaced link cannot evict its successor.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, trace};

use crate::gossip::{GossipConfig, PublishError, Topic, TopicContext};
use crate::identity::Identity;
use crate::messages::{GossipMessage, is_valid_topic};
use crate::protocols::BoxedWriter;

/// Upper bound on a graceful writer shutdown.
const LINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Which side opened the link. Used to settle duplicate links.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Write half of an established peer link.
///
/// Cheap to clone. Whole frames are written under the lock, so frames from
/// different topics never interleave on the wire.
#[derive(Clone)]
pub(crate) struct PeerLink {
    peer: Identity,
    id: u64,
    direction: Direction,
    writer: Arc<Mutex<BoxedWriter>>,
}

impl PeerLink {
    pub fn new(peer: Identity, id: u64, direction: Direction, writer: BoxedWriter) -> Self {
        Self {
            peer,
            id,
            direction,
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn peer(&self) -> Identity {
        self.peer
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Write one pre-encoded frame, failing if it does not complete in time.
    pub async fn send(&self, frame: &[u8], timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, async {
            let mut writer = self.writer.lock().await;
            writer.write_all(frame).await?;
            writer.flush().await
        })
        .await
        .context("write timed out")?
        .context("write failed")
    }

    /// Best-effort shutdown of the write half; the remote reader sees EOF.
    pub async fn close(&self) {
        let _ = tokio::time::timeout(LINK_CLOSE_TIMEOUT, async {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        })
        .await;
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer", &self.peer)
            .field("id", &self.id)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

/// Report that a link is unusable. Sent by readers on EOF or error and by
/// topic actors on write failure; consumed by the discovery bridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LinkDown {
    pub peer: Identity,
    pub link_id: u64,
}

// ============================================================================
// Per-topic member set
// ============================================================================

#[derive(Default)]
pub(crate) struct TopicState {
    members: HashMap<Identity, PeerLink>,
}

impl TopicState {
    pub fn with_members(links: impl IntoIterator<Item = PeerLink>) -> Self {
        let mut state = Self::default();
        for link in links {
            state.add_peer(link);
        }
        state
    }

    /// Insert or replace the link for `link.peer()`. Last writer wins; the
    /// replaced link is returned.
    pub fn add_peer(&mut self, link: PeerLink) -> Option<PeerLink> {
        self.members.insert(link.peer(), link)
    }

    /// Remove `peer` if its current link is `link_id`.
    pub fn remove_peer(&mut self, peer: &Identity, link_id: u64) -> Option<PeerLink> {
        match self.members.get(peer) {
            Some(link) if link.id() == link_id => self.members.remove(peer),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn contains(&self, peer: &Identity) -> bool {
        self.members.contains_key(peer)
    }

    pub fn peers(&self) -> Vec<Identity> {
        self.members.keys().copied().collect()
    }

    /// Links to forward to, skipping the peer a message arrived from.
    pub fn targets(&self, except: Option<&Identity>) -> Vec<PeerLink> {
        self.members
            .values()
            .filter(|link| Some(&link.peer()) != except)
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.members.len()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Joined topics and live links.
///
/// Lock order is always `topics` then `links`, which keeps a join and a link
/// registration from missing each other.
pub(crate) struct Membership {
    ctx: TopicContext,
    topics: RwLock<HashMap<String, Topic>>,
    links: RwLock<HashMap<Identity, PeerLink>>,
}

impl Membership {
    pub fn new(
        local: Identity,
        config: GossipConfig,
        link_down_tx: mpsc::UnboundedSender<LinkDown>,
    ) -> Self {
        Self {
            ctx: TopicContext {
                local,
                config,
                seqno: Arc::new(AtomicU64::new(0)),
                link_down_tx,
            },
            topics: RwLock::new(HashMap::new()),
            links: RwLock::new(HashMap::new()),
        }
    }

    /// Join `name`, or return the existing handle if already joined.
    pub async fn join(&self, name: &str) -> Result<Topic> {
        if !is_valid_topic(name) {
            return Err(PublishError::InvalidTopic.into());
        }

        let mut topics = self.topics.write().await;
        if let Some(topic) = topics.get(name) {
            return Ok(topic.clone());
        }

        let initial: Vec<PeerLink> = self.links.read().await.values().cloned().collect();
        debug!(topic = %name, peers = initial.len(), "joining topic");
        let topic = Topic::spawn(name, self.ctx.clone(), initial);
        topics.insert(name.to_string(), topic.clone());
        Ok(topic)
    }

    /// Returns `false` if the topic was not joined.
    pub async fn leave(&self, name: &str) -> bool {
        let removed = self.topics.write().await.remove(name);
        match removed {
            Some(topic) => {
                debug!(topic = %name, "leaving topic");
                topic.quit().await;
                true
            }
            None => false,
        }
    }

    pub async fn topic(&self, name: &str) -> Option<Topic> {
        self.topics.read().await.get(name).cloned()
    }

    pub async fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Make `link` the live link for its peer and add it to every topic.
    pub async fn register_link(&self, link: PeerLink) {
        let topics = self.topics.read().await;
        self.links.write().await.insert(link.peer(), link.clone());
        for topic in topics.values() {
            topic.add_peer(link.clone()).await;
        }
    }

    /// Drop `link_id` for `peer` from the live set and from every topic.
    pub async fn unregister_link(&self, peer: Identity, link_id: u64) {
        let topics = self.topics.read().await;
        {
            let mut links = self.links.write().await;
            if links.get(&peer).is_some_and(|l| l.id() == link_id) {
                links.remove(&peer);
            }
        }
        for topic in topics.values() {
            topic.remove_peer(peer, link_id).await;
        }
    }

    /// Hand an inbound message to its topic, or drop it if not joined.
    pub async fn route(&self, from: Identity, link_id: u64, message: GossipMessage) {
        let topic = self.topics.read().await.get(&message.topic).cloned();
        match topic {
            Some(topic) => topic.inbound(from, link_id, message).await,
            None => trace!(
                topic = %message.topic,
                peer = %hex::encode(&from.as_bytes()[..8]),
                "dropping message for topic we have not joined"
            ),
        }
    }

    /// Leave every topic and forget every link.
    pub async fn shutdown(&self) {
        let drained: Vec<Topic> = self.topics.write().await.drain().map(|(_, t)| t).collect();
        for topic in drained {
            topic.quit().await;
        }
        self.links.write().await.clear();
    }
}
