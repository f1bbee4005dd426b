//! # Flood-Fill Gossip
//!
//! Each joined topic runs as its own actor. The actor owns the topic's
//! member set, its [`SeenSet`] and its local subscribers, so all
//! dissemination for one topic is serialized while different topics proceed
//! in parallel.
//!
//! ## Dissemination Rules
//!
//! | Event | Action |
//! |-------|--------|
//! | local publish | fingerprint, mark seen, write to every member |
//! | inbound, already seen | drop |
//! | inbound, own origin | mark seen, drop |
//! | inbound, new | mark seen, deliver to subscribers, write to every member except the sender |
//!
//! Local publishes are never delivered to local subscribers.
//!
//! ## Failure Handling
//!
//! A write that fails or exceeds `write_timeout` removes the peer from the
//! topic immediately and reports a [`LinkDown`] so the link is torn down for
//! every topic. Subscriber queues are bounded; a full queue drops the
//! delivery with a warning instead of stalling the topic.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, trace, warn};

use crate::cache::{DEFAULT_SEEN_CAPACITY, DEFAULT_SEEN_TTL, SeenSet};
use crate::identity::Identity;
use crate::membership::{LinkDown, Membership, PeerLink, TopicState};
use crate::messages::{
    Frame, GossipMessage, MAX_MESSAGE_SIZE, MessageId, encode_frame, read_frame,
};
use crate::protocols::BoxedReader;

// ============================================================================
// Configuration
// ============================================================================

/// Per-link write deadline.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deliveries buffered per subscriber before new ones are dropped.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Commands buffered per topic actor.
const TOPIC_COMMAND_BUFFER: usize = 1024;

#[derive(Clone, Debug)]
pub struct GossipConfig {
    /// Fingerprints remembered per topic.
    pub seen_capacity: usize,
    /// How long a fingerprint is remembered.
    pub seen_ttl: Duration,
    pub write_timeout: Duration,
    /// Largest payload accepted from local publishers. Never above
    /// [`MAX_MESSAGE_SIZE`].
    pub max_message_size: usize,
    pub subscriber_buffer: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            seen_ttl: DEFAULT_SEEN_TTL,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_message_size: MAX_MESSAGE_SIZE,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

impl GossipConfig {
    fn payload_limit(&self) -> usize {
        self.max_message_size.min(MAX_MESSAGE_SIZE)
    }
}

// ============================================================================
// Public types
// ============================================================================

/// Reasons a publish or join is refused.
///
/// Returned inside `anyhow::Error`; use `downcast_ref::<PublishError>()` to
/// match on the reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishError {
    /// The topic has not been joined, or was left.
    NotJoined,
    /// Payload exceeds the configured maximum.
    MessageTooLarge,
    /// Topic name is empty, too long, or not printable ASCII.
    InvalidTopic,
    /// The node has been stopped.
    Stopped,
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotJoined => write!(f, "topic has not been joined"),
            Self::MessageTooLarge => write!(f, "message size exceeds maximum allowed"),
            Self::InvalidTopic => write!(f, "topic name is invalid (empty, too long or non-ASCII)"),
            Self::Stopped => write!(f, "node has been stopped"),
        }
    }
}

impl std::error::Error for PublishError {}

#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub topic: String,
    /// Node that published the message.
    pub source: Identity,
    pub seqno: u64,
    pub data: Vec<u8>,
    pub msg_id: MessageId,
    /// Neighbour the message arrived from.
    pub received_from: Identity,
}

// ============================================================================
// Topic actor commands
// ============================================================================

enum TopicCommand {
    Publish(Vec<u8>, oneshot::Sender<anyhow::Result<MessageId>>),
    Inbound {
        from: Identity,
        link_id: u64,
        message: GossipMessage,
    },
    AddPeer(PeerLink),
    RemovePeer {
        peer: Identity,
        link_id: u64,
    },
    Subscribe(mpsc::Sender<ReceivedMessage>, oneshot::Sender<u64>),
    Unsubscribe(u64),
    Peers(oneshot::Sender<Vec<Identity>>),
    Seen(oneshot::Sender<Vec<MessageId>>),
    Quit,
}

/// Shared by every topic of one node.
#[derive(Clone)]
pub(crate) struct TopicContext {
    pub local: Identity,
    pub config: GossipConfig,
    /// Node-wide publish counter; makes repeated payloads distinct.
    pub seqno: Arc<AtomicU64>,
    pub link_down_tx: mpsc::UnboundedSender<LinkDown>,
}

// ============================================================================
// Topic handle (public API - cheap to clone)
// ============================================================================

/// Handle to a joined topic.
///
/// Calls on a handle whose topic has been left fail with
/// [`PublishError::NotJoined`] (or return empty results).
#[derive(Clone)]
pub struct Topic {
    name: Arc<str>,
    cmd_tx: mpsc::Sender<TopicCommand>,
    subscriber_buffer: usize,
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Topic {
    pub(crate) fn spawn(name: &str, ctx: TopicContext, initial: Vec<PeerLink>) -> Self {
        let name: Arc<str> = Arc::from(name);
        let (cmd_tx, cmd_rx) = mpsc::channel(TOPIC_COMMAND_BUFFER);
        let subscriber_buffer = ctx.config.subscriber_buffer.max(1);

        let actor = TopicActor {
            name: name.clone(),
            seen: SeenSet::new(ctx.config.seen_capacity, ctx.config.seen_ttl),
            state: TopicState::with_members(initial),
            ctx,
            subscribers: HashMap::new(),
            next_subscriber: 0,
        };
        tokio::spawn(actor.run(cmd_rx));

        Self {
            name,
            cmd_tx,
            subscriber_buffer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// False once the topic has been left or the node stopped.
    pub fn is_joined(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    /// Broadcast `data` to every reachable member of the topic.
    ///
    /// Returns the message fingerprint. Succeeds with zero members.
    pub async fn publish(&self, data: impl Into<Vec<u8>>) -> anyhow::Result<MessageId> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(TopicCommand::Publish(data.into(), tx))
            .await
            .map_err(|_| PublishError::NotJoined)?;
        rx.await.map_err(|_| PublishError::NotJoined)?
    }

    /// Receive every message first seen on this topic that another node
    /// published.
    pub async fn subscribe(&self) -> anyhow::Result<Subscription> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        self.cmd_tx
            .send(TopicCommand::Subscribe(tx, reply_tx))
            .await
            .map_err(|_| PublishError::NotJoined)?;
        let id = reply_rx.await.map_err(|_| PublishError::NotJoined)?;
        Ok(Subscription {
            id,
            topic: self.clone(),
            rx,
        })
    }

    /// Run `handler(source, payload)` for every delivery on a background task.
    ///
    /// Aborting the returned task unsubscribes.
    pub async fn subscribe_with<F>(&self, mut handler: F) -> anyhow::Result<JoinHandle<()>>
    where
        F: FnMut(Identity, Vec<u8>) + Send + 'static,
    {
        let mut subscription = self.subscribe().await?;
        Ok(tokio::spawn(async move {
            while let Some(msg) = subscription.recv().await {
                handler(msg.source, msg.data);
            }
        }))
    }

    /// Current members of the topic.
    pub async fn peers(&self) -> Vec<Identity> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(TopicCommand::Peers(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Fingerprints in the seen set, oldest first.
    pub async fn seen(&self) -> Vec<MessageId> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(TopicCommand::Seen(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub(crate) async fn add_peer(&self, link: PeerLink) {
        let _ = self.cmd_tx.send(TopicCommand::AddPeer(link)).await;
    }

    pub(crate) async fn remove_peer(&self, peer: Identity, link_id: u64) {
        let _ = self
            .cmd_tx
            .send(TopicCommand::RemovePeer { peer, link_id })
            .await;
    }

    pub(crate) async fn inbound(&self, from: Identity, link_id: u64, message: GossipMessage) {
        let _ = self
            .cmd_tx
            .send(TopicCommand::Inbound {
                from,
                link_id,
                message,
            })
            .await;
    }

    pub(crate) async fn quit(&self) {
        let _ = self.cmd_tx.send(TopicCommand::Quit).await;
    }
}

/// Stream of deliveries for one topic. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    topic: Topic,
    rx: mpsc::Receiver<ReceivedMessage>,
}

impl Subscription {
    /// Next delivery, or `None` once the topic is left or the node stops.
    pub async fn recv(&mut self) -> Option<ReceivedMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ReceivedMessage> {
        self.rx.try_recv().ok()
    }

    pub fn topic(&self) -> &str {
        self.topic.name()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // If the queue is full the actor still prunes us on the next delivery.
        let _ = self.topic.cmd_tx.try_send(TopicCommand::Unsubscribe(self.id));
    }
}

// ============================================================================
// Topic actor (owns state)
// ============================================================================

struct TopicActor {
    name: Arc<str>,
    ctx: TopicContext,
    state: TopicState,
    seen: SeenSet,
    subscribers: HashMap<u64, mpsc::Sender<ReceivedMessage>>,
    next_subscriber: u64,
}

impl TopicActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<TopicCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                TopicCommand::Publish(data, reply) => {
                    let _ = reply.send(self.handle_publish(data).await);
                }
                TopicCommand::Inbound {
                    from,
                    link_id,
                    message,
                } => {
                    self.handle_inbound(from, link_id, message).await;
                }
                TopicCommand::AddPeer(link) => {
                    let peer = link.peer();
                    if let Some(old) = self.state.add_peer(link) {
                        debug!(
                            topic = %self.name,
                            peer = %hex::encode(&peer.as_bytes()[..8]),
                            old_link = old.id(),
                            "replaced existing link for peer"
                        );
                    }
                }
                TopicCommand::RemovePeer { peer, link_id } => {
                    if self.state.remove_peer(&peer, link_id).is_some() {
                        debug!(
                            topic = %self.name,
                            peer = %hex::encode(&peer.as_bytes()[..8]),
                            "peer removed from topic"
                        );
                    }
                }
                TopicCommand::Subscribe(tx, reply) => {
                    let id = self.next_subscriber;
                    self.next_subscriber += 1;
                    self.subscribers.insert(id, tx);
                    let _ = reply.send(id);
                }
                TopicCommand::Unsubscribe(id) => {
                    self.subscribers.remove(&id);
                }
                TopicCommand::Peers(reply) => {
                    let _ = reply.send(self.state.peers());
                }
                TopicCommand::Seen(reply) => {
                    let _ = reply.send(self.seen.snapshot());
                }
                TopicCommand::Quit => break,
            }
        }
        debug!(topic = %self.name, "topic actor quitting");
    }

    async fn handle_publish(&mut self, data: Vec<u8>) -> anyhow::Result<MessageId> {
        if data.len() > self.ctx.config.payload_limit() {
            return Err(PublishError::MessageTooLarge.into());
        }

        let seqno = self.ctx.seqno.fetch_add(1, Ordering::Relaxed);
        let message = GossipMessage::new(&self.name, self.ctx.local, seqno, data);
        let msg_id = message.msg_id;

        self.seen.mark_seen(msg_id);
        self.forward(message, None).await?;

        trace!(topic = %self.name, seqno, msg_id = %hex::encode(&msg_id[..8]), "published");
        Ok(msg_id)
    }

    async fn handle_inbound(&mut self, from: Identity, link_id: u64, message: GossipMessage) {
        if message.data.len() > MAX_MESSAGE_SIZE || !message.has_consistent_id() {
            warn!(
                topic = %self.name,
                peer = %hex::encode(&from.as_bytes()[..8]),
                link = link_id,
                "dropping malformed message"
            );
            return;
        }

        if !self.seen.mark_seen(message.msg_id) {
            trace!(
                topic = %self.name,
                msg_id = %hex::encode(&message.msg_id[..8]),
                "duplicate message dropped"
            );
            return;
        }

        if message.source == self.ctx.local {
            trace!(topic = %self.name, "own message echoed back, dropped");
            return;
        }

        self.deliver(&message, from);
        if let Err(e) = self.forward(message, Some(from)).await {
            warn!(topic = %self.name, error = %e, "failed to forward message");
        }
    }

    fn deliver(&mut self, message: &GossipMessage, from: Identity) {
        let topic = &self.name;
        self.subscribers.retain(|id, tx| {
            let delivery = ReceivedMessage {
                topic: topic.to_string(),
                source: message.source,
                seqno: message.seqno,
                data: message.data.clone(),
                msg_id: message.msg_id,
                received_from: from,
            };
            match tx.try_send(delivery) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        topic = %topic,
                        subscriber = id,
                        "subscriber queue full, delivery dropped"
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Write `message` to every member except `except`, in parallel.
    async fn forward(
        &mut self,
        message: GossipMessage,
        except: Option<Identity>,
    ) -> anyhow::Result<()> {
        let targets = self.state.targets(except.as_ref());
        if targets.is_empty() {
            return Ok(());
        }

        let frame: Arc<[u8]> = encode_frame(&Frame::Publish(message))?.into();
        let timeout = self.ctx.config.write_timeout;

        let mut sends = JoinSet::new();
        for link in targets {
            let frame = frame.clone();
            sends.spawn(async move {
                let result = link.send(&frame, timeout).await;
                (link, result)
            });
        }

        while let Some(joined) = sends.join_next().await {
            let Ok((link, result)) = joined else { continue };
            match result {
                Ok(()) => trace!(
                    topic = %self.name,
                    peer = %hex::encode(&link.peer().as_bytes()[..8]),
                    "forwarded"
                ),
                Err(e) => {
                    warn!(
                        topic = %self.name,
                        peer = %hex::encode(&link.peer().as_bytes()[..8]),
                        error = %e,
                        "write to peer failed, removing it"
                    );
                    self.state.remove_peer(&link.peer(), link.id());
                    let _ = self.ctx.link_down_tx.send(LinkDown {
                        peer: link.peer(),
                        link_id: link.id(),
                    });
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Link reader
// ============================================================================

/// Read frames from one link until it closes, routing publishes to their
/// topics. Always ends by reporting the link down.
pub(crate) async fn read_link(
    peer: Identity,
    link_id: u64,
    mut reader: BoxedReader,
    membership: Arc<Membership>,
    link_down_tx: mpsc::UnboundedSender<LinkDown>,
) {
    let mut greeted = false;
    let reason = loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Hello { identity })) => {
                if identity != peer {
                    break "hello names a different identity";
                }
                greeted = true;
            }
            Ok(Some(Frame::Publish(message))) => {
                if !greeted {
                    break "publish before hello";
                }
                membership.route(peer, link_id, message).await;
            }
            Ok(None) => break "closed by peer",
            Err(e) => {
                debug!(peer = %hex::encode(&peer.as_bytes()[..8]), error = %e, "link read failed");
                break "stream error";
            }
        }
    };

    debug!(
        peer = %hex::encode(&peer.as_bytes()[..8]),
        link = link_id,
        reason,
        "link reader finished"
    );
    let _ = link_down_tx.send(LinkDown { peer, link_id });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::Direction;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    struct FailingWriter;

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn identity(seed: u8) -> Identity {
        Identity::from_bytes([seed; 32])
    }

    fn context(local: Identity) -> (TopicContext, mpsc::UnboundedReceiver<LinkDown>) {
        let (link_down_tx, link_down_rx) = mpsc::unbounded_channel();
        let ctx = TopicContext {
            local,
            config: GossipConfig::default(),
            seqno: Arc::new(AtomicU64::new(0)),
            link_down_tx,
        };
        (ctx, link_down_rx)
    }

    /// A member link plus the far end of its stream.
    fn duplex_link(peer: Identity, id: u64) -> (PeerLink, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(256 * 1024);
        (
            PeerLink::new(peer, id, Direction::Outbound, Box::new(ours)),
            theirs,
        )
    }

    async fn next_publish(stream: &mut DuplexStream) -> GossipMessage {
        match timeout(TEST_TIMEOUT, read_frame(stream)).await {
            Ok(Ok(Some(Frame::Publish(msg)))) => msg,
            other => panic!("expected publish frame, got {:?}", other.map(|r| r.ok())),
        }
    }

    async fn assert_quiet(stream: &mut DuplexStream) {
        let result = timeout(Duration::from_millis(100), read_frame(stream)).await;
        assert!(result.is_err(), "expected no frame");
    }

    #[tokio::test]
    async fn publish_reaches_members_but_not_local_subscribers() {
        let (ctx, _down) = context(identity(0));
        let (link, mut far) = duplex_link(identity(1), 1);
        let topic = Topic::spawn("news", ctx, vec![link]);
        let mut sub = topic.subscribe().await.unwrap();

        let msg_id = topic.publish(b"hello".to_vec()).await.unwrap();

        let msg = next_publish(&mut far).await;
        assert_eq!(msg.msg_id, msg_id);
        assert_eq!(msg.source, identity(0));
        assert_eq!(msg.data, b"hello");
        assert!(timeout(Duration::from_millis(100), sub.recv()).await.is_err());
    }

    #[tokio::test]
    async fn publish_without_members_succeeds() {
        let (ctx, _down) = context(identity(0));
        let topic = Topic::spawn("news", ctx, Vec::new());
        let id = topic.publish(b"x".to_vec()).await.unwrap();
        assert_eq!(topic.seen().await, vec![id]);
    }

    #[tokio::test]
    async fn oversized_publish_is_rejected() {
        let (ctx, _down) = context(identity(0));
        let topic = Topic::spawn("news", ctx, Vec::new());
        let err = topic.publish(vec![0u8; MAX_MESSAGE_SIZE + 1]).await.unwrap_err();
        assert_eq!(err.downcast_ref::<PublishError>(), Some(&PublishError::MessageTooLarge));
    }

    #[tokio::test]
    async fn inbound_is_delivered_once_and_not_echoed() {
        let (ctx, _down) = context(identity(0));
        let (to_sender, mut sender_far) = duplex_link(identity(1), 1);
        let (to_other, mut other_far) = duplex_link(identity(2), 2);
        let topic = Topic::spawn("news", ctx, vec![to_sender, to_other]);
        let mut sub = topic.subscribe().await.unwrap();

        let message = GossipMessage::new("news", identity(7), 3, b"payload".to_vec());
        topic.inbound(identity(1), 1, message.clone()).await;
        topic.inbound(identity(2), 2, message.clone()).await;

        let delivered = timeout(TEST_TIMEOUT, sub.recv()).await.unwrap().unwrap();
        assert_eq!(delivered.source, identity(7));
        assert_eq!(delivered.received_from, identity(1));
        assert_eq!(delivered.data, b"payload");
        assert!(sub.try_recv().is_none());

        assert_eq!(next_publish(&mut other_far).await, message);
        assert_quiet(&mut sender_far).await;
        assert_quiet(&mut other_far).await;
    }

    #[tokio::test]
    async fn own_message_echo_is_dropped() {
        let (ctx, _down) = context(identity(0));
        let (link, mut far) = duplex_link(identity(1), 1);
        let (other, mut other_far) = duplex_link(identity(2), 2);
        let topic = Topic::spawn("news", ctx, vec![link, other]);
        let mut sub = topic.subscribe().await.unwrap();

        let echo = GossipMessage::new("news", identity(0), 99, b"mine".to_vec());
        topic.inbound(identity(1), 1, echo.clone()).await;

        assert!(timeout(Duration::from_millis(100), sub.recv()).await.is_err());
        assert_quiet(&mut far).await;
        assert_quiet(&mut other_far).await;
        assert_eq!(topic.seen().await, vec![echo.msg_id]);
    }

    #[tokio::test]
    async fn inconsistent_id_is_dropped() {
        let (ctx, _down) = context(identity(0));
        let topic = Topic::spawn("news", ctx, Vec::new());
        let mut sub = topic.subscribe().await.unwrap();

        let mut forged = GossipMessage::new("news", identity(7), 1, b"a".to_vec());
        forged.data = b"b".to_vec();
        topic.inbound(identity(1), 1, forged).await;

        assert!(timeout(Duration::from_millis(100), sub.recv()).await.is_err());
        assert!(topic.seen().await.is_empty());
    }

    #[tokio::test]
    async fn failed_write_removes_peer_and_reports_link() {
        let (ctx, mut down) = context(identity(0));
        let broken = PeerLink::new(identity(1), 41, Direction::Inbound, Box::new(FailingWriter));
        let (healthy, mut healthy_far) = duplex_link(identity(2), 42);
        let topic = Topic::spawn("news", ctx, vec![broken, healthy]);

        topic.publish(b"first".to_vec()).await.unwrap();

        assert_eq!(topic.peers().await, vec![identity(2)]);
        let report = timeout(TEST_TIMEOUT, down.recv()).await.unwrap().unwrap();
        assert_eq!(report, LinkDown { peer: identity(1), link_id: 41 });
        assert_eq!(next_publish(&mut healthy_far).await.data, b"first");
    }

    #[tokio::test]
    async fn unsubscribing_leaves_other_subscribers_intact() {
        let (ctx, _down) = context(identity(0));
        let topic = Topic::spawn("news", ctx, Vec::new());
        let sub = topic.subscribe().await.unwrap();
        sub.unsubscribe();

        let mut kept = topic.subscribe().await.unwrap();
        let message = GossipMessage::new("news", identity(7), 1, b"x".to_vec());
        topic.inbound(identity(1), 1, message).await;
        assert!(timeout(TEST_TIMEOUT, kept.recv()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn callback_subscription_sees_source_and_payload() {
        let (ctx, _down) = context(identity(0));
        let topic = Topic::spawn("news", ctx, Vec::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = topic
            .subscribe_with(move |source, data| {
                let _ = tx.send((source, data));
            })
            .await
            .unwrap();

        topic
            .inbound(identity(1), 1, GossipMessage::new("news", identity(7), 1, b"cb".to_vec()))
            .await;

        let (source, data) = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(source, identity(7));
        assert_eq!(data, b"cb");
        task.abort();
    }

    #[tokio::test]
    async fn left_topic_refuses_publish() {
        let (ctx, _down) = context(identity(0));
        let topic = Topic::spawn("news", ctx, Vec::new());
        topic.quit().await;
        tokio::task::yield_now().await;

        let err = topic.publish(b"x".to_vec()).await.unwrap_err();
        assert_eq!(err.downcast_ref::<PublishError>(), Some(&PublishError::NotJoined));
        assert!(topic.peers().await.is_empty());
    }

    #[tokio::test]
    async fn reader_rejects_mismatched_hello() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let membership = Arc::new(Membership::new(identity(0), GossipConfig::default(), tx));
        let (link_down_tx, mut link_down_rx) = mpsc::unbounded_channel();

        let (mut writer, reader) = tokio::io::duplex(1024);
        let task = tokio::spawn(read_link(
            identity(1),
            5,
            Box::new(reader),
            membership,
            link_down_tx,
        ));

        writer
            .write_all(&encode_frame(&Frame::Hello { identity: identity(2) }).unwrap())
            .await
            .unwrap();

        let report = timeout(TEST_TIMEOUT, link_down_rx.recv()).await.unwrap().unwrap();
        assert_eq!(report, LinkDown { peer: identity(1), link_id: 5 });
        task.await.unwrap();
    }
}
