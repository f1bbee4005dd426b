//! # Discovery Bridge
//!
//! Turns "peer found" events into established links and keeps one record per
//! known peer.
//!
//! ## Connection States
//!
//! ```text
//!   found            dial ok / inbound
//! ─────────► Discovered ──► Connecting ──────────► Connected ──► (removed)
//!                ▲              │ dial failed                 link down
//!                │              ▼
//!                └─ found ── Failed
//! ```
//!
//! Every record passes through `Connecting` before `Connected`. A repeated
//! event for a peer that is `Connecting` or `Connected` does not dial again.
//! A failed dial is retried only when the peer is found again; a lost link
//! drops the record so the next discovery event reconnects.
//!
//! ## Duplicate Links
//!
//! When both sides dial at once two links exist. Each side keeps the link
//! dialled by the smaller identity and closes the other, so both agree
//! without exchanging anything.
//!
//! ## Link Setup
//!
//! A new link writes `Hello`, spawns its reader, and is registered with
//! [`Membership`], which adds the peer to every joined topic.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::gossip::read_link;
use crate::identity::Identity;
use crate::membership::{Direction, LinkDown, Membership, PeerLink};
use crate::messages::{Frame, encode_frame};
use crate::protocols::{PeerStream, Transport};

// ============================================================================
// Configuration
// ============================================================================

/// Deadline for a single outbound connection attempt.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Peer records kept before the least recently touched idle one is evicted.
pub const MAX_KNOWN_PEERS: usize = 1024;

const BRIDGE_COMMAND_BUFFER: usize = 256;

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub dial_timeout: Duration,
    pub max_known_peers: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            max_known_peers: MAX_KNOWN_PEERS,
        }
    }
}

// ============================================================================
// Public types
// ============================================================================

/// A peer announced itself at `addr`. Produced by local discovery or by
/// static configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerFound {
    pub peer: Identity,
    pub addr: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Discovered, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Failed, Discovered)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer: Identity,
    pub last_known_addr: String,
    pub state: ConnectionState,
}

impl PeerRecord {
    fn new(peer: Identity, addr: String) -> Self {
        Self {
            peer,
            last_known_addr: addr,
            state: ConnectionState::Discovered,
        }
    }

    /// Move to `next` if the state machine allows it.
    fn advance(&mut self, next: ConnectionState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            debug!(
                peer = %hex::encode(&self.peer.as_bytes()[..8]),
                from = ?self.state,
                to = ?next,
                "ignoring invalid connection state transition"
            );
            false
        }
    }

    /// Walk the legal path from the current state to `Connected`.
    fn mark_connected(&mut self) {
        if self.state == ConnectionState::Failed {
            self.advance(ConnectionState::Discovered);
        }
        if self.state == ConnectionState::Discovered {
            self.advance(ConnectionState::Connecting);
        }
        if self.state == ConnectionState::Connecting {
            self.advance(ConnectionState::Connected);
        }
    }
}

/// Decide which of two links to the same peer survives.
///
/// The link dialled by the smaller identity wins. If both were dialled by
/// the same side the newer one wins, since the older is most likely stale.
pub fn keep_new_link(local: Identity, peer: Identity, existing: Direction, new: Direction) -> bool {
    let preferred_dialer = local.min(peer);
    let dialer = |direction| match direction {
        Direction::Outbound => local,
        Direction::Inbound => peer,
    };
    let new_preferred = dialer(new) == preferred_dialer;
    let existing_preferred = dialer(existing) == preferred_dialer;
    new_preferred || !existing_preferred
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum BridgeCommand {
    PeerFound(PeerFound),
    Inbound(PeerStream),
    DialFinished {
        peer: Identity,
        addr: String,
        result: Result<PeerStream>,
    },
    Record(Identity, oneshot::Sender<Option<PeerRecord>>),
    Records(oneshot::Sender<Vec<PeerRecord>>),
    Quit(oneshot::Sender<()>),
}

// ============================================================================
// Bridge Handle (cheap to clone)
// ============================================================================

#[derive(Clone)]
pub(crate) struct DiscoveryBridge {
    cmd_tx: mpsc::Sender<BridgeCommand>,
}

impl DiscoveryBridge {
    pub fn spawn(
        transport: Arc<dyn Transport>,
        membership: Arc<Membership>,
        config: DiscoveryConfig,
        write_timeout: Duration,
        discovery_rx: mpsc::Receiver<PeerFound>,
        link_down_tx: mpsc::UnboundedSender<LinkDown>,
        link_down_rx: mpsc::UnboundedReceiver<LinkDown>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(BRIDGE_COMMAND_BUFFER);
        let capacity =
            NonZeroUsize::new(config.max_known_peers.max(1)).unwrap_or(NonZeroUsize::MIN);

        let actor = BridgeActor {
            local: transport.local_identity(),
            transport,
            membership,
            config,
            write_timeout,
            peers: LruCache::new(capacity),
            next_link_id: 0,
            self_tx: cmd_tx.downgrade(),
            link_down_tx,
        };
        tokio::spawn(actor.run(cmd_rx, discovery_rx, link_down_rx));

        Self { cmd_tx }
    }

    pub async fn peer_found(&self, event: PeerFound) {
        let _ = self.cmd_tx.send(BridgeCommand::PeerFound(event)).await;
    }

    pub async fn inbound(&self, stream: PeerStream) {
        let _ = self.cmd_tx.send(BridgeCommand::Inbound(stream)).await;
    }

    pub async fn record(&self, peer: Identity) -> Option<PeerRecord> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(BridgeCommand::Record(peer, tx)).await.ok()?;
        rx.await.ok().flatten()
    }

    pub async fn records(&self) -> Vec<PeerRecord> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(BridgeCommand::Records(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Close every link and stop. Returns once links are closed.
    pub async fn quit(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(BridgeCommand::Quit(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

// ============================================================================
// Bridge Actor (owns peer records)
// ============================================================================

struct ActiveLink {
    link: PeerLink,
    reader: JoinHandle<()>,
}

impl ActiveLink {
    async fn close(self) {
        self.reader.abort();
        self.link.close().await;
    }
}

struct KnownPeer {
    record: PeerRecord,
    link: Option<ActiveLink>,
}

struct BridgeActor {
    local: Identity,
    transport: Arc<dyn Transport>,
    membership: Arc<Membership>,
    config: DiscoveryConfig,
    write_timeout: Duration,
    peers: LruCache<Identity, KnownPeer>,
    next_link_id: u64,
    /// Weak so that dropping every handle still ends the actor.
    self_tx: mpsc::WeakSender<BridgeCommand>,
    link_down_tx: mpsc::UnboundedSender<LinkDown>,
}

impl BridgeActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<BridgeCommand>,
        mut discovery_rx: mpsc::Receiver<PeerFound>,
        mut link_down_rx: mpsc::UnboundedReceiver<LinkDown>,
    ) {
        let mut discovery_open = true;
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(BridgeCommand::PeerFound(event)) => self.handle_peer_found(event).await,
                    Some(BridgeCommand::Inbound(stream)) => {
                        self.attach(stream, Direction::Inbound).await;
                    }
                    Some(BridgeCommand::DialFinished { peer, addr, result }) => {
                        self.handle_dial_finished(peer, addr, result).await;
                    }
                    Some(BridgeCommand::Record(peer, reply)) => {
                        let _ = reply.send(self.peers.peek(&peer).map(|k| k.record.clone()));
                    }
                    Some(BridgeCommand::Records(reply)) => {
                        let records = self.peers.iter().map(|(_, k)| k.record.clone()).collect();
                        let _ = reply.send(records);
                    }
                    Some(BridgeCommand::Quit(reply)) => {
                        self.close_all().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.close_all().await;
                        break;
                    }
                },
                event = discovery_rx.recv(), if discovery_open => match event {
                    Some(event) => self.handle_peer_found(event).await,
                    None => {
                        debug!("discovery source closed");
                        discovery_open = false;
                    }
                },
                Some(down) = link_down_rx.recv() => self.handle_link_down(down).await,
            }
        }
        debug!("discovery bridge quitting");
    }

    async fn handle_peer_found(&mut self, event: PeerFound) {
        if event.peer == self.local {
            trace!("ignoring discovery of ourselves");
            return;
        }

        if let Some(known) = self.peers.get_mut(&event.peer) {
            match known.record.state {
                ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Discovered => {
                    trace!(
                        peer = %hex::encode(&event.peer.as_bytes()[..8]),
                        state = ?known.record.state,
                        "peer already known, not dialling"
                    );
                    known.record.last_known_addr = event.addr;
                    return;
                }
                ConnectionState::Failed => {
                    known.record.last_known_addr = event.addr.clone();
                    known.record.advance(ConnectionState::Discovered);
                }
            }
        } else {
            self.make_room().await;
            self.peers.push(
                event.peer,
                KnownPeer {
                    record: PeerRecord::new(event.peer, event.addr.clone()),
                    link: None,
                },
            );
        }

        info!(
            peer = %event.peer,
            addr = %event.addr,
            "discovered new peer"
        );

        if let Some(known) = self.peers.get_mut(&event.peer) {
            known.record.advance(ConnectionState::Connecting);
        }
        self.spawn_dial(event.peer, event.addr);
    }

    fn spawn_dial(&self, peer: Identity, addr: String) {
        let Some(tx) = self.self_tx.upgrade() else { return };
        let transport = self.transport.clone();
        let dial_timeout = self.config.dial_timeout;

        tokio::spawn(async move {
            let dial = tokio::time::timeout(dial_timeout, transport.dial(peer, &addr));
            let result = match dial.await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("dial timed out after {:?}", dial_timeout)),
            };
            let _ = tx.send(BridgeCommand::DialFinished { peer, addr, result }).await;
        });
    }

    async fn handle_dial_finished(
        &mut self,
        peer: Identity,
        addr: String,
        result: Result<PeerStream>,
    ) {
        match result {
            Ok(stream) => self.attach(stream, Direction::Outbound).await,
            Err(e) => {
                warn!(
                    peer = %hex::encode(&peer.as_bytes()[..8]),
                    addr = %addr,
                    error = %e,
                    "error connecting to peer"
                );
                if let Some(known) = self.peers.peek_mut(&peer)
                    && known.record.state == ConnectionState::Connecting
                {
                    known.record.advance(ConnectionState::Failed);
                }
            }
        }
    }

    /// Turn an authenticated stream into the live link for its peer, unless
    /// an existing link wins the tie-break.
    async fn attach(&mut self, stream: PeerStream, direction: Direction) {
        let PeerStream {
            peer,
            addr,
            reader,
            writer,
        } = stream;

        if peer == self.local {
            debug!("dropping link to ourselves");
            return;
        }

        self.next_link_id += 1;
        let link = PeerLink::new(peer, self.next_link_id, direction, writer);

        let hello = match encode_frame(&Frame::Hello { identity: self.local }) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode hello");
                return;
            }
        };
        if let Err(e) = link.send(&hello, self.write_timeout).await {
            warn!(
                peer = %hex::encode(&peer.as_bytes()[..8]),
                error = %e,
                "link handshake failed"
            );
            if let Some(known) = self.peers.peek_mut(&peer)
                && known.link.is_none()
                && known.record.state == ConnectionState::Connecting
            {
                known.record.advance(ConnectionState::Failed);
            }
            return;
        }

        if !self.peers.contains(&peer) {
            self.make_room().await;
            self.peers.push(
                peer,
                KnownPeer {
                    record: PeerRecord::new(peer, addr.clone()),
                    link: None,
                },
            );
        }
        let Some(known) = self.peers.get_mut(&peer) else { return };

        let replaced = match known.link.take() {
            Some(existing)
                if !keep_new_link(self.local, peer, existing.link.direction(), direction) =>
            {
                debug!(
                    peer = %hex::encode(&peer.as_bytes()[..8]),
                    kept = ?existing.link.direction(),
                    "duplicate link, keeping existing"
                );
                known.link = Some(existing);
                link.close().await;
                return;
            }
            other => other,
        };

        known.record.mark_connected();
        if direction == Direction::Outbound {
            known.record.last_known_addr = addr.clone();
        }

        let reader = tokio::spawn(read_link(
            peer,
            link.id(),
            reader,
            self.membership.clone(),
            self.link_down_tx.clone(),
        ));
        known.link = Some(ActiveLink {
            link: link.clone(),
            reader,
        });

        // Registration replaces the old link in every topic before it closes.
        self.membership.register_link(link).await;
        if let Some(old) = replaced {
            debug!(
                peer = %hex::encode(&peer.as_bytes()[..8]),
                kept = ?direction,
                "duplicate link, replacing existing"
            );
            old.close().await;
        } else {
            debug!(
                peer = %hex::encode(&peer.as_bytes()[..8]),
                addr = %addr,
                direction = ?direction,
                "peer connected"
            );
        }
    }

    async fn handle_link_down(&mut self, down: LinkDown) {
        let current = self
            .peers
            .peek(&down.peer)
            .and_then(|k| k.link.as_ref())
            .is_some_and(|active| active.link.id() == down.link_id);

        if !current {
            trace!(
                peer = %hex::encode(&down.peer.as_bytes()[..8]),
                link = down.link_id,
                "stale link down report"
            );
            return;
        }

        if let Some(known) = self.peers.pop(&down.peer)
            && let Some(active) = known.link
        {
            active.close().await;
        }
        self.membership.unregister_link(down.peer, down.link_id).await;
        debug!(
            peer = %hex::encode(&down.peer.as_bytes()[..8]),
            "peer disconnected"
        );
    }

    /// Evict one record when full, preferring peers without a live link.
    async fn make_room(&mut self) {
        if self.peers.len() < self.peers.cap().get() {
            return;
        }
        let victim = self
            .peers
            .iter()
            .rev()
            .find(|(_, k)| k.link.is_none())
            .map(|(id, _)| *id)
            .or_else(|| self.peers.peek_lru().map(|(id, _)| *id));

        if let Some(id) = victim
            && let Some(known) = self.peers.pop(&id)
            && let Some(active) = known.link
        {
            let link_id = active.link.id();
            active.close().await;
            self.membership.unregister_link(id, link_id).await;
        }
    }

    async fn close_all(&mut self) {
        while let Some((peer, known)) = self.peers.pop_lru() {
            if let Some(active) = known.link {
                let link_id = active.link.id();
                active.close().await;
                self.membership.unregister_link(peer, link_id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(seed: u8) -> Identity {
        Identity::from_bytes([seed; 32])
    }

    #[test]
    fn state_machine_never_skips_connecting() {
        use ConnectionState::*;
        assert!(Discovered.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Discovered));

        assert!(!Discovered.can_transition_to(Connected));
        assert!(!Failed.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
    }

    #[test]
    fn mark_connected_walks_every_step() {
        let mut record = PeerRecord::new(identity(1), "mem:1".into());
        record.mark_connected();
        assert_eq!(record.state, ConnectionState::Connected);

        let mut failed = PeerRecord::new(identity(1), "mem:1".into());
        failed.advance(ConnectionState::Connecting);
        failed.advance(ConnectionState::Failed);
        failed.mark_connected();
        assert_eq!(failed.state, ConnectionState::Connected);
    }

    #[test]
    fn invalid_transition_is_refused() {
        let mut record = PeerRecord::new(identity(1), "mem:1".into());
        assert!(!record.advance(ConnectionState::Connected));
        assert_eq!(record.state, ConnectionState::Discovered);
    }

    #[test]
    fn tie_break_prefers_smaller_dialer() {
        let small = identity(1);
        let large = identity(2);

        // Seen from the smaller node: our outbound wins over their inbound.
        assert!(keep_new_link(small, large, Direction::Inbound, Direction::Outbound));
        assert!(!keep_new_link(small, large, Direction::Outbound, Direction::Inbound));

        // Seen from the larger node: their inbound wins over our outbound.
        assert!(keep_new_link(large, small, Direction::Outbound, Direction::Inbound));
        assert!(!keep_new_link(large, small, Direction::Inbound, Direction::Outbound));
    }

    #[test]
    fn tie_break_same_dialer_takes_newer() {
        let a = identity(1);
        let b = identity(2);
        assert!(keep_new_link(a, b, Direction::Outbound, Direction::Outbound));
        assert!(keep_new_link(a, b, Direction::Inbound, Direction::Inbound));
    }
}
