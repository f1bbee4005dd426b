//! # LAN Discovery
//!
//! Finds other meshcast nodes on the local network with a small multicast
//! beacon protocol, and reports them as [`PeerFound`] events.
//!
//! ## Protocol
//!
//! | Beacon | Sent | Answered with |
//! |--------|------|---------------|
//! | `Query` | once at startup | `Announce` from every listener |
//! | `Announce` | every `query_interval` (+ up to 100 ms jitter), and in reply to a query | - |
//!
//! Every beacon carries the service tag, the sender's identity and the port
//! its transport listens on. The peer address reported upward is the source
//! IP the beacon was observed from plus the advertised port.
//!
//! Beacons with a foreign service tag, our own identity, or a zero port are
//! ignored.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::discovery::PeerFound;
use crate::identity::Identity;
use crate::messages::{deserialize_bounded, serialize};

/// Tag shared by every node of one swarm.
pub const DISCOVERY_SERVICE_TAG: &str = "rymnc-pubsub";

/// Interval between periodic announcements.
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Administratively scoped group used for beacons.
pub const DEFAULT_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 70, 77);

pub const DEFAULT_MULTICAST_PORT: u16 = 5354;

const MAX_BEACON_SIZE: usize = 1024;

/// Discovery events buffered before the beacon loop waits on the consumer.
const EVENT_BUFFER: usize = 64;

#[derive(Clone, Debug)]
pub struct MdnsConfig {
    pub service_tag: String,
    pub multicast_addr: Ipv4Addr,
    pub port: u16,
    pub query_interval: Duration,
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            service_tag: DISCOVERY_SERVICE_TAG.to_string(),
            multicast_addr: DEFAULT_MULTICAST_ADDR,
            port: DEFAULT_MULTICAST_PORT,
            query_interval: DEFAULT_DISCOVERY_INTERVAL,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum BeaconKind {
    Query,
    Announce,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Beacon {
    service_tag: String,
    identity: Identity,
    port: u16,
    kind: BeaconKind,
}

/// Running discovery service. Dropping it stops the beacon loop.
pub struct Mdns {
    task: JoinHandle<()>,
}

impl Mdns {
    /// Join the multicast group and start beaconing `listen_port` under
    /// `local`'s identity.
    pub fn spawn(
        config: MdnsConfig,
        local: Identity,
        listen_port: u16,
    ) -> Result<(Self, mpsc::Receiver<PeerFound>)> {
        let recv_socket =
            bind_multicast(&config).context("failed to join discovery multicast group")?;
        let send_socket = bind_sender().context("failed to bind discovery send socket")?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let beacons = BeaconLoop {
            group: SocketAddr::new(IpAddr::V4(config.multicast_addr), config.port),
            query_interval: jittered(config.query_interval),
            config,
            local,
            listen_port,
            recv_socket,
            send_socket,
            events: tx,
        };
        let task = tokio::spawn(beacons.run());
        Ok((Self { task }, rx))
    }

    pub fn quit(&self) {
        self.task.abort();
    }
}

impl Drop for Mdns {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Randomize the interval so co-started nodes do not announce in lockstep.
fn jittered(interval: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..100);
    interval + Duration::from_millis(jitter)
}

fn bind_multicast(config: &MdnsConfig) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), config.port).into())?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(255)?;
    socket.join_multicast_v4(&config.multicast_addr, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(std::net::UdpSocket::from(socket))?)
}

fn bind_sender() -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0).into())?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(255)?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(std::net::UdpSocket::from(socket))?)
}

/// Decide whether a received beacon names a new peer.
fn interpret(
    beacon: &Beacon,
    from: SocketAddr,
    local: &Identity,
    service_tag: &str,
) -> Option<PeerFound> {
    if beacon.service_tag != service_tag || beacon.identity == *local || beacon.port == 0 {
        return None;
    }
    Some(PeerFound {
        peer: beacon.identity,
        addr: SocketAddr::new(from.ip(), beacon.port).to_string(),
    })
}

struct BeaconLoop {
    config: MdnsConfig,
    group: SocketAddr,
    query_interval: Duration,
    local: Identity,
    listen_port: u16,
    recv_socket: UdpSocket,
    send_socket: UdpSocket,
    events: mpsc::Sender<PeerFound>,
}

impl BeaconLoop {
    async fn run(self) {
        debug!(
            group = %self.group,
            tag = %self.config.service_tag,
            interval = ?self.query_interval,
            "LAN discovery started"
        );
        self.send(BeaconKind::Query).await;

        let start = tokio::time::Instant::now() + self.query_interval;
        let mut ticker = tokio::time::interval_at(start, self.query_interval);
        let mut buf = [0u8; MAX_BEACON_SIZE];

        loop {
            tokio::select! {
                _ = ticker.tick() => self.send(BeaconKind::Announce).await,
                received = self.recv_socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(error = %e, "discovery socket receive failed");
                            continue;
                        }
                    };
                    if !self.handle_packet(&buf[..len], from).await {
                        break;
                    }
                }
            }
        }
        debug!("discovery consumer gone, LAN discovery stopped");
    }

    /// Returns `false` once nobody is listening for events.
    async fn handle_packet(&self, packet: &[u8], from: SocketAddr) -> bool {
        let beacon: Beacon = match deserialize_bounded(packet) {
            Ok(b) => b,
            Err(_) => {
                trace!(from = %from, "ignoring undecodable beacon");
                return true;
            }
        };

        let Some(found) = interpret(&beacon, from, &self.local, &self.config.service_tag) else {
            return true;
        };

        if beacon.kind == BeaconKind::Query {
            self.send(BeaconKind::Announce).await;
        }

        trace!(
            peer = %hex::encode(&found.peer.as_bytes()[..8]),
            addr = %found.addr,
            "beacon received"
        );
        self.events.send(found).await.is_ok()
    }

    async fn send(&self, kind: BeaconKind) {
        let beacon = Beacon {
            service_tag: self.config.service_tag.clone(),
            identity: self.local,
            port: self.listen_port,
            kind,
        };
        let bytes = match serialize(&beacon) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to encode beacon");
                return;
            }
        };
        if let Err(e) = self.send_socket.send_to(&bytes, self.group).await {
            warn!(error = %e, group = %self.group, "failed to send discovery beacon");
        }
    }
}
