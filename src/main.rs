use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use meshcast::{Identity, Keypair, Node, NodeConfig};

#[derive(Clone, Debug)]
struct StaticPeer {
    addr: SocketAddr,
    identity: Identity,
}

impl FromStr for StaticPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, id_part) = s
            .rsplit_once('/')
            .context("peer must include Identity (format: IP:PORT/IDENTITY)")?;

        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        let identity = Identity::from_hex(id_part)
            .context("Identity must be 64 hex characters (32 bytes)")?;

        Ok(StaticPeer { addr, identity })
    }
}

#[derive(Parser, Debug)]
#[command(name = "meshcast")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Publish `--message` on the topic every `--interval-ms`.
    #[arg(long, conflicts_with = "subscriber")]
    publisher: bool,

    /// Log every message received on the topic.
    #[arg(long)]
    subscriber: bool,

    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    #[arg(short, long, default_value = "test")]
    topic: String,

    #[arg(long, default_value = "5")]
    interval_ms: u64,

    #[arg(short, long, default_value = "heartbeat")]
    message: String,

    /// Peer to connect to without waiting for discovery.
    #[arg(short = 'P', long = "peer", value_name = "PEER")]
    peers: Vec<StaticPeer>,

    /// Disable LAN discovery.
    #[arg(long)]
    no_discovery: bool,
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

    if args.publisher == args.subscriber {
        bail!("exactly one of --publisher or --subscriber is required");
    }

    let mut config = NodeConfig::default();
    if args.no_discovery {
        config.mdns = None;
    }

    let node = Node::bind_with_config(&args.bind.to_string(), Keypair::generate(), config).await?;
    info!("Node identity: {}", node.identity());
    info!("Listening on {}", node.local_addr());

    for peer in &args.peers {
        info!("Adding static peer {}/{}", peer.addr, peer.identity);
        if let Err(e) = node.add_peer(peer.identity, &peer.addr.to_string()).await {
            warn!(error = %e, "failed to add static peer");
        }
    }

    let topic = node.join(&args.topic).await?;

    if args.publisher {
        let mut interval = time::interval(Duration::from_millis(args.interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, exiting gracefully");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = topic.publish(args.message.as_bytes().to_vec()).await {
                        warn!(error = %e, "publish failed");
                    }
                }
            }
        }
    } else {
        let mut subscription = topic.subscribe().await?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, exiting gracefully");
                    break;
                }
                received = subscription.recv() => {
                    let Some(msg) = received else { break };
                    info!(
                        from = %msg.source,
                        msg = %String::from_utf8_lossy(&msg.data),
                        "received message"
                    );
                }
            }
        }
    }

    node.stop().await;
    Ok(())
}
