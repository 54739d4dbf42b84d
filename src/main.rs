use clap::{Args as ClapArgs, Parser, Subcommand};
use cortex_beacon::config::{
    AnnounceConfig, AnnounceTarget, BeaconConfig, ListenConfig, PeerTableConfig,
    DEFAULT_ANNOUNCE_INTERVAL, DEFAULT_GROUP, DEFAULT_PORT,
};
use cortex_beacon::shutdown::select_stream_or_shutdown;
use cortex_beacon::{listen, Observation, PeerAnnouncement, PeerEvent, Shutdown};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::{signal, sync::mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_COMMIT_HASH"), ")");

#[derive(Parser, Debug, Clone)]
#[command(author, version = VERSION, about)]
struct Args {
    #[arg(long, default_value_t = DEFAULT_GROUP, help = "Discovery multicast group")]
    group: Ipv4Addr,
    #[arg(long, default_value_t = DEFAULT_PORT, help = "Discovery port")]
    port: u16,
    /// Interface used to join the group and to send multicast
    #[arg(long, default_value = "0.0.0.0")]
    interface: Ipv4Addr,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
struct ReceiveArgs {
    #[arg(long, default_value = "0.0.0.0", help = "Address to bind the listen socket to")]
    bind: Ipv4Addr,
    /// Do not join the multicast group; receive broadcast and unicast only
    #[arg(long)]
    no_group: bool,
    /// Bind without SO_REUSEADDR
    #[arg(long)]
    exclusive: bool,
    #[arg(long, default_value = "1024", help = "Largest datagram accepted, in bytes")]
    max_datagram: usize,
}

#[derive(ClapArgs, Debug, Clone)]
struct SendArgs {
    #[arg(long, help = "Identifier announced for this node")]
    node_id: String,
    #[arg(long, default_value = "0")]
    agents: u64,
    /// Port of this node's service, announced so peers can connect to it
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    service_port: Option<u16>,
    /// Node type tag, sent as "<tag>": true and required of peers
    #[arg(long)]
    namespace: Option<String>,
    #[arg(long, default_value = "2", help = "Multicast hop limit")]
    ttl: u32,
    /// Send to 255.255.255.255 instead of the multicast group
    #[arg(long, conflicts_with = "to")]
    broadcast: bool,
    /// Send to a single peer instead of the multicast group
    #[arg(long)]
    to: Option<SocketAddr>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Print every datagram received on the discovery port
    Listen {
        #[command(flatten)]
        receive: ReceiveArgs,
    },

    /// Send a single announcement and exit
    Announce {
        #[command(flatten)]
        send: SendArgs,
    },

    /// Announce periodically and track peers until interrupted
    Run {
        #[command(flatten)]
        send: SendArgs,
        #[command(flatten)]
        receive: ReceiveArgs,
        #[arg(
            long,
            default_value_t = DEFAULT_ANNOUNCE_INTERVAL.as_secs(),
            help = "Announce interval, in seconds"
        )]
        interval: u64,
        /// Missed announce intervals before a peer is dropped
        #[arg(long, default_value = "3")]
        expiry_intervals: u32,
    },
}

impl Args {
    fn listen_config(&self, receive: &ReceiveArgs) -> ListenConfig {
        ListenConfig {
            bind_addr: receive.bind,
            port: self.port,
            group: (!receive.no_group).then_some(self.group),
            interface: self.interface,
            reuse_address: !receive.exclusive,
            max_datagram_size: receive.max_datagram,
        }
    }

    fn announce_config(&self, send: &SendArgs, interval: Duration) -> AnnounceConfig {
        let target = if let Some(addr) = send.to {
            AnnounceTarget::Unicast { addr }
        } else if send.broadcast {
            AnnounceTarget::Broadcast { port: self.port }
        } else {
            AnnounceTarget::Multicast {
                group: self.group,
                port: self.port,
                ttl: send.ttl,
            }
        };
        AnnounceConfig {
            target,
            interface: self.interface,
            interval,
        }
    }
}

fn announcement(send: &SendArgs) -> PeerAnnouncement {
    let mut announcement = PeerAnnouncement::new(send.node_id.clone(), send.agents);
    if let Some(tag) = &send.namespace {
        announcement = announcement.with_namespace(tag);
    }
    if let Some(port) = send.service_port {
        announcement = announcement.with_port(port);
    }
    announcement
}

fn log_observation(observation: &Observation) {
    match observation {
        Observation::Announcement(received) => {
            let json = serde_json::to_string_pretty(&received.announcement)
                .unwrap_or_else(|_| format!("{:?}", received.announcement));
            info!("Received from {}:\n{}", received.received_from.ip(), json);
        }
        Observation::Raw(raw) => {
            warn!(
                "Raw data from {} ({}): {:?}",
                raw.received_from.ip(),
                raw.reason,
                String::from_utf8_lossy(&raw.bytes)
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    info!("cortex-beacon {} starting", VERSION);

    let shutdown = Shutdown::new();
    tokio::spawn({
        let interrupt_handle = shutdown.clone();
        async move {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Stopping...");
            interrupt_handle.trigger();
        }
    });

    match &args.command {
        Command::Listen { receive } => {
            let config = args.listen_config(receive);
            let mut stream = listen(&config).unwrap_or_else(|e| {
                error!("{}", e);
                std::process::exit(1);
            });
            loop {
                match select_stream_or_shutdown(stream.as_mut(), &shutdown).await {
                    Ok(Some(observation)) => log_observation(&observation),
                    Ok(None) => break,
                    Err(()) => {
                        info!("Shutdown requested");
                        break;
                    }
                }
            }
        }
        Command::Announce { send } => {
            let config = args.announce_config(send, DEFAULT_ANNOUNCE_INTERVAL);
            info!("Sending to {}...", config.target.destination());
            if let Err(e) = cortex_beacon::announce(&config, &announcement(send)).await {
                error!("{}", e);
                std::process::exit(1);
            }
            info!("Sent!");
        }
        Command::Run {
            send,
            receive,
            interval,
            expiry_intervals,
        } => {
            let interval = Duration::from_secs(*interval);
            let config = BeaconConfig {
                node_id: send.node_id.clone(),
                agents: send.agents,
                service_port: send.service_port,
                namespace: send.namespace.clone(),
                announce: args.announce_config(send, interval),
                listen: args.listen_config(receive),
                peers: PeerTableConfig::for_interval(interval, *expiry_intervals),
            };

            let (events_tx, mut events_rx) = mpsc::channel(64);
            let event_logger = tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    match event {
                        PeerEvent::Joined(peer) => info!(
                            "Peer joined: {} at {} ({} agents)",
                            peer.node_id,
                            peer.service_addr.unwrap_or(peer.address),
                            peer.announcement.agents_raw()
                        ),
                        PeerEvent::Expired(peer) => info!("Peer expired: {}", peer.node_id),
                    }
                }
            });

            if let Err(e) = cortex_beacon::run_beacon(config, Some(events_tx), shutdown).await {
                error!("{}", e);
                std::process::exit(1);
            }
            let _ = event_logger.await;
        }
    }

    Ok(())
}
