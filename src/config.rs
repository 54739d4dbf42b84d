use crate::error::{BeaconError, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 70, 77);
pub const DEFAULT_PORT: u16 = 7077;
pub const DEFAULT_TTL: u32 = 2;
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1024;
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_EXPIRY_INTERVALS: u32 = 3;
/// Announce intervals during which a lower `seq` is treated as reordering.
pub const REORDER_INTERVALS: u32 = 2;

/// Largest UDP payload over IPv4.
const MAX_UDP_PAYLOAD: usize = 65_507;

/// Where announcements are sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnnounceTarget {
    Multicast { group: Ipv4Addr, port: u16, ttl: u32 },
    Broadcast { port: u16 },
    /// A fixed peer, for networks that filter multicast and broadcast.
    Unicast { addr: SocketAddr },
}

impl AnnounceTarget {
    pub fn destination(&self) -> SocketAddr {
        match self {
            AnnounceTarget::Multicast { group, port, .. } => {
                SocketAddr::V4(SocketAddrV4::new(*group, *port))
            }
            AnnounceTarget::Broadcast { port } => {
                SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, *port))
            }
            AnnounceTarget::Unicast { addr } => *addr,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            AnnounceTarget::Multicast { group, port, ttl } => {
                validate_group(*group)?;
                validate_port(*port)?;
                if !(1..=255).contains(ttl) {
                    return Err(BeaconError::InvalidConfig(format!(
                        "multicast ttl must be between 1 and 255, got {}",
                        ttl
                    )));
                }
            }
            AnnounceTarget::Broadcast { port } => validate_port(*port)?,
            AnnounceTarget::Unicast { addr } => {
                validate_port(addr.port())?;
                if addr.ip().is_unspecified() {
                    return Err(BeaconError::InvalidConfig(
                        "unicast target must not be the unspecified address".into(),
                    ));
                }
                if !matches!(addr.ip(), IpAddr::V4(_)) {
                    return Err(BeaconError::InvalidConfig(
                        "only IPv4 unicast targets are supported".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for AnnounceTarget {
    fn default() -> Self {
        AnnounceTarget::Multicast {
            group: DEFAULT_GROUP,
            port: DEFAULT_PORT,
            ttl: DEFAULT_TTL,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnounceConfig {
    pub target: AnnounceTarget,
    /// Outgoing interface for multicast; unspecified lets the kernel pick.
    pub interface: Ipv4Addr,
    pub interval: Duration,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            target: AnnounceTarget::default(),
            interface: Ipv4Addr::UNSPECIFIED,
            interval: DEFAULT_ANNOUNCE_INTERVAL,
        }
    }
}

impl AnnounceConfig {
    pub fn validate(&self) -> Result<()> {
        self.target.validate()?;
        if self.interval.is_zero() {
            return Err(BeaconError::InvalidConfig(
                "announce interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenConfig {
    pub bind_addr: Ipv4Addr,
    /// Port 0 binds an ephemeral port, which is only useful for unicast.
    pub port: u16,
    /// Multicast group to join; `None` receives broadcast and unicast only.
    pub group: Option<Ipv4Addr>,
    pub interface: Ipv4Addr,
    pub reuse_address: bool,
    pub max_datagram_size: usize,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind_addr: Ipv4Addr::UNSPECIFIED,
            port: DEFAULT_PORT,
            group: Some(DEFAULT_GROUP),
            interface: Ipv4Addr::UNSPECIFIED,
            reuse_address: true,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }
}

impl ListenConfig {
    pub fn bind_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.bind_addr, self.port))
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(group) = self.group {
            validate_group(group)?;
        }
        if self.max_datagram_size == 0 || self.max_datagram_size > MAX_UDP_PAYLOAD {
            return Err(BeaconError::InvalidConfig(format!(
                "max datagram size must be between 1 and {}, got {}",
                MAX_UDP_PAYLOAD, self.max_datagram_size
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerTableConfig {
    /// Silence after which a peer is dropped.
    pub expiry: Duration,
    pub sweep_interval: Duration,
    /// How long after a stored announcement one with a lower `seq` from the
    /// same host still counts as reordered rather than a restart.
    pub reorder_window: Duration,
}

impl PeerTableConfig {
    /// Expire peers after `missed` announce intervals without news.
    pub fn for_interval(interval: Duration, missed: u32) -> Self {
        let expiry = interval.saturating_mul(missed.max(1));
        Self {
            expiry,
            sweep_interval: interval.min(expiry),
            reorder_window: interval.saturating_mul(REORDER_INTERVALS),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.expiry.is_zero() || self.sweep_interval.is_zero() {
            return Err(BeaconError::InvalidConfig(
                "peer expiry and sweep interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for PeerTableConfig {
    fn default() -> Self {
        Self::for_interval(DEFAULT_ANNOUNCE_INTERVAL, DEFAULT_EXPIRY_INTERVALS)
    }
}

/// Everything a running beacon needs. Passed by value into
/// [`crate::service::run_beacon`]; there is no process-wide state.
#[derive(Clone, Debug)]
pub struct BeaconConfig {
    pub node_id: String,
    pub agents: u64,
    /// Port of the node's own service, announced as `"port"` so peers can
    /// connect to it.
    pub service_port: Option<u16>,
    /// Node type tag announced as `"<tag>": true`, and required of peers.
    pub namespace: Option<String>,
    pub announce: AnnounceConfig,
    pub listen: ListenConfig,
    pub peers: PeerTableConfig,
}

impl BeaconConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            agents: 0,
            service_port: None,
            namespace: None,
            announce: AnnounceConfig::default(),
            listen: ListenConfig::default(),
            peers: PeerTableConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(BeaconError::InvalidConfig("node id must not be empty".into()));
        }
        if let Some(ns) = &self.namespace {
            if ns.is_empty() {
                return Err(BeaconError::InvalidConfig("namespace must not be empty".into()));
            }
        }
        if self.service_port == Some(0) {
            return Err(BeaconError::InvalidConfig("service port must not be 0".into()));
        }
        self.announce.validate()?;
        self.listen.validate()?;
        self.peers.validate()
    }
}

fn validate_group(group: Ipv4Addr) -> Result<()> {
    if !group.is_multicast() {
        return Err(BeaconError::InvalidConfig(format!(
            "{} is not an IPv4 multicast address (224.0.0.0/4)",
            group
        )));
    }
    Ok(())
}

fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(BeaconError::InvalidConfig("port must be between 1 and 65535".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_cortex_network() {
        let config = BeaconConfig::new("node");
        assert_eq!(
            config.announce.target.destination(),
            "239.255.70.77:7077".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.listen.group, Some(DEFAULT_GROUP));
        assert!(config.listen.reuse_address);
        assert_eq!(config.peers.expiry, Duration::from_secs(90));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_non_multicast_group() {
        let target = AnnounceTarget::Multicast {
            group: Ipv4Addr::new(10, 0, 0, 1),
            port: DEFAULT_PORT,
            ttl: 2,
        };
        assert!(matches!(target.validate(), Err(BeaconError::InvalidConfig(_))));

        let listen = ListenConfig {
            group: Some(Ipv4Addr::new(192, 168, 0, 1)),
            ..ListenConfig::default()
        };
        assert!(listen.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let zero_ttl = AnnounceTarget::Multicast { group: DEFAULT_GROUP, port: 7077, ttl: 0 };
        assert!(zero_ttl.validate().is_err());
        assert!(AnnounceTarget::Broadcast { port: 0 }.validate().is_err());

        let mut config = BeaconConfig::new("  ");
        assert!(config.validate().is_err());
        config.node_id = "ok".into();
        config.listen.max_datagram_size = 70_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn expiry_scales_with_interval() {
        let peers = PeerTableConfig::for_interval(Duration::from_secs(5), 4);
        assert_eq!(peers.expiry, Duration::from_secs(20));
        assert_eq!(peers.sweep_interval, Duration::from_secs(5));
        assert_eq!(peers.reorder_window, Duration::from_secs(10));
    }

    #[test]
    fn service_port_zero_is_rejected() {
        let mut config = BeaconConfig::new("A");
        config.service_port = Some(0);
        assert!(config.validate().is_err());
        config.service_port = Some(29170);
        assert!(config.validate().is_ok());
    }
}
