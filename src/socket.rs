use crate::config::{AnnounceConfig, AnnounceTarget, ListenConfig};
use crate::error::{BeaconError, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tracing::debug;

fn option_err(option: &'static str) -> impl FnOnce(std::io::Error) -> BeaconError {
    move |source| BeaconError::SocketOption { option, source }
}

fn new_udp_socket() -> Result<Socket> {
    Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(option_err("socket"))
}

/// Hand a configured socket over to tokio. Must run inside a runtime.
fn into_tokio(socket: Socket) -> Result<UdpSocket> {
    socket.set_nonblocking(true).map_err(option_err("O_NONBLOCK"))?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(option_err("register"))
}

/// Bind the receive socket and join the group, all before the first receive.
pub fn bind_listener(config: &ListenConfig) -> Result<UdpSocket> {
    let socket = new_udp_socket()?;

    if config.reuse_address {
        socket.set_reuse_address(true).map_err(option_err("SO_REUSEADDR"))?;
        // BSD stacks only share a bound multicast port with SO_REUSEPORT as well
        #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
        socket.set_reuse_port(true).map_err(option_err("SO_REUSEPORT"))?;
    }

    let addr = config.bind_socket_addr();
    socket
        .bind(&addr.into())
        .map_err(|source| BeaconError::Bind { addr, source })?;

    if let Some(group) = config.group {
        socket
            .join_multicast_v4(&group, &config.interface)
            .map_err(|source| BeaconError::JoinGroup {
                group,
                interface: config.interface,
                source,
            })?;
        debug!("Joined multicast group {} on {}", group, config.interface);
    }

    into_tokio(socket)
}

/// Create the send socket, with TTL or broadcast set before any send.
pub fn bind_sender(config: &AnnounceConfig) -> Result<UdpSocket> {
    let socket = new_udp_socket()?;

    match &config.target {
        AnnounceTarget::Multicast { ttl, .. } => {
            socket
                .set_multicast_ttl_v4(*ttl)
                .map_err(option_err("IP_MULTICAST_TTL"))?;
            if !config.interface.is_unspecified() {
                socket
                    .set_multicast_if_v4(&config.interface)
                    .map_err(option_err("IP_MULTICAST_IF"))?;
            }
        }
        AnnounceTarget::Broadcast { .. } => {
            socket.set_broadcast(true).map_err(option_err("SO_BROADCAST"))?;
        }
        AnnounceTarget::Unicast { .. } => {}
    }

    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    socket
        .bind(&addr.into())
        .map_err(|source| BeaconError::Bind { addr, source })?;

    into_tokio(socket)
}
