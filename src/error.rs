use std::net::{Ipv4Addr, SocketAddr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BeaconError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "failed to bind {addr}: {source} (is another listener running? check with `lsof -i :{port}`)",
        port = .addr.port()
    )]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to join multicast group {group} on {interface}: {source}")]
    JoinGroup {
        group: Ipv4Addr,
        interface: Ipv4Addr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to set socket option {option}: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to send announcement to {target}: {source}")]
    Send {
        target: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode announcement: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("peer table task is no longer running")]
    PeerTableClosed,
}

pub type Result<T> = std::result::Result<T, BeaconError>;
