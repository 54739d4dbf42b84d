//! LAN peer discovery over IPv4 multicast.
//!
//! A node announces itself as one JSON datagram per interval on a well-known
//! group and port, listens for the announcements of other nodes on the same
//! group, and keeps a table of peers that expires nodes which fall silent.

pub mod announcer;
pub mod codec;
pub mod config;
pub mod error;
pub mod forward;
pub mod listener;
pub mod peers;
pub mod service;
pub mod shutdown;
pub mod socket;
pub mod types;

pub use announcer::{announce, Announcer};
pub use config::{AnnounceConfig, AnnounceTarget, BeaconConfig, ListenConfig, PeerTableConfig};
pub use error::{BeaconError, Result};
pub use listener::{listen, Listener};
pub use peers::{PeerEvent, PeerRecord, PeerTable};
pub use service::{run_beacon, Beacon};
pub use shutdown::Shutdown;
pub use types::{Observation, PeerAnnouncement, RawDatagram, RawReason, ReceivedAnnouncement};
