use crate::config::PeerTableConfig;
use crate::error::{BeaconError, Result};
use crate::shutdown::Shutdown;
use crate::types::{PeerAnnouncement, ReceivedAnnouncement};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 64;

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct PeerRecord {
    pub node_id: String,
    pub announcement: PeerAnnouncement,
    /// Source of the datagram the stored announcement came from.
    pub address: SocketAddr,
    /// Source IP with the announced service port, when the peer sent one.
    pub service_addr: Option<SocketAddr>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// When the stored announcement was accepted.
    pub updated_at: DateTime<Utc>,
    pub announcements_seen: u64,
}

impl PeerRecord {
    /// Time since the peer was last heard from; zero if `now` is earlier.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_seen).to_std().unwrap_or_default()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PeerEvent {
    Joined(PeerRecord),
    Expired(PeerRecord),
}

/// Peers currently visible, keyed by node id.
#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<String, PeerRecord>,
    reorder_window: Duration,
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new(PeerTableConfig::default().reorder_window)
    }
}

impl PeerTable {
    /// `reorder_window` bounds how long a lower sequence number is taken for
    /// a late datagram rather than a restarted peer.
    pub fn new(reorder_window: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            reorder_window,
        }
    }

    /// Record an announcement. Returns the new record when the peer was not
    /// known before.
    ///
    /// Datagrams may arrive duplicated or out of order. A lower sequence
    /// number than the stored one is ignored while it arrives within the
    /// reorder window of the stored announcement; later than that, or from a
    /// different source IP, it means the peer restarted and replaces the
    /// entry. `last_seen` only ever moves forward.
    pub fn observe(&mut self, received: &ReceivedAnnouncement) -> Option<PeerRecord> {
        let node_id = received.announcement.node_id();
        let reorder_window = self.reorder_window;

        if let Some(record) = self.peers.get_mut(node_id) {
            record.announcements_seen += 1;
            if received.received_at > record.last_seen {
                record.last_seen = received.received_at;
            }
            if supersedes(received, record, reorder_window) {
                record.announcement = received.announcement.clone();
                record.address = received.received_from;
                record.service_addr = service_addr(received);
                record.updated_at = received.received_at;
            } else {
                debug!(
                    "Ignoring late announcement from {} (seq {:?} < {:?})",
                    node_id,
                    received.announcement.seq(),
                    record.announcement.seq()
                );
            }
            return None;
        }

        let record = PeerRecord {
            node_id: node_id.to_string(),
            announcement: received.announcement.clone(),
            address: received.received_from,
            service_addr: service_addr(received),
            first_seen: received.received_at,
            last_seen: received.received_at,
            updated_at: received.received_at,
            announcements_seen: 1,
        };
        self.peers.insert(record.node_id.clone(), record.clone());
        Some(record)
    }

    /// Drop every peer silent for longer than `expiry` and return them.
    pub fn expire(&mut self, now: DateTime<Utc>, expiry: Duration) -> Vec<PeerRecord> {
        let stale: Vec<String> = self
            .peers
            .values()
            .filter(|record| record.age(now) > expiry)
            .map(|record| record.node_id.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|node_id| self.peers.remove(&node_id))
            .collect()
    }

    pub fn get(&self, node_id: &str) -> Option<&PeerRecord> {
        self.peers.get(node_id)
    }

    /// All peers, ordered by node id.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

fn supersedes(
    received: &ReceivedAnnouncement,
    stored: &PeerRecord,
    reorder_window: Duration,
) -> bool {
    if received.received_from.ip() != stored.address.ip() {
        return true;
    }
    match (received.announcement.seq(), stored.announcement.seq()) {
        (Some(new), Some(old)) if new < old => {
            let since_stored = (received.received_at - stored.updated_at)
                .to_std()
                .unwrap_or_default();
            since_stored > reorder_window
        }
        _ => true,
    }
}

fn service_addr(received: &ReceivedAnnouncement) -> Option<SocketAddr> {
    received
        .announcement
        .port()
        .map(|port| SocketAddr::new(received.received_from.ip(), port))
}

enum Command {
    Observe(ReceivedAnnouncement),
    Get(String, oneshot::Sender<Option<PeerRecord>>),
    Snapshot(oneshot::Sender<Vec<PeerRecord>>),
}

/// Cheap, cloneable access to the table owned by the table task.
#[derive(Clone, Debug)]
pub struct PeerTableHandle {
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Observe(r) => write!(f, "Observe({})", r.announcement.node_id()),
            Command::Get(id, _) => write!(f, "Get({})", id),
            Command::Snapshot(_) => write!(f, "Snapshot"),
        }
    }
}

impl PeerTableHandle {
    pub async fn observe(&self, received: ReceivedAnnouncement) -> Result<()> {
        self.tx
            .send(Command::Observe(received))
            .await
            .map_err(|_| BeaconError::PeerTableClosed)
    }

    pub async fn get(&self, node_id: &str) -> Result<Option<PeerRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Get(node_id.to_string(), reply))
            .await
            .map_err(|_| BeaconError::PeerTableClosed)?;
        rx.await.map_err(|_| BeaconError::PeerTableClosed)
    }

    pub async fn peers(&self) -> Result<Vec<PeerRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot(reply))
            .await
            .map_err(|_| BeaconError::PeerTableClosed)?;
        rx.await.map_err(|_| BeaconError::PeerTableClosed)
    }
}

/// Start the task that owns the peer table. It runs until shutdown or until
/// every handle is dropped, and hands the final table back through its
/// join handle.
pub fn spawn_peer_table(
    config: PeerTableConfig,
    events: Option<mpsc::Sender<PeerEvent>>,
    shutdown: Shutdown,
) -> (PeerTableHandle, JoinHandle<PeerTable>) {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let table = PeerTable::new(config.reorder_window);
    let task = tokio::spawn(run_peer_table(table, rx, config, events, shutdown));
    (PeerTableHandle { tx }, task)
}

async fn run_peer_table(
    mut table: PeerTable,
    mut commands: mpsc::Receiver<Command>,
    config: PeerTableConfig,
    mut events: Option<mpsc::Sender<PeerEvent>>,
    shutdown: Shutdown,
) -> PeerTable {
    let mut sweep = time::interval(config.sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                debug!("Peer table: shutdown signal received");
                break;
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    debug!("Peer table: all handles dropped");
                    break;
                };
                match command {
                    Command::Observe(received) => {
                        if let Some(record) = table.observe(&received) {
                            info!("Discovered peer {} at {}", record.node_id, record.address);
                            emit(&mut events, PeerEvent::Joined(record));
                        }
                    }
                    Command::Get(node_id, reply) => {
                        let _ = reply.send(table.get(&node_id).cloned());
                    }
                    Command::Snapshot(reply) => {
                        let _ = reply.send(table.snapshot());
                    }
                }
            }
            _ = sweep.tick() => {
                for record in table.expire(Utc::now(), config.expiry) {
                    info!(
                        "Peer {} expired after {:?} of silence",
                        record.node_id,
                        config.expiry
                    );
                    emit(&mut events, PeerEvent::Expired(record));
                }
            }
        }
    }

    table
}

/// Never blocks the table task on a slow consumer.
fn emit(events: &mut Option<mpsc::Sender<PeerEvent>>, event: PeerEvent) {
    let Some(tx) = events else {
        return;
    };
    match tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            warn!("Peer event channel full, dropping {:?}", event);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Peer event receiver dropped");
            *events = None;
        }
    }
}
