use crate::announcer::{run_announce_loop, Announcer};
use crate::config::BeaconConfig;
use crate::error::Result;
use crate::listener::Listener;
use crate::peers::{spawn_peer_table, PeerEvent, PeerRecord, PeerTableHandle};
use crate::shutdown::Shutdown;
use crate::types::{Observation, PeerAnnouncement, ReceivedAnnouncement};
use std::net::SocketAddr;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const OBSERVATION_BUFFER: usize = 256;

/// A running discovery beacon: one announce task, one listen task, one task
/// routing observations, and the task that owns the peer table.
pub struct Beacon {
    node_id: String,
    namespace: Option<String>,
    service_port: Option<u16>,
    local_addr: SocketAddr,
    peers: PeerTableHandle,
    payload: watch::Sender<PeerAnnouncement>,
    shutdown: Shutdown,
    tasks: Vec<JoinHandle<()>>,
}

impl Beacon {
    /// Bind both sockets and spawn the beacon tasks.
    ///
    /// Configuration, bind and group-join failures are returned here; once
    /// this succeeds only per-datagram problems remain, and those are logged.
    pub async fn start(
        config: BeaconConfig,
        events: Option<mpsc::Sender<PeerEvent>>,
        shutdown: Shutdown,
    ) -> Result<Self> {
        config.validate()?;

        let listener = Listener::bind(&config.listen)?;
        let announcer = Announcer::bind(&config.announce)?;
        let local_addr = listener.local_addr();

        let (peers, table_task) = spawn_peer_table(config.peers.clone(), events, shutdown.clone());
        let (observation_tx, observation_rx) = mpsc::channel(OBSERVATION_BUFFER);
        let (payload, payload_rx) = watch::channel(announcement_for(
            &config.node_id,
            config.namespace.as_deref(),
            config.service_port,
            config.agents,
        ));

        let listen_task = tokio::spawn(listener.run(observation_tx, shutdown.clone()));

        let route_task = tokio::spawn(route_observations(
            observation_rx,
            config.node_id.clone(),
            config.namespace.clone(),
            peers.clone(),
        ));

        let announce_task = tokio::spawn(run_announce_loop(
            announcer,
            payload_rx,
            config.announce.interval,
            shutdown.clone(),
        ));

        let table_task = tokio::spawn(async move {
            if let Ok(table) = table_task.await {
                debug!("Peer table closed with {} peers", table.len());
            }
        });

        info!("Beacon {} started", config.node_id);

        Ok(Self {
            node_id: config.node_id,
            namespace: config.namespace,
            service_port: config.service_port,
            local_addr,
            peers,
            payload,
            shutdown,
            tasks: vec![listen_task, route_task, announce_task, table_task],
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Address the listen socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn peers(&self) -> Result<Vec<PeerRecord>> {
        self.peers.peers().await
    }

    pub async fn peer(&self, node_id: &str) -> Result<Option<PeerRecord>> {
        self.peers.get(node_id).await
    }

    /// Change the advertised agent count from the next announcement on.
    pub fn set_agents(&self, agents: u64) {
        self.payload.send_replace(announcement_for(
            &self.node_id,
            self.namespace.as_deref(),
            self.service_port,
            agents,
        ));
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Wait for every beacon task to finish. Returns once shutdown has been
    /// triggered and the sockets are closed.
    pub async fn join(self) {
        let Beacon { tasks, peers, .. } = self;
        // the table task also stops once the last handle is gone
        drop(peers);
        for result in futures_util::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!("Beacon task failed: {}", e);
            }
        }
        info!("Beacon stopped");
    }
}

/// Run a beacon until `shutdown` is triggered.
pub async fn run_beacon(
    config: BeaconConfig,
    events: Option<mpsc::Sender<PeerEvent>>,
    shutdown: Shutdown,
) -> Result<()> {
    Beacon::start(config, events, shutdown).await?.join().await;
    Ok(())
}

fn announcement_for(
    node_id: &str,
    namespace: Option<&str>,
    service_port: Option<u16>,
    agents: u64,
) -> PeerAnnouncement {
    let mut announcement = PeerAnnouncement::new(node_id, agents);
    if let Some(tag) = namespace {
        announcement = announcement.with_namespace(tag);
    }
    if let Some(port) = service_port {
        announcement = announcement.with_port(port);
    }
    announcement
}

/// Decide whether an observation belongs in the peer table.
///
/// Our own announcements looping back and announcements from other node
/// types sharing the group are dropped; raw datagrams are only logged.
pub fn accept_observation(
    observation: Observation,
    own_node_id: &str,
    namespace: Option<&str>,
) -> Option<ReceivedAnnouncement> {
    match observation {
        Observation::Raw(raw) => {
            debug!(
                "Raw datagram from {} ({}): {:?}",
                raw.received_from,
                raw.reason,
                String::from_utf8_lossy(&raw.bytes)
            );
            None
        }
        Observation::Announcement(received) => {
            let announcement = &received.announcement;
            if announcement.node_id() == own_node_id {
                trace!("Ignoring own announcement from {}", received.received_from);
                return None;
            }
            if let Some(tag) = namespace {
                if !announcement.in_namespace(tag) {
                    trace!(
                        "Ignoring {} from {}: not in namespace {}",
                        announcement.node_id(),
                        received.received_from,
                        tag
                    );
                    return None;
                }
            }
            Some(received)
        }
    }
}

async fn route_observations(
    mut observations: mpsc::Receiver<Observation>,
    node_id: String,
    namespace: Option<String>,
    peers: PeerTableHandle,
) {
    while let Some(observation) = observations.recv().await {
        if let Some(received) = accept_observation(observation, &node_id, namespace.as_deref()) {
            if peers.observe(received).await.is_err() {
                break;
            }
        }
    }
    debug!("Observation router stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RawDatagram, RawReason};
    use chrono::Utc;

    fn observed(announcement: PeerAnnouncement) -> Observation {
        Observation::Announcement(ReceivedAnnouncement {
            announcement,
            received_from: "10.0.0.8:7077".parse().unwrap(),
            received_at: Utc::now(),
        })
    }

    #[test]
    fn drops_own_and_foreign_announcements() {
        let own = observed(announcement_for("me", Some("cortex"), None, 1));
        assert!(accept_observation(own, "me", Some("cortex")).is_none());

        let foreign = observed(PeerAnnouncement::new("printer", 0).with_namespace("other"));
        assert!(accept_observation(foreign, "me", Some("cortex")).is_none());

        let peer = observed(announcement_for("peer", Some("cortex"), None, 2));
        let accepted = accept_observation(peer, "me", Some("cortex")).unwrap();
        assert_eq!(accepted.announcement.node_id(), "peer");
    }

    #[test]
    fn own_announcement_carries_service_port() {
        let announcement = announcement_for("me", Some("cortex"), Some(29170), 3);
        assert_eq!(announcement.port(), Some(29170));
        assert_eq!(announcement.agents(), Some(3));
        assert!(announcement.in_namespace("cortex"));
        assert_eq!(announcement_for("me", None, None, 3).port(), None);
    }

    #[test]
    fn without_namespace_everything_else_is_accepted() {
        let peer = observed(PeerAnnouncement::new("peer", 0));
        assert!(accept_observation(peer, "me", None).is_some());
    }

    #[test]
    fn raw_datagrams_never_reach_the_table() {
        let raw = Observation::Raw(RawDatagram {
            received_from: "10.0.0.8:7077".parse().unwrap(),
            received_at: Utc::now(),
            bytes: b"garbage".to_vec(),
            reason: RawReason::InvalidJson("expected value".into()),
        });
        assert!(accept_observation(raw, "me", None).is_none());
    }
}
