use crate::codec;
use crate::config::AnnounceConfig;
use crate::error::{BeaconError, Result};
use crate::shutdown::Shutdown;
use crate::socket;
use crate::types::PeerAnnouncement;
use chrono::Utc;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Sending half of the beacon. Owns its socket exclusively.
#[derive(Debug)]
pub struct Announcer {
    socket: UdpSocket,
    target: SocketAddr,
}

impl Announcer {
    pub fn bind(config: &AnnounceConfig) -> Result<Self> {
        config.validate()?;
        let socket = socket::bind_sender(config)?;
        Ok(Self {
            socket,
            target: config.target.destination(),
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Transmit exactly one datagram carrying `announcement`.
    pub async fn announce(&self, announcement: &PeerAnnouncement) -> Result<()> {
        let bytes = codec::encode(announcement)?;
        self.socket
            .send_to(&bytes, self.target)
            .await
            .map_err(|source| BeaconError::Send {
                target: self.target,
                source,
            })?;
        debug!(
            "Sent announcement for {} ({} bytes) to {}",
            announcement.node_id(),
            bytes.len(),
            self.target
        );
        Ok(())
    }
}

/// Bind a sender and transmit a single announcement.
pub async fn announce(config: &AnnounceConfig, announcement: &PeerAnnouncement) -> Result<()> {
    Announcer::bind(config)?.announce(announcement).await
}

/// Announce every `interval` until shutdown.
///
/// The payload is read from `payload` on each cycle, so the owner can change
/// it (e.g. the agent count) while the loop runs. Every send gets a fresh
/// sequence number, seeded from the wall clock so a restarted node never
/// reuses numbers it sent before.
pub async fn run_announce_loop(
    announcer: Announcer,
    payload: watch::Receiver<PeerAnnouncement>,
    interval: Duration,
    shutdown: Shutdown,
) {
    info!("Announcing every {:?} to {}", interval, announcer.target());

    let mut seq = Utc::now().timestamp_millis().max(0) as u64;
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                info!("Announcer: shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                let announcement = payload.borrow().clone().with_seq(seq);
                seq = seq.wrapping_add(1);
                if let Err(e) = announcer.announce(&announcement).await {
                    warn!("{}; retrying next cycle", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnnounceTarget;

    #[tokio::test]
    async fn invalid_target_fails_before_binding() {
        let config = AnnounceConfig {
            target: AnnounceTarget::Multicast {
                group: "192.168.1.1".parse().unwrap(),
                port: 7077,
                ttl: 2,
            },
            ..AnnounceConfig::default()
        };
        assert!(matches!(
            Announcer::bind(&config),
            Err(BeaconError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn sends_one_json_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = AnnounceConfig {
            target: AnnounceTarget::Unicast {
                addr: receiver.local_addr().unwrap(),
            },
            ..AnnounceConfig::default()
        };
        let announcement = PeerAnnouncement::new("TEST_SENDER", 1).with_namespace("cortex");
        announce(&config, &announcement).await.unwrap();

        let mut buf = [0u8; 1024];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(codec::decode(&buf[..len]).unwrap(), announcement);
    }
}
