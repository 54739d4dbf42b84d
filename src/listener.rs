use crate::codec;
use crate::config::ListenConfig;
use crate::error::{BeaconError, Result};
use crate::forward::forward_stream;
use crate::shutdown::Shutdown;
use crate::socket;
use crate::types::{GenericBoxedStream, Observation};
use async_stream::stream;
use chrono::Utc;
use futures_util::Stream;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

const RECV_BACKOFF_MIN: Duration = Duration::from_millis(10);
const RECV_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Receiving half of the beacon.
///
/// A `Listener` only exists once its socket is bound (and the group joined),
/// so every startup failure surfaces from [`Listener::bind`] rather than from
/// the first receive. Dropping it leaves the group and closes the socket.
#[derive(Debug)]
pub struct Listener {
    socket: UdpSocket,
    local_addr: SocketAddr,
    group: Option<Ipv4Addr>,
    interface: Ipv4Addr,
    max_datagram_size: usize,
}

impl Listener {
    pub fn bind(config: &ListenConfig) -> Result<Self> {
        config.validate()?;
        let socket = socket::bind_listener(config)?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| BeaconError::Bind {
                addr: config.bind_socket_addr(),
                source,
            })?;

        match config.group {
            Some(group) => info!("Listening for announcements on {} via {}", group, local_addr),
            None => info!("Listening for announcements on {}", local_addr),
        }

        Ok(Self {
            socket,
            local_addr,
            group: config.group,
            interface: config.interface,
            max_datagram_size: config.max_datagram_size,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn group(&self) -> Option<Ipv4Addr> {
        self.group
    }

    /// Endless stream of observations. It owns the socket: once dropped it
    /// cannot be restarted, a new listener has to be bound.
    pub fn into_stream(self) -> impl Stream<Item = Observation> + Send {
        stream! {
            let mut buf = vec![0u8; self.max_datagram_size + 1];
            let mut backoff = RecvBackoff::default();
            loop {
                match self.socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        backoff.reset();
                        yield codec::classify(&buf[..len], from, Utc::now(), self.max_datagram_size);
                    }
                    Err(e) => {
                        let (pause, report) = backoff.failed();
                        if report {
                            warn!(
                                "UDP receive error on {} ({} in a row): {}",
                                self.local_addr, backoff.consecutive, e
                            );
                        }
                        time::sleep(pause).await;
                    }
                }
            }
        }
    }

    /// Deliver observations to `sink` until shutdown or until the receiver
    /// is dropped.
    pub async fn run(self, sink: mpsc::Sender<Observation>, shutdown: Shutdown) {
        let local_addr = self.local_addr;
        let stream: GenericBoxedStream<Observation> = Box::pin(self.into_stream());
        forward_stream(stream, sink, &shutdown).await;
        info!("Listener on {} stopped", local_addr);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(group) = self.group {
            match self.socket.leave_multicast_v4(group, self.interface) {
                Ok(()) => debug!("Left multicast group {}", group),
                Err(e) => debug!("Failed to leave multicast group {}: {}", group, e),
            }
        }
    }
}

/// Pause between failing receives. Doubles per consecutive error up to
/// [`RECV_BACKOFF_MAX`]; only the 1st, 2nd, 4th, 8th... error is reported.
#[derive(Debug, Default)]
struct RecvBackoff {
    consecutive: u32,
}

impl RecvBackoff {
    fn reset(&mut self) {
        self.consecutive = 0;
    }

    fn failed(&mut self) -> (Duration, bool) {
        self.consecutive = self.consecutive.saturating_add(1);
        let doublings = (self.consecutive - 1).min(16);
        let pause = RECV_BACKOFF_MIN
            .saturating_mul(1 << doublings)
            .min(RECV_BACKOFF_MAX);
        (pause, self.consecutive.is_power_of_two())
    }
}

/// Bind a listener and return its observation stream.
pub fn listen(config: &ListenConfig) -> Result<GenericBoxedStream<Observation>> {
    let listener = Listener::bind(config)?;
    Ok(Box::pin(listener.into_stream()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawReason;
    use futures_util::StreamExt;

    fn loopback_config() -> ListenConfig {
        ListenConfig {
            bind_addr: Ipv4Addr::LOCALHOST,
            port: 0,
            group: None,
            ..ListenConfig::default()
        }
    }

    #[test]
    fn receive_errors_back_off_and_are_reported_sparsely() {
        let mut backoff = RecvBackoff::default();
        let failures: Vec<(Duration, bool)> = (0..10).map(|_| backoff.failed()).collect();

        assert_eq!(failures[0], (Duration::from_millis(10), true));
        assert_eq!(failures[1], (Duration::from_millis(20), true));
        assert_eq!(failures[2], (Duration::from_millis(40), false));
        assert_eq!(failures[3], (Duration::from_millis(80), true));
        assert_eq!(failures[9], (RECV_BACKOFF_MAX, false));
        let reported = failures.iter().filter(|(_, report)| *report).count();
        assert_eq!(reported, 4);

        for _ in 0..1000 {
            assert!(backoff.failed().0 <= RECV_BACKOFF_MAX);
        }

        backoff.reset();
        assert_eq!(backoff.failed(), (RECV_BACKOFF_MIN, true));
    }

    #[tokio::test]
    async fn rejects_invalid_config_before_binding() {
        let config = ListenConfig {
            max_datagram_size: 0,
            ..loopback_config()
        };
        assert!(matches!(
            Listener::bind(&config),
            Err(BeaconError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn oversized_datagram_is_reported_truncated() {
        let config = ListenConfig {
            max_datagram_size: 16,
            ..loopback_config()
        };
        let listener = Listener::bind(&config).unwrap();
        let target = listener.local_addr();
        let mut stream = Box::pin(listener.into_stream());

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(&[b'x'; 64], target).await.unwrap();

        let observation = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        match observation {
            Observation::Raw(raw) => {
                assert_eq!(raw.reason, RawReason::Truncated { limit: 16 });
                assert_eq!(raw.bytes, vec![b'x'; 16]);
            }
            other => panic!("expected raw datagram, got {:?}", other),
        }
    }
}
