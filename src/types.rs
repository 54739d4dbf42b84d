use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::pin::Pin;

/// Value of the wire `"type"` member on every discovery announcement.
pub const ANNOUNCEMENT_KIND: &str = "discovery";

/// Members with a dedicated field; they never land in `extra`.
const RESERVED_FIELDS: [&str; 4] = ["node_id", "type", "agents", "seq"];

/// Optional member carrying the port a node serves on.
const PORT_FIELD: &str = "port";

/// One node's announcement as it travels on the wire.
///
/// Built with [`PeerAnnouncement::new`] and the `with_*` methods; there are no
/// setters, so a value never changes after it has been handed to a sender or
/// received by a listener.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PeerAnnouncement {
    node_id: String,
    #[serde(rename = "type")]
    kind: String,
    /// Kept as sent; peers are not rejected over a malformed count.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    agents: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seq: Option<u64>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl PeerAnnouncement {
    pub fn new(node_id: impl Into<String>, agents: u64) -> Self {
        Self {
            node_id: node_id.into(),
            kind: ANNOUNCEMENT_KIND.to_string(),
            agents: Value::from(agents),
            seq: None,
            extra: Map::new(),
        }
    }

    /// Tag the announcement with a node type, carried as `"<tag>": true`.
    pub fn with_namespace(self, tag: &str) -> Self {
        self.with_field(tag, Value::Bool(true))
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    /// Advertise the port this node serves on, next to its source address.
    pub fn with_port(self, port: u16) -> Self {
        self.with_field(PORT_FIELD, Value::from(port))
    }

    /// Attach an opaque member. Names of the dedicated fields are ignored.
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        if !RESERVED_FIELDS.contains(&key) {
            self.extra.insert(key.to_string(), value);
        }
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Agent count, when the sender put a non-negative integer there.
    pub fn agents(&self) -> Option<u64> {
        self.agents.as_u64()
    }

    /// The `agents` member exactly as received; `Null` when absent.
    pub fn agents_raw(&self) -> &Value {
        &self.agents
    }

    /// Announced service port, when present and a valid non-zero port.
    pub fn port(&self) -> Option<u16> {
        self.extra
            .get(PORT_FIELD)
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
            .filter(|port| *port != 0)
    }

    pub fn seq(&self) -> Option<u64> {
        self.seq
    }

    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    pub fn in_namespace(&self, tag: &str) -> bool {
        matches!(self.extra.get(tag), Some(Value::Bool(true)))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReceivedAnnouncement {
    pub announcement: PeerAnnouncement,
    pub received_from: SocketAddr,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawReason {
    InvalidUtf8,
    InvalidJson(String),
    NotAnnouncement(String),
    Truncated { limit: usize },
}

impl std::fmt::Display for RawReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawReason::InvalidUtf8 => write!(f, "not valid UTF-8"),
            RawReason::InvalidJson(e) => write!(f, "not valid JSON: {}", e),
            RawReason::NotAnnouncement(e) => write!(f, "not an announcement: {}", e),
            RawReason::Truncated { limit } => write!(f, "larger than {} bytes", limit),
        }
    }
}

/// A datagram that could not be decoded, kept for visibility.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDatagram {
    pub received_from: SocketAddr,
    pub received_at: DateTime<Utc>,
    pub bytes: Vec<u8>,
    pub reason: RawReason,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Observation {
    Announcement(ReceivedAnnouncement),
    Raw(RawDatagram),
}

impl Observation {
    pub fn received_from(&self) -> SocketAddr {
        match self {
            Observation::Announcement(a) => a.received_from,
            Observation::Raw(r) => r.received_from,
        }
    }
}

pub type GenericBoxedStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_marker_must_be_true() {
        let tagged = PeerAnnouncement::new("a", 0).with_namespace("cortex");
        assert!(tagged.in_namespace("cortex"));
        assert!(!tagged.in_namespace("other"));

        let falsy = PeerAnnouncement::new("a", 0).with_field("cortex", Value::Bool(false));
        assert!(!falsy.in_namespace("cortex"));
    }

    #[test]
    fn announced_port_must_be_a_valid_port() {
        assert_eq!(PeerAnnouncement::new("a", 0).with_port(29170).port(), Some(29170));
        assert_eq!(PeerAnnouncement::new("a", 0).port(), None);
        assert_eq!(PeerAnnouncement::new("a", 0).with_field("port", Value::from(70_000)).port(), None);
        assert_eq!(PeerAnnouncement::new("a", 0).with_field("port", Value::from("80")).port(), None);
        assert_eq!(PeerAnnouncement::new("a", 0).with_port(0).port(), None);
    }

    #[test]
    fn reserved_fields_are_not_shadowed() {
        let a = PeerAnnouncement::new("a", 3).with_field("node_id", Value::from("b"));
        assert_eq!(a.node_id(), "a");
        assert!(a.extra().is_empty());
    }
}
