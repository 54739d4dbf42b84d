//! Wire encoding: one UTF-8 JSON object per datagram, no framing.

use crate::error::Result;
use crate::types::{
    Observation, PeerAnnouncement, RawDatagram, RawReason, ReceivedAnnouncement,
    ANNOUNCEMENT_KIND,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::net::SocketAddr;

pub fn encode(announcement: &PeerAnnouncement) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(announcement)?)
}

pub fn decode(bytes: &[u8]) -> std::result::Result<PeerAnnouncement, RawReason> {
    let text = std::str::from_utf8(bytes).map_err(|_| RawReason::InvalidUtf8)?;
    let value: Value =
        serde_json::from_str(text).map_err(|e| RawReason::InvalidJson(e.to_string()))?;
    if !value.is_object() {
        return Err(RawReason::NotAnnouncement("expected a JSON object".into()));
    }
    let announcement: PeerAnnouncement =
        serde_json::from_value(value).map_err(|e| RawReason::NotAnnouncement(e.to_string()))?;
    if announcement.kind() != ANNOUNCEMENT_KIND {
        return Err(RawReason::NotAnnouncement(format!(
            "unexpected type '{}'",
            announcement.kind()
        )));
    }
    Ok(announcement)
}

/// Turn one received datagram into an observation. Never fails: anything
/// that does not decode is handed back as a [`RawDatagram`].
///
/// `datagram` may be one byte longer than `limit`; the listener reads with
/// that extra byte so it can tell a full-size datagram from a cut-off one.
pub fn classify(
    datagram: &[u8],
    received_from: SocketAddr,
    received_at: DateTime<Utc>,
    limit: usize,
) -> Observation {
    let raw = |reason| {
        Observation::Raw(RawDatagram {
            received_from,
            received_at,
            bytes: datagram[..datagram.len().min(limit)].to_vec(),
            reason,
        })
    };

    if datagram.len() > limit {
        return raw(RawReason::Truncated { limit });
    }

    match decode(datagram) {
        Ok(announcement) => Observation::Announcement(ReceivedAnnouncement {
            announcement,
            received_from,
            received_at,
        }),
        Err(reason) => raw(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sender() -> SocketAddr {
        "192.168.1.20:7077".parse().unwrap()
    }

    #[test]
    fn decodes_test_sender_payload() {
        let wire = br#"{"cortex": true, "node_id": "TEST_SENDER", "type": "discovery", "agents": 1}"#;
        let announcement = decode(wire).unwrap();
        assert_eq!(announcement.node_id(), "TEST_SENDER");
        assert_eq!(announcement.agents(), Some(1));
        assert_eq!(announcement.seq(), None);
        assert!(announcement.in_namespace("cortex"));
    }

    #[test]
    fn round_trips_announcements() {
        let samples = vec![
            PeerAnnouncement::new("A", 0),
            PeerAnnouncement::new("node-7", 12).with_namespace("cortex").with_seq(41),
            PeerAnnouncement::new("ñode", 3)
                .with_field("capabilities", json!(["gpu", "llm"]))
                .with_field("version", json!("1.2.0")),
        ];
        for announcement in samples {
            let bytes = encode(&announcement).unwrap();
            assert_eq!(decode(&bytes).unwrap(), announcement);
        }
    }

    #[test]
    fn missing_agents_is_absent() {
        let announcement = decode(br#"{"node_id":"x","type":"discovery"}"#).unwrap();
        assert_eq!(announcement.agents(), None);
        assert_eq!(announcement.agents_raw(), &Value::Null);
        assert_eq!(decode(&encode(&announcement).unwrap()).unwrap(), announcement);
    }

    #[test]
    fn odd_agent_counts_do_not_reject_the_peer() {
        let cases: [(&[u8], Value); 3] = [
            (br#"{"node_id":"x","type":"discovery","agents":"3"}"#, json!("3")),
            (br#"{"node_id":"x","type":"discovery","agents":-1}"#, json!(-1)),
            (br#"{"node_id":"x","type":"discovery","agents":null}"#, Value::Null),
        ];
        for (wire, raw) in cases {
            let announcement = decode(wire).unwrap();
            assert_eq!(announcement.node_id(), "x");
            assert_eq!(announcement.agents(), None);
            assert_eq!(announcement.agents_raw(), &raw);
        }
    }

    #[test]
    fn rejects_non_announcements() {
        assert_eq!(decode(&[0xff, 0xfe, 0x00]), Err(RawReason::InvalidUtf8));
        assert!(matches!(decode(b"hello"), Err(RawReason::InvalidJson(_))));
        assert!(matches!(decode(b"[1,2]"), Err(RawReason::NotAnnouncement(_))));
        assert!(matches!(
            decode(br#"{"type":"discovery","agents":1}"#),
            Err(RawReason::NotAnnouncement(_))
        ));
        assert!(matches!(
            decode(br#"{"node_id":"x","type":"heartbeat"}"#),
            Err(RawReason::NotAnnouncement(_))
        ));
    }

    #[test]
    fn classify_keeps_raw_bytes_and_sender() {
        let now = Utc::now();
        match classify(b"not json", sender(), now, 1024) {
            Observation::Raw(raw) => {
                assert_eq!(raw.bytes, b"not json");
                assert_eq!(raw.received_from, sender());
                assert_eq!(raw.received_at, now);
            }
            other => panic!("expected raw datagram, got {:?}", other),
        }
    }

    #[test]
    fn classify_flags_oversized_datagrams() {
        let mut wire = encode(&PeerAnnouncement::new("big", 1)).unwrap();
        let limit = wire.len() - 1;
        wire.truncate(limit + 1);
        match classify(&wire, sender(), Utc::now(), limit) {
            Observation::Raw(raw) => {
                assert_eq!(raw.reason, RawReason::Truncated { limit });
                assert_eq!(raw.bytes.len(), limit);
            }
            other => panic!("expected truncated datagram, got {:?}", other),
        }
    }
}
