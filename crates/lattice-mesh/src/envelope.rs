use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::address::Address;
use crate::error::CodecError;

/// Default lifetime of locally produced envelopes, in seconds.
pub const DEFAULT_MAX_AGE_SECS: i32 = 30;

/// Sentinel in a [`Party`] `account` field marking the counterpart as a mesh
/// node rather than a user account. Matched case-insensitively.
pub const NODE_ACCOUNT: &str = "Node";

/// Addressing half of an envelope: the logical account plus the signing key
/// that stands behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub account: String,
    pub signer: Address,
}

impl Party {
    pub fn node(signer: Address) -> Self {
        Party {
            account: NODE_ACCOUNT.to_string(),
            signer,
        }
    }

    pub fn account(account: &Address, signer: Address) -> Self {
        Party {
            account: account.to_string(),
            signer,
        }
    }

    pub fn is_node(&self) -> bool {
        self.account.eq_ignore_ascii_case(NODE_ACCOUNT)
    }

    /// The `account` field parsed as an address, when it is one.
    pub fn account_address(&self) -> Option<Address> {
        if self.is_node() {
            None
        } else {
            self.account.parse().ok()
        }
    }
}

/// An SDP session description as carried inside `Offer`/`Answer` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// The polymorphic envelope payload. The wire tag is the exact PascalCase
/// variant name; unknown tags are rejected at the codec boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    Offer {
        offer: SessionDescription,
    },
    Answer {
        answer: SessionDescription,
    },
    Rejection,
    Candidate {
        candidate: String,
        #[serde(rename = "sdpMid")]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u16>,
    },
    Broadcast {
        text: String,
    },
    Relay {
        receiver: String,
        text: String,
    },
}

const KNOWN_KINDS: [&str; 6] = [
    "Offer",
    "Answer",
    "Rejection",
    "Candidate",
    "Broadcast",
    "Relay",
];

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Offer { .. } => "Offer",
            Payload::Answer { .. } => "Answer",
            Payload::Rejection => "Rejection",
            Payload::Candidate { .. } => "Candidate",
            Payload::Broadcast { .. } => "Broadcast",
            Payload::Relay { .. } => "Relay",
        }
    }
}

/// The outer message shape exchanged over signalling and the data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub timestamp: i64,
    pub max_age: i32,
    pub priority: i32,
    pub sequence: i64,
    pub sender: Party,
    pub receiver: Party,
    pub payload: Payload,
    pub signature: String,
}

impl MessageEnvelope {
    /// A fresh unsigned envelope stamped with the current time.
    pub fn build(sender: Party, receiver: Party, payload: Payload, sequence: i64) -> Self {
        MessageEnvelope {
            timestamp: Utc::now().timestamp(),
            max_age: DEFAULT_MAX_AGE_SECS,
            priority: 0,
            sequence,
            sender,
            receiver,
            payload,
            signature: String::new(),
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now - self.timestamp > self.max_age as i64
    }

    /// The byte view covered by the signature: the envelope serialized with
    /// the signature field cleared.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = String::new();
        serialize(&unsigned).into_bytes()
    }
}

pub fn serialize(envelope: &MessageEnvelope) -> String {
    serde_json::to_string(envelope).expect("envelope serialization is infallible")
}

/// Whether `text` even looks like an envelope: well-formed JSON carrying a
/// `payload.type` string. Frames failing this are silently droppable.
pub fn is_envelope(text: &str) -> bool {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return false,
    };
    value
        .get("payload")
        .and_then(|payload| payload.get("type"))
        .map(Value::is_string)
        .unwrap_or(false)
}

/// Decode an envelope, distinguishing structural failures from unknown
/// payload tags so callers can log them apart.
pub fn deserialize(text: &str) -> Result<MessageEnvelope, CodecError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| CodecError::BadFormat(err.to_string()))?;

    let tag = value
        .get("payload")
        .and_then(|payload| payload.get("type"))
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingPayload)?;

    // Exact comparison; no aliases, no case folding.
    if !KNOWN_KINDS.contains(&tag) {
        return Err(CodecError::UnknownKind(tag.to_string()));
    }

    serde_json::from_value(value).map_err(|err| CodecError::BadFormat(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer(byte: char) -> Address {
        byte.to_string().repeat(40).parse().unwrap()
    }

    fn envelope_with(payload: Payload) -> MessageEnvelope {
        MessageEnvelope::build(
            Party::node(signer('a')),
            Party::node(signer('b')),
            payload,
            7,
        )
    }

    #[test]
    fn round_trips_every_payload_variant() {
        let variants = vec![
            Payload::Offer {
                offer: SessionDescription {
                    kind: "offer".into(),
                    sdp: "v=0\r\n".into(),
                },
            },
            Payload::Answer {
                answer: SessionDescription {
                    kind: "answer".into(),
                    sdp: "v=0\r\n".into(),
                },
            },
            Payload::Rejection,
            Payload::Candidate {
                candidate: "candidate:1 1 udp 2130706431 10.0.0.2 54321 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
            Payload::Broadcast { text: "hi".into() },
            Payload::Relay {
                receiver: signer('c').to_string(),
                text: "fwd".into(),
            },
        ];
        for payload in variants {
            let envelope = envelope_with(payload);
            let text = serialize(&envelope);
            assert!(is_envelope(&text));
            let back = deserialize(&text).expect("round trip");
            assert_eq!(back, envelope);
        }
    }

    #[test]
    fn tag_comparison_is_exact() {
        let mut text = serialize(&envelope_with(Payload::Rejection));
        text = text.replace("\"Rejection\"", "\"rejection\"");
        assert_eq!(
            deserialize(&text),
            Err(CodecError::UnknownKind("rejection".into()))
        );
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let text = serialize(&envelope_with(Payload::Rejection)).replace("Rejection", "Gossip");
        assert_eq!(deserialize(&text), Err(CodecError::UnknownKind("Gossip".into())));
    }

    #[test]
    fn json_without_payload_tag_is_not_an_envelope() {
        assert!(!is_envelope("{\"hello\": 1}"));
        assert!(!is_envelope("{\"payload\": {\"sdp\": \"x\"}}"));
        assert!(!is_envelope("not json at all"));
        assert_eq!(
            deserialize("{\"payload\": {}}"),
            Err(CodecError::MissingPayload)
        );
    }

    #[test]
    fn payload_field_order_is_irrelevant() {
        let text = r#"{
            "timestamp": 1, "maxAge": 60, "priority": 0, "sequence": 1,
            "sender": {"signer": "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", "account": "node"},
            "receiver": {"account": "Node", "signer": "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"},
            "payload": {"sdpMid": "0", "type": "Candidate", "candidate": "candidate:1"},
            "signature": ""
        }"#;
        let envelope = deserialize(text).expect("order independent");
        assert!(envelope.sender.is_node());
        assert_eq!(envelope.payload.kind(), "Candidate");
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let envelope = envelope_with(Payload::Candidate {
            candidate: "candidate:1".into(),
            sdp_mid: None,
            sdp_mline_index: Some(0),
        });
        let text = serialize(&envelope);
        assert!(text.contains("\"maxAge\""));
        assert!(text.contains("\"sdpMid\""));
        assert!(text.contains("\"sdpMLineIndex\""));
        assert!(text.contains("\"type\":\"Candidate\""));
        assert!(!text.contains("max_age"));
    }

    #[test]
    fn signable_bytes_ignore_the_signature_itself() {
        let mut envelope = envelope_with(Payload::Broadcast { text: "x".into() });
        let before = envelope.signable_bytes();
        envelope.signature = "deadbeef".into();
        assert_eq!(envelope.signable_bytes(), before);
    }

    #[test]
    fn expiry_uses_max_age_seconds() {
        let mut envelope = envelope_with(Payload::Broadcast { text: "x".into() });
        envelope.timestamp = 1_000;
        envelope.max_age = 60;
        assert!(!envelope.is_expired(1_050));
        assert!(!envelope.is_expired(1_060));
        assert!(envelope.is_expired(1_061));
    }

    #[test]
    fn node_marker_is_case_insensitive() {
        let party = Party {
            account: "NODE".into(),
            signer: signer('a'),
        };
        assert!(party.is_node());
        assert!(party.account_address().is_none());

        let account = Party::account(&signer('c'), signer('d'));
        assert!(!account.is_node());
        assert_eq!(account.account_address(), Some(signer('c')));
    }
}
