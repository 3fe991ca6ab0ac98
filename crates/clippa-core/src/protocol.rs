//! Party wire protocol.
//!
//! Every frame is one JSON envelope:
//! `{"data": ..., "sender": "...", "messageType": "...", "createdAt": 0}`.
//! The `messageType` tag selects exactly one payload schema. The hub relays
//! raw frames verbatim; decoding only happens at the validation boundary.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ids::MemberId;

/// A raw text frame, shared by every recipient of a broadcast.
pub type Frame = Arc<str>;

/// Error token sent back when a frame fails validation.
pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
/// Error token sent back when a leader change could not be persisted.
pub const LEADER_NOT_SET: &str = "LEADER_NOT_SET";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Ping,
    Pong,
    Joined,
    Left,
    LeaderUnreachable,
    SetLeader,
    LeaderElected,
    Conclave,
    Inconclusive,
    Vote,
    Clipboard,
    Error,
}

impl MessageType {
    pub const ALL: [MessageType; 12] = [
        Self::Ping,
        Self::Pong,
        Self::Joined,
        Self::Left,
        Self::LeaderUnreachable,
        Self::SetLeader,
        Self::LeaderElected,
        Self::Conclave,
        Self::Inconclusive,
        Self::Vote,
        Self::Clipboard,
        Self::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Joined => "joined",
            Self::Left => "left",
            Self::LeaderUnreachable => "leader-unreachable",
            Self::SetLeader => "set-leader",
            Self::LeaderElected => "leader-elected",
            Self::Conclave => "conclave",
            Self::Inconclusive => "inconclusive",
            Self::Vote => "vote",
            Self::Clipboard => "clipboard",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl ProtocolError {
    /// Token carried in the `error` frame sent back to the client.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidMessage(_) => INVALID_MESSAGE,
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidMessage(e.to_string())
    }
}

/// Payload of presence and heartbeat messages. Serializes as `{}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderData {
    pub address: String,
    pub generation: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConclaveData {
    pub addresses: Vec<String>,
    pub generation: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InconclusiveData {
    pub generation: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub address: String,
    pub reachable: bool,
    #[serde(rename = "latency", alias = "latencyMillis")]
    pub latency_millis: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteData {
    pub ballots: Vec<Ballot>,
    pub generation: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipboardData {
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub error: String,
}

/// Decoded payload, one variant per message type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Ping,
    Pong,
    Joined,
    Left,
    LeaderUnreachable,
    SetLeader(LeaderData),
    LeaderElected(LeaderData),
    Conclave(ConclaveData),
    Inconclusive(InconclusiveData),
    Vote(VoteData),
    Clipboard(ClipboardData),
    Error(ErrorData),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Ping => MessageType::Ping,
            Self::Pong => MessageType::Pong,
            Self::Joined => MessageType::Joined,
            Self::Left => MessageType::Left,
            Self::LeaderUnreachable => MessageType::LeaderUnreachable,
            Self::SetLeader(_) => MessageType::SetLeader,
            Self::LeaderElected(_) => MessageType::LeaderElected,
            Self::Conclave(_) => MessageType::Conclave,
            Self::Inconclusive(_) => MessageType::Inconclusive,
            Self::Vote(_) => MessageType::Vote,
            Self::Clipboard(_) => MessageType::Clipboard,
            Self::Error(_) => MessageType::Error,
        }
    }
}

/// A validated envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypedMessage {
    pub sender: String,
    pub created_at: i64,
    pub payload: Payload,
}

impl TypedMessage {
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }
}

#[derive(Deserialize)]
struct Header {
    #[serde(rename = "messageType")]
    message_type: MessageType,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    data: T,
    sender: Option<String>,
    message_type: MessageType,
    created_at: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingEnvelope<'a, T> {
    data: &'a T,
    sender: &'a str,
    message_type: MessageType,
    created_at: i64,
}

/// Decode only the `messageType` header of a raw frame.
pub fn message_type(raw: &str) -> Result<MessageType, ProtocolError> {
    let header: Header = serde_json::from_str(raw)?;
    Ok(header.message_type)
}

/// Decode `data` against the schema bound to `kind`.
pub fn validate(kind: MessageType, raw: &str) -> Result<TypedMessage, ProtocolError> {
    match kind {
        MessageType::Ping => decode(kind, raw, |_: Option<Empty>| Payload::Ping),
        MessageType::Pong => decode(kind, raw, |_: Option<Empty>| Payload::Pong),
        MessageType::Joined => decode(kind, raw, |_: Option<Empty>| Payload::Joined),
        MessageType::Left => decode(kind, raw, |_: Option<Empty>| Payload::Left),
        MessageType::LeaderUnreachable => {
            decode(kind, raw, |_: Option<Empty>| Payload::LeaderUnreachable)
        }
        MessageType::SetLeader => decode(kind, raw, Payload::SetLeader),
        MessageType::LeaderElected => decode(kind, raw, Payload::LeaderElected),
        MessageType::Conclave => decode(kind, raw, Payload::Conclave),
        MessageType::Inconclusive => decode(kind, raw, Payload::Inconclusive),
        MessageType::Vote => decode(kind, raw, Payload::Vote),
        MessageType::Clipboard => decode(kind, raw, Payload::Clipboard),
        MessageType::Error => decode(kind, raw, Payload::Error),
    }
}

/// Header decode followed by schema validation.
pub fn parse(raw: &str) -> Result<TypedMessage, ProtocolError> {
    validate(message_type(raw)?, raw)
}

fn decode<T, F>(kind: MessageType, raw: &str, wrap: F) -> Result<TypedMessage, ProtocolError>
where
    T: DeserializeOwned,
    F: FnOnce(T) -> Payload,
{
    let envelope: Envelope<T> = serde_json::from_str(raw)?;
    if envelope.message_type != kind {
        return Err(ProtocolError::InvalidMessage(format!(
            "expected {kind}, got {}",
            envelope.message_type
        )));
    }
    Ok(TypedMessage {
        sender: envelope.sender.unwrap_or_default(),
        created_at: envelope.created_at.unwrap_or_default(),
        payload: wrap(envelope.data),
    })
}

/// Serialize a payload into an envelope stamped with the current time.
pub fn build_envelope(sender: &str, payload: &Payload) -> Frame {
    let kind = payload.message_type();
    let created_at = Utc::now().timestamp();
    let encoded = match payload {
        Payload::Ping
        | Payload::Pong
        | Payload::Joined
        | Payload::Left
        | Payload::LeaderUnreachable => encode(sender, kind, created_at, &Empty {}),
        Payload::SetLeader(data) | Payload::LeaderElected(data) => {
            encode(sender, kind, created_at, data)
        }
        Payload::Conclave(data) => encode(sender, kind, created_at, data),
        Payload::Inconclusive(data) => encode(sender, kind, created_at, data),
        Payload::Vote(data) => encode(sender, kind, created_at, data),
        Payload::Clipboard(data) => encode(sender, kind, created_at, data),
        Payload::Error(data) => encode(sender, kind, created_at, data),
    };
    Frame::from(encoded)
}

fn encode<T: Serialize>(sender: &str, kind: MessageType, created_at: i64, data: &T) -> String {
    let envelope = OutgoingEnvelope {
        data,
        sender,
        message_type: kind,
        created_at,
    };
    // Plain structs with string keys always serialize.
    serde_json::to_string(&envelope).unwrap_or_else(|_| {
        format!(r#"{{"data":{{}},"sender":"","messageType":"{kind}","createdAt":{created_at}}}"#)
    })
}

/// `joined` notice announcing `member`.
pub fn joined(member: &MemberId) -> Frame {
    build_envelope(member.as_str(), &Payload::Joined)
}

/// `left` notice announcing `member`.
pub fn left(member: &MemberId) -> Frame {
    build_envelope(member.as_str(), &Payload::Left)
}

/// Server-originated `error` frame carrying an error token.
pub fn error_frame(code: &str) -> Frame {
    build_envelope(
        "",
        &Payload::Error(ErrorData {
            error: code.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<Payload> {
        vec![
            Payload::Ping,
            Payload::Pong,
            Payload::Joined,
            Payload::Left,
            Payload::LeaderUnreachable,
            Payload::SetLeader(LeaderData {
                address: "10.0.0.2:7000".into(),
                generation: "g1".into(),
            }),
            Payload::LeaderElected(LeaderData {
                address: "10.0.0.3:7000".into(),
                generation: "g2".into(),
            }),
            Payload::Conclave(ConclaveData {
                addresses: vec!["10.0.0.2:7000".into(), "10.0.0.3:7000".into()],
                generation: "g3".into(),
            }),
            Payload::Inconclusive(InconclusiveData {
                generation: "g4".into(),
            }),
            Payload::Vote(VoteData {
                ballots: vec![
                    Ballot {
                        address: "10.0.0.2:7000".into(),
                        reachable: true,
                        latency_millis: 12,
                    },
                    Ballot {
                        address: "10.0.0.3:7000".into(),
                        reachable: false,
                        latency_millis: -1,
                    },
                ],
                generation: "g5".into(),
            }),
            Payload::Clipboard(ClipboardData {
                content: "hello from the laptop".into(),
            }),
            Payload::Error(ErrorData {
                error: LEADER_NOT_SET.into(),
            }),
        ]
    }

    #[test]
    fn every_type_has_a_sample() {
        let kinds: Vec<MessageType> = samples().iter().map(Payload::message_type).collect();
        assert_eq!(kinds, MessageType::ALL.to_vec());
    }

    #[test]
    fn built_envelopes_validate_to_the_same_payload() {
        for payload in samples() {
            let frame = build_envelope("member-a", &payload);
            let kind = message_type(&frame).unwrap();
            assert_eq!(kind, payload.message_type());
            let msg = validate(kind, &frame).unwrap();
            assert_eq!(msg.payload, payload, "frame: {frame}");
            assert_eq!(msg.sender, "member-a");
            assert!(msg.created_at > 0);
        }
    }

    #[test]
    fn message_type_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&MessageType::LeaderUnreachable).unwrap(),
            r#""leader-unreachable""#
        );
        for kind in MessageType::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn bare_ping_is_valid() {
        let msg = parse(r#"{"messageType":"ping"}"#).unwrap();
        assert_eq!(msg.payload, Payload::Ping);
        assert_eq!(msg.sender, "");
        assert_eq!(msg.created_at, 0);
    }

    #[test]
    fn unit_payload_accepts_null_and_empty_object() {
        assert!(parse(r#"{"messageType":"pong","data":null}"#).is_ok());
        assert!(parse(r#"{"messageType":"joined","data":{},"sender":"m1"}"#).is_ok());
    }

    #[test]
    fn unknown_type_is_invalid() {
        let err = message_type(r#"{"messageType":"shout","data":{}}"#).unwrap_err();
        assert_eq!(err.code(), INVALID_MESSAGE);
    }

    #[test]
    fn missing_type_is_invalid() {
        assert!(message_type(r#"{"data":{"content":"x"}}"#).is_err());
    }

    #[test]
    fn malformed_json_is_invalid() {
        assert!(message_type("not json").is_err());
        assert!(message_type("[1,2,3]").is_err());
        assert!(message_type("").is_err());
    }

    #[test]
    fn header_decode_ignores_payload() {
        let raw = r#"{"messageType":"set-leader","data":{"address":42}}"#;
        assert_eq!(message_type(raw).unwrap(), MessageType::SetLeader);
        assert!(validate(MessageType::SetLeader, raw).is_err());
    }

    #[test]
    fn missing_required_field_is_invalid() {
        let raw = r#"{"messageType":"set-leader","data":{"address":"10.0.0.2:7000"}}"#;
        assert!(parse(raw).is_err());

        let raw = r#"{"messageType":"clipboard"}"#;
        assert!(parse(raw).is_err());
    }

    #[test]
    fn mistyped_field_is_invalid() {
        let raw = r#"{"messageType":"vote","data":{"ballots":[{"address":"a","reachable":"yes","latency":3}],"generation":"g"}}"#;
        assert!(parse(raw).is_err());
    }

    #[test]
    fn validate_rejects_mismatched_tag() {
        let raw = r#"{"messageType":"ping","data":{}}"#;
        let err = validate(MessageType::Pong, raw).unwrap_err();
        assert!(err.to_string().contains("expected pong"), "got: {err}");
    }

    #[test]
    fn ballot_latency_accepts_both_names() {
        let wire = r#"{"messageType":"vote","data":{"ballots":[{"address":"a","reachable":true,"latency":7}],"generation":"g"}}"#;
        let alias = r#"{"messageType":"vote","data":{"ballots":[{"address":"a","reachable":true,"latencyMillis":7}],"generation":"g"}}"#;
        assert_eq!(parse(wire).unwrap(), parse(alias).unwrap());
    }

    #[test]
    fn error_frame_carries_code_and_blank_sender() {
        let frame = error_frame(LEADER_NOT_SET);
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["messageType"], "error");
        assert_eq!(value["sender"], "");
        assert_eq!(value["data"]["error"], LEADER_NOT_SET);
    }

    #[test]
    fn presence_notices_name_the_member() {
        let member = MemberId::from_raw("m7");
        let value: serde_json::Value = serde_json::from_str(&joined(&member)).unwrap();
        assert_eq!(value["messageType"], "joined");
        assert_eq!(value["sender"], "m7");
        assert_eq!(value["data"], serde_json::json!({}));

        let value: serde_json::Value = serde_json::from_str(&left(&member)).unwrap();
        assert_eq!(value["messageType"], "left");
    }
}
