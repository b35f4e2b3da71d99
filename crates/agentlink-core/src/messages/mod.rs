//! Agent-to-agent message types
//!
//! Every message carries a fully qualified `@type` of the form
//! `{prefix}/{family}/1.0/{name}`. The prefix identifies the protocol
//! profile: the legacy `did:sov` form or the didcomm.org form. Inbound JSON
//! is classified into an [`Envelope`] before the state machine sees it.

pub mod ack;
pub mod did_doc;
pub mod discovery;
pub mod invitation;
pub mod ping;
pub mod problem_report;
pub mod request;
pub mod response;
pub mod thread;

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, LinkResult};

pub use ack::{Ack, AckStatus};
pub use did_doc::DidDoc;
pub use discovery::{Disclose, ProtocolDescriptor, Query};
pub use invitation::Invitation;
pub use ping::{Ping, PingResponse};
pub use problem_report::{ProblemCode, ProblemReport};
pub use request::{ConnectionData, ConnectionRequest};
pub use response::{ConnectionSignature, Response, SignedResponse};
pub use thread::Thread;

pub const MSG_TYPE_PREFIX_V1: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec";
pub const MSG_TYPE_PREFIX_V2: &str = "https://didcomm.org";

pub const FAMILY_CONNECTIONS: &str = "connections";
pub const FAMILY_TRUST_PING: &str = "trust_ping";
pub const FAMILY_NOTIFICATION: &str = "notification";
pub const FAMILY_DISCOVERY: &str = "discover-features";
pub const FAMILY_SIGNATURE: &str = "signature";

/// Protocol profile spoken on a channel.
///
/// Both profiles use the same message shapes; they differ only in the
/// `@type` prefix. New connections default to [`ProtocolVersion::V2`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[serde(rename = "1.0")]
    V1,
    #[default]
    #[serde(rename = "2.0")]
    V2,
}

impl ProtocolVersion {
    pub fn prefix(self) -> &'static str {
        match self {
            ProtocolVersion::V1 => MSG_TYPE_PREFIX_V1,
            ProtocolVersion::V2 => MSG_TYPE_PREFIX_V2,
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolVersion::V1 => write!(f, "1.0"),
            ProtocolVersion::V2 => write!(f, "2.0"),
        }
    }
}

/// Family, family version, and message name parsed out of an `@type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageKind {
    pub family: String,
    pub version: String,
    pub name: String,
}

pub(crate) fn build_type(protocol: ProtocolVersion, family: &str, name: &str) -> String {
    format!("{}/{}/1.0/{}", protocol.prefix(), family, name)
}

/// Split a fully qualified `@type` into profile and kind.
pub fn parse_type(msg_type: &str) -> LinkResult<(ProtocolVersion, MessageKind)> {
    let (protocol, rest) = if let Some(rest) = msg_type.strip_prefix(MSG_TYPE_PREFIX_V2) {
        (ProtocolVersion::V2, rest)
    } else if let Some(rest) = msg_type.strip_prefix(MSG_TYPE_PREFIX_V1) {
        (ProtocolVersion::V1, rest)
    } else {
        return Err(LinkError::Serialization(format!(
            "unrecognized message type prefix: {}",
            msg_type
        )));
    };

    let mut parts = rest.trim_start_matches('/').split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(family), Some(version), Some(name), None)
            if !family.is_empty() && !version.is_empty() && !name.is_empty() =>
        {
            Ok((
                protocol,
                MessageKind {
                    family: family.to_string(),
                    version: version.to_string(),
                    name: name.to_string(),
                },
            ))
        }
        _ => Err(LinkError::Serialization(format!(
            "malformed message type: {}",
            msg_type
        ))),
    }
}

pub(crate) fn encode<T: Serialize>(message: &T) -> LinkResult<String> {
    serde_json::to_string(message)
        .map_err(|e| LinkError::Serialization(format!("message encode failed: {}", e)))
}

/// A classified inbound message.
///
/// Messages whose `@type` is syntactically valid but outside the families
/// this crate speaks come through as [`Envelope::Unknown`] so the state
/// machine can report exactly what it received.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Invitation(Invitation),
    Request(ConnectionRequest),
    SignedResponse(SignedResponse),
    Ping(Ping),
    PingResponse(PingResponse),
    Ack(Ack),
    ProblemReport(ProblemReport),
    Query(Query),
    Disclose(Disclose),
    Unknown { message_type: String },
}

fn from_value<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
    what: &str,
) -> LinkResult<T> {
    serde_json::from_value(value)
        .map_err(|e| LinkError::Serialization(format!("{} decode failed: {}", what, e)))
}

impl Envelope {
    pub fn parse(raw: &str) -> LinkResult<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| LinkError::Serialization(format!("message is not valid JSON: {}", e)))?;
        let msg_type = value
            .get("@type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| LinkError::Serialization("message has no @type".to_string()))?
            .to_string();

        let kind = match parse_type(&msg_type) {
            Ok((_, kind)) => kind,
            Err(_) => return Ok(Envelope::Unknown { message_type: msg_type }),
        };

        let envelope = match (kind.family.as_str(), kind.name.as_str()) {
            (FAMILY_CONNECTIONS, "invitation") => {
                Envelope::Invitation(from_value(value, "invitation")?)
            }
            (FAMILY_CONNECTIONS, "request") => Envelope::Request(from_value(value, "request")?),
            (FAMILY_CONNECTIONS, "response") => {
                Envelope::SignedResponse(from_value(value, "response")?)
            }
            (FAMILY_CONNECTIONS, "problem_report") => {
                Envelope::ProblemReport(from_value(value, "problem report")?)
            }
            (FAMILY_TRUST_PING, "ping") => Envelope::Ping(from_value(value, "ping")?),
            (FAMILY_TRUST_PING, "ping_response") => {
                Envelope::PingResponse(from_value(value, "ping response")?)
            }
            (FAMILY_NOTIFICATION, "ack") => Envelope::Ack(from_value(value, "ack")?),
            (FAMILY_DISCOVERY, "query") => Envelope::Query(from_value(value, "query")?),
            (FAMILY_DISCOVERY, "disclose") => Envelope::Disclose(from_value(value, "disclose")?),
            _ => Envelope::Unknown { message_type: msg_type },
        };
        Ok(envelope)
    }

    /// Short name used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Invitation(_) => "invitation",
            Envelope::Request(_) => "request",
            Envelope::SignedResponse(_) => "response",
            Envelope::Ping(_) => "ping",
            Envelope::PingResponse(_) => "ping_response",
            Envelope::Ack(_) => "ack",
            Envelope::ProblemReport(_) => "problem_report",
            Envelope::Query(_) => "query",
            Envelope::Disclose(_) => "disclose",
            Envelope::Unknown { .. } => "unknown",
        }
    }

    /// Like [`kind`](Self::kind), but spells out unrecognized types.
    pub fn describe(&self) -> String {
        match self {
            Envelope::Unknown { message_type } => message_type.clone(),
            other => other.kind().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_type_both_profiles() {
        let (protocol, kind) =
            parse_type("https://didcomm.org/connections/1.0/invitation").unwrap();
        assert_eq!(protocol, ProtocolVersion::V2);
        assert_eq!(kind.family, "connections");
        assert_eq!(kind.version, "1.0");
        assert_eq!(kind.name, "invitation");

        let (protocol, kind) =
            parse_type("did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/trust_ping/1.0/ping").unwrap();
        assert_eq!(protocol, ProtocolVersion::V1);
        assert_eq!(kind.family, "trust_ping");
        assert_eq!(kind.name, "ping");
    }

    #[test]
    fn test_parse_type_rejects_foreign_prefix() {
        assert!(parse_type("https://example.org/connections/1.0/request").is_err());
        assert!(parse_type("https://didcomm.org/connections/1.0").is_err());
    }

    #[test]
    fn test_build_then_parse() {
        let built = build_type(ProtocolVersion::V2, FAMILY_NOTIFICATION, "ack");
        let (protocol, kind) = parse_type(&built).unwrap();
        assert_eq!(protocol, ProtocolVersion::V2);
        assert_eq!(kind.family, FAMILY_NOTIFICATION);
        assert_eq!(kind.name, "ack");
    }

    #[test]
    fn test_envelope_dispatch() {
        let ping = Ping::new(ProtocolVersion::V2, None);
        let raw = encode(&ping).unwrap();
        let envelope = Envelope::parse(&raw).unwrap();
        assert_eq!(envelope, Envelope::Ping(ping));
        assert_eq!(envelope.kind(), "ping");
    }

    #[test]
    fn test_envelope_unknown_family() {
        let raw = r#"{"@type":"https://didcomm.org/basicmessage/1.0/message","@id":"m1"}"#;
        let envelope = Envelope::parse(raw).unwrap();
        assert_eq!(envelope.kind(), "unknown");
        assert_eq!(
            envelope.describe(),
            "https://didcomm.org/basicmessage/1.0/message"
        );
    }

    #[test]
    fn test_envelope_unknown_prefix() {
        let raw = r#"{"@type":"https://example.org/connections/1.0/request","@id":"m1"}"#;
        assert_eq!(Envelope::parse(raw).unwrap().kind(), "unknown");
    }

    #[test]
    fn test_envelope_rejects_bad_json() {
        assert!(matches!(
            Envelope::parse("{not json"),
            Err(LinkError::Serialization(_))
        ));
        assert!(matches!(
            Envelope::parse(r#"{"@id":"m1"}"#),
            Err(LinkError::Serialization(_))
        ));
    }

    #[test]
    fn test_known_type_with_bad_body_is_an_error() {
        // Right @type, missing required fields
        let raw = r#"{"@type":"https://didcomm.org/connections/1.0/request","@id":"m1"}"#;
        assert!(matches!(
            Envelope::parse(raw),
            Err(LinkError::Serialization(_))
        ));
    }

    #[test]
    fn test_protocol_version_serde() {
        assert_eq!(serde_json::to_string(&ProtocolVersion::V1).unwrap(), "\"1.0\"");
        assert_eq!(serde_json::to_string(&ProtocolVersion::V2).unwrap(), "\"2.0\"");
        let v: ProtocolVersion = serde_json::from_str("\"1.0\"").unwrap();
        assert_eq!(v, ProtocolVersion::V1);
    }
}
